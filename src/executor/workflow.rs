//! Workflow executor: ordered steps sharing a variable context.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::Error;
use crate::http::{HttpClient, RequestTemplate};
use crate::model::{
    StepResult, StepStatus, Variable, Workflow, WorkflowExecution, WorkflowStatus, WorkflowStep,
};
use crate::storage::{seed_context, Storage};
use crate::vars::{extract, substitute_template, Context};

/// Executes workflows step by step. Chained requests are not watched:
/// no change detection happens here.
pub struct WorkflowExecutor {
    storage: Arc<dyn Storage>,
    client: HttpClient,
}

impl WorkflowExecutor {
    pub fn new(storage: Arc<dyn Storage>, client: HttpClient) -> Self {
        Self { storage, client }
    }

    /// Execute by id, for manual runs.
    pub async fn execute_by_id(
        &self,
        id: i64,
        overrides: Option<Context>,
    ) -> Result<WorkflowExecution, Error> {
        let workflow = self.storage.workflow(id).await?;
        self.execute(&workflow, overrides).await
    }

    /// Execute a workflow to completion.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        overrides: Option<Context>,
    ) -> Result<WorkflowExecution, Error> {
        self.execute_controlled(workflow, overrides, None, None).await
    }

    /// Execute with scheduler controls: a shutdown signal checked between
    /// steps and a wall-clock deadline. Either tripping finalizes the
    /// execution as failed instead of leaving it `running`.
    pub async fn execute_controlled(
        &self,
        workflow: &Workflow,
        overrides: Option<Context>,
        mut cancel: Option<watch::Receiver<bool>>,
        deadline: Option<Instant>,
    ) -> Result<WorkflowExecution, Error> {
        if !workflow.is_active {
            return Err(Error::Validation(format!(
                "workflow \"{}\" is not active",
                workflow.name
            )));
        }

        info!("executing workflow {} ({})", workflow.id, workflow.name);

        let variables = self.storage.variables(workflow.id).await?;
        let mut context = seed_context(overrides.as_ref(), &variables);

        let steps = workflow.sorted_steps();
        let start = Instant::now();

        let execution = WorkflowExecution {
            id: 0,
            workflow_id: workflow.id,
            status: WorkflowStatus::Running,
            started_at: OffsetDateTime::now_utc(),
            completed_at: None,
            duration_seconds: None,
            steps_total: steps.len() as i32,
            steps_completed: 0,
            step_results: vec![],
            variables_extracted: context.clone(),
            error_message: None,
            error_step: None,
        };
        let mut execution = self.storage.insert_execution(&execution).await?;

        let mut failed_steps = 0usize;

        for step in &steps {
            if let Some(ref mut cancel) = cancel {
                if *cancel.borrow_and_update() {
                    execution.status = WorkflowStatus::Failed;
                    execution.error_message = Some("cancelled".into());
                    execution.error_step = Some(step.order);
                    break;
                }
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    execution.status = WorkflowStatus::Failed;
                    execution.error_message = Some("run timed out".into());
                    execution.error_step = Some(step.order);
                    break;
                }
            }

            let (step_result, variable_values) =
                self.execute_step(step, &variables, &mut context).await?;

            execution.step_results.push(step_result.clone());
            execution.steps_completed += 1;
            self.storage
                .commit_step(
                    execution.id,
                    &step_result,
                    execution.steps_completed,
                    &variable_values,
                )
                .await?;

            if step_result.status == StepStatus::Failed {
                failed_steps += 1;

                if !step.continue_on_error {
                    execution.status = WorkflowStatus::Failed;
                    execution.error_message = step_result
                        .error
                        .clone()
                        .or_else(|| Some("step failed".into()));
                    execution.error_step = Some(step.order);
                    break;
                }
            }
        }

        if execution.status == WorkflowStatus::Running {
            execution.status = if failed_steps == 0 {
                WorkflowStatus::Success
            } else if failed_steps < steps.len() {
                WorkflowStatus::Partial
            } else {
                WorkflowStatus::Failed
            };
        }

        execution.completed_at = Some(OffsetDateTime::now_utc());
        execution.duration_seconds = Some(start.elapsed().as_secs_f64());
        execution.variables_extracted = context;

        self.storage.complete_execution(&execution).await?;

        info!(
            "workflow {} finished: {} ({}/{} steps)",
            workflow.name, execution.status, execution.steps_completed, execution.steps_total
        );

        Ok(execution)
    }

    /// Execute one step: substitute, request, extract. Only storage
    /// failures propagate; everything else lands in the step result.
    async fn execute_step(
        &self,
        step: &WorkflowStep,
        variables: &[Variable],
        context: &mut Context,
    ) -> Result<(StepResult, Vec<(i64, String, OffsetDateTime)>), Error> {
        let step_start = Instant::now();

        let mut result = StepResult {
            order: step.order,
            watcher_id: step.watcher_id,
            status: StepStatus::Failed,
            response_status: None,
            variables_extracted: HashMap::new(),
            error: None,
            duration_ms: 0,
        };
        let mut variable_values = vec![];

        let watcher = match self.storage.watcher(step.watcher_id).await {
            Ok(watcher) => watcher,
            Err(Error::NotFound { .. }) => {
                result.error = Some(format!("watcher {} not found", step.watcher_id));
                result.duration_ms = step_start.elapsed().as_millis() as u64;
                return Ok((result, variable_values));
            }
            Err(err) => return Err(err),
        };

        let template = substitute_template(&RequestTemplate::from(&watcher), context);

        match self.client.execute(&template, &[]).await {
            Ok(response) => {
                result.response_status = Some(response.status);

                if response.status < 400 {
                    result.status = StepStatus::Success;
                } else {
                    result.error = Some(format!("HTTP {}", response.status));
                }

                let now = OffsetDateTime::now_utc();

                for name in &step.extract_variables {
                    let variable = variables.iter().find(|variable| variable.name == *name);

                    let variable = match variable {
                        Some(variable) => variable,
                        None => {
                            warn!("workflow has no variable \"{}\"", name);
                            continue;
                        }
                    };

                    let value = extract(
                        variable,
                        response.body_text(),
                        Some(&response.headers),
                        Some(&response.cookies),
                    );

                    match value {
                        Some(value) => {
                            context.insert(name.clone(), value.clone());
                            result
                                .variables_extracted
                                .insert(name.clone(), value.clone());
                            variable_values.push((variable.id, value, now));
                        }
                        // Extraction misses don't fail the step.
                        None => warn!("failed to extract variable \"{}\"", name),
                    }
                }
            }
            Err(err) => {
                result.error = Some(err.to_string());
            }
        }

        result.duration_ms = step_start.elapsed().as_millis() as u64;
        Ok((result, variable_values))
    }
}
