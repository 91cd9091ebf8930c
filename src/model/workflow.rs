//! Workflow: an ordered sequence of parameterizable requests.
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use time::OffsetDateTime;

use super::WorkflowStatus;
use crate::error::Error;

/// One step of a workflow. Steps are embedded in the workflow record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// 1-based position. Order values are unique and cover `1..=N`.
    pub order: i32,
    /// The watcher whose request template this step executes.
    pub watcher_id: i64,
    /// Keep executing subsequent steps when this one fails.
    #[serde(default)]
    pub continue_on_error: bool,
    /// Names of workflow variables to extract from the response.
    #[serde(default)]
    pub extract_variables: Vec<String>,
}

/// An ordered sequence of requests sharing a variable context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub steps: Vec<WorkflowStep>,
    pub is_active: bool,
    pub schedule_enabled: bool,
    /// Seconds between scheduled executions.
    pub schedule_interval: Option<i64>,
    pub execution_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub last_executed_at: Option<OffsetDateTime>,
    pub last_execution_status: Option<WorkflowStatus>,
    pub last_execution_error: Option<String>,
    pub created_at: OffsetDateTime,
}

impl Workflow {
    /// The scheduler should dispatch this workflow now.
    pub fn is_due(&self, now: OffsetDateTime) -> bool {
        if !self.is_active || !self.schedule_enabled {
            return false;
        }

        let interval = match self.schedule_interval {
            Some(interval) => interval,
            None => return false,
        };

        match self.last_executed_at {
            None => true,
            Some(last) => (now - last).whole_seconds() >= interval,
        }
    }

    /// Steps sorted by ascending `order`.
    pub fn sorted_steps(&self) -> Vec<WorkflowStep> {
        let mut steps = self.steps.clone();
        steps.sort_by_key(|step| step.order);
        steps
    }
}

/// Payload for creating a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorkflow {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<WorkflowStep>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub schedule_enabled: bool,
    #[serde(default)]
    pub schedule_interval: Option<i64>,
}

fn default_true() -> bool {
    true
}

impl NewWorkflow {
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("workflow name is empty".into()));
        }

        validate_steps(&self.steps)?;

        if self.schedule_enabled {
            match self.schedule_interval {
                Some(interval) if interval > 0 => (),
                _ => {
                    return Err(Error::Validation(
                        "scheduled workflows require a positive schedule_interval".into(),
                    ))
                }
            }
        }

        Ok(())
    }
}

/// Step order values must be unique and cover `1..=N`.
pub fn validate_steps(steps: &[WorkflowStep]) -> Result<(), Error> {
    let orders = steps.iter().map(|step| step.order).collect::<HashSet<_>>();

    if orders.len() != steps.len() {
        return Err(Error::Validation("duplicate step order".into()));
    }

    for order in 1..=steps.len() as i32 {
        if !orders.contains(&order) {
            return Err(Error::Validation(format!(
                "step orders must cover 1..={}, missing {}",
                steps.len(),
                order
            )));
        }
    }

    Ok(())
}

/// Partial update of a workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowUpdate {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub steps: Option<Vec<WorkflowStep>>,
    pub is_active: Option<bool>,
    pub schedule_enabled: Option<bool>,
    pub schedule_interval: Option<Option<i64>>,
}

#[cfg(test)]
mod test {
    use super::*;

    fn step(order: i32) -> WorkflowStep {
        WorkflowStep {
            order,
            watcher_id: 1,
            continue_on_error: false,
            extract_variables: vec![],
        }
    }

    #[test]
    fn test_step_orders() {
        assert!(validate_steps(&[step(1), step(2), step(3)]).is_ok());
        assert!(validate_steps(&[]).is_ok());
        assert!(validate_steps(&[step(1), step(1)]).is_err());
        assert!(validate_steps(&[step(2), step(3)]).is_err());
    }

    #[test]
    fn test_sorted_steps() {
        let workflow = Workflow {
            id: 1,
            name: "login".into(),
            description: None,
            steps: vec![step(3), step(1), step(2)],
            is_active: true,
            schedule_enabled: false,
            schedule_interval: None,
            execution_count: 0,
            success_count: 0,
            failure_count: 0,
            last_executed_at: None,
            last_execution_status: None,
            last_execution_error: None,
            created_at: OffsetDateTime::now_utc(),
        };

        let orders = workflow
            .sorted_steps()
            .iter()
            .map(|step| step.order)
            .collect::<Vec<_>>();
        assert_eq!(orders, vec![1, 2, 3]);
    }
}
