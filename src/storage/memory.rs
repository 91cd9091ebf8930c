//! In-memory storage backend.
//!
//! All tables live behind one lock, so every contract method, including
//! the multi-write commits, is atomic. Used when no database is
//! configured, and by the test suite. Nothing survives a restart.
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use time::{Duration, OffsetDateTime};

use super::{
    aggregate_statistics, apply_watcher_update, apply_workflow_update, matches_filter,
    validate_updated_watcher, ChangeLogEntry, ChangeLogFilter, ChangeLogStatistics, OrderBy,
    OrderDirection, StatRow, StatisticsParams, Storage,
};
use crate::change::Detection;
use crate::error::Error;
use crate::http::SetCookie;
use crate::model::{
    workflow::validate_steps, ChangeLog, ChangeType, Cookie, NewVariable, NewWatcher, NewWorkflow,
    Snapshot, StepResult, Variable, Watcher, WatcherStatus, WatcherUpdate, Workflow,
    WorkflowExecution, WorkflowStatus, WorkflowUpdate,
};

#[derive(Default)]
struct Inner {
    watchers: BTreeMap<i64, Watcher>,
    /// Keyed by watcher id: at most one snapshot per watcher.
    snapshots: BTreeMap<i64, Snapshot>,
    change_logs: BTreeMap<i64, ChangeLog>,
    cookies: BTreeMap<i64, Cookie>,
    workflows: BTreeMap<i64, Workflow>,
    variables: BTreeMap<i64, Variable>,
    executions: BTreeMap<i64, WorkflowExecution>,
    sequence: i64,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.sequence += 1;
        self.sequence
    }
}

/// Storage backend holding everything in process memory.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn create_watcher(&self, watcher: &NewWatcher) -> Result<Watcher, Error> {
        watcher.validate()?;

        let mut inner = self.inner.lock();

        if inner.watchers.values().any(|w| w.name == watcher.name) {
            return Err(Error::Conflict(format!(
                "watcher \"{}\" already exists",
                watcher.name
            )));
        }

        if let Some(cookie_watcher_id) = watcher.cookie_watcher_id {
            if !inner.watchers.contains_key(&cookie_watcher_id) {
                return Err(Error::not_found("watcher", cookie_watcher_id));
            }
        }

        let id = inner.next_id();
        let row = Watcher {
            id,
            name: watcher.name.clone(),
            url: watcher.url.clone(),
            method: watcher.method,
            headers: watcher.headers.clone(),
            body: watcher.body.clone(),
            execution_mode: watcher.execution_mode,
            watch_interval: watcher.watch_interval,
            is_active: watcher.is_active,
            save_cookies: watcher.save_cookies,
            use_cookies: watcher.use_cookies,
            cookie_watcher_id: watcher.cookie_watcher_id,
            comparison_mode: watcher.comparison_mode,
            status: WatcherStatus::Pending,
            error_message: None,
            check_count: 0,
            change_count: 0,
            last_checked_at: None,
            last_changed_at: None,
            created_at: OffsetDateTime::now_utc(),
        };

        inner.watchers.insert(id, row.clone());
        Ok(row)
    }

    async fn watcher(&self, id: i64) -> Result<Watcher, Error> {
        self.inner
            .lock()
            .watchers
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("watcher", id))
    }

    async fn watcher_by_name(&self, name: &str) -> Result<Option<Watcher>, Error> {
        Ok(self
            .inner
            .lock()
            .watchers
            .values()
            .find(|watcher| watcher.name == name)
            .cloned())
    }

    async fn watchers(&self) -> Result<Vec<Watcher>, Error> {
        Ok(self.inner.lock().watchers.values().cloned().collect())
    }

    async fn scheduled_watchers(&self) -> Result<Vec<Watcher>, Error> {
        Ok(self
            .inner
            .lock()
            .watchers
            .values()
            .filter(|watcher| {
                watcher.is_active
                    && watcher.execution_mode.schedulable()
                    && watcher.watch_interval.is_some()
            })
            .cloned()
            .collect())
    }

    async fn update_watcher(&self, id: i64, update: &WatcherUpdate) -> Result<Watcher, Error> {
        let mut inner = self.inner.lock();

        let mut watcher = inner
            .watchers
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("watcher", id))?;

        if let Some(ref name) = update.name {
            if inner
                .watchers
                .values()
                .any(|other| other.id != id && other.name == *name)
            {
                return Err(Error::Conflict(format!(
                    "watcher \"{}\" already exists",
                    name
                )));
            }
        }

        if let Some(Some(cookie_watcher_id)) = update.cookie_watcher_id {
            if cookie_watcher_id == id {
                return Err(Error::Conflict(
                    "watcher cannot use its own cookies".into(),
                ));
            }
            if !inner.watchers.contains_key(&cookie_watcher_id) {
                return Err(Error::not_found("watcher", cookie_watcher_id));
            }
        }

        apply_watcher_update(&mut watcher, update);
        validate_updated_watcher(&watcher)?;

        inner.watchers.insert(id, watcher.clone());
        Ok(watcher)
    }

    async fn delete_watcher(&self, id: i64) -> Result<(), Error> {
        let mut inner = self.inner.lock();

        if inner.watchers.remove(&id).is_none() {
            return Err(Error::not_found("watcher", id));
        }

        inner.snapshots.remove(&id);
        inner.change_logs.retain(|_, log| log.watcher_id != id);
        inner.cookies.retain(|_, cookie| cookie.watcher_id != id);

        // Cookie chains pointing at the deleted watcher are severed.
        for watcher in inner.watchers.values_mut() {
            if watcher.cookie_watcher_id == Some(id) {
                watcher.cookie_watcher_id = None;
            }
        }

        Ok(())
    }

    async fn mark_watcher_running(&self, id: i64) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        let watcher = inner
            .watchers
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("watcher", id))?;
        watcher.status = WatcherStatus::Running;
        Ok(())
    }

    async fn snapshot(&self, watcher_id: i64) -> Result<Option<Snapshot>, Error> {
        Ok(self.inner.lock().snapshots.get(&watcher_id).cloned())
    }

    async fn commit_check(
        &self,
        watcher_id: i64,
        detection: &Detection,
        body: &[u8],
        content_type: Option<&str>,
    ) -> Result<ChangeLog, Error> {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.inner.lock();

        if !inner.watchers.contains_key(&watcher_id) {
            return Err(Error::not_found("watcher", watcher_id));
        }

        let id = inner.next_id();
        let log = ChangeLog {
            id,
            watcher_id,
            change_type: detection.change_type,
            old_hash: detection.old_hash.clone(),
            new_hash: Some(detection.new_hash.clone()),
            old_size: detection.old_size,
            new_size: Some(detection.new_size),
            old_content: detection.old_content.clone(),
            new_content: Some(body.to_vec()),
            diff: detection.diff.clone(),
            error_message: None,
            detected_at: now,
        };
        inner.change_logs.insert(id, log.clone());

        if detection.write_snapshot {
            match inner.snapshots.get_mut(&watcher_id) {
                Some(snapshot) => {
                    snapshot.content = body.to_vec();
                    snapshot.content_hash = detection.new_hash.clone();
                    snapshot.content_size = detection.new_size;
                    snapshot.content_type = content_type.map(|t| t.to_string());
                    snapshot.updated_at = now;
                }
                None => {
                    let snapshot_id = inner.next_id();
                    inner.snapshots.insert(
                        watcher_id,
                        Snapshot {
                            id: snapshot_id,
                            watcher_id,
                            content: body.to_vec(),
                            content_hash: detection.new_hash.clone(),
                            content_size: detection.new_size,
                            content_type: content_type.map(|t| t.to_string()),
                            created_at: now,
                            updated_at: now,
                        },
                    );
                }
            }
        } else if let Some(snapshot) = inner.snapshots.get_mut(&watcher_id) {
            // Unchanged observation: record that the content was confirmed.
            snapshot.updated_at = now;
        }

        let watcher = inner
            .watchers
            .get_mut(&watcher_id)
            .ok_or_else(|| Error::not_found("watcher", watcher_id))?;
        watcher.check_count += 1;
        watcher.last_checked_at = Some(now);
        watcher.status = WatcherStatus::Success;
        watcher.error_message = None;
        if matches!(
            detection.change_type,
            ChangeType::New | ChangeType::Modified
        ) {
            watcher.change_count += 1;
            watcher.last_changed_at = Some(now);
        }

        Ok(log)
    }

    async fn commit_error(
        &self,
        watcher_id: i64,
        message: &str,
        body: Option<&[u8]>,
    ) -> Result<ChangeLog, Error> {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.inner.lock();

        if !inner.watchers.contains_key(&watcher_id) {
            return Err(Error::not_found("watcher", watcher_id));
        }

        let id = inner.next_id();
        let log = ChangeLog {
            id,
            watcher_id,
            change_type: ChangeType::Error,
            old_hash: None,
            new_hash: None,
            old_size: None,
            new_size: body.map(|body| body.len() as i64),
            old_content: None,
            new_content: body.map(|body| body.to_vec()),
            diff: None,
            error_message: Some(message.to_string()),
            detected_at: now,
        };
        inner.change_logs.insert(id, log.clone());

        let watcher = inner
            .watchers
            .get_mut(&watcher_id)
            .ok_or_else(|| Error::not_found("watcher", watcher_id))?;
        watcher.check_count += 1;
        watcher.last_checked_at = Some(now);
        watcher.status = WatcherStatus::Error;
        watcher.error_message = Some(message.to_string());

        Ok(log)
    }

    async fn replace_cookies(&self, watcher_id: i64, cookies: &[SetCookie]) -> Result<(), Error> {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.inner.lock();

        if !inner.watchers.contains_key(&watcher_id) {
            return Err(Error::not_found("watcher", watcher_id));
        }

        inner
            .cookies
            .retain(|_, cookie| cookie.watcher_id != watcher_id);

        for cookie in cookies {
            let id = inner.next_id();
            inner.cookies.insert(
                id,
                Cookie {
                    id,
                    watcher_id,
                    name: cookie.name.clone(),
                    value: cookie.value.clone(),
                    domain: cookie.domain.clone(),
                    path: cookie.path.clone(),
                    expires: cookie.expires,
                    secure: cookie.secure,
                    http_only: cookie.http_only,
                    created_at: now,
                },
            );
        }

        Ok(())
    }

    async fn cookies(&self, watcher_id: i64) -> Result<Vec<Cookie>, Error> {
        Ok(self
            .inner
            .lock()
            .cookies
            .values()
            .filter(|cookie| cookie.watcher_id == watcher_id)
            .cloned()
            .collect())
    }

    async fn expired_cookies(&self) -> Result<Vec<Cookie>, Error> {
        let now = OffsetDateTime::now_utc();
        Ok(self
            .inner
            .lock()
            .cookies
            .values()
            .filter(|cookie| cookie.is_expired(now))
            .cloned()
            .collect())
    }

    async fn cookies_expiring_within(&self, hours: i64) -> Result<Vec<Cookie>, Error> {
        let now = OffsetDateTime::now_utc();
        let threshold = now + Duration::hours(hours);

        let mut expiring = self
            .inner
            .lock()
            .cookies
            .values()
            .filter(|cookie| match cookie.expires {
                Some(expires) => expires > now && expires <= threshold,
                None => false,
            })
            .cloned()
            .collect::<Vec<_>>();

        expiring.sort_by_key(|cookie| cookie.expires);
        Ok(expiring)
    }

    async fn delete_expired_cookies(&self) -> Result<u64, Error> {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.inner.lock();

        let before = inner.cookies.len();
        inner.cookies.retain(|_, cookie| !cookie.is_expired(now));

        Ok((before - inner.cookies.len()) as u64)
    }

    async fn change_log(&self, id: i64) -> Result<ChangeLog, Error> {
        self.inner
            .lock()
            .change_logs
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("change log", id))
    }

    async fn change_logs(&self, filter: &ChangeLogFilter) -> Result<Vec<ChangeLogEntry>, Error> {
        let inner = self.inner.lock();

        let mut logs = inner
            .change_logs
            .values()
            .filter(|log| matches_filter(log, filter))
            .cloned()
            .collect::<Vec<_>>();

        logs.sort_by(|a, b| {
            let ordering = match filter.order_by {
                OrderBy::DetectedAt => a.detected_at.cmp(&b.detected_at),
                OrderBy::NewSize => a.new_size.unwrap_or(0).cmp(&b.new_size.unwrap_or(0)),
                OrderBy::ChangeType => a.change_type.to_string().cmp(&b.change_type.to_string()),
            };
            match filter.direction {
                OrderDirection::Asc => ordering,
                OrderDirection::Desc => ordering.reverse(),
            }
        });

        let offset = filter.offset.unwrap_or(0).max(0) as usize;
        let limit = filter.limit.unwrap_or(100).max(0) as usize;

        Ok(logs
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|log| ChangeLogEntry {
                id: log.id,
                watcher_id: log.watcher_id,
                change_type: log.change_type,
                old_hash: log.old_hash,
                new_hash: log.new_hash,
                old_size: log.old_size,
                new_size: log.new_size,
                detected_at: log.detected_at,
            })
            .collect())
    }

    async fn change_log_statistics(
        &self,
        params: &StatisticsParams,
    ) -> Result<ChangeLogStatistics, Error> {
        let inner = self.inner.lock();

        let rows = inner
            .change_logs
            .values()
            .filter(|log| {
                params
                    .watcher_id
                    .map(|id| log.watcher_id == id)
                    .unwrap_or(true)
                    && params.date_from.map(|from| log.detected_at >= from).unwrap_or(true)
                    && params.date_to.map(|to| log.detected_at <= to).unwrap_or(true)
            })
            .map(|log| StatRow {
                watcher_id: log.watcher_id,
                change_type: log.change_type,
                new_size: log.new_size,
                detected_at: log.detected_at,
            })
            .collect::<Vec<_>>();

        Ok(aggregate_statistics(&rows, params.group_by))
    }

    async fn compare_change_logs(&self, ids: &[i64]) -> Result<Vec<ChangeLog>, Error> {
        if !(2..=5).contains(&ids.len()) {
            return Err(Error::Validation(
                "comparison requires between 2 and 5 change logs".into(),
            ));
        }

        let inner = self.inner.lock();
        let mut logs = Vec::with_capacity(ids.len());

        for id in ids {
            let log = inner
                .change_logs
                .get(id)
                .cloned()
                .ok_or_else(|| Error::not_found("change log", *id))?;
            logs.push(log);
        }

        logs.sort_by_key(|log| log.detected_at);
        Ok(logs)
    }

    async fn create_workflow(&self, workflow: &NewWorkflow) -> Result<Workflow, Error> {
        workflow.validate()?;

        let mut inner = self.inner.lock();

        if inner.workflows.values().any(|w| w.name == workflow.name) {
            return Err(Error::Conflict(format!(
                "workflow \"{}\" already exists",
                workflow.name
            )));
        }

        for step in &workflow.steps {
            if !inner.watchers.contains_key(&step.watcher_id) {
                return Err(Error::not_found("watcher", step.watcher_id));
            }
        }

        let id = inner.next_id();
        let row = Workflow {
            id,
            name: workflow.name.clone(),
            description: workflow.description.clone(),
            steps: workflow.steps.clone(),
            is_active: workflow.is_active,
            schedule_enabled: workflow.schedule_enabled,
            schedule_interval: workflow.schedule_interval,
            execution_count: 0,
            success_count: 0,
            failure_count: 0,
            last_executed_at: None,
            last_execution_status: None,
            last_execution_error: None,
            created_at: OffsetDateTime::now_utc(),
        };

        inner.workflows.insert(id, row.clone());
        Ok(row)
    }

    async fn workflow(&self, id: i64) -> Result<Workflow, Error> {
        self.inner
            .lock()
            .workflows
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("workflow", id))
    }

    async fn workflow_by_name(&self, name: &str) -> Result<Option<Workflow>, Error> {
        Ok(self
            .inner
            .lock()
            .workflows
            .values()
            .find(|workflow| workflow.name == name)
            .cloned())
    }

    async fn workflows(&self) -> Result<Vec<Workflow>, Error> {
        Ok(self.inner.lock().workflows.values().cloned().collect())
    }

    async fn scheduled_workflows(&self) -> Result<Vec<Workflow>, Error> {
        Ok(self
            .inner
            .lock()
            .workflows
            .values()
            .filter(|workflow| {
                workflow.is_active
                    && workflow.schedule_enabled
                    && workflow.schedule_interval.is_some()
            })
            .cloned()
            .collect())
    }

    async fn update_workflow(&self, id: i64, update: &WorkflowUpdate) -> Result<Workflow, Error> {
        let mut inner = self.inner.lock();

        let mut workflow = inner
            .workflows
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("workflow", id))?;

        if let Some(ref name) = update.name {
            if inner
                .workflows
                .values()
                .any(|other| other.id != id && other.name == *name)
            {
                return Err(Error::Conflict(format!(
                    "workflow \"{}\" already exists",
                    name
                )));
            }
        }

        if let Some(ref steps) = update.steps {
            validate_steps(steps)?;
            for step in steps {
                if !inner.watchers.contains_key(&step.watcher_id) {
                    return Err(Error::not_found("watcher", step.watcher_id));
                }
            }
        }

        apply_workflow_update(&mut workflow, update);

        if workflow.schedule_enabled && workflow.schedule_interval.unwrap_or(0) <= 0 {
            return Err(Error::Validation(
                "scheduled workflows require a positive schedule_interval".into(),
            ));
        }

        inner.workflows.insert(id, workflow.clone());
        Ok(workflow)
    }

    async fn delete_workflow(&self, id: i64) -> Result<(), Error> {
        let mut inner = self.inner.lock();

        if inner.workflows.remove(&id).is_none() {
            return Err(Error::not_found("workflow", id));
        }

        inner
            .variables
            .retain(|_, variable| variable.workflow_id != id);
        inner
            .executions
            .retain(|_, execution| execution.workflow_id != id);

        Ok(())
    }

    async fn create_variable(&self, variable: &NewVariable) -> Result<Variable, Error> {
        variable.validate()?;

        let mut inner = self.inner.lock();

        if !inner.workflows.contains_key(&variable.workflow_id) {
            return Err(Error::not_found("workflow", variable.workflow_id));
        }

        if inner.variables.values().any(|other| {
            other.workflow_id == variable.workflow_id && other.name == variable.name
        }) {
            return Err(Error::Conflict(format!(
                "variable \"{}\" already exists in this workflow",
                variable.name
            )));
        }

        let id = inner.next_id();
        let row = Variable {
            id,
            workflow_id: variable.workflow_id,
            name: variable.name.clone(),
            source: variable.source,
            extract_method: variable.extract_method,
            extract_pattern: variable.extract_pattern.clone(),
            random_length: variable.random_length,
            random_format: variable.random_format.clone(),
            static_value: variable.static_value.clone(),
            current_value: variable.static_value.clone(),
            last_extracted_at: None,
            created_at: OffsetDateTime::now_utc(),
        };

        inner.variables.insert(id, row.clone());
        Ok(row)
    }

    async fn variables(&self, workflow_id: i64) -> Result<Vec<Variable>, Error> {
        Ok(self
            .inner
            .lock()
            .variables
            .values()
            .filter(|variable| variable.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn update_variable(&self, id: i64, update: &NewVariable) -> Result<Variable, Error> {
        update.validate()?;

        let mut inner = self.inner.lock();

        let mut variable = inner
            .variables
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("variable", id))?;

        if inner.variables.values().any(|other| {
            other.id != id
                && other.workflow_id == variable.workflow_id
                && other.name == update.name
        }) {
            return Err(Error::Conflict(format!(
                "variable \"{}\" already exists in this workflow",
                update.name
            )));
        }

        variable.name = update.name.clone();
        variable.source = update.source;
        variable.extract_method = update.extract_method;
        variable.extract_pattern = update.extract_pattern.clone();
        variable.random_length = update.random_length;
        variable.random_format = update.random_format.clone();
        variable.static_value = update.static_value.clone();

        inner.variables.insert(id, variable.clone());
        Ok(variable)
    }

    async fn delete_variable(&self, id: i64) -> Result<(), Error> {
        let mut inner = self.inner.lock();

        if inner.variables.remove(&id).is_none() {
            return Err(Error::not_found("variable", id));
        }

        Ok(())
    }

    async fn insert_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> Result<WorkflowExecution, Error> {
        let mut inner = self.inner.lock();

        if !inner.workflows.contains_key(&execution.workflow_id) {
            return Err(Error::not_found("workflow", execution.workflow_id));
        }

        let id = inner.next_id();
        let mut execution = execution.clone();
        execution.id = id;

        inner.executions.insert(id, execution.clone());
        Ok(execution)
    }

    async fn running_execution_exists(&self, workflow_id: i64) -> Result<bool, Error> {
        Ok(self.inner.lock().executions.values().any(|execution| {
            execution.workflow_id == workflow_id && execution.status == WorkflowStatus::Running
        }))
    }

    async fn commit_step(
        &self,
        execution_id: i64,
        step: &StepResult,
        steps_completed: i32,
        variable_values: &[(i64, String, OffsetDateTime)],
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock();

        let execution = inner
            .executions
            .get_mut(&execution_id)
            .ok_or_else(|| Error::not_found("execution", execution_id))?;
        execution.step_results.push(step.clone());
        execution.steps_completed = steps_completed;

        for (variable_id, value, at) in variable_values {
            if let Some(variable) = inner.variables.get_mut(variable_id) {
                variable.current_value = Some(value.clone());
                variable.last_extracted_at = Some(*at);
            }
        }

        Ok(())
    }

    async fn complete_execution(&self, execution: &WorkflowExecution) -> Result<(), Error> {
        let mut inner = self.inner.lock();

        if !inner.executions.contains_key(&execution.id) {
            return Err(Error::not_found("execution", execution.id));
        }
        inner.executions.insert(execution.id, execution.clone());

        let workflow = inner
            .workflows
            .get_mut(&execution.workflow_id)
            .ok_or_else(|| Error::not_found("workflow", execution.workflow_id))?;

        workflow.execution_count += 1;
        workflow.last_executed_at = Some(execution.completed_at.unwrap_or(execution.started_at));
        workflow.last_execution_status = Some(execution.status);
        if execution.status == WorkflowStatus::Success {
            workflow.success_count += 1;
            workflow.last_execution_error = None;
        } else {
            workflow.failure_count += 1;
            workflow.last_execution_error = execution.error_message.clone();
        }

        Ok(())
    }

    async fn execution(&self, id: i64) -> Result<WorkflowExecution, Error> {
        self.inner
            .lock()
            .executions
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("execution", id))
    }

    async fn executions(&self, workflow_id: i64) -> Result<Vec<WorkflowExecution>, Error> {
        let mut executions = self
            .inner
            .lock()
            .executions
            .values()
            .filter(|execution| execution.workflow_id == workflow_id)
            .cloned()
            .collect::<Vec<_>>();

        executions.sort_by_key(|execution| execution.started_at);
        Ok(executions)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::change::detect;
    use crate::model::{ComparisonMode, ExecutionMode, HttpMethod};

    fn new_watcher(name: &str) -> NewWatcher {
        NewWatcher {
            name: name.into(),
            url: "https://example.com".into(),
            method: HttpMethod::Get,
            headers: vec![],
            body: None,
            execution_mode: ExecutionMode::Scheduled,
            watch_interval: Some(60),
            is_active: true,
            save_cookies: false,
            use_cookies: false,
            cookie_watcher_id: None,
            comparison_mode: ComparisonMode::Hash,
        }
    }

    async fn check(storage: &MemoryStorage, watcher_id: i64, body: &[u8]) -> ChangeLog {
        let snapshot = storage.snapshot(watcher_id).await.unwrap();
        let detection = detect(snapshot.as_ref(), body, ComparisonMode::Hash);
        storage
            .commit_check(watcher_id, &detection, body, None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_unique_names() {
        let storage = MemoryStorage::new();
        storage.create_watcher(&new_watcher("a")).await.unwrap();

        let duplicate = storage.create_watcher(&new_watcher("a")).await;
        assert!(matches!(duplicate, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn test_self_referential_cookie_chain() {
        let storage = MemoryStorage::new();
        let watcher = storage.create_watcher(&new_watcher("a")).await.unwrap();

        let update = WatcherUpdate {
            use_cookies: Some(true),
            cookie_watcher_id: Some(Some(watcher.id)),
            ..Default::default()
        };
        let result = storage.update_watcher(watcher.id, &update).await;
        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn test_check_sequence_counters() {
        let storage = MemoryStorage::new();
        let watcher = storage.create_watcher(&new_watcher("a")).await.unwrap();

        let first = check(&storage, watcher.id, b"hello").await;
        assert_eq!(first.change_type, ChangeType::New);

        let second = check(&storage, watcher.id, b"hello").await;
        assert_eq!(second.change_type, ChangeType::Unchanged);

        let third = check(&storage, watcher.id, b"hello world").await;
        assert_eq!(third.change_type, ChangeType::Modified);

        let watcher = storage.watcher(watcher.id).await.unwrap();
        assert_eq!(watcher.check_count, 3);
        assert_eq!(watcher.change_count, 2);
        assert!(watcher.change_count <= watcher.check_count);
        assert_eq!(watcher.status, WatcherStatus::Success);

        // One snapshot per watcher, holding the latest content.
        let snapshot = storage.snapshot(watcher.id).await.unwrap().unwrap();
        assert_eq!(snapshot.content, b"hello world");

        // Change log rows sorted by id match detected_at order.
        let logs = storage
            .change_logs(&ChangeLogFilter {
                watcher_id: Some(watcher.id),
                order_by: OrderBy::DetectedAt,
                direction: OrderDirection::Asc,
                ..Default::default()
            })
            .await
            .unwrap();
        let ids = logs.iter().map(|log| log.id).collect::<Vec<_>>();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[tokio::test]
    async fn test_error_commit() {
        let storage = MemoryStorage::new();
        let watcher = storage.create_watcher(&new_watcher("a")).await.unwrap();

        storage
            .commit_error(watcher.id, "network error: dns", None)
            .await
            .unwrap();

        let watcher = storage.watcher(watcher.id).await.unwrap();
        assert_eq!(watcher.status, WatcherStatus::Error);
        assert_eq!(watcher.error_message.as_deref(), Some("network error: dns"));
        assert_eq!(watcher.check_count, 1);
        assert_eq!(watcher.change_count, 0);
        assert!(storage.snapshot(watcher.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cookie_replacement() {
        let storage = MemoryStorage::new();
        let watcher = storage.create_watcher(&new_watcher("a")).await.unwrap();

        let first = vec![
            SetCookie::parse("a=1").unwrap(),
            SetCookie::parse("b=2").unwrap(),
        ];
        storage.replace_cookies(watcher.id, &first).await.unwrap();

        let second = vec![SetCookie::parse("c=3").unwrap()];
        storage.replace_cookies(watcher.id, &second).await.unwrap();

        let cookies = storage.cookies(watcher.id).await.unwrap();
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].name, "c");
        assert_eq!(cookies[0].value, "3");
    }

    #[tokio::test]
    async fn test_expiring_cookies() {
        let now = OffsetDateTime::now_utc();
        let storage = MemoryStorage::new();
        let watcher = storage.create_watcher(&new_watcher("a")).await.unwrap();

        let cookies = vec![
            SetCookie::parse_at("soon=1; Max-Age=3600", now).unwrap(),
            SetCookie::parse_at("later=2; Max-Age=360000", now).unwrap(),
            SetCookie::parse_at("gone=3; Max-Age=-60", now).unwrap(),
            SetCookie::parse("session=4").unwrap(),
        ];
        storage.replace_cookies(watcher.id, &cookies).await.unwrap();

        let expiring = storage.cookies_expiring_within(24).await.unwrap();
        assert_eq!(expiring.len(), 1);
        assert_eq!(expiring[0].name, "soon");

        let expired = storage.expired_cookies().await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].name, "gone");

        assert_eq!(storage.delete_expired_cookies().await.unwrap(), 1);
        assert_eq!(storage.cookies(watcher.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_delete_watcher_cascades() {
        let storage = MemoryStorage::new();
        let watcher = storage.create_watcher(&new_watcher("a")).await.unwrap();

        check(&storage, watcher.id, b"hello").await;
        storage
            .replace_cookies(watcher.id, &[SetCookie::parse("a=1").unwrap()])
            .await
            .unwrap();

        storage.delete_watcher(watcher.id).await.unwrap();

        assert!(storage.snapshot(watcher.id).await.unwrap().is_none());
        assert!(storage.cookies(watcher.id).await.unwrap().is_empty());
        let logs = storage
            .change_logs(&ChangeLogFilter::default())
            .await
            .unwrap();
        assert!(logs.is_empty());
    }

    #[tokio::test]
    async fn test_compare_bounds() {
        let storage = MemoryStorage::new();
        let watcher = storage.create_watcher(&new_watcher("a")).await.unwrap();

        let first = check(&storage, watcher.id, b"one").await;
        let second = check(&storage, watcher.id, b"two").await;

        let compared = storage
            .compare_change_logs(&[second.id, first.id])
            .await
            .unwrap();
        assert_eq!(compared[0].id, first.id);

        assert!(matches!(
            storage.compare_change_logs(&[first.id]).await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            storage.compare_change_logs(&[1, 2, 3, 4, 5, 6]).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_diff_search() {
        let storage = MemoryStorage::new();
        let watcher = storage.create_watcher(&new_watcher("a")).await.unwrap();

        check(&storage, watcher.id, b"hello").await;
        check(&storage, watcher.id, b"hello world").await;

        let hits = storage
            .change_logs(&ChangeLogFilter {
                search: Some("world".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].change_type, ChangeType::Modified);
    }

    #[tokio::test]
    async fn test_variable_uniqueness() {
        let storage = MemoryStorage::new();
        let workflow = storage
            .create_workflow(&NewWorkflow {
                name: "login".into(),
                description: None,
                steps: vec![],
                is_active: true,
                schedule_enabled: false,
                schedule_interval: None,
            })
            .await
            .unwrap();

        let variable = NewVariable {
            workflow_id: workflow.id,
            name: "token".into(),
            source: crate::model::VariableSource::Static,
            extract_method: crate::model::ExtractMethod::FullBody,
            extract_pattern: None,
            random_length: None,
            random_format: None,
            static_value: Some("x".into()),
        };
        storage.create_variable(&variable).await.unwrap();

        let duplicate = storage.create_variable(&variable).await;
        assert!(matches!(duplicate, Err(Error::Conflict(_))));
    }
}
