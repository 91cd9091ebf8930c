//! Storage contract and backends.
//!
//! The engine talks to persistence through the [`Storage`] trait: an
//! ordered, transactional record store over the entity types, with indexed
//! access per entity. Multi-write operations that must commit together
//! (change-detection results, workflow step extractions, workflow
//! completion) are single trait methods, so every backend can make them
//! atomic in its own way.
use async_trait::async_trait;
use std::collections::HashMap;
use time::OffsetDateTime;

pub mod memory;
pub mod migrations;
pub mod pool;
pub mod postgres;

pub use memory::MemoryStorage;
pub use postgres::PostgresStorage;

use crate::change::Detection;
use crate::error::Error;
use crate::http::SetCookie;
use crate::model::{
    ChangeLog, ChangeType, Cookie, NewVariable, NewWatcher, NewWorkflow, Snapshot, StepResult,
    Variable, Watcher, WatcherUpdate, Workflow, WorkflowExecution, WorkflowUpdate,
};
use crate::vars::Context;

/// Sort key for change log listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderBy {
    #[default]
    DetectedAt,
    NewSize,
    ChangeType,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderDirection {
    Asc,
    #[default]
    Desc,
}

/// Bucket size for the change frequency series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupBy {
    #[default]
    Day,
    Week,
    Month,
}

/// Change log list filters.
#[derive(Debug, Clone, Default)]
pub struct ChangeLogFilter {
    pub watcher_id: Option<i64>,
    pub change_type: Option<ChangeType>,
    pub date_from: Option<OffsetDateTime>,
    pub date_to: Option<OffsetDateTime>,
    pub min_size: Option<i64>,
    pub max_size: Option<i64>,
    /// Substring search over the stored diff bytes.
    pub search: Option<String>,
    pub order_by: OrderBy,
    pub direction: OrderDirection,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// A change log row without its content payloads, for listings.
#[derive(Debug, Clone)]
pub struct ChangeLogEntry {
    pub id: i64,
    pub watcher_id: i64,
    pub change_type: ChangeType,
    pub old_hash: Option<String>,
    pub new_hash: Option<String>,
    pub old_size: Option<i64>,
    pub new_size: Option<i64>,
    pub detected_at: OffsetDateTime,
}

/// Statistics query parameters.
#[derive(Debug, Clone, Default)]
pub struct StatisticsParams {
    pub watcher_id: Option<i64>,
    pub date_from: Option<OffsetDateTime>,
    pub date_to: Option<OffsetDateTime>,
    pub group_by: GroupBy,
}

/// One bucket of the change frequency series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrequencyPoint {
    /// Bucket start date, `YYYY-MM-DD`.
    pub bucket: String,
    pub count: i64,
    pub new_count: i64,
    pub modified_count: i64,
    pub unchanged_count: i64,
    pub error_count: i64,
}

/// A watcher ranked by changes in the statistics range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopWatcher {
    pub watcher_id: i64,
    pub change_count: i64,
}

/// Aggregated change log statistics.
#[derive(Debug, Clone)]
pub struct ChangeLogStatistics {
    pub total: i64,
    pub new_count: i64,
    pub modified_count: i64,
    pub unchanged_count: i64,
    pub error_count: i64,
    pub avg_size: f64,
    pub min_size: i64,
    pub max_size: i64,
    pub total_size: i64,
    pub frequency: Vec<FrequencyPoint>,
    pub top_watchers: Vec<TopWatcher>,
}

impl Default for ChangeLogStatistics {
    fn default() -> Self {
        Self {
            total: 0,
            new_count: 0,
            modified_count: 0,
            unchanged_count: 0,
            error_count: 0,
            avg_size: 0.0,
            min_size: 0,
            max_size: 0,
            total_size: 0,
            frequency: vec![],
            top_watchers: vec![],
        }
    }
}

/// The storage contract the engine requires.
#[async_trait]
pub trait Storage: Send + Sync {
    // Watchers.
    async fn create_watcher(&self, watcher: &NewWatcher) -> Result<Watcher, Error>;
    async fn watcher(&self, id: i64) -> Result<Watcher, Error>;
    async fn watcher_by_name(&self, name: &str) -> Result<Option<Watcher>, Error>;
    async fn watchers(&self) -> Result<Vec<Watcher>, Error>;
    /// Active watchers the scheduler may dispatch: schedulable execution
    /// mode and an interval configured.
    async fn scheduled_watchers(&self) -> Result<Vec<Watcher>, Error>;
    async fn update_watcher(&self, id: i64, update: &WatcherUpdate) -> Result<Watcher, Error>;
    /// Cascades to the watcher's cookies, snapshot, and change logs.
    async fn delete_watcher(&self, id: i64) -> Result<(), Error>;
    /// Transient `running` status while one execution is in flight.
    async fn mark_watcher_running(&self, id: i64) -> Result<(), Error>;

    // Change detection. One transaction each.
    async fn snapshot(&self, watcher_id: i64) -> Result<Option<Snapshot>, Error>;
    /// Persist a successful check: change log row, snapshot upsert, and
    /// watcher counters/status, atomically.
    async fn commit_check(
        &self,
        watcher_id: i64,
        detection: &Detection,
        body: &[u8],
        content_type: Option<&str>,
    ) -> Result<ChangeLog, Error>;
    /// Persist a failed check: `error` change log row and watcher
    /// status/counters, atomically. The snapshot is not touched.
    async fn commit_error(
        &self,
        watcher_id: i64,
        message: &str,
        body: Option<&[u8]>,
    ) -> Result<ChangeLog, Error>;

    // Cookie store.
    /// Atomically replace the watcher's cookie set.
    async fn replace_cookies(&self, watcher_id: i64, cookies: &[SetCookie]) -> Result<(), Error>;
    async fn cookies(&self, watcher_id: i64) -> Result<Vec<Cookie>, Error>;
    async fn expired_cookies(&self) -> Result<Vec<Cookie>, Error>;
    /// Cookies that expire within the next `hours`, soonest first.
    /// Already-expired and session cookies are excluded.
    async fn cookies_expiring_within(&self, hours: i64) -> Result<Vec<Cookie>, Error>;
    async fn delete_expired_cookies(&self) -> Result<u64, Error>;

    // Change logs.
    async fn change_log(&self, id: i64) -> Result<ChangeLog, Error>;
    async fn change_logs(&self, filter: &ChangeLogFilter) -> Result<Vec<ChangeLogEntry>, Error>;
    async fn change_log_statistics(
        &self,
        params: &StatisticsParams,
    ) -> Result<ChangeLogStatistics, Error>;
    /// Fetch 2..=5 change logs, ordered by `detected_at`.
    async fn compare_change_logs(&self, ids: &[i64]) -> Result<Vec<ChangeLog>, Error>;

    // Workflows.
    async fn create_workflow(&self, workflow: &NewWorkflow) -> Result<Workflow, Error>;
    async fn workflow(&self, id: i64) -> Result<Workflow, Error>;
    async fn workflow_by_name(&self, name: &str) -> Result<Option<Workflow>, Error>;
    async fn workflows(&self) -> Result<Vec<Workflow>, Error>;
    /// Active workflows with scheduling enabled and an interval set.
    async fn scheduled_workflows(&self) -> Result<Vec<Workflow>, Error>;
    async fn update_workflow(&self, id: i64, update: &WorkflowUpdate) -> Result<Workflow, Error>;
    /// Cascades to the workflow's variables and executions.
    async fn delete_workflow(&self, id: i64) -> Result<(), Error>;

    // Variables.
    async fn create_variable(&self, variable: &NewVariable) -> Result<Variable, Error>;
    async fn variables(&self, workflow_id: i64) -> Result<Vec<Variable>, Error>;
    async fn update_variable(&self, id: i64, update: &NewVariable) -> Result<Variable, Error>;
    async fn delete_variable(&self, id: i64) -> Result<(), Error>;

    // Workflow executions.
    /// Insert the execution row (status `running`) and return it with its
    /// id assigned.
    async fn insert_execution(&self, execution: &WorkflowExecution)
        -> Result<WorkflowExecution, Error>;
    async fn running_execution_exists(&self, workflow_id: i64) -> Result<bool, Error>;
    /// Persist one completed step: append its result, bump
    /// `steps_completed`, and write the extracted variable values, in one
    /// transaction.
    async fn commit_step(
        &self,
        execution_id: i64,
        step: &StepResult,
        steps_completed: i32,
        variable_values: &[(i64, String, OffsetDateTime)],
    ) -> Result<(), Error>;
    /// Finalize the execution row and update the owning workflow's
    /// counters and last-run status, in one transaction.
    async fn complete_execution(&self, execution: &WorkflowExecution) -> Result<(), Error>;
    async fn execution(&self, id: i64) -> Result<WorkflowExecution, Error>;
    async fn executions(&self, workflow_id: i64) -> Result<Vec<WorkflowExecution>, Error>;
}

/// Apply a partial watcher update. Shared by the backends.
pub(crate) fn apply_watcher_update(watcher: &mut Watcher, update: &WatcherUpdate) {
    if let Some(ref name) = update.name {
        watcher.name = name.clone();
    }
    if let Some(ref url) = update.url {
        watcher.url = url.clone();
    }
    if let Some(method) = update.method {
        watcher.method = method;
    }
    if let Some(ref headers) = update.headers {
        watcher.headers = headers.clone();
    }
    if let Some(ref body) = update.body {
        watcher.body = body.clone();
    }
    if let Some(mode) = update.execution_mode {
        watcher.execution_mode = mode;
    }
    if let Some(interval) = update.watch_interval {
        watcher.watch_interval = interval;
    }
    if let Some(active) = update.is_active {
        watcher.is_active = active;
    }
    if let Some(save) = update.save_cookies {
        watcher.save_cookies = save;
    }
    if let Some(use_cookies) = update.use_cookies {
        watcher.use_cookies = use_cookies;
    }
    if let Some(cookie_watcher_id) = update.cookie_watcher_id {
        watcher.cookie_watcher_id = cookie_watcher_id;
    }
    if let Some(mode) = update.comparison_mode {
        watcher.comparison_mode = mode;
    }
}

/// Apply a partial workflow update.
pub(crate) fn apply_workflow_update(workflow: &mut Workflow, update: &WorkflowUpdate) {
    if let Some(ref name) = update.name {
        workflow.name = name.clone();
    }
    if let Some(ref description) = update.description {
        workflow.description = description.clone();
    }
    if let Some(ref steps) = update.steps {
        workflow.steps = steps.clone();
    }
    if let Some(active) = update.is_active {
        workflow.is_active = active;
    }
    if let Some(enabled) = update.schedule_enabled {
        workflow.schedule_enabled = enabled;
    }
    if let Some(interval) = update.schedule_interval {
        workflow.schedule_interval = interval;
    }
}

/// Rules that must hold on a watcher after any update. Shared by the
/// backends.
pub(crate) fn validate_updated_watcher(watcher: &Watcher) -> Result<(), Error> {
    let url = url::Url::parse(&watcher.url)
        .map_err(|err| Error::Validation(format!("invalid url \"{}\": {}", watcher.url, err)))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::Validation(format!(
            "unsupported url scheme \"{}\"",
            url.scheme()
        )));
    }

    if watcher.execution_mode.schedulable() && watcher.watch_interval.unwrap_or(0) <= 0 {
        return Err(Error::Validation(
            "scheduled watchers require a positive watch_interval".into(),
        ));
    }

    if watcher.use_cookies && watcher.cookie_watcher_id.is_none() {
        return Err(Error::Validation(
            "use_cookies requires cookie_watcher_id".into(),
        ));
    }

    Ok(())
}

/// Minimal row shape for statistics aggregation, shared by the backends.
#[derive(Debug, Clone)]
pub(crate) struct StatRow {
    pub watcher_id: i64,
    pub change_type: ChangeType,
    pub new_size: Option<i64>,
    pub detected_at: OffsetDateTime,
}

/// Fold filtered change log rows into the statistics shape. Both backends
/// filter rows their own way and share the bucket/top-N semantics.
pub(crate) fn aggregate_statistics(rows: &[StatRow], group_by: GroupBy) -> ChangeLogStatistics {
    let mut stats = ChangeLogStatistics::default();
    let mut sized = 0i64;
    let mut frequency: HashMap<String, FrequencyPoint> = HashMap::new();
    let mut per_watcher: HashMap<i64, i64> = HashMap::new();

    for row in rows {
        stats.total += 1;

        match row.change_type {
            ChangeType::New => stats.new_count += 1,
            ChangeType::Modified => stats.modified_count += 1,
            ChangeType::Unchanged => stats.unchanged_count += 1,
            ChangeType::Error => stats.error_count += 1,
        }

        if let Some(size) = row.new_size {
            if sized == 0 {
                stats.min_size = size;
                stats.max_size = size;
            } else {
                stats.min_size = stats.min_size.min(size);
                stats.max_size = stats.max_size.max(size);
            }
            stats.total_size += size;
            sized += 1;
        }

        let bucket = bucket_date(row.detected_at, group_by);
        let point = frequency.entry(bucket.clone()).or_insert(FrequencyPoint {
            bucket,
            count: 0,
            new_count: 0,
            modified_count: 0,
            unchanged_count: 0,
            error_count: 0,
        });
        point.count += 1;
        match row.change_type {
            ChangeType::New => point.new_count += 1,
            ChangeType::Modified => point.modified_count += 1,
            ChangeType::Unchanged => point.unchanged_count += 1,
            ChangeType::Error => point.error_count += 1,
        }

        if matches!(row.change_type, ChangeType::New | ChangeType::Modified) {
            *per_watcher.entry(row.watcher_id).or_insert(0) += 1;
        }
    }

    if sized > 0 {
        stats.avg_size = stats.total_size as f64 / sized as f64;
    }

    let mut frequency = frequency.into_values().collect::<Vec<_>>();
    frequency.sort_by(|a, b| a.bucket.cmp(&b.bucket));
    stats.frequency = frequency;

    let mut top = per_watcher
        .into_iter()
        .map(|(watcher_id, change_count)| TopWatcher {
            watcher_id,
            change_count,
        })
        .collect::<Vec<_>>();
    top.sort_by(|a, b| {
        b.change_count
            .cmp(&a.change_count)
            .then(a.watcher_id.cmp(&b.watcher_id))
    });
    top.truncate(10);
    stats.top_watchers = top;

    stats
}

/// Truncate a timestamp to its bucket start date.
fn bucket_date(at: OffsetDateTime, group_by: GroupBy) -> String {
    let date = match group_by {
        GroupBy::Day => at.date(),
        GroupBy::Week => {
            // Weeks start on Monday.
            let days = at.date().weekday().number_days_from_monday() as i64;
            at.date() - time::Duration::days(days)
        }
        GroupBy::Month => at.date().replace_day(1).unwrap_or(at.date()),
    };

    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

/// Check a filter against one entry. Shared by the memory backend and the
/// Postgres diff-search post-pass.
pub(crate) fn matches_filter(log: &ChangeLog, filter: &ChangeLogFilter) -> bool {
    if let Some(watcher_id) = filter.watcher_id {
        if log.watcher_id != watcher_id {
            return false;
        }
    }
    if let Some(change_type) = filter.change_type {
        if log.change_type != change_type {
            return false;
        }
    }
    if let Some(from) = filter.date_from {
        if log.detected_at < from {
            return false;
        }
    }
    if let Some(to) = filter.date_to {
        if log.detected_at > to {
            return false;
        }
    }
    if let Some(min) = filter.min_size {
        if log.new_size.unwrap_or(0) < min {
            return false;
        }
    }
    if let Some(max) = filter.max_size {
        if log.new_size.unwrap_or(0) > max {
            return false;
        }
    }
    if let Some(ref search) = filter.search {
        let haystack = log.diff.as_deref().unwrap_or(&[]);
        if !contains_subslice(haystack, search.as_bytes()) {
            return false;
        }
    }

    true
}

pub(crate) fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}

/// Seed context for a new workflow execution: overrides win, then static
/// variables contribute their stable values.
pub fn seed_context(overrides: Option<&Context>, variables: &[Variable]) -> Context {
    let mut context = overrides.cloned().unwrap_or_default();

    for variable in variables {
        if context.contains_key(&variable.name) {
            continue;
        }
        if variable.source == crate::model::VariableSource::Static {
            if let Some(ref value) = variable.current_value {
                context.insert(variable.name.clone(), value.clone());
            }
        }
    }

    context
}

#[cfg(test)]
mod test {
    use super::*;
    use time::macros::datetime;

    fn row(change_type: ChangeType, size: i64, at: OffsetDateTime, watcher: i64) -> StatRow {
        StatRow {
            watcher_id: watcher,
            change_type,
            new_size: Some(size),
            detected_at: at,
        }
    }

    #[test]
    fn test_aggregate_statistics() {
        let rows = vec![
            row(ChangeType::New, 10, datetime!(2026-01-05 10:00 UTC), 1),
            row(ChangeType::Modified, 30, datetime!(2026-01-05 12:00 UTC), 1),
            row(ChangeType::Unchanged, 30, datetime!(2026-01-06 09:00 UTC), 1),
            row(ChangeType::Modified, 50, datetime!(2026-01-06 09:30 UTC), 2),
            row(ChangeType::Error, 0, datetime!(2026-01-07 01:00 UTC), 2),
        ];

        let stats = aggregate_statistics(&rows, GroupBy::Day);
        assert_eq!(stats.total, 5);
        assert_eq!(stats.new_count, 1);
        assert_eq!(stats.modified_count, 2);
        assert_eq!(stats.unchanged_count, 1);
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.min_size, 0);
        assert_eq!(stats.max_size, 50);
        assert_eq!(stats.total_size, 120);
        assert_eq!(stats.frequency.len(), 3);
        assert_eq!(stats.frequency[0].bucket, "2026-01-05");
        assert_eq!(stats.frequency[0].count, 2);

        // Only new/modified rows count toward the ranking.
        assert_eq!(stats.top_watchers[0].watcher_id, 1);
        assert_eq!(stats.top_watchers[0].change_count, 2);
        assert_eq!(stats.top_watchers[1].change_count, 1);
    }

    #[test]
    fn test_buckets() {
        let at = datetime!(2026-01-07 13:00 UTC); // a Wednesday
        assert_eq!(bucket_date(at, GroupBy::Day), "2026-01-07");
        assert_eq!(bucket_date(at, GroupBy::Week), "2026-01-05");
        assert_eq!(bucket_date(at, GroupBy::Month), "2026-01-01");
    }

    #[test]
    fn test_subslice_search() {
        assert!(contains_subslice(b"+hello world", b"hello"));
        assert!(!contains_subslice(b"+hello", b"world"));
        assert!(contains_subslice(b"anything", b""));
    }
}
