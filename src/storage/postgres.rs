//! Postgres storage backend.
//!
//! Explicit SQL per contract method. The multi-write commits run inside
//! real transactions; unique and foreign key violations map onto the
//! engine's conflict/not-found errors.
use async_trait::async_trait;
use time::OffsetDateTime;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;

use super::pool::{Pool, PoolConfig};
use super::{
    aggregate_statistics, apply_watcher_update, apply_workflow_update, migrations,
    validate_updated_watcher, ChangeLogEntry, ChangeLogFilter, ChangeLogStatistics, OrderBy,
    OrderDirection, StatRow, StatisticsParams, Storage,
};
use crate::change::Detection;
use crate::config::DatabaseConfig;
use crate::error::Error;
use crate::http::SetCookie;
use crate::model::{
    workflow::validate_steps, ChangeLog, ChangeType, Cookie, NewVariable, NewWatcher, NewWorkflow,
    Snapshot, StepResult, Variable, Watcher, WatcherUpdate, Workflow, WorkflowExecution,
    WorkflowStatus, WorkflowUpdate,
};

const WATCHER_COLUMNS: &str = "id, name, url, method, headers, body, execution_mode, \
     watch_interval, is_active, save_cookies, use_cookies, cookie_watcher_id, comparison_mode, \
     status, error_message, check_count, change_count, last_checked_at, last_changed_at, created_at";

const CHANGE_LOG_COLUMNS: &str = "id, watcher_id, change_type, old_hash, new_hash, old_size, \
     new_size, old_content, new_content, diff, error_message, detected_at";

const WORKFLOW_COLUMNS: &str = "id, name, description, steps, is_active, schedule_enabled, \
     schedule_interval, execution_count, success_count, failure_count, last_executed_at, \
     last_execution_status, last_execution_error, created_at";

const VARIABLE_COLUMNS: &str = "id, workflow_id, name, source, extract_method, extract_pattern, \
     random_length, random_format, static_value, current_value, last_extracted_at, created_at";

const EXECUTION_COLUMNS: &str = "id, workflow_id, status, started_at, completed_at, \
     duration_seconds, steps_total, steps_completed, step_results, variables_extracted, \
     error_message, error_step";

/// Storage backend over a Postgres database.
pub struct PostgresStorage {
    pool: Pool,
}

impl PostgresStorage {
    /// Connect and bootstrap the schema.
    pub async fn connect(url: &str, config: &DatabaseConfig) -> Result<Self, Error> {
        let pool = Pool::new(
            url,
            PoolConfig {
                pool_size: config.pool_size,
                checkout_timeout: config.checkout_timeout(),
                idle_timeout: config.idle_timeout(),
            },
        );

        migrations::bootstrap(&pool).await?;

        Ok(Self { pool })
    }
}

fn parse_enum<T: std::str::FromStr>(value: &str, what: &str) -> Result<T, Error> {
    value
        .parse()
        .map_err(|_| Error::Storage(format!("unexpected {} \"{}\"", what, value)))
}

/// Map constraint violations onto engine errors.
fn write_error(err: tokio_postgres::Error, conflict: &str, missing: &'static str) -> Error {
    match err.code() {
        Some(&SqlState::UNIQUE_VIOLATION) => Error::Conflict(conflict.to_string()),
        Some(&SqlState::FOREIGN_KEY_VIOLATION) => Error::NotFound {
            entity: missing,
            id: "referenced".into(),
        },
        _ => Error::Storage(err.to_string()),
    }
}

fn watcher_from_row(row: &Row) -> Result<Watcher, Error> {
    let method: String = row.try_get("method")?;
    let execution_mode: String = row.try_get("execution_mode")?;
    let comparison_mode: String = row.try_get("comparison_mode")?;
    let status: String = row.try_get("status")?;
    let headers: serde_json::Value = row.try_get("headers")?;

    Ok(Watcher {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        method: parse_enum(&method, "method")?,
        headers: serde_json::from_value(headers)?,
        body: row.try_get("body")?,
        execution_mode: parse_enum(&execution_mode, "execution mode")?,
        watch_interval: row.try_get("watch_interval")?,
        is_active: row.try_get("is_active")?,
        save_cookies: row.try_get("save_cookies")?,
        use_cookies: row.try_get("use_cookies")?,
        cookie_watcher_id: row.try_get("cookie_watcher_id")?,
        comparison_mode: parse_enum(&comparison_mode, "comparison mode")?,
        status: parse_enum(&status, "watcher status")?,
        error_message: row.try_get("error_message")?,
        check_count: row.try_get("check_count")?,
        change_count: row.try_get("change_count")?,
        last_checked_at: row.try_get("last_checked_at")?,
        last_changed_at: row.try_get("last_changed_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn snapshot_from_row(row: &Row) -> Result<Snapshot, Error> {
    Ok(Snapshot {
        id: row.try_get("id")?,
        watcher_id: row.try_get("watcher_id")?,
        content: row.try_get("content")?,
        content_hash: row.try_get("content_hash")?,
        content_size: row.try_get("content_size")?,
        content_type: row.try_get("content_type")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn change_log_from_row(row: &Row) -> Result<ChangeLog, Error> {
    let change_type: String = row.try_get("change_type")?;

    Ok(ChangeLog {
        id: row.try_get("id")?,
        watcher_id: row.try_get("watcher_id")?,
        change_type: parse_enum(&change_type, "change type")?,
        old_hash: row.try_get("old_hash")?,
        new_hash: row.try_get("new_hash")?,
        old_size: row.try_get("old_size")?,
        new_size: row.try_get("new_size")?,
        old_content: row.try_get("old_content")?,
        new_content: row.try_get("new_content")?,
        diff: row.try_get("diff")?,
        error_message: row.try_get("error_message")?,
        detected_at: row.try_get("detected_at")?,
    })
}

fn cookie_from_row(row: &Row) -> Result<Cookie, Error> {
    Ok(Cookie {
        id: row.try_get("id")?,
        watcher_id: row.try_get("watcher_id")?,
        name: row.try_get("name")?,
        value: row.try_get("value")?,
        domain: row.try_get("domain")?,
        path: row.try_get("path")?,
        expires: row.try_get("expires")?,
        secure: row.try_get("secure")?,
        http_only: row.try_get("http_only")?,
        created_at: row.try_get("created_at")?,
    })
}

fn workflow_from_row(row: &Row) -> Result<Workflow, Error> {
    let steps: serde_json::Value = row.try_get("steps")?;
    let status: Option<String> = row.try_get("last_execution_status")?;

    Ok(Workflow {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        steps: serde_json::from_value(steps)?,
        is_active: row.try_get("is_active")?,
        schedule_enabled: row.try_get("schedule_enabled")?,
        schedule_interval: row.try_get("schedule_interval")?,
        execution_count: row.try_get("execution_count")?,
        success_count: row.try_get("success_count")?,
        failure_count: row.try_get("failure_count")?,
        last_executed_at: row.try_get("last_executed_at")?,
        last_execution_status: match status {
            Some(status) => Some(parse_enum(&status, "workflow status")?),
            None => None,
        },
        last_execution_error: row.try_get("last_execution_error")?,
        created_at: row.try_get("created_at")?,
    })
}

fn variable_from_row(row: &Row) -> Result<Variable, Error> {
    let source: String = row.try_get("source")?;
    let extract_method: String = row.try_get("extract_method")?;

    Ok(Variable {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        name: row.try_get("name")?,
        source: parse_enum(&source, "variable source")?,
        extract_method: parse_enum(&extract_method, "extract method")?,
        extract_pattern: row.try_get("extract_pattern")?,
        random_length: row.try_get("random_length")?,
        random_format: row.try_get("random_format")?,
        static_value: row.try_get("static_value")?,
        current_value: row.try_get("current_value")?,
        last_extracted_at: row.try_get("last_extracted_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn execution_from_row(row: &Row) -> Result<WorkflowExecution, Error> {
    let status: String = row.try_get("status")?;
    let step_results: serde_json::Value = row.try_get("step_results")?;
    let variables: serde_json::Value = row.try_get("variables_extracted")?;

    Ok(WorkflowExecution {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        status: parse_enum(&status, "workflow status")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        duration_seconds: row.try_get("duration_seconds")?,
        steps_total: row.try_get("steps_total")?,
        steps_completed: row.try_get("steps_completed")?,
        step_results: serde_json::from_value(step_results)?,
        variables_extracted: serde_json::from_value(variables)?,
        error_message: row.try_get("error_message")?,
        error_step: row.try_get("error_step")?,
    })
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn create_watcher(&self, watcher: &NewWatcher) -> Result<Watcher, Error> {
        watcher.validate()?;

        let conn = self.pool.get().await?;
        let headers = serde_json::to_value(&watcher.headers)?;

        let row = conn
            .query_one(
                &format!(
                    "INSERT INTO watchers (name, url, method, headers, body, execution_mode, \
                     watch_interval, is_active, save_cookies, use_cookies, cookie_watcher_id, \
                     comparison_mode) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
                     RETURNING {}",
                    WATCHER_COLUMNS
                ),
                &[
                    &watcher.name,
                    &watcher.url,
                    &watcher.method.to_string(),
                    &headers,
                    &watcher.body,
                    &watcher.execution_mode.to_string(),
                    &watcher.watch_interval,
                    &watcher.is_active,
                    &watcher.save_cookies,
                    &watcher.use_cookies,
                    &watcher.cookie_watcher_id,
                    &watcher.comparison_mode.to_string(),
                ],
            )
            .await
            .map_err(|err| {
                write_error(
                    err,
                    &format!("watcher \"{}\" already exists", watcher.name),
                    "watcher",
                )
            })?;

        watcher_from_row(&row)
    }

    async fn watcher(&self, id: i64) -> Result<Watcher, Error> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                &format!("SELECT {} FROM watchers WHERE id = $1", WATCHER_COLUMNS),
                &[&id],
            )
            .await?
            .ok_or_else(|| Error::not_found("watcher", id))?;

        watcher_from_row(&row)
    }

    async fn watcher_by_name(&self, name: &str) -> Result<Option<Watcher>, Error> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                &format!("SELECT {} FROM watchers WHERE name = $1", WATCHER_COLUMNS),
                &[&name],
            )
            .await?;

        row.as_ref().map(watcher_from_row).transpose()
    }

    async fn watchers(&self) -> Result<Vec<Watcher>, Error> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                &format!("SELECT {} FROM watchers ORDER BY id", WATCHER_COLUMNS),
                &[],
            )
            .await?;

        rows.iter().map(watcher_from_row).collect()
    }

    async fn scheduled_watchers(&self) -> Result<Vec<Watcher>, Error> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM watchers WHERE is_active \
                     AND execution_mode IN ('scheduled', 'both') \
                     AND watch_interval IS NOT NULL ORDER BY id",
                    WATCHER_COLUMNS
                ),
                &[],
            )
            .await?;

        rows.iter().map(watcher_from_row).collect()
    }

    async fn update_watcher(&self, id: i64, update: &WatcherUpdate) -> Result<Watcher, Error> {
        if let Some(Some(cookie_watcher_id)) = update.cookie_watcher_id {
            if cookie_watcher_id == id {
                return Err(Error::Conflict("watcher cannot use its own cookies".into()));
            }
        }

        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;

        let row = tx
            .query_opt(
                &format!(
                    "SELECT {} FROM watchers WHERE id = $1 FOR UPDATE",
                    WATCHER_COLUMNS
                ),
                &[&id],
            )
            .await?
            .ok_or_else(|| Error::not_found("watcher", id))?;

        let mut watcher = watcher_from_row(&row)?;
        apply_watcher_update(&mut watcher, update);
        validate_updated_watcher(&watcher)?;

        let headers = serde_json::to_value(&watcher.headers)?;
        tx.execute(
            "UPDATE watchers SET name = $2, url = $3, method = $4, headers = $5, body = $6, \
             execution_mode = $7, watch_interval = $8, is_active = $9, save_cookies = $10, \
             use_cookies = $11, cookie_watcher_id = $12, comparison_mode = $13 WHERE id = $1",
            &[
                &id,
                &watcher.name,
                &watcher.url,
                &watcher.method.to_string(),
                &headers,
                &watcher.body,
                &watcher.execution_mode.to_string(),
                &watcher.watch_interval,
                &watcher.is_active,
                &watcher.save_cookies,
                &watcher.use_cookies,
                &watcher.cookie_watcher_id,
                &watcher.comparison_mode.to_string(),
            ],
        )
        .await
        .map_err(|err| {
            write_error(
                err,
                &format!("watcher \"{}\" already exists", watcher.name),
                "watcher",
            )
        })?;

        tx.commit().await?;
        Ok(watcher)
    }

    async fn delete_watcher(&self, id: i64) -> Result<(), Error> {
        let conn = self.pool.get().await?;
        let deleted = conn
            .execute("DELETE FROM watchers WHERE id = $1", &[&id])
            .await?;

        if deleted == 0 {
            return Err(Error::not_found("watcher", id));
        }

        Ok(())
    }

    async fn mark_watcher_running(&self, id: i64) -> Result<(), Error> {
        let conn = self.pool.get().await?;
        let updated = conn
            .execute(
                "UPDATE watchers SET status = 'running' WHERE id = $1",
                &[&id],
            )
            .await?;

        if updated == 0 {
            return Err(Error::not_found("watcher", id));
        }

        Ok(())
    }

    async fn snapshot(&self, watcher_id: i64) -> Result<Option<Snapshot>, Error> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                "SELECT id, watcher_id, content, content_hash, content_size, content_type, \
                 created_at, updated_at FROM snapshots WHERE watcher_id = $1",
                &[&watcher_id],
            )
            .await?;

        row.as_ref().map(snapshot_from_row).transpose()
    }

    async fn commit_check(
        &self,
        watcher_id: i64,
        detection: &Detection,
        body: &[u8],
        content_type: Option<&str>,
    ) -> Result<ChangeLog, Error> {
        let now = OffsetDateTime::now_utc();
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;

        let new_content = body.to_vec();
        let row = tx
            .query_one(
                &format!(
                    "INSERT INTO change_logs (watcher_id, change_type, old_hash, new_hash, \
                     old_size, new_size, old_content, new_content, diff, detected_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) RETURNING {}",
                    CHANGE_LOG_COLUMNS
                ),
                &[
                    &watcher_id,
                    &detection.change_type.to_string(),
                    &detection.old_hash,
                    &detection.new_hash,
                    &detection.old_size,
                    &detection.new_size,
                    &detection.old_content,
                    &new_content,
                    &detection.diff,
                    &now,
                ],
            )
            .await
            .map_err(|err| write_error(err, "change log insert", "watcher"))?;

        if detection.write_snapshot {
            tx.execute(
                "INSERT INTO snapshots (watcher_id, content, content_hash, content_size, \
                 content_type, created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $6) \
                 ON CONFLICT (watcher_id) DO UPDATE SET content = EXCLUDED.content, \
                 content_hash = EXCLUDED.content_hash, content_size = EXCLUDED.content_size, \
                 content_type = EXCLUDED.content_type, updated_at = EXCLUDED.updated_at",
                &[
                    &watcher_id,
                    &new_content,
                    &detection.new_hash,
                    &detection.new_size,
                    &content_type,
                    &now,
                ],
            )
            .await?;
        } else {
            tx.execute(
                "UPDATE snapshots SET updated_at = $2 WHERE watcher_id = $1",
                &[&watcher_id, &now],
            )
            .await?;
        }

        let changed = matches!(
            detection.change_type,
            ChangeType::New | ChangeType::Modified
        );
        let statement = if changed {
            "UPDATE watchers SET check_count = check_count + 1, change_count = change_count + 1, \
             last_checked_at = $2, last_changed_at = $2, status = 'success', \
             error_message = NULL WHERE id = $1"
        } else {
            "UPDATE watchers SET check_count = check_count + 1, last_checked_at = $2, \
             status = 'success', error_message = NULL WHERE id = $1"
        };
        let updated = tx.execute(statement, &[&watcher_id, &now]).await?;
        if updated == 0 {
            return Err(Error::not_found("watcher", watcher_id));
        }

        tx.commit().await?;
        change_log_from_row(&row)
    }

    async fn commit_error(
        &self,
        watcher_id: i64,
        message: &str,
        body: Option<&[u8]>,
    ) -> Result<ChangeLog, Error> {
        let now = OffsetDateTime::now_utc();
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;

        let new_content = body.map(|body| body.to_vec());
        let new_size = body.map(|body| body.len() as i64);

        let row = tx
            .query_one(
                &format!(
                    "INSERT INTO change_logs (watcher_id, change_type, new_size, new_content, \
                     error_message, detected_at) VALUES ($1, 'error', $2, $3, $4, $5) \
                     RETURNING {}",
                    CHANGE_LOG_COLUMNS
                ),
                &[&watcher_id, &new_size, &new_content, &message, &now],
            )
            .await
            .map_err(|err| write_error(err, "change log insert", "watcher"))?;

        let updated = tx
            .execute(
                "UPDATE watchers SET check_count = check_count + 1, last_checked_at = $2, \
                 status = 'error', error_message = $3 WHERE id = $1",
                &[&watcher_id, &now, &message],
            )
            .await?;
        if updated == 0 {
            return Err(Error::not_found("watcher", watcher_id));
        }

        tx.commit().await?;
        change_log_from_row(&row)
    }

    async fn replace_cookies(&self, watcher_id: i64, cookies: &[SetCookie]) -> Result<(), Error> {
        let now = OffsetDateTime::now_utc();
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;

        tx.execute("DELETE FROM cookies WHERE watcher_id = $1", &[&watcher_id])
            .await?;

        for cookie in cookies {
            tx.execute(
                "INSERT INTO cookies (watcher_id, name, value, domain, path, expires, secure, \
                 http_only, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                &[
                    &watcher_id,
                    &cookie.name,
                    &cookie.value,
                    &cookie.domain,
                    &cookie.path,
                    &cookie.expires,
                    &cookie.secure,
                    &cookie.http_only,
                    &now,
                ],
            )
            .await
            .map_err(|err| {
                write_error(
                    err,
                    &format!("cookie \"{}\" already stored", cookie.name),
                    "watcher",
                )
            })?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn cookies(&self, watcher_id: i64) -> Result<Vec<Cookie>, Error> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                "SELECT id, watcher_id, name, value, domain, path, expires, secure, http_only, \
                 created_at FROM cookies WHERE watcher_id = $1 ORDER BY id",
                &[&watcher_id],
            )
            .await?;

        rows.iter().map(cookie_from_row).collect()
    }

    async fn expired_cookies(&self) -> Result<Vec<Cookie>, Error> {
        let now = OffsetDateTime::now_utc();
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                "SELECT id, watcher_id, name, value, domain, path, expires, secure, http_only, \
                 created_at FROM cookies WHERE expires IS NOT NULL AND expires < $1 \
                 ORDER BY expires DESC",
                &[&now],
            )
            .await?;

        rows.iter().map(cookie_from_row).collect()
    }

    async fn cookies_expiring_within(&self, hours: i64) -> Result<Vec<Cookie>, Error> {
        let now = OffsetDateTime::now_utc();
        let threshold = now + time::Duration::hours(hours);

        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                "SELECT id, watcher_id, name, value, domain, path, expires, secure, http_only, \
                 created_at FROM cookies WHERE expires IS NOT NULL AND expires > $1 \
                 AND expires <= $2 ORDER BY expires ASC",
                &[&now, &threshold],
            )
            .await?;

        rows.iter().map(cookie_from_row).collect()
    }

    async fn delete_expired_cookies(&self) -> Result<u64, Error> {
        let now = OffsetDateTime::now_utc();
        let conn = self.pool.get().await?;
        let deleted = conn
            .execute(
                "DELETE FROM cookies WHERE expires IS NOT NULL AND expires < $1",
                &[&now],
            )
            .await?;

        Ok(deleted)
    }

    async fn change_log(&self, id: i64) -> Result<ChangeLog, Error> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                &format!("SELECT {} FROM change_logs WHERE id = $1", CHANGE_LOG_COLUMNS),
                &[&id],
            )
            .await?
            .ok_or_else(|| Error::not_found("change log", id))?;

        change_log_from_row(&row)
    }

    async fn change_logs(&self, filter: &ChangeLogFilter) -> Result<Vec<ChangeLogEntry>, Error> {
        let change_type = filter.change_type.map(|t| t.to_string());
        let search = filter.search.as_ref().map(|s| s.as_bytes().to_vec());

        let mut conditions: Vec<String> = vec![];
        let mut params: Vec<&(dyn ToSql + Sync)> = vec![];

        if let Some(ref watcher_id) = filter.watcher_id {
            params.push(watcher_id);
            conditions.push(format!("watcher_id = ${}", params.len()));
        }
        if let Some(ref change_type) = change_type {
            params.push(change_type);
            conditions.push(format!("change_type = ${}", params.len()));
        }
        if let Some(ref from) = filter.date_from {
            params.push(from);
            conditions.push(format!("detected_at >= ${}", params.len()));
        }
        if let Some(ref to) = filter.date_to {
            params.push(to);
            conditions.push(format!("detected_at <= ${}", params.len()));
        }
        if let Some(ref min) = filter.min_size {
            params.push(min);
            conditions.push(format!("new_size >= ${}", params.len()));
        }
        if let Some(ref max) = filter.max_size {
            params.push(max);
            conditions.push(format!("new_size <= ${}", params.len()));
        }
        if let Some(ref search) = search {
            params.push(search);
            conditions.push(format!(
                "diff IS NOT NULL AND position(${} in diff) > 0",
                params.len()
            ));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let order_column = match filter.order_by {
            OrderBy::DetectedAt => "detected_at",
            OrderBy::NewSize => "new_size",
            OrderBy::ChangeType => "change_type",
        };
        let direction = match filter.direction {
            OrderDirection::Asc => "ASC",
            OrderDirection::Desc => "DESC",
        };

        let limit = filter.limit.unwrap_or(100).max(0);
        let offset = filter.offset.unwrap_or(0).max(0);
        params.push(&limit);
        let limit_param = params.len();
        params.push(&offset);
        let offset_param = params.len();

        let statement = format!(
            "SELECT id, watcher_id, change_type, old_hash, new_hash, old_size, new_size, \
             detected_at FROM change_logs {} ORDER BY {} {} LIMIT ${} OFFSET ${}",
            where_clause, order_column, direction, limit_param, offset_param
        );

        let conn = self.pool.get().await?;
        let rows = conn.query(&statement, &params).await?;

        rows.iter()
            .map(|row| {
                let change_type: String = row.try_get("change_type")?;
                Ok(ChangeLogEntry {
                    id: row.try_get("id")?,
                    watcher_id: row.try_get("watcher_id")?,
                    change_type: parse_enum(&change_type, "change type")?,
                    old_hash: row.try_get("old_hash")?,
                    new_hash: row.try_get("new_hash")?,
                    old_size: row.try_get("old_size")?,
                    new_size: row.try_get("new_size")?,
                    detected_at: row.try_get("detected_at")?,
                })
            })
            .collect()
    }

    async fn change_log_statistics(
        &self,
        params: &StatisticsParams,
    ) -> Result<ChangeLogStatistics, Error> {
        let mut conditions: Vec<String> = vec![];
        let mut query_params: Vec<&(dyn ToSql + Sync)> = vec![];

        if let Some(ref watcher_id) = params.watcher_id {
            query_params.push(watcher_id);
            conditions.push(format!("watcher_id = ${}", query_params.len()));
        }
        if let Some(ref from) = params.date_from {
            query_params.push(from);
            conditions.push(format!("detected_at >= ${}", query_params.len()));
        }
        if let Some(ref to) = params.date_to {
            query_params.push(to);
            conditions.push(format!("detected_at <= ${}", query_params.len()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let statement = format!(
            "SELECT watcher_id, change_type, new_size, detected_at FROM change_logs {}",
            where_clause
        );

        let conn = self.pool.get().await?;
        let rows = conn.query(&statement, &query_params).await?;

        let stat_rows = rows
            .iter()
            .map(|row| {
                let change_type: String = row.try_get("change_type")?;
                Ok(StatRow {
                    watcher_id: row.try_get("watcher_id")?,
                    change_type: parse_enum(&change_type, "change type")?,
                    new_size: row.try_get("new_size")?,
                    detected_at: row.try_get("detected_at")?,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(aggregate_statistics(&stat_rows, params.group_by))
    }

    async fn compare_change_logs(&self, ids: &[i64]) -> Result<Vec<ChangeLog>, Error> {
        if !(2..=5).contains(&ids.len()) {
            return Err(Error::Validation(
                "comparison requires between 2 and 5 change logs".into(),
            ));
        }

        let id_list = ids.to_vec();
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM change_logs WHERE id = ANY($1) ORDER BY detected_at",
                    CHANGE_LOG_COLUMNS
                ),
                &[&id_list],
            )
            .await?;

        let logs = rows
            .iter()
            .map(change_log_from_row)
            .collect::<Result<Vec<_>, Error>>()?;

        for id in ids {
            if !logs.iter().any(|log| log.id == *id) {
                return Err(Error::not_found("change log", *id));
            }
        }

        Ok(logs)
    }

    async fn create_workflow(&self, workflow: &NewWorkflow) -> Result<Workflow, Error> {
        workflow.validate()?;

        let conn = self.pool.get().await?;
        let steps = serde_json::to_value(&workflow.steps)?;

        let row = conn
            .query_one(
                &format!(
                    "INSERT INTO workflows (name, description, steps, is_active, \
                     schedule_enabled, schedule_interval) VALUES ($1, $2, $3, $4, $5, $6) \
                     RETURNING {}",
                    WORKFLOW_COLUMNS
                ),
                &[
                    &workflow.name,
                    &workflow.description,
                    &steps,
                    &workflow.is_active,
                    &workflow.schedule_enabled,
                    &workflow.schedule_interval,
                ],
            )
            .await
            .map_err(|err| {
                write_error(
                    err,
                    &format!("workflow \"{}\" already exists", workflow.name),
                    "workflow",
                )
            })?;

        workflow_from_row(&row)
    }

    async fn workflow(&self, id: i64) -> Result<Workflow, Error> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                &format!("SELECT {} FROM workflows WHERE id = $1", WORKFLOW_COLUMNS),
                &[&id],
            )
            .await?
            .ok_or_else(|| Error::not_found("workflow", id))?;

        workflow_from_row(&row)
    }

    async fn workflow_by_name(&self, name: &str) -> Result<Option<Workflow>, Error> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                &format!("SELECT {} FROM workflows WHERE name = $1", WORKFLOW_COLUMNS),
                &[&name],
            )
            .await?;

        row.as_ref().map(workflow_from_row).transpose()
    }

    async fn workflows(&self) -> Result<Vec<Workflow>, Error> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                &format!("SELECT {} FROM workflows ORDER BY id", WORKFLOW_COLUMNS),
                &[],
            )
            .await?;

        rows.iter().map(workflow_from_row).collect()
    }

    async fn scheduled_workflows(&self) -> Result<Vec<Workflow>, Error> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM workflows WHERE is_active AND schedule_enabled \
                     AND schedule_interval IS NOT NULL ORDER BY id",
                    WORKFLOW_COLUMNS
                ),
                &[],
            )
            .await?;

        rows.iter().map(workflow_from_row).collect()
    }

    async fn update_workflow(&self, id: i64, update: &WorkflowUpdate) -> Result<Workflow, Error> {
        if let Some(ref steps) = update.steps {
            validate_steps(steps)?;
        }

        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;

        let row = tx
            .query_opt(
                &format!(
                    "SELECT {} FROM workflows WHERE id = $1 FOR UPDATE",
                    WORKFLOW_COLUMNS
                ),
                &[&id],
            )
            .await?
            .ok_or_else(|| Error::not_found("workflow", id))?;

        let mut workflow = workflow_from_row(&row)?;
        apply_workflow_update(&mut workflow, update);

        if workflow.schedule_enabled && workflow.schedule_interval.unwrap_or(0) <= 0 {
            return Err(Error::Validation(
                "scheduled workflows require a positive schedule_interval".into(),
            ));
        }

        let steps = serde_json::to_value(&workflow.steps)?;
        tx.execute(
            "UPDATE workflows SET name = $2, description = $3, steps = $4, is_active = $5, \
             schedule_enabled = $6, schedule_interval = $7 WHERE id = $1",
            &[
                &id,
                &workflow.name,
                &workflow.description,
                &steps,
                &workflow.is_active,
                &workflow.schedule_enabled,
                &workflow.schedule_interval,
            ],
        )
        .await
        .map_err(|err| {
            write_error(
                err,
                &format!("workflow \"{}\" already exists", workflow.name),
                "workflow",
            )
        })?;

        tx.commit().await?;
        Ok(workflow)
    }

    async fn delete_workflow(&self, id: i64) -> Result<(), Error> {
        let conn = self.pool.get().await?;
        let deleted = conn
            .execute("DELETE FROM workflows WHERE id = $1", &[&id])
            .await?;

        if deleted == 0 {
            return Err(Error::not_found("workflow", id));
        }

        Ok(())
    }

    async fn create_variable(&self, variable: &NewVariable) -> Result<Variable, Error> {
        variable.validate()?;

        let conn = self.pool.get().await?;
        let row = conn
            .query_one(
                &format!(
                    "INSERT INTO variables (workflow_id, name, source, extract_method, \
                     extract_pattern, random_length, random_format, static_value, current_value) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8) RETURNING {}",
                    VARIABLE_COLUMNS
                ),
                &[
                    &variable.workflow_id,
                    &variable.name,
                    &variable.source.to_string(),
                    &variable.extract_method.to_string(),
                    &variable.extract_pattern,
                    &variable.random_length,
                    &variable.random_format,
                    &variable.static_value,
                ],
            )
            .await
            .map_err(|err| {
                write_error(
                    err,
                    &format!("variable \"{}\" already exists in this workflow", variable.name),
                    "workflow",
                )
            })?;

        variable_from_row(&row)
    }

    async fn variables(&self, workflow_id: i64) -> Result<Vec<Variable>, Error> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM variables WHERE workflow_id = $1 ORDER BY id",
                    VARIABLE_COLUMNS
                ),
                &[&workflow_id],
            )
            .await?;

        rows.iter().map(variable_from_row).collect()
    }

    async fn update_variable(&self, id: i64, update: &NewVariable) -> Result<Variable, Error> {
        update.validate()?;

        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                &format!(
                    "UPDATE variables SET name = $2, source = $3, extract_method = $4, \
                     extract_pattern = $5, random_length = $6, random_format = $7, \
                     static_value = $8 WHERE id = $1 RETURNING {}",
                    VARIABLE_COLUMNS
                ),
                &[
                    &id,
                    &update.name,
                    &update.source.to_string(),
                    &update.extract_method.to_string(),
                    &update.extract_pattern,
                    &update.random_length,
                    &update.random_format,
                    &update.static_value,
                ],
            )
            .await
            .map_err(|err| {
                write_error(
                    err,
                    &format!("variable \"{}\" already exists in this workflow", update.name),
                    "workflow",
                )
            })?
            .ok_or_else(|| Error::not_found("variable", id))?;

        variable_from_row(&row)
    }

    async fn delete_variable(&self, id: i64) -> Result<(), Error> {
        let conn = self.pool.get().await?;
        let deleted = conn
            .execute("DELETE FROM variables WHERE id = $1", &[&id])
            .await?;

        if deleted == 0 {
            return Err(Error::not_found("variable", id));
        }

        Ok(())
    }

    async fn insert_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> Result<WorkflowExecution, Error> {
        let conn = self.pool.get().await?;
        let step_results = serde_json::to_value(&execution.step_results)?;
        let variables = serde_json::to_value(&execution.variables_extracted)?;

        let row = conn
            .query_one(
                &format!(
                    "INSERT INTO workflow_executions (workflow_id, status, started_at, \
                     steps_total, steps_completed, step_results, variables_extracted) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {}",
                    EXECUTION_COLUMNS
                ),
                &[
                    &execution.workflow_id,
                    &execution.status.to_string(),
                    &execution.started_at,
                    &execution.steps_total,
                    &execution.steps_completed,
                    &step_results,
                    &variables,
                ],
            )
            .await
            .map_err(|err| write_error(err, "execution insert", "workflow"))?;

        execution_from_row(&row)
    }

    async fn running_execution_exists(&self, workflow_id: i64) -> Result<bool, Error> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM workflow_executions WHERE workflow_id = $1 \
                 AND status = 'running')",
                &[&workflow_id],
            )
            .await?;

        Ok(row.try_get(0)?)
    }

    async fn commit_step(
        &self,
        execution_id: i64,
        step: &StepResult,
        steps_completed: i32,
        variable_values: &[(i64, String, OffsetDateTime)],
    ) -> Result<(), Error> {
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;

        let appended = serde_json::to_value(vec![step])?;
        let updated = tx
            .execute(
                "UPDATE workflow_executions SET step_results = step_results || $2, \
                 steps_completed = $3 WHERE id = $1",
                &[&execution_id, &appended, &steps_completed],
            )
            .await?;
        if updated == 0 {
            return Err(Error::not_found("execution", execution_id));
        }

        for (variable_id, value, at) in variable_values {
            tx.execute(
                "UPDATE variables SET current_value = $2, last_extracted_at = $3 WHERE id = $1",
                &[variable_id, value, at],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn complete_execution(&self, execution: &WorkflowExecution) -> Result<(), Error> {
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;

        let step_results = serde_json::to_value(&execution.step_results)?;
        let variables = serde_json::to_value(&execution.variables_extracted)?;

        let updated = tx
            .execute(
                "UPDATE workflow_executions SET status = $2, completed_at = $3, \
                 duration_seconds = $4, steps_completed = $5, step_results = $6, \
                 variables_extracted = $7, error_message = $8, error_step = $9 WHERE id = $1",
                &[
                    &execution.id,
                    &execution.status.to_string(),
                    &execution.completed_at,
                    &execution.duration_seconds,
                    &execution.steps_completed,
                    &step_results,
                    &variables,
                    &execution.error_message,
                    &execution.error_step,
                ],
            )
            .await?;
        if updated == 0 {
            return Err(Error::not_found("execution", execution.id));
        }

        let last_executed_at = execution.completed_at.unwrap_or(execution.started_at);
        let statement = if execution.status == WorkflowStatus::Success {
            "UPDATE workflows SET execution_count = execution_count + 1, \
             success_count = success_count + 1, last_executed_at = $2, \
             last_execution_status = $3, last_execution_error = NULL WHERE id = $1"
        } else {
            "UPDATE workflows SET execution_count = execution_count + 1, \
             failure_count = failure_count + 1, last_executed_at = $2, \
             last_execution_status = $3, last_execution_error = $4 WHERE id = $1"
        };

        let updated = if execution.status == WorkflowStatus::Success {
            tx.execute(
                statement,
                &[
                    &execution.workflow_id,
                    &last_executed_at,
                    &execution.status.to_string(),
                ],
            )
            .await?
        } else {
            tx.execute(
                statement,
                &[
                    &execution.workflow_id,
                    &last_executed_at,
                    &execution.status.to_string(),
                    &execution.error_message,
                ],
            )
            .await?
        };
        if updated == 0 {
            return Err(Error::not_found("workflow", execution.workflow_id));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn execution(&self, id: i64) -> Result<WorkflowExecution, Error> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT {} FROM workflow_executions WHERE id = $1",
                    EXECUTION_COLUMNS
                ),
                &[&id],
            )
            .await?
            .ok_or_else(|| Error::not_found("execution", id))?;

        execution_from_row(&row)
    }

    async fn executions(&self, workflow_id: i64) -> Result<Vec<WorkflowExecution>, Error> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM workflow_executions WHERE workflow_id = $1 \
                     ORDER BY started_at",
                    EXECUTION_COLUMNS
                ),
                &[&workflow_id],
            )
            .await?;

        rows.iter().map(execution_from_row).collect()
    }
}
