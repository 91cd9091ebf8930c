//! Schema bootstrap.
//!
//! Idempotent DDL executed at startup when the Postgres backend is used.
//! Cascade rules mirror the entity relationships: deleting a watcher
//! removes its cookies, snapshot, and change logs; deleting a workflow
//! removes its variables and executions.
use tracing::info;

use super::pool::Pool;
use crate::error::Error;

const BOOTSTRAP: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS watchers (
        id BIGSERIAL PRIMARY KEY,
        name VARCHAR(255) NOT NULL UNIQUE,
        url TEXT NOT NULL,
        method VARCHAR(10) NOT NULL DEFAULT 'GET',
        headers JSONB NOT NULL DEFAULT '[]',
        body BYTEA,
        execution_mode VARCHAR(10) NOT NULL DEFAULT 'scheduled',
        watch_interval BIGINT,
        is_active BOOLEAN NOT NULL DEFAULT true,
        save_cookies BOOLEAN NOT NULL DEFAULT false,
        use_cookies BOOLEAN NOT NULL DEFAULT false,
        cookie_watcher_id BIGINT REFERENCES watchers(id) ON DELETE SET NULL,
        comparison_mode VARCHAR(16) NOT NULL DEFAULT 'hash',
        status VARCHAR(10) NOT NULL DEFAULT 'pending',
        error_message TEXT,
        check_count BIGINT NOT NULL DEFAULT 0,
        change_count BIGINT NOT NULL DEFAULT 0,
        last_checked_at TIMESTAMPTZ,
        last_changed_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS snapshots (
        id BIGSERIAL PRIMARY KEY,
        watcher_id BIGINT NOT NULL UNIQUE REFERENCES watchers(id) ON DELETE CASCADE,
        content BYTEA NOT NULL,
        content_hash VARCHAR(64) NOT NULL,
        content_size BIGINT NOT NULL,
        content_type TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS change_logs (
        id BIGSERIAL PRIMARY KEY,
        watcher_id BIGINT NOT NULL REFERENCES watchers(id) ON DELETE CASCADE,
        change_type VARCHAR(10) NOT NULL,
        old_hash VARCHAR(64),
        new_hash VARCHAR(64),
        old_size BIGINT,
        new_size BIGINT,
        old_content BYTEA,
        new_content BYTEA,
        diff BYTEA,
        error_message TEXT,
        detected_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    r#"CREATE INDEX IF NOT EXISTS change_logs_watcher_detected
        ON change_logs (watcher_id, detected_at)"#,
    r#"CREATE TABLE IF NOT EXISTS cookies (
        id BIGSERIAL PRIMARY KEY,
        watcher_id BIGINT NOT NULL REFERENCES watchers(id) ON DELETE CASCADE,
        name VARCHAR(255) NOT NULL,
        value TEXT NOT NULL,
        domain VARCHAR(255),
        path VARCHAR(255),
        expires TIMESTAMPTZ,
        secure BOOLEAN NOT NULL DEFAULT false,
        http_only BOOLEAN NOT NULL DEFAULT false,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (watcher_id, name)
    )"#,
    r#"CREATE INDEX IF NOT EXISTS cookies_expires ON cookies (expires)"#,
    r#"CREATE TABLE IF NOT EXISTS workflows (
        id BIGSERIAL PRIMARY KEY,
        name VARCHAR(255) NOT NULL UNIQUE,
        description TEXT,
        steps JSONB NOT NULL DEFAULT '[]',
        is_active BOOLEAN NOT NULL DEFAULT true,
        schedule_enabled BOOLEAN NOT NULL DEFAULT false,
        schedule_interval BIGINT,
        execution_count BIGINT NOT NULL DEFAULT 0,
        success_count BIGINT NOT NULL DEFAULT 0,
        failure_count BIGINT NOT NULL DEFAULT 0,
        last_executed_at TIMESTAMPTZ,
        last_execution_status VARCHAR(10),
        last_execution_error TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS variables (
        id BIGSERIAL PRIMARY KEY,
        workflow_id BIGINT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
        name VARCHAR(255) NOT NULL,
        source VARCHAR(20) NOT NULL,
        extract_method VARCHAR(20) NOT NULL,
        extract_pattern TEXT,
        random_length BIGINT,
        random_format VARCHAR(255),
        static_value TEXT,
        current_value TEXT,
        last_extracted_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (workflow_id, name)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS workflow_executions (
        id BIGSERIAL PRIMARY KEY,
        workflow_id BIGINT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
        status VARCHAR(10) NOT NULL DEFAULT 'running',
        started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        completed_at TIMESTAMPTZ,
        duration_seconds DOUBLE PRECISION,
        steps_total INTEGER NOT NULL DEFAULT 0,
        steps_completed INTEGER NOT NULL DEFAULT 0,
        step_results JSONB NOT NULL DEFAULT '[]',
        variables_extracted JSONB NOT NULL DEFAULT '{}',
        error_message TEXT,
        error_step INTEGER
    )"#,
    r#"CREATE INDEX IF NOT EXISTS workflow_executions_workflow_started
        ON workflow_executions (workflow_id, started_at)"#,
];

/// Create the schema if it doesn't exist yet.
pub async fn bootstrap(pool: &Pool) -> Result<(), Error> {
    let conn = pool.get().await?;

    for statement in BOOTSTRAP {
        conn.execute(*statement, &[]).await?;
    }

    info!("database schema ready");

    Ok(())
}
