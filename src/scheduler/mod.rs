//! The scheduler: tick loop, bounded worker pool, cookie maintenance.
//!
//! One scheduler value is owned by the process entry point and started in
//! a background task. Each tick it dispatches due watchers and workflows
//! onto the worker pool, bounded by a semaphore; an in-memory in-flight
//! set guarantees a watcher or workflow never runs concurrently with
//! itself. Shutdown broadcasts a cancel signal, refuses new dispatches,
//! and drains in-flight runs within a grace period.
pub mod schedule;

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::select;
use tokio::sync::{watch, Semaphore};
use tokio::time::{interval, timeout};
use tracing::{error, info, warn};

use crate::colors::MaybeColorize;
use crate::config::Config;
use crate::error::Error;
use crate::executor::{WatcherExecutor, WorkflowExecutor};
use crate::http::HttpClient;
use crate::model::{Cookie, Watcher, Workflow};
use crate::notify::{deliver_best_effort, Notification, Notifier};
use crate::storage::Storage;
use schedule::JobSchedule;

/// Scheduler over a storage backend and the two executors.
#[derive(Clone)]
pub struct Scheduler {
    storage: Arc<dyn Storage>,
    watcher_executor: Arc<WatcherExecutor>,
    workflow_executor: Arc<WorkflowExecutor>,
    notifier: Arc<dyn Notifier>,
    pool: Arc<Semaphore>,
    pool_size: usize,
    running_watchers: Arc<Mutex<HashSet<i64>>>,
    running_workflows: Arc<Mutex<HashSet<i64>>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    tick_interval: Duration,
    run_timeout: Duration,
    warn_hours: i64,
    notify_hours: i64,
    cleanup_at: (u8, u8),
}

impl Scheduler {
    pub fn new(
        storage: Arc<dyn Storage>,
        notifier: Arc<dyn Notifier>,
        config: &Config,
    ) -> Result<Self, Error> {
        let client = HttpClient::new(&config.http)?;
        let (shutdown_tx, _) = watch::channel(false);
        let pool_size = config.scheduler.pool_size.max(1);

        Ok(Self {
            watcher_executor: Arc::new(WatcherExecutor::new(
                storage.clone(),
                client.clone(),
                notifier.clone(),
            )),
            workflow_executor: Arc::new(WorkflowExecutor::new(storage.clone(), client)),
            storage,
            notifier,
            pool: Arc::new(Semaphore::new(pool_size)),
            pool_size,
            running_watchers: Arc::new(Mutex::new(HashSet::new())),
            running_workflows: Arc::new(Mutex::new(HashSet::new())),
            shutdown_tx: Arc::new(shutdown_tx),
            tick_interval: config.scheduler.tick_interval(),
            run_timeout: config.scheduler.run_timeout(&config.http),
            warn_hours: config.cookie.expiring_warn_hours,
            notify_hours: config.cookie.expiring_notify_hours,
            cleanup_at: config.cookie.cleanup_time()?,
        })
    }

    /// Watcher executor, for one-shot runs from the control surface.
    pub fn watcher_executor(&self) -> &WatcherExecutor {
        &self.watcher_executor
    }

    /// Workflow executor, for synchronous runs from the control surface.
    pub fn workflow_executor(&self) -> &WorkflowExecutor {
        &self.workflow_executor
    }

    /// Start the scheduler in a background task. Returns immediately.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.run().await;
        })
    }

    /// Signal shutdown: no new dispatches, in-flight runs are cancelled
    /// at their next suspension point and drained.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Run the scheduler loop. Returns after shutdown has drained.
    pub async fn run(&self) {
        info!(
            "scheduler started (tick {:?}, pool size {})",
            self.tick_interval, self.pool_size
        );

        let mut clock = interval(self.tick_interval);
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut maintenance = MaintenanceClock::new(self.cleanup_at);

        loop {
            select! {
                _ = clock.tick() => {
                    let now = OffsetDateTime::now_utc();
                    self.dispatch_watchers(now).await;
                    self.dispatch_workflows(now).await;
                    maintenance.tick(self, now).await;
                }

                _ = shutdown.changed() => {
                    break;
                }
            }
        }

        self.drain().await;
    }

    /// Execute a workflow in the background, outside its schedule.
    pub fn execute_workflow_background(&self, workflow: Workflow) {
        if !self.running_workflows.lock().insert(workflow.id) {
            warn!(
                "workflow {} is already running, skipping",
                workflow.name.yellow()
            );
            return;
        }
        self.spawn_workflow_run(workflow);
    }

    /// Run a watcher in the background, outside its schedule.
    pub fn run_watcher_background(&self, watcher: Watcher) {
        if !self.running_watchers.lock().insert(watcher.id) {
            warn!(
                "watcher {} is already running, skipping",
                watcher.name.yellow()
            );
            return;
        }
        self.spawn_watcher_run(watcher);
    }

    async fn dispatch_watchers(&self, now: OffsetDateTime) {
        let watchers = match self.storage.scheduled_watchers().await {
            Ok(watchers) => watchers,
            Err(err) => {
                error!("scheduler failed to load watchers: {}", err);
                return;
            }
        };

        for watcher in watchers {
            if !watcher.is_due(now) {
                continue;
            }

            // A watcher never overlaps itself.
            if !self.running_watchers.lock().insert(watcher.id) {
                continue;
            }

            self.spawn_watcher_run(watcher);
        }
    }

    fn spawn_watcher_run(&self, watcher: Watcher) {
        let scheduler = self.clone();

        tokio::spawn(async move {
            let permit = match scheduler.pool.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            if *scheduler.shutdown_tx.borrow() {
                scheduler.running_watchers.lock().remove(&watcher.id);
                return;
            }

            if let Err(err) = scheduler.storage.mark_watcher_running(watcher.id).await {
                error!("watcher {} could not be marked running: {}", watcher.id, err);
                scheduler.running_watchers.lock().remove(&watcher.id);
                return;
            }

            let mut shutdown = scheduler.shutdown_tx.subscribe();
            let name = watcher.name.clone();
            let started = Instant::now();

            select! {
                result = timeout(scheduler.run_timeout, scheduler.watcher_executor.run(&watcher)) => {
                    match result {
                        Ok(Ok(outcome)) => {
                            info!(
                                "watcher {} run finished: {} ({:.3} ms)",
                                name.green(),
                                outcome.change_type,
                                started.elapsed().as_secs_f64() * 1000.0
                            );
                        }
                        Ok(Err(err)) => {
                            error!("watcher {} run failed: {}", name.green(), err);
                        }
                        Err(_) => {
                            let err = Error::Timeout(scheduler.run_timeout.as_secs());
                            error!("watcher {} {}", name.green(), err);
                            scheduler.finalize_aborted_watcher(watcher.id, &err.to_string()).await;
                        }
                    }
                }

                _ = shutdown.changed() => {
                    scheduler.finalize_aborted_watcher(watcher.id, "cancelled").await;
                }
            }

            drop(permit);
            scheduler.running_watchers.lock().remove(&watcher.id);
        });
    }

    /// Record a cancelled or timed-out run as an `error` observation.
    async fn finalize_aborted_watcher(&self, watcher_id: i64, reason: &str) {
        if let Err(err) = self.storage.commit_error(watcher_id, reason, None).await {
            error!("watcher {} could not be finalized: {}", watcher_id, err);
        }
    }

    async fn dispatch_workflows(&self, now: OffsetDateTime) {
        let workflows = match self.storage.scheduled_workflows().await {
            Ok(workflows) => workflows,
            Err(err) => {
                error!("scheduler failed to load workflows: {}", err);
                return;
            }
        };

        for workflow in workflows {
            if !workflow.is_due(now) {
                continue;
            }

            if !self.running_workflows.lock().insert(workflow.id) {
                continue;
            }

            // Two concurrent executions of one workflow are not allowed,
            // even across processes.
            match self.storage.running_execution_exists(workflow.id).await {
                Ok(false) => (),
                Ok(true) => {
                    self.running_workflows.lock().remove(&workflow.id);
                    continue;
                }
                Err(err) => {
                    error!("scheduler failed to check workflow {}: {}", workflow.id, err);
                    self.running_workflows.lock().remove(&workflow.id);
                    continue;
                }
            }

            self.spawn_workflow_run(workflow);
        }
    }

    fn spawn_workflow_run(&self, workflow: Workflow) {
        let scheduler = self.clone();

        tokio::spawn(async move {
            let permit = match scheduler.pool.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            if *scheduler.shutdown_tx.borrow() {
                scheduler.running_workflows.lock().remove(&workflow.id);
                return;
            }

            let cancel = scheduler.shutdown_tx.subscribe();
            let deadline = Instant::now() + scheduler.run_timeout;
            let name = workflow.name.clone();

            match scheduler
                .workflow_executor
                .execute_controlled(&workflow, None, Some(cancel), Some(deadline))
                .await
            {
                Ok(execution) => {
                    info!(
                        "workflow {} run finished: {}",
                        name.green(),
                        execution.status
                    );
                }
                Err(err) => {
                    error!("workflow {} run failed: {}", name.green(), err);
                }
            }

            drop(permit);
            scheduler.running_workflows.lock().remove(&workflow.id);
        });
    }

    /// Wait for in-flight runs to finalize, up to the grace period.
    async fn drain(&self) {
        info!("scheduler shutting down, draining in-flight runs");

        let grace = self.run_timeout * 2;
        match timeout(grace, self.pool.clone().acquire_many_owned(self.pool_size as u32)).await {
            Ok(_) => info!("scheduler drained"),
            Err(_) => warn!("scheduler shutdown grace period expired"),
        }
    }

    // Maintenance jobs.

    /// Warn about cookies expiring soon.
    async fn check_expiring_cookies(&self, now: OffsetDateTime) {
        let cookies = match self.storage.cookies_expiring_within(self.warn_hours).await {
            Ok(cookies) => cookies,
            Err(err) => {
                error!("cookie expiry check failed: {}", err);
                return;
            }
        };

        if cookies.is_empty() {
            info!("no cookies expiring within {} hours", self.warn_hours);
            return;
        }

        for cookie in &cookies {
            let hours_left = cookie
                .expires_in_seconds(now)
                .map(|seconds| seconds / 3600)
                .unwrap_or(0);
            warn!(
                "cookie \"{}\" (watcher {}) expires in {} hours",
                cookie.name, cookie.watcher_id, hours_left
            );
        }
    }

    /// Emit one `cookie_expiring` event per watcher with expiring cookies.
    async fn notify_expiring_cookies(&self) {
        let cookies = match self.storage.cookies_expiring_within(self.notify_hours).await {
            Ok(cookies) => cookies,
            Err(err) => {
                error!("cookie notification scan failed: {}", err);
                return;
            }
        };

        if cookies.is_empty() {
            return;
        }

        let mut by_watcher: BTreeMap<i64, Vec<&Cookie>> = BTreeMap::new();
        for cookie in &cookies {
            by_watcher.entry(cookie.watcher_id).or_default().push(cookie);
        }

        for (watcher_id, group) in by_watcher {
            let earliest_expiry = match group.iter().filter_map(|cookie| cookie.expires).min() {
                Some(expiry) => expiry,
                None => continue,
            };

            deliver_best_effort(
                self.notifier.as_ref(),
                Notification::CookieExpiring {
                    watcher_id,
                    cookie_count: group.len(),
                    earliest_expiry,
                },
            )
            .await;
        }
    }

    /// Delete expired cookies.
    async fn cleanup_expired_cookies(&self) {
        match self.storage.delete_expired_cookies().await {
            Ok(0) => info!("no expired cookies to delete"),
            Ok(count) => info!("deleted {} expired cookies", count),
            Err(err) => error!("expired cookie cleanup failed: {}", err),
        }
    }
}

/// Tracks when each maintenance job last ran.
struct MaintenanceClock {
    jobs: [(JobSchedule, MaintenanceJob, Option<OffsetDateTime>); 3],
}

#[derive(Clone, Copy)]
enum MaintenanceJob {
    WarnExpiring,
    NotifyExpiring,
    CleanupExpired,
}

impl MaintenanceClock {
    fn new(cleanup_at: (u8, u8)) -> Self {
        Self {
            jobs: [
                (
                    JobSchedule::Every(time::Duration::hours(1)),
                    MaintenanceJob::WarnExpiring,
                    None,
                ),
                (
                    JobSchedule::Every(time::Duration::hours(6)),
                    MaintenanceJob::NotifyExpiring,
                    None,
                ),
                (
                    JobSchedule::DailyAt {
                        hour: cleanup_at.0,
                        minute: cleanup_at.1,
                    },
                    MaintenanceJob::CleanupExpired,
                    None,
                ),
            ],
        }
    }

    async fn tick(&mut self, scheduler: &Scheduler, now: OffsetDateTime) {
        for (schedule, job, last_run) in self.jobs.iter_mut() {
            if !schedule.due(*last_run, now) {
                continue;
            }
            *last_run = Some(now);

            match job {
                MaintenanceJob::WarnExpiring => scheduler.check_expiring_cookies(now).await,
                MaintenanceJob::NotifyExpiring => scheduler.notify_expiring_cookies().await,
                MaintenanceJob::CleanupExpired => scheduler.cleanup_expired_cookies().await,
            }
        }
    }
}
