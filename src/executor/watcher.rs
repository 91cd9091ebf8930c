//! Watcher executor: one watcher, one request, one classified observation.
use std::sync::Arc;
use tracing::{error, info};

use crate::change::detect;
use crate::error::Error;
use crate::http::{HttpClient, RequestTemplate};
use crate::model::{ChangeType, Watcher};
use crate::notify::{deliver_best_effort, Notification, Notifier};
use crate::storage::Storage;

/// Result of one watcher run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub watcher_id: i64,
    /// HTTP status, absent when the request itself failed.
    pub http_status: Option<u16>,
    pub size: i64,
    pub change_type: ChangeType,
}

/// Executes watchers: assembles the request, forwards stored cookies,
/// feeds the response through change detection, and keeps the watcher's
/// status and counters current.
pub struct WatcherExecutor {
    storage: Arc<dyn Storage>,
    client: HttpClient,
    notifier: Arc<dyn Notifier>,
}

impl WatcherExecutor {
    pub fn new(storage: Arc<dyn Storage>, client: HttpClient, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            storage,
            client,
            notifier,
        }
    }

    /// One-shot execution by id, for manual runs.
    pub async fn run_by_id(&self, id: i64) -> Result<RunOutcome, Error> {
        let watcher = self.storage.watcher(id).await?;
        self.storage.mark_watcher_running(watcher.id).await?;
        self.run(&watcher).await
    }

    /// Execute one watcher run. Transport failures are recorded as
    /// `error` observations and returned as a normal outcome; only
    /// storage failures surface as errors.
    pub async fn run(&self, watcher: &Watcher) -> Result<RunOutcome, Error> {
        info!("executing watcher {} ({})", watcher.id, watcher.name);

        // Cookies earned by another watcher, when chained.
        let cookies = match (watcher.use_cookies, watcher.cookie_watcher_id) {
            (true, Some(cookie_watcher_id)) => self.storage.cookies(cookie_watcher_id).await?,
            _ => vec![],
        };

        let template = RequestTemplate::from(watcher);

        let response = match self.client.execute(&template, &cookies).await {
            Ok(response) => response,
            Err(err) => {
                error!("watcher {} failed: {}", watcher.name, err);
                self.storage
                    .commit_error(watcher.id, &err.to_string(), None)
                    .await?;

                return Ok(RunOutcome {
                    watcher_id: watcher.id,
                    http_status: None,
                    size: 0,
                    change_type: ChangeType::Error,
                });
            }
        };

        if watcher.save_cookies {
            self.storage
                .replace_cookies(watcher.id, &response.cookies)
                .await?;
            info!(
                "saved {} cookies for watcher {}",
                response.cookies.len(),
                watcher.name
            );
        }

        let snapshot = self.storage.snapshot(watcher.id).await?;
        let detection = detect(snapshot.as_ref(), &response.body, watcher.comparison_mode);
        let log = self
            .storage
            .commit_check(
                watcher.id,
                &detection,
                &response.body,
                response.content_type.as_deref(),
            )
            .await?;

        if matches!(log.change_type, ChangeType::New | ChangeType::Modified) {
            deliver_best_effort(
                self.notifier.as_ref(),
                Notification::WatcherChanged {
                    watcher_id: watcher.id,
                    change_type: log.change_type,
                    new_size: detection.new_size,
                },
            )
            .await;
        }

        info!(
            "watcher {} checked: HTTP {}, {} bytes, {}",
            watcher.name, response.status, detection.new_size, log.change_type
        );

        Ok(RunOutcome {
            watcher_id: watcher.id,
            http_status: Some(response.status),
            size: detection.new_size,
            change_type: log.change_type,
        })
    }
}
