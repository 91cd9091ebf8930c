//! Process entry point: configuration, logging, storage backend
//! selection, scheduler.
use std::sync::Arc;

use vigil::config::Config;
use vigil::logging::Logger;
use vigil::notify::LogNotifier;
use vigil::scheduler::Scheduler;
use vigil::storage::{MemoryStorage, PostgresStorage, Storage};
use vigil::Error;

use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Error> {
    Logger::init();

    let config = Config::get();

    let storage: Arc<dyn Storage> = match config.database.database_url() {
        Some(url) => {
            info!("using Postgres storage");
            Arc::new(PostgresStorage::connect(&url, &config.database).await?)
        }
        None => {
            warn!("no database configured, state will not survive a restart");
            Arc::new(MemoryStorage::new())
        }
    };

    let scheduler = Scheduler::new(storage, Arc::new(LogNotifier), config)?;
    let handle = scheduler.start();

    tokio::signal::ctrl_c().await?;

    scheduler.shutdown();
    let _ = handle.await;

    Ok(())
}
