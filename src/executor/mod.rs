//! Watcher and workflow executors.
pub mod watcher;
pub mod workflow;

pub use watcher::{RunOutcome, WatcherExecutor};
pub use workflow::WorkflowExecutor;
