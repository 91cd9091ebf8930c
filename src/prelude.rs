//! Commonly used types, importable in one statement:
//!
//! ```
//! use vigil::prelude::*;
//! ```
pub use crate::config::{get_config, Config};
pub use crate::error::Error;
pub use crate::executor::{RunOutcome, WatcherExecutor, WorkflowExecutor};
pub use crate::http::{HttpClient, HttpResponse, RequestTemplate, SetCookie};
pub use crate::logging::Logger;
pub use crate::model::{
    ChangeLog, ChangeType, ComparisonMode, Cookie, ExecutionMode, Header, HttpMethod, NewVariable,
    NewWatcher, NewWorkflow, Snapshot, Variable, Watcher, WatcherStatus, WatcherUpdate, Workflow,
    WorkflowExecution, WorkflowStatus, WorkflowStep, WorkflowUpdate,
};
pub use crate::notify::{LogNotifier, Notification, Notifier};
pub use crate::scheduler::Scheduler;
pub use crate::storage::{
    ChangeLogFilter, ChangeLogStatistics, GroupBy, MemoryStorage, OrderBy, OrderDirection,
    PostgresStorage, StatisticsParams, Storage,
};
pub use crate::vars::Context;
