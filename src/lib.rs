//! Vigil is a web-resource watcher and workflow engine. It periodically
//! executes HTTP requests against configured endpoints ("watchers"),
//! detects and records content changes with diffs, maintains per-watcher
//! cookie jars for authentication chaining, and runs ordered multi-step
//! request workflows in which values extracted from one response
//! parameterize the next.
//!
//! # Getting started
//!
//! The engine is driven by a [`scheduler::Scheduler`] owned by the process
//! entry point:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vigil::config::Config;
//! use vigil::notify::LogNotifier;
//! use vigil::scheduler::Scheduler;
//! use vigil::storage::MemoryStorage;
//!
//! # async fn example() -> Result<(), vigil::Error> {
//! let storage = Arc::new(MemoryStorage::new());
//! let scheduler = Scheduler::new(storage, Arc::new(LogNotifier), Config::get())?;
//! scheduler.start();
//! # Ok(())
//! # }
//! ```
//!
//! Watchers and workflows are managed through the [`storage::Storage`]
//! contract; one-shot runs go through the executors the scheduler exposes.
pub mod change;
pub mod colors;
pub mod config;
pub mod error;
pub mod executor;
pub mod http;
pub mod logging;
pub mod model;
pub mod notify;
pub mod prelude;
pub mod scheduler;
pub mod storage;
pub mod vars;

pub use error::Error;

/// Wrapper around async traits to make them easy to use.
pub use async_trait::async_trait;
/// Serde is used for (de)serialization.
pub use serde;
/// Tokio is an asynchronous runtime for Rust.
pub use tokio;
