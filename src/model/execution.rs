//! Workflow execution records.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use time::OffsetDateTime;

/// Aggregate result of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Success,
    Failed,
    /// Some steps failed but execution continued past them.
    Partial,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Partial => write!(f, "partial"),
        }
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "partial" => Ok(Self::Partial),
            _ => Err("unknown workflow status"),
        }
    }
}

/// Outcome of one executed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
}

/// Per-step record embedded in the execution row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub order: i32,
    pub watcher_id: i64,
    pub status: StepStatus,
    pub response_status: Option<u16>,
    #[serde(default)]
    pub variables_extracted: HashMap<String, String>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// One row per workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: i64,
    pub workflow_id: i64,
    pub status: WorkflowStatus,
    pub started_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
    pub duration_seconds: Option<f64>,
    pub steps_total: i32,
    pub steps_completed: i32,
    pub step_results: Vec<StepResult>,
    /// Final variable context when the execution finished.
    #[serde(default)]
    pub variables_extracted: HashMap<String, String>,
    pub error_message: Option<String>,
    /// Order of the step that latched the failure, if any.
    pub error_step: Option<i32>,
}
