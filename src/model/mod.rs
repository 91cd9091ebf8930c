//! Entity types and run-time enums.
//!
//! One file per entity, mirroring the persistent schema. Creation payloads
//! (`NewWatcher`, `NewWorkflow`, `NewVariable`) carry the validation rules;
//! the storage backends enforce uniqueness and referential invariants.
use serde::{Deserialize, Serialize};

pub mod change_log;
pub mod cookie;
pub mod execution;
pub mod snapshot;
pub mod variable;
pub mod watcher;
pub mod workflow;

pub use change_log::{ChangeLog, ChangeType};
pub use cookie::Cookie;
pub use execution::{StepResult, StepStatus, WorkflowExecution, WorkflowStatus};
pub use snapshot::Snapshot;
pub use variable::{ExtractMethod, NewVariable, Variable, VariableSource};
pub use watcher::{
    ComparisonMode, ExecutionMode, NewWatcher, Watcher, WatcherStatus, WatcherUpdate,
};
pub use workflow::{NewWorkflow, Workflow, WorkflowStep, WorkflowUpdate};

/// HTTP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    /// Methods that carry a request body.
    pub fn has_body(&self) -> bool {
        matches!(self, Self::Post | Self::Put | Self::Patch)
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
            Self::Put => write!(f, "PUT"),
            Self::Patch => write!(f, "PATCH"),
            Self::Delete => write!(f, "DELETE"),
            Self::Head => write!(f, "HEAD"),
            Self::Options => write!(f, "OPTIONS"),
        }
    }
}

impl std::str::FromStr for HttpMethod {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            "HEAD" => Ok(Self::Head),
            "OPTIONS" => Ok(Self::Options),
            _ => Err("unknown HTTP method"),
        }
    }
}

/// One request header. Headers keep their configured order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Case-insensitive header lookup.
pub fn header_value<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case(name))
        .map(|header| header.value.as_str())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_method_roundtrip() {
        for method in ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"] {
            let parsed: HttpMethod = method.parse().unwrap();
            assert_eq!(parsed.to_string(), method);
        }
        assert!("TRACE".parse::<HttpMethod>().is_err());
    }

    #[test]
    fn test_header_lookup() {
        let headers = vec![
            Header::new("Content-Type", "application/json"),
            Header::new("X-Token", "abc"),
        ];
        assert_eq!(
            header_value(&headers, "content-type"),
            Some("application/json")
        );
        assert_eq!(header_value(&headers, "missing"), None);
    }
}
