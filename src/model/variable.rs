//! Workflow-scoped variables: named extraction and substitution rules.
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::Error;

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("variable name regex"));

/// Where a variable's value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableSource {
    ResponseBody,
    ResponseHeader,
    Cookie,
    Static,
    Random,
}

impl std::fmt::Display for VariableSource {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::ResponseBody => write!(f, "response_body"),
            Self::ResponseHeader => write!(f, "response_header"),
            Self::Cookie => write!(f, "cookie"),
            Self::Static => write!(f, "static"),
            Self::Random => write!(f, "random"),
        }
    }
}

impl std::str::FromStr for VariableSource {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "response_body" => Ok(Self::ResponseBody),
            "response_header" => Ok(Self::ResponseHeader),
            "cookie" => Ok(Self::Cookie),
            "static" => Ok(Self::Static),
            "random" => Ok(Self::Random),
            _ => Err("unknown variable source"),
        }
    }
}

/// How the value is pulled out of the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractMethod {
    JsonPath,
    Regex,
    CookieValue,
    HeaderValue,
    FullBody,
    RandomString,
    RandomNumber,
    RandomUuid,
}

impl std::fmt::Display for ExtractMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::JsonPath => write!(f, "json_path"),
            Self::Regex => write!(f, "regex"),
            Self::CookieValue => write!(f, "cookie_value"),
            Self::HeaderValue => write!(f, "header_value"),
            Self::FullBody => write!(f, "full_body"),
            Self::RandomString => write!(f, "random_string"),
            Self::RandomNumber => write!(f, "random_number"),
            Self::RandomUuid => write!(f, "random_uuid"),
        }
    }
}

impl std::str::FromStr for ExtractMethod {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json_path" => Ok(Self::JsonPath),
            "regex" => Ok(Self::Regex),
            "cookie_value" => Ok(Self::CookieValue),
            "header_value" => Ok(Self::HeaderValue),
            "full_body" => Ok(Self::FullBody),
            "random_string" => Ok(Self::RandomString),
            "random_number" => Ok(Self::RandomNumber),
            "random_uuid" => Ok(Self::RandomUuid),
            _ => Err("unknown extract method"),
        }
    }
}

/// A named extraction/substitution rule scoped to one workflow.
/// `(workflow_id, name)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    pub id: i64,
    pub workflow_id: i64,
    pub name: String,
    pub source: VariableSource,
    pub extract_method: ExtractMethod,
    /// JSON path, regex, header name, or cookie name, depending on the
    /// extract method.
    pub extract_pattern: Option<String>,
    pub random_length: Option<i64>,
    pub random_format: Option<String>,
    pub static_value: Option<String>,
    pub current_value: Option<String>,
    pub last_extracted_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

/// Payload for creating a variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewVariable {
    pub workflow_id: i64,
    pub name: String,
    pub source: VariableSource,
    pub extract_method: ExtractMethod,
    #[serde(default)]
    pub extract_pattern: Option<String>,
    #[serde(default)]
    pub random_length: Option<i64>,
    #[serde(default)]
    pub random_format: Option<String>,
    #[serde(default)]
    pub static_value: Option<String>,
}

impl NewVariable {
    pub fn validate(&self) -> Result<(), Error> {
        if !NAME_RE.is_match(&self.name) {
            return Err(Error::Validation(format!(
                "invalid variable name \"{}\"",
                self.name
            )));
        }

        Ok(())
    }
}
