use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Body accepted by `POST /run-code`.
///
/// `stdin` is optional; when omitted the program sees an already-closed,
/// empty input stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCodeRequest {
    pub code: String,
    pub language: String,
    #[serde(default)]
    pub stdin: Option<String>,
}

/// Which child process produced the reported output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Compile,
    Run,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Compile => write!(f, "compile"),
            Phase::Run => write!(f, "run"),
        }
    }
}

/// Successful response. A user program exiting nonzero still produces this
/// shape; `error` carries its stderr, not a transport failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCodeResponse {
    pub output: String,
    pub error: String,
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub phase: Phase,
    #[serde(default)]
    pub output_truncated: bool,
    #[serde(default)]
    pub error_truncated: bool,
    pub request_id: Uuid,
    pub started_at: DateTime<Utc>,
}

/// Error payload for 4xx/5xx responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}

/// Entry returned by `GET /languages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageInfo {
    pub id: String,
    pub name: String,
    pub aliases: Vec<String>,
    pub extension: String,
    pub compiled: bool,
}
