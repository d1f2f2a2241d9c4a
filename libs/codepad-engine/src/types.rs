use chrono::{DateTime, Utc};
use codepad_common::types::{Phase, RunCodeRequest, RunCodeResponse};
use serde::Serialize;
use uuid::Uuid;

/// A single submission: source text, the language to run it as, and the bytes
/// to feed on standard input.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub language: String,
    pub source: Vec<u8>,
    pub stdin: Option<Vec<u8>>,
}

impl ExecutionRequest {
    pub fn new(language: impl Into<String>, source: impl Into<Vec<u8>>) -> Self {
        Self {
            language: language.into(),
            source: source.into(),
            stdin: None,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }
}

impl From<RunCodeRequest> for ExecutionRequest {
    fn from(req: RunCodeRequest) -> Self {
        Self {
            language: req.language,
            source: req.code.into_bytes(),
            stdin: req.stdin.map(String::into_bytes),
        }
    }
}

/// How a finished child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Exit status zero.
    Success,
    /// Nonzero exit status. Expected user behaviour, not a service fault.
    RuntimeFailure,
    /// Killed after the wall-clock limit.
    TimedOut,
    /// Terminated by a signal it did not survive (segfault, abort, OOM kill).
    Signaled,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::RuntimeFailure => "runtime_failure",
            Outcome::TimedOut => "timed_out",
            Outcome::Signaled => "signaled",
        }
    }
}

/// Captured result of one child process (compiler or program).
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub phase: Phase,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` only when the process was killed by the timeout or a signal.
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl ExecutionResult {
    pub fn outcome(&self) -> Outcome {
        if self.timed_out {
            Outcome::TimedOut
        } else {
            match self.exit_code {
                Some(0) => Outcome::Success,
                Some(_) => Outcome::RuntimeFailure,
                None => Outcome::Signaled,
            }
        }
    }

    pub fn succeeded(&self) -> bool {
        self.outcome() == Outcome::Success
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Everything the coordinator learned while handling one request.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub request_id: Uuid,
    pub language: String,
    pub started_at: DateTime<Utc>,
    pub compile: Option<ExecutionResult>,
    /// Absent when the compile phase did not succeed.
    pub run: Option<ExecutionResult>,
    /// The workspace could not be removed after the phases finished. The
    /// output is still valid; the directory is left for the next purge.
    pub cleanup_failed: bool,
}

impl ExecutionReport {
    /// The result of the last phase that ran.
    ///
    /// Every report holds at least one phase: the coordinator only returns a
    /// report after a process has been started.
    pub fn final_result(&self) -> Option<&ExecutionResult> {
        self.run.as_ref().or(self.compile.as_ref())
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.final_result().map(ExecutionResult::outcome)
    }

    pub fn total_duration_ms(&self) -> u64 {
        self.compile.iter().chain(self.run.iter()).map(|r| r.duration_ms).sum()
    }

    /// Wire shape returned to HTTP callers and printed by `--json`.
    pub fn to_response(&self) -> RunCodeResponse {
        let (output, error, exit_code, signal, timed_out, phase, output_truncated, error_truncated) =
            match self.final_result() {
                Some(r) => (
                    r.stdout_lossy(),
                    r.stderr_lossy(),
                    r.exit_code,
                    r.signal,
                    r.timed_out,
                    r.phase,
                    r.stdout_truncated,
                    r.stderr_truncated,
                ),
                None => (String::new(), String::new(), None, None, false, Phase::Run, false, false),
            };

        RunCodeResponse {
            output,
            error,
            exit_code,
            signal,
            duration_ms: self.total_duration_ms(),
            timed_out,
            phase,
            output_truncated,
            error_truncated,
            request_id: self.request_id,
            started_at: self.started_at,
        }
    }
}

/// Lifecycle of a request inside the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validating,
    Preparing,
    Running,
    Cleaning,
    Done,
    Failed,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Validating => "validating",
            Stage::Preparing => "preparing",
            Stage::Running => "running",
            Stage::Cleaning => "cleaning",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}
