// Service configuration
// Every knob is read from the environment once at startup.

use anyhow::{Context, Result, bail};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_RUN_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_COMPILE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_MAX_SOURCE_BYTES: usize = 1024 * 1024; // 1MB
pub const DEFAULT_MAX_STDIN_BYTES: usize = 1024 * 1024; // 1MB
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024; // 1MB
pub const DEFAULT_QUEUE_WAIT_MS: u64 = 2_000;
pub const DEFAULT_ENV_PASSTHROUGH: &[&str] = &["PATH", "JAVA_HOME", "LANG"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => bail!("unknown log format '{}' (expected text or json)", other),
        }
    }
}

/// Limits and paths shared by the API server and the CLI.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,
    pub run_timeout: Duration,
    pub compile_timeout: Duration,
    pub max_source_bytes: usize,
    pub max_stdin_bytes: usize,
    pub max_output_bytes: usize,
    pub max_concurrent: usize,
    /// How long a request may wait for a free execution slot. Zero rejects
    /// immediately when all slots are busy.
    pub queue_wait: Duration,
    pub workspace_root: PathBuf,
    pub languages_file: Option<PathBuf>,
    pub env_passthrough: Vec<String>,
    pub log_format: LogFormat,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            run_timeout: Duration::from_millis(DEFAULT_RUN_TIMEOUT_MS),
            compile_timeout: Duration::from_millis(DEFAULT_COMPILE_TIMEOUT_MS),
            max_source_bytes: DEFAULT_MAX_SOURCE_BYTES,
            max_stdin_bytes: DEFAULT_MAX_STDIN_BYTES,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            max_concurrent: default_concurrency(),
            queue_wait: Duration::from_millis(DEFAULT_QUEUE_WAIT_MS),
            workspace_root: std::env::temp_dir().join("codepad"),
            languages_file: None,
            env_passthrough: DEFAULT_ENV_PASSTHROUGH
                .iter()
                .map(|s| s.to_string())
                .collect(),
            log_format: LogFormat::Text,
        }
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl ServiceConfig {
    /// Load configuration from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    ///
    /// Unset keys fall back to defaults; set-but-invalid keys are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let host: IpAddr = parse_or(&lookup, "CODEPAD_BIND", defaults.bind_addr.ip())?;
        let port: u16 = parse_or(&lookup, "PORT", defaults.bind_addr.port())?;

        let run_timeout_ms = parse_or(&lookup, "CODEPAD_RUN_TIMEOUT_MS", DEFAULT_RUN_TIMEOUT_MS)?;
        let compile_timeout_ms =
            parse_or(&lookup, "CODEPAD_COMPILE_TIMEOUT_MS", DEFAULT_COMPILE_TIMEOUT_MS)?;
        if run_timeout_ms == 0 || compile_timeout_ms == 0 {
            bail!("timeouts must be greater than zero");
        }

        let max_concurrent: usize =
            parse_or(&lookup, "CODEPAD_MAX_CONCURRENT", defaults.max_concurrent)?;
        if max_concurrent == 0 {
            bail!("CODEPAD_MAX_CONCURRENT must be at least 1");
        }

        let workspace_root = non_empty(&lookup, "CODEPAD_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.workspace_root);

        let languages_file = non_empty(&lookup, "CODEPAD_LANGUAGES_FILE").map(PathBuf::from);

        let env_passthrough = match non_empty(&lookup, "CODEPAD_ENV_PASSTHROUGH") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            None => defaults.env_passthrough,
        };

        Ok(Self {
            bind_addr: SocketAddr::new(host, port),
            run_timeout: Duration::from_millis(run_timeout_ms),
            compile_timeout: Duration::from_millis(compile_timeout_ms),
            max_source_bytes: parse_or(&lookup, "CODEPAD_MAX_SOURCE_BYTES", DEFAULT_MAX_SOURCE_BYTES)?,
            max_stdin_bytes: parse_or(&lookup, "CODEPAD_MAX_STDIN_BYTES", DEFAULT_MAX_STDIN_BYTES)?,
            max_output_bytes: parse_or(&lookup, "CODEPAD_MAX_OUTPUT_BYTES", DEFAULT_MAX_OUTPUT_BYTES)?,
            max_concurrent,
            queue_wait: Duration::from_millis(parse_or(
                &lookup,
                "CODEPAD_QUEUE_WAIT_MS",
                DEFAULT_QUEUE_WAIT_MS,
            )?),
            workspace_root,
            languages_file,
            env_passthrough,
            log_format: parse_or(&lookup, "LOG_FORMAT", LogFormat::Text)?,
        })
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty(lookup, key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Invalid value for {}: '{}'", key, raw)),
        None => Ok(default),
    }
}
