/// Execution Coordinator - Request Orchestration
///
/// **Responsibility:**
/// Drive one request through `Validating → Preparing → Running → Cleaning →
/// Done`, with `Failed` reachable from every stage.
///
/// **Architecture:**
/// 1. LanguageRegistry resolves the language (registry.rs)
/// 2. WorkspaceManager materializes the source file (workspace.rs)
/// 3. ProcessRunner compiles and/or runs it (runner.rs)
/// 4. The workspace is released on every path
///
/// This module is the glue layer - it knows nothing about:
/// - How a child process is supervised (runner's job)
/// - How directories are named or removed (workspace's job)

use crate::error::ExecutionError;
use crate::registry::{render, LanguageDescriptor, LanguageRegistry};
use crate::runner::{CommandLine, ProcessRunner};
use crate::types::{ExecutionReport, ExecutionRequest, ExecutionResult, Stage};
use crate::workspace::{Workspace, WorkspaceManager};
use chrono::Utc;
use codepad_common::config::ServiceConfig;
use codepad_common::types::Phase;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Size and time limits applied to every request
#[derive(Debug, Clone)]
pub struct ExecutionLimits {
    pub run_timeout: Duration,
    pub compile_timeout: Duration,
    pub max_source_bytes: usize,
    pub max_stdin_bytes: usize,
    pub max_output_bytes: usize,
    pub max_concurrent: usize,
    pub queue_wait: Duration,
}

impl From<&ServiceConfig> for ExecutionLimits {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            run_timeout: config.run_timeout,
            compile_timeout: config.compile_timeout,
            max_source_bytes: config.max_source_bytes,
            max_stdin_bytes: config.max_stdin_bytes,
            max_output_bytes: config.max_output_bytes,
            max_concurrent: config.max_concurrent,
            queue_wait: config.queue_wait,
        }
    }
}

pub struct Coordinator {
    registry: Arc<LanguageRegistry>,
    workspaces: WorkspaceManager,
    runner: ProcessRunner,
    limits: ExecutionLimits,
    slots: Arc<Semaphore>,
    base_env: Vec<(String, String)>,
}

impl Coordinator {
    pub fn new(
        registry: Arc<LanguageRegistry>,
        workspaces: WorkspaceManager,
        limits: ExecutionLimits,
        env_passthrough: &[String],
    ) -> Self {
        let base_env = env_passthrough
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|value| (key.clone(), value)))
            .collect();

        Self {
            registry,
            workspaces,
            runner: ProcessRunner::new(limits.max_output_bytes),
            slots: Arc::new(Semaphore::new(limits.max_concurrent.max(1))),
            limits,
            base_env,
        }
    }

    /// Build a coordinator from service configuration, preparing the
    /// workspace root and purging leftovers from a previous run
    pub async fn from_config(config: &ServiceConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        let registry = LanguageRegistry::load(config.languages_file.as_deref())?;
        let workspaces = WorkspaceManager::new(&config.workspace_root);
        workspaces
            .prepare_root()
            .await
            .context("Failed to prepare workspace root")?;
        workspaces
            .purge_stale()
            .await
            .context("Failed to purge stale workspaces")?;

        Ok(Self::new(
            Arc::new(registry),
            workspaces,
            ExecutionLimits::from(config),
            &config.env_passthrough,
        ))
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    pub fn workspace_root(&self) -> &std::path::Path {
        self.workspaces.root()
    }

    /// Requests currently holding an execution slot
    pub fn in_flight(&self) -> usize {
        self.limits.max_concurrent.max(1) - self.slots.available_permits()
    }

    /// Execute one request end to end
    ///
    /// Returns `Err` only for caller mistakes and service faults. A program that
    /// fails to compile, exits nonzero or times out yields `Ok` with the
    /// captured output.
    #[instrument(
        skip(self, request_id, request),
        fields(
            request_id = %request_id,
            language = %request.language,
            source_bytes = request.source.len()
        )
    )]
    pub async fn execute_with_id(
        &self,
        request_id: Uuid,
        request: ExecutionRequest,
    ) -> Result<ExecutionReport, ExecutionError> {
        let started_at = Utc::now();

        // Validating
        stage(Stage::Validating);
        let descriptor = match self.validate(&request) {
            Ok(descriptor) => descriptor,
            Err(e) => return Err(failed(e)),
        };

        let _permit = match self.acquire_slot().await {
            Ok(permit) => permit,
            Err(e) => return Err(failed(e)),
        };

        // Preparing
        stage(Stage::Preparing);
        let workspace = match self
            .workspaces
            .acquire(request_id, &descriptor, &request.source)
            .await
        {
            Ok(workspace) => workspace,
            Err(e) => return Err(failed(e)),
        };

        // Running
        stage(Stage::Running);
        let stdin = request.stdin.as_deref().unwrap_or_default();
        let phases = self.run_phases(&descriptor, &workspace, stdin).await;

        // Cleaning
        stage(Stage::Cleaning);
        let released = workspace.release().await;

        let (compile, run) = match phases {
            Ok(phases) => phases,
            Err(e) => {
                if let Err(cleanup) = released {
                    warn!(error = %cleanup, "Workspace cleanup failed after execution error");
                }
                return Err(failed(e));
            }
        };

        // The program already ran, so its output is returned either way
        let cleanup_failed = match released {
            Ok(()) => false,
            Err(e) => {
                warn!(kind = e.kind(), error = %e, "Workspace cleanup failed; keeping the result");
                true
            }
        };

        let report = ExecutionReport {
            request_id,
            language: descriptor.id.clone(),
            started_at,
            compile,
            run,
            cleanup_failed,
        };

        stage(Stage::Done);
        if let Some(result) = report.final_result() {
            info!(
                phase = %result.phase,
                outcome = result.outcome().as_str(),
                exit_code = ?result.exit_code,
                timed_out = result.timed_out,
                duration_ms = report.total_duration_ms(),
                "Execution completed"
            );
        }

        Ok(report)
    }

    /// Execute one request under a freshly generated request id
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionReport, ExecutionError> {
        self.execute_with_id(Uuid::new_v4(), request).await
    }

    fn validate(&self, request: &ExecutionRequest) -> Result<Arc<LanguageDescriptor>, ExecutionError> {
        let descriptor = self.registry.lookup(&request.language)?;

        if request.source.len() > self.limits.max_source_bytes {
            return Err(ExecutionError::SourceTooLarge {
                size: request.source.len(),
                limit: self.limits.max_source_bytes,
            });
        }
        let stdin_len = request.stdin.as_ref().map_or(0, Vec::len);
        if stdin_len > self.limits.max_stdin_bytes {
            return Err(ExecutionError::StdinTooLarge {
                size: stdin_len,
                limit: self.limits.max_stdin_bytes,
            });
        }

        Ok(descriptor)
    }

    async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit, ExecutionError> {
        let slots = Arc::clone(&self.slots);
        if let Ok(permit) = Arc::clone(&slots).try_acquire_owned() {
            return Ok(permit);
        }
        if self.limits.queue_wait.is_zero() {
            return Err(ExecutionError::CapacityExhausted);
        }

        debug!(queue_wait_ms = self.limits.queue_wait.as_millis() as u64, "Waiting for an execution slot");
        match tokio::time::timeout(self.limits.queue_wait, slots.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            // The semaphore is never closed; treat it like a full queue
            Ok(Err(_)) | Err(_) => Err(ExecutionError::CapacityExhausted),
        }
    }

    /// Compile (when the language needs it) and then run
    ///
    /// A compile phase that does not succeed ends the request with only the
    /// compile result; the program is never started.
    async fn run_phases(
        &self,
        descriptor: &LanguageDescriptor,
        workspace: &Workspace,
        stdin: &[u8],
    ) -> Result<(Option<ExecutionResult>, Option<ExecutionResult>), ExecutionError> {
        let compile = match &descriptor.compile {
            Some(template) => {
                let command = self.command_line(descriptor, template, workspace);
                let result = self
                    .runner
                    .run(Phase::Compile, &command, &[], self.limits.compile_timeout)
                    .await?;
                if !result.succeeded() {
                    debug!(
                        outcome = result.outcome().as_str(),
                        "Compilation did not succeed; skipping run phase"
                    );
                    return Ok((Some(result), None));
                }
                Some(result)
            }
            None => None,
        };

        let command = self.command_line(descriptor, &descriptor.run, workspace);
        let run = self
            .runner
            .run(Phase::Run, &command, stdin, self.limits.run_timeout)
            .await?;

        Ok((compile, Some(run)))
    }

    fn command_line(
        &self,
        descriptor: &LanguageDescriptor,
        template: &crate::registry::CommandTemplate,
        workspace: &Workspace,
    ) -> CommandLine {
        let (program, args) = render(
            template,
            workspace.source_path(),
            workspace.artifact_path(),
            workspace.dir(),
        );

        let dir = workspace.dir().to_string_lossy().into_owned();
        let mut env = self.base_env.clone();
        env.push(("HOME".to_string(), dir.clone()));
        env.push(("TMPDIR".to_string(), dir));
        env.extend(descriptor.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        CommandLine {
            program,
            args,
            working_dir: workspace.dir().to_path_buf(),
            env,
        }
    }
}

fn stage(stage: Stage) {
    debug!(stage = %stage, "Stage transition");
}

fn failed(error: ExecutionError) -> ExecutionError {
    if error.is_client_error() {
        debug!(stage = %Stage::Failed, kind = error.kind(), error = %error, "Request rejected");
    } else {
        warn!(stage = %Stage::Failed, kind = error.kind(), error = %error, "Request failed");
    }
    error
}
