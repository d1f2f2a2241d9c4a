/// Process Runner - Time-Bounded Child Process Execution
///
/// **Core Responsibility:**
/// Start one external program, feed it stdin, capture stdout/stderr, and stop
/// it at a hard wall-clock deadline.
///
/// **Execution Rules:**
/// 1. The child runs in its own process group with a scrubbed environment
/// 2. Stdin is written by its own task and then closed, so programs that read
///    until EOF terminate
/// 3. Stdout and stderr are drained by two independent tasks; a child flooding
///    one stream can never block on the other
/// 4. Each stream is capped; bytes beyond the cap are read and discarded
/// 5. On timeout the whole process group receives SIGKILL
/// 6. After any exit the group is killed again so no descendant outlives the
///    request
/// 7. Descendants that left the group (`setsid`) are swept up by the reaper
///    once the child is gone
///
/// The runner knows nothing about languages or workspaces; the coordinator
/// hands it a fully rendered command line.

use crate::error::ExecutionError;
use crate::reaper;
use crate::types::ExecutionResult;
use codepad_common::types::Phase;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::watch;
use tracing::{debug, warn};

/// How long output readers may keep going after the child has been reaped.
const OUTPUT_GRACE: Duration = Duration::from_millis(500);

const READ_CHUNK: usize = 8192;

/// Fully rendered invocation
#[derive(Debug, Clone)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Complete child environment; nothing is inherited from the service.
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    max_output_bytes: usize,
}

impl ProcessRunner {
    pub fn new(max_output_bytes: usize) -> Self {
        reaper::adopt_orphans();
        Self { max_output_bytes }
    }

    /// Run `command` to completion or until `timeout` elapses
    ///
    /// Nonzero exits, signals and timeouts are reported in the returned
    /// [`ExecutionResult`]; only failures to start or supervise the child are
    /// errors.
    pub async fn run(
        &self,
        phase: Phase,
        command: &CommandLine,
        stdin: &[u8],
        timeout: Duration,
    ) -> Result<ExecutionResult, ExecutionError> {
        let mut std_cmd = std::process::Command::new(&command.program);
        std_cmd
            .args(&command.args)
            .current_dir(&command.working_dir)
            .env_clear()
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt as _;
            std_cmd.process_group(0);
        }
        reaper::contain_descendants(&mut std_cmd);

        let mut cmd = Command::from(std_cmd);
        cmd.kill_on_drop(true);

        let start_time = Instant::now();
        let (mut child, mut tracked) = reaper::spawn(&mut cmd).map_err(|source| ExecutionError::Spawn {
            program: command.program.clone(),
            source,
        })?;

        // Kills the group if this future is dropped before the child is reaped
        let mut group = ProcessGroup::of(&child);

        debug!(
            phase = %phase,
            program = %command.program,
            pid = ?child.id(),
            timeout_ms = timeout.as_millis() as u64,
            "Child process started"
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let stdin_task = tokio::spawn(feed_stdin(child.stdin.take(), stdin.to_vec()));
        let stdout_task = tokio::spawn(capture(child.stdout.take(), self.max_output_bytes, stop_rx.clone()));
        let stderr_task = tokio::spawn(capture(child.stderr.take(), self.max_output_bytes, stop_rx));

        let (status, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => (status.map_err(ExecutionError::Supervise)?, false),
            Err(_) => {
                warn!(
                    phase = %phase,
                    program = %command.program,
                    timeout_ms = timeout.as_millis() as u64,
                    "Execution timed out - killing process group"
                );
                group.kill();
                kill_and_reap(&mut child).await?
            }
        };
        let duration_ms = start_time.elapsed().as_millis() as u64;

        // Descendants may still hold the output pipes open
        group.kill();
        tracked.release();
        reaper::sweep().await;
        stdin_task.abort();

        let readers = async { (stdout_task.await, stderr_task.await) };
        tokio::pin!(readers);
        let (stdout, stderr) = match tokio::time::timeout(OUTPUT_GRACE, &mut readers).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(phase = %phase, "Output pipes still open after exit; stopping capture");
                let _ = stop_tx.send(true);
                readers.await
            }
        };
        let stdout = stdout.unwrap_or_else(|e| {
            warn!(error = %e, "stdout capture task failed");
            Captured::default()
        });
        let stderr = stderr.unwrap_or_else(|e| {
            warn!(error = %e, "stderr capture task failed");
            Captured::default()
        });

        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt as _;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal: Option<i32> = None;

        let exit_code = if timed_out { None } else { status.code() };

        debug!(
            phase = %phase,
            exit_code = ?exit_code,
            signal = ?signal,
            timed_out,
            duration_ms,
            stdout_bytes = stdout.bytes.len(),
            stderr_bytes = stderr.bytes.len(),
            "Child process finished"
        );

        Ok(ExecutionResult {
            phase,
            stdout: stdout.bytes,
            stderr: stderr.bytes,
            exit_code,
            signal,
            duration_ms,
            timed_out,
            stdout_truncated: stdout.truncated,
            stderr_truncated: stderr.truncated,
        })
    }
}

async fn kill_and_reap(child: &mut Child) -> Result<(std::process::ExitStatus, bool), ExecutionError> {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "start_kill after group kill");
    }
    let status = child.wait().await.map_err(ExecutionError::Supervise)?;
    Ok((status, true))
}

/// Process group of a spawned child; SIGKILLs the whole group at most once.
struct ProcessGroup {
    pgid: Option<i32>,
}

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self {
            pgid: child.id().and_then(|pid| i32::try_from(pid).ok()),
        }
    }

    fn kill(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        #[cfg(unix)]
        {
            if pgid > 1 {
                // SAFETY: kill(2) takes plain integers and touches no memory.
                let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
                if rc != 0 {
                    let err = std::io::Error::last_os_error();
                    if err.raw_os_error() != Some(libc::ESRCH) {
                        warn!(pgid, error = %err, "Failed to kill process group");
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = pgid;
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn feed_stdin(pipe: Option<ChildStdin>, input: Vec<u8>) {
    let Some(mut pipe) = pipe else {
        return;
    };
    if !input.is_empty() {
        if let Err(e) = pipe.write_all(&input).await {
            // A program that exits without reading its input is not our problem
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                debug!(error = %e, "Failed to write stdin");
            }
            return;
        }
    }
    let _ = pipe.flush().await;
    drop(pipe);
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

impl Captured {
    fn push(&mut self, chunk: &[u8], cap: usize) {
        let remaining = cap.saturating_sub(self.bytes.len());
        if chunk.len() <= remaining {
            self.bytes.extend_from_slice(chunk);
        } else {
            self.bytes.extend_from_slice(&chunk[..remaining]);
            self.truncated = true;
        }
    }
}

/// Drain a pipe until EOF or until told to stop, keeping at most `cap` bytes
async fn capture<R>(pipe: Option<R>, cap: usize, mut stop: watch::Receiver<bool>) -> Captured
where
    R: AsyncRead + Unpin,
{
    let mut captured = Captured::default();
    let Some(mut pipe) = pipe else {
        return captured;
    };
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            read = pipe.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => captured.push(&buf[..n], cap),
                Err(e) => {
                    debug!(error = %e, "Output pipe read failed");
                    break;
                }
            },
        }
    }

    captured
}
