/// Orphan Reaper - Descendants That Leave Their Process Group
///
/// **Problem:**
/// Killing the child's process group misses any descendant that called
/// `setsid()` or `setpgid()`. Once the child exits such a process would be
/// re-parented to init and keep running after the request has finished.
///
/// **Approach (Linux):**
/// 1. The service marks itself a child subreaper, so orphans are re-parented
///    to it instead of init
/// 2. Every spawned program is a subreaper as well, which keeps its own
///    orphans attached to it while it is still running
/// 3. A direct child of the service that the runner is not tracking is
///    therefore left over from a program that has already exited; `sweep`
///    kills and reaps it, repeating until none remain
///
/// Every child of the service must be spawned through [`spawn`]; anything
/// else would be treated as an orphan. On other platforms only the process
/// group kill applies.

use std::collections::HashMap;
use std::io;
use std::sync::{Mutex, MutexGuard, Once, OnceLock};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Passes over the process table before giving up on a process that keeps
/// forking faster than it is killed
#[cfg(target_os = "linux")]
const MAX_SWEEP_PASSES: usize = 64;

/// Live children of the service, counted per pid so a recycled pid stays
/// protected until every owner has released it
fn live_children() -> MutexGuard<'static, HashMap<u32, usize>> {
    static LIVE: OnceLock<Mutex<HashMap<u32, usize>>> = OnceLock::new();
    LIVE.get_or_init(Default::default)
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Re-parent orphaned descendants to this process instead of init
pub(crate) fn adopt_orphans() {
    static ADOPT: Once = Once::new();
    ADOPT.call_once(|| {
        #[cfg(target_os = "linux")]
        {
            let enable: libc::c_ulong = 1;
            // SAFETY: prctl(2) with integer arguments touches no memory.
            let rc = unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, enable, 0, 0, 0) };
            if rc == 0 {
                debug!("Registered as child subreaper");
            } else {
                warn!(
                    error = %io::Error::last_os_error(),
                    "Failed to register as child subreaper; detached descendants will not be reaped"
                );
            }
        }
    });
}

/// Make the spawned program the subreaper of its own subtree
pub(crate) fn contain_descendants(cmd: &mut std::process::Command) {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::process::CommandExt as _;
        // SAFETY: the hook runs between fork and exec and only issues
        // prctl(2), which is async-signal-safe.
        unsafe {
            cmd.pre_exec(|| {
                let enable: libc::c_ulong = 1;
                if libc::prctl(libc::PR_SET_CHILD_SUBREAPER, enable, 0, 0, 0) != 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = cmd;
    }
}

/// Registration of a spawned child; release it once the child is reaped
pub(crate) struct TrackedChild {
    pid: Option<u32>,
}

impl TrackedChild {
    pub(crate) fn release(&mut self) {
        let Some(pid) = self.pid.take() else {
            return;
        };
        let mut live = live_children();
        if let Some(count) = live.get_mut(&pid) {
            *count -= 1;
            if *count == 0 {
                live.remove(&pid);
            }
        }
    }
}

impl Drop for TrackedChild {
    fn drop(&mut self) {
        self.release();
    }
}

/// Spawn `cmd` and register the child before any sweep can observe it
pub(crate) fn spawn(cmd: &mut Command) -> io::Result<(Child, TrackedChild)> {
    let mut live = live_children();
    let child = cmd.spawn()?;
    let pid = child.id();
    if let Some(pid) = pid {
        *live.entry(pid).or_insert(0) += 1;
    }
    Ok((child, TrackedChild { pid }))
}

/// Kill and reap every untracked child of the service
pub(crate) async fn sweep() {
    #[cfg(target_os = "linux")]
    {
        match tokio::task::spawn_blocking(sweep_blocking).await {
            Ok(0) => {}
            Ok(killed) => debug!(killed, "Reaped detached descendants"),
            Err(e) => warn!(error = %e, "Orphan sweep task failed"),
        }
    }
}

#[cfg(target_os = "linux")]
fn sweep_blocking() -> usize {
    let service = std::process::id();
    // Held throughout so no pid can be recycled by a new spawn mid-sweep
    let live = live_children();
    let mut killed = 0;

    for _ in 0..MAX_SWEEP_PASSES {
        let orphans: Vec<i32> = match children_of(service) {
            Ok(children) => children
                .into_iter()
                .filter(|pid| !live.contains_key(pid))
                .filter_map(|pid| i32::try_from(pid).ok())
                .collect(),
            Err(e) => {
                warn!(error = %e, "Failed to scan the process table");
                break;
            }
        };
        if orphans.is_empty() {
            return killed;
        }

        for &pid in &orphans {
            // SAFETY: kill(2) takes plain integers and touches no memory.
            unsafe { libc::kill(pid, libc::SIGKILL) };
        }
        // Reaping a process re-parents its own children to the service,
        // where the next pass finds them
        for &pid in &orphans {
            reap(pid);
        }
        killed += orphans.len();
    }

    warn!(killed, "Detached descendants still present after sweeping");
    killed
}

#[cfg(target_os = "linux")]
fn reap(pid: i32) {
    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: `status` is a valid out-pointer for the duration of the call.
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rc >= 0 {
            return;
        }
        // ECHILD: already reaped elsewhere
        if io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            return;
        }
    }
}

#[cfg(target_os = "linux")]
fn children_of(parent: u32) -> io::Result<Vec<u32>> {
    let mut children = Vec::new();
    for entry in std::fs::read_dir("/proc")? {
        let entry = entry?;
        let Some(pid) = entry.file_name().to_str().and_then(|name| name.parse::<u32>().ok()) else {
            continue;
        };
        // The process may have exited since the directory was listed
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if parent_pid(&stat) == Some(parent) {
            children.push(pid);
        }
    }
    Ok(children)
}

/// Parent pid from a `/proc/<pid>/stat` line. The command name can contain
/// spaces and parentheses, so fields are counted from the last `)`.
#[cfg(any(target_os = "linux", test))]
fn parent_pid(stat: &str) -> Option<u32> {
    let fields = &stat[stat.rfind(')')? + 1..];
    fields.split_whitespace().nth(1)?.parse().ok()
}
