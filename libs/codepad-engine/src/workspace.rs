/// Workspace Manager - Per-Request Filesystem Scope
///
/// **Responsibility:**
/// Give every request its own directory holding the submitted source file and
/// any build output, and make sure that directory disappears afterwards.
///
/// **Guarantees:**
/// - Directory names come from the request UUID, never from a shared constant,
///   so overlapping requests for the same language cannot collide
/// - `create_dir` (not `create_dir_all`) refuses to reuse an existing directory
/// - Cleanup happens through `release()` on the normal path and through `Drop`
///   on every other path (early return, panic, cancelled future)
/// - Programs run as the service user and may strip permissions from the
///   directories they create; removal restores owner access and retries

use crate::error::ExecutionError;
use crate::registry::LanguageDescriptor;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const WORKSPACE_PREFIX: &str = "codepad-";

/// Allocates workspaces under a single root directory
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory name a request would receive
    pub fn path_for(&self, request_id: Uuid) -> PathBuf {
        self.root.join(format!("{}{}", WORKSPACE_PREFIX, request_id))
    }

    /// Create the root directory if it does not exist yet
    pub async fn prepare_root(&self) -> Result<(), ExecutionError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| ExecutionError::workspace("prepare", &self.root, e))
    }

    /// Materialize a fresh workspace containing the source file
    pub async fn acquire(
        &self,
        request_id: Uuid,
        descriptor: &LanguageDescriptor,
        source: &[u8],
    ) -> Result<Workspace, ExecutionError> {
        let dir = self.path_for(request_id);

        create_private_dir(&dir)
            .await
            .map_err(|e| ExecutionError::workspace("create", &dir, e))?;

        // From here on the guard owns the directory, so any failure below
        // still removes it.
        let source_path = dir.join(descriptor.source_file_name());
        let artifact_path = descriptor.artifact.as_ref().map(|name| dir.join(name));
        let workspace = Workspace {
            id: request_id,
            dir,
            source_path,
            artifact_path,
            released: false,
        };

        write_new_file(&workspace.source_path, source)
            .await
            .map_err(|e| ExecutionError::workspace("populate", &workspace.source_path, e))?;

        debug!(
            request_id = %request_id,
            dir = %workspace.dir.display(),
            source_bytes = source.len(),
            "Workspace acquired"
        );

        Ok(workspace)
    }

    /// Remove workspaces left behind by a previous process
    ///
    /// Only directories carrying the workspace prefix are touched. Returns the
    /// number of directories removed.
    pub async fn purge_stale(&self) -> io::Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let is_workspace = name
                .to_str()
                .is_some_and(|n| n.starts_with(WORKSPACE_PREFIX));
            if !is_workspace || !entry.file_type().await?.is_dir() {
                continue;
            }
            match remove_tree_blocking(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to purge stale workspace"),
            }
        }

        if removed > 0 {
            info!(removed, root = %self.root.display(), "Purged stale workspaces");
        }
        Ok(removed)
    }
}

/// An exclusively owned request directory
///
/// Dropping an unreleased workspace removes it synchronously; call
/// [`Workspace::release`] to observe cleanup errors instead.
#[derive(Debug)]
pub struct Workspace {
    id: Uuid,
    dir: PathBuf,
    source_path: PathBuf,
    artifact_path: Option<PathBuf>,
    released: bool,
}

impl Workspace {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn artifact_path(&self) -> Option<&Path> {
        self.artifact_path.as_deref()
    }

    /// Remove the directory and everything in it
    pub async fn release(mut self) -> Result<(), ExecutionError> {
        self.released = true;
        match remove_tree_blocking(self.dir.clone()).await {
            Ok(()) => {
                debug!(request_id = %self.id, "Workspace released");
                Ok(())
            }
            Err(e) => Err(ExecutionError::workspace("remove", &self.dir, e)),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Best-effort cleanup - Drop cannot be async
        match remove_tree(&self.dir) {
            Ok(()) => debug!(request_id = %self.id, "Workspace removed on drop"),
            Err(e) => warn!(
                request_id = %self.id,
                dir = %self.dir.display(),
                error = %e,
                "Failed to remove workspace on drop"
            ),
        }
    }
}

/// Remove a directory tree, tolerating one that is already gone
///
/// A first failure with `PermissionDenied` usually means the program made a
/// subdirectory unreadable or unwritable. Owner `rwx` is restored on every
/// directory in the tree and the removal is attempted once more.
fn remove_tree(dir: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            debug!(dir = %dir.display(), error = %e, "Restoring directory permissions before removal");
        }
        Err(e) => return Err(e),
    }

    restore_owner_access(dir)?;
    match std::fs::remove_dir_all(dir) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

async fn remove_tree_blocking(dir: PathBuf) -> io::Result<()> {
    tokio::task::spawn_blocking(move || remove_tree(&dir))
        .await
        .map_err(io::Error::other)?
}

/// Walk the tree without following symlinks and make every directory
/// listable and writable by its owner again
fn restore_owner_access(root: &Path) -> io::Result<()> {
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        match std::fs::symlink_metadata(&dir) {
            Ok(metadata) if metadata.is_dir() => {}
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        }
        grant_owner_rwx(&dir)?;

        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                pending.push(entry.path());
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
fn grant_owner_rwx(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = std::fs::symlink_metadata(dir)?.permissions();
    permissions.set_mode(permissions.mode() | 0o700);
    std::fs::set_permissions(dir, permissions)
}

#[cfg(not(unix))]
fn grant_owner_rwx(dir: &Path) -> io::Result<()> {
    let mut permissions = std::fs::metadata(dir)?.permissions();
    permissions.set_readonly(false);
    std::fs::set_permissions(dir, permissions)
}

async fn create_private_dir(dir: &Path) -> io::Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    #[cfg(unix)]
    builder.mode(0o700);
    builder.create(dir).await
}

async fn write_new_file(path: &Path, content: &[u8]) -> io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(content).await?;
    file.flush().await?;
    file.sync_all().await
}
