//! Node-wide mutual exclusion for claim preparation.

use std::fs::File;
use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::AgentError;
use crate::error::AgentResult;

/// Handle returned by [`NodeLock::acquire`]; releasing it lets the next caller in.
#[async_trait::async_trait]
pub trait LockRelease: Send {
    async fn release(self: Box<Self>) -> AgentResult<()>;
}

/// Mutual exclusion shared by every prepare and unprepare call on the node.
#[async_trait::async_trait]
pub trait NodeLock: Send + Sync {
    async fn acquire(&self, ctx: &CancellationToken) -> AgentResult<Box<dyn LockRelease>>;
}

/// Advisory `flock(2)` on a lock file.
///
/// Works across processes, so a restarted agent and a stale one still serialize.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    poll_interval: Duration,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            poll_interval,
        }
    }

    fn open(&self) -> AgentResult<File> {
        if let Some(dir) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).change_context_lazy(|| {
                AgentError::lock(format!("failed to create lock dir {}", dir.display()))
            })?;
        }
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.path)
            .change_context_lazy(|| {
                AgentError::lock(format!("failed to open lock file {}", self.path.display()))
            })
    }

    /// Returns `Ok(true)` once the exclusive lock is held.
    fn try_lock(file: &File) -> std::io::Result<bool> {
        // SAFETY: the descriptor is owned by `file` and valid for the duration of the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == libc::EWOULDBLOCK || code == libc::EINTR => Ok(false),
            _ => Err(err),
        }
    }
}

#[async_trait::async_trait]
impl NodeLock for FileLock {
    async fn acquire(&self, ctx: &CancellationToken) -> AgentResult<Box<dyn LockRelease>> {
        let file = self.open()?;

        loop {
            let locked = Self::try_lock(&file).map_err(|e| {
                Report::new(e).change_context(AgentError::lock(format!(
                    "flock on {} failed",
                    self.path.display()
                )))
            })?;
            if locked {
                debug!(path = %self.path.display(), "node lock acquired");
                return Ok(Box::new(FileLockRelease {
                    file,
                    path: self.path.clone(),
                }));
            }

            tokio::select! {
                _ = ctx.cancelled() => {
                    return Err(AgentError::cancelled(format!(
                        "waiting for lock {}",
                        self.path.display()
                    ))
                    .into());
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

struct FileLockRelease {
    file: File,
    path: PathBuf,
}

#[async_trait::async_trait]
impl LockRelease for FileLockRelease {
    async fn release(self: Box<Self>) -> AgentResult<()> {
        // SAFETY: the descriptor is owned by `self.file`.
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            return Err(
                Report::new(std::io::Error::last_os_error()).change_context(AgentError::lock(
                    format!("failed to unlock {}", self.path.display()),
                )),
            );
        }
        debug!(path = %self.path.display(), "node lock released");
        Ok(())
    }
}
