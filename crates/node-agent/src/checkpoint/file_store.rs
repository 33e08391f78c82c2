use std::path::Path;
use std::path::PathBuf;

use api_types::Checkpoint;
use error_stack::Report;
use error_stack::ResultExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::CheckpointStore;
use crate::error::AgentError;
use crate::error::AgentResult;
use crate::fs::write_atomic;

/// Checkpoint kept as a JSON document on the node's local disk.
///
/// A missing file reads as an empty checkpoint. Saves go through a temporary
/// file in the same directory that is renamed over the target, so readers see
/// either the old or the new document, never a torn write.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> AgentResult<Checkpoint> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no checkpoint on disk yet");
                return Ok(Checkpoint::default());
            }
            Err(e) => {
                return Err(Report::new(e).change_context(AgentError::persistence(format!(
                    "failed to read checkpoint {}",
                    self.path.display()
                ))))
            }
        };

        serde_json::from_slice(&bytes).change_context(AgentError::persistence(format!(
            "failed to decode checkpoint {}",
            self.path.display()
        )))
    }

    async fn write(&self, checkpoint: &Checkpoint) -> AgentResult<()> {
        let persistence_error = || {
            AgentError::persistence(format!(
                "failed to write checkpoint {}",
                self.path.display()
            ))
        };

        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let json = serde_json::to_vec_pretty(checkpoint).change_context_lazy(persistence_error)?;
        write_atomic(dir, &self.path, json)
            .await
            .change_context_lazy(persistence_error)
    }
}

#[async_trait::async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, ctx: &CancellationToken) -> AgentResult<Checkpoint> {
        if ctx.is_cancelled() {
            return Err(AgentError::cancelled("checkpoint load").into());
        }
        self.read().await
    }

    async fn save(&self, ctx: &CancellationToken, checkpoint: &Checkpoint) -> AgentResult<()> {
        if ctx.is_cancelled() {
            return Err(AgentError::cancelled("checkpoint save").into());
        }
        self.write(checkpoint).await?;
        debug!(
            path = %self.path.display(),
            claims = checkpoint.claims.len(),
            "checkpoint saved"
        );
        Ok(())
    }
}
