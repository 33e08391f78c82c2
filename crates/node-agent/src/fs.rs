//! File helpers shared by the on-disk collaborators.

use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

/// Replaces `path` with `contents` through a temporary file in `dir`.
///
/// Readers see either the old or the new file. The blocking write, fsync and
/// rename run on the blocking pool.
pub(crate) async fn write_atomic(
    dir: &Path,
    path: &Path,
    contents: Vec<u8>,
) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;

    let dir = dir.to_path_buf();
    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&contents)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(std::io::Error::other)?
}
