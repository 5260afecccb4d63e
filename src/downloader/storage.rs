use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// The destination of one download, shared by all of its fetch tasks.
///
/// Writes are positioned (`pwrite`) so tasks never share a cursor; the plan
/// guarantees their ranges are disjoint, so no lock is taken around the file.
#[derive(Debug, Clone)]
pub struct OutputFile {
    file: Arc<File>,
}

impl OutputFile {
    /// Creates `path` and its parent directories, truncating old content and
    /// pre-sizing the file to `size` bytes.
    pub async fn create(path: &Path, size: u64) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .read(true)
            .open(path)
            .await?;
        file.set_len(size).await?;

        Ok(Self {
            file: Arc::new(file.into_std().await),
        })
    }

    pub async fn write_at(&self, offset: u64, buf: Vec<u8>) -> io::Result<()> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || file.write_all_at(&buf, offset))
            .await
            .map_err(io::Error::other)?
    }
}
