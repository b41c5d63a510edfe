//! Transient on-disk copy of an uploaded file.
//!
//! Multipart fields can arrive in any order, so the image is spooled to disk
//! until the rest of the form has been validated. The spool file is removed
//! when the `UploadSpool` is dropped, whichever way the request ends.

use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("upload exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub struct UploadSpool {
    path: PathBuf,
    file: Option<File>,
    len: u64,
    limit: u64,
}

impl UploadSpool {
    /// Create an empty spool file in `dir`, accepting at most `limit` bytes.
    pub async fn create(dir: &Path, limit: u64) -> io::Result<Self> {
        fs::create_dir_all(dir).await?;
        let path = dir.join(format!(".upload-{}", Uuid::new_v4()));
        let file = File::create(&path).await?;
        Ok(Self {
            path,
            file: Some(file),
            len: 0,
            limit,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), SpoolError> {
        let len = self.len + chunk.len() as u64;
        if len > self.limit {
            return Err(SpoolError::TooLarge { limit: self.limit });
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "spool already finished"))?;
        file.write_all(chunk).await?;
        self.len = len;
        Ok(())
    }

    /// Flush and close the write handle.
    pub async fn finish(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        Ok(())
    }

    /// Stream the spooled bytes back. The spool must outlive the stream.
    pub async fn reader_stream(&self) -> io::Result<ReaderStream<File>> {
        let file = File::open(&self.path).await?;
        Ok(ReaderStream::new(file))
    }
}

impl Drop for UploadSpool {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed upload spool"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => debug!(path = %self.path.display(), error = %err, "failed to remove upload spool"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tempfile::TempDir;

    #[tokio::test]
    async fn spool_round_trips_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let mut spool = UploadSpool::create(dir.path(), 1024).await.unwrap();
        spool.write_chunk(b"hello ").await.unwrap();
        spool.write_chunk(b"world").await.unwrap();
        spool.finish().await.unwrap();
        assert_eq!(spool.len(), 11);

        let mut stream = Box::pin(spool.reader_stream().await.unwrap());
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"hello world");

        let path = spool.path().to_path_buf();
        assert!(path.exists());
        drop(stream);
        drop(spool);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn oversize_upload_is_rejected_and_removed() {
        let dir = TempDir::new().unwrap();
        let mut spool = UploadSpool::create(dir.path(), 4).await.unwrap();
        spool.write_chunk(b"abcd").await.unwrap();
        let err = spool.write_chunk(b"e").await.unwrap_err();
        assert!(matches!(err, SpoolError::TooLarge { limit: 4 }));

        let path = spool.path().to_path_buf();
        drop(spool);
        assert!(!path.exists());
    }
}
