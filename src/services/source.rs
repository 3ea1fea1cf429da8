//! Byte sources the upload engine reads parts from.

use crate::models::fingerprint::FileFingerprint;
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    io::{self, SeekFrom},
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};

/// Size of the head and tail windows hashed into a sample digest.
pub const SAMPLE_WINDOW: u64 = 64 * 1024;

/// A file the seller selected for upload.
///
/// Implementations must allow concurrent `read_range` calls: the engine reads
/// several parts at once.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    fn fingerprint(&self) -> FileFingerprint;

    /// Read exactly `len` bytes starting at `offset`.
    async fn read_range(&self, offset: u64, len: u64) -> io::Result<Bytes>;

    /// md5 hex over the first and last `window` bytes of the file.
    ///
    /// Cheap enough to compute on every selection; catches a different file
    /// that happens to share name and size with a persisted session.
    async fn sample_digest(&self, window: u64) -> io::Result<String> {
        let size = self.fingerprint().size;
        let mut ctx = md5::Context::new();
        if size <= window.saturating_mul(2) {
            ctx.consume(self.read_range(0, size).await?);
        } else {
            ctx.consume(self.read_range(0, window).await?);
            ctx.consume(self.read_range(size - window, window).await?);
        }
        Ok(format!("{:x}", ctx.compute()))
    }
}

/// A file on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalFile {
    path: PathBuf,
    fingerprint: FileFingerprint,
}

impl LocalFile {
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let meta = tokio::fs::metadata(&path).await?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "file has no usable name"))?
            .to_string();

        let mut fingerprint = FileFingerprint::new(name, meta.len());
        if let Some(millis) = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .and_then(|d| i64::try_from(d.as_millis()).ok())
        {
            fingerprint = fingerprint.with_last_modified(millis);
        }

        Ok(Self { path, fingerprint })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ChunkSource for LocalFile {
    fn fingerprint(&self) -> FileFingerprint {
        self.fingerprint.clone()
    }

    async fn read_range(&self, offset: u64, len: u64) -> io::Result<Bytes> {
        let len = usize::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "range too large"))?;
        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

/// An in-memory file.
#[derive(Debug, Clone)]
pub struct MemorySource {
    name: String,
    data: Bytes,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

#[async_trait]
impl ChunkSource for MemorySource {
    fn fingerprint(&self) -> FileFingerprint {
        FileFingerprint::new(self.name.clone(), self.data.len() as u64)
    }

    async fn read_range(&self, offset: u64, len: u64) -> io::Result<Bytes> {
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        let end = usize::try_from(offset.saturating_add(len)).unwrap_or(usize::MAX);
        if end > self.data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("range {}..{} past end of {}", start, end, self.name),
            ));
        }
        Ok(self.data.slice(start..end))
    }
}
