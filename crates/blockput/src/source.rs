//! Seekable, length-known data sources.
//!
//! The executor reads a source strictly sequentially but always positions
//! explicitly before reading, so a resumed upload starts at the exact byte
//! offset of the first unacknowledged block.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

/// A data source that can be read at arbitrary offsets.
#[async_trait]
pub trait DataSource: Send {
    /// Total length of the source in bytes.
    fn len(&self) -> u64;

    /// Whether the source is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Content-identifying string (typically the canonical path).
    ///
    /// Combined with the destination key to find a previous checkpoint.
    fn identity(&self) -> &str;

    /// Last modification time, used to reject checkpoints of a changed source.
    fn last_modified(&self) -> Option<DateTime<Utc>>;

    /// Read exactly `len` bytes starting at `offset`.
    async fn read_at(&mut self, offset: u64, len: usize) -> io::Result<Bytes>;
}

/// A file on local disk.
#[derive(Debug)]
pub struct FileSource {
    file: File,
    path: PathBuf,
    identity: String,
    len: u64,
    last_modified: Option<DateTime<Utc>>,
    position: u64,
}

impl FileSource {
    /// Open `path` for upload.
    ///
    /// The identity is the canonicalized path, so different spellings of the
    /// same file resume the same upload.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or is not a regular file.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).await?;
        let metadata = file.metadata().await?;

        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a regular file: {}", path.display()),
            ));
        }

        let canonical = tokio::fs::canonicalize(path)
            .await
            .unwrap_or_else(|_| path.to_path_buf());

        Ok(Self {
            file,
            identity: canonical.to_string_lossy().into_owned(),
            path: canonical,
            len: metadata.len(),
            last_modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            position: 0,
        })
    }

    /// Path of the file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DataSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.last_modified
    }

    async fn read_at(&mut self, offset: u64, len: usize) -> io::Result<Bytes> {
        if self.position != offset {
            // Unknown position until the seek succeeds
            self.position = u64::MAX;
            self.file.seek(SeekFrom::Start(offset)).await?;
            self.position = offset;
        }

        let mut buffer = vec![0u8; len];
        if let Err(e) = self.file.read_exact(&mut buffer).await {
            self.position = u64::MAX;
            return Err(e);
        }
        self.position = offset + len as u64;

        Ok(Bytes::from(buffer))
    }
}

/// An in-memory buffer.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Bytes,
    identity: String,
    last_modified: Option<DateTime<Utc>>,
}

impl MemorySource {
    /// Wrap `data`, identified by `identity`.
    pub fn new(identity: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            identity: identity.into(),
            last_modified: None,
        }
    }

    /// Set the modification time reported for this buffer.
    #[must_use]
    pub fn with_last_modified(mut self, last_modified: DateTime<Utc>) -> Self {
        self.last_modified = Some(last_modified);
        self
    }
}

#[async_trait]
impl DataSource for MemorySource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.last_modified
    }

    async fn read_at(&mut self, offset: u64, len: usize) -> io::Result<Bytes> {
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset out of range"))?;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("read of {len} bytes at {offset} past end of source"),
                )
            })?;

        Ok(self.data.slice(start..end))
    }
}
