//! Directory-backed resume store.
//!
//! Each fingerprint maps to one file in the resume directory. Writes go to a
//! temporary file which is synced and then renamed over the target, so a
//! crash mid-write leaves the previous checkpoint in place.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};

use super::{Fingerprint, ResumeStore};

/// File extension for checkpoint files.
pub const RESUME_FILE_EXTENSION: &str = ".blockput-resume";

/// Default expiry for checkpoint files (7 days).
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Resume store keeping one file per fingerprint.
///
/// Checkpoint files are stored in platform-specific directories by default:
/// - Linux: `~/.local/share/blockput/resume/`
/// - macOS: `~/Library/Application Support/blockput/resume/`
/// - Windows: `%APPDATA%\blockput\resume\`
#[derive(Debug, Clone)]
pub struct FileResumeStore {
    /// Directory where checkpoint files are stored.
    resume_dir: PathBuf,
}

impl FileResumeStore {
    /// Create a store in the default platform-specific directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the resume directory cannot be created.
    pub async fn new() -> Result<Self> {
        Self::with_dir(Self::default_resume_dir()).await
    }

    /// Create a store in a custom directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn with_dir(resume_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&resume_dir).await.map_err(|e| {
            Error::ResumeStore(format!(
                "Failed to create resume directory {}: {e}",
                resume_dir.display()
            ))
        })?;

        Ok(Self { resume_dir })
    }

    /// Get the default platform-specific resume directory.
    #[must_use]
    pub fn default_resume_dir() -> PathBuf {
        let data_dir = directories::ProjectDirs::from("", "", "blockput").map_or_else(
            || PathBuf::from(".blockput"),
            |dirs| dirs.data_dir().to_path_buf(),
        );

        data_dir.join("resume")
    }

    /// Get the resume directory path.
    #[must_use]
    pub fn resume_dir(&self) -> &Path {
        &self.resume_dir
    }

    fn resume_file_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.resume_dir
            .join(format!("{fingerprint}{RESUME_FILE_EXTENSION}"))
    }

    fn fingerprint_of(path: &Path) -> Option<Fingerprint> {
        path.file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_suffix(RESUME_FILE_EXTENSION))
            .and_then(Fingerprint::parse)
    }

    /// List the fingerprints that currently have a checkpoint file.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub async fn fingerprints(&self) -> Result<Vec<Fingerprint>> {
        let mut fingerprints = Vec::new();
        let mut entries = fs::read_dir(&self.resume_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if let Some(fp) = Self::fingerprint_of(&entry.path()) {
                fingerprints.push(fp);
            }
        }

        fingerprints.sort();
        Ok(fingerprints)
    }

    /// Remove checkpoint files older than [`DEFAULT_EXPIRY`].
    ///
    /// # Returns
    ///
    /// The number of files removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        self.cleanup_older_than(DEFAULT_EXPIRY).await
    }

    /// Remove checkpoint files not modified within `max_age`.
    ///
    /// # Returns
    ///
    /// The number of files removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub async fn cleanup_older_than(&self, max_age: Duration) -> Result<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut cleaned = 0;

        let mut entries = fs::read_dir(&self.resume_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(fingerprint) = Self::fingerprint_of(&path) else {
                continue;
            };

            let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) else {
                continue;
            };

            if modified < cutoff {
                if let Err(e) = fs::remove_file(&path).await {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to delete expired checkpoint"
                    );
                } else {
                    tracing::debug!(%fingerprint, "Cleaned up expired checkpoint");
                    cleaned += 1;
                }
            }
        }

        if cleaned > 0 {
            tracing::info!(count = cleaned, "Cleaned up expired checkpoints");
        }

        Ok(cleaned)
    }
}

#[async_trait]
impl ResumeStore for FileResumeStore {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Vec<u8>>> {
        let path = self.resume_file_path(fingerprint);

        match fs::read(&path).await {
            Ok(bytes) => {
                tracing::debug!(%fingerprint, path = %path.display(), "Loaded checkpoint");
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::ResumeStore(format!(
                "Failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    async fn set(&self, fingerprint: &Fingerprint, bytes: &[u8]) -> Result<()> {
        let path = self.resume_file_path(fingerprint);
        let temp_path = path.with_extension("tmp");

        let write = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &path).await
        };

        write.await.map_err(|e| {
            Error::ResumeStore(format!("Failed to write {}: {e}", path.display()))
        })?;

        tracing::debug!(%fingerprint, path = %path.display(), "Saved checkpoint");
        Ok(())
    }

    async fn delete(&self, fingerprint: &Fingerprint) -> Result<()> {
        let path = self.resume_file_path(fingerprint);

        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(%fingerprint, path = %path.display(), "Deleted checkpoint");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::ResumeStore(format!(
                "Failed to delete {}: {e}",
                path.display()
            ))),
        }
    }
}
