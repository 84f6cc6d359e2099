//! Resume checkpoints and their persistence.
//!
//! An interrupted upload is resumed from a [`ResumeCheckpoint`]: the number of
//! blocks already acknowledged by the service plus the final context of each
//! of them. Checkpoints are serialized to JSON and handed to a
//! [`ResumeStore`] as opaque bytes, keyed by a [`Fingerprint`] derived from
//! the source identity and the destination key.
//!
//! Two stores are provided:
//!
//! - [`FileResumeStore`] keeps one file per fingerprint in a directory
//! - [`MemoryResumeStore`] keeps entries in process memory

pub mod file;

pub use file::FileResumeStore;

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::plan::ChunkPlan;

/// Current checkpoint format version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Key/value persistence for serialized checkpoints.
///
/// The store only sees bytes; at most one writer touches a given fingerprint
/// at a time.
#[async_trait]
pub trait ResumeStore: Send + Sync {
    /// Fetch the stored bytes for `fingerprint`, if any.
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Vec<u8>>>;

    /// Store `bytes` for `fingerprint`, replacing any previous value.
    ///
    /// Must not return before the value is durable.
    async fn set(&self, fingerprint: &Fingerprint, bytes: &[u8]) -> Result<()>;

    /// Remove the value for `fingerprint`. Removing a missing entry is not an error.
    async fn delete(&self, fingerprint: &Fingerprint) -> Result<()>;
}

/// Deterministic identifier of a (source, destination key) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Derive the fingerprint for uploading `source_id` to `key`.
    #[must_use]
    pub fn new(source_id: &str, key: &str) -> Self {
        let mut input = Vec::with_capacity(source_id.len() + key.len() + 1);
        input.extend_from_slice(source_id.as_bytes());
        input.push(0);
        input.extend_from_slice(key.as_bytes());

        let digest = xxhash_rust::xxh3::xxh3_128(&input);
        Self(format!("{digest:032x}"))
    }

    /// Parse a fingerprint previously rendered with [`Fingerprint::as_str`].
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        (s.len() == 32 && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()))
            .then(|| Self(s.to_string()))
    }

    /// The fingerprint as a lowercase hex string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted progress of one upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeCheckpoint {
    /// Format version
    pub version: u32,
    /// Total size of the source in bytes
    pub total_size: u64,
    /// Block size the contexts were produced with
    pub block_size: u32,
    /// Number of leading blocks acknowledged by the service.
    ///
    /// This is also the index of the next block to send.
    pub completed_blocks: u32,
    /// Final context of each block, in block order; empty until the block completes
    pub block_contexts: Vec<String>,
    /// Modification time of the source when the upload started
    pub source_last_modified: Option<DateTime<Utc>>,
    /// When the checkpoint was last written
    pub updated_at: DateTime<Utc>,
}

impl ResumeCheckpoint {
    /// Create an empty checkpoint for `plan`.
    #[must_use]
    pub fn new(plan: &ChunkPlan, source_last_modified: Option<DateTime<Utc>>) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            total_size: plan.total_size(),
            block_size: plan.block_size(),
            completed_blocks: 0,
            block_contexts: vec![String::new(); plan.block_count() as usize],
            source_last_modified,
            updated_at: Utc::now(),
        }
    }

    /// Record that block `index` finished with context `ctx`.
    ///
    /// Blocks complete strictly in order, so this also advances
    /// `completed_blocks` to `index + 1`.
    pub fn record_block(&mut self, index: u32, ctx: String) {
        let slot = index as usize;
        if slot < self.block_contexts.len() {
            self.block_contexts[slot] = ctx;
            self.completed_blocks = index + 1;
            self.updated_at = Utc::now();
        }
    }

    /// Whether every block has been acknowledged.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.completed_blocks as usize == self.block_contexts.len()
    }

    /// Contexts of the completed blocks, in block order.
    #[must_use]
    pub fn completed_contexts(&self) -> &[String] {
        let end = (self.completed_blocks as usize).min(self.block_contexts.len());
        &self.block_contexts[..end]
    }

    /// Check whether this checkpoint can resume an upload laid out as `plan`
    /// from a source last modified at `last_modified`.
    ///
    /// # Errors
    ///
    /// Returns the reason the checkpoint cannot be used.
    pub fn validate(
        &self,
        plan: &ChunkPlan,
        last_modified: Option<DateTime<Utc>>,
    ) -> std::result::Result<(), String> {
        if self.version != CHECKPOINT_VERSION {
            return Err(format!("unsupported checkpoint version {}", self.version));
        }
        if self.total_size != plan.total_size() {
            return Err(format!(
                "source size changed from {} to {}",
                self.total_size,
                plan.total_size()
            ));
        }
        if self.block_size != plan.block_size() {
            return Err(format!(
                "block size changed from {} to {}",
                self.block_size,
                plan.block_size()
            ));
        }
        if self.block_contexts.len() != plan.block_count() as usize {
            return Err(format!(
                "expected {} block contexts, found {}",
                plan.block_count(),
                self.block_contexts.len()
            ));
        }
        if self.completed_blocks > plan.block_count() {
            return Err(format!(
                "completed block count {} exceeds {}",
                self.completed_blocks,
                plan.block_count()
            ));
        }
        if self.source_last_modified != last_modified {
            return Err("source modification time changed".to_string());
        }
        if self.completed_contexts().iter().any(String::is_empty) {
            return Err("completed block without context".to_string());
        }
        Ok(())
    }

    /// Serialize to the persisted JSON form.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| {
            Error::Serialization(format!("Failed to serialize resume checkpoint: {e}"))
        })
    }

    /// Parse the persisted JSON form.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a checkpoint.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::Serialization(format!("Failed to parse resume checkpoint: {e}")))
    }
}

/// In-memory [`ResumeStore`].
///
/// Entries survive only as long as the store; useful for tests and for
/// callers that resume within one process.
#[derive(Debug, Default)]
pub struct MemoryResumeStore {
    entries: Mutex<HashMap<Fingerprint, Vec<u8>>>,
}

impl MemoryResumeStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.lock().map_or(0, |entries| entries.len())
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Fingerprint, Vec<u8>>>> {
        self.entries
            .lock()
            .map_err(|_| Error::ResumeStore("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl ResumeStore for MemoryResumeStore {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Vec<u8>>> {
        Ok(self.lock()?.get(fingerprint).cloned())
    }

    async fn set(&self, fingerprint: &Fingerprint, bytes: &[u8]) -> Result<()> {
        self.lock()?.insert(fingerprint.clone(), bytes.to_vec());
        Ok(())
    }

    async fn delete(&self, fingerprint: &Fingerprint) -> Result<()> {
        self.lock()?.remove(fingerprint);
        Ok(())
    }
}
