//! Common test utilities for blockput integration tests.
//!
//! Provides an in-process fake of the upload service, plus data source and
//! resume store wrappers that record what the executor did.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use blockput::client::verify_block_receipt;
use blockput::{
    BlockReceipt, DataSource, Error, FinalizeReceipt, Fingerprint, MemoryResumeStore,
    MemorySource, ObjectParams, ResumeCheckpoint, ResumeStore, RetryReason, TransferClient,
    TransferOutcome, UpToken,
};

/// One MiB.
pub const MIB: usize = 1024 * 1024;

/// Install a test subscriber honoring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Create a temporary directory for test files.
pub fn create_temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Create a test file with the given content.
pub fn create_test_file(dir: &std::path::Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).expect("Failed to write test file");
    path
}

/// Generate random bytes for testing.
pub fn random_bytes(size: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// A wire call received by [`ScriptedClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// `mkblk`
    Allocate {
        /// Declared block size
        block_size: u32,
        /// Chunk bytes
        data: Bytes,
    },
    /// `bput`
    Append {
        /// Context the chunk was appended to
        ctx: String,
        /// Offset within the block
        offset: u32,
        /// Chunk bytes
        data: Bytes,
    },
    /// `mkfile`
    Finalize {
        /// Declared object size
        total_size: u64,
        /// Object key
        key: String,
        /// Block contexts in order
        contexts: Vec<String>,
    },
}

impl Call {
    /// Whether this call opened a block.
    pub fn is_allocate(&self) -> bool {
        matches!(self, Self::Allocate { .. })
    }

    /// Whether this call finalized the object.
    pub fn is_finalize(&self) -> bool {
        matches!(self, Self::Finalize { .. })
    }

    /// Chunk bytes carried by the call.
    pub fn data(&self) -> Option<&Bytes> {
        match self {
            Self::Allocate { data, .. } | Self::Append { data, .. } => Some(data),
            Self::Finalize { .. } => None,
        }
    }
}

/// Failure injected into one call of [`ScriptedClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Transport timeout
    Transient,
    /// Acknowledge with a CRC32 that does not match the chunk
    CorruptCrc,
    /// Report the block context as unknown
    ContextExpired,
    /// Fail with the given status code
    Fatal(u16),
}

#[derive(Default)]
struct ScriptState {
    calls: Vec<Call>,
    faults: HashMap<usize, Fault>,
    /// Context -> offset within the block after the chunk it acknowledged
    contexts: HashMap<String, u32>,
    finalized: HashSet<String>,
}

/// In-process fake of the upload service.
///
/// Contexts are derived from the previous context and the chunk bytes, so
/// replaying a chunk yields the same context. Faults are keyed by the
/// zero-based sequence number of the call.
#[derive(Default)]
pub struct ScriptedClient {
    state: Mutex<ScriptState>,
}

impl ScriptedClient {
    /// Create a fake service with no faults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject `fault` into call number `seq`.
    pub fn fail_call(&self, seq: usize, fault: Fault) {
        self.state.lock().unwrap().faults.insert(seq, fault);
    }

    /// Every call received so far.
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Number of calls received so far.
    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }

    /// Forget every block context, as the service does when they expire.
    pub fn expire_contexts(&self) {
        self.state.lock().unwrap().contexts.clear();
    }

    fn record(&self, call: Call) -> (usize, Option<Fault>) {
        let mut state = self.state.lock().unwrap();
        let seq = state.calls.len();
        state.calls.push(call);
        (seq, state.faults.get(&seq).copied())
    }

    fn acknowledge(&self, prev_ctx: &str, data: &[u8], end: u32, corrupt: bool) -> TransferOutcome {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(prev_ctx.as_bytes());
        hasher.update(data);
        let ctx = format!("ctx-{:08x}-{end}", hasher.finalize());

        self.state
            .lock()
            .unwrap()
            .contexts
            .insert(ctx.clone(), end);

        let crc = crc32fast::hash(data);
        let receipt = BlockReceipt {
            ctx,
            checksum: None,
            crc32: Some(if corrupt { crc ^ 1 } else { crc }),
            offset: end,
            host: Some("fake.upload".to_string()),
            expired_at: None,
        };

        verify_block_receipt(receipt, data, end)
    }
}

fn fault_outcome<T>(fault: Fault) -> Option<TransferOutcome<T>> {
    match fault {
        Fault::Transient => Some(TransferOutcome::NeedRetry {
            reason: RetryReason::Timeout,
        }),
        Fault::ContextExpired => Some(TransferOutcome::ContextExpired),
        Fault::Fatal(code) => Some(TransferOutcome::Fatal {
            code: Some(code),
            message: format!("injected status {code}"),
        }),
        Fault::CorruptCrc => None,
    }
}

fn chunk_len(data: &[u8]) -> u32 {
    u32::try_from(data.len()).expect("chunk fits in u32")
}

#[async_trait]
impl TransferClient for ScriptedClient {
    async fn allocate_block(
        &self,
        token: &UpToken,
        block_size: u32,
        first_chunk: Bytes,
    ) -> TransferOutcome {
        assert_eq!(token.as_str(), "test-token");
        let (_, fault) = self.record(Call::Allocate {
            block_size,
            data: first_chunk.clone(),
        });

        if let Some(outcome) = fault.and_then(fault_outcome) {
            return outcome;
        }

        let end = chunk_len(&first_chunk);
        assert!(end <= block_size, "first chunk larger than block");
        self.acknowledge("", &first_chunk, end, fault == Some(Fault::CorruptCrc))
    }

    async fn append_chunk(
        &self,
        token: &UpToken,
        ctx: &str,
        offset_in_block: u32,
        chunk: Bytes,
    ) -> TransferOutcome {
        assert_eq!(token.as_str(), "test-token");
        let (_, fault) = self.record(Call::Append {
            ctx: ctx.to_string(),
            offset: offset_in_block,
            data: chunk.clone(),
        });

        if let Some(outcome) = fault.and_then(fault_outcome) {
            return outcome;
        }

        let known = self.state.lock().unwrap().contexts.get(ctx).copied();
        match known {
            None => TransferOutcome::ContextExpired,
            Some(end) if end != offset_in_block => TransferOutcome::Fatal {
                code: Some(400),
                message: format!("offset {offset_in_block} does not follow {end}"),
            },
            Some(_) => {
                let end = offset_in_block + chunk_len(&chunk);
                self.acknowledge(ctx, &chunk, end, fault == Some(Fault::CorruptCrc))
            }
        }
    }

    async fn finalize(
        &self,
        token: &UpToken,
        total_size: u64,
        params: &ObjectParams,
        contexts: &[String],
    ) -> TransferOutcome<FinalizeReceipt> {
        assert_eq!(token.as_str(), "test-token");
        let (_, fault) = self.record(Call::Finalize {
            total_size,
            key: params.key.clone(),
            contexts: contexts.to_vec(),
        });

        if let Some(outcome) = fault.and_then(fault_outcome) {
            return outcome;
        }

        let mut state = self.state.lock().unwrap();
        if contexts.iter().any(|ctx| !state.contexts.contains_key(ctx)) {
            return TransferOutcome::ContextExpired;
        }
        if !state.finalized.insert(params.key.clone()) {
            return TransferOutcome::Fatal {
                code: Some(614),
                message: "file exists".to_string(),
            };
        }

        TransferOutcome::Ok(FinalizeReceipt {
            key: Some(params.key.clone()),
            hash: Some(format!("{:08x}", crc32fast::hash(contexts.join(",").as_bytes()))),
            size: Some(total_size),
            extra: serde_json::Map::new(),
        })
    }
}

/// In-memory source that records every read and can fail past an offset.
pub struct RecordingSource {
    inner: MemorySource,
    reads: Arc<Mutex<Vec<(u64, usize)>>>,
    fail_from: Option<u64>,
}

impl RecordingSource {
    /// Wrap `data` identified by `identity`.
    pub fn new(identity: &str, data: Vec<u8>) -> Self {
        Self {
            inner: MemorySource::new(identity, data),
            reads: Arc::default(),
            fail_from: None,
        }
    }

    /// Report `last_modified` as the modification time.
    pub fn with_last_modified(mut self, last_modified: DateTime<Utc>) -> Self {
        self.inner = self.inner.with_last_modified(last_modified);
        self
    }

    /// Fail every read starting at or after `offset`.
    pub fn failing_from(mut self, offset: u64) -> Self {
        self.fail_from = Some(offset);
        self
    }

    /// `(offset, len)` of every read so far.
    pub fn reads(&self) -> Vec<(u64, usize)> {
        self.reads.lock().unwrap().clone()
    }
}

#[async_trait]
impl DataSource for RecordingSource {
    fn len(&self) -> u64 {
        self.inner.len()
    }

    fn identity(&self) -> &str {
        self.inner.identity()
    }

    fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.inner.last_modified()
    }

    async fn read_at(&mut self, offset: u64, len: usize) -> io::Result<Bytes> {
        self.reads.lock().unwrap().push((offset, len));
        if self.fail_from.is_some_and(|from| offset >= from) {
            return Err(io::Error::other("simulated disk failure"));
        }
        self.inner.read_at(offset, len).await
    }
}

/// Memory store that records every checkpoint written and can reject writes.
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryResumeStore,
    writes: Mutex<Vec<ResumeCheckpoint>>,
    fail_writes: Mutex<bool>,
}

impl RecordingStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every subsequent write.
    pub fn fail_writes(&self) {
        *self.fail_writes.lock().unwrap() = true;
    }

    /// Every checkpoint written so far, in order.
    pub fn writes(&self) -> Vec<ResumeCheckpoint> {
        self.writes.lock().unwrap().clone()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// The checkpoint currently stored under `fingerprint`.
    pub async fn stored(&self, fingerprint: &Fingerprint) -> Option<ResumeCheckpoint> {
        self.inner
            .get(fingerprint)
            .await
            .expect("memory store read")
            .map(|bytes| ResumeCheckpoint::from_bytes(&bytes).expect("valid checkpoint"))
    }
}

#[async_trait]
impl ResumeStore for RecordingStore {
    async fn get(&self, fingerprint: &Fingerprint) -> blockput::Result<Option<Vec<u8>>> {
        self.inner.get(fingerprint).await
    }

    async fn set(&self, fingerprint: &Fingerprint, bytes: &[u8]) -> blockput::Result<()> {
        if *self.fail_writes.lock().unwrap() {
            return Err(Error::ResumeStore("disk full".to_string()));
        }
        let checkpoint = ResumeCheckpoint::from_bytes(bytes)?;
        self.writes.lock().unwrap().push(checkpoint);
        self.inner.set(fingerprint, bytes).await
    }

    async fn delete(&self, fingerprint: &Fingerprint) -> blockput::Result<()> {
        self.inner.delete(fingerprint).await
    }
}
