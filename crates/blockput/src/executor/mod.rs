//! Upload executor.
//!
//! Drives one transfer as an explicit state machine:
//!
//! ```text
//! Planning -> Resuming -> { Allocating | Appending }* -> Finalizing -> Done
//! ```
//!
//! with `Aborted` and `Failed` reachable from any non-terminal state.
//!
//! - Blocks are sent strictly in order; the chunks of a block are sent
//!   strictly in order, each one only after the previous context is known.
//! - After the last chunk of a block is acknowledged, a checkpoint covering
//!   the block is persisted before the next block starts.
//! - Every wire call is attempted up to `max_attempts` times. An expired
//!   context restarts the current block from its first chunk instead.
//! - The control handle is sampled at the start of each block only.

mod options;
mod report;

pub use options::{
    StateCallback, UploadOptions, UploadOptionsBuilder, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_RETRY_DELAY, MAX_ATTEMPTS_LIMIT,
};
pub use report::{FailureKind, UploadFailure, UploadReport, UploadState};

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::client::{
    TransferClient, TransferOutcome, UpToken, UpTokenProvider, STATUS_CONFLICT,
    STATUS_CONTEXT_EXPIRED,
};
use crate::control::{ControlHandle, ControlSignal, ControlState, ProgressReporter};
use crate::error::Result;
use crate::plan::{BlockSpan, ChunkPlan, ChunkSize};
use crate::resume::{Fingerprint, ResumeCheckpoint, ResumeStore};
use crate::source::DataSource;

/// Uploads data sources with resumable block transfers.
///
/// One uploader can run any number of independent uploads concurrently;
/// each upload owns its plan, checkpoint and source exclusively.
#[derive(Clone)]
pub struct ResumableUploader {
    client: Arc<dyn TransferClient>,
    store: Arc<dyn ResumeStore>,
    credentials: Arc<dyn UpTokenProvider>,
}

impl std::fmt::Debug for ResumableUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumableUploader").finish_non_exhaustive()
    }
}

impl ResumableUploader {
    /// Create an uploader from its collaborators.
    pub fn new(
        client: Arc<dyn TransferClient>,
        store: Arc<dyn ResumeStore>,
        credentials: Arc<dyn UpTokenProvider>,
    ) -> Self {
        Self {
            client,
            store,
            credentials,
        }
    }

    /// Upload `source` under `key`, resuming from a previous checkpoint
    /// for the same source and key when one is valid.
    ///
    /// # Errors
    ///
    /// Returns an [`UploadFailure`] carrying the last persisted checkpoint
    /// when the upload cannot complete.
    pub async fn upload<S>(
        &self,
        source: &mut S,
        key: &str,
        options: &UploadOptions,
    ) -> std::result::Result<UploadReport, UploadFailure>
    where
        S: DataSource + ?Sized,
    {
        options.emit_state(UploadState::Planning);
        let plan = ChunkPlan::new(source.len(), options.chunk_size)
            .map_err(|e| fail(options, Halt::new(FailureKind::SourceIo, None, e.to_string()), None))?;
        let fingerprint = Fingerprint::new(source.identity(), key);
        let last_modified = source.last_modified();

        tracing::info!(
            key,
            %fingerprint,
            total_size = plan.total_size(),
            blocks = plan.block_count(),
            chunk_size = plan.chunk_size(),
            "Starting upload"
        );

        options.emit_state(UploadState::Resuming);
        let resumed = self
            .load_checkpoint(&fingerprint, &plan, last_modified)
            .await
            .map_err(|halt| fail(options, halt, None))?;

        let token = self.credentials.up_token().await.map_err(|e| {
            fail(
                options,
                Halt::new(FailureKind::Credential, None, e.to_string()),
                resumed.clone(),
            )
        })?;

        let checkpoint = resumed
            .clone()
            .unwrap_or_else(|| ResumeCheckpoint::new(&plan, last_modified));

        let transfer = Transfer {
            uploader: self,
            source,
            options,
            key,
            fingerprint,
            token,
            plan,
            checkpoint,
            persisted: resumed,
            progress: ProgressReporter::new(options.on_progress.clone(), plan.total_size()),
            signal: options.control.as_ref().map(ControlHandle::signal),
        };

        transfer.run().await
    }

    /// The valid checkpoint an upload of `source` under `key` would resume from.
    ///
    /// # Errors
    ///
    /// Returns an error if the resume store cannot be read.
    pub async fn checkpoint_for<S>(&self, source: &S, key: &str) -> Result<Option<ResumeCheckpoint>>
    where
        S: DataSource + ?Sized,
    {
        let plan = ChunkPlan::new(source.len(), ChunkSize::default())?;
        let fingerprint = Fingerprint::new(source.identity(), key);

        let Some(bytes) = self.store.get(&fingerprint).await? else {
            return Ok(None);
        };

        Ok(decode_checkpoint(&bytes, &plan, source.last_modified()).ok())
    }

    /// Forget any checkpoint for `source` under `key`, so the next upload
    /// starts from the first byte.
    ///
    /// # Errors
    ///
    /// Returns an error if the resume store cannot be written.
    pub async fn discard_checkpoint<S>(&self, source: &S, key: &str) -> Result<()>
    where
        S: DataSource + ?Sized,
    {
        let fingerprint = Fingerprint::new(source.identity(), key);
        self.store.delete(&fingerprint).await?;
        tracing::info!(%fingerprint, "Discarded checkpoint");
        Ok(())
    }

    async fn load_checkpoint(
        &self,
        fingerprint: &Fingerprint,
        plan: &ChunkPlan,
        last_modified: Option<DateTime<Utc>>,
    ) -> std::result::Result<Option<ResumeCheckpoint>, Halt> {
        let bytes = self
            .store
            .get(fingerprint)
            .await
            .map_err(|e| Halt::new(FailureKind::Store, None, e.to_string()))?;

        let Some(bytes) = bytes else {
            return Ok(None);
        };

        match decode_checkpoint(&bytes, plan, last_modified) {
            Ok(checkpoint) => {
                tracing::info!(
                    %fingerprint,
                    completed_blocks = checkpoint.completed_blocks,
                    offset = plan.block_offset(checkpoint.completed_blocks),
                    "Resuming upload from checkpoint"
                );
                Ok(Some(checkpoint))
            }
            Err(reason) => {
                tracing::warn!(%fingerprint, %reason, "Discarding unusable checkpoint");
                if let Err(e) = self.store.delete(fingerprint).await {
                    tracing::warn!(%fingerprint, error = %e, "Failed to delete checkpoint");
                }
                Ok(None)
            }
        }
    }
}

/// Parse and validate a stored checkpoint against the current layout.
fn decode_checkpoint(
    bytes: &[u8],
    plan: &ChunkPlan,
    last_modified: Option<DateTime<Utc>>,
) -> std::result::Result<ResumeCheckpoint, String> {
    let checkpoint = ResumeCheckpoint::from_bytes(bytes).map_err(|e| e.to_string())?;
    checkpoint.validate(plan, last_modified)?;
    Ok(checkpoint)
}

/// Classified reason an upload stopped.
#[derive(Debug)]
struct Halt {
    kind: FailureKind,
    status: Option<u16>,
    message: String,
}

impl Halt {
    fn new(kind: FailureKind, status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            message: message.into(),
        }
    }
}

fn fail(
    options: &UploadOptions,
    halt: Halt,
    checkpoint: Option<ResumeCheckpoint>,
) -> UploadFailure {
    options.emit_state(UploadState::Failed);
    tracing::warn!(
        kind = %halt.kind,
        status = ?halt.status,
        completed_blocks = checkpoint.as_ref().map_or(0, |c| c.completed_blocks),
        "Upload failed: {}",
        halt.message
    );

    UploadFailure {
        kind: halt.kind,
        status: halt.status,
        message: halt.message,
        checkpoint,
    }
}

/// Result of one wire call after retries.
#[derive(Debug)]
enum Step<T> {
    Done(T),
    Expired,
    Cancelled,
}

/// Result of sending one block.
enum BlockEnd {
    Completed(String),
    Cancelled,
}

/// Run `call` until it succeeds, fails fatally or exhausts the attempt budget.
async fn with_retry<T, F, Fut>(
    options: &UploadOptions,
    what: &'static str,
    mut call: F,
) -> std::result::Result<Step<T>, Halt>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = TransferOutcome<T>>,
{
    let max_attempts = options.max_attempts;
    let mut attempt = 1;

    loop {
        match call().await {
            TransferOutcome::Ok(value) => return Ok(Step::Done(value)),
            TransferOutcome::ContextExpired => return Ok(Step::Expired),
            TransferOutcome::Cancelled => return Ok(Step::Cancelled),
            TransferOutcome::Fatal { code, message } => {
                let kind = if code == Some(STATUS_CONFLICT) {
                    FailureKind::Conflict
                } else {
                    FailureKind::ProtocolFatal
                };
                return Err(Halt::new(kind, code, format!("{what}: {message}")));
            }
            TransferOutcome::NeedRetry { reason } => {
                if attempt >= max_attempts {
                    let kind = if reason.is_integrity() {
                        FailureKind::Integrity
                    } else {
                        FailureKind::Transient
                    };
                    return Err(Halt::new(
                        kind,
                        reason.status(),
                        format!("{what} failed after {attempt} attempts: {reason}"),
                    ));
                }

                tracing::warn!(call = what, attempt, max_attempts, %reason, "Retrying");
                if !options.retry_delay.is_zero() {
                    tokio::time::sleep(options.retry_delay).await;
                }
                attempt += 1;
            }
        }
    }
}

/// State of one running upload.
struct Transfer<'a, S: ?Sized> {
    uploader: &'a ResumableUploader,
    source: &'a mut S,
    options: &'a UploadOptions,
    key: &'a str,
    fingerprint: Fingerprint,
    token: UpToken,
    plan: ChunkPlan,
    checkpoint: ResumeCheckpoint,
    persisted: Option<ResumeCheckpoint>,
    progress: ProgressReporter,
    signal: Option<ControlSignal>,
}

impl<S> Transfer<'_, S>
where
    S: DataSource + ?Sized,
{
    async fn run(mut self) -> std::result::Result<UploadReport, UploadFailure> {
        let first = self.checkpoint.completed_blocks;
        self.progress.report(self.plan.block_offset(first));

        for index in first..self.plan.block_count() {
            if let Some(signal) = self.signal.as_mut() {
                let state = signal
                    .wait_while_paused(self.options.pause_poll_interval)
                    .await;
                if state == ControlState::Aborted {
                    return Ok(self.cancelled());
                }
            }

            let Some(block) = self.plan.block(index) else {
                break;
            };

            let ctx = match self.upload_block(block).await {
                Ok(BlockEnd::Completed(ctx)) => ctx,
                Ok(BlockEnd::Cancelled) => return Ok(self.cancelled()),
                Err(halt) => return Err(self.fail(halt)),
            };

            self.checkpoint.record_block(index, ctx);
            if let Err(halt) = self.persist().await {
                return Err(self.fail(halt));
            }
        }

        self.finalize().await
    }

    async fn upload_block(&mut self, block: BlockSpan) -> std::result::Result<BlockEnd, Halt> {
        let client = self.uploader.client.as_ref();
        let mut restarts = 0;

        'block: loop {
            let mut ctx: Option<String> = None;

            for chunk in block.chunks() {
                self.options.emit_state(if chunk.is_first() {
                    UploadState::Allocating { block: block.index }
                } else {
                    UploadState::Appending {
                        block: block.index,
                        chunk: chunk.index_in_block,
                    }
                });

                let data = self
                    .source
                    .read_at(chunk.file_offset, chunk.len as usize)
                    .await
                    .map_err(|e| {
                        Halt::new(
                            FailureKind::SourceIo,
                            None,
                            format!(
                                "failed to read {} bytes at offset {}: {e}",
                                chunk.len, chunk.file_offset
                            ),
                        )
                    })?;

                let token = &self.token;
                let step = match ctx.as_deref() {
                    None => {
                        with_retry(self.options, "allocate-block", || {
                            client.allocate_block(token, block.len, data.clone())
                        })
                        .await?
                    }
                    Some(prev) => {
                        with_retry(self.options, "append-chunk", || {
                            client.append_chunk(token, prev, chunk.offset_in_block, data.clone())
                        })
                        .await?
                    }
                };

                match step {
                    Step::Done(receipt) => {
                        tracing::debug!(
                            block = block.index,
                            chunk = chunk.index_in_block,
                            offset = receipt.offset,
                            "Chunk acknowledged"
                        );
                        ctx = Some(receipt.ctx);
                        self.progress
                            .report(chunk.file_offset + u64::from(chunk.len));
                    }
                    Step::Expired => {
                        restarts += 1;
                        if restarts > self.options.max_attempts {
                            return Err(Halt::new(
                                FailureKind::ContextExpired,
                                Some(STATUS_CONTEXT_EXPIRED),
                                format!("context of block {} expired {restarts} times", block.index),
                            ));
                        }
                        tracing::warn!(
                            block = block.index,
                            restarts,
                            "Block context expired, restarting block"
                        );
                        continue 'block;
                    }
                    Step::Cancelled => return Ok(BlockEnd::Cancelled),
                }
            }

            return ctx.map(BlockEnd::Completed).ok_or_else(|| {
                Halt::new(
                    FailureKind::ProtocolFatal,
                    None,
                    format!("block {} produced no context", block.index),
                )
            });
        }
    }

    async fn persist(&mut self) -> std::result::Result<(), Halt> {
        let bytes = self
            .checkpoint
            .to_bytes()
            .map_err(|e| Halt::new(FailureKind::Store, None, e.to_string()))?;

        self.uploader
            .store
            .set(&self.fingerprint, &bytes)
            .await
            .map_err(|e| Halt::new(FailureKind::Store, None, e.to_string()))?;

        tracing::debug!(
            fingerprint = %self.fingerprint,
            completed_blocks = self.checkpoint.completed_blocks,
            "Checkpoint persisted"
        );
        self.persisted = Some(self.checkpoint.clone());
        Ok(())
    }

    async fn finalize(mut self) -> std::result::Result<UploadReport, UploadFailure> {
        self.options.emit_state(UploadState::Finalizing);

        let client = self.uploader.client.as_ref();
        let token = &self.token;
        let total_size = self.plan.total_size();
        let params = self.options.object_params(self.key);
        let contexts = self.checkpoint.completed_contexts().to_vec();

        let step = with_retry(self.options, "finalize", || {
            client.finalize(token, total_size, &params, &contexts)
        })
        .await;

        match step {
            Ok(Step::Done(receipt)) => {
                self.clear_checkpoint().await;
                self.options.emit_state(UploadState::Done);
                tracing::info!(
                    key = self.key,
                    hash = receipt.hash.as_deref().unwrap_or_default(),
                    total_size,
                    "Upload complete"
                );
                if let Some(on_complete) = &self.options.on_complete {
                    on_complete(&receipt);
                }
                Ok(UploadReport::Completed(receipt))
            }
            Ok(Step::Expired) => {
                self.clear_checkpoint().await;
                self.persisted = None;
                Err(self.fail(Halt::new(
                    FailureKind::ContextExpired,
                    Some(STATUS_CONTEXT_EXPIRED),
                    "block contexts expired before finalize",
                )))
            }
            Ok(Step::Cancelled) => Ok(self.cancelled()),
            Err(halt) => Err(self.fail(halt)),
        }
    }

    async fn clear_checkpoint(&self) {
        if let Err(e) = self.uploader.store.delete(&self.fingerprint).await {
            tracing::warn!(
                fingerprint = %self.fingerprint,
                error = %e,
                "Failed to delete checkpoint"
            );
        }
    }

    fn cancelled(&self) -> UploadReport {
        self.options.emit_state(UploadState::Aborted);
        tracing::info!(
            key = self.key,
            completed_blocks = self.persisted.as_ref().map_or(0, |c| c.completed_blocks),
            "Upload cancelled"
        );
        UploadReport::Cancelled {
            checkpoint: self.persisted.clone(),
        }
    }

    fn fail(&self, halt: Halt) -> UploadFailure {
        fail(self.options, halt, self.persisted.clone())
    }
}
