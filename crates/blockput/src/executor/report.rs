//! Upload states and results.

use std::fmt;

use thiserror::Error;

use crate::client::FinalizeReceipt;
use crate::resume::ResumeCheckpoint;

/// Phase of a running upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    /// Computing the block layout
    Planning,
    /// Looking for a previous checkpoint
    Resuming,
    /// Sending the first chunk of a block
    Allocating {
        /// Block index
        block: u32,
    },
    /// Sending a later chunk of a block
    Appending {
        /// Block index
        block: u32,
        /// Chunk index within the block
        chunk: u32,
    },
    /// Committing the object
    Finalizing,
    /// The object was committed
    Done,
    /// The upload was cancelled
    Aborted,
    /// The upload failed
    Failed,
}

impl UploadState {
    /// Whether no further transitions can follow.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Aborted | Self::Failed)
    }
}

/// Successful end of an upload call.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadReport {
    /// The object was committed
    Completed(FinalizeReceipt),
    /// The upload was cancelled by its control handle
    Cancelled {
        /// Last durably persisted checkpoint, if any
        checkpoint: Option<ResumeCheckpoint>,
    },
}

impl UploadReport {
    /// The committed object, if the upload completed.
    pub const fn receipt(&self) -> Option<&FinalizeReceipt> {
        match self {
            Self::Completed(receipt) => Some(receipt),
            Self::Cancelled { .. } => None,
        }
    }

    /// Whether the upload was cancelled.
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Classification of a failed upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Network, timeout or server errors outlasted the retry budget
    Transient,
    /// Chunk integrity checks kept failing
    Integrity,
    /// Block contexts kept expiring, or expired at finalize
    ContextExpired,
    /// The destination already exists under incompatible settings
    Conflict,
    /// The data source could not be read
    SourceIo,
    /// The service returned an unexpected or undecodable response
    ProtocolFatal,
    /// The resume store could not be read or written
    Store,
    /// No upload credential could be obtained
    Credential,
}

impl FailureKind {
    /// Short name used in logs and messages.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Integrity => "integrity",
            Self::ContextExpired => "context expired",
            Self::Conflict => "conflict",
            Self::SourceIo => "source I/O",
            Self::ProtocolFatal => "protocol",
            Self::Store => "resume store",
            Self::Credential => "credential",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failed upload.
///
/// Carries the last classified outcome and the last checkpoint that was
/// durably persisted, so a caller can tell "nothing was saved" apart from
/// "resumable, retry later".
#[derive(Debug, Clone, Error)]
#[error("{kind} failure: {message}")]
pub struct UploadFailure {
    /// What went wrong
    pub kind: FailureKind,
    /// HTTP status of the last failed call, if any
    pub status: Option<u16>,
    /// Diagnostic detail
    pub message: String,
    /// Last durably persisted checkpoint; `None` if nothing was saved
    pub checkpoint: Option<ResumeCheckpoint>,
}

impl UploadFailure {
    /// Whether calling upload again for the same source and key will skip
    /// already acknowledged blocks.
    pub const fn is_resumable(&self) -> bool {
        self.checkpoint.is_some() && !matches!(self.kind, FailureKind::Conflict)
    }

    /// Number of blocks a retry would skip.
    pub fn completed_blocks(&self) -> u32 {
        self.checkpoint.as_ref().map_or(0, |c| c.completed_blocks)
    }
}
