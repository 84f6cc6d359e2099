//! Transfer client: the three wire calls of the block upload protocol.
//!
//! - **allocate-block** (`mkblk`) creates a block seeded with its first chunk
//! - **append-chunk** (`bput`) appends the next chunk to an allocated block
//! - **finalize** (`mkfile`) commits the object from the per-block contexts
//!
//! A client never retries. Every call returns a [`TransferOutcome`] that the
//! executor classifies and acts on. Chunk integrity is checked here: when the
//! service echoes a CRC32 of what it received, it must match the CRC32 of
//! the bytes that were sent.

pub mod credentials;
pub mod http;

pub use credentials::{StaticUpHost, StaticUpToken, UpHostProvider, UpTokenProvider};
pub use http::HttpTransferClient;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Status returned when the destination already exists under incompatible settings.
pub const STATUS_CONFLICT: u16 = 614;

/// Status returned when a block context is unknown or expired.
pub const STATUS_CONTEXT_EXPIRED: u16 = 701;

/// Status returned when the service rejects a chunk's checksum.
pub const STATUS_CHECKSUM_REJECTED: u16 = 406;

/// Opaque upload credential attached to every wire call.
#[derive(Clone, PartialEq, Eq)]
pub struct UpToken(String);

impl UpToken {
    /// Wrap a pre-computed token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Value of the `Authorization` header.
    #[must_use]
    pub fn authorization(&self) -> String {
        format!("UpToken {}", self.0)
    }
}

impl fmt::Debug for UpToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UpToken(<redacted>)")
    }
}

/// Response to allocate-block and append-chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockReceipt {
    /// Context superseding any previous context of the block
    pub ctx: String,
    /// Service-side digest of the chunk
    #[serde(default)]
    pub checksum: Option<String>,
    /// CRC32 of the chunk as received by the service
    #[serde(default)]
    pub crc32: Option<u32>,
    /// Offset within the block after this chunk
    pub offset: u32,
    /// Host that served the call
    #[serde(default)]
    pub host: Option<String>,
    /// Unix time after which the context is no longer accepted
    #[serde(default)]
    pub expired_at: Option<i64>,
}

/// Response to finalize: the committed object.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FinalizeReceipt {
    /// Object key
    #[serde(default)]
    pub key: Option<String>,
    /// Content hash computed by the service
    #[serde(default)]
    pub hash: Option<String>,
    /// Object size in bytes
    #[serde(default, alias = "fsize")]
    pub size: Option<u64>,
    /// Any other fields the service returned
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Why a wire call may succeed if repeated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryReason {
    /// Connection, DNS or I/O failure in the transport
    Transport(String),
    /// The transport timed out
    Timeout,
    /// Server-side or throttling status
    Server {
        /// HTTP status code
        status: u16,
        /// Message from the response body
        message: String,
    },
    /// The CRC32 echoed by the service differs from the CRC32 of the bytes sent
    ChecksumMismatch {
        /// CRC32 of the bytes sent
        sent: u32,
        /// CRC32 reported by the service
        received: u32,
    },
    /// The service rejected the chunk's checksum
    ChecksumRejected(String),
    /// The service acknowledged a different end offset than the chunk implies
    OffsetMismatch {
        /// Offset implied by the chunk sent
        expected: u32,
        /// Offset reported by the service
        actual: u32,
    },
}

impl RetryReason {
    /// Whether the retry is caused by corrupted chunk data.
    #[must_use]
    pub const fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. } | Self::ChecksumRejected(_) | Self::OffsetMismatch { .. }
        )
    }

    /// HTTP status behind this reason, if any.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Server { status, .. } => Some(*status),
            Self::ChecksumRejected(_) => Some(STATUS_CHECKSUM_REJECTED),
            _ => None,
        }
    }
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Timeout => f.write_str("request timed out"),
            Self::Server { status, message } => write!(f, "server error {status}: {message}"),
            Self::ChecksumMismatch { sent, received } => {
                write!(f, "crc32 mismatch: sent {sent:08x}, service saw {received:08x}")
            }
            Self::ChecksumRejected(message) => write!(f, "checksum rejected: {message}"),
            Self::OffsetMismatch { expected, actual } => {
                write!(f, "offset mismatch: expected {expected}, service reported {actual}")
            }
        }
    }
}

/// Classified result of one wire call.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome<T = BlockReceipt> {
    /// The call succeeded
    Ok(T),
    /// The call failed in a way that may succeed if repeated with the same input
    NeedRetry {
        /// What went wrong
        reason: RetryReason,
    },
    /// The block context is unknown to the service; the block must restart
    ContextExpired,
    /// The call can never succeed
    Fatal {
        /// HTTP status, when the failure came from the service
        code: Option<u16>,
        /// Diagnostic detail
        message: String,
    },
    /// The call was abandoned because the transfer was cancelled
    Cancelled,
}

impl<T> TransferOutcome<T> {
    /// Whether this is [`TransferOutcome::Ok`].
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    /// Whether this is a fatal conflict with an existing object.
    pub const fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::Fatal {
                code: Some(STATUS_CONFLICT),
                ..
            }
        )
    }
}

/// Parameters of the object committed by finalize.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectParams {
    /// Destination key
    pub key: String,
    /// MIME type recorded for the object
    pub mime_type: Option<String>,
    /// Original file name
    pub file_name: Option<String>,
    /// Custom variables, sent as `x:<name>`
    pub custom_vars: BTreeMap<String, String>,
    /// Object metadata, sent as `x-qn-meta-<name>`
    pub metadata: BTreeMap<String, String>,
}

impl ObjectParams {
    /// Parameters for an object stored under `key`.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    /// Set the MIME type.
    #[must_use]
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Set the original file name.
    #[must_use]
    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    /// Add a custom variable.
    #[must_use]
    pub fn with_custom_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_vars.insert(name.into(), value.into());
        self
    }

    /// Add an object metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(name.into(), value.into());
        self
    }
}

/// The wire calls of the block upload protocol.
#[async_trait]
pub trait TransferClient: Send + Sync {
    /// Create a block of `block_size` bytes seeded with `first_chunk`.
    async fn allocate_block(
        &self,
        token: &UpToken,
        block_size: u32,
        first_chunk: Bytes,
    ) -> TransferOutcome;

    /// Append `chunk` at `offset_in_block` to the block identified by `ctx`.
    async fn append_chunk(
        &self,
        token: &UpToken,
        ctx: &str,
        offset_in_block: u32,
        chunk: Bytes,
    ) -> TransferOutcome;

    /// Commit an object of `total_size` bytes from `contexts`, one per block in order.
    async fn finalize(
        &self,
        token: &UpToken,
        total_size: u64,
        params: &ObjectParams,
        contexts: &[String],
    ) -> TransferOutcome<FinalizeReceipt>;
}

/// Check a block receipt against the chunk that was sent.
///
/// `expected_offset` is the offset within the block just past the chunk.
pub fn verify_block_receipt(
    receipt: BlockReceipt,
    sent: &[u8],
    expected_offset: u32,
) -> TransferOutcome {
    if let Some(received) = receipt.crc32 {
        let sent = crc32fast::hash(sent);
        if sent != received {
            return TransferOutcome::NeedRetry {
                reason: RetryReason::ChecksumMismatch { sent, received },
            };
        }
    }

    if receipt.offset != expected_offset {
        return TransferOutcome::NeedRetry {
            reason: RetryReason::OffsetMismatch {
                expected: expected_offset,
                actual: receipt.offset,
            },
        };
    }

    TransferOutcome::Ok(receipt)
}
