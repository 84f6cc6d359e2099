//! # blockput
//!
//! `blockput` is a client-side engine for uploading large objects to HTTP
//! object storage in resumable blocks.
//!
//! ## Features
//!
//! - **Block/chunk protocol**: 4 MiB blocks sent as 256 KiB to 4 MiB chunks
//!   through `mkblk`, `bput` and `mkfile`
//! - **Resumable**: a checkpoint is persisted after every block, so a
//!   restarted upload never re-sends acknowledged blocks
//! - **Verified**: every chunk's CRC32 is checked against the service's echo
//! - **Controllable**: pause, resume and abort at block boundaries, with
//!   monotonic progress reporting
//!
//! ## Modules
//!
//! - [`plan`] - Block and chunk layout
//! - [`resume`] - Checkpoints and resume stores
//! - [`client`] - Wire calls and their classified outcomes
//! - [`source`] - Seekable data sources
//! - [`executor`] - The upload state machine
//! - [`control`] - Pause/resume/abort and progress
//! - [`config`] - Configuration management
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use blockput::{Config, FileSource, HttpTransferClient, ResumableUploader, StaticUpToken};
//!
//! let config = Config::load()?;
//! let uploader = ResumableUploader::new(
//!     Arc::new(HttpTransferClient::from_config(&config.network)?),
//!     Arc::new(config.resume.open_store().await?),
//!     Arc::new(StaticUpToken::new(token)),
//! );
//!
//! let mut source = FileSource::open("backup.tar").await?;
//! let options = config.upload.to_options().build()?;
//! let report = uploader.upload(&mut source, "backups/backup.tar", &options).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]

pub mod client;
pub mod config;
pub mod control;
pub mod error;
pub mod executor;
pub mod plan;
pub mod resume;
pub mod source;

pub use client::{
    BlockReceipt, FinalizeReceipt, HttpTransferClient, ObjectParams, RetryReason,
    StaticUpHost, StaticUpToken, TransferClient, TransferOutcome, UpHostProvider, UpToken,
    UpTokenProvider,
};
pub use config::Config;
pub use control::{ControlHandle, ControlState};
pub use error::{Error, Result};
pub use executor::{
    FailureKind, ResumableUploader, UploadFailure, UploadOptions, UploadReport, UploadState,
};
pub use plan::{ChunkPlan, ChunkSize, BLOCK_SIZE};
pub use resume::{FileResumeStore, Fingerprint, MemoryResumeStore, ResumeCheckpoint, ResumeStore};
pub use source::{DataSource, FileSource, MemorySource};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
