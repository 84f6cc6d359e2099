//! Per-upload options.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::client::{FinalizeReceipt, ObjectParams};
use crate::control::{
    CompletionCallback, ControlHandle, ProgressCallback, DEFAULT_PAUSE_POLL_INTERVAL,
};
use crate::error::{Error, Result};
use crate::plan::ChunkSize;

use super::UploadState;

/// Default number of attempts per wire call.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Upper bound on the number of attempts per wire call.
pub const MAX_ATTEMPTS_LIMIT: u32 = 20;

/// Default delay between attempts of the same wire call.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Receives every state transition of an upload.
pub type StateCallback = Arc<dyn Fn(UploadState) + Send + Sync>;

/// Options for one upload, built with [`UploadOptions::builder`].
#[derive(Clone)]
pub struct UploadOptions {
    pub(crate) chunk_size: ChunkSize,
    pub(crate) max_attempts: u32,
    pub(crate) retry_delay: Duration,
    pub(crate) pause_poll_interval: Duration,
    pub(crate) control: Option<ControlHandle>,
    pub(crate) on_progress: Option<ProgressCallback>,
    pub(crate) on_complete: Option<CompletionCallback>,
    pub(crate) on_state: Option<StateCallback>,
    pub(crate) finalize: ObjectParams,
}

impl UploadOptions {
    /// Start building options from the defaults.
    pub fn builder() -> UploadOptionsBuilder {
        UploadOptionsBuilder::default()
    }

    /// Configured chunk size.
    pub const fn chunk_size(&self) -> ChunkSize {
        self.chunk_size
    }

    /// Attempts per wire call.
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay between attempts.
    pub const fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Re-check interval while paused.
    pub const fn pause_poll_interval(&self) -> Duration {
        self.pause_poll_interval
    }

    /// Control handle, if one was attached.
    pub const fn control(&self) -> Option<&ControlHandle> {
        self.control.as_ref()
    }

    /// Finalize parameters for an object stored under `key`.
    pub(crate) fn object_params(&self, key: &str) -> ObjectParams {
        ObjectParams {
            key: key.to_string(),
            ..self.finalize.clone()
        }
    }

    pub(crate) fn emit_state(&self, state: UploadState) {
        tracing::debug!(?state, "Upload state");
        if let Some(on_state) = &self.on_state {
            on_state(state);
        }
    }
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            chunk_size: ChunkSize::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            pause_poll_interval: DEFAULT_PAUSE_POLL_INTERVAL,
            control: None,
            on_progress: None,
            on_complete: None,
            on_state: None,
            finalize: ObjectParams::default(),
        }
    }
}

impl fmt::Debug for UploadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadOptions")
            .field("chunk_size", &self.chunk_size)
            .field("max_attempts", &self.max_attempts)
            .field("retry_delay", &self.retry_delay)
            .field("pause_poll_interval", &self.pause_poll_interval)
            .field("control", &self.control)
            .field("finalize", &self.finalize)
            .finish_non_exhaustive()
    }
}

/// Builder for [`UploadOptions`].
#[derive(Debug, Clone, Default)]
pub struct UploadOptionsBuilder {
    options: UploadOptions,
}

impl UploadOptionsBuilder {
    /// Size of each chunk sent in one wire call.
    #[must_use]
    pub fn chunk_size(mut self, chunk_size: ChunkSize) -> Self {
        self.options.chunk_size = chunk_size;
        self
    }

    /// Attempts per wire call, between 1 and 20.
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.options.max_attempts = max_attempts;
        self
    }

    /// Delay between attempts of the same wire call.
    #[must_use]
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.options.retry_delay = delay;
        self
    }

    /// Re-check interval while paused.
    #[must_use]
    pub fn pause_poll_interval(mut self, interval: Duration) -> Self {
        self.options.pause_poll_interval = interval;
        self
    }

    /// Attach a pause/resume/abort switch.
    #[must_use]
    pub fn control(mut self, control: ControlHandle) -> Self {
        self.options.control = Some(control);
        self
    }

    /// Receive `(bytes_sent, total_bytes)` after every acknowledged chunk.
    #[must_use]
    pub fn on_progress(mut self, callback: impl Fn(u64, u64) + Send + Sync + 'static) -> Self {
        self.options.on_progress = Some(Arc::new(callback));
        self
    }

    /// Receive the committed object once finalize succeeds.
    #[must_use]
    pub fn on_complete(
        mut self,
        callback: impl Fn(&FinalizeReceipt) + Send + Sync + 'static,
    ) -> Self {
        self.options.on_complete = Some(Arc::new(callback));
        self
    }

    /// Receive every state transition.
    #[must_use]
    pub fn on_state(mut self, callback: impl Fn(UploadState) + Send + Sync + 'static) -> Self {
        self.options.on_state = Some(Arc::new(callback));
        self
    }

    /// MIME type recorded for the object.
    #[must_use]
    pub fn mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.options.finalize.mime_type = Some(mime_type.into());
        self
    }

    /// Original file name recorded for the object.
    #[must_use]
    pub fn file_name(mut self, file_name: impl Into<String>) -> Self {
        self.options.finalize.file_name = Some(file_name.into());
        self
    }

    /// Custom variable passed to finalize.
    #[must_use]
    pub fn custom_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options
            .finalize
            .custom_vars
            .insert(name.into(), value.into());
        self
    }

    /// Metadata entry stored with the object.
    #[must_use]
    pub fn metadata(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.finalize.metadata.insert(name.into(), value.into());
        self
    }

    /// Validate and build the options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `max_attempts` is outside 1..=20 or
    /// the pause poll interval is zero.
    pub fn build(self) -> Result<UploadOptions> {
        let options = self.options;

        if !(1..=MAX_ATTEMPTS_LIMIT).contains(&options.max_attempts) {
            return Err(Error::InvalidConfig {
                key: "max_attempts".to_string(),
                reason: format!(
                    "must be between 1 and {MAX_ATTEMPTS_LIMIT}, got {}",
                    options.max_attempts
                ),
            });
        }

        if options.pause_poll_interval.is_zero() {
            return Err(Error::InvalidConfig {
                key: "pause_poll_interval".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(options)
    }
}
