//! Upload credential and host providers.
//!
//! Token signing and host discovery happen outside this crate; the executor
//! only asks a provider for the current value before each transfer.

use async_trait::async_trait;

use crate::error::{Error, Result};

use super::UpToken;

/// Supplies the upload token for a transfer.
#[async_trait]
pub trait UpTokenProvider: Send + Sync {
    /// Current upload token.
    async fn up_token(&self) -> Result<UpToken>;
}

/// Supplies the base URL of the upload service.
#[async_trait]
pub trait UpHostProvider: Send + Sync {
    /// Base URL, without a trailing slash.
    async fn up_host(&self) -> Result<String>;
}

/// A fixed, pre-computed upload token.
#[derive(Debug, Clone)]
pub struct StaticUpToken(UpToken);

impl StaticUpToken {
    /// Wrap a pre-computed token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(UpToken::new(token))
    }
}

#[async_trait]
impl UpTokenProvider for StaticUpToken {
    async fn up_token(&self) -> Result<UpToken> {
        if self.0.as_str().is_empty() {
            return Err(Error::Credential("upload token is empty".to_string()));
        }
        Ok(self.0.clone())
    }
}

/// A single fixed upload host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticUpHost(String);

impl StaticUpHost {
    /// Use `host` for every call.
    ///
    /// A bare host name gets an `https://` scheme.
    pub fn new(host: impl Into<String>) -> Self {
        let host = host.into();
        let host = host.trim().trim_end_matches('/');
        if host.contains("://") {
            Self(host.to_string())
        } else {
            Self(format!("https://{host}"))
        }
    }

    /// The normalized base URL.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[async_trait]
impl UpHostProvider for StaticUpHost {
    async fn up_host(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}
