//! HTTP implementation of the block upload protocol.
//!
//! | call           | request                                           |
//! |----------------|---------------------------------------------------|
//! | allocate-block | `POST /mkblk/<block_size>` with the first chunk   |
//! | append-chunk   | `POST /bput/<ctx>/<offset>` with the next chunk   |
//! | finalize       | `POST /mkfile/<size>[/<param>/<b64>]*` with ctxs  |
//!
//! Every request carries `Authorization: UpToken <token>`. Responses are
//! classified by status code into a [`TransferOutcome`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::de::DeserializeOwned;

use crate::config::NetworkConfig;
use crate::error::{Error, Result};

use super::credentials::{StaticUpHost, UpHostProvider};
use super::{
    verify_block_receipt, FinalizeReceipt, ObjectParams, RetryReason, TransferClient,
    TransferOutcome, UpToken, STATUS_CHECKSUM_REJECTED, STATUS_CONFLICT, STATUS_CONTEXT_EXPIRED,
};

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Gateway status used by the service for an unreachable upstream.
const STATUS_GATEWAY_UNAVAILABLE: u16 = 996;

/// Transfer client speaking the block upload protocol over HTTP.
#[derive(Clone)]
pub struct HttpTransferClient {
    http: Client,
    hosts: Arc<dyn UpHostProvider>,
}

impl std::fmt::Debug for HttpTransferClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransferClient").finish_non_exhaustive()
    }
}

impl HttpTransferClient {
    /// Create a client resolving hosts through `hosts`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(hosts: Arc<dyn UpHostProvider>) -> Result<Self> {
        let http = Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .user_agent(concat!("blockput/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Http(format!("failed to build HTTP client: {e}")))?;

        Ok(Self::with_client(http, hosts))
    }

    /// Create a client from a pre-built `reqwest` client.
    pub fn with_client(http: Client, hosts: Arc<dyn UpHostProvider>) -> Self {
        Self { http, hosts }
    }

    /// Create a client from the network configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_config(config: &NetworkConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| Error::Http(format!("failed to build HTTP client: {e}")))?;

        Ok(Self::with_client(
            http,
            Arc::new(StaticUpHost::new(config.up_host.as_str())),
        ))
    }

    async fn post<T: DeserializeOwned>(
        &self,
        token: &UpToken,
        path: &str,
        content_type: &'static str,
        body: Bytes,
    ) -> TransferOutcome<T> {
        let host = match self.hosts.up_host().await {
            Ok(host) => host,
            Err(e) => {
                return TransferOutcome::NeedRetry {
                    reason: RetryReason::Transport(e.to_string()),
                }
            }
        };
        let url = format!("{host}{path}");

        let response = match self
            .http
            .post(&url)
            .header(AUTHORIZATION, token.authorization())
            .header(CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return transport_outcome(&e),
        };

        let status = response.status().as_u16();
        let reqid = response
            .headers()
            .get("X-Reqid")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => return transport_outcome(&e),
        };

        tracing::debug!(%url, status, reqid = ?reqid, "Upload call finished");
        classify_response(status, &body)
    }
}

#[async_trait]
impl TransferClient for HttpTransferClient {
    async fn allocate_block(
        &self,
        token: &UpToken,
        block_size: u32,
        first_chunk: Bytes,
    ) -> TransferOutcome {
        let path = format!("/mkblk/{block_size}");
        let expected = chunk_end(0, &first_chunk);
        match self
            .post(token, &path, "application/octet-stream", first_chunk.clone())
            .await
        {
            TransferOutcome::Ok(receipt) => verify_block_receipt(receipt, &first_chunk, expected),
            other => other,
        }
    }

    async fn append_chunk(
        &self,
        token: &UpToken,
        ctx: &str,
        offset_in_block: u32,
        chunk: Bytes,
    ) -> TransferOutcome {
        let path = format!("/bput/{ctx}/{offset_in_block}");
        let expected = chunk_end(offset_in_block, &chunk);
        match self
            .post(token, &path, "application/octet-stream", chunk.clone())
            .await
        {
            TransferOutcome::Ok(receipt) => verify_block_receipt(receipt, &chunk, expected),
            other => other,
        }
    }

    async fn finalize(
        &self,
        token: &UpToken,
        total_size: u64,
        params: &ObjectParams,
        contexts: &[String],
    ) -> TransferOutcome<FinalizeReceipt> {
        let path = mkfile_path(total_size, params);
        let body = Bytes::from(contexts.join(","));
        self.post(token, &path, "text/plain", body).await
    }
}

/// Offset within the block just past `chunk` sent at `offset`.
fn chunk_end(offset: u32, chunk: &[u8]) -> u32 {
    u32::try_from(chunk.len()).map_or(u32::MAX, |len| offset.saturating_add(len))
}

/// Build the finalize path for an object of `total_size` bytes.
///
/// Every parameter value is encoded with URL-safe base64.
pub fn mkfile_path(total_size: u64, params: &ObjectParams) -> String {
    let mut path = format!("/mkfile/{total_size}/key/{}", URL_SAFE.encode(&params.key));

    if let Some(mime_type) = &params.mime_type {
        path.push_str("/mimeType/");
        path.push_str(&URL_SAFE.encode(mime_type));
    }
    if let Some(file_name) = &params.file_name {
        path.push_str("/fname/");
        path.push_str(&URL_SAFE.encode(file_name));
    }
    for (name, value) in &params.custom_vars {
        path.push_str("/x:");
        path.push_str(name);
        path.push('/');
        path.push_str(&URL_SAFE.encode(value));
    }
    for (name, value) in &params.metadata {
        path.push_str("/x-qn-meta-");
        path.push_str(name);
        path.push('/');
        path.push_str(&URL_SAFE.encode(value));
    }

    path
}

fn transport_outcome<T>(err: &reqwest::Error) -> TransferOutcome<T> {
    let reason = if err.is_timeout() {
        RetryReason::Timeout
    } else {
        RetryReason::Transport(err.to_string())
    };
    TransferOutcome::NeedRetry { reason }
}

/// Classify a response by status code and decode the success body.
pub(crate) fn classify_response<T: DeserializeOwned>(status: u16, body: &[u8]) -> TransferOutcome<T> {
    match status {
        200..=299 => match serde_json::from_slice(body) {
            Ok(value) => TransferOutcome::Ok(value),
            Err(e) => TransferOutcome::Fatal {
                code: Some(status),
                message: format!("invalid response body: {e}"),
            },
        },
        STATUS_CHECKSUM_REJECTED => TransferOutcome::NeedRetry {
            reason: RetryReason::ChecksumRejected(error_message(body)),
        },
        STATUS_CONTEXT_EXPIRED => TransferOutcome::ContextExpired,
        STATUS_CONFLICT => TransferOutcome::Fatal {
            code: Some(status),
            message: error_message(body),
        },
        429 | 500..=599 | STATUS_GATEWAY_UNAVAILABLE => TransferOutcome::NeedRetry {
            reason: RetryReason::Server {
                status,
                message: error_message(body),
            },
        },
        _ => TransferOutcome::Fatal {
            code: Some(status),
            message: error_message(body),
        },
    }
}

/// Extract the `error` field of a JSON error body, falling back to the raw text.
fn error_message(body: &[u8]) -> String {
    #[derive(serde::Deserialize)]
    struct ErrorBody {
        error: String,
    }

    serde_json::from_slice::<ErrorBody>(body).map_or_else(
        |_| String::from_utf8_lossy(body).trim().to_string(),
        |b| b.error,
    )
}
