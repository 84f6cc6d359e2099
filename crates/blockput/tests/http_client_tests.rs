//! HTTP transfer client tests against a mock upload service.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use bytes::Bytes;
use serde_json::json;
use wiremock::matchers::{body_string, header, method, path, path_regex};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use blockput::{
    ChunkSize, HttpTransferClient, MemoryResumeStore, MemorySource, ObjectParams,
    ResumableUploader, RetryReason, StaticUpHost, StaticUpToken, TransferClient,
    TransferOutcome, UpToken, UploadOptions,
};
use common::MIB;

fn client_for(server: &MockServer) -> HttpTransferClient {
    HttpTransferClient::new(Arc::new(StaticUpHost::new(server.uri()))).expect("build client")
}

fn token() -> UpToken {
    UpToken::new("ak:sign:policy")
}

fn block_reply(ctx: &str, data: &[u8], offset: usize) -> serde_json::Value {
    json!({
        "ctx": ctx,
        "checksum": "sha1",
        "crc32": crc32fast::hash(data),
        "offset": offset,
        "host": "http://up.example.com",
        "expired_at": 1_900_000_000
    })
}

#[tokio::test]
async fn test_allocate_block_sends_protocol_headers() {
    let server = MockServer::start().await;
    let chunk = common::random_bytes(1024);

    Mock::given(method("POST"))
        .and(path("/mkblk/4194304"))
        .and(header("Authorization", "UpToken ak:sign:policy"))
        .and(header("Content-Type", "application/octet-stream"))
        .respond_with(ResponseTemplate::new(200).set_body_json(block_reply("ctx-1", &chunk, 1024)))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = client_for(&server)
        .allocate_block(&token(), 4 * MIB as u32, Bytes::from(chunk))
        .await;

    match outcome {
        TransferOutcome::Ok(receipt) => {
            assert_eq!(receipt.ctx, "ctx-1");
            assert_eq!(receipt.offset, 1024);
            assert_eq!(receipt.expired_at, Some(1_900_000_000));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn test_append_chunk_detects_crc_mismatch() {
    let server = MockServer::start().await;
    let chunk = common::random_bytes(2048);
    let mut reply = block_reply("ctx-2", &chunk, 3072);
    reply["crc32"] = json!(crc32fast::hash(&chunk) ^ 0xffff);

    Mock::given(method("POST"))
        .and(path("/bput/ctx-1/1024"))
        .respond_with(ResponseTemplate::new(200).set_body_json(reply))
        .mount(&server)
        .await;

    let outcome = client_for(&server)
        .append_chunk(&token(), "ctx-1", 1024, Bytes::from(chunk))
        .await;

    assert!(matches!(
        outcome,
        TransferOutcome::NeedRetry {
            reason: RetryReason::ChecksumMismatch { .. }
        }
    ));
}

#[tokio::test]
async fn test_append_chunk_detects_offset_mismatch() {
    let server = MockServer::start().await;
    let chunk = common::random_bytes(2048);

    Mock::given(method("POST"))
        .and(path("/bput/ctx-1/1024"))
        .respond_with(ResponseTemplate::new(200).set_body_json(block_reply("ctx-2", &chunk, 2048)))
        .mount(&server)
        .await;

    let outcome = client_for(&server)
        .append_chunk(&token(), "ctx-1", 1024, Bytes::from(chunk))
        .await;

    assert!(matches!(
        outcome,
        TransferOutcome::NeedRetry {
            reason: RetryReason::OffsetMismatch {
                expected: 3072,
                actual: 2048
            }
        }
    ));
}

#[tokio::test]
async fn test_finalize_encodes_params_and_joins_contexts() {
    let server = MockServer::start().await;
    let params = ObjectParams::new("photos/2024/cat.jpg")
        .with_mime_type("image/jpeg")
        .with_file_name("cat.jpg")
        .with_custom_var("album", "pets")
        .with_metadata("camera", "x100");

    let expected_path = format!(
        "/mkfile/5242880/key/{}/mimeType/{}/fname/{}/x:album/{}/x-qn-meta-camera/{}",
        URL_SAFE.encode("photos/2024/cat.jpg"),
        URL_SAFE.encode("image/jpeg"),
        URL_SAFE.encode("cat.jpg"),
        URL_SAFE.encode("pets"),
        URL_SAFE.encode("x100"),
    );

    Mock::given(method("POST"))
        .and(path(expected_path.as_str()))
        .and(header("Content-Type", "text/plain"))
        .and(body_string("c1,c2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "key": "photos/2024/cat.jpg",
            "hash": "FhQ2",
            "fsize": 5_242_880,
            "bucket": "media"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = client_for(&server)
        .finalize(
            &token(),
            5 * MIB as u64,
            &params,
            &["c1".to_string(), "c2".to_string()],
        )
        .await;

    match outcome {
        TransferOutcome::Ok(receipt) => {
            assert_eq!(receipt.key.as_deref(), Some("photos/2024/cat.jpg"));
            assert_eq!(receipt.hash.as_deref(), Some("FhQ2"));
            assert_eq!(receipt.size, Some(5 * MIB as u64));
            assert_eq!(receipt.extra.get("bucket"), Some(&json!("media")));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn test_status_classification() {
    let server = MockServer::start().await;

    Mock::given(path("/bput/expired/0"))
        .respond_with(ResponseTemplate::new(701).set_body_json(json!({"error": "expired context"})))
        .mount(&server)
        .await;
    Mock::given(path("/bput/busy/0"))
        .respond_with(ResponseTemplate::new(503).set_body_string("service unavailable"))
        .mount(&server)
        .await;
    Mock::given(path("/bput/corrupt/0"))
        .respond_with(ResponseTemplate::new(406).set_body_json(json!({"error": "crc32 not match"})))
        .mount(&server)
        .await;
    Mock::given(path("/bput/denied/0"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "bad token"})))
        .mount(&server)
        .await;
    Mock::given(path_regex("^/mkfile/"))
        .respond_with(ResponseTemplate::new(614).set_body_json(json!({"error": "file exists"})))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let chunk = || Bytes::from_static(b"chunk");

    assert!(matches!(
        client.append_chunk(&token(), "expired", 0, chunk()).await,
        TransferOutcome::ContextExpired
    ));

    match client.append_chunk(&token(), "busy", 0, chunk()).await {
        TransferOutcome::NeedRetry {
            reason: RetryReason::Server { status, message },
        } => {
            assert_eq!(status, 503);
            assert_eq!(message, "service unavailable");
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    match client.append_chunk(&token(), "corrupt", 0, chunk()).await {
        TransferOutcome::NeedRetry {
            reason: RetryReason::ChecksumRejected(message),
        } => assert_eq!(message, "crc32 not match"),
        other => panic!("unexpected outcome {other:?}"),
    }

    match client.append_chunk(&token(), "denied", 0, chunk()).await {
        TransferOutcome::Fatal { code, message } => {
            assert_eq!(code, Some(401));
            assert_eq!(message, "bad token");
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    let outcome = client
        .finalize(&token(), 5, &ObjectParams::new("dup"), &["c".to_string()])
        .await;
    assert!(outcome.is_conflict());
}

#[tokio::test]
async fn test_undecodable_success_body_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(path("/mkblk/4194304"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>proxy</html>"))
        .mount(&server)
        .await;

    let outcome = client_for(&server)
        .allocate_block(&token(), 4 * MIB as u32, Bytes::from_static(b"data"))
        .await;

    assert!(matches!(outcome, TransferOutcome::Fatal { code: Some(200), .. }));
}

#[tokio::test]
async fn test_connection_refused_is_retryable() {
    let client =
        HttpTransferClient::new(Arc::new(StaticUpHost::new("http://127.0.0.1:1"))).expect("build client");

    let outcome = client
        .allocate_block(&token(), 4 * MIB as u32, Bytes::from_static(b"data"))
        .await;

    assert!(matches!(
        outcome,
        TransferOutcome::NeedRetry {
            reason: RetryReason::Transport(_)
        }
    ));
}

/// Answers `mkblk`/`bput`/`mkfile` the way the real service does, counting calls.
#[derive(Default)]
struct ProtocolResponder {
    calls: AtomicUsize,
}

impl Respond for ProtocolResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let segments: Vec<&str> = request.url.path().trim_start_matches('/').split('/').collect();
        let body = &request.body;

        match segments.as_slice() {
            ["mkblk", _] => {
                ResponseTemplate::new(200).set_body_json(block_reply(&format!("blk{n}"), body, body.len()))
            }
            ["bput", _, offset] => {
                let Ok(offset) = offset.parse::<usize>() else {
                    return ResponseTemplate::new(400);
                };
                let end = offset + body.len();
                ResponseTemplate::new(200).set_body_json(block_reply(&format!("blk{n}"), body, end))
            }
            ["mkfile", size, "key", key, ..] => {
                let key = URL_SAFE
                    .decode(key)
                    .map(|k| String::from_utf8_lossy(&k).into_owned())
                    .unwrap_or_default();
                let contexts = String::from_utf8_lossy(body).split(',').count();
                ResponseTemplate::new(200).set_body_json(json!({
                    "key": key,
                    "hash": format!("blocks-{contexts}"),
                    "fsize": size.parse::<u64>().unwrap_or_default(),
                }))
            }
            _ => ResponseTemplate::new(404),
        }
    }
}

#[tokio::test]
async fn test_full_upload_over_http() {
    common::init_tracing();
    let server = MockServer::start().await;
    let responder = ProtocolResponder::default();
    Mock::given(method("POST"))
        .and(header("Authorization", "UpToken ak:sign:policy"))
        .respond_with(responder)
        .mount(&server)
        .await;

    let uploader = ResumableUploader::new(
        Arc::new(client_for(&server)),
        Arc::new(MemoryResumeStore::new()),
        Arc::new(StaticUpToken::new("ak:sign:policy")),
    );
    let options = UploadOptions::builder()
        .chunk_size(ChunkSize::Mib2)
        .retry_delay(Duration::ZERO)
        .build()
        .expect("valid options");

    // 6 MiB: block 0 in two chunks, block 1 in one
    let mut source = MemorySource::new("mem://six-mib", common::random_bytes(6 * MIB));
    let report = uploader
        .upload(&mut source, "media/six.bin", &options)
        .await
        .expect("upload succeeds");

    let receipt = report.receipt().expect("completed");
    assert_eq!(receipt.key.as_deref(), Some("media/six.bin"));
    assert_eq!(receipt.hash.as_deref(), Some("blocks-2"));
    assert_eq!(receipt.size, Some(6 * MIB as u64));

    let requests = server.received_requests().await.expect("recording enabled");
    let paths: Vec<String> = requests.iter().map(|r| r.url.path().to_string()).collect();
    assert_eq!(paths.len(), 4);
    assert_eq!(paths[0], "/mkblk/4194304");
    assert_eq!(paths[1], "/bput/blk0/2097152");
    assert_eq!(paths[2], "/mkblk/2097152");
    assert!(paths[3].starts_with("/mkfile/6291456/key/"));
    assert_eq!(String::from_utf8_lossy(&requests[3].body), "blk1,blk2");
}
