// SPDX-License-Identifier: MIT
//! HTTP-level webhook endpoint tests.
//! Spins up the webhook server on a random port and drives it with raw
//! signed POST requests, the way the provider's delivery system would.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use reviewd::config::ReviewdConfig;
use reviewd::error::PipelineError;
use reviewd::provider::{InstallationToken, ProviderClient, TreeEntry};
use reviewd::reasoner::{ReasonerClient, ReviewDraft};
use reviewd::review::ReviewOutput;
use reviewd::storage::Storage;
use reviewd::webhook::start_webhook_server;
use reviewd::AppContext;

const SECRET: &str = "hunter2";

/// Neither client is reachable from the ingestion path; every method is a
/// hard failure so an unexpected call surfaces as a test error.
struct OfflineProvider;

#[async_trait]
impl ProviderClient for OfflineProvider {
    async fn exchange_token(&self, _: i64) -> Result<InstallationToken, PipelineError> {
        Err(PipelineError::Fetch("offline".into()))
    }
    async fn head_commit(&self, _: &str, _: &str) -> Result<String, PipelineError> {
        Err(PipelineError::Fetch("offline".into()))
    }
    async fn list_tree(&self, _: &str, _: &str, _: &str) -> Result<Vec<TreeEntry>, PipelineError> {
        Err(PipelineError::Fetch("offline".into()))
    }
    async fn fetch_blob(
        &self,
        _: &str,
        _: &str,
        _: &str,
        _: &str,
    ) -> Result<String, PipelineError> {
        Err(PipelineError::Fetch("offline".into()))
    }
    async fn fetch_diff(
        &self,
        _: &str,
        _: &str,
        _: &str,
        _: &str,
    ) -> Result<String, PipelineError> {
        Err(PipelineError::Fetch("offline".into()))
    }
    async fn post_review(
        &self,
        _: &str,
        _: &str,
        _: i64,
        _: &ReviewOutput,
    ) -> Result<String, PipelineError> {
        Err(PipelineError::Fetch("offline".into()))
    }
}

struct OfflineReasoner;

#[async_trait]
impl ReasonerClient for OfflineReasoner {
    async fn summarize_file(&self, _: &str, _: &str) -> Result<String, PipelineError> {
        Err(PipelineError::ReviewGeneration("offline".into()))
    }
    async fn generate_review(&self, _: &str) -> Result<ReviewDraft, PipelineError> {
        Err(PipelineError::ReviewGeneration("offline".into()))
    }
}

/// Find a free local port by binding to port 0.
fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Build an AppContext with the webhook server running on a random port.
async fn serve(dir: &TempDir, secret: &str) -> (Arc<AppContext>, u16) {
    let port = find_free_port();
    let mut config = ReviewdConfig::new(
        Some(port),
        Some(dir.path().to_path_buf()),
        Some("error".to_string()),
        Some(1),
    );
    config.provider.webhook_secret = secret.to_string();
    let storage = Arc::new(Storage::new(dir.path()).await.unwrap());
    let ctx = Arc::new(AppContext::new(
        Arc::new(config),
        storage,
        Arc::new(OfflineProvider),
        Arc::new(OfflineReasoner),
    ));

    let server_ctx = ctx.clone();
    tokio::spawn(async move {
        let _ = start_webhook_server(server_ctx).await;
    });
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    (ctx, port)
}

fn sign(secret: &str, payload: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// POST a delivery and return the HTTP status code.
async fn post_webhook(port: u16, event: &str, delivery: &str, signature: &str, body: &str) -> u16 {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{port}"))
        .await
        .unwrap();
    let request = format!(
        "POST /webhook HTTP/1.1\r\n\
         Host: localhost\r\n\
         Content-Type: application/json\r\n\
         x-github-event: {event}\r\n\
         x-github-delivery: {delivery}\r\n\
         x-hub-signature-256: {signature}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{body}",
        body.len(),
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    let response = String::from_utf8_lossy(&buf);
    let first_line = response.lines().next().unwrap_or("").to_string();
    first_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status code in response line")
}

fn install_body() -> String {
    serde_json::json!({
        "action": "created",
        "installation": {"id": 7, "account": {"login": "acme"}},
        "repositories": [{"id": 10, "full_name": "acme/app"}]
    })
    .to_string()
}

#[tokio::test]
async fn bad_signature_is_rejected_without_side_effects() {
    let dir = TempDir::new().unwrap();
    let (ctx, port) = serve(&dir, SECRET).await;

    let body = install_body();
    let sig = sign("wrong-secret", body.as_bytes());
    let status = post_webhook(port, "installation", "d-1", &sig, &body).await;

    assert_eq!(status, 401);
    assert_eq!(ctx.orchestrator.queue_depth().await.unwrap(), 0);
    // The rejected delivery id must stay available for a correctly signed retry.
    let sig = sign(SECRET, body.as_bytes());
    assert_eq!(post_webhook(port, "installation", "d-1", &sig, &body).await, 200);
    assert_eq!(ctx.orchestrator.queue_depth().await.unwrap(), 1);
}

#[tokio::test]
async fn unconfigured_secret_refuses_all_ingestion() {
    let dir = TempDir::new().unwrap();
    let (ctx, port) = serve(&dir, "").await;

    // Signed consistently with the empty secret — still refused.
    let body = install_body();
    let sig = sign("", body.as_bytes());
    let status = post_webhook(port, "installation", "d-1", &sig, &body).await;

    assert_eq!(status, 401);
    assert_eq!(ctx.orchestrator.queue_depth().await.unwrap(), 0);
}

#[tokio::test]
async fn duplicate_delivery_is_acknowledged_without_new_jobs() {
    let dir = TempDir::new().unwrap();
    let (ctx, port) = serve(&dir, SECRET).await;

    let body = install_body();
    let sig = sign(SECRET, body.as_bytes());
    assert_eq!(post_webhook(port, "installation", "d-1", &sig, &body).await, 200);
    assert_eq!(post_webhook(port, "installation", "d-1", &sig, &body).await, 200);

    // One bootstrap index job, not two.
    assert_eq!(ctx.orchestrator.queue_depth().await.unwrap(), 1);
}

#[tokio::test]
async fn failed_ingestion_leaves_the_delivery_replayable() {
    let dir = TempDir::new().unwrap();
    let (ctx, port) = serve(&dir, SECRET).await;
    let pool = ctx.storage.pool();

    // Take the job queue offline so event application fails mid-ingestion.
    sqlx::query("ALTER TABLE jobs RENAME TO jobs_offline")
        .execute(&pool)
        .await
        .unwrap();

    let body = install_body();
    let sig = sign(SECRET, body.as_bytes());
    assert_eq!(post_webhook(port, "installation", "d-1", &sig, &body).await, 500);

    sqlx::query("ALTER TABLE jobs_offline RENAME TO jobs")
        .execute(&pool)
        .await
        .unwrap();

    // The provider redelivers under the same id; it must not be treated as a
    // duplicate of the failed attempt.
    assert_eq!(post_webhook(port, "installation", "d-1", &sig, &body).await, 200);
    assert_eq!(ctx.orchestrator.queue_depth().await.unwrap(), 1);
}
