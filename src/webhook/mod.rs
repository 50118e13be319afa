// SPDX-License-Identifier: MIT
//! Inbound webhook endpoint: signature verification, event normalization,
//! delivery dedup, and job enqueueing.
//!
//! The HTTP handler answers as soon as jobs are enqueued — all indexing and
//! review work happens out of band in the worker pool. Signature mismatches
//! are rejected with 401 and create nothing; unrecognized event types are
//! acknowledged with 200 and create nothing.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{info, warn};

use crate::orchestrator::{JobKind, ReviewPayload};
use crate::AppContext;

const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const EVENT_HEADER: &str = "x-github-event";
const DELIVERY_HEADER: &str = "x-github-delivery";

// ─── Normalized events ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub id: i64,
    pub full_name: String,
}

/// Internal representation of a provider webhook, after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedEvent {
    Install {
        installation_id: i64,
        account: String,
        repositories: Vec<RepoRef>,
    },
    Uninstall {
        installation_id: i64,
    },
    Push {
        installation_id: i64,
        repo: RepoRef,
        head_sha: String,
    },
    PullRequest {
        installation_id: i64,
        repo: RepoRef,
        pr_number: i64,
        head_sha: String,
        base_sha: String,
    },
}

// ─── Raw payload shapes ───────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RawInstallation {
    id: i64,
    #[serde(default)]
    account: Option<RawAccount>,
}

#[derive(Deserialize)]
struct RawAccount {
    login: String,
}

#[derive(Deserialize)]
struct RawRepo {
    id: i64,
    full_name: String,
}

#[derive(Deserialize)]
struct InstallationPayload {
    action: String,
    installation: RawInstallation,
    #[serde(default)]
    repositories: Vec<RawRepo>,
}

#[derive(Deserialize)]
struct PushPayload {
    installation: RawInstallation,
    repository: RawRepo,
    /// Head commit SHA after the push.
    after: String,
}

#[derive(Deserialize)]
struct PullRequestPayload {
    action: String,
    number: i64,
    installation: RawInstallation,
    repository: RawRepo,
    pull_request: RawPullRequest,
}

#[derive(Deserialize)]
struct RawPullRequest {
    head: RawRef,
    base: RawRef,
}

#[derive(Deserialize)]
struct RawRef {
    sha: String,
}

// ─── Signature verification ───────────────────────────────────────────────────

/// Verify the `sha256=<hex>` HMAC of the raw payload. Constant-time via
/// `Mac::verify_slice`.
pub fn verify_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Some(signature_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(signature_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&signature_bytes).is_ok()
}

// ─── Classification ───────────────────────────────────────────────────────────

/// Classify a raw payload into a [`NormalizedEvent`]. `None` means the event
/// type (or action) is not one the pipeline acts on.
pub fn classify(event_name: &str, body: &[u8]) -> Option<NormalizedEvent> {
    match event_name {
        "installation" => {
            let p: InstallationPayload = serde_json::from_slice(body).ok()?;
            match p.action.as_str() {
                "created" => Some(NormalizedEvent::Install {
                    installation_id: p.installation.id,
                    account: p
                        .installation
                        .account
                        .map(|a| a.login)
                        .unwrap_or_default(),
                    repositories: p
                        .repositories
                        .into_iter()
                        .map(|r| RepoRef {
                            id: r.id,
                            full_name: r.full_name,
                        })
                        .collect(),
                }),
                "deleted" => Some(NormalizedEvent::Uninstall {
                    installation_id: p.installation.id,
                }),
                _ => None,
            }
        }
        "push" => {
            let p: PushPayload = serde_json::from_slice(body).ok()?;
            // Branch deletions push an all-zero head; nothing to index.
            if p.after.chars().all(|c| c == '0') {
                return None;
            }
            Some(NormalizedEvent::Push {
                installation_id: p.installation.id,
                repo: RepoRef {
                    id: p.repository.id,
                    full_name: p.repository.full_name,
                },
                head_sha: p.after,
            })
        }
        "pull_request" => {
            let p: PullRequestPayload = serde_json::from_slice(body).ok()?;
            if p.action != "opened" && p.action != "synchronize" {
                return None;
            }
            Some(NormalizedEvent::PullRequest {
                installation_id: p.installation.id,
                repo: RepoRef {
                    id: p.repository.id,
                    full_name: p.repository.full_name,
                },
                pr_number: p.number,
                head_sha: p.pull_request.head.sha,
                base_sha: p.pull_request.base.sha,
            })
        }
        _ => None,
    }
}

// ─── Event application ────────────────────────────────────────────────────────

/// Trigger id for install-time bootstrap indexing; the indexer resolves the
/// actual head commit when it runs.
pub const BOOTSTRAP_TRIGGER: &str = "initial";

/// Apply a normalized event: upsert records and enqueue jobs.
pub async fn apply_event(ctx: &AppContext, event: NormalizedEvent) -> anyhow::Result<()> {
    match event {
        NormalizedEvent::Install {
            installation_id,
            account,
            repositories,
        } => {
            ctx.storage.upsert_installation(installation_id, &account).await?;
            for repo in repositories {
                ctx.storage
                    .upsert_repository(repo.id, &repo.full_name, installation_id)
                    .await?;
                ctx.orchestrator
                    .enqueue(JobKind::Index, repo.id, BOOTSTRAP_TRIGGER, None, None)
                    .await?;
            }
            info!(installation_id, "installation created");
        }
        NormalizedEvent::Uninstall { installation_id } => {
            let repo_ids = ctx.storage.repo_ids_for_installation(installation_id).await?;
            ctx.orchestrator.cancel_for_repos(&repo_ids).await?;
            ctx.auth.invalidate(installation_id).await;
            ctx.storage.delete_installation(installation_id).await?;
            info!(installation_id, "installation removed — pending jobs cancelled");
        }
        NormalizedEvent::Push {
            installation_id,
            repo,
            head_sha,
        } => {
            ctx.storage
                .upsert_repository(repo.id, &repo.full_name, installation_id)
                .await?;
            ctx.orchestrator
                .enqueue(JobKind::Index, repo.id, &head_sha, None, None)
                .await?;
        }
        NormalizedEvent::PullRequest {
            installation_id,
            repo,
            pr_number,
            head_sha,
            base_sha,
        } => {
            ctx.storage
                .upsert_repository(repo.id, &repo.full_name, installation_id)
                .await?;

            // Review only depends on a fresh index job when the current index
            // does not already cover the head commit.
            let covered = ctx
                .storage
                .get_repository(repo.id)
                .await?
                .and_then(|r| r.last_indexed_sha)
                .is_some_and(|sha| sha == head_sha);
            let depends_on = if covered {
                None
            } else {
                Some(
                    ctx.orchestrator
                        .enqueue(JobKind::Index, repo.id, &head_sha, None, None)
                        .await?,
                )
            };

            let trigger = format!("pr-{pr_number}@{head_sha}");
            ctx.orchestrator
                .enqueue(
                    JobKind::Review,
                    repo.id,
                    &trigger,
                    depends_on.as_deref(),
                    Some(&ReviewPayload {
                        pr_number,
                        head_sha,
                        base_sha,
                    }),
                )
                .await?;
        }
    }
    Ok(())
}

// ─── HTTP server ──────────────────────────────────────────────────────────────

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/webhook", post(handle_webhook))
        .route("/health", get(health))
        .with_state(ctx)
}

pub async fn start_webhook_server(ctx: Arc<AppContext>) -> anyhow::Result<()> {
    let bind = format!("{}:{}", ctx.config.bind_address, ctx.config.port);
    let addr: std::net::SocketAddr = bind.parse()?;
    let router = build_router(ctx);

    info!("webhook endpoint listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

async fn health(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    let depth = ctx.orchestrator.queue_depth().await.unwrap_or(-1);
    Json(json!({
        "status": "ok",
        "queue_depth": depth,
        "uptime_secs": ctx.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn handle_webhook(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    // An unset secret would make HMAC verification pass for anyone who
    // guesses that it is unset; refuse ingestion outright instead.
    if ctx.config.provider.webhook_secret.is_empty() {
        warn!("webhook rejected: no webhook secret configured");
        return StatusCode::UNAUTHORIZED;
    }

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !verify_signature(&ctx.config.provider.webhook_secret, &body, signature) {
        warn!("webhook rejected: bad signature");
        return StatusCode::UNAUTHORIZED;
    }

    let event_name = headers
        .get(EVENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let delivery_id = headers
        .get(DELIVERY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    // Replayed deliveries are acknowledged without enqueueing anything. The
    // id is claimed up front so two concurrent copies cannot both ingest,
    // and released again if application fails — the provider redelivers
    // under the same id, and that redelivery must not be swallowed.
    if !delivery_id.is_empty() {
        match ctx.storage.try_record_delivery(&delivery_id).await {
            Ok(true) => {}
            Ok(false) => {
                info!(delivery_id, "duplicate delivery — already processed");
                return StatusCode::OK;
            }
            Err(e) => {
                warn!(delivery_id, "delivery dedup check failed: {e}");
                return StatusCode::INTERNAL_SERVER_ERROR;
            }
        }
    }

    let Some(event) = classify(&event_name, &body) else {
        info!(event = %event_name, "ignoring unhandled event type");
        return StatusCode::OK;
    };

    match apply_event(&ctx, event).await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            warn!(event = %event_name, delivery_id, "event application failed: {e}");
            if !delivery_id.is_empty() {
                if let Err(e) = ctx.storage.forget_delivery(&delivery_id).await {
                    warn!(delivery_id, "failed to release delivery id for replay: {e}");
                }
            }
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, payload: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn signature_round_trip() {
        let payload = br#"{"action":"opened"}"#;
        let sig = sign("hunter2", payload);
        assert!(verify_signature("hunter2", payload, &sig));
        assert!(!verify_signature("wrong-secret", payload, &sig));
        assert!(!verify_signature("hunter2", b"tampered", &sig));
        assert!(!verify_signature("hunter2", payload, "sha256=zz-not-hex"));
        assert!(!verify_signature("hunter2", payload, "md5=abcdef"));
    }

    #[test]
    fn classifies_push() {
        let body = serde_json::json!({
            "installation": {"id": 7},
            "repository": {"id": 10, "full_name": "acme/app"},
            "after": "abc123",
            "ref": "refs/heads/main"
        });
        let event = classify("push", body.to_string().as_bytes()).unwrap();
        assert_eq!(
            event,
            NormalizedEvent::Push {
                installation_id: 7,
                repo: RepoRef {
                    id: 10,
                    full_name: "acme/app".into()
                },
                head_sha: "abc123".into(),
            }
        );
    }

    #[test]
    fn branch_deletion_push_is_ignored() {
        let body = serde_json::json!({
            "installation": {"id": 7},
            "repository": {"id": 10, "full_name": "acme/app"},
            "after": "0000000000000000000000000000000000000000"
        });
        assert!(classify("push", body.to_string().as_bytes()).is_none());
    }

    #[test]
    fn classifies_pull_request_actions() {
        let body = |action: &str| {
            serde_json::json!({
                "action": action,
                "number": 42,
                "installation": {"id": 7},
                "repository": {"id": 10, "full_name": "acme/app"},
                "pull_request": {"head": {"sha": "def456"}, "base": {"sha": "abc123"}}
            })
            .to_string()
        };
        assert!(classify("pull_request", body("opened").as_bytes()).is_some());
        assert!(classify("pull_request", body("synchronize").as_bytes()).is_some());
        assert!(classify("pull_request", body("labeled").as_bytes()).is_none());
        assert!(classify("pull_request", body("closed").as_bytes()).is_none());
    }

    #[test]
    fn classifies_install_and_uninstall() {
        let created = serde_json::json!({
            "action": "created",
            "installation": {"id": 7, "account": {"login": "acme"}},
            "repositories": [{"id": 10, "full_name": "acme/app"}]
        });
        match classify("installation", created.to_string().as_bytes()).unwrap() {
            NormalizedEvent::Install {
                installation_id,
                account,
                repositories,
            } => {
                assert_eq!(installation_id, 7);
                assert_eq!(account, "acme");
                assert_eq!(repositories.len(), 1);
            }
            other => panic!("expected Install, got {other:?}"),
        }

        let deleted = serde_json::json!({
            "action": "deleted",
            "installation": {"id": 7}
        });
        assert_eq!(
            classify("installation", deleted.to_string().as_bytes()).unwrap(),
            NormalizedEvent::Uninstall { installation_id: 7 }
        );
    }

    #[test]
    fn unknown_event_types_are_ignored() {
        assert!(classify("star", b"{}").is_none());
        assert!(classify("workflow_run", b"{\"action\":\"completed\"}").is_none());
    }
}
