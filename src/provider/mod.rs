// SPDX-License-Identifier: MIT
//! Hosting-provider API client.
//!
//! [`ProviderClient`] is the seam between the pipeline and the provider's
//! REST API: installation token exchange, tree/blob/diff reads, and review
//! publishing. The HTTP implementation wraps every call in its configured
//! timeout and maps HTTP status classes onto the pipeline error taxonomy so
//! callers never see raw `reqwest` errors.

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::config::ProviderConfig;
use crate::error::PipelineError;
use crate::review::ReviewOutput;

/// Short-lived per-installation access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallationToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// One blob in a repository tree listing. `content_hash` is the
/// provider-reported content address of the blob — two entries with equal
/// hashes have byte-identical content.
#[derive(Debug, Clone, Deserialize)]
pub struct TreeEntry {
    pub path: String,
    pub content_hash: String,
}

/// Outbound provider API surface used by the pipeline.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Exchange application credentials for an installation token.
    async fn exchange_token(
        &self,
        installation_id: i64,
    ) -> Result<InstallationToken, PipelineError>;

    /// Head commit SHA of the repository's default branch.
    async fn head_commit(
        &self,
        token: &str,
        repo_full_name: &str,
    ) -> Result<String, PipelineError>;

    /// Recursive blob listing of the tree at `commit_sha`.
    async fn list_tree(
        &self,
        token: &str,
        repo_full_name: &str,
        commit_sha: &str,
    ) -> Result<Vec<TreeEntry>, PipelineError>;

    /// Raw content of one blob at `commit_sha`.
    async fn fetch_blob(
        &self,
        token: &str,
        repo_full_name: &str,
        commit_sha: &str,
        path: &str,
    ) -> Result<String, PipelineError>;

    /// Unified diff between `base_sha` and `head_sha`.
    async fn fetch_diff(
        &self,
        token: &str,
        repo_full_name: &str,
        base_sha: &str,
        head_sha: &str,
    ) -> Result<String, PipelineError>;

    /// Post review findings to a pull request. Returns the provider's
    /// reference for the created review.
    async fn post_review(
        &self,
        token: &str,
        repo_full_name: &str,
        pr_number: i64,
        review: &ReviewOutput,
    ) -> Result<String, PipelineError>;
}

// ─── HTTP implementation ──────────────────────────────────────────────────────

pub struct HttpProviderClient {
    http: reqwest::Client,
    config: ProviderConfig,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RepoResponse {
    default_branch: String,
}

#[derive(Deserialize)]
struct CommitResponse {
    sha: String,
}

#[derive(Deserialize)]
struct TreeResponse {
    tree: Vec<RawTreeEntry>,
}

#[derive(Deserialize)]
struct RawTreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    sha: String,
}

#[derive(Deserialize)]
struct ReviewResponse {
    id: i64,
}

impl HttpProviderClient {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base_url.trim_end_matches('/'), path)
    }

    /// Signed application assertion presented to the token-exchange endpoint.
    ///
    /// Compact `header.payload.signature` format: base64url header + claims
    /// (app id, issued-at, 10-minute expiry), HMAC-SHA256 signed with the
    /// application private key material.
    fn app_assertion(&self) -> Result<String, PipelineError> {
        if self.config.app_id.is_empty() || self.config.private_key.is_empty() {
            return Err(PipelineError::Auth(
                "provider app credentials are not configured".into(),
            ));
        }
        let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let now = Utc::now().timestamp();
        let header = engine.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let claims = engine.encode(
            serde_json::json!({
                "iss": self.config.app_id,
                "iat": now - 60,
                "exp": now + 600,
            })
            .to_string(),
        );
        let signing_input = format!("{header}.{claims}");
        let mut mac = Hmac::<Sha256>::new_from_slice(self.config.private_key.as_bytes())
            .map_err(|e| PipelineError::Auth(format!("bad private key material: {e}")))?;
        mac.update(signing_input.as_bytes());
        let signature = engine.encode(mac.finalize().into_bytes());
        Ok(format!("{signing_input}.{signature}"))
    }

    /// Run a provider request with the per-call timeout, mapping the response
    /// status through `on_error`.
    async fn send(
        &self,
        req: reqwest::RequestBuilder,
        what: &str,
        on_error: impl Fn(u16, String) -> PipelineError,
    ) -> Result<reqwest::Response, PipelineError> {
        let timeout = std::time::Duration::from_secs(self.config.timeout_secs);
        let resp = tokio::time::timeout(timeout, req.send())
            .await
            .map_err(|_| PipelineError::Timeout(self.config.timeout_secs, what.to_string()))?
            .map_err(|e| on_error(0, e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(map_status(status.as_u16(), body, on_error))
    }
}

/// Credential/permission statuses are terminal; everything else is left to
/// the per-call classifier (rate limits, 5xx, network — retryable).
fn map_status(
    status: u16,
    body: String,
    on_error: impl Fn(u16, String) -> PipelineError,
) -> PipelineError {
    match status {
        401 => PipelineError::Auth(format!("provider rejected credentials: {body}")),
        403 | 404 => PipelineError::Access(format!("status {status}: {body}")),
        _ => on_error(status, body),
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn exchange_token(
        &self,
        installation_id: i64,
    ) -> Result<InstallationToken, PipelineError> {
        let assertion = self.app_assertion()?;
        let req = self
            .http
            .post(self.url(&format!(
                "/app/installations/{installation_id}/access_tokens"
            )))
            .bearer_auth(assertion)
            .header("accept", "application/json");
        let resp = self
            .send(req, "token exchange", |s, b| {
                PipelineError::Auth(format!("token exchange failed ({s}): {b}"))
            })
            .await?;
        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| PipelineError::Auth(format!("malformed token response: {e}")))?;
        Ok(InstallationToken {
            token: body.token,
            expires_at: body.expires_at,
        })
    }

    async fn head_commit(
        &self,
        token: &str,
        repo_full_name: &str,
    ) -> Result<String, PipelineError> {
        let req = self
            .http
            .get(self.url(&format!("/repos/{repo_full_name}")))
            .bearer_auth(token);
        let repo: RepoResponse = self
            .send(req, "repo lookup", |s, b| {
                PipelineError::Fetch(format!("repo lookup failed ({s}): {b}"))
            })
            .await?
            .json()
            .await
            .map_err(|e| PipelineError::Fetch(format!("malformed repo response: {e}")))?;

        let req = self
            .http
            .get(self.url(&format!(
                "/repos/{repo_full_name}/commits/{}",
                repo.default_branch
            )))
            .bearer_auth(token);
        let commit: CommitResponse = self
            .send(req, "head commit", |s, b| {
                PipelineError::Fetch(format!("head commit lookup failed ({s}): {b}"))
            })
            .await?
            .json()
            .await
            .map_err(|e| PipelineError::Fetch(format!("malformed commit response: {e}")))?;
        Ok(commit.sha)
    }

    async fn list_tree(
        &self,
        token: &str,
        repo_full_name: &str,
        commit_sha: &str,
    ) -> Result<Vec<TreeEntry>, PipelineError> {
        let req = self
            .http
            .get(self.url(&format!(
                "/repos/{repo_full_name}/git/trees/{commit_sha}?recursive=1"
            )))
            .bearer_auth(token);
        let body: TreeResponse = self
            .send(req, "tree listing", |s, b| {
                PipelineError::Fetch(format!("tree listing failed ({s}): {b}"))
            })
            .await?
            .json()
            .await
            .map_err(|e| PipelineError::Fetch(format!("malformed tree response: {e}")))?;
        Ok(body
            .tree
            .into_iter()
            .filter(|e| e.kind == "blob")
            .map(|e| TreeEntry {
                path: e.path,
                content_hash: e.sha,
            })
            .collect())
    }

    async fn fetch_blob(
        &self,
        token: &str,
        repo_full_name: &str,
        commit_sha: &str,
        path: &str,
    ) -> Result<String, PipelineError> {
        let req = self
            .http
            .get(self.url(&format!(
                "/repos/{repo_full_name}/contents/{path}?ref={commit_sha}"
            )))
            .bearer_auth(token)
            .header("accept", "application/vnd.github.raw+json");
        let resp = self
            .send(req, "blob fetch", |s, b| {
                PipelineError::Fetch(format!("blob fetch failed ({s}): {b}"))
            })
            .await?;
        resp.text()
            .await
            .map_err(|e| PipelineError::Fetch(format!("blob body read failed: {e}")))
    }

    async fn fetch_diff(
        &self,
        token: &str,
        repo_full_name: &str,
        base_sha: &str,
        head_sha: &str,
    ) -> Result<String, PipelineError> {
        let req = self
            .http
            .get(self.url(&format!(
                "/repos/{repo_full_name}/compare/{base_sha}...{head_sha}"
            )))
            .bearer_auth(token)
            .header("accept", "application/vnd.github.diff");
        let resp = self
            .send(req, "diff fetch", |s, b| {
                PipelineError::DiffFetch(format!("diff fetch failed ({s}): {b}"))
            })
            .await?;
        resp.text()
            .await
            .map_err(|e| PipelineError::DiffFetch(format!("diff body read failed: {e}")))
    }

    async fn post_review(
        &self,
        token: &str,
        repo_full_name: &str,
        pr_number: i64,
        review: &ReviewOutput,
    ) -> Result<String, PipelineError> {
        let comments: Vec<serde_json::Value> = review
            .findings
            .iter()
            .filter_map(|f| {
                let path = f.path.as_ref()?;
                let (_, end) = f.line_range?;
                Some(serde_json::json!({
                    "path": path,
                    "line": end,
                    "body": format!("**{}**: {}", f.severity.as_str(), f.message),
                }))
            })
            .collect();

        let body = if review.partial_context {
            format!(
                "{}\n\n_Generated with partial repository context; the index \
                 had not caught up to this commit._",
                review.summary
            )
        } else {
            review.summary.clone()
        };
        let req = self
            .http
            .post(self.url(&format!(
                "/repos/{repo_full_name}/pulls/{pr_number}/reviews"
            )))
            .bearer_auth(token)
            .json(&serde_json::json!({
                "event": "COMMENT",
                "body": body,
                "comments": comments,
            }));
        let resp = self
            .send(req, "review publish", |s, b| {
                PipelineError::Publish(format!("review publish failed ({s}): {b}"))
            })
            .await?;
        let body: ReviewResponse = resp
            .json()
            .await
            .map_err(|e| PipelineError::Publish(format!("malformed publish response: {e}")))?;
        Ok(format!("review-{}", body.id))
    }
}

/// Returns `true` when `expires_at` is within `margin_mins` of now — the
/// token should be refreshed rather than served.
pub fn near_expiry(expires_at: DateTime<Utc>, margin_mins: i64) -> bool {
    Utc::now() + Duration::minutes(margin_mins) >= expires_at
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn near_expiry_respects_margin() {
        let in_ten = Utc::now() + Duration::minutes(10);
        assert!(!near_expiry(in_ten, 5));
        assert!(near_expiry(in_ten, 15));

        let past = Utc::now() - Duration::minutes(1);
        assert!(near_expiry(past, 5));
    }

    #[test]
    fn app_assertion_requires_credentials() {
        let client = HttpProviderClient::new(ProviderConfig::default());
        assert!(matches!(
            client.app_assertion(),
            Err(PipelineError::Auth(_))
        ));

        let client = HttpProviderClient::new(ProviderConfig {
            app_id: "12345".into(),
            private_key: "secret-key-material".into(),
            ..ProviderConfig::default()
        });
        let assertion = client.app_assertion().unwrap();
        assert_eq!(assertion.split('.').count(), 3);
    }
}
