// SPDX-License-Identifier: MIT
//! Reasoning-model client.
//!
//! Two call shapes: per-file summaries during indexing, and one structured
//! review generation per review job. The review prompt instructs the model to
//! answer with a JSON document; parsing is deliberately lenient about extra
//! prose around the JSON but strict about the document shape — a response
//! that yields no parsable document is a generation failure, while individual
//! out-of-diff findings are validated (and dropped) downstream.

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::ModelConfig;
use crate::error::PipelineError;

/// A finding exactly as the model emitted it, before validation.
#[derive(Debug, Clone, Deserialize)]
pub struct RawFinding {
    /// Repository-relative file path; absent for summary-level remarks.
    #[serde(default)]
    pub path: Option<String>,
    /// 1-based inclusive line range in the new file; absent for
    /// summary-level remarks.
    #[serde(default)]
    pub start_line: Option<u32>,
    #[serde(default)]
    pub end_line: Option<u32>,
    /// `"note"`, `"warning"`, or `"error"`.
    pub severity: String,
    pub message: String,
}

/// Model output for one review invocation.
#[derive(Debug, Clone, Deserialize)]
pub struct ReviewDraft {
    pub summary: String,
    #[serde(default)]
    pub findings: Vec<RawFinding>,
}

#[async_trait]
pub trait ReasonerClient: Send + Sync {
    /// Short structured summary of one file, used as index context.
    /// Failures are retryable fetch-class errors — the index job retries
    /// with backoff.
    async fn summarize_file(&self, path: &str, content: &str)
        -> Result<String, PipelineError>;

    /// One review generation per review job. Failures map to
    /// [`PipelineError::ReviewGeneration`].
    async fn generate_review(&self, prompt: &str) -> Result<ReviewDraft, PipelineError>;
}

// ─── HTTP implementation ──────────────────────────────────────────────────────

pub struct HttpReasonerClient {
    http: reqwest::Client,
    config: ModelConfig,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

impl HttpReasonerClient {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    async fn invoke(&self, system: &str, user: &str) -> Result<String, PipelineError> {
        let timeout = std::time::Duration::from_secs(self.config.timeout_secs);
        let req = self
            .http
            .post(format!(
                "{}/v1/messages",
                self.config.base_url.trim_end_matches('/')
            ))
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&serde_json::json!({
                "model": self.config.model,
                "max_tokens": 4096,
                "system": system,
                "messages": [{"role": "user", "content": user}],
            }));

        let resp = tokio::time::timeout(timeout, req.send())
            .await
            .map_err(|_| PipelineError::Timeout(self.config.timeout_secs, "model call".into()))?
            .map_err(|e| PipelineError::ReviewGeneration(format!("model call failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::ReviewGeneration(format!(
                "model returned {status}: {body}"
            )));
        }
        let body: MessagesResponse = resp.json().await.map_err(|e| {
            PipelineError::ReviewGeneration(format!("malformed model response: {e}"))
        })?;
        Ok(body
            .content
            .into_iter()
            .map(|b| b.text)
            .collect::<Vec<_>>()
            .join(""))
    }
}

const SUMMARY_SYSTEM: &str = "You summarize source files for use as code-review context. \
    Reply with 2-4 plain sentences: the file's purpose, its key symbols \
    (functions, types, exports), and anything a reviewer of dependent code \
    should know. No markdown, no preamble.";

const REVIEW_SYSTEM: &str = "You are a code reviewer. Reply with a single JSON object: \
    {\"summary\": string, \"findings\": [{\"path\": string, \"start_line\": int, \
    \"end_line\": int, \"severity\": \"note\"|\"warning\"|\"error\", \"message\": string}]}. \
    Only reference lines that the diff adds or changes. Omit path/lines for \
    overall remarks. No text outside the JSON object.";

#[async_trait]
impl ReasonerClient for HttpReasonerClient {
    async fn summarize_file(
        &self,
        path: &str,
        content: &str,
    ) -> Result<String, PipelineError> {
        let user = format!("File: {path}\n\n{content}");
        match self.invoke(SUMMARY_SYSTEM, &user).await {
            Ok(text) => Ok(text.trim().to_string()),
            // Summarization runs inside index jobs; classify as a fetch-class
            // failure so the standard retry policy applies.
            Err(PipelineError::ReviewGeneration(msg)) => Err(PipelineError::Fetch(msg)),
            Err(e) => Err(e),
        }
    }

    async fn generate_review(&self, prompt: &str) -> Result<ReviewDraft, PipelineError> {
        let text = self.invoke(REVIEW_SYSTEM, prompt).await?;
        parse_review_draft(&text)
    }
}

/// Extract the review JSON document from model output. Tolerates surrounding
/// prose by scanning for the outermost object literal.
pub fn parse_review_draft(text: &str) -> Result<ReviewDraft, PipelineError> {
    let start = text.find('{');
    let end = text.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if e > s => &text[s..=e],
        _ => {
            return Err(PipelineError::ReviewGeneration(
                "model response contained no JSON object".into(),
            ))
        }
    };
    serde_json::from_str(json).map_err(|e| {
        PipelineError::ReviewGeneration(format!("model response failed to parse: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clean_json() {
        let draft = parse_review_draft(
            r#"{"summary": "looks fine", "findings": [
                {"path": "src/a.rs", "start_line": 10, "end_line": 12,
                 "severity": "warning", "message": "possible overflow"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(draft.summary, "looks fine");
        assert_eq!(draft.findings.len(), 1);
        assert_eq!(draft.findings[0].start_line, Some(10));
    }

    #[test]
    fn tolerates_prose_around_json() {
        let draft = parse_review_draft(
            "Here is my review:\n{\"summary\": \"ok\", \"findings\": []}\nDone.",
        )
        .unwrap();
        assert_eq!(draft.summary, "ok");
        assert!(draft.findings.is_empty());
    }

    #[test]
    fn rejects_response_without_json() {
        let err = parse_review_draft("I could not review this diff.").unwrap_err();
        assert!(matches!(err, PipelineError::ReviewGeneration(_)));
    }
}
