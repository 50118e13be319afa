// SPDX-License-Identifier: MIT
//! Review engine.
//!
//! Consumes a pull-request diff, the persisted repository index, and a
//! persona, and produces validated findings via one reasoning-model call per
//! review job. Model output is treated as untrusted: findings that reference
//! paths or lines outside the diff's changed-line set are dropped, never
//! published.

pub mod diff;
pub mod persona;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::auth::TokenManager;
use crate::error::PipelineError;
use crate::orchestrator::ReviewPayload;
use crate::provider::ProviderClient;
use crate::reasoner::{RawFinding, ReasonerClient};
use crate::storage::Storage;

use persona::Persona;

// ─── Severity ─────────────────────────────────────────────────────────────────

/// Finding severity, ordered so a persona threshold can floor-filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Note,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Note => "note",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }

    /// Lenient parse for model-emitted severity strings.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "error" | "err" | "critical" => Severity::Error,
            "warning" | "warn" => Severity::Warning,
            _ => Severity::Note,
        }
    }
}

// ─── Findings ─────────────────────────────────────────────────────────────────

/// One unit of review output. Inline findings carry a path and line range;
/// summary-level remarks carry neither. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub path: Option<String>,
    /// 1-based inclusive range in the new file, `None` for summary-level.
    pub line_range: Option<(u32, u32)>,
    pub severity: Severity,
    pub message: String,
}

/// Complete result of one review job, handed to the publisher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewOutput {
    pub summary: String,
    pub findings: Vec<Finding>,
    /// True when the review ran past the index hold timeout on an older
    /// index version.
    pub partial_context: bool,
}

// ─── Engine ───────────────────────────────────────────────────────────────────

pub struct ReviewEngine {
    storage: Arc<Storage>,
    provider: Arc<dyn ProviderClient>,
    reasoner: Arc<dyn ReasonerClient>,
    auth: Arc<TokenManager>,
    max_context_bytes: usize,
}

impl ReviewEngine {
    pub fn new(
        storage: Arc<Storage>,
        provider: Arc<dyn ProviderClient>,
        reasoner: Arc<dyn ReasonerClient>,
        auth: Arc<TokenManager>,
        max_context_bytes: usize,
    ) -> Self {
        Self {
            storage,
            provider,
            reasoner,
            auth,
            max_context_bytes,
        }
    }

    /// Run one review job end-to-end (diff → context → model → validation).
    pub async fn review(
        &self,
        repo_id: i64,
        payload: &ReviewPayload,
        persona: &Persona,
        partial_context: bool,
    ) -> Result<ReviewOutput, PipelineError> {
        let repo = self
            .storage
            .get_repository(repo_id)
            .await
            .map_err(|e| PipelineError::Fetch(e.to_string()))?
            .ok_or_else(|| PipelineError::Access(format!("unknown repository {repo_id}")))?;

        let token = self.auth.get_token(repo.installation_id).await?;
        let diff_text = self
            .provider
            .fetch_diff(
                &token.token,
                &repo.full_name,
                &payload.base_sha,
                &payload.head_sha,
            )
            .await?;
        let changed = diff::parse(&diff_text);
        if changed.is_empty() {
            debug!(repo_id, pr = payload.pr_number, "empty diff — nothing to review");
            return Ok(ReviewOutput {
                summary: "No reviewable changes in this pull request.".to_string(),
                findings: Vec::new(),
                partial_context,
            });
        }

        let prompt = self
            .build_prompt(repo_id, &repo.full_name, payload, persona, &changed, &token.token)
            .await?;

        // Exactly one model invocation per review job; retries are the
        // orchestrator's decision, not ours.
        let draft = self.reasoner.generate_review(&prompt).await?;

        let findings = validate_findings(draft.findings, &changed, persona);
        Ok(ReviewOutput {
            summary: draft.summary,
            findings,
            partial_context,
        })
    }

    /// Assemble the bounded review context: persona instructions, then per
    /// touched file its changed hunks and index summary (direct blob fetch as
    /// fallback when a file is absent from the index). Files that do not fit
    /// the context budget are omitted from the prompt entirely.
    async fn build_prompt(
        &self,
        repo_id: i64,
        repo_full_name: &str,
        payload: &ReviewPayload,
        persona: &Persona,
        changed: &std::collections::BTreeMap<String, diff::ChangedFile>,
        token: &str,
    ) -> Result<String, PipelineError> {
        let mut prompt = format!(
            "{}\n\nReviewing PR #{} of {} ({}..{}).\n",
            persona.prompt_instructions(),
            payload.pr_number,
            repo_full_name,
            payload.base_sha,
            payload.head_sha,
        );

        let mut remaining = self.max_context_bytes.saturating_sub(prompt.len());
        for (path, file) in changed {
            let entry = self
                .storage
                .index_entry(repo_id, path)
                .await
                .map_err(|e| PipelineError::Fetch(e.to_string()))?;

            let context = match entry {
                Some(e) => e.summary,
                None => {
                    debug!(path, "file absent from index — fetching directly");
                    let content = self
                        .provider
                        .fetch_blob(token, repo_full_name, &payload.head_sha, path)
                        .await?;
                    truncate(&content, 2048)
                }
            };

            let section = format!("\n## {path}\nContext: {context}\nDiff:\n{}\n", file.hunks);
            if section.len() > remaining {
                warn!(path, "context budget exhausted — omitting this and remaining files");
                break;
            }
            remaining -= section.len();
            prompt.push_str(&section);
        }
        Ok(prompt)
    }

}

/// Defensive validation of model output: keep a finding only if its path and
/// line range fall inside the diff's changed-line set, and it clears the
/// persona's severity floor. Summary-level findings (no path) always pass
/// the location check.
pub fn validate_findings(
    raw: Vec<RawFinding>,
    changed: &std::collections::BTreeMap<String, diff::ChangedFile>,
    persona: &Persona,
) -> Vec<Finding> {
    let mut findings = Vec::new();
    for f in raw {
        let severity = Severity::parse(&f.severity);
        if severity < persona.severity_threshold {
            continue;
        }

        let location = match (&f.path, f.start_line) {
            (Some(path), Some(start)) => {
                let Some(file) = changed.get(path) else {
                    warn!(path, "dropping finding for file outside the diff");
                    continue;
                };
                let end = f.end_line.unwrap_or(start).max(start);
                if !(start..=end).any(|line| file.changed_lines.contains(&line)) {
                    warn!(
                        path,
                        start, end, "dropping finding outside the changed-line set"
                    );
                    continue;
                }
                (Some(path.clone()), Some((start, end)))
            }
            (Some(path), None) => {
                if !changed.contains_key(path) {
                    warn!(path, "dropping file-level finding for file outside the diff");
                    continue;
                }
                (Some(path.clone()), None)
            }
            // Summary-level remark.
            _ => (None, None),
        };

        findings.push(Finding {
            path: location.0,
            line_range: location.1,
            severity,
            message: f.message,
        });
        if findings.len() >= persona.max_findings {
            break;
        }
    }
    findings
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &s[..cut])
}
