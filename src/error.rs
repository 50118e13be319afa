// SPDX-License-Identifier: MIT
//! Typed error taxonomy for the review pipeline.
//!
//! Workers never propagate errors across the job boundary — every execution
//! maps its [`PipelineError`] to an [`Outcome`] and reports that to the
//! orchestrator, which owns all retry/backoff decisions.

use thiserror::Error;

/// Errors surfaced by pipeline steps (token exchange, indexing, review,
/// publishing). Each variant has a fixed retry classification — see
/// [`PipelineError::outcome`].
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Application credentials missing/revoked, or the provider rejected the
    /// token exchange (e.g. installation suspended). Terminal.
    #[error("auth error: {0}")]
    Auth(String),

    /// Installation token invalid or repository permission revoked mid-run.
    /// Terminal.
    #[error("access error: {0}")]
    Access(String),

    /// Provider unavailable or rate-limited while fetching tree/blob content.
    /// Retryable.
    #[error("fetch error: {0}")]
    Fetch(String),

    /// Provider unavailable while fetching a pull-request diff. Retryable.
    #[error("diff fetch error: {0}")]
    DiffFetch(String),

    /// Reasoning model call failed. Retryable once, terminal on the second
    /// failure.
    #[error("review generation error: {0}")]
    ReviewGeneration(String),

    /// Provider rejected or dropped a publish attempt. Retryable.
    #[error("publish error: {0}")]
    Publish(String),

    /// An external call exceeded its configured timeout. Retryable.
    #[error("timeout after {0}s: {1}")]
    Timeout(u64, String),

    /// Storage-layer failure. Retryable — transient SQLite contention is far
    /// more common than corruption.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// How a finished job execution reports back to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Requeue after backoff, up to the configured attempt limit.
    Retryable(String),
    /// No retry — the job moves straight to `failed_terminal`.
    Terminal(String),
}

impl PipelineError {
    /// Map this error to a job outcome.
    ///
    /// `prior_attempts` is the job's attempt count *before* the current
    /// execution — used for the review-generation special case (retryable
    /// once, terminal on the second failure).
    pub fn outcome(&self, prior_attempts: u32) -> Outcome {
        match self {
            PipelineError::Auth(msg) | PipelineError::Access(msg) => {
                Outcome::Terminal(msg.clone())
            }
            PipelineError::ReviewGeneration(msg) => {
                if prior_attempts >= 1 {
                    Outcome::Terminal(format!("review generation failed twice: {msg}"))
                } else {
                    Outcome::Retryable(msg.clone())
                }
            }
            other => Outcome::Retryable(other.to_string()),
        }
    }
}
