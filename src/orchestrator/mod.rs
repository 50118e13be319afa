// SPDX-License-Identifier: MIT
//! Durable job queue and scheduler.
//!
//! Every webhook-triggered unit of work is a row in the `jobs` table with the
//! key (repository, kind, trigger). The state machine is
//! `queued → running → {succeeded | failed_retryable → queued | failed_terminal}`,
//! with the orchestrator as the only writer of job state: workers report
//! typed outcomes and never decide retries themselves.
//!
//! Scheduling guarantees:
//! - at most one non-terminal job per key (enqueue dedupes),
//! - at most one running job per repository (index and review never overlap),
//! - a review job waits for its index dependency, the repository's index
//!   already covering its head commit, or the hold timeout — in the timeout
//!   case it runs flagged with `partial_context`.

pub mod backoff;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::time::interval;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::JobsConfig;
use crate::error::Outcome;
use crate::storage::{with_timeout, Storage};

/// How many ready jobs a single claim pass inspects before giving up.
/// Held reviews are skipped, not failed, so a small window is enough.
const CLAIM_WINDOW: i64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Index,
    Review,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Index => "index",
            JobKind::Review => "review",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "index" => Some(JobKind::Index),
            "review" => Some(JobKind::Review),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    FailedRetryable,
    FailedTerminal,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::FailedRetryable => "failed_retryable",
            JobState::FailedTerminal => "failed_terminal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobState::Queued),
            "running" => Some(JobState::Running),
            "succeeded" => Some(JobState::Succeeded),
            "failed_retryable" => Some(JobState::FailedRetryable),
            "failed_terminal" => Some(JobState::FailedTerminal),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::FailedTerminal)
    }
}

/// Extra fields carried by review jobs, serialized into the `payload` column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewPayload {
    pub pr_number: i64,
    pub head_sha: String,
    pub base_sha: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct JobRow {
    id: String,
    repo_id: i64,
    kind: String,
    trigger_id: String,
    state: String,
    attempts: i64,
    depends_on: Option<String>,
    reason: Option<String>,
    partial_context: i64,
    payload: Option<String>,
    created_at: String,
}

/// A job as handed to workers and tests.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub repo_id: i64,
    pub kind: JobKind,
    pub trigger_id: String,
    pub state: JobState,
    /// Completed attempts before the current execution.
    pub attempts: u32,
    pub partial_context: bool,
    pub payload: Option<ReviewPayload>,
    pub reason: Option<String>,
}

impl Job {
    /// Stable key used for publication markers and logs.
    pub fn key(&self) -> String {
        job_key(self.repo_id, self.kind, &self.trigger_id)
    }

    fn from_row(row: JobRow) -> Option<Self> {
        Some(Self {
            id: row.id,
            repo_id: row.repo_id,
            kind: JobKind::parse(&row.kind)?,
            trigger_id: row.trigger_id,
            state: JobState::parse(&row.state)?,
            attempts: row.attempts as u32,
            partial_context: row.partial_context != 0,
            payload: row
                .payload
                .as_deref()
                .and_then(|p| serde_json::from_str(p).ok()),
            reason: row.reason,
        })
    }
}

pub fn job_key(repo_id: i64, kind: JobKind, trigger_id: &str) -> String {
    format!("{repo_id}:{}:{trigger_id}", kind.as_str())
}

/// Whether a `complete` call was applied or arrived for a job that is no
/// longer running (cancelled mid-flight — the result is discarded).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Applied(JobState),
    Discarded,
}

pub struct Orchestrator {
    pool: SqlitePool,
    config: JobsConfig,
}

impl Orchestrator {
    pub fn new(storage: &Storage, config: JobsConfig) -> Self {
        Self {
            pool: storage.pool(),
            config,
        }
    }

    /// Enqueue a job, deduplicating against an existing non-terminal job with
    /// the same (repository, kind, trigger) key. Returns the job id either way.
    ///
    /// The partial unique index on active job keys makes the insert itself the
    /// dedup point; two concurrent enqueues of the same key resolve to one row
    /// with both callers handed its id.
    pub async fn enqueue(
        &self,
        kind: JobKind,
        repo_id: i64,
        trigger_id: &str,
        depends_on: Option<&str>,
        payload: Option<&ReviewPayload>,
    ) -> Result<String> {
        with_timeout(async {
            let payload_json = payload.map(serde_json::to_string).transpose()?;
            loop {
                let id = Uuid::new_v4().to_string();
                let now = Utc::now().to_rfc3339();
                let inserted = sqlx::query(
                    "INSERT INTO jobs
                         (id, repo_id, kind, trigger_id, state, attempts, depends_on,
                          partial_context, payload, created_at, updated_at)
                     VALUES (?, ?, ?, ?, 'queued', 0, ?, 0, ?, ?, ?)
                     ON CONFLICT(repo_id, kind, trigger_id)
                         WHERE state IN ('queued', 'running', 'failed_retryable')
                         DO NOTHING",
                )
                .bind(&id)
                .bind(repo_id)
                .bind(kind.as_str())
                .bind(trigger_id)
                .bind(depends_on)
                .bind(payload_json.as_deref())
                .bind(&now)
                .bind(&now)
                .execute(&self.pool)
                .await?;

                if inserted.rows_affected() > 0 {
                    info!(job_id = %id, repo_id, kind = kind.as_str(), trigger_id, "job enqueued");
                    return Ok(id);
                }

                let existing: Option<(String,)> = sqlx::query_as(
                    "SELECT id FROM jobs
                     WHERE repo_id = ? AND kind = ? AND trigger_id = ?
                       AND state IN ('queued', 'running', 'failed_retryable')",
                )
                .bind(repo_id)
                .bind(kind.as_str())
                .bind(trigger_id)
                .fetch_optional(&self.pool)
                .await?;
                if let Some((id,)) = existing {
                    return Ok(id);
                }
                // The conflicting job reached a terminal state between the two
                // statements; insert again.
            }
        })
        .await
    }

    /// Hand the next eligible job to a worker, or `None` if nothing is ready.
    ///
    /// The final ownership transfer is a single conditional UPDATE that
    /// re-checks claimability and the per-repository cap, so two workers
    /// racing for the same job (or the same repository) cannot both win.
    pub async fn claim(&self) -> Result<Option<Job>> {
        with_timeout(async {
            let now = Utc::now().to_rfc3339();
            let candidates: Vec<JobRow> = sqlx::query_as(
                "SELECT id, repo_id, kind, trigger_id, state, attempts, depends_on,
                        reason, partial_context, payload, created_at
                 FROM jobs j
                 WHERE (j.state = 'queued'
                        OR (j.state = 'failed_retryable' AND j.next_retry_at <= ?))
                   AND NOT EXISTS (SELECT 1 FROM jobs r
                                   WHERE r.repo_id = j.repo_id AND r.state = 'running')
                 ORDER BY j.created_at, j.id
                 LIMIT ?",
            )
            .bind(&now)
            .bind(CLAIM_WINDOW)
            .fetch_all(&self.pool)
            .await?;

            for row in candidates {
                let Some(partial) = self.eligibility(&row).await? else {
                    // Held — leave it queued without failing it.
                    continue;
                };

                let claimed = sqlx::query(
                    "UPDATE jobs
                     SET state = 'running', partial_context = ?, updated_at = ?
                     WHERE id = ?
                       AND state IN ('queued', 'failed_retryable')
                       AND NOT EXISTS (SELECT 1 FROM jobs r
                                       WHERE r.repo_id = jobs.repo_id
                                         AND r.state = 'running')",
                )
                .bind(partial as i64)
                .bind(Utc::now().to_rfc3339())
                .bind(&row.id)
                .execute(&self.pool)
                .await?;

                if claimed.rows_affected() == 1 {
                    let mut job = Job::from_row(row)
                        .ok_or_else(|| anyhow::anyhow!("corrupt job row"))?;
                    job.state = JobState::Running;
                    job.partial_context = partial;
                    return Ok(Some(job));
                }
                // Lost the race — another worker took this job or its repo.
            }
            Ok(None)
        })
        .await
    }

    /// Dependency/ordering gate for one claim candidate.
    ///
    /// Returns `None` if the job must stay held, otherwise the
    /// `partial_context` flag it should run with.
    async fn eligibility(&self, row: &JobRow) -> Result<Option<bool>> {
        let Some(dep_id) = row.depends_on.as_deref() else {
            return Ok(Some(false));
        };

        let dep_state: Option<(String,)> =
            sqlx::query_as("SELECT state FROM jobs WHERE id = ?")
                .bind(dep_id)
                .fetch_optional(&self.pool)
                .await?;
        match dep_state.as_ref().map(|(s,)| s.as_str()) {
            // Absent (already reaped) counts as satisfied.
            None | Some("succeeded") => return Ok(Some(false)),
            _ => {}
        }

        // The index may already cover this review's head commit even though
        // the dependency job itself has not succeeded.
        if let Some(payload) = row
            .payload
            .as_deref()
            .and_then(|p| serde_json::from_str::<ReviewPayload>(p).ok())
        {
            let indexed: Option<(Option<String>,)> =
                sqlx::query_as("SELECT last_indexed_sha FROM repositories WHERE id = ?")
                    .bind(row.repo_id)
                    .fetch_optional(&self.pool)
                    .await?;
            if let Some((Some(sha),)) = indexed {
                if sha == payload.head_sha {
                    return Ok(Some(false));
                }
            }
        }

        // Hold until the timeout, then proceed on the most recent available
        // index and flag the findings as produced with partial context.
        let held_long_enough = chrono::DateTime::parse_from_rfc3339(&row.created_at)
            .map(|created| {
                Utc::now().signed_duration_since(created)
                    >= chrono::Duration::seconds(self.config.review_hold_secs)
            })
            .unwrap_or(true);
        if held_long_enough {
            warn!(job_id = %row.id, "review hold timeout elapsed — proceeding with partial context");
            return Ok(Some(true));
        }
        Ok(None)
    }

    /// Apply a worker-reported outcome. Returns [`Completion::Discarded`]
    /// when the job is no longer running (cancelled while executing) — the
    /// worker's result is thrown away.
    pub async fn complete(&self, job_id: &str, outcome: Outcome) -> Result<Completion> {
        with_timeout(async {
            let row: Option<(String, i64)> =
                sqlx::query_as("SELECT state, attempts FROM jobs WHERE id = ?")
                    .bind(job_id)
                    .fetch_optional(&self.pool)
                    .await?;
            let Some((state, attempts)) = row else {
                warn!(job_id, "complete() for unknown job — discarded");
                return Ok(Completion::Discarded);
            };
            if state != "running" {
                info!(job_id, state, "complete() for non-running job — result discarded");
                return Ok(Completion::Discarded);
            }

            let now = Utc::now().to_rfc3339();
            let (new_state, reason, next_retry_at) = match outcome {
                Outcome::Success => (JobState::Succeeded, None, None),
                Outcome::Terminal(reason) => (JobState::FailedTerminal, Some(reason), None),
                Outcome::Retryable(reason) => {
                    let attempts_done = attempts as u32 + 1;
                    if attempts_done >= self.config.max_attempts {
                        (
                            JobState::FailedTerminal,
                            Some(format!(
                                "retries exhausted after {attempts_done} attempts: {reason}"
                            )),
                            None,
                        )
                    } else {
                        let delay = backoff::next_backoff(attempts as u32, &self.config);
                        let retry_at = Utc::now()
                            + chrono::Duration::milliseconds(delay.as_millis() as i64);
                        (
                            JobState::FailedRetryable,
                            Some(reason),
                            Some(retry_at.to_rfc3339()),
                        )
                    }
                }
            };

            let updated = sqlx::query(
                "UPDATE jobs
                 SET state = ?, attempts = attempts + ?, reason = ?,
                     next_retry_at = ?, updated_at = ?
                 WHERE id = ? AND state = 'running'",
            )
            .bind(new_state.as_str())
            .bind(matches!(new_state, JobState::FailedRetryable | JobState::FailedTerminal)
                as i64)
            .bind(&reason)
            .bind(&next_retry_at)
            .bind(&now)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
            if updated.rows_affected() == 0 {
                return Ok(Completion::Discarded);
            }

            match &new_state {
                JobState::FailedTerminal => {
                    warn!(job_id, reason = reason.as_deref().unwrap_or(""), "job failed terminally")
                }
                JobState::FailedRetryable => {
                    info!(job_id, retry_at = next_retry_at.as_deref().unwrap_or(""), "job scheduled for retry")
                }
                _ => info!(job_id, "job succeeded"),
            }
            Ok(Completion::Applied(new_state))
        })
        .await
    }

    /// Cancel all non-terminal jobs for the given repositories (uninstall).
    /// Running jobs flip to terminal immediately; their workers detect this
    /// at completion and discard their results.
    pub async fn cancel_for_repos(&self, repo_ids: &[i64]) -> Result<u64> {
        with_timeout(async {
            let mut total = 0u64;
            for repo_id in repo_ids {
                let result = sqlx::query(
                    "UPDATE jobs
                     SET state = 'failed_terminal', reason = 'cancelled', updated_at = ?
                     WHERE repo_id = ?
                       AND state IN ('queued', 'running', 'failed_retryable')",
                )
                .bind(Utc::now().to_rfc3339())
                .bind(repo_id)
                .execute(&self.pool)
                .await?;
                total += result.rows_affected();
            }
            if total > 0 {
                info!(cancelled = total, "jobs cancelled for uninstalled repositories");
            }
            Ok(total)
        })
        .await
    }

    /// Fetch one job by id.
    pub async fn job(&self, job_id: &str) -> Result<Option<Job>> {
        with_timeout(async {
            let row: Option<JobRow> = sqlx::query_as(
                "SELECT id, repo_id, kind, trigger_id, state, attempts, depends_on,
                        reason, partial_context, payload, created_at
                 FROM jobs WHERE id = ?",
            )
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row.and_then(Job::from_row))
        })
        .await
    }

    /// Number of jobs not yet in a terminal state.
    pub async fn queue_depth(&self) -> Result<i64> {
        with_timeout(async {
            let (n,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM jobs
                 WHERE state IN ('queued', 'running', 'failed_retryable')",
            )
            .fetch_one(&self.pool)
            .await?;
            Ok(n)
        })
        .await
    }

    /// Requeue jobs a previous process left in `running`. Called once at
    /// startup; safe because publication is idempotent by job key.
    pub async fn recover_interrupted(&self) -> Result<u64> {
        with_timeout(async {
            let result = sqlx::query(
                "UPDATE jobs SET state = 'queued', updated_at = ? WHERE state = 'running'",
            )
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
            let n = result.rows_affected();
            if n > 0 {
                info!(requeued = n, "recovered jobs interrupted by a previous shutdown");
            }
            Ok(n)
        })
        .await
    }

    /// Delete terminal jobs older than the audit window.
    pub async fn reap_terminal(&self) -> Result<u64> {
        with_timeout(async {
            let cutoff = (Utc::now()
                - chrono::Duration::days(self.config.audit_window_days))
            .to_rfc3339();
            let result = sqlx::query(
                "DELETE FROM jobs
                 WHERE state IN ('succeeded', 'failed_terminal') AND updated_at < ?",
            )
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }
}

/// Hourly maintenance: reap audited terminal jobs and prune webhook delivery
/// dedup rows past their retention window.
pub async fn run_reaper(orchestrator: Arc<Orchestrator>, storage: Arc<Storage>) {
    let mut ticker = interval(std::time::Duration::from_secs(3600));
    loop {
        ticker.tick().await;

        match orchestrator.reap_terminal().await {
            Ok(n) if n > 0 => info!("reaped {n} terminal jobs past the audit window"),
            Ok(_) => {}
            Err(e) => warn!("job reaper error: {e}"),
        }
        match storage.prune_deliveries().await {
            Ok(n) if n > 0 => info!("pruned {n} expired webhook delivery ids"),
            Ok(_) => {}
            Err(e) => warn!("delivery pruner error: {e}"),
        }
    }
}
