// SPDX-License-Identifier: MIT
//! Worker pool driving job execution.
//!
//! A fixed number of tasks poll the orchestrator, execute claimed jobs, and
//! report outcomes. Per-repository ordering lives entirely in the
//! orchestrator's claim logic — workers are interchangeable.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::config::ReviewdConfig;
use crate::error::{Outcome, PipelineError};
use crate::indexer::Indexer;
use crate::orchestrator::{Completion, Job, JobKind, JobState, Orchestrator};
use crate::publisher::Publisher;
use crate::review::ReviewEngine;
use crate::storage::Storage;

pub struct Worker {
    config: Arc<ReviewdConfig>,
    storage: Arc<Storage>,
    orchestrator: Arc<Orchestrator>,
    indexer: Indexer,
    engine: ReviewEngine,
    publisher: Publisher,
}

impl Worker {
    pub fn new(
        config: Arc<ReviewdConfig>,
        storage: Arc<Storage>,
        orchestrator: Arc<Orchestrator>,
        indexer: Indexer,
        engine: ReviewEngine,
        publisher: Publisher,
    ) -> Self {
        Self {
            config,
            storage,
            orchestrator,
            indexer,
            engine,
            publisher,
        }
    }

    /// Dispatch one claimed job. Public so tests can drive jobs without the
    /// polling loop.
    pub async fn execute(&self, job: &Job) -> Result<(), PipelineError> {
        match job.kind {
            JobKind::Index => {
                self.indexer.index(job.repo_id, &job.trigger_id).await?;
                Ok(())
            }
            JobKind::Review => self.execute_review(job).await,
        }
    }

    async fn execute_review(&self, job: &Job) -> Result<(), PipelineError> {
        let payload = job
            .payload
            .as_ref()
            .ok_or_else(|| PipelineError::Access("review job has no payload".to_string()))?;
        let repo = self
            .storage
            .get_repository(job.repo_id)
            .await
            .map_err(|e| PipelineError::Fetch(e.to_string()))?
            .ok_or_else(|| PipelineError::Access(format!("unknown repository {}", job.repo_id)))?;

        let persona = self.config.persona_for(&repo.full_name);
        let review = self
            .engine
            .review(job.repo_id, payload, &persona, job.partial_context)
            .await?;

        // The installation may have been removed while the model ran. A
        // cancelled job must not publish; complete() will discard our result.
        let current = self
            .orchestrator
            .job(&job.id)
            .await
            .map_err(|e| PipelineError::Fetch(e.to_string()))?;
        if !matches!(current, Some(ref j) if j.state == JobState::Running) {
            info!(job_id = %job.id, "job no longer running — skipping publication");
            return Ok(());
        }

        self.publisher
            .publish(
                &job.key(),
                repo.installation_id,
                &repo.full_name,
                payload.pr_number,
                &review,
            )
            .await?;
        Ok(())
    }
}

/// Run one polling worker until shutdown. Spawn `pool_size` of these.
pub async fn run_worker(worker: Arc<Worker>, mut shutdown: watch::Receiver<bool>) {
    let poll_interval = Duration::from_millis(worker.config.jobs.poll_interval_ms);
    loop {
        if *shutdown.borrow() {
            return;
        }

        let job = match worker.orchestrator.claim().await {
            Ok(job) => job,
            Err(e) => {
                error!("job claim failed: {e:#}");
                None
            }
        };

        let Some(job) = job else {
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = shutdown.changed() => {}
            }
            continue;
        };

        debug!(
            job_id = %job.id,
            kind = job.kind.as_str(),
            repo_id = job.repo_id,
            attempt = job.attempts + 1,
            "executing job"
        );

        let outcome = match worker.execute(&job).await {
            Ok(()) => Outcome::Success,
            Err(e) => {
                error!(job_id = %job.id, "job failed: {e}");
                e.outcome(job.attempts)
            }
        };

        match worker.orchestrator.complete(&job.id, outcome).await {
            Ok(Completion::Applied(state)) => {
                debug!(job_id = %job.id, state = state.as_str(), "job completed")
            }
            Ok(Completion::Discarded) => {
                info!(job_id = %job.id, "job result discarded")
            }
            Err(e) => error!(job_id = %job.id, "failed to record job outcome: {e:#}"),
        }
    }
}
