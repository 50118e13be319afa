// SPDX-License-Identifier: MIT
//! Idempotent review publication.
//!
//! The publication marker is checked before any provider call, so a job that
//! crashed between posting and completing never posts twice when retried —
//! the marker write happens immediately after a successful post.

use std::sync::Arc;
use tracing::info;

use crate::auth::TokenManager;
use crate::error::PipelineError;
use crate::provider::ProviderClient;
use crate::review::ReviewOutput;
use crate::storage::Storage;

pub struct Publisher {
    storage: Arc<Storage>,
    provider: Arc<dyn ProviderClient>,
    auth: Arc<TokenManager>,
}

impl Publisher {
    pub fn new(
        storage: Arc<Storage>,
        provider: Arc<dyn ProviderClient>,
        auth: Arc<TokenManager>,
    ) -> Self {
        Self {
            storage,
            provider,
            auth,
        }
    }

    /// Publish a review, returning the provider's reference to it. A repeat
    /// call with the same `job_key` returns the original reference without
    /// contacting the provider.
    pub async fn publish(
        &self,
        job_key: &str,
        installation_id: i64,
        repo_full_name: &str,
        pr_number: i64,
        review: &ReviewOutput,
    ) -> Result<String, PipelineError> {
        if let Some(prior) = self
            .storage
            .get_publication(job_key)
            .await
            .map_err(|e| PipelineError::Publish(e.to_string()))?
        {
            info!(job_key, published_ref = %prior.published_ref, "already published");
            return Ok(prior.published_ref);
        }

        let token = self.auth.get_token(installation_id).await?;
        let published_ref = self
            .provider
            .post_review(&token.token, repo_full_name, pr_number, review)
            .await?;

        self.storage
            .record_publication(job_key, &published_ref)
            .await
            .map_err(|e| PipelineError::Publish(e.to_string()))?;

        info!(job_key, %published_ref, findings = review.findings.len(), "review published");
        Ok(published_ref)
    }
}
