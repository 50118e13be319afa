// SPDX-License-Identifier: MIT
//! Incremental repository indexer.
//!
//! Each run produces a complete new index version: unchanged files carry
//! their existing summaries forward by content hash, changed and new files
//! are re-summarized, and deleted files simply do not appear. The version
//! becomes visible atomically via the repository's version pointer.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::auth::TokenManager;
use crate::error::PipelineError;
use crate::provider::ProviderClient;
use crate::reasoner::ReasonerClient;
use crate::storage::{NewIndexEntry, Storage};
use crate::webhook::BOOTSTRAP_TRIGGER;

pub struct Indexer {
    storage: Arc<Storage>,
    provider: Arc<dyn ProviderClient>,
    reasoner: Arc<dyn ReasonerClient>,
    auth: Arc<TokenManager>,
}

/// Outcome stats for one indexing run, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRunStats {
    pub version: i64,
    pub total: usize,
    pub carried_over: usize,
    pub summarized: usize,
}

impl Indexer {
    pub fn new(
        storage: Arc<Storage>,
        provider: Arc<dyn ProviderClient>,
        reasoner: Arc<dyn ReasonerClient>,
        auth: Arc<TokenManager>,
    ) -> Self {
        Self {
            storage,
            provider,
            reasoner,
            auth,
        }
    }

    /// Index the repository at `trigger_id` (a commit SHA, or the bootstrap
    /// marker which resolves to the default branch head).
    pub async fn index(&self, repo_id: i64, trigger_id: &str) -> Result<IndexRunStats, PipelineError> {
        let repo = self
            .storage
            .get_repository(repo_id)
            .await
            .map_err(|e| PipelineError::Fetch(e.to_string()))?
            .ok_or_else(|| PipelineError::Access(format!("unknown repository {repo_id}")))?;

        let token = self.auth.get_token(repo.installation_id).await?;

        let commit_sha = if trigger_id == BOOTSTRAP_TRIGGER {
            self.provider
                .head_commit(&token.token, &repo.full_name)
                .await?
        } else {
            trigger_id.to_string()
        };

        if repo.last_indexed_sha.as_deref() == Some(commit_sha.as_str()) {
            debug!(repo_id, %commit_sha, "index already covers this commit");
            return Ok(IndexRunStats {
                version: repo.current_index_version,
                total: 0,
                carried_over: 0,
                summarized: 0,
            });
        }

        let tree = self
            .provider
            .list_tree(&token.token, &repo.full_name, &commit_sha)
            .await?;

        // Existing entries keyed by path for hash comparison.
        let previous: HashMap<String, (String, String, String)> = self
            .storage
            .current_index_entries(repo_id)
            .await
            .map_err(|e| PipelineError::Fetch(e.to_string()))?
            .into_iter()
            .map(|e| (e.path, (e.content_hash, e.summary, e.commit_sha)))
            .collect();

        let mut entries = Vec::with_capacity(tree.len());
        let mut carried_over = 0usize;
        let mut summarized = 0usize;

        for item in &tree {
            match previous.get(&item.path) {
                // Unchanged content keeps its summary and original commit.
                Some((hash, summary, entry_sha)) if *hash == item.content_hash => {
                    carried_over += 1;
                    entries.push(NewIndexEntry {
                        path: item.path.clone(),
                        content_hash: item.content_hash.clone(),
                        summary: summary.clone(),
                        commit_sha: entry_sha.clone(),
                    });
                }
                _ => {
                    let content = self
                        .provider
                        .fetch_blob(&token.token, &repo.full_name, &commit_sha, &item.path)
                        .await?;
                    let summary = self.reasoner.summarize_file(&item.path, &content).await?;
                    summarized += 1;
                    entries.push(NewIndexEntry {
                        path: item.path.clone(),
                        content_hash: item.content_hash.clone(),
                        summary,
                        commit_sha: commit_sha.clone(),
                    });
                }
            }
        }

        let version = self
            .storage
            .write_index_version(repo_id, &commit_sha, &entries)
            .await
            .map_err(|e| PipelineError::Fetch(e.to_string()))?;

        info!(
            repo_id,
            %commit_sha,
            version,
            total = entries.len(),
            carried_over,
            summarized,
            "index version published"
        );
        Ok(IndexRunStats {
            version,
            total: entries.len(),
            carried_over,
            summarized,
        })
    }
}
