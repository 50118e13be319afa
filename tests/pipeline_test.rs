// SPDX-License-Identifier: MIT
//! End-to-end pipeline tests over in-memory provider/reasoner fakes and a
//! temp-dir SQLite store. Each test wires a real AppContext and drives jobs
//! through claim/execute/complete the way the worker pool does.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use reviewd::config::ReviewdConfig;
use reviewd::error::{Outcome, PipelineError};
use reviewd::orchestrator::{Completion, JobKind, JobState};
use reviewd::provider::{InstallationToken, ProviderClient, TreeEntry};
use reviewd::reasoner::{RawFinding, ReasonerClient, ReviewDraft};
use reviewd::review::ReviewOutput;
use reviewd::storage::Storage;
use reviewd::webhook::{self, NormalizedEvent, RepoRef};
use reviewd::AppContext;

// ─── Fakes ────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeRepoState {
    head_sha: String,
    tree: Vec<TreeEntry>,
    blobs: HashMap<String, String>,
    diff: String,
}

#[derive(Default)]
struct FakeProvider {
    state: Mutex<FakeRepoState>,
    post_count: AtomicUsize,
    blob_fetches: AtomicUsize,
}

impl FakeProvider {
    async fn set_tree(&self, head_sha: &str, files: &[(&str, &str, &str)]) {
        let mut state = self.state.lock().await;
        state.head_sha = head_sha.to_string();
        state.tree = files
            .iter()
            .map(|(path, hash, _)| TreeEntry {
                path: path.to_string(),
                content_hash: hash.to_string(),
            })
            .collect();
        state.blobs = files
            .iter()
            .map(|(path, _, content)| (path.to_string(), content.to_string()))
            .collect();
    }

    async fn set_diff(&self, diff: &str) {
        self.state.lock().await.diff = diff.to_string();
    }
}

#[async_trait]
impl ProviderClient for FakeProvider {
    async fn exchange_token(
        &self,
        installation_id: i64,
    ) -> Result<InstallationToken, PipelineError> {
        Ok(InstallationToken {
            token: format!("tok-{installation_id}"),
            expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
        })
    }

    async fn head_commit(&self, _: &str, _: &str) -> Result<String, PipelineError> {
        Ok(self.state.lock().await.head_sha.clone())
    }

    async fn list_tree(&self, _: &str, _: &str, _: &str) -> Result<Vec<TreeEntry>, PipelineError> {
        Ok(self.state.lock().await.tree.clone())
    }

    async fn fetch_blob(
        &self,
        _: &str,
        _: &str,
        _: &str,
        path: &str,
    ) -> Result<String, PipelineError> {
        self.blob_fetches.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .await
            .blobs
            .get(path)
            .cloned()
            .ok_or_else(|| PipelineError::Fetch(format!("no blob at {path}")))
    }

    async fn fetch_diff(&self, _: &str, _: &str, _: &str, _: &str) -> Result<String, PipelineError> {
        Ok(self.state.lock().await.diff.clone())
    }

    async fn post_review(
        &self,
        _: &str,
        _: &str,
        _: i64,
        _: &ReviewOutput,
    ) -> Result<String, PipelineError> {
        let n = self.post_count.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("review-{n}"))
    }
}

struct FakeReasoner {
    summarize_count: AtomicUsize,
    draft: Mutex<ReviewDraft>,
    last_prompt: Mutex<String>,
}

impl Default for FakeReasoner {
    fn default() -> Self {
        Self {
            summarize_count: AtomicUsize::new(0),
            draft: Mutex::new(ReviewDraft {
                summary: "looks fine".to_string(),
                findings: Vec::new(),
            }),
            last_prompt: Mutex::new(String::new()),
        }
    }
}

impl FakeReasoner {
    async fn set_draft(&self, draft: ReviewDraft) {
        *self.draft.lock().await = draft;
    }
}

#[async_trait]
impl ReasonerClient for FakeReasoner {
    async fn summarize_file(&self, path: &str, _: &str) -> Result<String, PipelineError> {
        self.summarize_count.fetch_add(1, Ordering::SeqCst);
        Ok(format!("summary of {path}"))
    }

    async fn generate_review(&self, prompt: &str) -> Result<ReviewDraft, PipelineError> {
        *self.last_prompt.lock().await = prompt.to_string();
        Ok(self.draft.lock().await.clone())
    }
}

// ─── Harness ──────────────────────────────────────────────────────────────────

struct Harness {
    ctx: Arc<AppContext>,
    provider: Arc<FakeProvider>,
    reasoner: Arc<FakeReasoner>,
    worker: reviewd::worker::Worker,
    _dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    harness_with(|_| {}).await
}

async fn harness_with(tweak: impl FnOnce(&mut ReviewdConfig)) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = ReviewdConfig::new(
        None,
        Some(dir.path().to_path_buf()),
        Some("error".to_string()),
        Some(1),
    );
    tweak(&mut config);
    let config = Arc::new(config);
    let storage = Arc::new(Storage::new(dir.path()).await.expect("storage"));
    let provider = Arc::new(FakeProvider::default());
    let reasoner = Arc::new(FakeReasoner::default());
    let ctx = Arc::new(AppContext::new(
        config,
        storage,
        provider.clone(),
        reasoner.clone(),
    ));
    let worker = ctx.worker();
    Harness {
        ctx,
        provider,
        reasoner,
        worker,
        _dir: dir,
    }
}

impl Harness {
    async fn install(&self, installation_id: i64, repo_id: i64, full_name: &str) {
        self.ctx
            .storage
            .upsert_installation(installation_id, "acme")
            .await
            .unwrap();
        self.ctx
            .storage
            .upsert_repository(repo_id, full_name, installation_id)
            .await
            .unwrap();
    }

    /// Claim and execute jobs until the queue drains, like the worker loop
    /// but without polling. Panics if nothing is claimable while work remains.
    async fn drain(&self) {
        for _ in 0..32 {
            let Some(job) = self.ctx.orchestrator.claim().await.unwrap() else {
                return;
            };
            let outcome = match self.worker_execute(&job).await {
                Ok(()) => Outcome::Success,
                Err(e) => e.outcome(job.attempts),
            };
            self.ctx
                .orchestrator
                .complete(&job.id, outcome)
                .await
                .unwrap();
        }
        panic!("queue did not drain");
    }

    async fn worker_execute(
        &self,
        job: &reviewd::orchestrator::Job,
    ) -> Result<(), PipelineError> {
        self.worker.execute(job).await
    }
}

fn pr_event(installation_id: i64, repo_id: i64, full_name: &str, pr: i64, head: &str) -> NormalizedEvent {
    NormalizedEvent::PullRequest {
        installation_id,
        repo: RepoRef {
            id: repo_id,
            full_name: full_name.to_string(),
        },
        pr_number: pr,
        head_sha: head.to_string(),
        base_sha: "base0".to_string(),
    }
}

const DIFF: &str = "\
diff --git a/a.py b/a.py
--- a/a.py
+++ b/a.py
@@ -1,2 +1,3 @@
 import os
+print(\"hello\")
 main()
";

// ─── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn duplicate_pull_request_event_enqueues_one_review() {
    let h = harness().await;
    h.install(1, 10, "acme/app").await;

    let event = pr_event(1, 10, "acme/app", 7, "sha-head");
    webhook::apply_event(&h.ctx, event.clone()).await.unwrap();
    webhook::apply_event(&h.ctx, event).await.unwrap();

    // One index job + one review job, not two of each.
    assert_eq!(h.ctx.orchestrator.queue_depth().await.unwrap(), 2);
}

#[tokio::test]
async fn full_pipeline_indexes_then_reviews_and_publishes_once() {
    let h = harness().await;
    h.install(1, 10, "acme/app").await;
    h.provider
        .set_tree(
            "sha-head",
            &[("a.py", "h1", "import os\nprint(\"hello\")\nmain()")],
        )
        .await;
    h.provider.set_diff(DIFF).await;
    h.reasoner
        .set_draft(ReviewDraft {
            summary: "one nit".to_string(),
            findings: vec![RawFinding {
                path: Some("a.py".to_string()),
                start_line: Some(2),
                end_line: Some(2),
                severity: "warning".to_string(),
                message: "debug print left in".to_string(),
            }],
        })
        .await;

    webhook::apply_event(&h.ctx, pr_event(1, 10, "acme/app", 7, "sha-head"))
        .await
        .unwrap();
    h.drain().await;

    assert_eq!(h.provider.post_count.load(Ordering::SeqCst), 1);
    let repo = h.ctx.storage.get_repository(10).await.unwrap().unwrap();
    assert_eq!(repo.last_indexed_sha.as_deref(), Some("sha-head"));
    assert_eq!(repo.current_index_version, 1);
    let prompt = h.reasoner.last_prompt.lock().await.clone();
    assert!(prompt.contains("## a.py"), "changed file belongs in the prompt");
}

#[tokio::test]
async fn review_prompt_omits_files_beyond_the_context_budget() {
    let h = harness_with(|c| c.model.max_context_bytes = 1).await;
    h.install(1, 10, "acme/app").await;
    h.provider
        .set_tree("sha-head", &[("a.py", "h1", "main()")])
        .await;
    h.provider.set_diff(DIFF).await;

    webhook::apply_event(&h.ctx, pr_event(1, 10, "acme/app", 7, "sha-head"))
        .await
        .unwrap();
    h.drain().await;

    // The review still runs and publishes; over-budget file sections are
    // left out of the prompt entirely rather than truncated mid-section.
    assert_eq!(h.provider.post_count.load(Ordering::SeqCst), 1);
    let prompt = h.reasoner.last_prompt.lock().await.clone();
    assert!(!prompt.is_empty());
    assert!(!prompt.contains("## a.py"));
}

#[tokio::test]
async fn review_waits_for_its_index_dependency() {
    let h = harness().await;
    h.install(1, 10, "acme/app").await;
    h.provider
        .set_tree("sha-head", &[("a.py", "h1", "main()")])
        .await;
    h.provider.set_diff(DIFF).await;

    webhook::apply_event(&h.ctx, pr_event(1, 10, "acme/app", 7, "sha-head"))
        .await
        .unwrap();

    // First claim must be the index job; the review is held behind it.
    let first = h.ctx.orchestrator.claim().await.unwrap().unwrap();
    assert_eq!(first.kind, JobKind::Index);
    assert!(h.ctx.orchestrator.claim().await.unwrap().is_none());

    h.worker_execute(&first).await.unwrap();
    h.ctx
        .orchestrator
        .complete(&first.id, Outcome::Success)
        .await
        .unwrap();

    let second = h.ctx.orchestrator.claim().await.unwrap().unwrap();
    assert_eq!(second.kind, JobKind::Review);
    assert!(!second.partial_context);
}

#[tokio::test]
async fn incremental_index_resummarizes_only_changed_files() {
    let h = harness().await;
    h.install(1, 10, "acme/app").await;
    h.provider
        .set_tree("sha-1", &[("a.py", "h-a1", "a v1"), ("b.py", "h-b1", "b v1")])
        .await;

    webhook::apply_event(
        &h.ctx,
        NormalizedEvent::Push {
            installation_id: 1,
            repo: RepoRef {
                id: 10,
                full_name: "acme/app".to_string(),
            },
            head_sha: "sha-1".to_string(),
        },
    )
    .await
    .unwrap();
    h.drain().await;
    assert_eq!(h.reasoner.summarize_count.load(Ordering::SeqCst), 2);

    // b.py changes, c.py appears, a.py untouched.
    h.provider
        .set_tree(
            "sha-2",
            &[
                ("a.py", "h-a1", "a v1"),
                ("b.py", "h-b2", "b v2"),
                ("c.py", "h-c1", "c v1"),
            ],
        )
        .await;
    webhook::apply_event(
        &h.ctx,
        NormalizedEvent::Push {
            installation_id: 1,
            repo: RepoRef {
                id: 10,
                full_name: "acme/app".to_string(),
            },
            head_sha: "sha-2".to_string(),
        },
    )
    .await
    .unwrap();
    h.drain().await;

    assert_eq!(h.reasoner.summarize_count.load(Ordering::SeqCst), 4);
    let entries = h.ctx.storage.current_index_entries(10).await.unwrap();
    assert_eq!(entries.len(), 3);
    let a = entries.iter().find(|e| e.path == "a.py").unwrap();
    // Carried-over entry keeps the commit it was summarized at.
    assert_eq!(a.commit_sha, "sha-1");
    let repo = h.ctx.storage.get_repository(10).await.unwrap().unwrap();
    assert_eq!(repo.current_index_version, 2);
}

#[tokio::test]
async fn hallucinated_finding_is_never_published() {
    let h = harness().await;
    h.install(1, 10, "acme/app").await;
    h.provider
        .set_tree("sha-head", &[("a.py", "h1", "main()")])
        .await;
    h.provider.set_diff(DIFF).await;
    // The diff touches line 2 of a.py; the model reports line 500.
    h.reasoner
        .set_draft(ReviewDraft {
            summary: "suspicious".to_string(),
            findings: vec![RawFinding {
                path: Some("a.py".to_string()),
                start_line: Some(500),
                end_line: Some(500),
                severity: "error".to_string(),
                message: "made this up".to_string(),
            }],
        })
        .await;

    webhook::apply_event(&h.ctx, pr_event(1, 10, "acme/app", 7, "sha-head"))
        .await
        .unwrap();
    h.drain().await;

    // Review still publishes (summary survives) but with zero findings.
    assert_eq!(h.provider.post_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn repeat_publication_reuses_the_marker() {
    let h = harness().await;
    h.install(1, 10, "acme/app").await;

    let publisher = reviewd::publisher::Publisher::new(
        Arc::clone(&h.ctx.storage),
        Arc::clone(&h.ctx.provider),
        Arc::clone(&h.ctx.auth),
    );
    let review = ReviewOutput {
        summary: "ok".to_string(),
        findings: Vec::new(),
        partial_context: false,
    };

    let first = publisher
        .publish("10:review:pr-7@sha", 1, "acme/app", 7, &review)
        .await
        .unwrap();
    let second = publisher
        .publish("10:review:pr-7@sha", 1, "acme/app", 7, &review)
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(h.provider.post_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn uninstall_while_review_runs_suppresses_publication() {
    let h = harness().await;
    h.install(1, 10, "acme/app").await;
    h.provider
        .set_tree("sha-head", &[("a.py", "h1", "main()")])
        .await;
    h.provider.set_diff(DIFF).await;

    webhook::apply_event(&h.ctx, pr_event(1, 10, "acme/app", 7, "sha-head"))
        .await
        .unwrap();

    // Run the index job so the review becomes claimable.
    let index = h.ctx.orchestrator.claim().await.unwrap().unwrap();
    h.worker_execute(&index).await.unwrap();
    h.ctx
        .orchestrator
        .complete(&index.id, Outcome::Success)
        .await
        .unwrap();

    let review = h.ctx.orchestrator.claim().await.unwrap().unwrap();
    assert_eq!(review.kind, JobKind::Review);

    // Installation removed while the review executes.
    webhook::apply_event(&h.ctx, NormalizedEvent::Uninstall { installation_id: 1 })
        .await
        .unwrap();

    h.worker_execute(&review).await.unwrap();
    assert_eq!(h.provider.post_count.load(Ordering::SeqCst), 0);

    let completion = h
        .ctx
        .orchestrator
        .complete(&review.id, Outcome::Success)
        .await
        .unwrap();
    assert_eq!(completion, Completion::Discarded);
    let row = h.ctx.orchestrator.job(&review.id).await.unwrap().unwrap();
    assert_eq!(row.state, JobState::FailedTerminal);
    assert_eq!(row.reason.as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn uninstall_cancels_pending_bootstrap_jobs() {
    let h = harness().await;
    h.install(1, 10, "acme/app").await;

    webhook::apply_event(
        &h.ctx,
        NormalizedEvent::Install {
            installation_id: 1,
            account: "acme".to_string(),
            repositories: vec![RepoRef {
                id: 10,
                full_name: "acme/app".to_string(),
            }],
        },
    )
    .await
    .unwrap();
    assert_eq!(h.ctx.orchestrator.queue_depth().await.unwrap(), 1);

    webhook::apply_event(&h.ctx, NormalizedEvent::Uninstall { installation_id: 1 })
        .await
        .unwrap();
    assert_eq!(h.ctx.orchestrator.queue_depth().await.unwrap(), 0);
}
