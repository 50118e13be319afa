//! SQLite persistence for the review pipeline.
//!
//! Owns the shared connection pool plus the tables the core durably persists:
//! installations, repositories, versioned index entries, webhook delivery
//! dedup, and publication markers. Job-queue SQL lives in the orchestrator,
//! which shares this pool.

use anyhow::{Context as _, Result};
use chrono::Utc;
use sqlx::{sqlite::SqliteConnectOptions, ConnectOptions, SqlitePool};
use std::{path::Path, str::FromStr};

/// Default timeout for individual SQLite queries.
/// Prevents hung queries from blocking workers indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// How long webhook delivery ids are retained for replay dedup.
pub const DELIVERY_RETENTION_HOURS: i64 = 24;

/// Execute a future with the standard query timeout.
/// Returns an error if the operation takes longer than `QUERY_TIMEOUT`.
pub(crate) async fn with_timeout<T>(
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InstallationRow {
    pub id: i64,
    /// Owning account/organization login on the provider.
    pub account: String,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RepositoryRow {
    pub id: i64,
    pub full_name: String,
    /// Weak reference — the installation row may already be gone.
    pub installation_id: i64,
    /// 0 until the first successful indexing run.
    pub current_index_version: i64,
    pub last_indexed_sha: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IndexEntryRow {
    pub repo_id: i64,
    pub version: i64,
    pub path: String,
    /// Hex SHA-256 of the blob content this summary was computed from.
    pub content_hash: String,
    pub summary: String,
    /// Commit at which this entry was last (re)written.
    pub commit_sha: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PublicationRow {
    pub job_key: String,
    pub published_ref: String,
    pub created_at: String,
}

/// A fresh index entry produced by an indexing run, before it has a version.
#[derive(Debug, Clone)]
pub struct NewIndexEntry {
    pub path: String,
    pub content_hash: String,
    pub summary: String,
    pub commit_sha: String,
}

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        Self::new_with_slow_query(data_dir, 0).await
    }

    /// Create storage with slow-query logging enabled.
    ///
    /// `slow_query_ms` is the threshold in milliseconds — queries exceeding it
    /// are logged at WARN level. Set to 0 to disable slow-query logging.
    pub async fn new_with_slow_query(data_dir: &Path, slow_query_ms: u64) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("reviewd.db");
        let mut opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        if slow_query_ms > 0 {
            opts = opts.log_slow_statements(
                log::LevelFilter::Warn,
                std::time::Duration::from_millis(slow_query_ms),
            );
        }

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Return a clone of the connection pool (cheap — Arc-backed).
    /// The orchestrator shares this pool for the jobs table.
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::migrate!("src/storage/migrations")
            .run(pool)
            .await
            .context("failed to run database migrations")?;
        Ok(())
    }

    // ── Installations ────────────────────────────────────────────────────────

    pub async fn upsert_installation(&self, id: i64, account: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query(
                "INSERT INTO installations (id, account, created_at) VALUES (?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET account = excluded.account",
            )
            .bind(id)
            .bind(account)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn delete_installation(&self, id: i64) -> Result<()> {
        with_timeout(async {
            sqlx::query("DELETE FROM installations WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn get_installation(&self, id: i64) -> Result<Option<InstallationRow>> {
        with_timeout(async {
            let row = sqlx::query_as::<_, InstallationRow>(
                "SELECT * FROM installations WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        })
        .await
    }

    // ── Repositories ─────────────────────────────────────────────────────────

    /// Create or refresh a repository record. Index state is preserved on
    /// conflict — only the name/installation binding is updated.
    pub async fn upsert_repository(
        &self,
        id: i64,
        full_name: &str,
        installation_id: i64,
    ) -> Result<()> {
        with_timeout(async {
            sqlx::query(
                "INSERT INTO repositories (id, full_name, installation_id) VALUES (?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                     full_name = excluded.full_name,
                     installation_id = excluded.installation_id",
            )
            .bind(id)
            .bind(full_name)
            .bind(installation_id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn get_repository(&self, id: i64) -> Result<Option<RepositoryRow>> {
        with_timeout(async {
            let row =
                sqlx::query_as::<_, RepositoryRow>("SELECT * FROM repositories WHERE id = ?")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row)
        })
        .await
    }

    pub async fn repo_ids_for_installation(&self, installation_id: i64) -> Result<Vec<i64>> {
        with_timeout(async {
            let ids: Vec<(i64,)> =
                sqlx::query_as("SELECT id FROM repositories WHERE installation_id = ?")
                    .bind(installation_id)
                    .fetch_all(&self.pool)
                    .await?;
            Ok(ids.into_iter().map(|(id,)| id).collect())
        })
        .await
    }

    // ── Index entries ────────────────────────────────────────────────────────

    /// All entries of the repository's current index version.
    pub async fn current_index_entries(&self, repo_id: i64) -> Result<Vec<IndexEntryRow>> {
        with_timeout(async {
            let rows = sqlx::query_as::<_, IndexEntryRow>(
                "SELECT e.* FROM index_entries e
                 JOIN repositories r ON r.id = e.repo_id
                 WHERE e.repo_id = ? AND e.version = r.current_index_version",
            )
            .bind(repo_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        })
        .await
    }

    /// Current-version entry for a single path, if present.
    pub async fn index_entry(&self, repo_id: i64, path: &str) -> Result<Option<IndexEntryRow>> {
        with_timeout(async {
            let row = sqlx::query_as::<_, IndexEntryRow>(
                "SELECT e.* FROM index_entries e
                 JOIN repositories r ON r.id = e.repo_id
                 WHERE e.repo_id = ? AND e.version = r.current_index_version AND e.path = ?",
            )
            .bind(repo_id)
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        })
        .await
    }

    /// Write a complete new index version and swap the repository's pointer.
    ///
    /// All entries land under `current_index_version + 1` and the pointer
    /// update commits in the same transaction, so a reader observes either
    /// the previous complete version or the new one — never a partial write.
    /// Versions older than the previous one are garbage-collected.
    pub async fn write_index_version(
        &self,
        repo_id: i64,
        commit_sha: &str,
        entries: &[NewIndexEntry],
    ) -> Result<i64> {
        with_timeout(async {
            let mut tx = self.pool.begin().await?;

            let (current,): (i64,) =
                sqlx::query_as("SELECT current_index_version FROM repositories WHERE id = ?")
                    .bind(repo_id)
                    .fetch_one(&mut *tx)
                    .await?;
            let next = current + 1;

            for entry in entries {
                sqlx::query(
                    "INSERT INTO index_entries
                         (repo_id, version, path, content_hash, summary, commit_sha)
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(repo_id)
                .bind(next)
                .bind(&entry.path)
                .bind(&entry.content_hash)
                .bind(&entry.summary)
                .bind(&entry.commit_sha)
                .execute(&mut *tx)
                .await?;
            }

            sqlx::query(
                "UPDATE repositories
                 SET current_index_version = ?, last_indexed_sha = ?
                 WHERE id = ?",
            )
            .bind(next)
            .bind(commit_sha)
            .bind(repo_id)
            .execute(&mut *tx)
            .await?;

            // Keep the previous version for in-flight readers; drop the rest.
            sqlx::query("DELETE FROM index_entries WHERE repo_id = ? AND version < ?")
                .bind(repo_id)
                .bind(current)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(next)
        })
        .await
    }

    // ── Webhook delivery dedup ───────────────────────────────────────────────

    /// Record a provider delivery id. Returns `false` if the id was already
    /// seen within the retention window (replayed delivery — skip it).
    pub async fn try_record_delivery(&self, delivery_id: &str) -> Result<bool> {
        with_timeout(async {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO webhook_deliveries (delivery_id, received_at)
                 VALUES (?, ?)",
            )
            .bind(delivery_id)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    /// Release a delivery id claimed by [`Self::try_record_delivery`], so the
    /// provider's redelivery is accepted after a failed ingestion.
    pub async fn forget_delivery(&self, delivery_id: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query("DELETE FROM webhook_deliveries WHERE delivery_id = ?")
                .bind(delivery_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    /// Drop delivery ids older than the retention window.
    pub async fn prune_deliveries(&self) -> Result<u64> {
        with_timeout(async {
            let cutoff =
                (Utc::now() - chrono::Duration::hours(DELIVERY_RETENTION_HOURS)).to_rfc3339();
            let result = sqlx::query("DELETE FROM webhook_deliveries WHERE received_at < ?")
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    // ── Publication markers ──────────────────────────────────────────────────

    pub async fn get_publication(&self, job_key: &str) -> Result<Option<PublicationRow>> {
        with_timeout(async {
            let row = sqlx::query_as::<_, PublicationRow>(
                "SELECT * FROM publications WHERE job_key = ?",
            )
            .bind(job_key)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        })
        .await
    }

    pub async fn record_publication(&self, job_key: &str, published_ref: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query(
                "INSERT OR IGNORE INTO publications (job_key, published_ref, created_at)
                 VALUES (?, ?, ?)",
            )
            .bind(job_key)
            .bind(published_ref)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }
}
