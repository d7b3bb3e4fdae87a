//! Queue Store (C1): durable persistence of downloads and their chunks.
//!
//! Backed by SQLite through `sqlx`: `SqlitePoolOptions` with a capped
//! connection count, `PRAGMA journal_mode=WAL`, `PRAGMA busy_timeout`, and
//! `sqlx::migrate!` running versioned SQL files from `migrations/` at
//! startup.

mod error;
mod models;

pub use error::{StoreDbErrorKind, StoreError};
pub use models::{ChunkRow, DownloadRow, DownloadState, ProgressUpdate};

use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::instrument;

/// Pragmas every pooled connection needs, not just the one the pool
/// happens to hand out first: WAL for concurrent readers during a writer
/// transaction, a busy timeout so a contended write retries instead of
/// failing immediately, and foreign-key enforcement so the chunks table's
/// `ON DELETE CASCADE` actually fires (SQLite disables FK enforcement per
/// connection by default).
async fn configure_connection(conn: &mut sqlx::SqliteConnection) -> Result<(), sqlx::Error> {
    use sqlx::Executor;
    conn.execute("PRAGMA journal_mode=WAL").await?;
    conn.execute(format!("PRAGMA busy_timeout={BUSY_TIMEOUT_MS}").as_str()).await?;
    conn.execute("PRAGMA foreign_keys=ON").await?;
    Ok(())
}

/// Maximum number of pooled connections. Kept low for SQLite, which uses
/// file-level locking; concurrent writers serialize regardless of pool size.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// SQLite busy timeout in milliseconds before a write returns `SQLITE_BUSY`.
const BUSY_TIMEOUT_MS: u32 = 5000;

/// Durable store for [`DownloadRow`]/[`ChunkRow`] state.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if absent) a SQLite database at `db_path`, enables
    /// WAL mode, and runs pending migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the connection or migrations fail.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn open(db_path: &std::path::Path) -> Result<Self, StoreError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .after_connect(|conn, _meta| Box::pin(async move { configure_connection(conn).await }))
            .connect(&db_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Opens an in-memory database for tests. Migrations still apply.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the connection or migrations fail.
    #[instrument]
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .after_connect(|conn, _meta| Box::pin(async move { configure_connection(conn).await }))
            .connect("sqlite::memory:")
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Inserts a new download row, or replaces an existing one with the
    /// same id (used by `retry`, which re-seeds a fresh attempt in place).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on a database failure.
    #[instrument(skip(self, row), fields(id = %row.id))]
    pub async fn upsert_download(&self, row: &DownloadRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO downloads (
                id, title, url, save_path, total_bytes, state, downloaded_bytes,
                progress, chunked, num_chunks, force_overwrite, preserve_structure,
                queue_position, created_at, updated_at, completed_at, last_error, attempts
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                url = excluded.url,
                save_path = excluded.save_path,
                total_bytes = excluded.total_bytes,
                state = excluded.state,
                downloaded_bytes = excluded.downloaded_bytes,
                progress = excluded.progress,
                chunked = excluded.chunked,
                num_chunks = excluded.num_chunks,
                force_overwrite = excluded.force_overwrite,
                preserve_structure = excluded.preserve_structure,
                queue_position = excluded.queue_position,
                updated_at = excluded.updated_at,
                completed_at = excluded.completed_at,
                last_error = excluded.last_error,
                attempts = excluded.attempts",
        )
        .bind(&row.id)
        .bind(&row.title)
        .bind(&row.url)
        .bind(&row.save_path)
        .bind(row.total_bytes)
        .bind(&row.state_str)
        .bind(row.downloaded_bytes)
        .bind(row.progress)
        .bind(row.chunked)
        .bind(row.num_chunks)
        .bind(row.force_overwrite)
        .bind(row.preserve_structure)
        .bind(row.queue_position)
        .bind(row.created_at)
        .bind(row.updated_at)
        .bind(row.completed_at)
        .bind(&row.last_error)
        .bind(row.attempts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Updates `state`, `updated_at`, `completed_at`, and `last_error` for a
    /// single download. Used on every Orchestrator state-machine transition.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DownloadNotFound`] if no row matches `id`, or a
    /// database error.
    #[instrument(skip(self), fields(id, state = %state))]
    pub async fn update_state(
        &self,
        id: &str,
        state: DownloadState,
        updated_at: i64,
        completed_at: Option<i64>,
        last_error: Option<&str>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE downloads SET state = ?, updated_at = ?, completed_at = ?, last_error = ? WHERE id = ?",
        )
        .bind(state.as_str())
        .bind(updated_at)
        .bind(completed_at)
        .bind(last_error)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DownloadNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Applies a batch of progress updates as a single transaction — the hot
    /// path the Aggregator calls on every throttled flush.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the transaction fails; none of the updates
    /// in the batch are applied (the caller's in-memory copy stays
    /// authoritative and is retried on the next flush).
    #[instrument(skip(self, updates), fields(count = updates.len()))]
    pub async fn update_progress_batch(&self, updates: &[ProgressUpdate]) -> Result<(), StoreError> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for update in updates {
            sqlx::query(
                "UPDATE downloads SET downloaded_bytes = ?, progress = ?, updated_at = ? WHERE id = ?",
            )
            .bind(update.downloaded_bytes)
            .bind(update.progress)
            .bind(update.updated_at)
            .bind(&update.id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Inserts or updates a single chunk row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on a database failure.
    #[instrument(skip(self, chunk), fields(download_id = %chunk.download_id, index = chunk.index))]
    pub async fn update_chunk(&self, chunk: &ChunkRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO chunks (
                download_id, chunk_index, byte_start, byte_end, size,
                downloaded_bytes, completed, attempts, last_error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(download_id, chunk_index) DO UPDATE SET
                downloaded_bytes = excluded.downloaded_bytes,
                completed = excluded.completed,
                attempts = excluded.attempts,
                last_error = excluded.last_error",
        )
        .bind(&chunk.download_id)
        .bind(chunk.index)
        .bind(chunk.byte_start)
        .bind(chunk.byte_end)
        .bind(chunk.size)
        .bind(chunk.downloaded_bytes)
        .bind(chunk.completed)
        .bind(chunk.attempts)
        .bind(&chunk.last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns all chunk rows belonging to a download, ordered by index.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on a database failure.
    #[instrument(skip(self))]
    pub async fn get_chunks(&self, download_id: &str) -> Result<Vec<ChunkRow>, StoreError> {
        let rows = sqlx::query_as::<_, ChunkRow>(
            "SELECT download_id, chunk_index, byte_start, byte_end, size,
                    downloaded_bytes, completed, attempts, last_error
             FROM chunks WHERE download_id = ? ORDER BY chunk_index ASC",
        )
        .bind(download_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Ids of downloads in an active state (`starting`, `progressing`, `merging`).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on a database failure.
    #[instrument(skip(self))]
    pub async fn get_active_ids(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT id FROM downloads WHERE state IN ('starting', 'progressing', 'merging')",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get::<String, _>("id")).collect())
    }

    /// Ids of `queued` downloads, FIFO-ordered by `created_at`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on a database failure.
    #[instrument(skip(self))]
    pub async fn get_queued_ids_ordered_by_added_at(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT id FROM downloads WHERE state = 'queued' ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get::<String, _>("id")).collect())
    }

    /// Loads every non-deleted download, used at startup to emit
    /// `downloads-restored` and let the Scheduler rehydrate state.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on a database failure.
    #[instrument(skip(self))]
    pub async fn load_all_unfinished(&self) -> Result<Vec<DownloadRow>, StoreError> {
        let rows = sqlx::query_as::<_, DownloadRow>(
            "SELECT id, title, url, save_path, total_bytes, state, downloaded_bytes,
                    progress, chunked, num_chunks, force_overwrite, preserve_structure,
                    queue_position, created_at, updated_at, completed_at, last_error, attempts
             FROM downloads ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Loads a single download by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DownloadNotFound`] if absent, or a database error.
    #[instrument(skip(self))]
    pub async fn get_download(&self, id: &str) -> Result<DownloadRow, StoreError> {
        sqlx::query_as::<_, DownloadRow>(
            "SELECT id, title, url, save_path, total_bytes, state, downloaded_bytes,
                    progress, chunked, num_chunks, force_overwrite, preserve_structure,
                    queue_position, created_at, updated_at, completed_at, last_error, attempts
             FROM downloads WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::DownloadNotFound(id.to_string()))
    }

    /// Deletes a download and cascades its chunks.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on a database failure.
    #[instrument(skip(self))]
    pub async fn delete_download(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM downloads WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Deletes completed/cancelled downloads older than `days` and records
    /// the run in `history_cleanup_log`. Returns the number of rows removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on a database failure.
    #[instrument(skip(self))]
    pub async fn prune_older_than(&self, days: i64, now: i64) -> Result<u64, StoreError> {
        let cutoff = now - days * 86_400;
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "DELETE FROM downloads WHERE state IN ('completed', 'cancelled') AND updated_at < ?",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;
        let count = result.rows_affected();
        sqlx::query("INSERT INTO history_cleanup_log (cleaned_at, count) VALUES (?, ?)")
            .bind(now)
            .bind(count as i64)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(count)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample_row(id: &str, created_at: i64) -> DownloadRow {
        DownloadRow {
            id: id.to_string(),
            title: "sample".to_string(),
            url: "https://example.com/file.bin".to_string(),
            save_path: "/tmp/file.bin".to_string(),
            total_bytes: Some(1000),
            state_str: DownloadState::Queued.as_str().to_string(),
            downloaded_bytes: 0,
            progress: 0.0,
            chunked: false,
            num_chunks: 1,
            force_overwrite: false,
            preserve_structure: true,
            queue_position: None,
            created_at,
            updated_at: created_at,
            completed_at: None,
            last_error: None,
            attempts: 0,
        }
    }

    #[tokio::test]
    async fn test_upsert_then_get_round_trips() {
        let store = Store::in_memory().await.unwrap();
        let row = sample_row("dl-1", 100);
        store.upsert_download(&row).await.unwrap();

        let loaded = store.get_download("dl-1").await.unwrap();
        assert_eq!(loaded.title, "sample");
        assert_eq!(loaded.state().unwrap(), DownloadState::Queued);
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_on_same_id() {
        let store = Store::in_memory().await.unwrap();
        store.upsert_download(&sample_row("dl-1", 100)).await.unwrap();
        let mut second = sample_row("dl-1", 100);
        second.title = "renamed".to_string();
        store.upsert_download(&second).await.unwrap();

        let all = store.load_all_unfinished().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].title, "renamed");
    }

    #[tokio::test]
    async fn test_update_state_missing_download_errors() {
        let store = Store::in_memory().await.unwrap();
        let result = store
            .update_state("missing", DownloadState::Completed, 1, Some(1), None)
            .await;
        assert!(matches!(result, Err(StoreError::DownloadNotFound(_))));
    }

    #[tokio::test]
    async fn test_update_state_changes_active_ids() {
        let store = Store::in_memory().await.unwrap();
        store.upsert_download(&sample_row("dl-1", 100)).await.unwrap();
        store
            .update_state("dl-1", DownloadState::Progressing, 200, None, None)
            .await
            .unwrap();

        let active = store.get_active_ids().await.unwrap();
        assert_eq!(active, vec!["dl-1".to_string()]);
    }

    #[tokio::test]
    async fn test_progress_batch_applies_all_in_one_transaction() {
        let store = Store::in_memory().await.unwrap();
        store.upsert_download(&sample_row("dl-1", 100)).await.unwrap();
        store.upsert_download(&sample_row("dl-2", 101)).await.unwrap();

        store
            .update_progress_batch(&[
                ProgressUpdate { id: "dl-1".into(), downloaded_bytes: 500, progress: 0.5, updated_at: 300 },
                ProgressUpdate { id: "dl-2".into(), downloaded_bytes: 250, progress: 0.25, updated_at: 300 },
            ])
            .await
            .unwrap();

        let d1 = store.get_download("dl-1").await.unwrap();
        let d2 = store.get_download("dl-2").await.unwrap();
        assert_eq!(d1.downloaded_bytes, 500);
        assert_eq!(d2.downloaded_bytes, 250);
    }

    #[tokio::test]
    async fn test_queued_ids_are_fifo_by_created_at() {
        let store = Store::in_memory().await.unwrap();
        store.upsert_download(&sample_row("dl-late", 200)).await.unwrap();
        store.upsert_download(&sample_row("dl-early", 100)).await.unwrap();

        let queued = store.get_queued_ids_ordered_by_added_at().await.unwrap();
        assert_eq!(queued, vec!["dl-early".to_string(), "dl-late".to_string()]);
    }

    #[tokio::test]
    async fn test_chunk_upsert_and_fetch() {
        let store = Store::in_memory().await.unwrap();
        store.upsert_download(&sample_row("dl-1", 100)).await.unwrap();
        store
            .update_chunk(&ChunkRow {
                download_id: "dl-1".into(),
                index: 0,
                byte_start: 0,
                byte_end: 499,
                size: 500,
                downloaded_bytes: 100,
                completed: false,
                attempts: 1,
                last_error: None,
            })
            .await
            .unwrap();

        let chunks = store.get_chunks("dl-1").await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].downloaded_bytes, 100);
    }

    #[tokio::test]
    async fn test_delete_download_cascades_chunks() {
        let store = Store::in_memory().await.unwrap();
        store.upsert_download(&sample_row("dl-1", 100)).await.unwrap();
        store
            .update_chunk(&ChunkRow {
                download_id: "dl-1".into(),
                index: 0,
                byte_start: 0,
                byte_end: 99,
                size: 100,
                downloaded_bytes: 0,
                completed: false,
                attempts: 0,
                last_error: None,
            })
            .await
            .unwrap();

        store.delete_download("dl-1").await.unwrap();
        assert!(store.get_chunks("dl-1").await.unwrap().is_empty());
        assert!(matches!(
            store.get_download("dl-1").await,
            Err(StoreError::DownloadNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_prune_older_than_removes_only_terminal_and_stale() {
        let store = Store::in_memory().await.unwrap();
        let mut old_completed = sample_row("dl-old", 0);
        old_completed.state_str = DownloadState::Completed.as_str().to_string();
        old_completed.updated_at = 0;
        store.upsert_download(&old_completed).await.unwrap();

        let mut recent_completed = sample_row("dl-recent", 0);
        recent_completed.state_str = DownloadState::Completed.as_str().to_string();
        recent_completed.updated_at = 1_000_000;
        store.upsert_download(&recent_completed).await.unwrap();

        store.upsert_download(&sample_row("dl-active", 1_000_000)).await.unwrap();

        let now = 10 * 86_400;
        let removed = store.prune_older_than(7, now).await.unwrap();
        assert_eq!(removed, 1);

        let remaining = store.load_all_unfinished().await.unwrap();
        let ids: Vec<_> = remaining.iter().map(|r| r.id.clone()).collect();
        assert!(ids.contains(&"dl-recent".to_string()));
        assert!(ids.contains(&"dl-active".to_string()));
        assert!(!ids.contains(&"dl-old".to_string()));
    }
}
