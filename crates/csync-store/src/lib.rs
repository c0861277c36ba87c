//! SQLite-backed implementation of the `csync_core::ports::Store` port.
//!
//! Schema per the persisted-state layout: `links`, `tokens`, `pending_sync`.
//! Each row transition (delete / reschedule / dead-letter) is a single
//! statement so it commits atomically with whatever link upsert accompanies
//! it (invariant I2).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use csync_core::error::{Result, SyncError};
use csync_core::ports::Store;
use csync_core::types::{truncate_error, Link, PendingSync, DEAD_LETTER_HORIZON_DAYS};
use std::path::Path;
use std::time::Duration;
use tokio_rusqlite::Connection;
use tracing::warn;

fn to_storage_error(err: tokio_rusqlite::Error) -> SyncError {
    SyncError::Storage(err.to_string())
}

fn parse_rfc3339(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| {
            warn!(raw, "unparseable timestamp in storage, treating as epoch");
            DateTime::from_timestamp(0, 0).unwrap()
        })
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).await.map_err(to_storage_error)?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await.map_err(to_storage_error)?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS links (
                        id                      INTEGER PRIMARY KEY AUTOINCREMENT,
                        source_contact_id       TEXT NOT NULL UNIQUE,
                        directory_resource_name TEXT NOT NULL,
                        created_at              TEXT NOT NULL,
                        updated_at              TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS tokens (
                        id            INTEGER PRIMARY KEY AUTOINCREMENT,
                        system        TEXT NOT NULL UNIQUE,
                        access_token  TEXT NOT NULL,
                        refresh_token TEXT,
                        expiry        TEXT,
                        scopes        TEXT,
                        account_id    TEXT,
                        created_at    TEXT NOT NULL,
                        updated_at    TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS pending_sync (
                        id                INTEGER PRIMARY KEY AUTOINCREMENT,
                        source_contact_id INTEGER NOT NULL UNIQUE,
                        attempts          INTEGER NOT NULL DEFAULT 0,
                        next_attempt_at   TEXT NOT NULL,
                        last_error        TEXT,
                        created_at        TEXT NOT NULL,
                        updated_at        TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_pending_sync_due
                        ON pending_sync(next_attempt_at, source_contact_id);
                    ",
                )?;
                Ok(())
            })
            .await
            .map_err(to_storage_error)
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn save_link(&self, source_contact_id: &str, directory_resource_name: &str) -> Result<()> {
        let source_contact_id = source_contact_id.to_string();
        let directory_resource_name = directory_resource_name.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO links (source_contact_id, directory_resource_name, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?3)
                     ON CONFLICT(source_contact_id) DO UPDATE SET
                        directory_resource_name = excluded.directory_resource_name,
                        updated_at = excluded.updated_at",
                    rusqlite::params![source_contact_id, directory_resource_name, now],
                )?;
                Ok(())
            })
            .await
            .map_err(to_storage_error)
    }

    async fn get_link(&self, source_contact_id: &str) -> Result<Option<Link>> {
        let source_contact_id = source_contact_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT source_contact_id, directory_resource_name, created_at, updated_at
                     FROM links WHERE source_contact_id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![source_contact_id])?;
                match rows.next()? {
                    Some(row) => Ok(Some((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))),
                    None => Ok(None),
                }
            })
            .await
            .map_err(to_storage_error)
            .map(|row| {
                row.map(|(source_contact_id, directory_resource_name, created_at, updated_at)| Link {
                    source_contact_id,
                    directory_resource_name,
                    created_at: parse_rfc3339(&created_at),
                    updated_at: parse_rfc3339(&updated_at),
                })
            })
    }

    async fn remap_links(&self, target: &str, sources: &[String]) -> Result<()> {
        if sources.is_empty() {
            return Ok(());
        }
        let target = target.to_string();
        let sources = sources.to_vec();
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for source in &sources {
                    tx.execute(
                        "UPDATE links SET directory_resource_name = ?1, updated_at = ?2
                         WHERE directory_resource_name = ?3",
                        rusqlite::params![target, now, source],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(to_storage_error)
    }

    async fn enqueue(&self, source_contact_id: i64) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO pending_sync (source_contact_id, attempts, next_attempt_at, created_at, updated_at)
                     VALUES (?1, 0, ?2, ?2, ?2)
                     ON CONFLICT(source_contact_id) DO UPDATE SET
                        next_attempt_at = ?2, updated_at = ?2",
                    rusqlite::params![source_contact_id, now],
                )?;
                Ok(())
            })
            .await
            .map_err(to_storage_error)
    }

    async fn fetch_due(&self, limit: u32) -> Result<Vec<PendingSync>> {
        let now = Utc::now().to_rfc3339();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT source_contact_id, attempts, next_attempt_at, last_error, created_at, updated_at
                     FROM pending_sync
                     WHERE next_attempt_at <= ?1
                     ORDER BY next_attempt_at ASC, source_contact_id ASC
                     LIMIT ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![now, limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push((
                        row.get::<_, i64>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ));
                }
                Ok(out)
            })
            .await
            .map_err(to_storage_error)?;

        Ok(rows
            .into_iter()
            .map(
                |(source_contact_id, attempts, next_attempt_at, last_error, created_at, updated_at)| PendingSync {
                    source_contact_id,
                    attempts,
                    next_attempt_at: parse_rfc3339(&next_attempt_at),
                    last_error,
                    created_at: parse_rfc3339(&created_at),
                    updated_at: parse_rfc3339(&updated_at),
                },
            )
            .collect())
    }

    async fn reschedule(&self, source_contact_id: i64, delay: Duration, error_text: &str) -> Result<()> {
        let delay = delay.max(Duration::from_secs(1));
        let next_attempt_at = (Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default()).to_rfc3339();
        let now = Utc::now().to_rfc3339();
        let last_error = truncate_error(error_text);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE pending_sync SET attempts = attempts + 1, next_attempt_at = ?1,
                        last_error = ?2, updated_at = ?3
                     WHERE source_contact_id = ?4",
                    rusqlite::params![next_attempt_at, last_error, now, source_contact_id],
                )?;
                Ok(())
            })
            .await
            .map_err(to_storage_error)
    }

    async fn dead_letter(&self, source_contact_id: i64, reason: &str, detail: &str) -> Result<()> {
        let next_attempt_at =
            (Utc::now() + chrono::Duration::days(DEAD_LETTER_HORIZON_DAYS)).to_rfc3339();
        let now = Utc::now().to_rfc3339();
        let last_error = truncate_error(&format!("{reason}: {detail}"));
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE pending_sync SET attempts = attempts + 1, next_attempt_at = ?1,
                        last_error = ?2, updated_at = ?3
                     WHERE source_contact_id = ?4",
                    rusqlite::params![next_attempt_at, last_error, now, source_contact_id],
                )?;
                Ok(())
            })
            .await
            .map_err(to_storage_error)
    }

    async fn delete(&self, source_contact_id: i64) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM pending_sync WHERE source_contact_id = ?1",
                    rusqlite::params![source_contact_id],
                )?;
                Ok(())
            })
            .await
            .map_err(to_storage_error)
    }

    async fn all_linked_source_ids(&self) -> Result<Vec<String>> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT source_contact_id FROM links")?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row.get::<_, String>(0)?);
                }
                Ok(out)
            })
            .await
            .map_err(to_storage_error)
    }

    async fn list_pending(&self, limit: u32) -> Result<Vec<PendingSync>> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT source_contact_id, attempts, next_attempt_at, last_error, created_at, updated_at
                     FROM pending_sync
                     ORDER BY next_attempt_at ASC, source_contact_id ASC
                     LIMIT ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push((
                        row.get::<_, i64>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ));
                }
                Ok(out)
            })
            .await
            .map_err(to_storage_error)?;

        Ok(rows
            .into_iter()
            .map(
                |(source_contact_id, attempts, next_attempt_at, last_error, created_at, updated_at)| PendingSync {
                    source_contact_id,
                    attempts,
                    next_attempt_at: parse_rfc3339(&next_attempt_at),
                    last_error,
                    created_at: parse_rfc3339(&created_at),
                    updated_at: parse_rfc3339(&updated_at),
                },
            )
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_and_get_link_round_trips() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.save_link("1", "people/1").await.unwrap();
        let link = store.get_link("1").await.unwrap().unwrap();
        assert_eq!(link.directory_resource_name, "people/1");
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_per_source_contact_id() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.enqueue(1).await.unwrap();
        store.enqueue(1).await.unwrap();
        let due = store.fetch_due(10).await.unwrap();
        assert_eq!(due.len(), 1);
    }

    #[tokio::test]
    async fn reschedule_increments_attempts_and_pushes_next_attempt_forward() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.enqueue(1).await.unwrap();
        store
            .reschedule(1, Duration::from_secs(3600), "google_rate_limit")
            .await
            .unwrap();
        let due = store.fetch_due(10).await.unwrap();
        assert!(due.is_empty());
    }

    #[tokio::test]
    async fn reschedule_floors_a_zero_delay_at_one_second() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.enqueue(1).await.unwrap();
        store.reschedule(1, Duration::from_secs(0), "transient").await.unwrap();
        let due = store.fetch_due(10).await.unwrap();
        assert!(due.is_empty(), "zero delay must still push next_attempt_at into the future");
    }

    #[tokio::test]
    async fn dead_letter_pushes_far_into_the_future() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.enqueue(1).await.unwrap();
        store.dead_letter(1, "amo_auth_missing", "no credentials").await.unwrap();
        let due = store.fetch_due(10).await.unwrap();
        assert!(due.is_empty());
    }

    #[tokio::test]
    async fn remap_links_redirects_duplicates_to_primary() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.save_link("1", "people/dup").await.unwrap();
        store.remap_links("people/primary", &["people/dup".to_string()]).await.unwrap();
        let link = store.get_link("1").await.unwrap().unwrap();
        assert_eq!(link.directory_resource_name, "people/primary");
    }

    #[tokio::test]
    async fn list_pending_includes_rows_not_yet_due() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.enqueue(1).await.unwrap();
        store.reschedule(1, Duration::from_secs(3600), "transport").await.unwrap();
        assert!(store.fetch_due(10).await.unwrap().is_empty());
        let pending = store.list_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].source_contact_id, 1);
    }

    #[tokio::test]
    async fn delete_removes_pending_row() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.enqueue(1).await.unwrap();
        store.delete(1).await.unwrap();
        assert!(store.fetch_due(10).await.unwrap().is_empty());
    }
}
