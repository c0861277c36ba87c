//! Collaborator traits ("ports") the engine and merger depend on.
//!
//! Concrete implementations live in other workspace crates (`csync-directory`,
//! `csync-store`) so that `csync-core` stays free of HTTP/SQL dependencies.

use crate::error::Result;
use crate::types::{Link, PendingSync};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Directory write operations. Implemented by `csync-directory::DirectoryClient`.
#[async_trait]
pub trait DirectoryWriter: Send + Sync {
    async fn create_contact(&self, body: serde_json::Value) -> Result<serde_json::Value>;

    async fn update_contact(
        &self,
        resource_name: &str,
        body: serde_json::Value,
        update_mask: &str,
        etag: &str,
    ) -> Result<serde_json::Value>;

    async fn batch_delete(&self, resource_names: &[String]) -> Result<()>;

    async fn ensure_group(&self, name: &str) -> Result<Option<String>>;
}

/// Durable storage operations. Implemented by `csync-store::SqliteStore`.
#[async_trait]
pub trait Store: Send + Sync {
    async fn save_link(&self, source_contact_id: &str, directory_resource_name: &str) -> Result<()>;

    async fn get_link(&self, source_contact_id: &str) -> Result<Option<Link>>;

    async fn remap_links(&self, target: &str, sources: &[String]) -> Result<()>;

    async fn enqueue(&self, source_contact_id: i64) -> Result<()>;

    async fn fetch_due(&self, limit: u32) -> Result<Vec<PendingSync>>;

    async fn reschedule(
        &self,
        source_contact_id: i64,
        delay: std::time::Duration,
        error_text: &str,
    ) -> Result<()>;

    async fn dead_letter(&self, source_contact_id: i64, reason: &str, detail: &str) -> Result<()>;

    async fn delete(&self, source_contact_id: i64) -> Result<()>;

    /// All `source_contact_id`s that currently have a `link` row, for
    /// `/sync/backfill` when no explicit id list is supplied.
    async fn all_linked_source_ids(&self) -> Result<Vec<String>>;

    /// All `pending_sync` rows regardless of due-ness, for `/debug/pending`.
    async fn list_pending(&self, limit: u32) -> Result<Vec<PendingSync>>;
}

/// Fetches a single normalised contact from the source CRM.
#[async_trait]
pub trait SourceCrm: Send + Sync {
    async fn fetch_contact(&self, source_contact_id: i64) -> Result<crate::types::CrmContact>;
}

pub fn now() -> DateTime<Utc> {
    Utc::now()
}
