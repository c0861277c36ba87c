//! Single-threaded cooperative pending-queue worker (spec §4.8), grounded on
//! `app/pending_sync_worker.py`'s `PendingSyncWorker`.

use csync_core::engine::SyncEngine;
use csync_core::error::SyncError;
use csync_core::matcher::DirectoryLookup;
use csync_core::ports::{DirectoryWriter, SourceCrm, Store};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const WAKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
const BACKOFF_BASE_SECS: u64 = 30;
const BACKOFF_CAP_SECS: u64 = 1800;

/// `min(1800, 30 * 2^(n-1))` seconds, per spec §4.8.
pub fn backoff(attempt: u32) -> std::time::Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    let delay = BACKOFF_BASE_SECS.saturating_mul(1u64 << exponent);
    std::time::Duration::from_secs(delay.min(BACKOFF_CAP_SECS))
}

/// Directory access the worker needs to build a [`SyncEngine`]; one
/// concrete type (`csync-directory::DirectoryClient`) implements both.
pub trait Directory: DirectoryLookup + DirectoryWriter {}
impl<T: DirectoryLookup + DirectoryWriter> Directory for T {}

pub struct PendingQueueWorker<S, C, D>
where
    S: Store + 'static,
    C: SourceCrm + 'static,
    D: Directory + 'static,
{
    store: Arc<S>,
    crm: Arc<C>,
    directory: Arc<D>,
    group_name: Option<String>,
    auto_merge_duplicates: bool,
    batch_size: u32,
    notify: Arc<Notify>,
    stopping: Arc<AtomicBool>,
    run_lock: Arc<Mutex<()>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<S, C, D> PendingQueueWorker<S, C, D>
where
    S: Store + 'static,
    C: SourceCrm + 'static,
    D: Directory + 'static,
{
    pub fn new(
        store: Arc<S>,
        crm: Arc<C>,
        directory: Arc<D>,
        group_name: Option<String>,
        auto_merge_duplicates: bool,
        batch_size: u32,
    ) -> Self {
        Self {
            store,
            crm,
            directory,
            group_name,
            auto_merge_duplicates,
            batch_size,
            notify: Arc::new(Notify::new()),
            stopping: Arc::new(AtomicBool::new(false)),
            run_lock: Arc::new(Mutex::new(())),
            task: Mutex::new(None),
        }
    }

    /// Launch the loop task. Idempotent: a second call while already
    /// running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        self.stopping.store(false, Ordering::SeqCst);
        let worker = Arc::clone(self);
        *task = Some(tokio::spawn(async move { worker.run().await }));
        info!("pending_sync.worker_started");
    }

    /// Signal termination and await the in-flight `handle` (if any).
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        info!("pending_sync.worker_stopped");
    }

    /// Wake the loop from its wait on the notify signal.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Process up to `limit` (or the configured batch size) due rows
    /// synchronously, for testing and manual backfill draining.
    pub async fn drain(&self, limit: Option<u32>) -> u32 {
        self.process_due(limit.unwrap_or(self.batch_size)).await
    }

    async fn run(&self) {
        while !self.stopping.load(Ordering::SeqCst) {
            let processed = self.process_due(self.batch_size).await;
            if processed > 0 {
                tokio::task::yield_now().await;
                continue;
            }
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            let _ = tokio::time::timeout(WAKE_TIMEOUT, self.notify.notified()).await;
        }
    }

    async fn process_due(&self, limit: u32) -> u32 {
        let _guard = self.run_lock.lock().await;
        let rows = match self.store.fetch_due(limit).await {
            Ok(rows) => rows,
            Err(err) => {
                error!(error = %err, "pending_sync.fetch_due_failed");
                return 0;
            }
        };
        for row in &rows {
            self.handle(row.source_contact_id, row.attempts).await;
        }
        rows.len() as u32
    }

    async fn handle(&self, source_contact_id: i64, attempts: u32) {
        debug!(source_contact_id, attempts, "pending_sync.process");

        let engine = SyncEngine::new(
            self.directory.as_ref(),
            self.directory.as_ref(),
            self.store.as_ref(),
            self.group_name.as_deref(),
            self.auto_merge_duplicates,
        );

        let outcome = self.run_once(&engine, source_contact_id).await;

        match outcome {
            Ok(resource_name) => {
                if let Err(err) = self.store.delete(source_contact_id).await {
                    error!(source_contact_id, error = %err, "pending_sync.delete_failed");
                    return;
                }
                info!(source_contact_id, resource_name = resource_name.as_deref(), "pending_sync.synced");
            }
            Err(SyncError::RateLimited { retry_after_seconds }) => {
                let delay = backoff(attempts + 1).max(std::time::Duration::from_secs(retry_after_seconds));
                self.reschedule(source_contact_id, delay, "google_rate_limit").await;
                warn!(source_contact_id, delay_secs = delay.as_secs(), "pending_sync.retry_rate_limit");
            }
            Err(SyncError::AuthMissing) => {
                self.dead_letter(source_contact_id, "amo_auth_missing", "source CRM credentials missing").await;
                error!(source_contact_id, "pending_sync.dead_letter");
            }
            Err(err) => {
                let delay = backoff(attempts + 1);
                self.reschedule(source_contact_id, delay, &error_class_name(&err)).await;
                warn!(source_contact_id, error = %err, "pending_sync.retry_error");
            }
        }
    }

    async fn run_once(&self, engine: &SyncEngine<'_>, source_contact_id: i64) -> Result<Option<String>, SyncError> {
        let contact = self.crm.fetch_contact(source_contact_id).await?;
        let plan = engine.plan(&contact).await?;
        let result = engine.apply(plan).await?;
        Ok(result.resource_name)
    }

    async fn reschedule(&self, source_contact_id: i64, delay: std::time::Duration, error_text: &str) {
        if let Err(err) = self.store.reschedule(source_contact_id, delay, error_text).await {
            error!(source_contact_id, error = %err, "pending_sync.reschedule_failed");
        }
    }

    async fn dead_letter(&self, source_contact_id: i64, reason: &str, detail: &str) {
        if let Err(err) = self.store.dead_letter(source_contact_id, reason, detail).await {
            error!(source_contact_id, error = %err, "pending_sync.dead_letter_failed");
        }
    }
}

fn error_class_name(err: &SyncError) -> String {
    match err {
        SyncError::InvalidInput(_) => "InvalidInput".to_string(),
        SyncError::Unauthorised => "Unauthorised".to_string(),
        SyncError::AuthMissing => "AuthMissing".to_string(),
        SyncError::RateLimited { .. } => "RateLimited".to_string(),
        SyncError::Recoverable { .. } => "Recoverable".to_string(),
        SyncError::Transport { .. } => "Transport".to_string(),
        SyncError::Storage(_) => "Storage".to_string(),
    }
}
