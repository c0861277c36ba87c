//! Shared HTTP-layer state: the store/CRM/directory handles, config, the
//! pending-queue worker, and the webhook event ring (spec §4.9, §5).

use chrono::{DateTime, Utc};
use csync_core::config::Config;
use csync_core::ports::{SourceCrm, Store};
use csync_worker::{Directory, PendingQueueWorker};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

const EVENT_RING_CAPACITY: usize = 10;

/// One ingested webhook delivery, kept for `/debug/*` operational visibility.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEvent {
    pub received_at: DateTime<Utc>,
    pub source_contact_ids: Vec<i64>,
}

pub struct AppState<S, C, D>
where
    S: Store + 'static,
    C: SourceCrm + 'static,
    D: Directory + 'static,
{
    pub store: Arc<S>,
    pub crm: Arc<C>,
    pub directory: Arc<D>,
    pub worker: Arc<PendingQueueWorker<S, C, D>>,
    pub config: Config,
    events: Mutex<VecDeque<WebhookEvent>>,
}

impl<S, C, D> AppState<S, C, D>
where
    S: Store + 'static,
    C: SourceCrm + 'static,
    D: Directory + 'static,
{
    pub fn new(
        store: Arc<S>,
        crm: Arc<C>,
        directory: Arc<D>,
        worker: Arc<PendingQueueWorker<S, C, D>>,
        config: Config,
    ) -> Self {
        Self {
            store,
            crm,
            directory,
            worker,
            config,
            events: Mutex::new(VecDeque::with_capacity(EVENT_RING_CAPACITY)),
        }
    }

    /// Append a delivery to the ring buffer, evicting the oldest once full.
    pub async fn record_webhook_event(&self, source_contact_ids: Vec<i64>) {
        let mut events = self.events.lock().await;
        if events.len() == EVENT_RING_CAPACITY {
            events.pop_front();
        }
        events.push_back(WebhookEvent {
            received_at: Utc::now(),
            source_contact_ids,
        });
    }

    pub async fn recent_webhook_events(&self) -> Vec<WebhookEvent> {
        self.events.lock().await.iter().cloned().collect()
    }

    /// Any of the three configured secrets matches `candidate`.
    pub fn webhook_secret_matches(&self, candidate: &str) -> bool {
        secret_eq(&self.config.webhook_secret, candidate) || secret_eq(&self.config.debug_secret, candidate)
    }

    pub fn debug_secret_matches(&self, candidate: &str) -> bool {
        secret_eq(&self.config.debug_secret, candidate)
    }
}

/// Constant-time comparison against a non-empty configured secret (an empty
/// configured secret never matches, so leaving a secret unset disables the
/// corresponding auth path rather than accepting an empty header/query).
fn secret_eq(configured: &str, candidate: &str) -> bool {
    use subtle::ConstantTimeEq;
    !configured.is_empty() && configured.as_bytes().ct_eq(candidate.as_bytes()).into()
}
