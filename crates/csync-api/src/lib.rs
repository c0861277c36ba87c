//! HTTP surface for the contact-sync service (spec §6): the webhook
//! ingestor, the dry-run/apply sync routes, the supplemented debug/backfill
//! routes, and a health check, all axum-based.

pub mod api_error;
pub mod routes;
pub mod state;
pub mod webhook;

use axum::routing::{get, post};
use axum::Router;
use csync_core::ports::{SourceCrm, Store};
use csync_worker::Directory;
use state::AppState;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Build the full axum [`Router`] over a shared [`AppState`].
pub fn router<S, C, D>(state: Arc<AppState<S, C, D>>) -> Router
where
    S: Store + 'static,
    C: SourceCrm + 'static,
    D: Directory + 'static,
{
    Router::new()
        .route("/health", get(routes::health::health))
        .route("/webhook/amo", post(webhook::ingest))
        .route("/sync/contacts/dry-run", get(routes::sync::dry_run))
        .route("/sync/contacts/apply", post(routes::sync::apply))
        .route("/sync/backfill", post(routes::debug::backfill))
        .route("/debug/merge", post(routes::debug::merge))
        .route("/debug/pending", get(routes::debug::pending))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use csync_core::config::{Config, SourceCrmAuthMode};
    use csync_core::error::Result;
    use csync_core::matcher::DirectoryLookup;
    use csync_core::ports::DirectoryWriter;
    use csync_core::types::CrmContact;
    use csync_store::SqliteStore;
    use csync_worker::PendingQueueWorker;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    struct NoopCrm;
    #[async_trait::async_trait]
    impl SourceCrm for NoopCrm {
        async fn fetch_contact(&self, id: i64) -> Result<CrmContact> {
            Ok(CrmContact {
                source_id: id,
                display_name: Some("Test Contact".into()),
                given_name: None,
                family_name: None,
                phones: vec!["+15550001234".into()],
                emails: vec![],
            })
        }
    }

    #[derive(Default)]
    struct NoopDirectory {
        create_calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl DirectoryLookup for NoopDirectory {
        async fn search_contacts(&self, _query: &str, _read_mask: &str, _sources: Option<&[&str]>) -> Result<Vec<Value>> {
            Ok(Vec::new())
        }
        async fn search_other_contacts(&self, _query: &str, _read_mask: &str) -> Result<Vec<Value>> {
            Ok(Vec::new())
        }
        async fn get_contact(&self, _resource_name: &str, _fields: &str) -> Result<Value> {
            Ok(Value::Null)
        }
    }

    #[async_trait::async_trait]
    impl DirectoryWriter for NoopDirectory {
        async fn create_contact(&self, _body: Value) -> Result<Value> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!({"resourceName": "people/1", "etag": "etag-1"}))
        }
        async fn update_contact(&self, _resource_name: &str, _body: Value, _mask: &str, _etag: &str) -> Result<Value> {
            Ok(serde_json::json!({}))
        }
        async fn batch_delete(&self, _resource_names: &[String]) -> Result<()> {
            Ok(())
        }
        async fn ensure_group(&self, _name: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    fn test_config() -> Config {
        Config {
            directory_rpm: 20,
            directory_group_name: None,
            auto_merge_duplicates: true,
            webhook_secret: "whsecret".into(),
            debug_secret: "dbgsecret".into(),
            source_crm_base_url: "http://example.invalid".into(),
            source_crm_auth_mode: SourceCrmAuthMode::Llt,
            db_path: ":memory:".into(),
            queue_batch_size: 20,
        }
    }

    async fn test_app() -> Router {
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let crm = Arc::new(NoopCrm);
        let directory = Arc::new(NoopDirectory::default());
        let worker = Arc::new(PendingQueueWorker::new(
            store.clone(),
            crm.clone(),
            directory.clone(),
            None,
            true,
            20,
        ));
        let state = Arc::new(AppState::new(store, crm, directory, worker, test_config()));
        router(state)
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let app = test_app().await;
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn webhook_rejects_without_a_matching_secret() {
        let app = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhook/amo")
                    .body(Body::from(r#"{"contact_id": 1}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn webhook_accepts_a_matching_header_secret_and_queues() {
        let app = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhook/amo")
                    .header("X-Webhook-Secret", "whsecret")
                    .body(Body::from(r#"{"contact_id": 7}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["queued"], serde_json::json!([7]));
    }

    #[tokio::test]
    async fn debug_routes_hide_behind_404_without_the_debug_secret() {
        let app = test_app().await;
        let response = app
            .oneshot(Request::builder().uri("/debug/pending").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn debug_pending_lists_rows_with_the_debug_secret() {
        let app = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/debug/pending?token=dbgsecret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn apply_without_confirm_is_forbidden() {
        let app = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/sync/contacts/apply?token=dbgsecret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn apply_with_confirm_and_explicit_ids_creates_a_contact() {
        let app = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/sync/contacts/apply?token=dbgsecret&confirm=1&amo_ids=42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["counts"]["created"], 1);
    }
}
