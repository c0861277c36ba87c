//! `/debug/*` and `/sync/backfill` — supplemented introspection/re-drive
//! endpoints (SPEC_FULL.md §6), grounded on `app/api/debug_merge.py`,
//! `app/backfill.py`, and `app/debug.py`'s `require_debug_secret` guard.

use crate::api_error::ApiError;
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use csync_core::engine::SyncEngine;
use csync_core::error::SyncError;
use csync_core::ports::{SourceCrm, Store};
use csync_core::types::MatchKeys;
use csync_worker::Directory;
use serde_json::json;
use std::sync::Arc;

fn require_debug_secret<S, C, D>(state: &AppState<S, C, D>, headers: &HeaderMap, token: Option<&str>) -> bool
where
    S: Store + 'static,
    C: SourceCrm + 'static,
    D: Directory + 'static,
{
    let header_secret = headers.get("X-Debug-Secret").and_then(|v| v.to_str().ok());
    header_secret.is_some_and(|s| state.debug_secret_matches(s)) || token.is_some_and(|t| state.debug_secret_matches(t))
}

/// `require_debug_secret` failures return 404, not 401 — matches
/// `app/debug.py`, which hides the existence of debug routes from
/// unauthenticated callers rather than advertising them.
fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({"detail": "Not Found"}))).into_response()
}

#[derive(serde::Deserialize, Default)]
pub struct MergeQuery {
    token: Option<String>,
}

#[derive(serde::Deserialize)]
pub struct MergeBody {
    #[serde(default)]
    phones: Vec<String>,
    #[serde(default)]
    emails: Vec<String>,
    source_contact_id: Option<i64>,
}

pub async fn merge<S, C, D>(
    State(state): State<Arc<AppState<S, C, D>>>,
    headers: HeaderMap,
    Query(query): Query<MergeQuery>,
    Json(body): Json<MergeBody>,
) -> Response
where
    S: Store + 'static,
    C: SourceCrm + 'static,
    D: Directory + 'static,
{
    if !require_debug_secret(&state, &headers, query.token.as_deref()) {
        return not_found();
    }

    let keys = MatchKeys { phones: body.phones, emails: body.emails };
    if keys.is_empty() && body.source_contact_id.is_none() {
        return ApiError(SyncError::InvalidInput("no match keys or source_contact_id given".into())).into_response();
    }

    let mapped_resource_name = match body.source_contact_id {
        Some(id) => match state.store.get_link(&id.to_string()).await {
            Ok(link) => link.map(|l| l.directory_resource_name),
            Err(err) => return ApiError(err).into_response(),
        },
        None => None,
    };

    let engine = SyncEngine::new(
        state.directory.as_ref(),
        state.directory.as_ref(),
        state.store.as_ref(),
        state.config.directory_group_name.as_deref(),
        state.config.auto_merge_duplicates,
    );

    match engine.merge_candidates(&keys, body.source_contact_id, mapped_resource_name).await {
        Ok(result) => Json(json!({
            "status": "ok",
            "action": result.action,
            "resource_name": result.resource_name,
            "deleted": result.deleted,
        }))
        .into_response(),
        Err(err) => ApiError(err).into_response(),
    }
}

#[derive(serde::Deserialize, Default)]
pub struct BackfillQuery {
    token: Option<String>,
    limit: Option<u32>,
    amo_ids: Option<String>,
}

pub async fn backfill<S, C, D>(
    State(state): State<Arc<AppState<S, C, D>>>,
    headers: HeaderMap,
    Query(query): Query<BackfillQuery>,
) -> Response
where
    S: Store + 'static,
    C: SourceCrm + 'static,
    D: Directory + 'static,
{
    if !require_debug_secret(&state, &headers, query.token.as_deref()) {
        return not_found();
    }

    let limit = query.limit.unwrap_or(500).clamp(1, 5000);
    let ids: Result<Vec<i64>, ApiError> = match query.amo_ids.as_deref() {
        Some(csv) => csv
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<i64>().map_err(|_| ApiError(SyncError::InvalidInput("invalid amo_ids".into()))))
            .collect(),
        None => match state.store.all_linked_source_ids().await {
            Ok(linked) => Ok(linked.into_iter().filter_map(|id| id.parse::<i64>().ok()).take(limit as usize).collect()),
            Err(err) => Err(ApiError(err)),
        },
    };
    let ids = match ids {
        Ok(ids) => ids,
        Err(err) => return err.into_response(),
    };

    let mut enqueued = 0u32;
    for id in &ids {
        if let Err(err) = state.store.enqueue(*id).await {
            tracing::error!(error = %err, source_contact_id = id, "backfill.enqueue_failed");
            continue;
        }
        enqueued += 1;
    }
    state.worker.wake();

    Json(json!({"status": "ok", "enqueued": enqueued, "total": ids.len()})).into_response()
}

#[derive(serde::Deserialize, Default)]
pub struct PendingQuery {
    token: Option<String>,
    limit: Option<u32>,
}

pub async fn pending<S, C, D>(
    State(state): State<Arc<AppState<S, C, D>>>,
    headers: HeaderMap,
    Query(query): Query<PendingQuery>,
) -> Response
where
    S: Store + 'static,
    C: SourceCrm + 'static,
    D: Directory + 'static,
{
    if !require_debug_secret(&state, &headers, query.token.as_deref()) {
        return not_found();
    }

    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    match state.store.list_pending(limit).await {
        Ok(rows) => Json(json!({
            "status": "ok",
            "rows": rows.iter().map(|r| json!({
                "source_contact_id": r.source_contact_id,
                "attempts": r.attempts,
                "next_attempt_at": r.next_attempt_at,
                "last_error": r.last_error,
            })).collect::<Vec<_>>(),
        }))
        .into_response(),
        Err(err) => ApiError(err).into_response(),
    }
}
