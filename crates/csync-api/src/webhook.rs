//! `POST /webhook/amo` — inbound webhook ingestion (spec §4.9).
//!
//! Auth is any-one-of three shared secrets; the body is parsed permissively
//! as JSON first, then as a form, recognising the several id shapes the
//! source CRM's webhook payloads use.

use crate::state::AppState;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use csync_core::ports::{SourceCrm, Store};
use csync_worker::Directory;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::OnceLock;
use tracing::info;

#[derive(serde::Deserialize)]
pub struct WebhookQuery {
    token: Option<String>,
}

fn authorised<S, C, D>(state: &AppState<S, C, D>, headers: &HeaderMap, query: &WebhookQuery) -> bool
where
    S: Store + 'static,
    C: SourceCrm + 'static,
    D: Directory + 'static,
{
    let header_secret = headers
        .get("X-Webhook-Secret")
        .or_else(|| headers.get("X-Debug-Secret"))
        .and_then(|v| v.to_str().ok());
    if let Some(secret) = header_secret {
        if state.webhook_secret_matches(secret) {
            return true;
        }
    }
    if let Some(token) = query.token.as_deref() {
        if state.webhook_secret_matches(token) {
            return true;
        }
    }
    false
}

fn unauthorised_response() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "detail": "Unauthorized",
            "accepted": ["X-Webhook-Secret", "X-Debug-Secret", "?token"],
        })),
    )
        .into_response()
}

pub async fn ingest<S, C, D>(
    State(state): State<Arc<AppState<S, C, D>>>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response
where
    S: Store + 'static,
    C: SourceCrm + 'static,
    D: Directory + 'static,
{
    if !authorised(&state, &headers, &query) {
        return unauthorised_response();
    }

    let ids = extract_contact_ids(&body);
    if ids.is_empty() {
        return Json(json!({ "queued": [], "warning": "no_contact_ids_parsed" })).into_response();
    }

    for id in &ids {
        if let Err(err) = state.store.enqueue(*id).await {
            tracing::error!(error = %err, source_contact_id = id, "webhook.enqueue_failed");
        }
    }
    state.record_webhook_event(ids.clone()).await;
    state.worker.wake();
    info!(count = ids.len(), "webhook.ingested");

    Json(json!({ "queued": ids })).into_response()
}

/// `^contacts\[(add|update)\]\[\d+\]\[id\]$`, compiled once.
fn form_key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^contacts\[(add|update)\]\[\d+\]\[id\]$").unwrap())
}

fn extract_contact_ids(body: &[u8]) -> Vec<i64> {
    let mut ids = BTreeSet::new();

    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        collect_from_json(&value, &mut ids);
    }

    if ids.is_empty() && !body.is_empty() {
        for (key, value) in url::form_urlencoded::parse(body) {
            if form_key_pattern().is_match(&key) {
                if let Ok(id) = value.trim().parse::<i64>() {
                    ids.insert(id);
                }
            }
        }
    }

    ids.into_iter().collect()
}

fn push_id(value: &Value, ids: &mut BTreeSet<i64>) {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if i > 0 {
                    ids.insert(i);
                }
            }
        }
        Value::String(s) => {
            if let Ok(i) = s.trim().parse::<i64>() {
                if i > 0 {
                    ids.insert(i);
                }
            }
        }
        _ => {}
    }
}

fn collect_from_json(value: &Value, ids: &mut BTreeSet<i64>) {
    if let Some(id) = value.get("contact_id") {
        push_id(id, ids);
    }
    if let Some(list) = value.get("contact_ids").and_then(Value::as_array) {
        for entry in list {
            push_id(entry, ids);
        }
    }
    if let Some(contacts) = value.get("contacts") {
        for key in ["add", "update"] {
            if let Some(list) = contacts.get(key).and_then(Value::as_array) {
                for entry in list {
                    if let Some(id) = entry.get("id") {
                        push_id(id, ids);
                    } else {
                        push_id(entry, ids);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_flat_contact_id() {
        let body = br#"{"contact_id": 42}"#;
        assert_eq!(extract_contact_ids(body), vec![42]);
    }

    #[test]
    fn extracts_contact_ids_list() {
        let body = br#"{"contact_ids": [1, "2", 3]}"#;
        assert_eq!(extract_contact_ids(body), vec![1, 2, 3]);
    }

    #[test]
    fn extracts_nested_contacts_add_update() {
        let body = br#"{"contacts": {"add": [{"id": 5}], "update": [{"id": 6}]}}"#;
        assert_eq!(extract_contact_ids(body), vec![5, 6]);
    }

    #[test]
    fn falls_back_to_form_encoding() {
        let body = b"contacts[add][0][id]=7&contacts[update][0][id]=8&other=ignored";
        assert_eq!(extract_contact_ids(body), vec![7, 8]);
    }

    #[test]
    fn dedupes_ids() {
        let body = br#"{"contact_ids": [1, 1, 1]}"#;
        assert_eq!(extract_contact_ids(body), vec![1]);
    }

    #[test]
    fn empty_body_yields_no_ids() {
        assert!(extract_contact_ids(b"").is_empty());
    }
}
