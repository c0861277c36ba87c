//! Rate-limited, circuit-breaker-protected HTTP client for the contacts
//! directory API. Implements the `DirectoryLookup`/`DirectoryWriter` ports
//! `csync-core` depends on.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
use crate::rate_limiter::RateLimiter;
use async_trait::async_trait;
use csync_core::error::{Result, SyncError};
use csync_core::matcher::DirectoryLookup;
use csync_core::ports::DirectoryWriter;
use dashmap::DashMap;
use reqwest::{Client as HttpClient, Method, StatusCode};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

const SENTINEL_GROUP_KEY: &str = "amo_google_sync_group";

/// Whether `group` is the one `ensure_group` is looking for: skips
/// tombstoned groups, and matches on `name`, `formattedName`, or the
/// sentinel `clientData` entry this service writes when it creates a group.
fn group_matches(group: &Value, name: &str) -> bool {
    if group.get("metadata").and_then(|m| m.get("deleted")).and_then(Value::as_bool).unwrap_or(false) {
        return false;
    }
    let group_name = group.get("name").and_then(Value::as_str);
    let formatted_name = group.get("formattedName").and_then(Value::as_str);
    if group_name == Some(name) || formatted_name == Some(name) {
        return true;
    }
    group
        .get("clientData")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .any(|entry| {
            entry.get("key").and_then(Value::as_str) == Some(SENTINEL_GROUP_KEY)
                && entry.get("value").and_then(Value::as_str) == Some(name)
        })
}

#[derive(Debug, Default, Clone)]
pub struct DirectoryMetrics {
    pub requests: Arc<std::sync::atomic::AtomicU64>,
    pub retries: Arc<std::sync::atomic::AtomicU64>,
    pub rate_limited: Arc<std::sync::atomic::AtomicU64>,
    pub circuit_rejections: Arc<std::sync::atomic::AtomicU64>,
}

/// A directory API client. One instance is shared (behind `Arc`) across the
/// webhook ingestor and the worker; the capability flags and group cache are
/// therefore process-lifetime state, matching the original's module-level
/// `nonlocal` flags.
pub struct DirectoryClient {
    http: HttpClient,
    base_url: String,
    rate_limiter: RateLimiter,
    circuit_breaker: CircuitBreaker,
    metrics: DirectoryMetrics,
    sources_supported: AtomicBool,
    other_contacts_supported: AtomicBool,
    group_cache: DashMap<String, String>,
    group_lock: AsyncMutex<()>,
}

impl DirectoryClient {
    pub fn new(base_url: impl Into<String>, http: HttpClient, requests_per_minute: usize) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            rate_limiter: RateLimiter::per_minute(requests_per_minute),
            circuit_breaker: CircuitBreaker::new(CircuitBreakerConfig::default()),
            metrics: DirectoryMetrics::default(),
            sources_supported: AtomicBool::new(true),
            other_contacts_supported: AtomicBool::new(true),
            group_cache: DashMap::new(),
            group_lock: AsyncMutex::new(()),
        }
    }

    pub fn metrics(&self) -> &DirectoryMetrics {
        &self.metrics
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    const MAX_RETRY_AFTER_CAP_SECS: u64 = 60;
    const MAX_RATE_LIMIT_ATTEMPTS: u32 = 5;

    async fn call(&self, method: Method, path: &str, query: &[(&str, &str)], body: Option<Value>) -> Result<Value> {
        let mut attempt: u32 = 0;
        loop {
            self.rate_limiter.acquire().await;
            self.metrics.requests.fetch_add(1, Ordering::Relaxed);

            let url = self.url(path);
            let http = self.http.clone();
            let method_clone = method.clone();
            let query_vec = query.to_vec();
            let body_clone = body.clone();

            let outcome = self
                .circuit_breaker
                .call(|| async move {
                    let mut request = http.request(method_clone, &url).query(&query_vec);
                    if let Some(body) = body_clone {
                        request = request.json(&body);
                    }
                    request.send().await.map_err(|e| e.to_string())
                })
                .await;

            let response = match outcome {
                Ok(response) => response,
                Err(CircuitBreakerError::Open) => {
                    self.metrics.circuit_rejections.fetch_add(1, Ordering::Relaxed);
                    return Err(SyncError::Transport {
                        status: 503,
                        body: "directory circuit breaker open".into(),
                    });
                }
                Err(CircuitBreakerError::Timeout(_)) => {
                    return Err(SyncError::Transport {
                        status: 504,
                        body: "directory call timed out".into(),
                    });
                }
                Err(CircuitBreakerError::Inner(message)) => {
                    return Err(SyncError::Transport { status: 0, body: message });
                }
            };

            let status = response.status();
            let server_retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());

            if status == StatusCode::UNAUTHORIZED {
                return Err(SyncError::Unauthorised);
            }

            let body_text = response.text().await.map_err(|e| SyncError::Transport {
                status: status.as_u16(),
                body: e.to_string(),
            })?;

            let resource_exhausted =
                status == StatusCode::FORBIDDEN && body_text.contains("RESOURCE_EXHAUSTED");

            if status == StatusCode::TOO_MANY_REQUESTS || resource_exhausted {
                self.metrics.rate_limited.fetch_add(1, Ordering::Relaxed);

                attempt += 1;
                if attempt >= Self::MAX_RATE_LIMIT_ATTEMPTS {
                    return Err(SyncError::RateLimited {
                        retry_after_seconds: server_retry_after.unwrap_or(30),
                    });
                }

                let backoff = server_retry_after.unwrap_or(1u64 << attempt);
                let jitter_millis = (attempt as u64 * 137) % 1000;
                let wait = Duration::from_secs(backoff.min(Self::MAX_RETRY_AFTER_CAP_SECS))
                    + Duration::from_millis(jitter_millis);
                self.metrics.retries.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(wait).await;
                continue;
            }

            if !status.is_success() {
                return Err(SyncError::Transport {
                    status: status.as_u16(),
                    body: body_text,
                });
            }

            if body_text.is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&body_text).map_err(|e| SyncError::Transport {
                status: status.as_u16(),
                body: format!("invalid JSON response: {e}"),
            });
        }
    }

    async fn list_groups(&self) -> Result<Vec<Value>> {
        let mut groups = Vec::new();
        let mut page_token = String::new();
        loop {
            let mut query = vec![("pageSize", "100"), ("groupFields", "name,clientData,metadata")];
            if !page_token.is_empty() {
                query.push(("pageToken", page_token.as_str()));
            }
            let page = self.call(Method::GET, "contactGroups", &query, None).await?;
            groups.extend(
                page.get("contactGroups")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
            );
            match page.get("nextPageToken").and_then(Value::as_str) {
                Some(token) if !token.is_empty() => page_token = token.to_string(),
                _ => break,
            }
        }
        Ok(groups)
    }
}

#[async_trait]
impl DirectoryLookup for DirectoryClient {
    async fn search_contacts(
        &self,
        query: &str,
        read_mask: &str,
        sources: Option<&[&str]>,
    ) -> Result<Vec<Value>> {
        let sources_csv;
        let mut params = vec![("query", query), ("readMask", read_mask)];
        if let Some(sources) = sources {
            sources_csv = sources.join(",");
            params.push(("sources", sources_csv.as_str()));
        }
        let response = self.call(Method::GET, "contacts:search", &params, None).await?;
        Ok(response
            .get("results")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|r| r.get("person"))
            .cloned()
            .collect())
    }

    async fn search_other_contacts(&self, query: &str, read_mask: &str) -> Result<Vec<Value>> {
        let params = [("query", query), ("readMask", read_mask)];
        let response = self.call(Method::GET, "otherContacts:search", &params, None).await?;
        Ok(response
            .get("results")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|r| r.get("person"))
            .cloned()
            .collect())
    }

    async fn get_contact(&self, resource_name: &str, fields: &str) -> Result<Value> {
        self.call(Method::GET, resource_name, &[("personFields", fields)], None)
            .await
    }

    fn sources_supported(&self) -> bool {
        self.sources_supported.load(Ordering::Relaxed)
    }

    fn other_contacts_supported(&self) -> bool {
        self.other_contacts_supported.load(Ordering::Relaxed)
    }

    fn mark_sources_unsupported(&self) {
        warn!("directory rejected the `sources` search parameter, disabling it for this process");
        self.sources_supported.store(false, Ordering::Relaxed);
    }

    fn mark_other_contacts_unsupported(&self) {
        warn!("directory rejected otherContacts.search, disabling it for this process");
        self.other_contacts_supported.store(false, Ordering::Relaxed);
    }

    fn metrics_snapshot(&self) -> csync_core::matcher::DirectoryMetricsSnapshot {
        csync_core::matcher::DirectoryMetricsSnapshot {
            requests: self.metrics.requests.load(Ordering::Relaxed),
            retries: self.metrics.retries.load(Ordering::Relaxed),
            rate_limited: self.metrics.rate_limited.load(Ordering::Relaxed),
            circuit_rejections: self.metrics.circuit_rejections.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl DirectoryWriter for DirectoryClient {
    async fn create_contact(&self, body: Value) -> Result<Value> {
        self.call(Method::POST, "people:createContact", &[], Some(body)).await
    }

    async fn update_contact(
        &self,
        resource_name: &str,
        body: Value,
        update_mask: &str,
        etag: &str,
    ) -> Result<Value> {
        let mut payload = body;
        payload["etag"] = Value::String(etag.to_string());
        let path = format!("{resource_name}:updateContact");
        self.call(Method::PATCH, &path, &[("updatePersonFields", update_mask)], Some(payload))
            .await
    }

    async fn batch_delete(&self, resource_names: &[String]) -> Result<()> {
        if resource_names.is_empty() {
            return Ok(());
        }
        let body = serde_json::json!({ "resourceNames": resource_names });
        self.call(Method::POST, "people:batchDeleteContacts", &[], Some(body))
            .await?;
        Ok(())
    }

    async fn ensure_group(&self, name: &str) -> Result<Option<String>> {
        if let Some(cached) = self.group_cache.get(name) {
            return Ok(Some(cached.clone()));
        }

        let _guard = self.group_lock.lock().await;
        if let Some(cached) = self.group_cache.get(name) {
            return Ok(Some(cached.clone()));
        }

        for group in self.list_groups().await? {
            if group_matches(&group, name) {
                if let Some(resource_name) = group.get("resourceName").and_then(Value::as_str) {
                    self.group_cache.insert(name.to_string(), resource_name.to_string());
                    return Ok(Some(resource_name.to_string()));
                }
            }
        }

        let body = serde_json::json!({
            "contactGroup": {
                "name": name,
                "clientData": [{ "key": SENTINEL_GROUP_KEY, "value": name }],
            }
        });
        let created = self.call(Method::POST, "contactGroups", &[], Some(body)).await?;
        let resource_name = created
            .get("resourceName")
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::recoverable("group_create_missing_resource_name"))?
            .to_string();
        info!(group = name, resource_name, "created contact group");
        self.group_cache.insert(name.to_string(), resource_name.clone());
        Ok(Some(resource_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn group_matches_skips_deleted_groups() {
        let group = serde_json::json!({
            "resourceName": "contactGroups/dead",
            "name": "sales",
            "metadata": {"deleted": true},
        });
        assert!(!group_matches(&group, "sales"));
    }

    #[test]
    fn group_matches_on_formatted_name() {
        let group = serde_json::json!({
            "resourceName": "contactGroups/g1",
            "formattedName": "sales",
        });
        assert!(group_matches(&group, "sales"));
    }

    #[test]
    fn group_matches_on_sentinel_client_data() {
        let group = serde_json::json!({
            "resourceName": "contactGroups/g1",
            "name": "My Contacts label",
            "clientData": [{"key": SENTINEL_GROUP_KEY, "value": "sales"}],
        });
        assert!(group_matches(&group, "sales"));
    }

    #[tokio::test]
    async fn ensure_group_skips_a_tombstoned_group_and_creates_a_fresh_one() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/contactGroups"))
            .and(query_param("groupFields", "name,clientData,metadata"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "contactGroups": [
                    {"resourceName": "contactGroups/dead", "name": "sales", "metadata": {"deleted": true}},
                ],
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/contactGroups"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "resourceName": "contactGroups/fresh",
            })))
            .mount(&server)
            .await;

        let client = DirectoryClient::new(server.uri(), HttpClient::new(), 60);
        let resource = client.ensure_group("sales").await.unwrap();
        assert_eq!(resource.as_deref(), Some("contactGroups/fresh"));
    }

    #[tokio::test]
    async fn ensure_group_finds_an_existing_group_by_sentinel_client_data() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/contactGroups"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "contactGroups": [
                    {
                        "resourceName": "contactGroups/g1",
                        "name": "My Contacts label",
                        "clientData": [{"key": SENTINEL_GROUP_KEY, "value": "sales"}],
                    },
                ],
            })))
            .mount(&server)
            .await;

        let client = DirectoryClient::new(server.uri(), HttpClient::new(), 60);
        let resource = client.ensure_group("sales").await.unwrap();
        assert_eq!(resource.as_deref(), Some("contactGroups/g1"));
    }
}
