//! Source-CRM client: fetches a contact's current state and extracts the
//! normalised fields the sync engine needs (spec §4.4).
//!
//! Credential storage/refresh is an out-of-scope external collaborator
//! (spec §1); this crate only needs a present-or-absent access token, which
//! [`CrmCredentials`] abstracts so the concrete source can be an env-backed
//! long-lived token, a static API key, or — in the real deployment — a
//! database-backed `Token` row the auth collaborator keeps fresh.

use async_trait::async_trait;
use csync_core::error::{Result, SyncError};
use csync_core::normalize::{normalise_email, normalise_phone, parse_display_name};
use csync_core::ports::SourceCrm;
use csync_core::types::CrmContact;
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

/// Supplies the bearer credential the CRM client authenticates requests
/// with. `None` signals `auth_missing` (spec §4.4, §7).
pub trait CrmCredentials: Send + Sync {
    fn access_token(&self) -> Option<String>;
}

/// Reads a single env var as the access token, matching
/// `csync_core::config::SourceCrmAuthMode`'s `llt`/`api_key` split.
pub struct EnvCredentials {
    var_name: &'static str,
}

impl EnvCredentials {
    pub fn llt() -> Self {
        Self { var_name: "SOURCE_CRM_LONG_LIVED_TOKEN" }
    }

    pub fn api_key() -> Self {
        Self { var_name: "SOURCE_CRM_API_KEY" }
    }
}

impl CrmCredentials for EnvCredentials {
    fn access_token(&self) -> Option<String> {
        std::env::var(self.var_name).ok().filter(|v| !v.trim().is_empty())
    }
}

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SourceCrmClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Box<dyn CrmCredentials>,
}

impl SourceCrmClient {
    pub fn new(base_url: impl Into<String>, credentials: Box<dyn CrmCredentials>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            credentials,
        }
    }

    async fn get_contact_raw(&self, contact_id: i64) -> Result<Value> {
        let token = self.credentials.access_token().ok_or(SyncError::AuthMissing)?;
        let url = format!(
            "{}/api/v4/contacts/{}",
            self.base_url.trim_end_matches('/'),
            contact_id
        );
        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| SyncError::Transport { status: 0, body: e.to_string() })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(SyncError::Unauthorised);
        }
        let body = response
            .text()
            .await
            .map_err(|e| SyncError::Transport { status: status.as_u16(), body: e.to_string() })?;
        if !status.is_success() {
            return Err(SyncError::Transport { status: status.as_u16(), body });
        }
        serde_json::from_str(&body)
            .map_err(|e| SyncError::Transport { status: status.as_u16(), body: format!("invalid JSON: {e}") })
    }
}

#[async_trait]
impl SourceCrm for SourceCrmClient {
    async fn fetch_contact(&self, source_contact_id: i64) -> Result<CrmContact> {
        let raw = self.get_contact_raw(source_contact_id).await?;
        Ok(extract_fields(source_contact_id, &raw))
    }
}

/// Extract `{name, phones[], emails[]}` from a raw CRM contact payload.
///
/// Tolerant of null/missing fields: malformed `custom_fields_values` entries
/// are skipped rather than failing the whole extraction. When `name` is
/// absent, it is derived from `first_name + " " + last_name` with nulls
/// skipped.
pub fn extract_fields(source_contact_id: i64, raw: &Value) -> CrmContact {
    let mut phones = Vec::new();
    let mut emails = Vec::new();

    for field in raw
        .get("custom_fields_values")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let Some(code) = field.get("field_code").and_then(Value::as_str) else {
            continue;
        };
        let values = field
            .get("values")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|v| v.get("value").and_then(Value::as_str));

        match code {
            "PHONE" => phones.extend(values.filter_map(|v| {
                let normalised = normalise_phone(v);
                if normalised.is_none() {
                    warn!(raw = v, "dropping unnormalisable phone from CRM contact");
                }
                normalised
            })),
            "EMAIL" => emails.extend(values.map(normalise_email)),
            _ => {}
        }
    }

    let display_name = raw
        .get("name")
        .and_then(Value::as_str)
        .filter(|n| !n.trim().is_empty())
        .map(str::to_string)
        .or_else(|| {
            let first = raw.get("first_name").and_then(Value::as_str);
            let last = raw.get("last_name").and_then(Value::as_str);
            match (first, last) {
                (None, None) => None,
                _ => {
                    let joined = [first, last].into_iter().flatten().collect::<Vec<_>>().join(" ");
                    let trimmed = joined.trim();
                    if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
                }
            }
        });

    let (given_name, family_name) = match &display_name {
        Some(name) => {
            let (_, given, family) = parse_display_name(name);
            (Some(given), family)
        }
        None => (None, None),
    };

    CrmContact {
        source_id: source_contact_id,
        display_name,
        given_name,
        family_name,
        phones: csync_core::normalize::unique(phones),
        emails: csync_core::normalize::unique(emails),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{bearer_token, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct StaticCredentials(Option<&'static str>);
    impl CrmCredentials for StaticCredentials {
        fn access_token(&self) -> Option<String> {
            self.0.map(str::to_string)
        }
    }

    #[test]
    fn extract_fields_filters_by_field_code() {
        let raw = json!({
            "name": "Alice Carter",
            "custom_fields_values": [
                {"field_code": "PHONE", "values": [{"value": "8 999 111 22 33"}]},
                {"field_code": "EMAIL", "values": [{"value": " Alice@Example.COM "}]},
                {"field_code": "POSITION", "values": [{"value": "Manager"}]},
            ]
        });
        let contact = extract_fields(1, &raw);
        assert_eq!(contact.display_name.as_deref(), Some("Alice Carter"));
        assert_eq!(contact.phones, vec!["+79991112233".to_string()]);
        assert_eq!(contact.emails, vec!["alice@example.com".to_string()]);
    }

    #[test]
    fn extract_fields_derives_name_from_first_last_when_absent() {
        let raw = json!({"first_name": "Bob", "last_name": "Stone", "custom_fields_values": []});
        let contact = extract_fields(2, &raw);
        assert_eq!(contact.display_name.as_deref(), Some("Bob Stone"));
        assert_eq!(contact.given_name.as_deref(), Some("Bob"));
        assert_eq!(contact.family_name.as_deref(), Some("Stone"));
    }

    #[test]
    fn extract_fields_tolerates_missing_fields() {
        let raw = json!({});
        let contact = extract_fields(3, &raw);
        assert!(contact.display_name.is_none());
        assert!(contact.phones.is_empty());
        assert!(contact.emails.is_empty());
    }

    #[test]
    fn extract_fields_drops_unnormalisable_phones() {
        let raw = json!({
            "custom_fields_values": [
                {"field_code": "PHONE", "values": [{"value": "abc"}, {"value": "+1 (234) 567-8901"}]},
            ]
        });
        let contact = extract_fields(4, &raw);
        assert_eq!(contact.phones, vec!["+12345678901".to_string()]);
    }

    #[tokio::test]
    async fn fetch_contact_returns_auth_missing_without_credentials() {
        let client = SourceCrmClient::new("http://example.invalid", Box::new(StaticCredentials(None)));
        let err = client.fetch_contact(1).await.unwrap_err();
        assert!(matches!(err, SyncError::AuthMissing));
    }

    #[tokio::test]
    async fn fetch_contact_sends_bearer_token_and_parses_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/contacts/42"))
            .and(bearer_token("secret-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 42,
                "name": "Carol Diaz",
                "custom_fields_values": [
                    {"field_code": "PHONE", "values": [{"value": "+12345678901"}]},
                ],
            })))
            .mount(&server)
            .await;

        let client = SourceCrmClient::new(server.uri(), Box::new(StaticCredentials(Some("secret-token"))));
        let contact = client.fetch_contact(42).await.unwrap();
        assert_eq!(contact.source_id, 42);
        assert_eq!(contact.display_name.as_deref(), Some("Carol Diaz"));
        assert_eq!(contact.phones, vec!["+12345678901".to_string()]);
    }

    #[tokio::test]
    async fn fetch_contact_maps_401_to_unauthorised() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/contacts/7"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = SourceCrmClient::new(server.uri(), Box::new(StaticCredentials(Some("tok"))));
        let err = client.fetch_contact(7).await.unwrap_err();
        assert!(matches!(err, SyncError::Unauthorised));
    }

    #[tokio::test]
    async fn fetch_contact_maps_other_statuses_to_transport() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/contacts/8"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = SourceCrmClient::new(server.uri(), Box::new(StaticCredentials(Some("tok"))));
        let err = client.fetch_contact(8).await.unwrap_err();
        match err {
            SyncError::Transport { status, .. } => assert_eq!(status, 500),
            other => panic!("expected Transport, got {other:?}"),
        }
    }
}
