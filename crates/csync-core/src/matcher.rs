//! Candidate discovery and primary selection.
//!
//! [`DirectoryLookup`] is the seam between this pure matching logic and the
//! rate-limited HTTP client in `csync-directory`: the matcher only needs
//! three read operations plus two best-effort capability flags, so it is
//! expressed as a trait rather than depending on the concrete client crate.

use crate::error::{Result, SyncError};
use crate::types::{MatchCandidate, MatchKeys};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashSet;

/// Read-only view of the directory the matcher needs. Implemented by
/// `csync-directory`'s `DirectoryClient`.
#[async_trait]
pub trait DirectoryLookup: Send + Sync {
    async fn search_contacts(
        &self,
        query: &str,
        read_mask: &str,
        sources: Option<&[&str]>,
    ) -> Result<Vec<serde_json::Value>>;

    async fn search_other_contacts(
        &self,
        query: &str,
        read_mask: &str,
    ) -> Result<Vec<serde_json::Value>>;

    async fn get_contact(&self, resource_name: &str, fields: &str) -> Result<serde_json::Value>;

    /// Whether the `sources` search parameter has been observed to work.
    /// Defaults to `true`; a concrete client flips this permanently to
    /// `false` the first time the parameter is rejected.
    fn sources_supported(&self) -> bool {
        true
    }

    /// Whether `otherContacts.search` has been observed to work.
    fn other_contacts_supported(&self) -> bool {
        true
    }

    fn mark_sources_unsupported(&self) {}
    fn mark_other_contacts_unsupported(&self) {}

    /// Request/retry/rate-limit counters for introspection endpoints
    /// (`/sync/contacts/dry-run`'s `debug.counters`). Defaults to all-zero;
    /// a concrete client overrides this with its real atomic counters.
    fn metrics_snapshot(&self) -> DirectoryMetricsSnapshot {
        DirectoryMetricsSnapshot::default()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DirectoryMetricsSnapshot {
    pub requests: u64,
    pub retries: u64,
    pub rate_limited: u64,
    pub circuit_rejections: u64,
}

/// Additional context `choose_primary` needs beyond the candidate list.
#[derive(Debug, Clone, Default)]
pub struct MatchContext {
    pub source_contact_id: Option<i64>,
    pub group_resource_name: Option<String>,
    pub mapped_resource_name: Option<String>,
}

const READ_MASK: &str = "names,emailAddresses,phoneNumbers,metadata";
const PERSON_FIELDS: &str = "names,phoneNumbers,emailAddresses,memberships,biographies,externalIds,metadata";
const EXTERNAL_ID_TYPES: [&str; 2] = ["amo_id", "AMOCRM"];

/// Build a [`MatchCandidate`] from a raw directory person record, keeping
/// only the phones/emails that intersect `keys`. Returns `None` when the
/// record has no `resourceName` (malformed or deleted).
pub fn build_candidate(person: &serde_json::Value, keys: &MatchKeys) -> Option<MatchCandidate> {
    let resource_name = person.get("resourceName")?.as_str()?.to_string();

    let phone_set: HashSet<&str> = keys.phones.iter().map(String::as_str).collect();
    let email_set: HashSet<&str> = keys.emails.iter().map(String::as_str).collect();

    let matched_phones = person
        .get("phoneNumbers")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .filter_map(|p| p.get("value").and_then(|v| v.as_str()))
        .filter_map(crate::normalize::normalise_phone)
        .filter(|p| phone_set.contains(p.as_str()))
        .collect::<HashSet<_>>()
        .into_iter()
        .collect::<Vec<_>>();

    let matched_emails = person
        .get("emailAddresses")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .filter_map(|e| e.get("value").and_then(|v| v.as_str()))
        .map(crate::normalize::normalise_email)
        .filter(|e| email_set.contains(e.as_str()))
        .collect::<HashSet<_>>()
        .into_iter()
        .collect::<Vec<_>>();

    let group_membership = person
        .get("memberships")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .filter_map(|m| m.get("contactGroupMembership"))
        .filter_map(|d| d.get("contactGroupResourceName"))
        .filter_map(|v| v.as_str())
        .map(str::to_string)
        .collect();

    let has_external_id = person
        .get("externalIds")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .any(|entry| {
            entry
                .get("type")
                .and_then(|t| t.as_str())
                .is_some_and(|t| EXTERNAL_ID_TYPES.contains(&t))
        });

    let etag = person
        .get("etag")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let update_time = most_recent_update_time(person);

    Some(MatchCandidate {
        resource_name,
        person: person.clone(),
        etag,
        matched_phones,
        matched_emails,
        update_time,
        group_membership,
        has_external_id,
    })
}

fn most_recent_update_time(person: &serde_json::Value) -> DateTime<Utc> {
    person
        .get("metadata")
        .and_then(|m| m.get("sources"))
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .filter_map(|s| s.get("updateTime"))
        .filter_map(|v| v.as_str())
        .filter_map(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .max()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().unwrap())
}

/// `true` iff `candidate.has_external_id` and the tagged value matches
/// `source_contact_id` (or any tagged entry exists, when `source_contact_id`
/// is `None`). This is checked separately from [`build_candidate`] because
/// it needs the specific id being matched, not just presence.
fn external_id_matches(person: &serde_json::Value, source_contact_id: Option<i64>) -> bool {
    let entries = match person.get("externalIds").and_then(|v| v.as_array()) {
        Some(e) => e,
        None => return false,
    };
    match source_contact_id {
        Some(id) => {
            let target = id.to_string();
            entries.iter().any(|entry| {
                entry
                    .get("type")
                    .and_then(|t| t.as_str())
                    .is_some_and(|t| EXTERNAL_ID_TYPES.contains(&t))
                    && entry.get("value").and_then(|v| v.as_str()) == Some(target.as_str())
            })
        }
        None => entries.iter().any(|entry| {
            entry
                .get("type")
                .and_then(|t| t.as_str())
                .is_some_and(|t| EXTERNAL_ID_TYPES.contains(&t))
                && entry.get("value").and_then(|v| v.as_str()).is_some()
        }),
    }
}

/// Query the directory for every phone/email in `keys` and assemble the
/// discovered candidates. Queries are deduplicated by resource name.
pub async fn discover_candidates(
    directory: &dyn DirectoryLookup,
    keys: &MatchKeys,
) -> Result<Vec<MatchCandidate>> {
    if keys.is_empty() {
        return Ok(Vec::new());
    }

    let mut resource_names: HashSet<String> = HashSet::new();
    let mut seen_queries: HashSet<String> = HashSet::new();

    let mut queries: Vec<String> = Vec::new();
    for phone in &keys.phones {
        queries.push(phone.clone());
        if let Some(stripped) = phone.strip_prefix('+') {
            if !stripped.is_empty() {
                queries.push(stripped.to_string());
            }
        }
    }
    queries.extend(keys.emails.iter().cloned());

    for query in queries {
        if query.is_empty() || !seen_queries.insert(query.clone()) {
            continue;
        }
        collect_one(directory, &query, &mut resource_names).await?;
    }

    let mut candidates = Vec::with_capacity(resource_names.len());
    for resource_name in resource_names {
        let person = match directory.get_contact(&resource_name, PERSON_FIELDS).await {
            Ok(person) => person,
            Err(_) => continue,
        };
        if let Some(candidate) = build_candidate(&person, keys) {
            candidates.push(candidate);
        }
    }
    Ok(candidates)
}

async fn collect_one(
    directory: &dyn DirectoryLookup,
    query: &str,
    out: &mut HashSet<String>,
) -> Result<()> {
    let mut used_sources_param = false;

    if directory.sources_supported() {
        match directory
            .search_contacts(query, READ_MASK, Some(&["CONTACT", "OTHER_CONTACT"]))
            .await
        {
            Ok(results) => {
                register(&results, out);
                used_sources_param = true;
            }
            Err(_) => directory.mark_sources_unsupported(),
        }
    }

    if !used_sources_param {
        let results = directory.search_contacts(query, READ_MASK, None).await?;
        register(&results, out);

        if directory.other_contacts_supported() {
            match directory.search_other_contacts(query, READ_MASK).await {
                Ok(results) => register(&results, out),
                Err(_) => directory.mark_other_contacts_unsupported(),
            }
        }
    }

    Ok(())
}

fn register(persons: &[serde_json::Value], out: &mut HashSet<String>) {
    for person in persons {
        if let Some(name) = person.get("resourceName").and_then(|v| v.as_str()) {
            out.insert(name.to_string());
        }
    }
}

/// Select the primary candidate from the discovered set, applying the
/// filter chain in order and recording which filters narrowed the set (the
/// final string is "|"-joined, e.g. `"exact_phone|external_id|recent"`).
pub fn choose_primary<'a>(
    candidates: &'a [MatchCandidate],
    keys: &MatchKeys,
    context: &MatchContext,
) -> Option<(&'a MatchCandidate, String)> {
    if candidates.is_empty() {
        return None;
    }

    let mut ordered: Vec<&MatchCandidate> = candidates.iter().collect();
    let mut reason_parts = Vec::new();

    let phone_set: HashSet<&str> = keys.phones.iter().map(String::as_str).collect();
    let exact: Vec<&MatchCandidate> = ordered
        .iter()
        .copied()
        .filter(|c| c.matched_phones.iter().any(|p| phone_set.contains(p.as_str())))
        .collect();
    if !exact.is_empty() {
        ordered = exact;
        reason_parts.push("exact_phone");
    }

    let external_id_matches: Vec<&MatchCandidate> = ordered
        .iter()
        .copied()
        .filter(|c| external_id_matches(&c.person, context.source_contact_id))
        .collect();
    if !external_id_matches.is_empty() {
        ordered = external_id_matches;
        reason_parts.push("external_id");
    }

    if let Some(group) = &context.group_resource_name {
        let in_group: Vec<&MatchCandidate> =
            ordered.iter().copied().filter(|c| c.in_group(group)).collect();
        if !in_group.is_empty() {
            ordered = in_group;
            reason_parts.push("group");
        }
    }

    if let Some(mapped) = &context.mapped_resource_name {
        let mapped_match: Vec<&MatchCandidate> = ordered
            .iter()
            .copied()
            .filter(|c| &c.resource_name == mapped)
            .collect();
        if !mapped_match.is_empty() {
            ordered = mapped_match;
            reason_parts.push("mapping");
        }
    }

    let selected = ordered.into_iter().max_by_key(|c| c.update_time)?;
    reason_parts.push("recent");

    Some((selected, reason_parts.join("|")))
}

pub fn validate_match_keys(keys: &MatchKeys) -> Result<()> {
    if keys.is_empty() {
        return Err(SyncError::InvalidInput("no_valid_keys".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn candidate(resource: &str, update_time_secs: i64) -> MatchCandidate {
        MatchCandidate {
            resource_name: resource.to_string(),
            person: json!({}),
            etag: Some("E1".into()),
            matched_phones: vec![],
            matched_emails: vec![],
            update_time: Utc.timestamp_opt(update_time_secs, 0).single().unwrap(),
            group_membership: vec![],
            has_external_id: false,
        }
    }

    #[test]
    fn choose_primary_empty_returns_none() {
        assert!(choose_primary(&[], &MatchKeys::default(), &MatchContext::default()).is_none());
    }

    #[test]
    fn choose_primary_falls_back_to_recency() {
        let candidates = vec![candidate("people/1", 100), candidate("people/2", 200)];
        let (selected, reason) =
            choose_primary(&candidates, &MatchKeys::default(), &MatchContext::default()).unwrap();
        assert_eq!(selected.resource_name, "people/2");
        assert_eq!(reason, "recent");
    }

    #[test]
    fn choose_primary_prefers_exact_phone_match() {
        let mut older_exact = candidate("people/old", 10);
        older_exact.matched_phones = vec!["+12345678901".into()];
        let newer_no_match = candidate("people/new", 999);

        let candidates = vec![newer_no_match, older_exact];
        let keys = MatchKeys {
            phones: vec!["+12345678901".into()],
            emails: vec![],
        };
        let (selected, reason) = choose_primary(&candidates, &keys, &MatchContext::default()).unwrap();
        assert_eq!(selected.resource_name, "people/old");
        assert_eq!(reason, "exact_phone|recent");
    }

    #[test]
    fn choose_primary_idempotent_under_duplicate_candidate() {
        let candidates = vec![candidate("people/1", 100), candidate("people/1", 100)];
        let once = choose_primary(&candidates[..1], &MatchKeys::default(), &MatchContext::default());
        let twice = choose_primary(&candidates, &MatchKeys::default(), &MatchContext::default());
        assert_eq!(once.unwrap().0.resource_name, twice.unwrap().0.resource_name);
    }

    #[test]
    fn build_candidate_requires_resource_name() {
        let person = json!({"names": []});
        assert!(build_candidate(&person, &MatchKeys::default()).is_none());
    }

    #[test]
    fn build_candidate_matches_either_external_id_convention() {
        let amo_id_person = json!({
            "resourceName": "people/1",
            "externalIds": [{"type": "amo_id", "value": "5"}]
        });
        let amocrm_person = json!({
            "resourceName": "people/2",
            "externalIds": [{"type": "AMOCRM", "value": "5"}]
        });
        assert!(build_candidate(&amo_id_person, &MatchKeys::default()).unwrap().has_external_id);
        assert!(build_candidate(&amocrm_person, &MatchKeys::default()).unwrap().has_external_id);
    }

    #[test]
    fn validate_match_keys_rejects_empty() {
        assert!(validate_match_keys(&MatchKeys::default()).is_err());
        assert!(validate_match_keys(&MatchKeys {
            phones: vec!["+12345678901".into()],
            emails: vec![],
        })
        .is_ok());
    }
}
