//! Field union and the merge orchestration: update the chosen primary with
//! the union of every candidate's fields, delete the duplicates, and remap
//! stored links (spec component 6).

use crate::error::{Result, SyncError};
use crate::normalize::{normalise_email, normalise_phone};
use crate::ports::{DirectoryWriter, Store};
use crate::types::MatchCandidate;
use serde_json::{json, Value};
use std::collections::HashSet;

pub const UPDATE_PERSON_FIELDS: &str =
    "names,phoneNumbers,emailAddresses,memberships,biographies,externalIds";

fn dedup_phones(persons: &[&Value]) -> Vec<Value> {
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for person in persons {
        for phone in person
            .get("phoneNumbers")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let Some(value) = phone.get("value").and_then(Value::as_str) else {
                continue;
            };
            let Some(normalised) = normalise_phone(value) else {
                continue;
            };
            if !seen.insert(normalised.clone()) {
                continue;
            }
            let mut entry = json!({ "value": normalised });
            for key in ["type", "metadata", "formattedType"] {
                if let Some(v) = phone.get(key) {
                    entry[key] = v.clone();
                }
            }
            merged.push(entry);
        }
    }
    merged
}

fn dedup_emails(persons: &[&Value]) -> Vec<Value> {
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for person in persons {
        for email in person
            .get("emailAddresses")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let Some(value) = email.get("value").and_then(Value::as_str) else {
                continue;
            };
            if !seen.insert(normalise_email(value)) {
                continue;
            }
            let mut entry = json!({ "value": value });
            for key in ["type", "metadata"] {
                if let Some(v) = email.get(key) {
                    entry[key] = v.clone();
                }
            }
            merged.push(entry);
        }
    }
    merged
}

fn merge_memberships(persons: &[&Value], ensure_group: Option<&str>) -> Vec<Value> {
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for person in persons {
        for membership in person
            .get("memberships")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let Some(group_name) = membership
                .get("contactGroupMembership")
                .and_then(|d| d.get("contactGroupResourceName"))
                .and_then(Value::as_str)
            else {
                continue;
            };
            if !seen.insert(group_name.to_string()) {
                continue;
            }
            merged.push(membership.clone());
        }
    }
    if let Some(group) = ensure_group {
        if !seen.contains(group) {
            merged.push(json!({
                "contactGroupMembership": { "contactGroupResourceName": group }
            }));
        }
    }
    merged
}

fn merge_biographies(primary: &Value, others: &[&Value]) -> Vec<Value> {
    let mut seen_texts = HashSet::new();
    let mut merged = Vec::new();

    for entry in primary
        .get("biographies")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let Some(value) = entry.get("value").and_then(Value::as_str) else {
            continue;
        };
        if !seen_texts.insert(value.to_string()) {
            continue;
        }
        merged.push(entry.clone());
    }

    for person in others {
        let first_note = person
            .get("biographies")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .find_map(|e| e.get("value").and_then(Value::as_str));
        let Some(value) = first_note else { continue };
        if !seen_texts.insert(value.to_string()) {
            continue;
        }
        let resource_name = person
            .get("resourceName")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        merged.push(json!({ "value": format!("[Merged from {resource_name}]\n{value}") }));
    }

    merged
}

/// Union the fields of `primary` and `others` into a single payload, adding
/// fields only (never removing anything primary already has). Law L1:
/// `union_fields(p, [])` equals `p` modulo `memberships` possibly gaining the
/// ensure-group entry.
pub fn union_fields(primary: &Value, others: &[&Value], ensure_group: Option<&str>) -> Value {
    let mut all = vec![primary];
    all.extend(others);

    let mut merged = json!({});

    let phones = dedup_phones(&all);
    if !phones.is_empty() {
        merged["phoneNumbers"] = Value::Array(phones);
    }

    let emails = dedup_emails(&all);
    if !emails.is_empty() {
        merged["emailAddresses"] = Value::Array(emails);
    }

    let memberships = merge_memberships(&all, ensure_group);
    if !memberships.is_empty() {
        merged["memberships"] = Value::Array(memberships);
    }

    let biographies = merge_biographies(primary, others);
    if !biographies.is_empty() {
        merged["biographies"] = Value::Array(biographies);
    }

    if let Some(names) = primary.get("names") {
        if !names.is_null() {
            merged["names"] = names.clone();
        }
    }

    merged
}

/// Dedupe `externalIds` by `(type, value)` across every person, preserving
/// first occurrence.
pub fn merge_external_ids(persons: &[&Value]) -> Vec<Value> {
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for person in persons {
        for entry in person
            .get("externalIds")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let id_type = entry.get("type").and_then(Value::as_str);
            let value = entry.get("value").and_then(Value::as_str);
            let key = (id_type.map(str::to_string), value.map(str::to_string));
            if !seen.insert(key) {
                continue;
            }
            let mut out = json!({});
            if let Some(t) = id_type {
                out["type"] = json!(t);
            }
            if let Some(v) = value {
                out["value"] = json!(v);
            }
            if let Some(m) = entry.get("metadata") {
                out["metadata"] = m.clone();
            }
            merged.push(out);
        }
    }
    merged
}

/// Run the full merge procedure (spec §4.6): union fields, update the
/// primary under its etag, delete the duplicates, and remap stored links.
/// Returns the updated primary person payload.
pub async fn merge_candidates(
    directory: &dyn DirectoryWriter,
    store: &dyn Store,
    primary: &MatchCandidate,
    duplicates: &[MatchCandidate],
    group_resource: Option<&str>,
) -> Result<Value> {
    if duplicates.is_empty() {
        return Ok(primary.person.clone());
    }

    let etag = primary
        .etag
        .as_deref()
        .ok_or_else(|| SyncError::recoverable("missing_etag"))?;

    let duplicate_persons: Vec<&Value> = duplicates.iter().map(|c| &c.person).collect();
    let mut payload = union_fields(&primary.person, &duplicate_persons, group_resource);

    let mut all_persons = vec![&primary.person];
    all_persons.extend(duplicate_persons);
    let external_ids = merge_external_ids(&all_persons);
    if !external_ids.is_empty() {
        payload["externalIds"] = Value::Array(external_ids);
    }

    let updated = directory
        .update_contact(&primary.resource_name, payload, UPDATE_PERSON_FIELDS, etag)
        .await?;

    let duplicate_names: Vec<String> = duplicates.iter().map(|c| c.resource_name.clone()).collect();
    directory.batch_delete(&duplicate_names).await?;
    store.remap_links(&primary.resource_name, &duplicate_names).await?;

    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn union_fields_of_primary_alone_is_unchanged_modulo_memberships() {
        let primary = json!({
            "names": [{"displayName": "Alice"}],
            "phoneNumbers": [{"value": "+12345678901"}],
        });
        let merged = union_fields(&primary, &[], None);
        assert_eq!(merged["names"], primary["names"]);
        assert_eq!(merged["phoneNumbers"], primary["phoneNumbers"]);
        assert!(merged.get("memberships").is_none());
    }

    #[test]
    fn union_fields_dedupes_phones_across_persons() {
        let primary = json!({"phoneNumbers": [{"value": "+1 (234) 567-8901"}]});
        let dup = json!({"phoneNumbers": [{"value": "12345678901"}, {"value": "+19998887777"}]});
        let merged = union_fields(&primary, &[&dup], None);
        let phones = merged["phoneNumbers"].as_array().unwrap();
        assert_eq!(phones.len(), 2);
    }

    #[test]
    fn union_fields_prefixes_merged_biography() {
        let primary = json!({});
        let dup = json!({"resourceName": "people/2", "biographies": [{"value": "note"}]});
        let merged = union_fields(&primary, &[&dup], None);
        let bios = merged["biographies"].as_array().unwrap();
        assert_eq!(bios[0]["value"], "[Merged from people/2]\nnote");
    }

    #[test]
    fn union_fields_adds_ensure_group_when_absent() {
        let primary = json!({});
        let merged = union_fields(&primary, &[], Some("contactGroups/g1"));
        let memberships = merged["memberships"].as_array().unwrap();
        assert_eq!(
            memberships[0]["contactGroupMembership"]["contactGroupResourceName"],
            "contactGroups/g1"
        );
    }

    #[test]
    fn merge_external_ids_dedupes_by_type_and_value() {
        let primary = json!({"externalIds": [{"type": "amo_id", "value": "5"}]});
        let dup = json!({"externalIds": [{"type": "amo_id", "value": "5"}, {"type": "AMOCRM", "value": "5"}]});
        let merged = merge_external_ids(&[&primary, &dup]);
        assert_eq!(merged.len(), 2);
    }
}
