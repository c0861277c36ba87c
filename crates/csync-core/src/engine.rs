//! Plan/apply sync engine: decides create/update/merge/skip for a CRM
//! contact and executes the decision against the directory (spec §4.7).

use crate::error::{Result, SyncError};
use crate::matcher::{choose_primary, discover_candidates, DirectoryLookup, MatchContext};
use crate::merger::merge_candidates;
use crate::normalize::unique;
use crate::ports::{DirectoryWriter, Store};
use crate::types::{CrmContact, MatchCandidate, MatchKeys, PlanAction, SyncOutcome, SyncPlan, SyncResult};
use serde_json::{json, Value};

const MAX_APPLY_ATTEMPTS: u32 = 3;
const EXTERNAL_ID_TYPE: &str = "amo_id";

pub struct SyncEngine<'a> {
    pub directory_lookup: &'a dyn DirectoryLookup,
    pub directory_writer: &'a dyn DirectoryWriter,
    pub store: &'a dyn Store,
    pub group_name: Option<&'a str>,
    pub auto_merge_duplicates: bool,
}

impl<'a> SyncEngine<'a> {
    pub fn new(
        directory_lookup: &'a dyn DirectoryLookup,
        directory_writer: &'a dyn DirectoryWriter,
        store: &'a dyn Store,
        group_name: Option<&'a str>,
        auto_merge_duplicates: bool,
    ) -> Self {
        Self {
            directory_lookup,
            directory_writer,
            store,
            group_name,
            auto_merge_duplicates,
        }
    }

    /// Build a [`SyncPlan`] for `contact` by discovering candidates and
    /// deciding between create / update / merge / skip.
    pub async fn plan(&self, contact: &CrmContact) -> Result<SyncPlan> {
        let keys = contact.match_keys();
        if keys.is_empty() {
            return Ok(SyncPlan {
                action: PlanAction::Skip,
                reason: "no_valid_keys".into(),
                primary: None,
                duplicates: Vec::new(),
                contact: contact.clone(),
                group_resource: None,
                preflight_blocked_create: false,
            });
        }

        let mapped_resource = self
            .store
            .get_link(&contact.source_id.to_string())
            .await?
            .map(|link| link.directory_resource_name);

        let group_resource = match self.group_name {
            Some(name) => self.directory_writer.ensure_group(name).await?,
            None => None,
        };

        let candidates = discover_candidates(self.directory_lookup, &keys).await?;

        let context = MatchContext {
            source_contact_id: Some(contact.source_id),
            group_resource_name: group_resource.clone(),
            mapped_resource_name: mapped_resource,
        };
        let primary_selection = choose_primary(&candidates, &keys, &context);

        let (action, reason, primary, duplicates, preflight_blocked_create) = match primary_selection {
            None if candidates.is_empty() => {
                (PlanAction::Create, "no_candidates".to_string(), None, Vec::new(), false)
            }
            None => (PlanAction::Create, "no_primary".to_string(), None, Vec::new(), true),
            Some((primary, reason)) => {
                let duplicates: Vec<MatchCandidate> = candidates
                    .iter()
                    .filter(|c| c.resource_name != primary.resource_name)
                    .cloned()
                    .collect();
                if !duplicates.is_empty() && self.auto_merge_duplicates {
                    (PlanAction::Merge, reason, Some(primary.clone()), duplicates, false)
                } else {
                    (PlanAction::Update, reason, Some(primary.clone()), Vec::new(), false)
                }
            }
        };

        Ok(SyncPlan {
            action,
            reason,
            primary,
            duplicates,
            contact: contact.clone(),
            group_resource,
            preflight_blocked_create,
        })
    }

    /// Execute `plan`, re-planning on [`SyncError::Recoverable`] up to
    /// [`MAX_APPLY_ATTEMPTS`] times before propagating.
    pub async fn apply(&self, plan: SyncPlan) -> Result<SyncResult> {
        let mut current = plan;
        for attempt in 0..MAX_APPLY_ATTEMPTS {
            match self.apply_once(&current).await {
                Ok(result) => {
                    self.persist_link(&current.contact, &result).await?;
                    return Ok(result);
                }
                Err(err) if err.is_recoverable() && attempt + 1 < MAX_APPLY_ATTEMPTS => {
                    current = self.plan(&current.contact).await?;
                }
                Err(err) => return Err(err),
            }
        }
        Err(SyncError::recoverable("apply_attempts_exhausted"))
    }

    async fn persist_link(&self, contact: &CrmContact, result: &SyncResult) -> Result<()> {
        if let Some(resource_name) = &result.resource_name {
            self.store
                .save_link(&contact.source_id.to_string(), resource_name)
                .await?;
        }
        Ok(())
    }

    async fn apply_once(&self, plan: &SyncPlan) -> Result<SyncResult> {
        match plan.action {
            PlanAction::Skip => Ok(SyncResult {
                action: SyncOutcome::Skipped,
                resource_name: None,
                merged_into: None,
                deleted: Vec::new(),
            }),
            PlanAction::Create => self.apply_create(plan).await,
            PlanAction::Update => self.apply_update(plan).await,
            PlanAction::Merge => self.apply_merge(plan).await,
        }
    }

    async fn apply_create(&self, plan: &SyncPlan) -> Result<SyncResult> {
        let contact = &plan.contact;
        let body = build_create_body(contact, plan.group_resource.as_deref());
        let created = self.directory_writer.create_contact(body).await?;
        let resource_name = created
            .get("resourceName")
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::recoverable("missing_primary"))?
            .to_string();

        // Post-create race check: another process may have created a
        // duplicate concurrently. Re-run discovery including the new record.
        let keys = contact.match_keys();
        let candidates = discover_candidates(self.directory_lookup, &keys).await?;
        if candidates.len() < 2 {
            return Ok(SyncResult {
                action: SyncOutcome::Created,
                resource_name: Some(resource_name),
                merged_into: None,
                deleted: Vec::new(),
            });
        }

        let preferred = candidates
            .iter()
            .find(|c| c.resource_name != resource_name && c.has_external_id)
            .or_else(|| candidates.iter().find(|c| c.resource_name == resource_name))
            .cloned()
            .ok_or_else(|| SyncError::recoverable("missing_primary"))?;

        let duplicates: Vec<MatchCandidate> = candidates
            .into_iter()
            .filter(|c| c.resource_name != preferred.resource_name)
            .collect();

        let merged = merge_candidates(
            self.directory_writer,
            self.store,
            &preferred,
            &duplicates,
            plan.group_resource.as_deref(),
        )
        .await?;
        let merged_resource = merged
            .get("resourceName")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(preferred.resource_name.clone());

        Ok(SyncResult {
            action: SyncOutcome::Merged,
            resource_name: Some(merged_resource.clone()),
            merged_into: Some(merged_resource),
            deleted: duplicates.into_iter().map(|c| c.resource_name).collect(),
        })
    }

    async fn apply_update(&self, plan: &SyncPlan) -> Result<SyncResult> {
        let primary = plan
            .primary
            .as_ref()
            .ok_or_else(|| SyncError::recoverable("missing_primary"))?;
        let contact = &plan.contact;

        let current_name = primary
            .person
            .get("names")
            .and_then(Value::as_array)
            .and_then(|n| n.first())
            .and_then(|n| n.get("displayName"))
            .and_then(Value::as_str)
            .unwrap_or("");
        let need_name = contact
            .display_name
            .as_deref()
            .map(str::trim)
            .is_some_and(|d| !d.is_empty() && d != current_name);
        let existing_phones: std::collections::HashSet<String> =
            primary.matched_phones.iter().cloned().collect();
        let need_phones = contact.phones.iter().any(|p| !existing_phones.contains(p));
        let existing_emails: std::collections::HashSet<String> =
            primary.matched_emails.iter().cloned().collect();
        let need_emails = contact.emails.iter().any(|e| !existing_emails.contains(e));
        let need_group = match &plan.group_resource {
            Some(group) => !primary.in_group(group),
            None => false,
        };

        if !need_name && !need_phones && !need_emails && !need_group {
            let mut components = Vec::new();
            return Ok(SyncResult {
                action: SyncOutcome::Updated,
                resource_name: Some(primary.resource_name.clone()),
                merged_into: None,
                deleted: std::mem::take(&mut components),
            });
        }

        let etag = primary
            .etag
            .as_deref()
            .ok_or_else(|| SyncError::recoverable("missing_etag"))?;

        let payload = build_update_body(primary, contact, plan.group_resource.as_deref());
        let update_mask = "names,phoneNumbers,emailAddresses,memberships,externalIds";

        let updated = self
            .directory_writer
            .update_contact(&primary.resource_name, payload, update_mask, etag)
            .await;

        let updated = match updated {
            Ok(v) => v,
            Err(SyncError::Transport { status, .. }) if matches!(status, 404 | 410 | 412) => {
                return Err(SyncError::recoverable(format!("update_failed:{status}")));
            }
            Err(e) => return Err(e),
        };

        let resource_name = updated
            .get("resourceName")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(primary.resource_name.clone());

        Ok(SyncResult {
            action: SyncOutcome::Updated,
            resource_name: Some(resource_name),
            merged_into: None,
            deleted: Vec::new(),
        })
    }

    async fn apply_merge(&self, plan: &SyncPlan) -> Result<SyncResult> {
        let primary = plan
            .primary
            .as_ref()
            .ok_or_else(|| SyncError::recoverable("missing_primary"))?;

        let merged = merge_candidates(
            self.directory_writer,
            self.store,
            primary,
            &plan.duplicates,
            plan.group_resource.as_deref(),
        )
        .await?;

        let resource_name = merged
            .get("resourceName")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(primary.resource_name.clone());

        Ok(SyncResult {
            action: SyncOutcome::Merged,
            resource_name: Some(resource_name.clone()),
            merged_into: Some(resource_name),
            deleted: plan
                .duplicates
                .iter()
                .map(|c| c.resource_name.clone())
                .collect(),
        })
    }

    /// Manual merge entry point: discover candidates for `keys`, select a
    /// primary, and merge the rest into it.
    pub async fn merge_candidates(
        &self,
        keys: &MatchKeys,
        source_contact_id: Option<i64>,
        mapped_resource_name: Option<String>,
    ) -> Result<SyncResult> {
        let candidates = discover_candidates(self.directory_lookup, keys).await?;
        let context = MatchContext {
            source_contact_id,
            group_resource_name: None,
            mapped_resource_name,
        };
        let (primary, _) = choose_primary(&candidates, keys, &context)
            .ok_or_else(|| SyncError::recoverable("missing_primary"))?;
        let primary = primary.clone();
        let duplicates: Vec<MatchCandidate> = candidates
            .into_iter()
            .filter(|c| c.resource_name != primary.resource_name)
            .collect();

        let merged = merge_candidates(self.directory_writer, self.store, &primary, &duplicates, None).await?;
        let resource_name = merged
            .get("resourceName")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(primary.resource_name.clone());

        Ok(SyncResult {
            action: SyncOutcome::Merged,
            resource_name: Some(resource_name.clone()),
            merged_into: Some(resource_name),
            deleted: duplicates.into_iter().map(|c| c.resource_name).collect(),
        })
    }
}

fn build_create_body(contact: &CrmContact, group_resource: Option<&str>) -> Value {
    let mut phones: Vec<String> = unique(contact.phones.clone());
    phones.sort();
    let mut emails: Vec<String> = unique(contact.emails.clone());
    emails.sort();

    let mut body = json!({
        "phoneNumbers": phones.into_iter().map(|p| json!({"value": p})).collect::<Vec<_>>(),
        "emailAddresses": emails.into_iter().map(|e| json!({"value": e})).collect::<Vec<_>>(),
        "externalIds": [{"type": EXTERNAL_ID_TYPE, "value": contact.source_id.to_string()}],
    });

    if let Some(name) = &contact.display_name {
        body["names"] = json!([{ "displayName": name }]);
    }

    if let Some(group) = group_resource {
        body["memberships"] = json!([{
            "contactGroupMembership": { "contactGroupResourceName": group }
        }]);
    }

    body
}

fn build_update_body(primary: &MatchCandidate, contact: &CrmContact, group_resource: Option<&str>) -> Value {
    let existing_phones: std::collections::HashSet<&str> =
        primary.matched_phones.iter().map(String::as_str).collect();
    let mut phones: Vec<Value> = primary
        .person
        .get("phoneNumbers")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for phone in &contact.phones {
        if !existing_phones.contains(phone.as_str()) {
            phones.push(json!({ "value": phone }));
        }
    }

    let existing_emails: std::collections::HashSet<&str> =
        primary.matched_emails.iter().map(String::as_str).collect();
    let mut emails: Vec<Value> = primary
        .person
        .get("emailAddresses")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for email in &contact.emails {
        if !existing_emails.contains(email.as_str()) {
            emails.push(json!({ "value": email }));
        }
    }

    let mut memberships: Vec<Value> = primary
        .person
        .get("memberships")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if let Some(group) = group_resource {
        if !primary.in_group(group) {
            memberships.push(json!({
                "contactGroupMembership": { "contactGroupResourceName": group }
            }));
        }
    }

    let mut body = json!({
        "phoneNumbers": phones,
        "emailAddresses": emails,
        "memberships": memberships,
        "externalIds": [{"type": EXTERNAL_ID_TYPE, "value": contact.source_id.to_string()}],
        "clientData": [{"key": EXTERNAL_ID_TYPE, "value": contact.source_id.to_string()}],
    });

    if let Some(name) = &contact.display_name {
        body["names"] = json!([{ "displayName": name }]);
    }

    body
}
