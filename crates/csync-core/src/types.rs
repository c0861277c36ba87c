use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

/// Stable mapping between a source CRM contact and a directory resource.
///
/// Never deleted. On merge, links that pointed at a deleted duplicate are
/// remapped to the surviving primary (invariant I3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub source_contact_id: String,
    pub directory_resource_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// PendingSync
// ---------------------------------------------------------------------------

/// A queue row. At most one exists per `source_contact_id` (invariant I1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSync {
    pub source_contact_id: i64,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Dead-lettered rows are scheduled this far into the future.
pub const DEAD_LETTER_HORIZON_DAYS: i64 = 3650;

/// Maximum stored length of `pending_sync.last_error`.
pub const LAST_ERROR_MAX_LEN: usize = 255;

pub fn truncate_error(text: &str) -> String {
    if text.chars().count() <= LAST_ERROR_MAX_LEN {
        text.to_string()
    } else {
        text.chars().take(LAST_ERROR_MAX_LEN).collect()
    }
}

// ---------------------------------------------------------------------------
// Token
// ---------------------------------------------------------------------------

/// Opaque credential set for an external system. The core only reads it; the
/// lifecycle (refresh, revocation) is owned by the system it authenticates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub system: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expiry: Option<DateTime<Utc>>,
    pub scopes: Option<String>,
    pub account_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// MatchKeys
// ---------------------------------------------------------------------------

/// Normalised phones and emails used to locate a directory record.
///
/// Empty keys cause the engine to skip with reason `no_valid_keys`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchKeys {
    pub phones: Vec<String>,
    pub emails: Vec<String>,
}

impl MatchKeys {
    pub fn is_empty(&self) -> bool {
        self.phones.is_empty() && self.emails.is_empty()
    }
}

// ---------------------------------------------------------------------------
// MatchCandidate
// ---------------------------------------------------------------------------

/// A directory person record annotated with match context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub resource_name: String,
    pub person: serde_json::Value,
    pub etag: Option<String>,
    pub matched_phones: Vec<String>,
    pub matched_emails: Vec<String>,
    pub update_time: DateTime<Utc>,
    pub group_membership: Vec<String>,
    pub has_external_id: bool,
}

impl MatchCandidate {
    pub fn in_group(&self, group_resource: &str) -> bool {
        self.group_membership.iter().any(|m| m == group_resource)
    }
}

// ---------------------------------------------------------------------------
// SyncPlan / SyncResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    Create,
    Update,
    Merge,
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncPlan {
    pub action: PlanAction,
    pub reason: String,
    pub primary: Option<MatchCandidate>,
    pub duplicates: Vec<MatchCandidate>,
    pub contact: CrmContact,
    pub group_resource: Option<String>,
    pub preflight_blocked_create: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Created,
    Updated,
    Merged,
    Skipped,
    SkippedInvalidPhone,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    pub action: SyncOutcome,
    pub resource_name: Option<String>,
    pub merged_into: Option<String>,
    pub deleted: Vec<String>,
}

// ---------------------------------------------------------------------------
// CrmContact — normalised shape extracted from the source CRM
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrmContact {
    pub source_id: i64,
    pub display_name: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub phones: Vec<String>,
    pub emails: Vec<String>,
}

impl CrmContact {
    pub fn match_keys(&self) -> MatchKeys {
        MatchKeys {
            phones: self.phones.clone(),
            emails: self.emails.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_error_leaves_short_strings_alone() {
        assert_eq!(truncate_error("google_rate_limit"), "google_rate_limit");
    }

    #[test]
    fn truncate_error_caps_at_255_chars() {
        let long = "x".repeat(300);
        assert_eq!(truncate_error(&long).len(), LAST_ERROR_MAX_LEN);
    }

    #[test]
    fn match_keys_empty_when_no_phones_or_emails() {
        assert!(MatchKeys::default().is_empty());
        assert!(!MatchKeys {
            phones: vec!["+12345678901".into()],
            emails: vec![],
        }
        .is_empty());
    }
}
