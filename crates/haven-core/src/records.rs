//! Domain records for the escape workflow.
//!
//! Two record families live here: [`EscapeRequest`], the long-lived
//! request a victim submits and reviewers advance, and [`AuditEntry`],
//! the append-only trail every destructive action leaves behind. Both
//! serialize to flat store documents; audit entries carry an integrity
//! digest computed at build time so any later field mutation is
//! detectable.
//!
//! # Invariants
//!
//! - An [`AuditEntry`] is never updated after creation except to flip
//!   its seal metadata. The digest deliberately excludes those fields,
//!   so sealing and unsealing never invalidate verification.
//! - An [`EscapeRequest`] is never deleted. Status moves only forward:
//!   `pending` to `in-progress` to `resolved`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::digest;
use crate::store::{Collection, Document, FieldMap, StoreError};

// ============================================================================
// Escape actions
// ============================================================================

/// The remediation actions an escape request can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EscapeAction {
    /// Disable location sharing and redact location history.
    DisableLocation,
    /// Remove the monitoring parent's access to the target account.
    SeverParentAccess,
    /// Suppress family-visible notifications about the target.
    NotificationStealth,
}

impl EscapeAction {
    /// Every action, in the order handlers document them.
    pub const ALL: [Self; 3] = [
        Self::DisableLocation,
        Self::SeverParentAccess,
        Self::NotificationStealth,
    ];

    /// Stable wire name for this action.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DisableLocation => "disable-location",
            Self::SeverParentAccess => "sever-parent-access",
            Self::NotificationStealth => "notification-stealth",
        }
    }
}

impl fmt::Display for EscapeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EscapeAction {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disable-location" => Ok(Self::DisableLocation),
            "sever-parent-access" => Ok(Self::SeverParentAccess),
            "notification-stealth" => Ok(Self::NotificationStealth),
            _ => Err(UnknownName {
                kind: "escape action",
            }),
        }
    }
}

/// A string did not name a known enum member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} name")]
pub struct UnknownName {
    kind: &'static str,
}

// ============================================================================
// Request status and urgency
// ============================================================================

/// Lifecycle state of an escape request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum RequestStatus {
    /// Submitted, not yet reviewed. The verification gate rejects
    /// destructive actions in this state.
    #[default]
    Pending,
    /// Under review or partially executed.
    InProgress,
    /// All requested actions finished.
    Resolved,
}

impl RequestStatus {
    /// Stable wire name for this status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Resolved => "resolved",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in-progress" => Ok(Self::InProgress),
            "resolved" => Ok(Self::Resolved),
            _ => Err(UnknownName {
                kind: "request status",
            }),
        }
    }
}

/// Caller-declared urgency of a submission. Drives triage ordering
/// only; it never changes what the verification gate requires.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Urgency {
    /// No immediate risk reported.
    Low,
    /// Default when the caller does not say.
    #[default]
    Medium,
    /// Caller reports active pressure from the monitoring party.
    High,
    /// Caller reports imminent risk.
    Critical,
}

impl Urgency {
    /// Stable wire name for this urgency.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Urgency {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(UnknownName { kind: "urgency" }),
        }
    }
}

// ============================================================================
// Escape request
// ============================================================================

/// Reviewer-recorded verification steps. The gate requires at least one
/// of the two identity checks before any destructive action runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VerificationChecklist {
    /// Reviewer confirmed the caller controls the target account.
    #[serde(default)]
    pub account_ownership_verified: bool,
    /// Reviewer matched government or school identification.
    #[serde(default)]
    pub id_matched: bool,
}

impl VerificationChecklist {
    /// Whether the checklist satisfies the gate's any-of requirement.
    #[must_use]
    pub const fn identity_established(self) -> bool {
        self.account_ownership_verified || self.id_matched
    }
}

/// A victim's request to escape a monitoring relationship.
///
/// Retained forever for compliance. Action maps key on
/// [`EscapeAction`] wire names; a key absent from `completed_actions`
/// means that action has not been attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscapeRequest {
    /// Store document id.
    pub id: String,
    /// Lifecycle state.
    #[serde(default)]
    pub status: RequestStatus,
    /// Family a reviewer bound the request to. Absent until review.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_id: Option<String>,
    /// Identity checks recorded by reviewers.
    #[serde(default)]
    pub verification: VerificationChecklist,
    /// Actions asked for, keyed by wire name.
    #[serde(default)]
    pub requested_actions: BTreeMap<String, bool>,
    /// Actions finished so far, keyed by wire name.
    #[serde(default)]
    pub completed_actions: BTreeMap<String, bool>,
    /// Where the victim can safely be reached, if anywhere.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safe_contact_email: Option<String>,
    /// Caller-declared urgency.
    #[serde(default)]
    pub urgency: Urgency,
    /// The victim's free-text description. Never logged.
    pub message: String,
    /// Submission time.
    pub submitted_at: DateTime<Utc>,
}

impl EscapeRequest {
    /// Creates a fresh pending request with a random id.
    #[must_use]
    pub fn new(
        message: impl Into<String>,
        safe_contact_email: Option<String>,
        urgency: Urgency,
        requested_actions: impl IntoIterator<Item = EscapeAction>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            status: RequestStatus::Pending,
            family_id: None,
            verification: VerificationChecklist::default(),
            requested_actions: requested_actions
                .into_iter()
                .map(|a| (a.as_str().to_string(), true))
                .collect(),
            completed_actions: BTreeMap::new(),
            safe_contact_email,
            urgency,
            message: message.into(),
            submitted_at: Utc::now(),
        }
    }

    /// Serializes to a store document field map.
    #[must_use]
    pub fn to_fields(&self) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("id".to_string(), json!(self.id));
        fields.insert("status".to_string(), json!(self.status.as_str()));
        if let Some(family_id) = &self.family_id {
            fields.insert("family_id".to_string(), json!(family_id));
        }
        fields.insert(
            "verification".to_string(),
            json!({
                "account_ownership_verified": self.verification.account_ownership_verified,
                "id_matched": self.verification.id_matched,
            }),
        );
        fields.insert(
            "requested_actions".to_string(),
            json!(self.requested_actions),
        );
        fields.insert(
            "completed_actions".to_string(),
            json!(self.completed_actions),
        );
        if let Some(email) = &self.safe_contact_email {
            fields.insert("safe_contact_email".to_string(), json!(email));
        }
        fields.insert("urgency".to_string(), json!(self.urgency.as_str()));
        fields.insert("message".to_string(), json!(self.message));
        fields.insert(
            "submitted_at".to_string(),
            json!(self.submitted_at.to_rfc3339()),
        );
        fields
    }

    /// Parses a stored document back into a request.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Malformed`] when required fields are
    /// missing or of the wrong shape.
    pub fn from_document(doc: &Document) -> Result<Self, StoreError> {
        serde_json::from_value(Value::Object(doc.fields.clone())).map_err(|e| {
            StoreError::Malformed {
                collection: Collection::SafetyRequests,
                message: e.to_string(),
            }
        })
    }
}

// ============================================================================
// Audit entries
// ============================================================================

/// One tamper-evident entry in the audit trail.
///
/// The `integrity_hash` is computed at build time over every field
/// except itself and the seal lifecycle fields, with keys sorted at
/// every nesting level. Verifying an entry recomputes that digest from
/// the stored fields and compares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Store document id.
    pub id: String,
    /// Wire name of the action performed, e.g. `disable-location`.
    pub action: String,
    /// Kind of resource acted on, e.g. `safety_request`.
    pub resource_type: String,
    /// Id of the resource acted on.
    pub resource_id: String,
    /// Actor who performed the action.
    pub performed_by: String,
    /// Family the entry belongs to.
    pub family_id: String,
    /// When the action happened.
    pub timestamp: DateTime<Utc>,
    /// Whether the entry is hidden from family-visible queries.
    pub sealed: bool,
    /// When the entry was sealed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sealed_at: Option<DateTime<Utc>>,
    /// Actor who sealed it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sealed_by: Option<String>,
    /// Why it was sealed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seal_reason: Option<String>,
    /// Escape request the entry is tagged to, which is what seal
    /// propagation discovers it by.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_request_id: Option<String>,
    /// Action-specific summary fields, included in the digest.
    #[serde(default, skip_serializing_if = "FieldMap::is_empty")]
    pub detail: FieldMap,
    /// Canonical digest over the entry, excluding this field and the
    /// seal lifecycle fields.
    pub integrity_hash: String,
}

/// Builder for [`AuditEntry`]. Fills in the id, timestamp, and
/// integrity digest on [`finish`](AuditEntryBuilder::finish).
#[derive(Debug)]
pub struct AuditEntryBuilder {
    action: String,
    resource_type: String,
    resource_id: String,
    performed_by: String,
    family_id: String,
    safety_request_id: Option<String>,
    detail: FieldMap,
    seal: Option<(String, String)>,
}

impl AuditEntryBuilder {
    /// Starts a builder carrying the required identifying fields.
    #[must_use]
    pub fn new(
        action: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        performed_by: impl Into<String>,
        family_id: impl Into<String>,
    ) -> Self {
        Self {
            action: action.into(),
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            performed_by: performed_by.into(),
            family_id: family_id.into(),
            safety_request_id: None,
            detail: FieldMap::new(),
            seal: None,
        }
    }

    /// Tags the entry with the escape request it belongs to, which is
    /// what seal propagation later discovers it by.
    #[must_use]
    pub fn safety_request_id(mut self, id: impl Into<String>) -> Self {
        self.safety_request_id = Some(id.into());
        self
    }

    /// Adds one action-specific detail field.
    #[must_use]
    pub fn detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.detail.insert(key.into(), value);
        self
    }

    /// Marks the entry sealed from birth. Escape-action entries are
    /// written this way so they are never visible to family queries.
    #[must_use]
    pub fn sealed(mut self, sealed_by: impl Into<String>, seal_reason: impl Into<String>) -> Self {
        self.seal = Some((sealed_by.into(), seal_reason.into()));
        self
    }

    /// Finalizes the entry, computing its integrity digest.
    #[must_use]
    pub fn finish(self) -> AuditEntry {
        let now = Utc::now();
        let (sealed, sealed_at, sealed_by, seal_reason) = match self.seal {
            Some((by, reason)) => (true, Some(now), Some(by), Some(reason)),
            None => (false, None, None, None),
        };

        let mut entry = AuditEntry {
            id: Uuid::new_v4().to_string(),
            action: self.action,
            resource_type: self.resource_type,
            resource_id: self.resource_id,
            performed_by: self.performed_by,
            family_id: self.family_id,
            timestamp: now,
            sealed,
            sealed_at,
            sealed_by,
            seal_reason,
            safety_request_id: self.safety_request_id,
            detail: self.detail,
            integrity_hash: String::new(),
        };
        entry.integrity_hash = digest::digest_fields(&entry.to_fields());
        entry
    }
}

impl AuditEntry {
    /// Serializes to a store document field map.
    #[must_use]
    pub fn to_fields(&self) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("id".to_string(), json!(self.id));
        fields.insert("action".to_string(), json!(self.action));
        fields.insert("resource_type".to_string(), json!(self.resource_type));
        fields.insert("resource_id".to_string(), json!(self.resource_id));
        fields.insert("performed_by".to_string(), json!(self.performed_by));
        fields.insert("family_id".to_string(), json!(self.family_id));
        fields.insert(
            "timestamp".to_string(),
            json!(self.timestamp.to_rfc3339()),
        );
        fields.insert("sealed".to_string(), json!(self.sealed));
        if let Some(at) = &self.sealed_at {
            fields.insert("sealed_at".to_string(), json!(at.to_rfc3339()));
        }
        if let Some(by) = &self.sealed_by {
            fields.insert("sealed_by".to_string(), json!(by));
        }
        if let Some(reason) = &self.seal_reason {
            fields.insert("seal_reason".to_string(), json!(reason));
        }
        if let Some(id) = &self.safety_request_id {
            fields.insert("safety_request_id".to_string(), json!(id));
        }
        if !self.detail.is_empty() {
            fields.insert("detail".to_string(), Value::Object(self.detail.clone()));
        }
        if !self.integrity_hash.is_empty() {
            fields.insert("integrity_hash".to_string(), json!(self.integrity_hash));
        }
        fields
    }

    /// Parses a stored document back into an entry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Malformed`] when required fields are
    /// missing or of the wrong shape.
    pub fn from_document(doc: &Document) -> Result<Self, StoreError> {
        serde_json::from_value(Value::Object(doc.fields.clone())).map_err(|e| {
            StoreError::Malformed {
                collection: Collection::AuditLog,
                message: e.to_string(),
            }
        })
    }
}
