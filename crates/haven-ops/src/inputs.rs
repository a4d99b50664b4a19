//! Validated operation inputs.
//!
//! Every operation takes a typed input struct validated at the
//! boundary. Validation produces a [`Valid<T>`] witness; handlers only
//! accept the witness, so an unvalidated payload cannot reach a
//! mutation path by construction.
//!
//! Length minimums exist because these strings become the durable
//! justification trail for destructive, legally sensitive actions; a
//! reason of "cleanup" is not a record anyone can act on later.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use haven_core::records::{EscapeAction, Urgency};
use haven_core::seal::EntryRef;

use crate::error::OpError;

// ============================================================================
// Bounds
// ============================================================================

/// Minimum length for a destructive-action reason.
pub const MIN_REASON_LEN: usize = 20;

/// Minimum length for a compliance-read justification.
pub const MIN_JUSTIFICATION_LEN: usize = 20;

/// Minimum length for an unseal legal justification.
pub const MIN_LEGAL_JUSTIFICATION_LEN: usize = 50;

/// Maximum length accepted for any free-text field.
pub const MAX_TEXT_LEN: usize = 10_000;

/// Maximum target users in one location-disable call.
pub const MAX_TARGET_USERS: usize = 50;

/// Maximum explicit entry references in one seal or unseal call.
pub const MAX_ENTRY_REFS: usize = 5_000;

/// Maximum entries one compliance read may return.
pub const MAX_QUERY_LIMIT: usize = 500;

// ============================================================================
// Validation plumbing
// ============================================================================

/// Witness that an input passed boundary validation. The only way to
/// obtain one is [`Validate::validate`].
#[derive(Debug, Clone)]
pub struct Valid<T>(T);

impl<T> Valid<T> {
    /// Unwraps the validated input.
    #[must_use]
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> std::ops::Deref for Valid<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

/// Boundary validation for one operation's input.
pub trait Validate: Sized {
    /// # Errors
    ///
    /// [`OpError::InvalidArgument`] describing the violated rule,
    /// without echoing the submitted text.
    fn validate(self) -> Result<Valid<Self>, OpError>;
}

fn require_id(value: &str, name: &'static str) -> Result<(), OpError> {
    if value.trim().is_empty() {
        return Err(OpError::InvalidArgument(format!("{name} is required")));
    }
    if value.len() > 256 {
        return Err(OpError::InvalidArgument(format!("{name} is too long")));
    }
    Ok(())
}

fn require_text(
    value: &str,
    name: &'static str,
    min_chars: usize,
) -> Result<(), OpError> {
    let chars = value.trim().chars().count();
    if chars < min_chars {
        return Err(OpError::InvalidArgument(format!(
            "{name} must be at least {min_chars} characters"
        )));
    }
    if value.len() > MAX_TEXT_LEN {
        return Err(OpError::InvalidArgument(format!("{name} is too long")));
    }
    Ok(())
}

/// Minimal shape check; real deliverability is the mailer's problem.
fn require_email(value: &str) -> Result<(), OpError> {
    let valid = value.len() <= 320
        && value
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
    if valid {
        Ok(())
    } else {
        Err(OpError::InvalidArgument(
            "safe_contact_email is not a valid address".to_string(),
        ))
    }
}

// ============================================================================
// Per-operation inputs
// ============================================================================

/// Input for `submit_escape_request`. Anonymous callers allowed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitEscapeRequest {
    /// Free-text description of the situation. Never logged.
    pub message: String,
    /// Where the victim can safely be reached, if anywhere.
    #[serde(default)]
    pub safe_contact_email: Option<String>,
    /// Caller-declared urgency.
    #[serde(default)]
    pub urgency: Urgency,
    /// Remediation actions being asked for. May be empty; reviewers
    /// can fill it in later.
    #[serde(default)]
    pub requested_actions: Vec<EscapeAction>,
    /// Rate-limit key for the submission, typically the source IP.
    /// Hashed before storage, never persisted raw.
    pub caller_key: String,
}

impl Validate for SubmitEscapeRequest {
    fn validate(self) -> Result<Valid<Self>, OpError> {
        require_text(&self.message, "message", 1)?;
        if let Some(email) = &self.safe_contact_email {
            require_email(email)?;
        }
        require_id(&self.caller_key, "caller_key")?;
        Ok(Valid(self))
    }
}

/// Input for `review_escape_request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewEscapeRequest {
    /// Request under review.
    pub request_id: String,
    /// Family the reviewer has tied the request to. Set once; a
    /// conflicting later value is rejected.
    #[serde(default)]
    pub family_id: Option<String>,
    /// Outcome of the account-ownership check, when performed.
    #[serde(default)]
    pub account_ownership_verified: Option<bool>,
    /// Outcome of the identification match, when performed.
    #[serde(default)]
    pub id_matched: Option<bool>,
}

impl Validate for ReviewEscapeRequest {
    fn validate(self) -> Result<Valid<Self>, OpError> {
        require_id(&self.request_id, "request_id")?;
        if let Some(family_id) = &self.family_id {
            require_id(family_id, "family_id")?;
        }
        Ok(Valid(self))
    }
}

/// Input for `disable_location_features`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisableLocationFeatures {
    /// Reviewed escape request authorizing the action.
    pub request_id: String,
    /// Family the request is bound to.
    pub family_id: String,
    /// Users whose location features are disabled.
    pub target_user_ids: Vec<String>,
    /// Operator justification, recorded in the sealed audit entry.
    pub reason: String,
}

impl Validate for DisableLocationFeatures {
    fn validate(self) -> Result<Valid<Self>, OpError> {
        require_id(&self.request_id, "request_id")?;
        require_id(&self.family_id, "family_id")?;
        if self.target_user_ids.is_empty() {
            return Err(OpError::InvalidArgument(
                "target_user_ids must not be empty".to_string(),
            ));
        }
        if self.target_user_ids.len() > MAX_TARGET_USERS {
            return Err(OpError::InvalidArgument(format!(
                "target_user_ids is limited to {MAX_TARGET_USERS} users"
            )));
        }
        for id in &self.target_user_ids {
            require_id(id, "target_user_ids")?;
        }
        require_text(&self.reason, "reason", MIN_REASON_LEN)?;
        Ok(Valid(self))
    }
}

fn default_true() -> bool {
    true
}

/// Input for `sever_parent_access`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeverParentAccess {
    /// Reviewed escape request authorizing the action.
    pub request_id: String,
    /// User whose monitoring link is cut.
    pub target_user_id: String,
    /// Family the request is bound to.
    pub family_id: String,
    /// Operator justification, recorded in the sealed audit entry.
    pub reason: String,
    /// Whether to queue the resource-referral notification once the
    /// escape is complete. On by default.
    #[serde(default = "default_true")]
    pub trigger_resource_referral: bool,
}

impl Validate for SeverParentAccess {
    fn validate(self) -> Result<Valid<Self>, OpError> {
        require_id(&self.request_id, "request_id")?;
        require_id(&self.target_user_id, "target_user_id")?;
        require_id(&self.family_id, "family_id")?;
        require_text(&self.reason, "reason", MIN_REASON_LEN)?;
        Ok(Valid(self))
    }
}

/// Input for `enable_notification_stealth`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnableNotificationStealth {
    /// Reviewed escape request authorizing the action.
    pub request_id: String,
    /// Family the request is bound to.
    pub family_id: String,
    /// User whose notifications are suppressed.
    pub target_user_id: String,
    /// Operator justification, recorded in the sealed audit entry.
    pub reason: String,
}

impl Validate for EnableNotificationStealth {
    fn validate(self) -> Result<Valid<Self>, OpError> {
        require_id(&self.request_id, "request_id")?;
        require_id(&self.family_id, "family_id")?;
        require_id(&self.target_user_id, "target_user_id")?;
        require_text(&self.reason, "reason", MIN_REASON_LEN)?;
        Ok(Valid(self))
    }
}

/// Input for `seal_escape_audit_entries`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealEscapeAuditEntries {
    /// Escape request whose records are sealed.
    pub safety_request_id: String,
    /// Family the request is bound to; scopes the sweep.
    pub family_id: String,
    /// Operator justification for this sealing run.
    pub reason: String,
    /// Reason stamped on every sealed entry.
    pub seal_reason: String,
    /// Explicit entries to seal; absent means auto-discovery.
    #[serde(default)]
    pub entries: Option<Vec<EntryRef>>,
}

impl Validate for SealEscapeAuditEntries {
    fn validate(self) -> Result<Valid<Self>, OpError> {
        require_id(&self.safety_request_id, "safety_request_id")?;
        require_id(&self.family_id, "family_id")?;
        require_text(&self.reason, "reason", MIN_REASON_LEN)?;
        require_text(&self.seal_reason, "seal_reason", 1)?;
        if let Some(entries) = &self.entries {
            if entries.is_empty() {
                return Err(OpError::InvalidArgument(
                    "entries must not be empty when supplied".to_string(),
                ));
            }
            if entries.len() > MAX_ENTRY_REFS {
                return Err(OpError::InvalidArgument(format!(
                    "entries is limited to {MAX_ENTRY_REFS} references"
                )));
            }
            for entry in entries {
                require_id(&entry.id, "entries")?;
            }
        }
        Ok(Valid(self))
    }
}

/// Input for `unseal_audit_entries`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsealAuditEntries {
    /// Sealed entries to expose. Every one must exist and be sealed.
    pub entries: Vec<EntryRef>,
    /// The compelling court order.
    pub court_order_reference: String,
    /// Why this unseal is lawful.
    pub legal_justification: String,
    /// Court case number, when distinct from the order reference.
    #[serde(default)]
    pub case_number: Option<String>,
    /// Who asked for the records.
    #[serde(default)]
    pub requesting_party: Option<String>,
}

impl Validate for UnsealAuditEntries {
    fn validate(self) -> Result<Valid<Self>, OpError> {
        if self.entries.is_empty() {
            return Err(OpError::InvalidArgument(
                "entries must not be empty".to_string(),
            ));
        }
        if self.entries.len() > MAX_ENTRY_REFS {
            return Err(OpError::InvalidArgument(format!(
                "entries is limited to {MAX_ENTRY_REFS} references"
            )));
        }
        for entry in &self.entries {
            require_id(&entry.id, "entries")?;
        }
        require_id(&self.court_order_reference, "court_order_reference")?;
        require_text(
            &self.legal_justification,
            "legal_justification",
            MIN_LEGAL_JUSTIFICATION_LEN,
        )?;
        Ok(Valid(self))
    }
}

/// Closed date range on entry timestamps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DateRange {
    /// Earliest timestamp included.
    pub start: DateTime<Utc>,
    /// Latest timestamp included.
    pub end: DateTime<Utc>,
}

/// Input for `get_sealed_audit_entries`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSealedAuditEntries {
    /// Family whose sealed entries are read.
    pub family_id: String,
    /// Restrict to entries timestamped within this range.
    #[serde(default)]
    pub date_range: Option<DateRange>,
    /// Restrict to these action names, e.g. `disable-location`.
    #[serde(default)]
    pub action_types: Option<Vec<String>>,
    /// Cap on returned entries, newest kept.
    #[serde(default)]
    pub limit: Option<usize>,
    /// Why this sealed material is being read. Recorded in the access
    /// log entry.
    pub justification: String,
}

impl Validate for GetSealedAuditEntries {
    fn validate(self) -> Result<Valid<Self>, OpError> {
        require_id(&self.family_id, "family_id")?;
        require_text(&self.justification, "justification", MIN_JUSTIFICATION_LEN)?;
        if let Some(range) = &self.date_range {
            if range.start > range.end {
                return Err(OpError::InvalidArgument(
                    "date_range start must not be after end".to_string(),
                ));
            }
        }
        if let Some(limit) = self.limit {
            if limit == 0 || limit > MAX_QUERY_LIMIT {
                return Err(OpError::InvalidArgument(format!(
                    "limit must be between 1 and {MAX_QUERY_LIMIT}"
                )));
            }
        }
        Ok(Valid(self))
    }
}

/// Input for `get_family_audit_feed`, the ordinary family-visible
/// surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetFamilyAuditFeed {
    /// Family whose feed is read; the caller must belong to it.
    pub family_id: String,
    /// Cap on returned entries, newest kept.
    #[serde(default)]
    pub limit: Option<usize>,
}

impl Validate for GetFamilyAuditFeed {
    fn validate(self) -> Result<Valid<Self>, OpError> {
        require_id(&self.family_id, "family_id")?;
        if let Some(limit) = self.limit {
            if limit == 0 || limit > MAX_QUERY_LIMIT {
                return Err(OpError::InvalidArgument(format!(
                    "limit must be between 1 and {MAX_QUERY_LIMIT}"
                )));
            }
        }
        Ok(Valid(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disable_input(reason: &str) -> DisableLocationFeatures {
        DisableLocationFeatures {
            request_id: "req-1".to_string(),
            family_id: "fam-1".to_string(),
            target_user_ids: vec!["user-1".to_string()],
            reason: reason.to_string(),
        }
    }

    #[test]
    fn reason_minimum_is_exactly_twenty_chars() {
        let nineteen = "a".repeat(19);
        let twenty = "a".repeat(20);

        let err = disable_input(&nineteen).validate().unwrap_err();
        assert!(matches!(err, OpError::InvalidArgument(_)));
        assert!(disable_input(&twenty).validate().is_ok());
    }

    #[test]
    fn surrounding_whitespace_does_not_satisfy_the_minimum() {
        let padded = format!("   {}   ", "a".repeat(19));
        assert!(disable_input(&padded).validate().is_err());
    }

    #[test]
    fn empty_target_list_is_rejected() {
        let mut input = disable_input(&"a".repeat(20));
        input.target_user_ids.clear();
        assert!(input.validate().is_err());
    }

    #[test]
    fn oversized_target_list_is_rejected() {
        let mut input = disable_input(&"a".repeat(20));
        input.target_user_ids = (0..=MAX_TARGET_USERS).map(|i| format!("u{i}")).collect();
        assert!(input.validate().is_err());
    }

    #[test]
    fn legal_justification_minimum_is_fifty_chars() {
        let base = UnsealAuditEntries {
            entries: vec![EntryRef::new(
                haven_core::store::Collection::AuditLog,
                "e-1",
            )],
            court_order_reference: "order-1".to_string(),
            legal_justification: "x".repeat(49),
            case_number: None,
            requesting_party: None,
        };
        assert!(base.clone().validate().is_err());

        let ok = UnsealAuditEntries {
            legal_justification: "x".repeat(50),
            ..base
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn unseal_requires_court_order_reference() {
        let input = UnsealAuditEntries {
            entries: vec![EntryRef::new(
                haven_core::store::Collection::AuditLog,
                "e-1",
            )],
            court_order_reference: "   ".to_string(),
            legal_justification: "x".repeat(60),
            case_number: None,
            requesting_party: None,
        };
        assert!(input.validate().is_err());
    }

    #[test]
    fn submission_rejects_bad_email() {
        let input = SubmitEscapeRequest {
            message: "I need the location sharing turned off".to_string(),
            safe_contact_email: Some("not-an-address".to_string()),
            urgency: Urgency::High,
            requested_actions: vec![],
            caller_key: "203.0.113.9".to_string(),
        };
        assert!(input.validate().is_err());
    }

    #[test]
    fn submission_accepts_plain_address() {
        let input = SubmitEscapeRequest {
            message: "I need the location sharing turned off".to_string(),
            safe_contact_email: Some("friend@shelter.org".to_string()),
            urgency: Urgency::High,
            requested_actions: vec![EscapeAction::DisableLocation],
            caller_key: "203.0.113.9".to_string(),
        };
        assert!(input.validate().is_ok());
    }

    #[test]
    fn compliance_justification_and_range_are_checked() {
        let short = GetSealedAuditEntries {
            family_id: "fam-1".to_string(),
            date_range: None,
            action_types: None,
            limit: None,
            justification: "too short".to_string(),
        };
        assert!(short.validate().is_err());

        let inverted = GetSealedAuditEntries {
            family_id: "fam-1".to_string(),
            date_range: Some(DateRange {
                start: Utc::now(),
                end: Utc::now() - chrono::Duration::days(1),
            }),
            action_types: None,
            limit: None,
            justification: "subpoena follow-up, case 41-C review".to_string(),
        };
        assert!(inverted.validate().is_err());
    }
}
