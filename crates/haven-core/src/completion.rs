//! Escape-completion tracking.
//!
//! Decides whether every remediation action an escape request asked for
//! has actually been carried out. Downstream this gates exactly one
//! thing: the resource-referral notification that tells a victim their
//! escape finished and where to find support.
//!
//! # Invariants
//!
//! - Completion is universal over the keys of `requested_actions`. A
//!   key present with value `false` still counts as requested; absence
//!   of a key in `completed_actions` means "not yet attempted", never
//!   "not required".
//! - Legacy requests with an empty `requested_actions` map are
//!   approximated as complete once their status has left `pending`.
//!
//! # Failure posture
//!
//! Read failures **fail open** (report complete). Blocking a victim's
//! resource-referral email on a tracking-data fault is a worse outcome
//! than sending it slightly early. The submission limiter shares this
//! posture; nothing else in the crate does.

use crate::records::{EscapeRequest, RequestStatus};
use crate::store::{Collection, DocumentStore};

/// Whether every requested remediation action on `request_id` has been
/// marked complete.
///
/// A request that does not exist reports incomplete. Store failures and
/// unparseable request documents report complete (fail open).
pub async fn is_escape_complete(store: &dyn DocumentStore, request_id: &str) -> bool {
    match store.get(Collection::SafetyRequests, request_id).await {
        Ok(Some(doc)) => match EscapeRequest::from_document(&doc) {
            Ok(request) => request_complete(&request),
            Err(error) => {
                tracing::warn!(request_id, %error, "unreadable escape request, failing open");
                true
            },
        },
        Ok(None) => false,
        Err(error) => {
            tracing::warn!(request_id, %error, "completion check store failure, failing open");
            true
        },
    }
}

/// Pure completion check over an already-loaded request.
#[must_use]
pub fn request_complete(request: &EscapeRequest) -> bool {
    if request.requested_actions.is_empty() {
        // Legacy records predate per-action tracking.
        return matches!(
            request.status,
            RequestStatus::InProgress | RequestStatus::Resolved
        );
    }
    request
        .requested_actions
        .keys()
        .all(|action| request.completed_actions.get(action).copied().unwrap_or(false))
}
