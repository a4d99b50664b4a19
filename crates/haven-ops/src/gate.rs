//! Verification gate in front of every destructive action.
//!
//! A destructive handler runs only after two checks pass: the escape
//! request itself must be reviewed, family-bound, and identity-verified
//! ([`verify_escape_request`]), and every user it is about to touch
//! must actually belong to that family ([`verify_family_member`]).
//!
//! # Invariants
//!
//! - Membership failures are reported as a bare permission-denied with
//!   no detail string. "User not found" and "user in another family"
//!   are indistinguishable to the caller, so the surface cannot be used
//!   to probe which accounts exist.
//! - The gate only reads. Rejection leaves no trace in the store.

use haven_core::records::{EscapeRequest, RequestStatus};
use haven_core::store::{Collection, Document, DocumentStore};

use crate::context::OpsContext;
use crate::error::OpError;

/// Loads the escape request and checks it is actionable.
///
/// Rejects when the request is missing, still pending review, bound to
/// a different family than the caller named, or lacking both identity
/// checks.
///
/// # Errors
///
/// [`OpError::NotFound`] or [`OpError::FailedPrecondition`] naming the
/// failed step; [`OpError::Internal`] for store trouble.
pub(crate) async fn verify_escape_request(
    ctx: &OpsContext,
    request_id: &str,
    family_id: &str,
) -> Result<EscapeRequest, OpError> {
    let doc = match ctx.store().get(Collection::SafetyRequests, request_id).await {
        Ok(Some(doc)) => doc,
        Ok(None) => return Err(OpError::NotFound("escape request not found".to_string())),
        Err(err) => return Err(ctx.internal("verify-escape-request", &err).await),
    };

    let request = match EscapeRequest::from_document(&doc) {
        Ok(request) => request,
        Err(err) => return Err(ctx.internal("verify-escape-request", &err).await),
    };

    if request.status == RequestStatus::Pending {
        return Err(OpError::FailedPrecondition(
            "escape request has not been reviewed".to_string(),
        ));
    }

    if request.family_id.as_deref() != Some(family_id) {
        return Err(OpError::FailedPrecondition(
            "escape request is not bound to this family".to_string(),
        ));
    }

    if !request.verification.identity_established() {
        return Err(OpError::FailedPrecondition(
            "requester identity has not been verified".to_string(),
        ));
    }

    Ok(request)
}

/// Checks that `user_id` is a member of `family_id` and returns the
/// user document.
///
/// # Errors
///
/// [`OpError::PermissionDenied`] whether the user is missing or in a
/// different family; [`OpError::Internal`] for store trouble.
pub(crate) async fn verify_family_member(
    ctx: &OpsContext,
    user_id: &str,
    family_id: &str,
) -> Result<Document, OpError> {
    let doc = match ctx.store().get(Collection::Users, user_id).await {
        Ok(Some(doc)) => doc,
        Ok(None) => return Err(OpError::PermissionDenied),
        Err(err) => return Err(ctx.internal("verify-family-member", &err).await),
    };

    if doc.str_field("family_id") != Some(family_id) {
        return Err(OpError::PermissionDenied);
    }

    Ok(doc)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use haven_core::records::{EscapeAction, EscapeRequest, Urgency, VerificationChecklist};
    use haven_core::store::memory::MemoryStore;
    use haven_core::store::FieldMap;

    use super::*;
    use crate::context::OpsConfig;

    fn ctx_with(store: Arc<MemoryStore>) -> OpsContext {
        OpsContext::new(store, OpsConfig::default())
    }

    fn actionable_request(family_id: &str) -> EscapeRequest {
        let mut request = EscapeRequest::new(
            "please disable the location sharing on my account",
            None,
            Urgency::High,
            [EscapeAction::DisableLocation],
        );
        request.status = RequestStatus::InProgress;
        request.family_id = Some(family_id.to_string());
        request.verification = VerificationChecklist {
            account_ownership_verified: true,
            id_matched: false,
        };
        request
    }

    fn user_fields(family_id: &str) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("family_id".to_string(), json!(family_id));
        fields
    }

    #[tokio::test]
    async fn actionable_request_passes() {
        let store = Arc::new(MemoryStore::new());
        let request = actionable_request("fam-1");
        store.insert(Collection::SafetyRequests, &request.id, request.to_fields()).await;

        let ctx = ctx_with(store);
        let loaded = verify_escape_request(&ctx, &request.id, "fam-1")
            .await
            .unwrap();
        assert_eq!(loaded.id, request.id);
    }

    #[tokio::test]
    async fn missing_request_is_not_found() {
        let ctx = ctx_with(Arc::new(MemoryStore::new()));
        let err = verify_escape_request(&ctx, "nope", "fam-1")
            .await
            .unwrap_err();
        assert!(matches!(err, OpError::NotFound(_)));
    }

    #[tokio::test]
    async fn pending_request_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let mut request = actionable_request("fam-1");
        request.status = RequestStatus::Pending;
        store.insert(Collection::SafetyRequests, &request.id, request.to_fields()).await;

        let ctx = ctx_with(store);
        let err = verify_escape_request(&ctx, &request.id, "fam-1")
            .await
            .unwrap_err();
        assert!(matches!(err, OpError::FailedPrecondition(_)));
    }

    #[tokio::test]
    async fn family_mismatch_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let request = actionable_request("fam-1");
        store.insert(Collection::SafetyRequests, &request.id, request.to_fields()).await;

        let ctx = ctx_with(store);
        let err = verify_escape_request(&ctx, &request.id, "fam-2")
            .await
            .unwrap_err();
        assert!(matches!(err, OpError::FailedPrecondition(_)));
    }

    #[tokio::test]
    async fn unbound_request_is_rejected_even_for_matching_name() {
        let store = Arc::new(MemoryStore::new());
        let mut request = actionable_request("fam-1");
        request.family_id = None;
        store.insert(Collection::SafetyRequests, &request.id, request.to_fields()).await;

        let ctx = ctx_with(store);
        let err = verify_escape_request(&ctx, &request.id, "fam-1")
            .await
            .unwrap_err();
        assert!(matches!(err, OpError::FailedPrecondition(_)));
    }

    #[tokio::test]
    async fn unverified_identity_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let mut request = actionable_request("fam-1");
        request.verification = VerificationChecklist::default();
        store.insert(Collection::SafetyRequests, &request.id, request.to_fields()).await;

        let ctx = ctx_with(store);
        let err = verify_escape_request(&ctx, &request.id, "fam-1")
            .await
            .unwrap_err();
        assert!(matches!(err, OpError::FailedPrecondition(_)));
    }

    #[tokio::test]
    async fn either_identity_check_satisfies_the_gate() {
        let store = Arc::new(MemoryStore::new());
        let mut request = actionable_request("fam-1");
        request.verification = VerificationChecklist {
            account_ownership_verified: false,
            id_matched: true,
        };
        store.insert(Collection::SafetyRequests, &request.id, request.to_fields()).await;

        let ctx = ctx_with(store);
        assert!(verify_escape_request(&ctx, &request.id, "fam-1")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn membership_failures_are_indistinguishable() {
        let store = Arc::new(MemoryStore::new());
        store.insert(Collection::Users, "user-other", user_fields("fam-2")).await;

        let ctx = ctx_with(store);
        let missing = verify_family_member(&ctx, "user-none", "fam-1")
            .await
            .unwrap_err();
        let foreign = verify_family_member(&ctx, "user-other", "fam-1")
            .await
            .unwrap_err();

        assert_eq!(missing.to_string(), foreign.to_string());
        assert!(matches!(missing, OpError::PermissionDenied));
        assert!(matches!(foreign, OpError::PermissionDenied));
    }

    #[tokio::test]
    async fn member_of_the_family_passes() {
        let store = Arc::new(MemoryStore::new());
        store.insert(Collection::Users, "user-1", user_fields("fam-1")).await;

        let ctx = ctx_with(store);
        let doc = verify_family_member(&ctx, "user-1", "fam-1").await.unwrap();
        assert_eq!(doc.str_field("family_id"), Some("fam-1"));
    }
}
