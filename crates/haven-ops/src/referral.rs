//! Resource-referral enqueueing.
//!
//! After the last remediation action completes, the victim is sent a
//! one-time notification pointing at external support resources. This
//! module decides whether to queue that notification: the request must
//! carry a safe contact address, the completion tracker must report
//! every requested action done, and no referral may already be queued
//! for the request.
//!
//! Enqueueing is best-effort by contract. A handler calls this after
//! its own mutations have committed, and a failure here must never
//! unwind them, so every error path logs and returns `false`.

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use haven_core::completion::is_escape_complete;
use haven_core::records::EscapeRequest;
use haven_core::store::{Collection, DocumentStore, FieldMap, TxAction, TxOutcome};

use crate::context::OpsContext;

/// Queues the resource referral for `request` if it is due, returning
/// whether a new referral was queued by this call.
///
/// The referral record is keyed by the request id and written through a
/// transaction, so two racing handlers cannot queue it twice; the loser
/// sees the winner's record and skips.
pub(crate) async fn maybe_queue_resource_referral(
    ctx: &OpsContext,
    request: &EscapeRequest,
) -> bool {
    let Some(email) = request.safe_contact_email.clone() else {
        return false;
    };

    if !is_escape_complete(ctx.store(), &request.id).await {
        return false;
    }

    let request_id = request.id.clone();
    let outcome = ctx
        .store()
        .transact(
            Collection::ReferralQueue,
            &request.id,
            Box::new(move |current| {
                if current.is_some() {
                    return TxAction::Skip;
                }
                let mut fields = FieldMap::new();
                fields.insert("request_id".to_string(), json!(request_id));
                fields.insert("email".to_string(), json!(email));
                fields.insert("status".to_string(), json!("pending"));
                fields.insert("queued_at".to_string(), json!(Utc::now().to_rfc3339()));
                TxAction::Write(fields)
            }),
        )
        .await;

    match outcome {
        Ok(TxOutcome::Written) => {
            info!(request_id = %request.id, "resource referral queued");
            true
        },
        Ok(TxOutcome::Skipped) => false,
        Err(err) => {
            warn!(request_id = %request.id, error = %err, "resource referral enqueue failed");
            false
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use haven_core::records::{EscapeAction, RequestStatus, Urgency};
    use haven_core::store::memory::MemoryStore;

    use super::*;
    use crate::context::OpsConfig;

    fn completed_request(email: Option<&str>) -> EscapeRequest {
        let mut request = EscapeRequest::new(
            "please remove the monitoring from my account",
            email.map(str::to_string),
            Urgency::High,
            [EscapeAction::SeverParentAccess],
        );
        request.status = RequestStatus::InProgress;
        request
            .completed_actions
            .insert(EscapeAction::SeverParentAccess.as_str().to_string(), true);
        request
    }

    async fn seeded_ctx(request: &EscapeRequest) -> (Arc<MemoryStore>, OpsContext) {
        let store = Arc::new(MemoryStore::new());
        store
            .insert(Collection::SafetyRequests, &request.id, request.to_fields())
            .await;
        let ctx = OpsContext::new(Arc::clone(&store) as Arc<dyn DocumentStore>, OpsConfig::default());
        (store, ctx)
    }

    #[tokio::test]
    async fn queues_once_for_completed_request() {
        let request = completed_request(Some("friend@shelter.org"));
        let (store, ctx) = seeded_ctx(&request).await;

        assert!(maybe_queue_resource_referral(&ctx, &request).await);
        assert_eq!(store.len(Collection::ReferralQueue).await, 1);

        // Second attempt sees the existing record and skips.
        assert!(!maybe_queue_resource_referral(&ctx, &request).await);
        assert_eq!(store.len(Collection::ReferralQueue).await, 1);
    }

    #[tokio::test]
    async fn no_contact_address_means_no_referral() {
        let request = completed_request(None);
        let (store, ctx) = seeded_ctx(&request).await;

        assert!(!maybe_queue_resource_referral(&ctx, &request).await);
        assert_eq!(store.len(Collection::ReferralQueue).await, 0);
    }

    #[tokio::test]
    async fn incomplete_request_is_not_referred() {
        let mut request = completed_request(Some("friend@shelter.org"));
        request
            .requested_actions
            .insert(EscapeAction::DisableLocation.as_str().to_string(), true);
        let (store, ctx) = seeded_ctx(&request).await;

        assert!(!maybe_queue_resource_referral(&ctx, &request).await);
        assert_eq!(store.len(Collection::ReferralQueue).await, 0);
    }
}
