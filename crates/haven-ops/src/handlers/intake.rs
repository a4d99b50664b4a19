//! Escape-request intake: anonymous submission and reviewer updates.
//!
//! Submission is the one unauthenticated operation in the surface. The
//! request body is treated as sensitive throughout; nothing from it is
//! ever logged, only the generated request id.

use tracing::info;

use haven_core::records::{EscapeRequest, RequestStatus};
use haven_core::store::{Collection, Document, DocumentStore, TxAction, TxOutcome, WriteBatch};

use crate::context::OpsContext;
use crate::error::OpError;
use crate::handlers::OpResponse;
use crate::identity::CallerIdentity;
use crate::inputs::{ReviewEscapeRequest, SubmitEscapeRequest, Validate};

/// Handles `submit_escape_request`.
pub(super) async fn handle_submit(
    ctx: &OpsContext,
    input: SubmitEscapeRequest,
) -> Result<OpResponse, OpError> {
    let input = input.validate()?.into_inner();

    if !ctx.limiter().allow(&input.caller_key).await {
        return Err(OpError::ResourceExhausted);
    }

    let request = EscapeRequest::new(
        input.message,
        input.safe_contact_email,
        input.urgency,
        input.requested_actions,
    );

    let mut batch = WriteBatch::new();
    batch.set(Collection::SafetyRequests, &request.id, request.to_fields());
    if let Err(err) = ctx.store().commit(batch).await {
        return Err(ctx.internal("submit-escape-request", &err).await);
    }

    info!(request_id = %request.id, urgency = %request.urgency, "escape request submitted");
    Ok(OpResponse::Submitted {
        request_id: request.id,
    })
}

/// Handles `review_escape_request`.
///
/// Reviewers bind the request to a family and record identity-check
/// results. The family binding is set-once: a later review naming a
/// different family is rejected rather than silently rebound, since
/// every downstream authorization hangs off that value. A pending
/// request moves to in-progress on its first review; a resolved
/// request can no longer be modified.
pub(super) async fn handle_review(
    ctx: &OpsContext,
    caller: &CallerIdentity,
    input: ReviewEscapeRequest,
) -> Result<OpResponse, OpError> {
    let input = input.validate()?.into_inner();
    caller.require_safety_action()?;

    let doc = match ctx.store().get(Collection::SafetyRequests, &input.request_id).await {
        Ok(Some(doc)) => doc,
        Ok(None) => return Err(OpError::NotFound("escape request not found".to_string())),
        Err(err) => return Err(ctx.internal("review-escape-request", &err).await),
    };
    let current = match EscapeRequest::from_document(&doc) {
        Ok(request) => request,
        Err(err) => return Err(ctx.internal("review-escape-request", &err).await),
    };

    if current.status == RequestStatus::Resolved {
        return Err(OpError::FailedPrecondition(
            "escape request is already resolved".to_string(),
        ));
    }
    if let (Some(bound), Some(requested)) = (&current.family_id, &input.family_id) {
        if bound != requested {
            return Err(OpError::FailedPrecondition(
                "escape request is already bound to a different family".to_string(),
            ));
        }
    }

    // Re-apply the same checks inside the transaction; a concurrent
    // reviewer may have advanced the request between the read above and
    // this write.
    let request_id = input.request_id.clone();
    let review = input.clone();
    let outcome = ctx
        .store()
        .transact(
            Collection::SafetyRequests,
            &input.request_id,
            Box::new(move |fields| {
                let Some(fields) = fields else {
                    return TxAction::Skip;
                };
                let doc = Document {
                    id: request_id,
                    fields: fields.clone(),
                };
                let Ok(mut request) = EscapeRequest::from_document(&doc) else {
                    return TxAction::Skip;
                };

                if request.status == RequestStatus::Resolved {
                    return TxAction::Skip;
                }
                match (&request.family_id, review.family_id) {
                    (Some(bound), Some(requested)) if *bound != requested => {
                        return TxAction::Skip;
                    },
                    (None, Some(requested)) => request.family_id = Some(requested),
                    _ => {},
                }
                if let Some(verified) = review.account_ownership_verified {
                    request.verification.account_ownership_verified = verified;
                }
                if let Some(matched) = review.id_matched {
                    request.verification.id_matched = matched;
                }
                if request.status == RequestStatus::Pending {
                    request.status = RequestStatus::InProgress;
                }
                TxAction::Write(request.to_fields())
            }),
        )
        .await;

    match outcome {
        Ok(TxOutcome::Written) => {},
        Ok(TxOutcome::Skipped) => {
            return Err(OpError::FailedPrecondition(
                "escape request changed during review".to_string(),
            ));
        },
        Err(err) => return Err(ctx.internal("review-escape-request", &err).await),
    }

    let status = match ctx.store().get(Collection::SafetyRequests, &input.request_id).await {
        Ok(Some(doc)) => match EscapeRequest::from_document(&doc) {
            Ok(request) => request.status,
            Err(err) => return Err(ctx.internal("review-escape-request", &err).await),
        },
        Ok(None) => return Err(OpError::NotFound("escape request not found".to_string())),
        Err(err) => return Err(ctx.internal("review-escape-request", &err).await),
    };

    info!(request_id = %input.request_id, status = %status, "escape request reviewed");
    Ok(OpResponse::Reviewed { status })
}
