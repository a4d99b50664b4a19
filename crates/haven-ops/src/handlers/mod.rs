//! Operation surface and dispatch.
//!
//! Every callable operation is one [`OpRequest`] variant carrying its
//! validated-at-the-boundary input struct. [`dispatch`] authorizes,
//! validates, and routes to the handler; failures of any kind come back
//! as [`OpResponse::Error`] with a taxonomy kind and a message that is
//! safe to show the caller.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use haven_core::completion::request_complete;
use haven_core::records::{EscapeAction, EscapeRequest, RequestStatus};
use haven_core::seal::{SealOutcome, UnsealOutcome};
use haven_core::store::{Collection, Document, DocumentStore, FieldMap, TxAction, TxOutcome};

use crate::context::OpsContext;
use crate::error::ErrorKind;
use crate::identity::CallerIdentity;
use crate::inputs::{
    DisableLocationFeatures, EnableNotificationStealth, GetFamilyAuditFeed, GetSealedAuditEntries,
    ReviewEscapeRequest, SealEscapeAuditEntries, SeverParentAccess, SubmitEscapeRequest,
    UnsealAuditEntries,
};

mod compliance;
mod intake;
mod location;
mod sealing;
mod severance;
mod stealth;

/// Seal reason stamped on records hidden as part of an escape action.
pub(crate) const ESCAPE_ACTION_SEAL_REASON: &str = "escape-action";

/// One inbound operation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OpRequest {
    /// Submit a new escape request. Anonymous callers allowed.
    SubmitEscapeRequest(SubmitEscapeRequest),

    /// Record review progress on a request.
    ReviewEscapeRequest(ReviewEscapeRequest),

    /// Disable location sharing and redact history for target users.
    DisableLocationFeatures(DisableLocationFeatures),

    /// Cut the monitoring link between a user and their guardians.
    SeverParentAccess(SeverParentAccess),

    /// Suppress family-visible notifications about a user.
    EnableNotificationStealth(EnableNotificationStealth),

    /// Seal escape-adjacent records across collections.
    SealEscapeAuditEntries(SealEscapeAuditEntries),

    /// Unseal listed entries under legal authorization.
    UnsealAuditEntries(UnsealAuditEntries),

    /// Read sealed entries (compliance/legal only).
    GetSealedAuditEntries(GetSealedAuditEntries),

    /// Read the ordinary family-visible audit feed.
    GetFamilyAuditFeed(GetFamilyAuditFeed),
}

/// One sealed entry as returned to a compliance reader. Raw stored
/// fields plus the verification verdict; entries are returned even when
/// verification fails, since a tampered record is exactly what a
/// compliance reader needs to see.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedEntryView {
    /// The entry's stored fields, returned as-is.
    pub fields: FieldMap,
    /// Whether the stored digest matches a recomputation.
    pub integrity_verified: bool,
}

/// Operation results, one variant per request type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OpResponse {
    /// A request was accepted.
    Submitted {
        /// Generated request id.
        request_id: String,
    },

    /// Review recorded.
    Reviewed {
        /// Status after the review.
        status: RequestStatus,
    },

    /// Location features disabled.
    LocationDisabled {
        /// Whether the disable completed.
        disabled: bool,
        /// Undelivered notifications deleted.
        deleted_notification_count: usize,
        /// Device commands issued.
        device_command_count: usize,
        /// Location records redacted.
        redacted_history_count: usize,
    },

    /// Parent access severed.
    ParentSevered {
        /// Whether the severance completed.
        severed: bool,
        /// Whether this call queued the resource referral.
        resource_referral_queued: bool,
    },

    /// Notification stealth enabled.
    StealthEnabled {
        /// Whether the flag is now set.
        stealth_enabled: bool,
        /// Queued notifications purged.
        purged_notification_count: usize,
    },

    /// Records sealed.
    Sealed {
        /// Entries stamped across all collections.
        total_sealed: usize,
        /// Per-collection counts.
        by_collection: BTreeMap<String, usize>,
    },

    /// Records unsealed.
    Unsealed {
        /// Entries unsealed.
        unsealed: usize,
        /// Per-collection counts.
        unsealed_by_collection: BTreeMap<String, usize>,
        /// When the unseal was stamped.
        unsealed_at: DateTime<Utc>,
    },

    /// Sealed entries for a compliance reader.
    SealedEntries {
        /// Matching entries, newest first.
        entries: Vec<SealedEntryView>,
        /// Number of entries returned.
        count: usize,
    },

    /// The family-visible audit feed.
    AuditFeed {
        /// Matching entries, newest first.
        entries: Vec<FieldMap>,
        /// Number of entries returned.
        count: usize,
    },

    /// The operation failed.
    Error {
        /// Taxonomy kind.
        kind: ErrorKind,
        /// Caller-safe message.
        message: String,
    },
}

impl OpResponse {
    fn sealed(outcome: &SealOutcome) -> Self {
        Self::Sealed {
            total_sealed: outcome.total_sealed,
            by_collection: outcome
                .by_collection
                .iter()
                .map(|(collection, count)| (collection.as_str().to_string(), *count))
                .collect(),
        }
    }

    fn unsealed(outcome: &UnsealOutcome) -> Self {
        Self::Unsealed {
            unsealed: outcome.unsealed,
            unsealed_by_collection: outcome
                .by_collection
                .iter()
                .map(|(collection, count)| (collection.as_str().to_string(), *count))
                .collect(),
            unsealed_at: outcome.unsealed_at,
        }
    }
}

/// Routes one operation call to its handler.
///
/// Handlers return `Result<OpResponse, OpError>` internally; this is
/// where the error side collapses into [`OpResponse::Error`].
pub async fn dispatch(
    ctx: &OpsContext,
    caller: &CallerIdentity,
    request: OpRequest,
) -> OpResponse {
    let result = match request {
        OpRequest::SubmitEscapeRequest(input) => intake::handle_submit(ctx, input).await,
        OpRequest::ReviewEscapeRequest(input) => intake::handle_review(ctx, caller, input).await,
        OpRequest::DisableLocationFeatures(input) => {
            location::handle_disable(ctx, caller, input).await
        },
        OpRequest::SeverParentAccess(input) => severance::handle_sever(ctx, caller, input).await,
        OpRequest::EnableNotificationStealth(input) => {
            stealth::handle_stealth(ctx, caller, input).await
        },
        OpRequest::SealEscapeAuditEntries(input) => sealing::handle_seal(ctx, caller, input).await,
        OpRequest::UnsealAuditEntries(input) => sealing::handle_unseal(ctx, caller, input).await,
        OpRequest::GetSealedAuditEntries(input) => {
            compliance::handle_get_sealed(ctx, caller, input).await
        },
        OpRequest::GetFamilyAuditFeed(input) => {
            compliance::handle_family_feed(ctx, caller, input).await
        },
    };

    result.unwrap_or_else(|err| OpResponse::Error {
        kind: err.kind(),
        message: err.to_string(),
    })
}

/// Records one completed remediation action on the request, resolving
/// it once every requested action is done.
///
/// Runs after the action's own mutations have committed, so a failure
/// here is logged rather than surfaced; the worst outcome is a stale
/// completion map, which a later invocation repairs (the write is a
/// fixed-value merge and safely repeatable).
pub(crate) async fn mark_action_complete(
    ctx: &OpsContext,
    request_id: &str,
    action: EscapeAction,
) {
    let id = request_id.to_string();
    let outcome = ctx
        .store()
        .transact(
            Collection::SafetyRequests,
            request_id,
            Box::new(move |fields| {
                let Some(fields) = fields else {
                    return TxAction::Skip;
                };
                let doc = Document {
                    id,
                    fields: fields.clone(),
                };
                let Ok(mut request) = EscapeRequest::from_document(&doc) else {
                    return TxAction::Skip;
                };

                request
                    .completed_actions
                    .insert(action.as_str().to_string(), true);
                if !request.requested_actions.is_empty() && request_complete(&request) {
                    request.status = RequestStatus::Resolved;
                }
                TxAction::Write(request.to_fields())
            }),
        )
        .await;

    match outcome {
        Ok(TxOutcome::Written) => {},
        Ok(TxOutcome::Skipped) => {
            warn!(request_id, action = %action, "completion update skipped");
        },
        Err(err) => {
            warn!(request_id, action = %action, error = %err, "completion update failed");
        },
    }
}
