//! Parent-severance escape action.
//!
//! Cuts the monitoring link in both directions: the target user record
//! loses its guardian list and monitored flag, and each former
//! guardian's record loses the target from its monitored-users list.
//! Both writes are fixed-value merges through single-document
//! transactions, so a repeated or racing invocation converges on the
//! same severed state instead of erroring.

use serde_json::{json, Value};
use tracing::info;

use haven_core::records::{AuditEntryBuilder, EscapeAction};
use haven_core::store::chunk::apply_in_chunks;
use haven_core::store::{
    BatchOp, Collection, DocumentStore, FieldMap, Query, TxAction, TxOutcome, WriteBatch,
    MAX_BATCH_OPS,
};

use crate::context::{map_seal_error, OpsContext};
use crate::error::OpError;
use crate::gate::{verify_escape_request, verify_family_member};
use crate::handlers::{mark_action_complete, OpResponse, ESCAPE_ACTION_SEAL_REASON};
use crate::identity::CallerIdentity;
use crate::inputs::{SeverParentAccess, Validate};
use crate::referral::maybe_queue_resource_referral;

const OPERATION: &str = "sever-parent-access";

/// Handles `sever_parent_access`.
pub(super) async fn handle_sever(
    ctx: &OpsContext,
    caller: &CallerIdentity,
    input: SeverParentAccess,
) -> Result<OpResponse, OpError> {
    let input = input.validate()?.into_inner();
    let actor = caller.require_safety_action()?.to_string();

    let request = verify_escape_request(ctx, &input.request_id, &input.family_id).await?;
    let target = verify_family_member(ctx, &input.target_user_id, &input.family_id).await?;

    let guardian_ids: Vec<String> = target
        .fields
        .get("guardian_ids")
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let deleted = delete_leaking_notifications(ctx, &input).await?;
    sever_target(ctx, &input).await?;
    let severed_guardian_count = detach_guardians(ctx, &input, &guardian_ids).await?;
    write_action_entry(ctx, &input, &actor, severed_guardian_count, deleted).await?;

    if let Err(err) = ctx
        .seal()
        .seal_for_request(
            &input.request_id,
            &input.family_id,
            &actor,
            &input.reason,
            ESCAPE_ACTION_SEAL_REASON,
        )
        .await
    {
        return Err(map_seal_error(ctx, OPERATION, err).await);
    }

    mark_action_complete(ctx, &input.request_id, EscapeAction::SeverParentAccess).await;
    let resource_referral_queued = if input.trigger_resource_referral {
        maybe_queue_resource_referral(ctx, &request).await
    } else {
        false
    };

    info!(
        request_id = %input.request_id,
        family_id = %input.family_id,
        severed_guardian_count,
        resource_referral_queued,
        "parent access severed"
    );
    Ok(OpResponse::ParentSevered {
        severed: true,
        resource_referral_queued,
    })
}

/// Deletes queued, undelivered notifications about the target so no
/// alert about the severance (or anything else) reaches the guardians
/// after the link is cut.
async fn delete_leaking_notifications(
    ctx: &OpsContext,
    input: &SeverParentAccess,
) -> Result<usize, OpError> {
    let query = Query::new()
        .filter_eq("family_id", json!(input.family_id))
        .filter_eq("user_id", json!(input.target_user_id))
        .filter_eq("delivered", json!(false));
    let docs = match ctx.store().query(Collection::NotificationQueue, &query).await {
        Ok(docs) => docs,
        Err(err) => return Err(ctx.internal(OPERATION, &err).await),
    };

    let ops: Vec<BatchOp> = docs
        .into_iter()
        .map(|doc| BatchOp::Delete {
            collection: Collection::NotificationQueue,
            id: doc.id,
        })
        .collect();
    let count = ops.len();
    if let Err(err) = apply_in_chunks(ctx.store(), ops, MAX_BATCH_OPS).await {
        return Err(ctx.internal(OPERATION, &err).await);
    }
    Ok(count)
}

/// Clears the monitoring relationship on the target's own record.
async fn sever_target(ctx: &OpsContext, input: &SeverParentAccess) -> Result<(), OpError> {
    let request_id = input.request_id.clone();
    let outcome = ctx
        .store()
        .transact(
            Collection::Users,
            &input.target_user_id,
            Box::new(move |fields| {
                let Some(fields) = fields else {
                    return TxAction::Skip;
                };
                let mut updated = fields.clone();
                updated.insert("monitored".to_string(), json!(false));
                updated.insert("guardian_ids".to_string(), Value::Array(Vec::new()));
                updated.insert("monitoring_severed".to_string(), json!(true));
                updated.insert(
                    "severed_by_request".to_string(),
                    json!(request_id),
                );
                TxAction::Write(updated)
            }),
        )
        .await;

    match outcome {
        Ok(TxOutcome::Written) => Ok(()),
        // The membership check saw this record moments ago; a skip
        // means it vanished mid-flight.
        Ok(TxOutcome::Skipped) => Err(OpError::PermissionDenied),
        Err(err) => Err(ctx.internal(OPERATION, &err).await),
    }
}

/// Removes the target from each former guardian's monitored-users
/// list. Guardians already lacking the entry are skipped.
async fn detach_guardians(
    ctx: &OpsContext,
    input: &SeverParentAccess,
    guardian_ids: &[String],
) -> Result<usize, OpError> {
    let mut detached = 0;
    for guardian_id in guardian_ids {
        let target_id = input.target_user_id.clone();
        let outcome = ctx
            .store()
            .transact(
                Collection::Users,
                guardian_id,
                Box::new(move |fields| {
                    let Some(fields) = fields else {
                        return TxAction::Skip;
                    };
                    let Some(current) = fields.get("monitored_user_ids").and_then(Value::as_array)
                    else {
                        return TxAction::Skip;
                    };
                    let filtered: Vec<Value> = current
                        .iter()
                        .filter(|v| v.as_str() != Some(target_id.as_str()))
                        .cloned()
                        .collect();
                    if filtered.len() == current.len() {
                        return TxAction::Skip;
                    }
                    let mut updated = fields.clone();
                    updated.insert("monitored_user_ids".to_string(), Value::Array(filtered));
                    TxAction::Write(updated)
                }),
            )
            .await;

        match outcome {
            Ok(TxOutcome::Written) => detached += 1,
            Ok(TxOutcome::Skipped) => {},
            Err(err) => return Err(ctx.internal(OPERATION, &err).await),
        }
    }
    Ok(detached)
}

/// The sealed audit entry summarizing the severance.
async fn write_action_entry(
    ctx: &OpsContext,
    input: &SeverParentAccess,
    actor: &str,
    severed_guardian_count: usize,
    deleted_notification_count: usize,
) -> Result<(), OpError> {
    let entry = AuditEntryBuilder::new(
        EscapeAction::SeverParentAccess.as_str(),
        "safety_request",
        &input.request_id,
        actor,
        &input.family_id,
    )
    .safety_request_id(&input.request_id)
    .detail("target_user_id", json!(input.target_user_id))
    .detail("severed_guardian_count", json!(severed_guardian_count))
    .detail(
        "deleted_notification_count",
        json!(deleted_notification_count),
    )
    .detail("reason", json!(input.reason))
    .sealed(actor, ESCAPE_ACTION_SEAL_REASON)
    .finish();

    let mut batch = WriteBatch::new();
    batch.set(Collection::AuditLog, entry.id.clone(), entry.to_fields());
    if let Err(err) = ctx.store().commit(batch).await {
        return Err(ctx.internal(OPERATION, &err).await);
    }
    Ok(())
}
