//! Notification-stealth escape action.
//!
//! Stops the family surface from announcing anything about the target:
//! queued undelivered notifications about them are purged, and the
//! stealth flag on their record suppresses generation of new ones.

use serde_json::json;
use tracing::info;

use haven_core::records::{AuditEntryBuilder, EscapeAction};
use haven_core::store::chunk::apply_in_chunks;
use haven_core::store::{
    BatchOp, Collection, DocumentStore, FieldMap, Query, WriteBatch, MAX_BATCH_OPS,
};

use crate::context::{map_seal_error, OpsContext};
use crate::error::OpError;
use crate::gate::{verify_escape_request, verify_family_member};
use crate::handlers::{mark_action_complete, OpResponse, ESCAPE_ACTION_SEAL_REASON};
use crate::identity::CallerIdentity;
use crate::inputs::{EnableNotificationStealth, Validate};
use crate::referral::maybe_queue_resource_referral;

const OPERATION: &str = "enable-notification-stealth";

/// Handles `enable_notification_stealth`.
pub(super) async fn handle_stealth(
    ctx: &OpsContext,
    caller: &CallerIdentity,
    input: EnableNotificationStealth,
) -> Result<OpResponse, OpError> {
    let input = input.validate()?.into_inner();
    let actor = caller.require_safety_action()?.to_string();

    let request = verify_escape_request(ctx, &input.request_id, &input.family_id).await?;
    verify_family_member(ctx, &input.target_user_id, &input.family_id).await?;

    let purged_notification_count = purge_queued_notifications(ctx, &input).await?;
    enable_stealth_flag(ctx, &input).await?;
    write_action_entry(ctx, &input, &actor, purged_notification_count).await?;

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

    mark_action_complete(ctx, &input.request_id, EscapeAction::NotificationStealth).await;
    maybe_queue_resource_referral(ctx, &request).await;

    info!(
        request_id = %input.request_id,
        family_id = %input.family_id,
        purged_notification_count,
        "notification stealth enabled"
    );
    Ok(OpResponse::StealthEnabled {
        stealth_enabled: true,
        purged_notification_count,
    })
}

/// Deletes every queued, undelivered notification about the target.
async fn purge_queued_notifications(
    ctx: &OpsContext,
    input: &EnableNotificationStealth,
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

/// Sets the suppression flag the notification pipeline consults before
/// emitting anything about a user.
async fn enable_stealth_flag(
    ctx: &OpsContext,
    input: &EnableNotificationStealth,
) -> Result<(), OpError> {
    let mut flags = FieldMap::new();
    flags.insert("notification_stealth_enabled".to_string(), json!(true));
    flags.insert(
        "stealth_request_id".to_string(),
        json!(input.request_id),
    );

    let mut batch = WriteBatch::new();
    batch.update(Collection::Users, input.target_user_id.clone(), flags);
    if let Err(err) = ctx.store().commit(batch).await {
        return Err(ctx.internal(OPERATION, &err).await);
    }
    Ok(())
}

/// The sealed audit entry summarizing the stealth switch.
async fn write_action_entry(
    ctx: &OpsContext,
    input: &EnableNotificationStealth,
    actor: &str,
    purged_notification_count: usize,
) -> Result<(), OpError> {
    let entry = AuditEntryBuilder::new(
        EscapeAction::NotificationStealth.as_str(),
        "safety_request",
        &input.request_id,
        actor,
        &input.family_id,
    )
    .safety_request_id(&input.request_id)
    .detail("target_user_id", json!(input.target_user_id))
    .detail(
        "purged_notification_count",
        json!(purged_notification_count),
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
