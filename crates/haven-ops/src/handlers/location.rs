//! Location-disable escape action.
//!
//! Side effects run in a fixed order chosen so that an observer on the
//! family account learns nothing while the action is in flight:
//! leaking notifications are deleted before anything else changes,
//! device enforcement lands before the account flags flip, history is
//! redacted in place so the timeline shows no gap, and only then is the
//! sealed audit entry written and the seal sweep run.

use chrono::Utc;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use haven_core::records::{AuditEntryBuilder, EscapeAction};
use haven_core::store::chunk::apply_in_chunks;
use haven_core::store::{
    BatchOp, Collection, Document, DocumentStore, FieldMap, Query, WriteBatch, MAX_BATCH_OPS,
};

use crate::context::{map_seal_error, OpsContext};
use crate::error::OpError;
use crate::gate::{verify_escape_request, verify_family_member};
use crate::handlers::{mark_action_complete, OpResponse, ESCAPE_ACTION_SEAL_REASON};
use crate::identity::CallerIdentity;
use crate::inputs::{DisableLocationFeatures, Validate};
use crate::referral::maybe_queue_resource_referral;

const OPERATION: &str = "disable-location-features";

/// Handles `disable_location_features`.
pub(super) async fn handle_disable(
    ctx: &OpsContext,
    caller: &CallerIdentity,
    input: DisableLocationFeatures,
) -> Result<OpResponse, OpError> {
    let input = input.validate()?.into_inner();
    let actor = caller.require_safety_action()?.to_string();

    let request = verify_escape_request(ctx, &input.request_id, &input.family_id).await?;
    let mut targets = Vec::with_capacity(input.target_user_ids.len());
    for user_id in &input.target_user_ids {
        targets.push(verify_family_member(ctx, user_id, &input.family_id).await?);
    }

    let deleted_notification_count = delete_leaking_notifications(ctx, &input).await?;
    let device_command_count = issue_device_commands(ctx, &input, &targets, &actor).await?;
    flip_location_flags(ctx, &input).await?;
    let redacted_history_count = redact_location_history(ctx, &input).await?;

    write_action_entry(
        ctx,
        &input,
        &actor,
        deleted_notification_count,
        device_command_count,
        redacted_history_count,
    )
    .await?;

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

    mark_action_complete(ctx, &input.request_id, EscapeAction::DisableLocation).await;
    maybe_queue_resource_referral(ctx, &request).await;

    info!(
        request_id = %input.request_id,
        family_id = %input.family_id,
        deleted_notification_count,
        device_command_count,
        redacted_history_count,
        "location features disabled"
    );
    Ok(OpResponse::LocationDisabled {
        disabled: true,
        deleted_notification_count,
        device_command_count,
        redacted_history_count,
    })
}

/// Step 1: delete queued, undelivered notifications about the targets
/// before any other mutation can generate an alert referencing them.
async fn delete_leaking_notifications(
    ctx: &OpsContext,
    input: &DisableLocationFeatures,
) -> Result<usize, OpError> {
    let mut ops = Vec::new();
    for user_id in &input.target_user_ids {
        let query = Query::new()
            .filter_eq("family_id", json!(input.family_id))
            .filter_eq("user_id", json!(user_id))
            .filter_eq("delivered", json!(false));
        let docs = match ctx.store().query(Collection::NotificationQueue, &query).await {
            Ok(docs) => docs,
            Err(err) => return Err(ctx.internal(OPERATION, &err).await),
        };
        ops.extend(docs.into_iter().map(|doc| BatchOp::Delete {
            collection: Collection::NotificationQueue,
            id: doc.id,
        }));
    }

    let count = ops.len();
    if let Err(err) = apply_in_chunks(ctx.store(), ops, MAX_BATCH_OPS).await {
        return Err(ctx.internal(OPERATION, &err).await);
    }
    Ok(count)
}

/// Step 2: issue one time-boxed disable command per known device, or
/// one account-level command when a user has no device list.
async fn issue_device_commands(
    ctx: &OpsContext,
    input: &DisableLocationFeatures,
    targets: &[Document],
    actor: &str,
) -> Result<usize, OpError> {
    let issued_at = Utc::now();
    let ttl = chrono::Duration::from_std(ctx.config().device_command_ttl)
        .unwrap_or_else(|_| chrono::Duration::days(1));
    let expires_at = issued_at + ttl;

    let mut ops = Vec::new();
    for target in targets {
        let device_ids: Vec<Value> = target
            .fields
            .get("device_ids")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter(|v| v.is_string()).cloned().collect())
            .unwrap_or_default();
        let addressed = if device_ids.is_empty() {
            vec![Value::Null]
        } else {
            device_ids
        };

        for device_id in addressed {
            let mut fields = FieldMap::new();
            fields.insert("command".to_string(), json!("disable-location"));
            fields.insert("user_id".to_string(), json!(target.id));
            fields.insert("device_id".to_string(), device_id);
            fields.insert("family_id".to_string(), json!(input.family_id));
            fields.insert(
                "safety_request_id".to_string(),
                json!(input.request_id),
            );
            fields.insert("issued_by".to_string(), json!(actor));
            fields.insert("issued_at".to_string(), json!(issued_at.to_rfc3339()));
            fields.insert("expires_at".to_string(), json!(expires_at.to_rfc3339()));
            fields.insert("status".to_string(), json!("pending"));
            ops.push(BatchOp::Set {
                collection: Collection::DeviceCommands,
                id: Uuid::new_v4().to_string(),
                fields,
            });
        }
    }

    let count = ops.len();
    if let Err(err) = apply_in_chunks(ctx.store(), ops, MAX_BATCH_OPS).await {
        return Err(ctx.internal(OPERATION, &err).await);
    }
    Ok(count)
}

/// Step 3: flip the account-level feature flags.
async fn flip_location_flags(
    ctx: &OpsContext,
    input: &DisableLocationFeatures,
) -> Result<(), OpError> {
    let mut batch = WriteBatch::new();
    for user_id in &input.target_user_ids {
        let mut flags = FieldMap::new();
        flags.insert("location_sharing_enabled".to_string(), json!(false));
        flags.insert("location_history_enabled".to_string(), json!(false));
        batch.update(Collection::Users, user_id.clone(), flags);
    }
    if let Err(err) = ctx.store().commit(batch).await {
        return Err(ctx.internal(OPERATION, &err).await);
    }
    Ok(())
}

/// Step 4: redact stored location points in place. Coordinates and
/// place fields are nulled but every record and its timestamp survive,
/// so the history view shows no suspicious gap. Redacted records are
/// tagged with the request id, which is what the seal sweep later
/// discovers them by.
async fn redact_location_history(
    ctx: &OpsContext,
    input: &DisableLocationFeatures,
) -> Result<usize, OpError> {
    let mut ops = Vec::new();
    for user_id in &input.target_user_ids {
        let query = Query::new()
            .filter_eq("family_id", json!(input.family_id))
            .filter_eq("user_id", json!(user_id));
        let docs = match ctx.store().query(Collection::LocationHistory, &query).await {
            Ok(docs) => docs,
            Err(err) => return Err(ctx.internal(OPERATION, &err).await),
        };

        for doc in docs {
            let mut fields = FieldMap::new();
            fields.insert("latitude".to_string(), Value::Null);
            fields.insert("longitude".to_string(), Value::Null);
            fields.insert("address".to_string(), Value::Null);
            fields.insert("place_name".to_string(), Value::Null);
            fields.insert("redacted".to_string(), json!(true));
            fields.insert(
                "safety_request_id".to_string(),
                json!(input.request_id),
            );
            ops.push(BatchOp::Update {
                collection: Collection::LocationHistory,
                id: doc.id,
                fields,
            });
        }
    }

    let count = ops.len();
    if let Err(err) = apply_in_chunks(ctx.store(), ops, MAX_BATCH_OPS).await {
        return Err(ctx.internal(OPERATION, &err).await);
    }
    Ok(count)
}

/// Step 5: the sealed audit entry summarizing the whole operation.
async fn write_action_entry(
    ctx: &OpsContext,
    input: &DisableLocationFeatures,
    actor: &str,
    deleted_notification_count: usize,
    device_command_count: usize,
    redacted_history_count: usize,
) -> Result<(), OpError> {
    let entry = AuditEntryBuilder::new(
        EscapeAction::DisableLocation.as_str(),
        "safety_request",
        &input.request_id,
        actor,
        &input.family_id,
    )
    .safety_request_id(&input.request_id)
    .detail("target_user_ids", json!(input.target_user_ids))
    .detail(
        "deleted_notification_count",
        json!(deleted_notification_count),
    )
    .detail("device_command_count", json!(device_command_count))
    .detail("redacted_history_count", json!(redacted_history_count))
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

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use haven_core::digest::verify_fields;
    use haven_core::records::{EscapeRequest, RequestStatus, Urgency, VerificationChecklist};
    use haven_core::store::memory::MemoryStore;

    use super::*;
    use crate::context::OpsConfig;
    use crate::identity::CapabilitySet;

    fn safety_caller() -> CallerIdentity {
        CallerIdentity::authenticated(
            "agent-1",
            CapabilitySet {
                is_safety_team: true,
                ..CapabilitySet::NONE
            },
        )
    }

    fn user_fields(family_id: &str, device_ids: &[&str]) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("family_id".to_string(), json!(family_id));
        fields.insert("location_sharing_enabled".to_string(), json!(true));
        if !device_ids.is_empty() {
            fields.insert("device_ids".to_string(), json!(device_ids));
        }
        fields
    }

    async fn seeded(store: &MemoryStore) -> EscapeRequest {
        let mut request = EscapeRequest::new(
            "please disable the location tracking on my phone",
            None,
            Urgency::High,
            [EscapeAction::DisableLocation],
        );
        request.status = RequestStatus::InProgress;
        request.family_id = Some("fam-1".to_string());
        request.verification = VerificationChecklist {
            account_ownership_verified: true,
            id_matched: false,
        };
        store
            .insert(Collection::SafetyRequests, &request.id, request.to_fields())
            .await;

        store
            .insert(
                Collection::Users,
                "victim-1",
                user_fields("fam-1", &["phone-1", "tablet-1"]),
            )
            .await;

        // Two undelivered notifications about the victim, one already
        // delivered, one about somebody else.
        for (id, user, delivered) in [
            ("n-1", "victim-1", false),
            ("n-2", "victim-1", false),
            ("n-3", "victim-1", true),
            ("n-4", "other-user", false),
        ] {
            let mut fields = FieldMap::new();
            fields.insert("family_id".to_string(), json!("fam-1"));
            fields.insert("user_id".to_string(), json!(user));
            fields.insert("delivered".to_string(), json!(delivered));
            store.insert(Collection::NotificationQueue, id, fields).await;
        }

        for id in ["loc-1", "loc-2", "loc-3"] {
            let mut fields = FieldMap::new();
            fields.insert("family_id".to_string(), json!("fam-1"));
            fields.insert("user_id".to_string(), json!("victim-1"));
            fields.insert("latitude".to_string(), json!(47.6));
            fields.insert("longitude".to_string(), json!(-122.3));
            fields.insert("address".to_string(), json!("somewhere sensitive"));
            fields.insert("timestamp".to_string(), json!("2025-06-01T12:00:00Z"));
            store.insert(Collection::LocationHistory, id, fields).await;
        }

        request
    }

    fn disable_input(request_id: &str) -> DisableLocationFeatures {
        DisableLocationFeatures {
            request_id: request_id.to_string(),
            family_id: "fam-1".to_string(),
            target_user_ids: vec!["victim-1".to_string()],
            reason: "verified escape request from account owner".to_string(),
        }
    }

    #[tokio::test]
    async fn full_sequence_counts_and_redacts() {
        let store = Arc::new(MemoryStore::new());
        let request = seeded(&store).await;
        let ctx = OpsContext::new(Arc::clone(&store) as Arc<dyn DocumentStore>, OpsConfig::default());

        let response = handle_disable(&ctx, &safety_caller(), disable_input(&request.id))
            .await
            .unwrap();
        let OpResponse::LocationDisabled {
            disabled,
            deleted_notification_count,
            device_command_count,
            redacted_history_count,
        } = response
        else {
            panic!("unexpected response");
        };

        assert!(disabled);
        assert_eq!(deleted_notification_count, 2);
        assert_eq!(device_command_count, 2);
        assert_eq!(redacted_history_count, 3);

        // Delivered and unrelated notifications survive.
        assert_eq!(store.len(Collection::NotificationQueue).await, 2);

        // Redaction nulls coordinates but keeps the record and its
        // timestamp.
        let loc = store
            .get(Collection::LocationHistory, "loc-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loc.fields.get("latitude"), Some(&Value::Null));
        assert_eq!(loc.str_field("timestamp"), Some("2025-06-01T12:00:00Z"));
        assert_eq!(loc.bool_field("redacted"), Some(true));
        assert_eq!(loc.bool_field("sealed"), Some(true));

        // Account flags flipped.
        let user = store.get(Collection::Users, "victim-1").await.unwrap().unwrap();
        assert_eq!(user.bool_field("location_sharing_enabled"), Some(false));

        // Request bookkeeping: the only requested action completed, so
        // the request resolves.
        let doc = store
            .get(Collection::SafetyRequests, &request.id)
            .await
            .unwrap()
            .unwrap();
        let updated = EscapeRequest::from_document(&doc).unwrap();
        assert_eq!(
            updated.completed_actions.get("disable-location"),
            Some(&true)
        );
        assert_eq!(updated.status, RequestStatus::Resolved);
    }

    #[tokio::test]
    async fn device_commands_are_time_boxed_and_tagged() {
        let store = Arc::new(MemoryStore::new());
        let request = seeded(&store).await;
        let ctx = OpsContext::new(Arc::clone(&store) as Arc<dyn DocumentStore>, OpsConfig::default());

        handle_disable(&ctx, &safety_caller(), disable_input(&request.id))
            .await
            .unwrap();

        let query = Query::new().filter_eq("safety_request_id", json!(request.id));
        let commands = store
            .query(Collection::DeviceCommands, &query)
            .await
            .unwrap();
        assert_eq!(commands.len(), 2);
        for command in &commands {
            assert_eq!(command.str_field("command"), Some("disable-location"));
            assert!(command.str_field("expires_at").is_some());
            // Swept into the sealed set by the post-action seal run.
            assert_eq!(command.bool_field("sealed"), Some(true));
        }
    }

    #[tokio::test]
    async fn action_entry_is_sealed_and_verifiable() {
        let store = Arc::new(MemoryStore::new());
        let request = seeded(&store).await;
        let ctx = OpsContext::new(Arc::clone(&store) as Arc<dyn DocumentStore>, OpsConfig::default());

        handle_disable(&ctx, &safety_caller(), disable_input(&request.id))
            .await
            .unwrap();

        let query = Query::new().filter_eq("action", json!("disable-location"));
        let entries = store.query(Collection::AuditLog, &query).await.unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.bool_field("sealed"), Some(true));
        assert!(verify_fields(&entry.fields));
    }

    #[tokio::test]
    async fn cross_family_target_aborts_before_any_mutation() {
        let store = Arc::new(MemoryStore::new());
        let request = seeded(&store).await;
        store
            .insert(Collection::Users, "outsider", user_fields("fam-9", &[]))
            .await;
        let ctx = OpsContext::new(Arc::clone(&store) as Arc<dyn DocumentStore>, OpsConfig::default());

        let mut input = disable_input(&request.id);
        input.target_user_ids.push("outsider".to_string());
        let err = handle_disable(&ctx, &safety_caller(), input)
            .await
            .unwrap_err();

        assert!(matches!(err, OpError::PermissionDenied));
        // Nothing was touched.
        assert_eq!(store.len(Collection::NotificationQueue).await, 4);
        assert_eq!(store.len(Collection::DeviceCommands).await, 0);
    }

    #[tokio::test]
    async fn pending_request_is_refused() {
        let store = Arc::new(MemoryStore::new());
        let mut request = seeded(&store).await;
        request.status = RequestStatus::Pending;
        store
            .insert(Collection::SafetyRequests, &request.id, request.to_fields())
            .await;
        let ctx = OpsContext::new(Arc::clone(&store) as Arc<dyn DocumentStore>, OpsConfig::default());

        let err = handle_disable(&ctx, &safety_caller(), disable_input(&request.id))
            .await
            .unwrap_err();
        assert!(matches!(err, OpError::FailedPrecondition(_)));
    }

    #[tokio::test]
    async fn support_team_cannot_disable_location() {
        let store = Arc::new(MemoryStore::new());
        let request = seeded(&store).await;
        let ctx = OpsContext::new(Arc::clone(&store) as Arc<dyn DocumentStore>, OpsConfig::default());

        let support = CallerIdentity::authenticated(
            "support-1",
            CapabilitySet {
                is_support_team: true,
                ..CapabilitySet::NONE
            },
        );
        let err = handle_disable(&ctx, &support, disable_input(&request.id))
            .await
            .unwrap_err();
        assert!(matches!(err, OpError::PermissionDenied));
    }
}
