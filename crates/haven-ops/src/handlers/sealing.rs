//! Administrative sealing surface.
//!
//! Thin authorization and mapping layer over the seal engine. Sealing
//! is available to the safety team as part of working an escape
//! request; unsealing answers to a court order and is restricted to the
//! legal team alone. Admin capability deliberately does not extend to
//! unsealing, so no single operational role can both create and expose
//! sealed material.

use tracing::info;

use haven_core::seal::UnsealAuthorization;

use crate::context::{map_seal_error, OpsContext};
use crate::error::OpError;
use crate::gate::verify_escape_request;
use crate::handlers::OpResponse;
use crate::identity::CallerIdentity;
use crate::inputs::{SealEscapeAuditEntries, UnsealAuditEntries, Validate};

const SEAL_OPERATION: &str = "seal-escape-audit-entries";
const UNSEAL_OPERATION: &str = "unseal-audit-entries";

/// Handles `seal_escape_audit_entries`.
///
/// With an explicit entry list the engine takes the manual path,
/// verifying family ownership of every entry before any write;
/// otherwise it auto-discovers by request tag.
pub(super) async fn handle_seal(
    ctx: &OpsContext,
    caller: &CallerIdentity,
    input: SealEscapeAuditEntries,
) -> Result<OpResponse, OpError> {
    let input = input.validate()?.into_inner();
    let actor = caller.require_safety_action()?.to_string();

    // The full gate, not just existence: sealing under a family id the
    // request is not bound to would scope the sweep to the wrong
    // household.
    verify_escape_request(ctx, &input.safety_request_id, &input.family_id).await?;

    let result = match &input.entries {
        Some(entries) => {
            ctx.seal()
                .seal_entries(
                    entries,
                    &input.safety_request_id,
                    &input.family_id,
                    &actor,
                    &input.reason,
                    &input.seal_reason,
                )
                .await
        },
        None => {
            ctx.seal()
                .seal_for_request(
                    &input.safety_request_id,
                    &input.family_id,
                    &actor,
                    &input.reason,
                    &input.seal_reason,
                )
                .await
        },
    };

    match result {
        Ok(outcome) => {
            info!(
                request_id = %input.safety_request_id,
                total_sealed = outcome.total_sealed,
                "audit entries sealed"
            );
            Ok(OpResponse::sealed(&outcome))
        },
        Err(err) => Err(map_seal_error(ctx, SEAL_OPERATION, err).await),
    }
}

/// Handles `unseal_audit_entries`.
pub(super) async fn handle_unseal(
    ctx: &OpsContext,
    caller: &CallerIdentity,
    input: UnsealAuditEntries,
) -> Result<OpResponse, OpError> {
    let input = input.validate()?.into_inner();
    let actor = caller.require_legal()?.to_string();

    let authorization = UnsealAuthorization {
        actor_id: actor,
        legal_justification: input.legal_justification,
        court_order_reference: input.court_order_reference,
        case_number: input.case_number,
        requesting_party: input.requesting_party,
    };

    match ctx.seal().unseal(&input.entries, &authorization).await {
        Ok(outcome) => {
            info!(
                unsealed = outcome.unsealed,
                court_order = %authorization.court_order_reference,
                "audit entries unsealed"
            );
            Ok(OpResponse::unsealed(&outcome))
        },
        Err(err) => Err(map_seal_error(ctx, UNSEAL_OPERATION, err).await),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use haven_core::records::{
        AuditEntryBuilder, EscapeAction, EscapeRequest, RequestStatus, Urgency,
        VerificationChecklist,
    };
    use haven_core::seal::EntryRef;
    use haven_core::store::memory::MemoryStore;
    use haven_core::store::{Collection, DocumentStore, FieldMap};

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

    fn legal_caller() -> CallerIdentity {
        CallerIdentity::authenticated(
            "counsel-1",
            CapabilitySet {
                is_legal_team: true,
                ..CapabilitySet::NONE
            },
        )
    }

    async fn seeded(store: &MemoryStore) -> EscapeRequest {
        let mut request = EscapeRequest::new(
            "remove my account from this family's monitoring",
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

        // Tagged records in two collections, plus one untagged.
        for (collection, id) in [
            (Collection::DeviceCommands, "dc-1"),
            (Collection::DeviceCommands, "dc-2"),
            (Collection::LocationHistory, "loc-1"),
        ] {
            let mut fields = FieldMap::new();
            fields.insert("family_id".to_string(), json!("fam-1"));
            fields.insert("safety_request_id".to_string(), json!(request.id));
            store.insert(collection, id, fields).await;
        }
        let mut unrelated = FieldMap::new();
        unrelated.insert("family_id".to_string(), json!("fam-1"));
        store
            .insert(Collection::DeviceCommands, "dc-other", unrelated)
            .await;

        request
    }

    fn seal_input(request_id: &str) -> SealEscapeAuditEntries {
        SealEscapeAuditEntries {
            safety_request_id: request_id.to_string(),
            family_id: "fam-1".to_string(),
            reason: "closing out the verified escape request".to_string(),
            seal_reason: "escape-action".to_string(),
            entries: None,
        }
    }

    #[tokio::test]
    async fn auto_discovery_seals_tagged_records_only() {
        let store = Arc::new(MemoryStore::new());
        let request = seeded(&store).await;
        let ctx = OpsContext::new(Arc::clone(&store) as Arc<dyn DocumentStore>, OpsConfig::default());

        let response = handle_seal(&ctx, &safety_caller(), seal_input(&request.id))
            .await
            .unwrap();
        let OpResponse::Sealed {
            total_sealed,
            by_collection,
        } = response
        else {
            panic!("unexpected response");
        };

        assert_eq!(total_sealed, 3);
        assert_eq!(by_collection.get("device_commands"), Some(&2));
        assert_eq!(by_collection.get("location_history"), Some(&1));

        let untouched = store
            .get(Collection::DeviceCommands, "dc-other")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(untouched.bool_field("sealed"), None);
    }

    #[tokio::test]
    async fn explicit_entry_list_takes_the_manual_path() {
        let store = Arc::new(MemoryStore::new());
        let request = seeded(&store).await;
        let ctx = OpsContext::new(Arc::clone(&store) as Arc<dyn DocumentStore>, OpsConfig::default());

        let mut input = seal_input(&request.id);
        input.entries = Some(vec![EntryRef::new(Collection::DeviceCommands, "dc-1")]);
        let response = handle_seal(&ctx, &safety_caller(), input).await.unwrap();

        let OpResponse::Sealed { total_sealed, .. } = response else {
            panic!("unexpected response");
        };
        assert_eq!(total_sealed, 1);

        let other = store
            .get(Collection::DeviceCommands, "dc-2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(other.bool_field("sealed"), None);
    }

    #[tokio::test]
    async fn sealing_requires_safety_privileges() {
        let store = Arc::new(MemoryStore::new());
        let request = seeded(&store).await;
        let ctx = OpsContext::new(Arc::clone(&store) as Arc<dyn DocumentStore>, OpsConfig::default());

        let err = handle_seal(&ctx, &legal_caller(), seal_input(&request.id))
            .await
            .unwrap_err();
        assert!(matches!(err, OpError::PermissionDenied));
    }

    async fn sealed_fixture(store: &MemoryStore) -> EntryRef {
        let entry = AuditEntryBuilder::new(
            "disable-location",
            "safety_request",
            "req-x",
            "agent-1",
            "fam-1",
        )
        .sealed("agent-1", "escape-action")
        .finish();
        store
            .insert(Collection::AuditLog, &entry.id, entry.to_fields())
            .await;
        EntryRef::new(Collection::AuditLog, entry.id)
    }

    fn unseal_input(entry: EntryRef) -> UnsealAuditEntries {
        UnsealAuditEntries {
            entries: vec![entry],
            court_order_reference: "2025-cv-1041".to_string(),
            legal_justification:
                "court order 2025-cv-1041 compels production of the sealed audit trail".to_string(),
            case_number: Some("41-C".to_string()),
            requesting_party: Some("county court".to_string()),
        }
    }

    #[tokio::test]
    async fn legal_team_can_unseal() {
        let store = Arc::new(MemoryStore::new());
        let entry = sealed_fixture(&store).await;
        let ctx = OpsContext::new(Arc::clone(&store) as Arc<dyn DocumentStore>, OpsConfig::default());

        let response = handle_unseal(&ctx, &legal_caller(), unseal_input(entry.clone()))
            .await
            .unwrap();
        let OpResponse::Unsealed { unsealed, .. } = response else {
            panic!("unexpected response");
        };
        assert_eq!(unsealed, 1);

        let doc = store
            .get(Collection::AuditLog, &entry.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.bool_field("sealed"), Some(false));
    }

    #[tokio::test]
    async fn admin_capability_does_not_unseal() {
        let store = Arc::new(MemoryStore::new());
        let entry = sealed_fixture(&store).await;
        let ctx = OpsContext::new(Arc::clone(&store) as Arc<dyn DocumentStore>, OpsConfig::default());

        let admin = CallerIdentity::authenticated(
            "admin-1",
            CapabilitySet {
                is_admin: true,
                ..CapabilitySet::NONE
            },
        );
        let err = handle_unseal(&ctx, &admin, unseal_input(entry))
            .await
            .unwrap_err();
        assert!(matches!(err, OpError::PermissionDenied));
    }

    #[tokio::test]
    async fn unsealing_twice_is_a_hard_error() {
        let store = Arc::new(MemoryStore::new());
        let entry = sealed_fixture(&store).await;
        let ctx = OpsContext::new(Arc::clone(&store) as Arc<dyn DocumentStore>, OpsConfig::default());

        handle_unseal(&ctx, &legal_caller(), unseal_input(entry.clone()))
            .await
            .unwrap();
        let err = handle_unseal(&ctx, &legal_caller(), unseal_input(entry))
            .await
            .unwrap_err();
        assert!(matches!(err, OpError::NotFound(_)));
    }
}
