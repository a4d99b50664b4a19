//! Read surfaces over the audit trail.
//!
//! Two very different readers share this module. The compliance/legal
//! gateway returns sealed entries, requires an elevated role plus a
//! recorded justification, and writes a sealed access-log entry for
//! every read; if that access entry cannot be written the read itself
//! fails, because an unlogged look at sealed material is exactly what
//! this surface exists to prevent. The family feed is the ordinary
//! member-visible view and never returns anything sealed.

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::info;

use haven_core::digest::verify_fields;
use haven_core::records::AuditEntryBuilder;
use haven_core::store::{Collection, Document, DocumentStore, Query, WriteBatch};

use crate::context::OpsContext;
use crate::error::OpError;
use crate::gate::verify_family_member;
use crate::handlers::{OpResponse, SealedEntryView};
use crate::identity::CallerIdentity;
use crate::inputs::{DateRange, GetFamilyAuditFeed, GetSealedAuditEntries, Validate};

const SEALED_READ_OPERATION: &str = "get-sealed-audit-entries";
const FEED_OPERATION: &str = "get-family-audit-feed";

/// Seal reason stamped on access-log entries; they are born sealed so
/// the fact that compliance looked is itself invisible to the family.
const ACCESS_SEAL_REASON: &str = "compliance-access";

/// Handles `get_sealed_audit_entries`.
pub(super) async fn handle_get_sealed(
    ctx: &OpsContext,
    caller: &CallerIdentity,
    input: GetSealedAuditEntries,
) -> Result<OpResponse, OpError> {
    let input = input.validate()?.into_inner();
    let actor = caller.require_compliance()?.to_string();

    let query = Query::new()
        .filter_eq("family_id", json!(input.family_id))
        .filter_eq("sealed", json!(true))
        .order_by_desc("timestamp");
    let docs = match ctx.store().query(Collection::AuditLog, &query).await {
        Ok(docs) => docs,
        Err(err) => return Err(ctx.internal(SEALED_READ_OPERATION, &err).await),
    };

    let mut entries: Vec<SealedEntryView> = docs
        .into_iter()
        .filter(|doc| in_range(doc, input.date_range.as_ref()))
        .filter(|doc| matches_action(doc, input.action_types.as_deref()))
        .map(|doc| SealedEntryView {
            integrity_verified: verify_fields(&doc.fields),
            fields: doc.fields,
        })
        .collect();
    if let Some(limit) = input.limit {
        entries.truncate(limit);
    }
    let count = entries.len();

    write_access_entry(ctx, &input, &actor, count).await?;

    info!(
        family_id = %input.family_id,
        accessed_by = %actor,
        count,
        "sealed audit entries read"
    );
    Ok(OpResponse::SealedEntries { entries, count })
}

/// Handles `get_family_audit_feed`.
pub(super) async fn handle_family_feed(
    ctx: &OpsContext,
    caller: &CallerIdentity,
    input: GetFamilyAuditFeed,
) -> Result<OpResponse, OpError> {
    let input = input.validate()?.into_inner();
    let uid = caller.require_uid()?.to_string();
    verify_family_member(ctx, &uid, &input.family_id).await?;

    let query = Query::new()
        .filter_eq("family_id", json!(input.family_id))
        .order_by_desc("timestamp");
    let docs = match ctx.store().query(Collection::FamilyAuditMirror, &query).await {
        Ok(docs) => docs,
        Err(err) => return Err(ctx.internal(FEED_OPERATION, &err).await),
    };

    // Sealed exclusion happens here rather than in the store filter:
    // an equality match on `sealed == false` would also drop mirror
    // entries written before the field existed, which are unsealed.
    let mut entries: Vec<_> = docs
        .into_iter()
        .filter(|doc| doc.bool_field("sealed") != Some(true))
        .map(|doc| doc.fields)
        .collect();
    if let Some(limit) = input.limit {
        entries.truncate(limit);
    }
    let count = entries.len();

    Ok(OpResponse::AuditFeed { entries, count })
}

fn in_range(doc: &Document, range: Option<&DateRange>) -> bool {
    let Some(range) = range else {
        return true;
    };
    let Some(timestamp) = doc
        .str_field("timestamp")
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
    else {
        // No parseable timestamp means membership in the range cannot
        // be established.
        return false;
    };
    range.start <= timestamp && timestamp <= range.end
}

fn matches_action(doc: &Document, action_types: Option<&[String]>) -> bool {
    let Some(action_types) = action_types else {
        return true;
    };
    doc.str_field("action")
        .is_some_and(|action| action_types.iter().any(|wanted| wanted == action))
}

/// The sealed access-log entry recording who read what and why.
async fn write_access_entry(
    ctx: &OpsContext,
    input: &GetSealedAuditEntries,
    actor: &str,
    count: usize,
) -> Result<(), OpError> {
    let mut builder = AuditEntryBuilder::new(
        "sealed-audit-access",
        "audit_query",
        &input.family_id,
        actor,
        &input.family_id,
    )
    .detail("justification", json!(input.justification))
    .detail("entry_count", json!(count));
    if let Some(action_types) = &input.action_types {
        builder = builder.detail("action_types", json!(action_types));
    }
    let entry = builder.sealed(actor, ACCESS_SEAL_REASON).finish();

    let mut batch = WriteBatch::new();
    batch.set(Collection::AuditLog, entry.id.clone(), entry.to_fields());
    if let Err(err) = ctx.store().commit(batch).await {
        return Err(ctx.internal(SEALED_READ_OPERATION, &err).await);
    }
    Ok(())
}
