//! Seal propagation across escape-adjacent collections.
//!
//! Sealing an escape means more than flipping one flag: device
//! commands, location history, notification queues, and audit mirrors
//! all hold records that would reveal the escape to the rest of the
//! family. The engine discovers those records, stamps them sealed via
//! the chunked writer, and logs the run as a sealed, integrity-hashed
//! summary entry of its own. Unsealing is the privileged inverse,
//! reserved for documented legal process.
//!
//! # Invariants
//!
//! - Sealing is idempotent per entry: the seal stamp is a set-style
//!   write, safe to repeat.
//! - Unsealing is deliberately not idempotent. Every entry must exist
//!   and be sealed before any write happens; a missing or already
//!   unsealed entry aborts the whole call naming the offender. Each
//!   unseal must correspond to exactly one authorized legal act.
//! - The manual seal path verifies every listed entry belongs to the
//!   request's family before mutating anything.
//! - Every run writes exactly one summary audit entry, itself sealed,
//!   carrying a fresh integrity digest.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::records::AuditEntryBuilder;
use crate::store::chunk::{apply_in_chunks, ChunkedWriteError};
use crate::store::{
    BatchOp, Collection, DocumentStore, FieldMap, Query, StoreError, WriteBatch, MAX_BATCH_OPS,
};

/// Family id stamped on compliance-owned summary entries that may span
/// several families, such as an unseal covering two households.
const COMPLIANCE_FAMILY: &str = "compliance";

/// One `{collection, id}` pair naming a sealable entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryRef {
    /// Collection the entry lives in.
    pub collection: Collection,
    /// Document id within that collection.
    pub id: String,
}

impl EntryRef {
    /// Builds a reference to one entry.
    #[must_use]
    pub fn new(collection: Collection, id: impl Into<String>) -> Self {
        Self {
            collection,
            id: id.into(),
        }
    }
}

/// The collections auto-discovery sweeps for escape-adjacent records.
#[derive(Debug, Clone)]
pub struct SealTargets {
    collections: Vec<Collection>,
}

impl Default for SealTargets {
    fn default() -> Self {
        Self {
            collections: vec![
                Collection::DeviceCommands,
                Collection::LocationHistory,
                Collection::NotificationQueue,
                Collection::FamilyAuditMirror,
                Collection::AuditLog,
            ],
        }
    }
}

impl SealTargets {
    /// Custom target list, swept in the given order.
    #[must_use]
    pub fn new(collections: impl IntoIterator<Item = Collection>) -> Self {
        Self {
            collections: collections.into_iter().collect(),
        }
    }

    /// The collections swept, in order.
    #[must_use]
    pub fn collections(&self) -> &[Collection] {
        &self.collections
    }
}

/// Outcome of one seal run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SealOutcome {
    /// Entries stamped across all collections.
    pub total_sealed: usize,
    /// Per-collection counts; collections with no matches are omitted.
    pub by_collection: BTreeMap<Collection, usize>,
}

/// Outcome of one unseal run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsealOutcome {
    /// Entries unsealed across all collections.
    pub unsealed: usize,
    /// Per-collection counts.
    pub by_collection: BTreeMap<Collection, usize>,
    /// Timestamp stamped onto every unsealed entry.
    pub unsealed_at: DateTime<Utc>,
}

/// Legal authorization accompanying an unseal call. Captured verbatim
/// in the sealed summary entry.
#[derive(Debug, Clone)]
pub struct UnsealAuthorization {
    /// Legal-team member performing the unseal.
    pub actor_id: String,
    /// Why this unseal is lawful.
    pub legal_justification: String,
    /// The compelling court order.
    pub court_order_reference: String,
    /// Court case number, when distinct from the order reference.
    pub case_number: Option<String>,
    /// Who asked for the records.
    pub requesting_party: Option<String>,
}

/// Errors from seal and unseal runs.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SealError {
    /// No escape request with the given id.
    #[error("escape request {request_id} not found")]
    RequestNotFound {
        request_id: String,
    },

    /// A manually listed entry does not belong to the request's family.
    /// Also raised when the entry carries no family tag at all, since
    /// its ownership cannot be verified.
    #[error("entry {collection}/{id} is outside the request's family")]
    FamilyMismatch {
        collection: Collection,
        id: String,
    },

    /// An entry named for unsealing (or manual sealing) does not exist.
    #[error("entry {collection}/{id} not found")]
    EntryNotFound {
        collection: Collection,
        id: String,
    },

    /// An entry named for unsealing is not currently sealed.
    #[error("entry {collection}/{id} is not sealed")]
    EntryNotSealed {
        collection: Collection,
        id: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Chunked(#[from] ChunkedWriteError),
}

/// Discovers, seals, and unseals escape-adjacent records.
pub struct SealEngine {
    store: Arc<dyn DocumentStore>,
    targets: SealTargets,
}

impl SealEngine {
    /// Creates an engine sweeping the given target collections.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, targets: SealTargets) -> Self {
        Self { store, targets }
    }

    /// Seals every record tagged with `request_id` across the target
    /// collections (auto-discovery path).
    ///
    /// Queries are additionally scoped to `family_id`, so a mistagged
    /// record from another household is never touched. Each collection
    /// is stamped through the chunked writer; one sealed summary entry
    /// records the whole run.
    ///
    /// # Errors
    ///
    /// [`SealError::RequestNotFound`] when the request does not exist,
    /// plus store and chunked-write failures.
    pub async fn seal_for_request(
        &self,
        request_id: &str,
        family_id: &str,
        actor_id: &str,
        reason: &str,
        seal_reason: &str,
    ) -> Result<SealOutcome, SealError> {
        self.require_request(request_id).await?;

        let stamp = seal_stamp(actor_id, seal_reason, request_id);
        let mut outcome = SealOutcome::default();

        for &collection in self.targets.collections() {
            let query = Query::new()
                .filter_eq("safety_request_id", json!(request_id))
                .filter_eq("family_id", json!(family_id));
            let docs = self.store.query(collection, &query).await?;
            if docs.is_empty() {
                continue;
            }

            let ops: Vec<BatchOp> = docs
                .into_iter()
                .map(|doc| BatchOp::Update {
                    collection,
                    id: doc.id,
                    fields: stamp.clone(),
                })
                .collect();
            let applied = apply_in_chunks(self.store.as_ref(), ops, MAX_BATCH_OPS).await?;

            outcome.total_sealed += applied.total_applied;
            outcome.by_collection.insert(collection, applied.total_applied);
        }

        tracing::info!(
            request_id,
            total_sealed = outcome.total_sealed,
            "sealed escape-adjacent records"
        );
        self.write_seal_summary(request_id, family_id, actor_id, reason, seal_reason, &outcome)
            .await?;
        Ok(outcome)
    }

    /// Seals an explicit list of entries (manual path, used for
    /// retroactive sealing).
    ///
    /// Every entry is fetched and its `family_id` checked against the
    /// request's family before any write; a missing or foreign entry
    /// rejects the whole call with nothing mutated.
    ///
    /// # Errors
    ///
    /// [`SealError::RequestNotFound`], [`SealError::EntryNotFound`],
    /// [`SealError::FamilyMismatch`], plus store and chunked-write
    /// failures.
    pub async fn seal_entries(
        &self,
        entries: &[EntryRef],
        request_id: &str,
        family_id: &str,
        actor_id: &str,
        reason: &str,
        seal_reason: &str,
    ) -> Result<SealOutcome, SealError> {
        self.require_request(request_id).await?;

        // Verify every entry before touching any of them.
        for entry in entries {
            let doc = self
                .store
                .get(entry.collection, &entry.id)
                .await?
                .ok_or_else(|| SealError::EntryNotFound {
                    collection: entry.collection,
                    id: entry.id.clone(),
                })?;
            if doc.str_field("family_id") != Some(family_id) {
                return Err(SealError::FamilyMismatch {
                    collection: entry.collection,
                    id: entry.id.clone(),
                });
            }
        }

        let stamp = seal_stamp(actor_id, seal_reason, request_id);
        let mut outcome = SealOutcome::default();
        for (collection, group) in group_by_collection(entries) {
            let ops: Vec<BatchOp> = group
                .into_iter()
                .map(|id| BatchOp::Update {
                    collection,
                    id,
                    fields: stamp.clone(),
                })
                .collect();
            let applied = apply_in_chunks(self.store.as_ref(), ops, MAX_BATCH_OPS).await?;
            outcome.total_sealed += applied.total_applied;
            outcome.by_collection.insert(collection, applied.total_applied);
        }

        tracing::info!(
            request_id,
            total_sealed = outcome.total_sealed,
            "sealed explicitly listed records"
        );
        self.write_seal_summary(request_id, family_id, actor_id, reason, seal_reason, &outcome)
            .await?;
        Ok(outcome)
    }

    /// Unseals an explicit list of entries under legal authorization.
    ///
    /// Phase one verifies every entry exists and is sealed; any
    /// offender aborts the call before a single write. Phase two stamps
    /// the entries unsealed in chunked batches. Phase three writes the
    /// sealed summary entry carrying the distinct family ids touched
    /// and the full legal justification.
    ///
    /// # Errors
    ///
    /// [`SealError::EntryNotFound`] or [`SealError::EntryNotSealed`]
    /// naming the offending entry, plus store and chunked-write
    /// failures.
    pub async fn unseal(
        &self,
        entries: &[EntryRef],
        authorization: &UnsealAuthorization,
    ) -> Result<UnsealOutcome, SealError> {
        let mut families = BTreeSet::new();
        for entry in entries {
            let doc = self
                .store
                .get(entry.collection, &entry.id)
                .await?
                .ok_or_else(|| SealError::EntryNotFound {
                    collection: entry.collection,
                    id: entry.id.clone(),
                })?;
            if doc.bool_field("sealed") != Some(true) {
                return Err(SealError::EntryNotSealed {
                    collection: entry.collection,
                    id: entry.id.clone(),
                });
            }
            if let Some(family_id) = doc.str_field("family_id") {
                families.insert(family_id.to_string());
            }
        }

        let unsealed_at = Utc::now();
        let mut stamp = FieldMap::new();
        stamp.insert("sealed".to_string(), json!(false));
        stamp.insert("unsealed_at".to_string(), json!(unsealed_at.to_rfc3339()));
        stamp.insert("unsealed_by".to_string(), json!(authorization.actor_id));

        let mut unsealed = 0usize;
        let mut by_collection = BTreeMap::new();
        for (collection, group) in group_by_collection(entries) {
            let ops: Vec<BatchOp> = group
                .into_iter()
                .map(|id| BatchOp::Update {
                    collection,
                    id,
                    fields: stamp.clone(),
                })
                .collect();
            let applied = apply_in_chunks(self.store.as_ref(), ops, MAX_BATCH_OPS).await?;
            unsealed += applied.total_applied;
            by_collection.insert(collection, applied.total_applied);
        }

        tracing::info!(
            unsealed,
            court_order = %authorization.court_order_reference,
            "unsealed records under legal authorization"
        );
        self.write_unseal_summary(authorization, unsealed, &by_collection, &families)
            .await?;

        Ok(UnsealOutcome {
            unsealed,
            by_collection,
            unsealed_at,
        })
    }

    async fn require_request(&self, request_id: &str) -> Result<(), SealError> {
        self.store
            .get(Collection::SafetyRequests, request_id)
            .await?
            .map(|_| ())
            .ok_or_else(|| SealError::RequestNotFound {
                request_id: request_id.to_string(),
            })
    }

    /// Writes the sealed summary entry for one seal run.
    async fn write_seal_summary(
        &self,
        request_id: &str,
        family_id: &str,
        actor_id: &str,
        reason: &str,
        seal_reason: &str,
        outcome: &SealOutcome,
    ) -> Result<(), SealError> {
        let entry = AuditEntryBuilder::new(
            "audit-seal",
            "safety_request",
            request_id,
            actor_id,
            family_id,
        )
        .safety_request_id(request_id)
        .detail("total_sealed", json!(outcome.total_sealed))
        .detail(
            "by_collection",
            collection_counts_json(&outcome.by_collection),
        )
        .detail("reason", json!(reason))
        .sealed(actor_id, seal_reason)
        .finish();

        let mut batch = WriteBatch::new();
        batch.set(Collection::AuditLog, entry.id.clone(), entry.to_fields());
        self.store.commit(batch).await?;
        Ok(())
    }

    /// Writes the sealed summary entry for one unseal run.
    async fn write_unseal_summary(
        &self,
        authorization: &UnsealAuthorization,
        unsealed: usize,
        by_collection: &BTreeMap<Collection, usize>,
        families: &BTreeSet<String>,
    ) -> Result<(), SealError> {
        let mut builder = AuditEntryBuilder::new(
            "audit-unseal",
            "audit_entries",
            &authorization.court_order_reference,
            &authorization.actor_id,
            COMPLIANCE_FAMILY,
        )
        .detail("unsealed", json!(unsealed))
        .detail("by_collection", collection_counts_json(by_collection))
        .detail(
            "family_ids",
            Value::Array(families.iter().map(|f| json!(f)).collect()),
        )
        .detail(
            "legal_justification",
            json!(authorization.legal_justification),
        )
        .detail(
            "court_order_reference",
            json!(authorization.court_order_reference),
        );
        if let Some(case_number) = &authorization.case_number {
            builder = builder.detail("case_number", json!(case_number));
        }
        if let Some(party) = &authorization.requesting_party {
            builder = builder.detail("requesting_party", json!(party));
        }
        let entry = builder
            .sealed(&authorization.actor_id, "legal unseal record")
            .finish();

        let mut batch = WriteBatch::new();
        batch.set(Collection::AuditLog, entry.id.clone(), entry.to_fields());
        self.store.commit(batch).await?;
        Ok(())
    }
}

/// Field stamp applied to every entry a seal run touches. The write is
/// set-style, so repeating it is safe.
fn seal_stamp(actor_id: &str, seal_reason: &str, request_id: &str) -> FieldMap {
    let mut stamp = FieldMap::new();
    stamp.insert("sealed".to_string(), json!(true));
    stamp.insert("sealed_at".to_string(), json!(Utc::now().to_rfc3339()));
    stamp.insert("sealed_by".to_string(), json!(actor_id));
    stamp.insert("seal_reason".to_string(), json!(seal_reason));
    stamp.insert("safety_request_id".to_string(), json!(request_id));
    stamp
}

fn group_by_collection(entries: &[EntryRef]) -> BTreeMap<Collection, Vec<String>> {
    let mut groups: BTreeMap<Collection, Vec<String>> = BTreeMap::new();
    for entry in entries {
        groups
            .entry(entry.collection)
            .or_default()
            .push(entry.id.clone());
    }
    groups
}

fn collection_counts_json(counts: &BTreeMap<Collection, usize>) -> Value {
    Value::Object(
        counts
            .iter()
            .map(|(collection, n)| (collection.as_str().to_string(), json!(n)))
            .collect(),
    )
}
