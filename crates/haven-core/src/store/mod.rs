//! Document store boundary.
//!
//! The engine treats its database as an external document store offering
//! get/query/count, atomic batch commits with a hard per-batch operation
//! ceiling, and a single-document transactional read-then-write. This
//! module defines that boundary as a trait plus the value types that
//! cross it; [`memory::MemoryStore`] is the in-process implementation
//! used by tests and local tooling.
//!
//! # Collections
//!
//! Collection names are a closed enum, not free-form strings. Components
//! that operate "across related collections" (the seal propagation
//! engine in particular) hold a typed table of [`Collection`] values
//! resolved at construction, so a typo cannot silently address a
//! nonexistent collection.
//!
//! # Consistency model
//!
//! Ordering guarantees are per document. A [`WriteBatch`] of at most
//! [`MAX_BATCH_OPS`] operations commits atomically; nothing larger is
//! atomic (see [`chunk`]). [`DocumentStore::transact`] provides a
//! read-then-write on one document and nothing more. There are no locks;
//! callers stay safe under concurrent invocation by writing fixed values
//! rather than increments.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub mod chunk;
pub mod memory;

/// Hard per-batch operation ceiling imposed by the backing store.
///
/// A [`WriteBatch`] holding more operations than this is rejected by
/// [`DocumentStore::commit`]; bulk callers go through
/// [`chunk::apply_in_chunks`] instead.
pub const MAX_BATCH_OPS: usize = 500;

/// Field map of one stored document.
pub type FieldMap = serde_json::Map<String, Value>;

/// The closed set of collections the engine touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    /// Escape requests submitted by (possibly anonymous) victims.
    SafetyRequests,
    /// Primary audit log; sealed entries are readable only through the
    /// compliance gateway.
    AuditLog,
    /// Family-visible mirror of audit activity; the surface ordinary
    /// family members query.
    FamilyAuditMirror,
    /// Device-level enforcement command log.
    DeviceCommands,
    /// Historical location tracking records.
    LocationHistory,
    /// Queued, not-yet-delivered notifications.
    NotificationQueue,
    /// Resource-referral dispatch ledger, keyed by request id for
    /// duplicate suppression.
    ReferralQueue,
    /// User records: family membership, guardians, feature flags.
    Users,
    /// Sliding-window submission counters keyed by hashed caller id.
    RateLimits,
}

impl Collection {
    /// Storage-level name of the collection.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SafetyRequests => "safety_requests",
            Self::AuditLog => "audit_log",
            Self::FamilyAuditMirror => "family_audit_mirror",
            Self::DeviceCommands => "device_commands",
            Self::LocationHistory => "location_history",
            Self::NotificationQueue => "notification_queue",
            Self::ReferralQueue => "referral_queue",
            Self::Users => "users",
            Self::RateLimits => "rate_limits",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stored document: its id plus its fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Document id, unique within its collection.
    pub id: String,
    /// The document's fields.
    pub fields: FieldMap,
}

impl Document {
    /// Convenience accessor for a string field.
    #[must_use]
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// Convenience accessor for a bool field.
    #[must_use]
    pub fn bool_field(&self, name: &str) -> Option<bool> {
        self.fields.get(name).and_then(Value::as_bool)
    }
}

/// A single query predicate. The store supports equality matches only;
/// range and membership filtering happen in the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Field equals the given value exactly.
    Eq {
        /// Field name.
        field: String,
        /// Value to match.
        value: Value,
    },
}

/// Sort direction for [`Query::order_by`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Ascending field order.
    Asc,
    /// Descending field order.
    Desc,
}

/// A query against one collection: conjunctive equality filters plus
/// optional ordering and windowing.
#[derive(Debug, Clone, Default)]
pub struct Query {
    /// Filters, all of which must match.
    pub filters: Vec<Filter>,
    /// Optional field to order results by.
    pub order_by: Option<(String, SortOrder)>,
    /// Maximum number of documents to return.
    pub limit: Option<usize>,
    /// Number of matching documents to skip.
    pub offset: usize,
}

impl Query {
    /// Creates an empty query matching every document in a collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an equality filter.
    #[must_use]
    pub fn filter_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    /// Orders results ascending by the given field.
    #[must_use]
    pub fn order_by_asc(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some((field.into(), SortOrder::Asc));
        self
    }

    /// Orders results descending by the given field.
    #[must_use]
    pub fn order_by_desc(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some((field.into(), SortOrder::Desc));
        self
    }

    /// Caps the number of returned documents.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skips the first `offset` matching documents.
    #[must_use]
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// One mutation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    /// Writes the document, replacing any existing fields.
    Set {
        /// Target collection.
        collection: Collection,
        /// Document id.
        id: String,
        /// Full replacement field map.
        fields: FieldMap,
    },
    /// Merges the given fields into the document, creating it if absent.
    /// Existing fields not named here are left untouched.
    Update {
        /// Target collection.
        collection: Collection,
        /// Document id.
        id: String,
        /// Fields to merge; a `null` value clears the field's content
        /// while keeping the field present.
        fields: FieldMap,
    },
    /// Deletes the document if it exists.
    Delete {
        /// Target collection.
        collection: Collection,
        /// Document id.
        id: String,
    },
}

/// An atomic group of mutations, capped at [`MAX_BATCH_OPS`].
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a full-document set.
    pub fn set(&mut self, collection: Collection, id: impl Into<String>, fields: FieldMap) {
        self.ops.push(BatchOp::Set {
            collection,
            id: id.into(),
            fields,
        });
    }

    /// Queues a merge update.
    pub fn update(&mut self, collection: Collection, id: impl Into<String>, fields: FieldMap) {
        self.ops.push(BatchOp::Update {
            collection,
            id: id.into(),
            fields,
        });
    }

    /// Queues a delete.
    pub fn delete(&mut self, collection: Collection, id: impl Into<String>) {
        self.ops.push(BatchOp::Delete {
            collection,
            id: id.into(),
        });
    }

    /// Queues an already-built operation.
    pub fn push(&mut self, op: BatchOp) {
        self.ops.push(op);
    }

    /// Number of queued operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Consumes the batch, returning its operations.
    #[must_use]
    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

impl FromIterator<BatchOp> for WriteBatch {
    fn from_iter<I: IntoIterator<Item = BatchOp>>(iter: I) -> Self {
        Self {
            ops: iter.into_iter().collect(),
        }
    }
}

/// Decision returned by a [`DocumentStore::transact`] closure.
#[derive(Debug, Clone, PartialEq)]
pub enum TxAction {
    /// Write the given fields as the document's new content.
    Write(FieldMap),
    /// Leave the document untouched.
    Skip,
}

/// Outcome of a single-document transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    /// The closure chose to write and the write was applied.
    Written,
    /// The closure chose to leave the document as it was.
    Skipped,
}

/// Read-then-write closure run inside a single-document transaction.
/// Receives the document's current fields (`None` if absent).
pub type TransactFn = Box<dyn FnOnce(Option<&FieldMap>) -> TxAction + Send>;

/// Errors surfaced by the store boundary.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The store could not be reached or the call failed mid-flight.
    #[error("store unavailable: {message}")]
    Unavailable {
        /// Backend-specific description; never contains record content.
        message: String,
    },

    /// A batch exceeded the per-transaction operation ceiling.
    #[error("batch of {size} operations exceeds the ceiling of {max}")]
    BatchTooLarge {
        /// Number of operations in the rejected batch.
        size: usize,
        /// The ceiling that was exceeded.
        max: usize,
    },

    /// A stored document could not be decoded into the expected shape.
    #[error("malformed document in {collection}: {message}")]
    Malformed {
        /// Collection holding the document.
        collection: Collection,
        /// What failed to decode; never contains field values.
        message: String,
    },
}

/// The asynchronous document store boundary.
///
/// Every method suspends at the underlying store call. Implementations
/// must apply a committed batch atomically and must reject batches above
/// [`MAX_BATCH_OPS`] with [`StoreError::BatchTooLarge`].
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetches one document by id.
    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>, StoreError>;

    /// Runs a query against one collection.
    async fn query(&self, collection: Collection, query: &Query)
        -> Result<Vec<Document>, StoreError>;

    /// Counts the documents a query would return, ignoring limit/offset.
    async fn count(&self, collection: Collection, query: &Query) -> Result<u64, StoreError>;

    /// Commits a batch atomically.
    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;

    /// Runs a read-then-write transaction on a single document. The
    /// closure sees the current fields and decides whether to replace
    /// them; no other document can be touched.
    async fn transact(
        &self,
        collection: Collection,
        id: &str,
        f: TransactFn,
    ) -> Result<TxOutcome, StoreError>;
}
