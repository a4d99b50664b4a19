//! haven-core - Sealed audit and escape-propagation engine.
//!
//! This crate contains the storage-facing components of the escape
//! workflow for a shared-family safety product: tamper-evident integrity
//! digests for audit records, chunked batch writes against a document
//! store with a hard per-transaction operation ceiling, seal propagation
//! across escape-adjacent collections, escape-completion tracking, and
//! rate limiting of anonymous submissions.
//!
//! The operation surface (caller identity, input validation, the
//! verification gate, and the escape action handlers) lives in
//! `haven-ops`; this crate knows nothing about callers or requests.
//!
//! # Architecture
//!
//! ```text
//! haven-core/
//!     |-- digest.rs      - canonical field digests (SHA-256, tamper evidence)
//!     |-- store/         - document store boundary, in-memory store, chunker
//!     |-- records.rs     - audit entry and escape request record types
//!     |-- seal.rs        - seal propagation engine (seal / unseal cascade)
//!     |-- completion.rs  - escape-completion tracker (fail-open)
//!     `-- limiter.rs     - sliding-window submission limiter (fail-open)
//! ```
//!
//! # Failure posture
//!
//! Every component here fails closed except two, by deliberate policy:
//! the submission limiter and the completion tracker fail open on storage
//! errors, because blocking a victim's submission or resource referral on
//! a tracking-data fault is the worse outcome. Both call sites document
//! this exception.

pub mod completion;
pub mod digest;
pub mod limiter;
pub mod records;
pub mod seal;
pub mod store;

pub use completion::{is_escape_complete, request_complete};
pub use digest::{digest_fields, verify_fields};
pub use limiter::{RateLimitConfig, SubmissionLimiter};
pub use records::{
    AuditEntry, AuditEntryBuilder, EscapeAction, EscapeRequest, RequestStatus, Urgency,
    VerificationChecklist,
};
pub use seal::{
    EntryRef, SealEngine, SealError, SealOutcome, SealTargets, UnsealAuthorization, UnsealOutcome,
};
pub use store::chunk::{apply_in_chunks, ChunkedWriteError, ChunkedWriteOutcome};
pub use store::memory::MemoryStore;
pub use store::{
    BatchOp, Collection, Document, DocumentStore, FieldMap, Filter, Query, StoreError, WriteBatch,
    MAX_BATCH_OPS,
};
