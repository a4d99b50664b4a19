//! haven-ops - Operation surface for the escape workflow.
//!
//! This crate is the boundary between callers and the storage engine in
//! `haven-core`. Every operation enters through [`dispatch`] as a typed
//! [`OpRequest`], runs under a [`CallerIdentity`], and leaves as a typed
//! [`OpResponse`]. Nothing here talks to a transport; embedding the
//! dispatcher behind HTTP, IPC, or a queue consumer is the caller's
//! business.
//!
//! # Architecture
//!
//! ```text
//! haven-ops/
//!     |-- identity.rs  - caller identity and capability checks
//!     |-- error.rs     - operation error taxonomy, internal-error reporting
//!     |-- inputs.rs    - request payloads and the validation witness
//!     |-- context.rs   - shared handler context (store, engines, config)
//!     |-- gate.rs      - escape request and family membership verification
//!     |-- referral.rs  - best-effort resource referral enqueue
//!     `-- handlers/    - one module per operation family, plus dispatch
//! ```
//!
//! # Authorization tiers
//!
//! Capabilities are deliberately not a lattice. Safety actions accept
//! safety-team or admin callers; unsealing accepts only legal-team
//! callers, admin explicitly excluded; sealed reads accept compliance or
//! legal. The checks live on [`CallerIdentity`] so no handler re-derives
//! them.
//!
//! # Error discipline
//!
//! Handlers return [`OpError`] for every refusal a caller can act on.
//! Unexpected faults never surface raw: they are written to the sealed
//! audit log and collapse to an opaque reference the caller can quote to
//! support. See [`error`] for the taxonomy.

pub mod context;
pub mod error;
mod gate;
pub mod handlers;
pub mod identity;
pub mod inputs;
mod referral;

pub use context::{OpsConfig, OpsContext};
pub use error::{ErrorKind, OpError};
pub use handlers::{dispatch, OpRequest, OpResponse, SealedEntryView};
pub use identity::{CallerIdentity, CapabilitySet};
pub use inputs::{
    DateRange, DisableLocationFeatures, EnableNotificationStealth, GetFamilyAuditFeed,
    GetSealedAuditEntries, ReviewEscapeRequest, SealEscapeAuditEntries, SeverParentAccess,
    SubmitEscapeRequest, UnsealAuditEntries, Valid, Validate,
};
