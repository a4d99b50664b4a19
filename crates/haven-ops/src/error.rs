//! Operation error taxonomy.
//!
//! Every error a caller can see is one of six synchronous kinds with a
//! generic, non-identifying message, or an opaque internal-error
//! reference. Messages never echo caller-supplied reason or
//! justification text, and never name identifiers beyond what the
//! caller already supplied.
//!
//! Unexpected internal failures follow a split path: a random reference
//! id is generated, only the id and the operation name reach standard
//! logs, and the full error detail is written to the sealed audit
//! collection where compliance alone can read it. The caller receives
//! "internal error" plus the reference.

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use haven_core::records::AuditEntryBuilder;
use haven_core::store::{Collection, DocumentStore, WriteBatch};

/// Wire-visible error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// No caller identity.
    Unauthenticated,
    /// Role or ownership check failed.
    PermissionDenied,
    /// Schema or shape violation, including length minimums.
    InvalidArgument,
    /// Missing request, entry, or user; also an unseal target that is
    /// not sealed.
    NotFound,
    /// Request not yet reviewed, feature not enabled, or cross-family
    /// mismatch.
    FailedPrecondition,
    /// Rate limit hit.
    ResourceExhausted,
    /// Unexpected failure; the message carries an opaque reference.
    Internal,
}

impl ErrorKind {
    /// Stable wire name for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::PermissionDenied => "permission-denied",
            Self::InvalidArgument => "invalid-argument",
            Self::NotFound => "not-found",
            Self::FailedPrecondition => "failed-precondition",
            Self::ResourceExhausted => "resource-exhausted",
            Self::Internal => "internal",
        }
    }
}

/// An operation failure returned to the caller.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OpError {
    /// The operation needs a caller uid and none was presented.
    #[error("authentication required")]
    Unauthenticated,

    /// Deliberately message-free: the same error covers a failed role
    /// check and a target the caller may not learn exists.
    #[error("permission denied")]
    PermissionDenied,

    /// The input failed boundary validation; the message names the
    /// violated rule.
    #[error("{0}")]
    InvalidArgument(String),

    /// The named request, entry, or user does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The target exists but is not in a state that permits this
    /// operation.
    #[error("{0}")]
    FailedPrecondition(String),

    /// The submission rate limit was hit.
    #[error("rate limit exceeded, try again later")]
    ResourceExhausted,

    /// Unexpected failure. The full detail lives in a sealed audit
    /// entry, not here.
    #[error("internal error, reference {reference}")]
    Internal {
        /// Opaque id correlating the response with the sealed detail
        /// record.
        reference: String,
    },
}

impl OpError {
    /// The wire kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthenticated => ErrorKind::Unauthenticated,
            Self::PermissionDenied => ErrorKind::PermissionDenied,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::FailedPrecondition(_) => ErrorKind::FailedPrecondition,
            Self::ResourceExhausted => ErrorKind::ResourceExhausted,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }
}

/// Records an unexpected failure and returns the caller-facing error.
///
/// Standard logs get only the reference, the operation name, and the
/// kind. The full detail goes into a sealed audit entry; if even that
/// write fails, the detail is dropped rather than logged, and the
/// reference still correlates the response with the log line.
pub async fn report_internal(
    store: &dyn DocumentStore,
    operation: &'static str,
    detail: &dyn std::fmt::Display,
) -> OpError {
    let reference = Uuid::new_v4().to_string();
    tracing::error!(%reference, operation, kind = "internal", "operation failed");

    let entry = AuditEntryBuilder::new("internal-error", "operation", operation, "system", "compliance")
        .detail("reference", json!(reference))
        .detail("error", json!(detail.to_string()))
        .sealed("system", "internal error detail")
        .finish();
    let mut batch = WriteBatch::new();
    batch.set(Collection::AuditLog, entry.id.clone(), entry.to_fields());
    if store.commit(batch).await.is_err() {
        tracing::error!(%reference, operation, "failed to record internal error detail");
    }

    OpError::Internal { reference }
}
