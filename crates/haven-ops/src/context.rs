//! Shared state threaded through every operation handler.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use haven_core::limiter::{RateLimitConfig, SubmissionLimiter};
use haven_core::seal::{SealEngine, SealError, SealTargets};
use haven_core::store::DocumentStore;

use crate::error::{report_internal, OpError};

/// Tunables for the operation layer.
#[derive(Debug, Clone)]
pub struct OpsConfig {
    /// Anonymous-submission rate limit.
    pub rate_limit: RateLimitConfig,
    /// Collections the seal engine propagates across.
    pub seal_targets: SealTargets,
    /// Lifetime of the device commands issued by location disable.
    /// Commands a device has not picked up by then are void.
    pub device_command_ttl: Duration,
}

impl Default for OpsConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            seal_targets: SealTargets::default(),
            // One day. Long enough for an offline phone to check in,
            // short enough that a stale command cannot fire weeks later.
            device_command_ttl: Duration::from_secs(86_400),
        }
    }
}

/// Store handle plus the engines every handler shares.
pub struct OpsContext {
    store: Arc<dyn DocumentStore>,
    seal: SealEngine,
    limiter: SubmissionLimiter,
    config: OpsConfig,
}

impl OpsContext {
    /// Builds a context, wiring the engines to the given store.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, config: OpsConfig) -> Self {
        let seal = SealEngine::new(Arc::clone(&store), config.seal_targets.clone());
        let limiter = SubmissionLimiter::new(Arc::clone(&store), config.rate_limit.clone());
        Self {
            store,
            seal,
            limiter,
            config,
        }
    }

    /// The backing document store.
    #[must_use]
    pub fn store(&self) -> &dyn DocumentStore {
        self.store.as_ref()
    }

    /// The shared seal engine.
    #[must_use]
    pub fn seal(&self) -> &SealEngine {
        &self.seal
    }

    /// The shared submission limiter.
    #[must_use]
    pub fn limiter(&self) -> &SubmissionLimiter {
        &self.limiter
    }

    /// The tunables this context was built with.
    #[must_use]
    pub fn config(&self) -> &OpsConfig {
        &self.config
    }

    /// Records an internal failure and returns the opaque error the
    /// caller is allowed to see.
    pub(crate) async fn internal(
        &self,
        operation: &'static str,
        detail: &dyn fmt::Display,
    ) -> OpError {
        report_internal(self.store(), operation, detail).await
    }
}

/// Maps seal-engine failures onto the caller-visible taxonomy.
///
/// Missing and not-sealed entries are both reported as not-found so a
/// caller probing ids cannot distinguish "never existed" from "exists
/// but is not sealed". Store-level failures become opaque internal
/// references.
pub(crate) async fn map_seal_error(
    ctx: &OpsContext,
    operation: &'static str,
    err: SealError,
) -> OpError {
    match err {
        SealError::RequestNotFound { .. } => {
            OpError::NotFound("escape request not found".to_string())
        },
        SealError::EntryNotFound { collection, id } | SealError::EntryNotSealed { collection, id } => {
            OpError::NotFound(format!("entry {collection}/{id} not found or not sealed"))
        },
        SealError::FamilyMismatch { collection, id } => OpError::FailedPrecondition(format!(
            "entry {collection}/{id} does not belong to this request's family"
        )),
        other => ctx.internal(operation, &other).await,
    }
}
