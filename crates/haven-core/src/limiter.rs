//! Rate limiting for anonymous escape-request submissions.
//!
//! Implements a sliding-window limiter keyed by a hashed caller
//! identifier. Unlike an in-process limiter, state lives in the backing
//! store so every handler instance shares one window; the read-filter-
//! append step runs inside a single-document transaction.
//!
//! # Configuration
//!
//! - `max_submissions`: submissions allowed per key within the window
//! - `window_secs`: size of the sliding window in seconds
//!
//! # Privacy
//!
//! Caller identifiers are hashed (SHA-256) before they touch the store.
//! The raw identifier is never persisted and never logged.
//!
//! # Failure posture
//!
//! This limiter **fails open**: if the store is unavailable the
//! submission is allowed. Blocking a victim's escape request on a
//! rate-limit bookkeeping fault is the worse outcome. The completion
//! tracker shares this posture; nothing else in the crate does.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::digest::hex_encode;
use crate::store::{Collection, DocumentStore, FieldMap, TxAction, TxOutcome};

/// Configuration for the submission limiter.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum submissions allowed per key within the window.
    pub max_submissions: usize,

    /// Size of the sliding window in seconds.
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            // 5 submissions per hour per caller. Generous for a real
            // victim retrying a flaky connection, tight enough to stop
            // scripted flooding of the triage queue.
            max_submissions: 5,
            window_secs: 3600,
        }
    }
}

/// Store-backed sliding-window limiter for anonymous submissions.
pub struct SubmissionLimiter {
    store: Arc<dyn DocumentStore>,
    config: RateLimitConfig,
}

impl SubmissionLimiter {
    /// Creates a limiter over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    /// Checks whether a submission from `caller_key` should be allowed,
    /// recording it if so.
    ///
    /// On first use for a key this creates the window record and
    /// allows. Afterwards it drops timestamps that fell out of the
    /// window, denies if the remainder is already at the limit, and
    /// otherwise appends the new timestamp. Denials write nothing.
    ///
    /// Storage errors allow the submission (fail open).
    pub async fn allow(&self, caller_key: &str) -> bool {
        let key = hash_key(caller_key);
        let now = Utc::now();
        let window = Duration::seconds(i64::try_from(self.config.window_secs).unwrap_or(i64::MAX));
        let cutoff = now - window;
        let max_submissions = self.config.max_submissions;

        let stored_key = key.clone();
        let outcome = self
            .store
            .transact(
                Collection::RateLimits,
                &key,
                Box::new(move |current| {
                    let mut recent = current.map_or_else(Vec::new, |f| recent_submissions(f, cutoff));
                    if recent.len() >= max_submissions {
                        return TxAction::Skip;
                    }
                    recent.push(now);

                    let mut fields = FieldMap::new();
                    fields.insert("key".to_string(), json!(stored_key));
                    fields.insert(
                        "submissions".to_string(),
                        Value::Array(
                            recent.iter().map(|t| json!(t.to_rfc3339())).collect(),
                        ),
                    );
                    TxAction::Write(fields)
                }),
            )
            .await;

        match outcome {
            Ok(TxOutcome::Written) => true,
            Ok(TxOutcome::Skipped) => {
                tracing::warn!(
                    max = self.config.max_submissions,
                    window_secs = self.config.window_secs,
                    "submission rate limit exceeded"
                );
                false
            },
            Err(error) => {
                tracing::warn!(%error, "rate limit store unavailable, failing open");
                true
            },
        }
    }
}

/// Hashes a caller identifier for storage.
fn hash_key(caller_key: &str) -> String {
    hex_encode(&Sha256::digest(caller_key.as_bytes()))
}

/// Timestamps inside the window, parsed leniently: entries that do not
/// parse are treated as expired and dropped.
fn recent_submissions(fields: &FieldMap, cutoff: DateTime<Utc>) -> Vec<DateTime<Utc>> {
    let Some(Value::Array(raw)) = fields.get("submissions") else {
        return Vec::new();
    };
    raw.iter()
        .filter_map(Value::as_str)
        .filter_map(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .filter(|t| *t > cutoff)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::{Document, Query, StoreError, TransactFn, WriteBatch};

    fn limiter_with(config: RateLimitConfig) -> (Arc<MemoryStore>, SubmissionLimiter) {
        let store = Arc::new(MemoryStore::new());
        let limiter = SubmissionLimiter::new(store.clone(), config);
        (store, limiter)
    }

    #[tokio::test]
    async fn first_submission_creates_record_and_allows() {
        let (store, limiter) = limiter_with(RateLimitConfig::default());

        assert!(limiter.allow("203.0.113.7").await);
        assert_eq!(store.len(Collection::RateLimits).await, 1);
    }

    #[tokio::test]
    async fn sixth_submission_in_window_is_denied() {
        let (_, limiter) = limiter_with(RateLimitConfig::default());

        for _ in 0..5 {
            assert!(limiter.allow("203.0.113.7").await);
        }
        assert!(!limiter.allow("203.0.113.7").await);
    }

    #[tokio::test]
    async fn keys_are_tracked_separately() {
        let (_, limiter) = limiter_with(RateLimitConfig {
            max_submissions: 2,
            ..RateLimitConfig::default()
        });

        assert!(limiter.allow("a").await);
        assert!(limiter.allow("a").await);
        assert!(!limiter.allow("a").await);

        assert!(limiter.allow("b").await);
        assert!(limiter.allow("b").await);
        assert!(!limiter.allow("b").await);
    }

    #[tokio::test]
    async fn expired_submissions_fall_out_of_the_window() {
        let (store, limiter) = limiter_with(RateLimitConfig {
            max_submissions: 2,
            window_secs: 3600,
        });

        // Seed a full record whose timestamps predate the window.
        let key = hash_key("203.0.113.7");
        let old = (Utc::now() - Duration::hours(2)).to_rfc3339();
        let mut fields = FieldMap::new();
        fields.insert("key".to_string(), json!(key));
        fields.insert("submissions".to_string(), json!([old, old]));
        store.insert(Collection::RateLimits, key.clone(), fields).await;

        assert!(limiter.allow("203.0.113.7").await);

        // The expired timestamps were filtered out of the record.
        let doc = store
            .get(Collection::RateLimits, &key)
            .await
            .unwrap()
            .unwrap();
        let submissions = doc.fields.get("submissions").unwrap().as_array().unwrap();
        assert_eq!(submissions.len(), 1);
    }

    #[tokio::test]
    async fn denial_writes_nothing() {
        let (store, limiter) = limiter_with(RateLimitConfig {
            max_submissions: 1,
            ..RateLimitConfig::default()
        });

        assert!(limiter.allow("x").await);
        let before = store
            .get(Collection::RateLimits, &hash_key("x"))
            .await
            .unwrap()
            .unwrap();

        assert!(!limiter.allow("x").await);
        let after = store
            .get(Collection::RateLimits, &hash_key("x"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(before.fields, after.fields);
    }

    #[tokio::test]
    async fn raw_caller_key_is_never_stored() {
        let (store, limiter) = limiter_with(RateLimitConfig::default());
        limiter.allow("198.51.100.23").await;

        assert!(store
            .get(Collection::RateLimits, "198.51.100.23")
            .await
            .unwrap()
            .is_none());
        let hashed = store
            .get(Collection::RateLimits, &hash_key("198.51.100.23"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hashed.str_field("key"), Some(hash_key("198.51.100.23").as_str()));
    }

    #[tokio::test]
    async fn malformed_record_is_treated_as_empty() {
        let (store, limiter) = limiter_with(RateLimitConfig {
            max_submissions: 1,
            ..RateLimitConfig::default()
        });

        let key = hash_key("m");
        let mut fields = FieldMap::new();
        fields.insert("submissions".to_string(), json!("not-an-array"));
        store.insert(Collection::RateLimits, key, fields).await;

        assert!(limiter.allow("m").await);
    }

    /// Store whose transactions always fail.
    struct BrokenStore;

    #[async_trait::async_trait]
    impl DocumentStore for BrokenStore {
        async fn get(&self, _: Collection, _: &str) -> Result<Option<Document>, StoreError> {
            Err(StoreError::Unavailable {
                message: "down".to_string(),
            })
        }

        async fn query(&self, _: Collection, _: &Query) -> Result<Vec<Document>, StoreError> {
            Err(StoreError::Unavailable {
                message: "down".to_string(),
            })
        }

        async fn count(&self, _: Collection, _: &Query) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable {
                message: "down".to_string(),
            })
        }

        async fn commit(&self, _: WriteBatch) -> Result<(), StoreError> {
            Err(StoreError::Unavailable {
                message: "down".to_string(),
            })
        }

        async fn transact(
            &self,
            _: Collection,
            _: &str,
            _: TransactFn,
        ) -> Result<TxOutcome, StoreError> {
            Err(StoreError::Unavailable {
                message: "down".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn store_failure_fails_open() {
        let limiter = SubmissionLimiter::new(Arc::new(BrokenStore), RateLimitConfig::default());
        assert!(limiter.allow("anyone").await);
    }
}
