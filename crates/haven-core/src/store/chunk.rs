//! Chunked bulk mutation.
//!
//! The store boundary caps one atomic commit at [`MAX_BATCH_OPS`]
//! operations. Larger mutations are split into sequential commits of at
//! most that size. Each chunk is atomic on its own; the sequence as a
//! whole is not. On failure the error reports exactly how many
//! operations landed, so a caller can surface the partial state instead
//! of guessing at it.
//!
//! # Invariants
//!
//! - Chunks commit in input order. A failure at chunk `k` means every
//!   operation before it is durable and nothing at or after it was
//!   attempted.
//! - The chunk size is clamped to `1..=MAX_BATCH_OPS` so no commit can
//!   trip the boundary's own ceiling.

use thiserror::Error;

use super::{BatchOp, DocumentStore, StoreError, WriteBatch, MAX_BATCH_OPS};

/// Result of a fully applied chunked write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedWriteOutcome {
    /// Operations applied across all chunks.
    pub total_applied: usize,
    /// Number of commits issued.
    pub commits: usize,
}

/// A chunked write that stopped partway.
///
/// The first `applied` operations are durable; the rest were never
/// attempted.
#[derive(Debug, Error)]
#[error("chunked write stopped after {applied} ops in {commits} commits: {source}")]
pub struct ChunkedWriteError {
    /// Operations durably applied before the failing chunk.
    pub applied: usize,
    /// Commits that succeeded before the failure.
    pub commits: usize,
    /// Error from the failing commit.
    #[source]
    pub source: StoreError,
}

/// Applies `ops` as sequential atomic commits of at most `chunk_size`
/// operations each.
///
/// # Errors
///
/// Returns [`ChunkedWriteError`] if any commit fails; the error records
/// how much of the prefix is durable.
pub async fn apply_in_chunks(
    store: &dyn DocumentStore,
    ops: Vec<BatchOp>,
    chunk_size: usize,
) -> Result<ChunkedWriteOutcome, ChunkedWriteError> {
    let chunk_size = chunk_size.clamp(1, MAX_BATCH_OPS);

    let mut applied = 0usize;
    let mut commits = 0usize;
    let mut ops = ops.into_iter().peekable();

    while ops.peek().is_some() {
        let batch: WriteBatch = ops.by_ref().take(chunk_size).collect();
        let batch_len = batch.len();

        if let Err(source) = store.commit(batch).await {
            return Err(ChunkedWriteError {
                applied,
                commits,
                source,
            });
        }
        applied += batch_len;
        commits += 1;
    }

    Ok(ChunkedWriteOutcome {
        total_applied: applied,
        commits,
    })
}
