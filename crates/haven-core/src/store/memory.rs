//! In-memory document store.
//!
//! Backs tests and local tooling with the same boundary semantics the
//! production store provides: atomic batch commits up to the operation
//! ceiling, equality-filter queries, and single-document transactions.
//! State lives behind one async `RwLock`; a commit holds the write lock
//! for its whole batch, which is what makes the batch atomic here.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde_json::Value;
use tokio::sync::RwLock;

use super::{
    BatchOp, Collection, Document, DocumentStore, FieldMap, Filter, Query, SortOrder, StoreError,
    TransactFn, TxAction, TxOutcome, WriteBatch, MAX_BATCH_OPS,
};

/// In-memory [`DocumentStore`] implementation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: RwLock<BTreeMap<(Collection, String), FieldMap>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a document directly, bypassing batch bookkeeping. Intended
    /// for seeding fixtures.
    pub async fn insert(&self, collection: Collection, id: impl Into<String>, fields: FieldMap) {
        self.docs.write().await.insert((collection, id.into()), fields);
    }

    /// Number of documents currently in a collection.
    pub async fn len(&self, collection: Collection) -> usize {
        self.docs
            .read()
            .await
            .range(collection_range(collection))
            .count()
    }
}

/// Key range covering every document of one collection.
fn collection_range(
    collection: Collection,
) -> std::ops::RangeInclusive<(Collection, String)> {
    // '\u{10FFFF}' sorts after every valid document id.
    (collection, String::new())..=(collection, "\u{10FFFF}".to_string())
}

/// Total order over JSON values for `order_by`. Mirrors the backing
/// store's index ordering: null < bool < number < string < array <
/// object.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

fn matches(fields: &FieldMap, filters: &[Filter]) -> bool {
    filters.iter().all(|f| match f {
        Filter::Eq { field, value } => fields.get(field) == Some(value),
    })
}

fn apply_op(docs: &mut BTreeMap<(Collection, String), FieldMap>, op: BatchOp) {
    match op {
        BatchOp::Set {
            collection,
            id,
            fields,
        } => {
            docs.insert((collection, id), fields);
        },
        BatchOp::Update {
            collection,
            id,
            fields,
        } => {
            let entry = docs.entry((collection, id)).or_default();
            for (k, v) in fields {
                entry.insert(k, v);
            }
        },
        BatchOp::Delete { collection, id } => {
            docs.remove(&(collection, id));
        },
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>, StoreError> {
        let docs = self.docs.read().await;
        Ok(docs.get(&(collection, id.to_string())).map(|fields| Document {
            id: id.to_string(),
            fields: fields.clone(),
        }))
    }

    async fn query(
        &self,
        collection: Collection,
        query: &Query,
    ) -> Result<Vec<Document>, StoreError> {
        let docs = self.docs.read().await;
        let mut hits: Vec<Document> = docs
            .range(collection_range(collection))
            .filter(|(_, fields)| matches(fields, &query.filters))
            .map(|((_, id), fields)| Document {
                id: id.clone(),
                fields: fields.clone(),
            })
            .collect();

        if let Some((field, order)) = &query.order_by {
            hits.sort_by(|a, b| {
                let av = a.fields.get(field).unwrap_or(&Value::Null);
                let bv = b.fields.get(field).unwrap_or(&Value::Null);
                let ord = compare_values(av, bv);
                match order {
                    SortOrder::Asc => ord,
                    SortOrder::Desc => ord.reverse(),
                }
            });
        }

        let hits = hits.into_iter().skip(query.offset);
        Ok(match query.limit {
            Some(limit) => hits.take(limit).collect(),
            None => hits.collect(),
        })
    }

    async fn count(&self, collection: Collection, query: &Query) -> Result<u64, StoreError> {
        let docs = self.docs.read().await;
        let n = docs
            .range(collection_range(collection))
            .filter(|(_, fields)| matches(fields, &query.filters))
            .count();
        Ok(n as u64)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if batch.len() > MAX_BATCH_OPS {
            return Err(StoreError::BatchTooLarge {
                size: batch.len(),
                max: MAX_BATCH_OPS,
            });
        }

        // Holding the write lock across the whole batch is what makes
        // the commit atomic with respect to readers.
        let mut docs = self.docs.write().await;
        for op in batch.into_ops() {
            apply_op(&mut docs, op);
        }
        Ok(())
    }

    async fn transact(
        &self,
        collection: Collection,
        id: &str,
        f: TransactFn,
    ) -> Result<TxOutcome, StoreError> {
        let mut docs = self.docs.write().await;
        let key = (collection, id.to_string());
        let current = docs.get(&key);
        match f(current) {
            TxAction::Write(fields) => {
                docs.insert(key, fields);
                Ok(TxOutcome::Written)
            },
            TxAction::Skip => Ok(TxOutcome::Skipped),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};

    use super::*;

    fn doc(pairs: &[(&str, Value)]) -> FieldMap {
        let mut map = Map::new();
        for (k, v) in pairs {
            map.insert((*k).to_string(), v.clone());
        }
        map
    }

    #[tokio::test]
    async fn get_returns_inserted_document() {
        let store = MemoryStore::new();
        store
            .insert(Collection::Users, "u1", doc(&[("family_id", json!("f1"))]))
            .await;

        let found = store.get(Collection::Users, "u1").await.unwrap().unwrap();
        assert_eq!(found.str_field("family_id"), Some("f1"));
        assert!(store.get(Collection::Users, "u2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn query_applies_filters_order_and_window() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .insert(
                    Collection::AuditLog,
                    format!("e{i}"),
                    doc(&[("family_id", json!("f1")), ("seq", json!(i))]),
                )
                .await;
        }
        store
            .insert(
                Collection::AuditLog,
                "other",
                doc(&[("family_id", json!("f2")), ("seq", json!(99))]),
            )
            .await;

        let query = Query::new()
            .filter_eq("family_id", json!("f1"))
            .order_by_desc("seq")
            .offset(1)
            .limit(2);
        let hits = store.query(Collection::AuditLog, &query).await.unwrap();

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "e3");
        assert_eq!(hits[1].id, "e2");
    }

    #[tokio::test]
    async fn count_ignores_limit_and_offset() {
        let store = MemoryStore::new();
        for i in 0..4 {
            store
                .insert(
                    Collection::AuditLog,
                    format!("e{i}"),
                    doc(&[("sealed", json!(true))]),
                )
                .await;
        }

        let query = Query::new().filter_eq("sealed", json!(true)).limit(1);
        assert_eq!(store.count(Collection::AuditLog, &query).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn commit_applies_set_update_delete() {
        let store = MemoryStore::new();
        store
            .insert(
                Collection::Users,
                "u1",
                doc(&[("a", json!(1)), ("b", json!(2))]),
            )
            .await;
        store
            .insert(Collection::Users, "u2", doc(&[("a", json!(1))]))
            .await;

        let mut batch = WriteBatch::new();
        batch.set(Collection::Users, "u1", doc(&[("a", json!(9))]));
        batch.update(Collection::Users, "u2", doc(&[("b", json!(5))]));
        batch.delete(Collection::Users, "u3");
        store.commit(batch).await.unwrap();

        let u1 = store.get(Collection::Users, "u1").await.unwrap().unwrap();
        // Set replaces the whole document.
        assert_eq!(u1.fields.get("b"), None);
        assert_eq!(u1.fields.get("a"), Some(&json!(9)));

        let u2 = store.get(Collection::Users, "u2").await.unwrap().unwrap();
        // Update merges into the existing document.
        assert_eq!(u2.fields.get("a"), Some(&json!(1)));
        assert_eq!(u2.fields.get("b"), Some(&json!(5)));
    }

    #[tokio::test]
    async fn commit_rejects_oversized_batch() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        for i in 0..=MAX_BATCH_OPS {
            batch.set(Collection::AuditLog, format!("e{i}"), Map::new());
        }

        let err = store.commit(batch).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::BatchTooLarge { size, max }
                if size == MAX_BATCH_OPS + 1 && max == MAX_BATCH_OPS
        ));
        // Nothing from the rejected batch was applied.
        assert_eq!(store.len(Collection::AuditLog).await, 0);
    }

    #[tokio::test]
    async fn transact_write_and_skip() {
        let store = MemoryStore::new();
        store
            .insert(Collection::ReferralQueue, "req-1", doc(&[("sent", json!(true))]))
            .await;

        // Existing document: the closure sees it and skips.
        let outcome = store
            .transact(
                Collection::ReferralQueue,
                "req-1",
                Box::new(|current| {
                    assert!(current.is_some());
                    TxAction::Skip
                }),
            )
            .await
            .unwrap();
        assert_eq!(outcome, TxOutcome::Skipped);

        // Absent document: the closure writes it.
        let outcome = store
            .transact(
                Collection::ReferralQueue,
                "req-2",
                Box::new(|current| {
                    assert!(current.is_none());
                    TxAction::Write(doc(&[("sent", json!(true))]))
                }),
            )
            .await
            .unwrap();
        assert_eq!(outcome, TxOutcome::Written);
        assert!(store
            .get(Collection::ReferralQueue, "req-2")
            .await
            .unwrap()
            .is_some());
    }
}
