/// The underlying replicated document store, as seen from this layer.
///
/// Concord builds application-level atomicity and notification on top of a
/// replicated document store with two native capabilities:
///
/// - **Conditional multi-document apply**: a batch of assert-then-effect
///   operations is accepted or rejected as a whole
/// - **Tailable change feed**: a stream of per-document change events keyed
///   by collection and document id
///
/// [`DocumentStore`] is the in-process realization of that contract. The
/// document map is a DashMap for lock-free concurrent reads; a single commit
/// lock serializes applies so that assertion checks and effects are atomic
/// across the whole batch. Events are emitted on a broadcast channel while
/// the commit lock is held, so the feed observes mutations in commit order.
use crate::error::StateResult;
use crate::txn::{Assertion, Effect, Op};
use dashmap::DashMap;
use serde_json::Value as JsonValue;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;

/// Capacity of the raw change feed.
///
/// A subscriber that falls more than this many events behind is lagged and
/// must re-synchronize by direct read.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A fully-qualified document key: collection plus document id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocKey {
    /// The collection (e.g. "actions", "actionresults")
    pub collection: String,
    /// The document id within the collection
    pub id: String,
}

impl DocKey {
    /// Create a new fully-qualified document key.
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

/// A stored document: its id, revision number, and JSON body.
///
/// The revision number increments on every mutation of the document and
/// backs optimistic field-level assertions and test observation of
/// "unchanged".
#[derive(Debug, Clone)]
pub struct Document {
    /// The document id (environment-prefixed)
    pub id: String,
    /// Revision number, starting at 1 on insert
    pub revno: i64,
    /// The document body
    pub body: JsonValue,
}

/// The kind of change a store event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreChange {
    /// The document was inserted or updated.
    Put,
    /// The document was removed.
    Removed,
}

/// A raw change event from the store's feed.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    /// The collection affected
    pub collection: String,
    /// The document id affected (environment-prefixed)
    pub id: String,
    /// Whether the document is now present or gone
    pub change: StoreChange,
    /// The document's revision after the change (0 for removals)
    pub revno: i64,
}

/// Rejection of a conditional apply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// An assertion did not hold against current state; nothing was applied.
    #[error("assertion failed for operation {index}")]
    AssertionFailed {
        /// Index of the first failing operation in the batch
        index: usize,
    },
}

/// In-process document store with conditional apply and a change feed.
///
/// Multiple controller handles may share one store (via `Arc`); correctness
/// of competing writers relies entirely on [`apply`](Self::apply)'s
/// assert-then-effect semantics, never on external locking.
#[derive(Debug)]
pub struct DocumentStore {
    /// All documents, keyed by (collection, id)
    documents: DashMap<DocKey, Document>,
    /// Named monotonic counters, updated outside the transactional path
    sequences: DashMap<String, u64>,
    /// Serializes conditional applies; reads stay lock-free
    commit_lock: Mutex<()>,
    /// Raw change feed
    events: broadcast::Sender<StoreEvent>,
}

impl DocumentStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            documents: DashMap::new(),
            sequences: DashMap::new(),
            commit_lock: Mutex::new(()),
            events,
        }
    }

    /// Subscribe to the raw change feed.
    ///
    /// Events are observed in commit order. A receiver that lags behind the
    /// channel capacity loses its place and must treat the stream as
    /// terminated.
    pub fn events(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Apply a batch of conditional operations atomically.
    ///
    /// All assertions are evaluated against current state first; if any
    /// fails, the whole batch is rejected without partial effect. Otherwise
    /// every effect is applied and one event per effectful operation is
    /// emitted on the change feed.
    pub fn apply(&self, ops: &[Op]) -> Result<(), ApplyError> {
        let _commit = self.commit_lock.lock().expect("commit lock poisoned");

        // Check phase: every assertion, and each effect's implicit
        // precondition, must hold before anything changes.
        for (index, op) in ops.iter().enumerate() {
            let key = DocKey::new(&op.collection, &op.doc_id);
            let doc = self.documents.get(&key);
            let holds = match &op.assert {
                Assertion::None => true,
                Assertion::DocExists => doc.is_some(),
                Assertion::DocMissing => doc.is_none(),
                Assertion::FieldEquals(field, want) => match &doc {
                    Some(doc) => doc.body.get(field) == Some(want),
                    None => false,
                },
            };
            let effect_ok = match &op.effect {
                Effect::Insert(_) => doc.is_none(),
                Effect::Update(_) | Effect::Remove => doc.is_some(),
                Effect::Noop => true,
            };
            if !holds || !effect_ok {
                return Err(ApplyError::AssertionFailed { index });
            }
        }

        // Effect phase: cannot fail after the check phase passed.
        for op in ops {
            let key = DocKey::new(&op.collection, &op.doc_id);
            match &op.effect {
                Effect::Insert(body) => {
                    self.documents.insert(
                        key,
                        Document {
                            id: op.doc_id.clone(),
                            revno: 1,
                            body: body.clone(),
                        },
                    );
                    self.emit(op, StoreChange::Put, 1);
                }
                Effect::Update(body) => {
                    let revno = {
                        let mut doc = self.documents.get_mut(&key).expect("checked above");
                        doc.body = body.clone();
                        doc.revno += 1;
                        doc.revno
                    };
                    self.emit(op, StoreChange::Put, revno);
                }
                Effect::Remove => {
                    self.documents.remove(&key);
                    self.emit(op, StoreChange::Removed, 0);
                }
                Effect::Noop => {}
            }
        }

        Ok(())
    }

    fn emit(&self, op: &Op, change: StoreChange, revno: i64) {
        // Send errors just mean nobody is listening.
        let _ = self.events.send(StoreEvent {
            collection: op.collection.clone(),
            id: op.doc_id.clone(),
            change,
            revno,
        });
    }

    /// Get the current document at (collection, id), if any.
    pub fn get(&self, collection: &str, id: &str) -> Option<Document> {
        self.documents
            .get(&DocKey::new(collection, id))
            .map(|doc| doc.clone())
    }

    /// Check whether a document exists.
    pub fn contains(&self, collection: &str, id: &str) -> bool {
        self.documents.contains_key(&DocKey::new(collection, id))
    }

    /// Range lookup: all documents in a collection whose id starts with the
    /// given prefix, sorted by id.
    pub fn scan_prefix(&self, collection: &str, prefix: &str) -> Vec<Document> {
        let mut docs: Vec<Document> = self
            .documents
            .iter()
            .filter(|entry| entry.key().collection == collection && entry.key().id.starts_with(prefix))
            .map(|entry| entry.value().clone())
            .collect();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        docs
    }

    /// Number of documents in a collection.
    pub fn collection_len(&self, collection: &str) -> usize {
        self.documents
            .iter()
            .filter(|entry| entry.key().collection == collection)
            .count()
    }

    /// Advance and return a named sequence counter.
    ///
    /// This is the sanctioned non-transactional write: a strictly
    /// single-document, precondition-free increment. It never conflicts and
    /// never appears on the change feed.
    pub fn next_sequence(&self, name: &str) -> u64 {
        let mut entry = self.sequences.entry(name.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Deserialize a document body into a typed doc, mapping failure to
    /// [`StateError::Serialization`](crate::StateError::Serialization).
    pub fn decode<T: serde::de::DeserializeOwned>(doc: &Document) -> StateResult<T> {
        Ok(serde_json::from_value(doc.body.clone())?)
    }
}

impl Default for DocumentStore {
    fn default() -> Self {
        Self::new()
    }
}
