/// Optimistic multi-document transactions.
///
/// A transaction is an ordered list of [`Op`]s, each pairing a target
/// document with an assertion about its current state and an effect to apply.
/// The whole list is submitted to the store as one atomic unit: if any
/// assertion fails at apply time nothing takes effect.
///
/// [`TxnRunner`] wraps that primitive with the retry policy competing
/// writers need: on rejection it asks the caller to rebuild the operations
/// from freshly read state and tries again, up to a configured bound, then
/// surfaces [`StateError::TransactionAborted`]. This is the sole mutation
/// path for every entity in the store; the only sanctioned direct write is
/// the store's precondition-free sequence counter.
use crate::error::{StateError, StateResult};
use crate::store::{ApplyError, DocumentStore};
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A precondition checked atomically against current state at apply time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assertion {
    /// No precondition.
    None,
    /// The document must exist.
    DocExists,
    /// The document must not exist.
    DocMissing,
    /// The named top-level field must equal the given value.
    FieldEquals(String, JsonValue),
}

/// The effect applied when every assertion in the batch holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Insert a new document. Implicitly requires the document to be missing.
    Insert(JsonValue),
    /// Replace an existing document's body. Implicitly requires it to exist.
    Update(JsonValue),
    /// Remove an existing document. Implicitly requires it to exist.
    Remove,
    /// Assert only; change nothing.
    Noop,
}

/// One conditional operation: target, assertion, effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Op {
    /// The collection holding the target document
    pub collection: String,
    /// The target document id (environment-prefixed)
    pub doc_id: String,
    /// Precondition on the target's current state
    pub assert: Assertion,
    /// Mutation applied if the whole batch's assertions hold
    pub effect: Effect,
}

impl Op {
    /// An insert guarded by "document missing at this key".
    pub fn insert(collection: impl Into<String>, doc_id: impl Into<String>, body: JsonValue) -> Self {
        Self {
            collection: collection.into(),
            doc_id: doc_id.into(),
            assert: Assertion::DocMissing,
            effect: Effect::Insert(body),
        }
    }

    /// An update guarded by "document exists".
    pub fn update(collection: impl Into<String>, doc_id: impl Into<String>, body: JsonValue) -> Self {
        Self {
            collection: collection.into(),
            doc_id: doc_id.into(),
            assert: Assertion::DocExists,
            effect: Effect::Update(body),
        }
    }

    /// A removal guarded by "document exists".
    pub fn remove(collection: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            doc_id: doc_id.into(),
            assert: Assertion::DocExists,
            effect: Effect::Remove,
        }
    }

    /// A pure assertion with no effect.
    pub fn assert(
        collection: impl Into<String>,
        doc_id: impl Into<String>,
        assert: Assertion,
    ) -> Self {
        Self {
            collection: collection.into(),
            doc_id: doc_id.into(),
            assert,
            effect: Effect::Noop,
        }
    }
}

/// Hook closures run around a single transaction attempt.
///
/// `before` runs after the operations are built but before they are applied,
/// so a test can mutate shared state to force a deterministic conflict;
/// `after` runs once the apply attempt (success or failure) returns. Hooks
/// are installed per-runner and consumed one pair per attempt.
#[derive(Default)]
pub struct TxnHooks {
    /// Runs just before the apply attempt.
    pub before: Option<Box<dyn FnMut() + Send>>,
    /// Runs just after the apply attempt.
    pub after: Option<Box<dyn FnMut() + Send>>,
}

impl TxnHooks {
    /// A hook pair that only runs something before the apply.
    pub fn before(hook: impl FnMut() + Send + 'static) -> Self {
        Self {
            before: Some(Box::new(hook)),
            after: None,
        }
    }

    /// A hook pair that only runs something after the apply.
    pub fn after(hook: impl FnMut() + Send + 'static) -> Self {
        Self {
            before: None,
            after: Some(Box::new(hook)),
        }
    }
}

impl std::fmt::Debug for TxnHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnHooks")
            .field("before", &self.before.is_some())
            .field("after", &self.after.is_some())
            .finish()
    }
}

/// Executes conditional operation batches with bounded retry.
#[derive(Debug)]
pub struct TxnRunner {
    store: Arc<DocumentStore>,
    max_retries: usize,
    hooks: Mutex<VecDeque<TxnHooks>>,
}

impl TxnRunner {
    /// Create a runner over the given store.
    ///
    /// `max_retries` bounds how many times a rejected transaction is rebuilt
    /// and re-applied after the first attempt.
    pub fn new(store: Arc<DocumentStore>, max_retries: usize) -> Self {
        Self {
            store,
            max_retries,
            hooks: Mutex::new(VecDeque::new()),
        }
    }

    /// The store this runner applies against.
    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    /// Install test hooks, one pair per upcoming attempt.
    ///
    /// Replaces any hooks not yet consumed.
    pub fn set_test_hooks(&self, hooks: Vec<TxnHooks>) {
        *self.hooks.lock().expect("hook queue poisoned") = hooks.into();
    }

    /// Run a transaction, rebuilding operations on each attempt.
    ///
    /// `build` is called with the attempt number (0 for the first try) and
    /// must return operations derived from freshly read state. Returning an
    /// empty list means there is nothing left to do and counts as success.
    /// The closure may also return an error to stop immediately — typically
    /// [`StateError::TransactionAborted`] once a re-read shows another
    /// writer already did the work.
    ///
    /// When every attempt is rejected by the store the runner returns
    /// [`StateError::TransactionAborted`]; the caller is expected to re-read
    /// state rather than assume anything about the outcome.
    pub fn run<F>(&self, mut build: F) -> StateResult<()>
    where
        F: FnMut(usize) -> StateResult<Vec<Op>>,
    {
        for attempt in 0..=self.max_retries {
            let ops = build(attempt)?;
            if ops.is_empty() {
                return Ok(());
            }

            let mut hooks = self
                .hooks
                .lock()
                .expect("hook queue poisoned")
                .pop_front()
                .unwrap_or_default();
            if let Some(before) = hooks.before.as_mut() {
                before();
            }
            let result = self.store.apply(&ops);
            if let Some(after) = hooks.after.as_mut() {
                after();
            }

            match result {
                Ok(()) => return Ok(()),
                Err(ApplyError::AssertionFailed { index }) => {
                    tracing::debug!(attempt, index, "transaction rejected, rebuilding");
                }
            }
        }

        tracing::warn!(
            max_retries = self.max_retries,
            "transaction retries exhausted"
        );
        Err(StateError::TransactionAborted)
    }

    /// Run a fixed operation list, retrying it unchanged on rejection.
    ///
    /// Useful where rebuilding cannot produce different operations; most
    /// callers should prefer [`run`](Self::run).
    pub fn run_ops(&self, ops: Vec<Op>) -> StateResult<()> {
        self.run(|_| Ok(ops.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn runner(max_retries: usize) -> TxnRunner {
        TxnRunner::new(Arc::new(DocumentStore::new()), max_retries)
    }

    #[test]
    fn test_run_applies_ops() {
        let runner = runner(3);
        runner
            .run_ops(vec![Op::insert("machines", "e:0", json!({"life": "alive"}))])
            .unwrap();
        assert!(runner.store().contains("machines", "e:0"));
    }

    #[test]
    fn test_empty_build_is_success() {
        let runner = runner(3);
        runner.run(|_| Ok(vec![])).unwrap();
    }

    #[test]
    fn test_retries_exhausted_surface_aborted() {
        let runner = runner(2);
        let attempts = AtomicUsize::new(0);

        // Asserting existence of a document nobody creates always rejects.
        let err = runner
            .run(|attempt| {
                attempts.fetch_add(1, Ordering::SeqCst);
                assert_eq!(attempt, attempts.load(Ordering::SeqCst) - 1);
                Ok(vec![Op::remove("machines", "e:0")])
            })
            .unwrap_err();

        assert!(matches!(err, StateError::TransactionAborted));
        assert_eq!(attempts.load(Ordering::SeqCst), 3, "1 try + 2 retries");
    }

    #[test]
    fn test_build_error_stops_immediately() {
        let runner = runner(5);
        let err = runner
            .run(|attempt| {
                if attempt == 0 {
                    Ok(vec![Op::remove("machines", "e:0")])
                } else {
                    // A rebuild observing "already done elsewhere" stops here.
                    Err(StateError::TransactionAborted)
                }
            })
            .unwrap_err();
        assert!(matches!(err, StateError::TransactionAborted));
    }

    #[test]
    fn test_rebuild_can_succeed_after_conflict() {
        let store = Arc::new(DocumentStore::new());
        let runner = TxnRunner::new(Arc::clone(&store), 3);
        store
            .apply(&[Op::insert("services", "e:mysql", json!({"life": "alive"}))])
            .unwrap();

        // First attempt carries a stale assertion; the rebuild reads the
        // actual value and succeeds.
        runner
            .run(|attempt| {
                let want = if attempt == 0 { "dying" } else { "alive" };
                Ok(vec![Op {
                    collection: "services".to_string(),
                    doc_id: "e:mysql".to_string(),
                    assert: Assertion::FieldEquals("life".to_string(), json!(want)),
                    effect: Effect::Update(json!({"life": "dying"})),
                }])
            })
            .unwrap();

        assert_eq!(store.get("services", "e:mysql").unwrap().body["life"], "dying");
    }

    #[test]
    fn test_before_hook_forces_deterministic_race() {
        let store = Arc::new(DocumentStore::new());
        let runner = TxnRunner::new(Arc::clone(&store), 1);

        // The hook slips in a competing insert between build and apply,
        // simulating another controller process winning the race.
        let racing_store = Arc::clone(&store);
        runner.set_test_hooks(vec![TxnHooks::before(move || {
            racing_store
                .apply(&[Op::insert("actionresults", "e:a_ar_1", json!({"writer": "other"}))])
                .unwrap();
        })]);

        let err = runner
            .run(|attempt| {
                if attempt > 0 && runner.store().contains("actionresults", "e:a_ar_1") {
                    // Someone else already finalized; do not retry the insert.
                    return Err(StateError::TransactionAborted);
                }
                Ok(vec![Op::insert(
                    "actionresults",
                    "e:a_ar_1",
                    json!({"writer": "me"}),
                )])
            })
            .unwrap_err();

        assert!(matches!(err, StateError::TransactionAborted));
        let doc = store.get("actionresults", "e:a_ar_1").unwrap();
        assert_eq!(doc.body["writer"], "other", "the race winner's doc survives");
    }

    #[test]
    fn test_hooks_consumed_one_pair_per_attempt() {
        let runner = runner(2);
        let before_runs = Arc::new(AtomicUsize::new(0));
        let after_runs = Arc::new(AtomicUsize::new(0));

        let b = Arc::clone(&before_runs);
        let a = Arc::clone(&after_runs);
        runner.set_test_hooks(vec![
            TxnHooks {
                before: Some(Box::new(move || {
                    b.fetch_add(1, Ordering::SeqCst);
                })),
                after: Some(Box::new(move || {
                    a.fetch_add(1, Ordering::SeqCst);
                })),
            },
            TxnHooks::before({
                let b = Arc::clone(&before_runs);
                move || {
                    b.fetch_add(1, Ordering::SeqCst);
                }
            }),
        ]);

        // Three attempts, two hook pairs: the third attempt runs bare.
        let _ = runner.run(|_| Ok(vec![Op::remove("machines", "e:0")]));
        assert_eq!(before_runs.load(Ordering::SeqCst), 2);
        assert_eq!(after_runs.load(Ordering::SeqCst), 1);
    }
}
