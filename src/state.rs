/// The state handle: typed entity accessors over the shared store.
///
/// A [`State`] is one controller process's view of one environment inside
/// the shared document store. Many handles — in one process or many — may
/// point at the same store; there is no lock between them. Every mutation
/// goes through the transaction runner's conditional apply, and every
/// notification comes off the store's change feed through a watcher.
///
/// # Example
///
/// ```ignore
/// use concord::{State, StateConfig, ActionStatus};
/// use serde_json::{json, Map};
///
/// let state = State::open(StateConfig::default());
///
/// let mut parameters = Map::new();
/// parameters.insert("force".to_string(), json!(true));
/// let action = state.add_action("unit-mysql-0", "restart", parameters)?;
///
/// let result = state.finalize_action(&action, ActionStatus::Completed, Map::new(), "")?;
/// assert_eq!(result.status(), ActionStatus::Completed);
/// ```
use crate::actions::{
    action_id, action_prefix, add_action_op, Action, ActionDoc, ActionStatus, ACTIONS_COLLECTION,
};
use crate::actionresult::{
    action_result_id, action_result_prefix, new_action_result_doc, ActionResult, ActionResultDoc,
    ACTION_RESULTS_COLLECTION, RESULT_MARKER,
};
use crate::error::{StateError, StateResult};
use crate::ids::EnvIds;
use crate::store::DocumentStore;
use crate::tag::is_valid_receiver;
use crate::txn::{Op, TxnRunner};
use crate::watcher::{ChangeWatcher, WatchParams, WatcherHub};
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Construction-time policy for a [`State`] handle.
///
/// The retry bound and tick interval are policy, not contract; tests and
/// deployments tune them here instead of through process-wide knobs.
#[derive(Debug, Clone)]
pub struct StateConfig {
    /// The environment UUID this handle is scoped to.
    pub env_uuid: String,
    /// How many times a rejected transaction is rebuilt and retried.
    pub max_txn_retries: usize,
    /// Cadence at which watchers deliver coalesced changesets.
    pub watcher_tick_interval: Duration,
}

impl StateConfig {
    /// Config for a freshly generated environment.
    pub fn new() -> Self {
        Self::for_env(Uuid::new_v4().to_string())
    }

    /// Config for an existing environment UUID.
    pub fn for_env(env_uuid: impl Into<String>) -> Self {
        Self {
            env_uuid: env_uuid.into(),
            max_txn_retries: 3,
            watcher_tick_interval: Duration::from_millis(50),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// One controller's handle onto one environment in the shared store.
///
/// Cheap to clone; clones share the store, runner and watcher hub.
#[derive(Debug, Clone)]
pub struct State {
    ids: EnvIds,
    store: Arc<DocumentStore>,
    runner: Arc<TxnRunner>,
    watchers: WatcherHub,
}

impl State {
    /// Open a state handle over a fresh, private store.
    pub fn open(config: StateConfig) -> Self {
        Self::open_shared(config, Arc::new(DocumentStore::new()))
    }

    /// Open a state handle over an existing store.
    ///
    /// This is how a second controller process (or a test simulating one)
    /// attaches to the same shared state.
    pub fn open_shared(config: StateConfig, store: Arc<DocumentStore>) -> Self {
        let ids = EnvIds::new(config.env_uuid.clone());
        let runner = Arc::new(TxnRunner::new(Arc::clone(&store), config.max_txn_retries));
        let watchers = WatcherHub::new(
            Arc::clone(&store),
            ids.clone(),
            config.watcher_tick_interval,
        );
        Self {
            ids,
            store,
            runner,
            watchers,
        }
    }

    /// The environment UUID this handle is scoped to.
    pub fn env_uuid(&self) -> &str {
        self.ids.env_uuid()
    }

    /// The identifier scheme for this environment.
    pub fn ids(&self) -> &EnvIds {
        &self.ids
    }

    /// The shared store underneath this handle.
    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    /// The transaction runner (exposed for test hook installation).
    pub fn runner(&self) -> &Arc<TxnRunner> {
        &self.runner
    }

    /// Derive the globally unique document key for a local key.
    pub fn doc_id(&self, local: &str) -> String {
        self.ids.doc_id(local)
    }

    /// Strip this environment's prefix from a document key.
    pub fn local_id(&self, doc_id: &str) -> String {
        self.ids.local_id(doc_id)
    }

    /// Strip this environment's prefix, failing on a foreign or bare key.
    pub fn strict_local_id(&self, doc_id: &str) -> StateResult<String> {
        self.ids.strict_local_id(doc_id)
    }

    /// Enqueue a new action for a receiver.
    ///
    /// The action starts pending: the document exists and no result does.
    pub fn add_action(
        &self,
        receiver: &str,
        name: &str,
        parameters: Map<String, JsonValue>,
    ) -> StateResult<Action> {
        if !is_valid_receiver(receiver) {
            return Err(StateError::InvalidData {
                reason: format!("invalid action receiver '{receiver}'"),
            });
        }

        let uuid = Uuid::new_v4().to_string();
        let doc = ActionDoc {
            doc_id: self.doc_id(&action_id(receiver, &uuid)),
            env_uuid: self.env_uuid().to_string(),
            receiver: receiver.to_string(),
            uuid,
            name: name.to_string(),
            parameters,
        };

        self.runner.run_ops(vec![add_action_op(&doc)?])?;
        tracing::debug!(receiver, name, uuid = %doc.uuid, "action enqueued");
        Ok(Action::new(doc))
    }

    /// Fetch a pending action by local id.
    pub fn action(&self, local_id: &str) -> StateResult<Action> {
        let doc = self
            .store
            .get(ACTIONS_COLLECTION, &self.doc_id(local_id))
            .ok_or_else(|| StateError::NotFound {
                collection: ACTIONS_COLLECTION.to_string(),
                key: local_id.to_string(),
            })?;
        Ok(Action::new(DocumentStore::decode(&doc)?))
    }

    /// All pending actions for a receiver, ordered by id.
    pub fn actions_for_receiver(&self, receiver: &str) -> StateResult<Vec<Action>> {
        self.store
            .scan_prefix(ACTIONS_COLLECTION, &self.doc_id(&action_prefix(receiver)))
            .iter()
            .map(|doc| Ok(Action::new(DocumentStore::decode(doc)?)))
            .collect()
    }

    /// Consume an action, producing its single terminal result.
    ///
    /// The result is inserted with a missing-document assertion on a key
    /// derived deterministically from the action's key, and the action
    /// document is removed in the same transaction. When two processes race
    /// to finalize one action, exactly one insert succeeds; the loser gets
    /// [`StateError::TransactionAborted`] and must re-read the
    /// now-existing result rather than retry.
    pub fn finalize_action(
        &self,
        action: &Action,
        status: ActionStatus,
        results: Map<String, JsonValue>,
        message: impl Into<String>,
    ) -> StateResult<ActionResult> {
        if !status.is_terminal() {
            return Err(StateError::InvalidData {
                reason: format!("cannot finalize an action with status '{status}'"),
            });
        }

        let action_local = action.id(&self.ids);
        let sequence = self.result_count_for_action(&action_local) as u64 + 1;
        let doc = new_action_result_doc(action, &self.ids, status, results, message.into(), sequence);
        let action_doc_id = self.doc_id(&action_local);

        let body = serde_json::to_value(&doc)?;
        self.runner.run(|attempt| {
            if attempt > 0 {
                let finalized_elsewhere = self
                    .store
                    .contains(ACTION_RESULTS_COLLECTION, &doc.doc_id)
                    || !self.store.contains(ACTIONS_COLLECTION, &action_doc_id);
                if finalized_elsewhere {
                    // Re-reading, not blind-retrying: the caller must fetch
                    // the winner's result.
                    return Err(StateError::TransactionAborted);
                }
            }
            Ok(vec![
                Op::insert(ACTION_RESULTS_COLLECTION, &doc.doc_id, body.clone()),
                Op::remove(ACTIONS_COLLECTION, &action_doc_id),
            ])
        })?;

        tracing::debug!(
            receiver = action.receiver(),
            uuid = action.uuid(),
            %status,
            "action finalized"
        );
        Ok(ActionResult::new(doc))
    }

    fn result_count_for_action(&self, action_local: &str) -> usize {
        let prefix = self.doc_id(&format!("{action_local}{RESULT_MARKER}"));
        self.store
            .scan_prefix(ACTION_RESULTS_COLLECTION, &prefix)
            .len()
    }

    /// Fetch an action result by local id.
    pub fn action_result(&self, local_id: &str) -> StateResult<ActionResult> {
        let doc = self
            .store
            .get(ACTION_RESULTS_COLLECTION, &self.doc_id(local_id))
            .ok_or_else(|| StateError::NotFound {
                collection: ACTION_RESULTS_COLLECTION.to_string(),
                key: local_id.to_string(),
            })?;
        Ok(ActionResult::new(DocumentStore::decode::<ActionResultDoc>(
            &doc,
        )?))
    }

    /// The result of a specific action, if it has been finalized.
    pub fn result_for_action(&self, action_local_id: &str) -> StateResult<ActionResult> {
        self.action_result(&action_result_id(action_local_id, 1))
    }

    /// All results for a receiver, ordered by id (range lookup by prefix,
    /// no secondary index).
    pub fn action_results_for_receiver(&self, receiver: &str) -> StateResult<Vec<ActionResult>> {
        self.store
            .scan_prefix(
                ACTION_RESULTS_COLLECTION,
                &self.doc_id(&action_result_prefix(receiver)),
            )
            .iter()
            .filter(|doc| doc.id.contains(RESULT_MARKER))
            .map(|doc| {
                Ok(ActionResult::new(
                    DocumentStore::decode::<ActionResultDoc>(doc)?,
                ))
            })
            .collect()
    }

    /// Register a subscription on any collection.
    ///
    /// Must be called from within a tokio runtime.
    pub fn watch_collection(&self, params: WatchParams) -> ChangeWatcher {
        self.watchers.watch(params)
    }

    /// Watch for actions enqueued for any of the given receivers.
    pub fn watch_actions_for(&self, receivers: &[&str]) -> ChangeWatcher {
        let prefixes: Vec<String> = receivers.iter().map(|r| action_prefix(r)).collect();
        self.watch_collection(
            WatchParams::collection(ACTIONS_COLLECTION)
                .with_marker(crate::actions::ACTION_MARKER)
                .with_filter(move |id| prefixes.iter().any(|p| id.starts_with(p.as_str()))),
        )
    }

    /// Watch for results appearing for any of the given receivers.
    ///
    /// The fine filter narrows to the receivers' result prefixes; the coarse
    /// marker keeps non-result keys out of the pending set entirely.
    pub fn watch_action_results_for(&self, receivers: &[&str]) -> ChangeWatcher {
        let prefixes: Vec<String> = receivers.iter().map(|r| action_result_prefix(r)).collect();
        self.watch_collection(
            WatchParams::collection(ACTION_RESULTS_COLLECTION)
                .with_marker(RESULT_MARKER)
                .with_filter(move |id| prefixes.iter().any(|p| id.starts_with(p.as_str()))),
        )
    }
}
