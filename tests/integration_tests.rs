/// Integration tests for Concord.
///
/// These exercise the full stack: identifier scheme, transaction runner,
/// entity accessors and watchers, including the multi-writer scenarios the
/// layer exists for (two controller handles racing over one shared store).
use concord::{
    Action, ActionStatus, DocumentStore, State, StateConfig, StateError, TxnHooks,
};
use serde_json::{json, Map, Value as JsonValue};
use std::sync::Arc;
use std::thread;
use tokio::time::{timeout, Duration};

const WAIT: Duration = Duration::from_secs(5);

fn parameters(pairs: &[(&str, JsonValue)]) -> Map<String, JsonValue> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

fn fast_config() -> StateConfig {
    init_tracing();
    let mut config = StateConfig::new();
    config.watcher_tick_interval = Duration::from_millis(10);
    config
}

#[test]
fn test_enqueue_finalize_lookup_scenario() {
    let state = State::open(StateConfig::default());

    let action = state
        .add_action("unit-mysql-0", "restart", parameters(&[("force", json!(true))]))
        .unwrap();
    assert_eq!(action.status(), ActionStatus::Pending);
    assert_eq!(action.parameters()["force"], json!(true));

    state
        .finalize_action(
            &action,
            ActionStatus::Completed,
            parameters(&[("exit-code", json!(0))]),
            "",
        )
        .unwrap();

    // Receiver-prefixed lookup returns exactly one result.
    let results = state.action_results_for_receiver("unit-mysql-0").unwrap();
    assert_eq!(results.len(), 1);
    let result = &results[0];

    assert_eq!(result.status(), ActionStatus::Completed);
    let (map, message) = result.results();
    assert_eq!(map["exit-code"], json!(0));
    assert_eq!(message, "");
    assert_eq!(result.name(), "restart");
    assert_eq!(result.parameters()["force"], json!(true));
    assert_eq!(result.completed().timestamp_subsec_nanos(), 0);

    // The derived tag is valid and carries the receiver.
    assert!(result.validate_tag());
    let tag = result.action_tag().unwrap();
    assert_eq!(tag.receiver(), "unit-mysql-0");
    assert_eq!(tag.uuid().to_string(), result.uuid());
}

#[test]
fn test_concurrent_finalize_exactly_one_result() {
    init_tracing();
    let store = Arc::new(DocumentStore::new());
    let config = StateConfig::new();
    let state = State::open_shared(config.clone(), Arc::clone(&store));

    let action = state
        .add_action("unit-mysql-0", "restart", Map::new())
        .unwrap();

    // Two controller processes race to finalize the same action.
    let spawn_finalizer = |action: Action| {
        let config = config.clone();
        let store = Arc::clone(&store);
        thread::spawn(move || {
            let state = State::open_shared(config, store);
            state.finalize_action(&action, ActionStatus::Completed, Map::new(), "")
        })
    };
    let first = spawn_finalizer(action.clone());
    let second = spawn_finalizer(action.clone());

    let outcomes = [first.join().unwrap(), second.join().unwrap()];
    let wins = outcomes.iter().filter(|o| o.is_ok()).count();
    assert_eq!(wins, 1, "exactly one finalize may win");

    let loss = outcomes.iter().find(|o| o.is_err()).unwrap();
    assert!(matches!(
        loss.as_ref().unwrap_err(),
        StateError::TransactionAborted
    ));

    // The loser re-reads rather than retrying: one result, winner's status.
    let results = state.action_results_for_receiver("unit-mysql-0").unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status(), ActionStatus::Completed);
    let local = action.id(state.ids());
    assert_eq!(
        state.result_for_action(&local).unwrap().status(),
        ActionStatus::Completed
    );
}

#[test]
fn test_hooked_race_is_deterministic() {
    let store = Arc::new(DocumentStore::new());
    let config = StateConfig::new();
    let loser = State::open_shared(config.clone(), Arc::clone(&store));
    let winner = State::open_shared(config, Arc::clone(&store));

    let action = loser
        .add_action("unit-mysql-0", "restart", Map::new())
        .unwrap();

    // Between the loser building its transaction and applying it, the other
    // controller finalizes the action.
    let racing_action = action.clone();
    loser.runner().set_test_hooks(vec![TxnHooks::before(move || {
        winner
            .finalize_action(&racing_action, ActionStatus::Cancelled, Map::new(), "shutdown")
            .unwrap();
    })]);

    let err = loser
        .finalize_action(&action, ActionStatus::Completed, Map::new(), "")
        .unwrap_err();
    assert!(matches!(err, StateError::TransactionAborted));

    let local = action.id(loser.ids());
    let result = loser.result_for_action(&local).unwrap();
    assert_eq!(result.status(), ActionStatus::Cancelled);
    let (_, message) = result.results();
    assert_eq!(message, "shutdown");
}

#[test]
fn test_environments_are_isolated_in_one_store() {
    let store = Arc::new(DocumentStore::new());
    let env_a = State::open_shared(StateConfig::new(), Arc::clone(&store));
    let env_b = State::open_shared(StateConfig::new(), Arc::clone(&store));

    let action_a = env_a
        .add_action("unit-mysql-0", "restart", Map::new())
        .unwrap();
    env_b
        .add_action("unit-mysql-0", "restart", Map::new())
        .unwrap();

    // Same receiver, same collection, disjoint environments.
    assert_eq!(env_a.actions_for_receiver("unit-mysql-0").unwrap().len(), 1);
    assert_eq!(env_b.actions_for_receiver("unit-mysql-0").unwrap().len(), 1);

    env_a
        .finalize_action(&action_a, ActionStatus::Completed, Map::new(), "")
        .unwrap();
    assert_eq!(
        env_a.action_results_for_receiver("unit-mysql-0").unwrap().len(),
        1
    );
    assert!(env_b
        .action_results_for_receiver("unit-mysql-0")
        .unwrap()
        .is_empty());

    // Handing one environment's key to the other is a programming error.
    let foreign_key = env_a.doc_id(&action_a.id(env_a.ids()));
    assert!(matches!(
        env_b.strict_local_id(&foreign_key),
        Err(StateError::ScopeMismatch { .. })
    ));
}

#[tokio::test]
async fn test_watcher_observes_finalization() {
    let state = State::open(fast_config());
    let mut watcher = state.watch_action_results_for(&["unit-mysql-0"]);

    let action = state
        .add_action("unit-mysql-0", "restart", Map::new())
        .unwrap();
    state
        .finalize_action(
            &action,
            ActionStatus::Completed,
            parameters(&[("exit-code", json!(0))]),
            "",
        )
        .unwrap();

    let changes = timeout(WAIT, watcher.recv()).await.unwrap().unwrap().unwrap();
    assert_eq!(changes.len(), 1);
    let local = action.id(state.ids());
    assert_eq!(changes[0].id, format!("{local}_ar_1"));
    assert!(changes[0].present);

    // A subscriber reacting to the changeset reads the result directly.
    let result = state.action_result(&changes[0].id).unwrap();
    assert_eq!(result.status(), ActionStatus::Completed);
    watcher.stop();
}

#[tokio::test]
async fn test_watcher_filters_by_receiver() {
    let state = State::open(fast_config());
    let mut watcher = state.watch_action_results_for(&["unit-mysql-0"]);

    let ours = state
        .add_action("unit-mysql-0", "restart", Map::new())
        .unwrap();
    let theirs = state
        .add_action("unit-redis-0", "restart", Map::new())
        .unwrap();

    // Finalize the other receiver's action first; the watcher must not wake
    // for it.
    state
        .finalize_action(&theirs, ActionStatus::Failed, Map::new(), "oom")
        .unwrap();
    state
        .finalize_action(&ours, ActionStatus::Completed, Map::new(), "")
        .unwrap();

    let changes = timeout(WAIT, watcher.recv()).await.unwrap().unwrap().unwrap();
    assert_eq!(changes.len(), 1);
    assert!(changes[0].id.starts_with("unit-mysql-0_a_"));
    watcher.stop();
}

#[tokio::test]
async fn test_watcher_ignores_foreign_environment() {
    let store = Arc::new(DocumentStore::new());
    let env_a = State::open_shared(
        {
            let mut c = StateConfig::new();
            c.watcher_tick_interval = Duration::from_millis(10);
            c
        },
        Arc::clone(&store),
    );
    let env_b = State::open_shared(StateConfig::new(), Arc::clone(&store));

    let mut watcher = env_a.watch_action_results_for(&["unit-mysql-0"]);

    // Activity in environment B must not reach environment A's watcher.
    let foreign = env_b
        .add_action("unit-mysql-0", "restart", Map::new())
        .unwrap();
    env_b
        .finalize_action(&foreign, ActionStatus::Completed, Map::new(), "")
        .unwrap();

    let ours = env_a
        .add_action("unit-mysql-0", "restart", Map::new())
        .unwrap();
    env_a
        .finalize_action(&ours, ActionStatus::Completed, Map::new(), "")
        .unwrap();

    let changes = timeout(WAIT, watcher.recv()).await.unwrap().unwrap().unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].id, format!("{}_ar_1", ours.id(env_a.ids())));
    watcher.stop();
}

#[tokio::test]
async fn test_enqueue_watcher_sees_pending_then_consumed() {
    let state = State::open(fast_config());
    let mut watcher = state.watch_actions_for(&["unit-mysql-0"]);

    let action = state
        .add_action("unit-mysql-0", "restart", Map::new())
        .unwrap();
    let local = action.id(state.ids());

    let changes = timeout(WAIT, watcher.recv()).await.unwrap().unwrap().unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].id, local);
    assert!(changes[0].present, "freshly enqueued action is present");

    state
        .finalize_action(&action, ActionStatus::Completed, Map::new(), "")
        .unwrap();

    let changes = timeout(WAIT, watcher.recv()).await.unwrap().unwrap().unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].id, local);
    assert!(!changes[0].present, "consumed action is gone");
    watcher.stop();
}

#[tokio::test]
async fn test_watcher_termination_is_reported_once() {
    let store = Arc::new(DocumentStore::new());
    let state = State::open_shared(fast_config(), Arc::clone(&store));
    let mut watcher = state.watch_action_results_for(&["unit-mysql-0"]);

    // Drop every reference to the store: the raw feed closes underneath the
    // subscription.
    drop(state);
    drop(store);

    let result = timeout(WAIT, watcher.recv()).await.unwrap().unwrap();
    assert!(matches!(result, Err(StateError::StreamTerminated(_))));
    assert!(timeout(WAIT, watcher.recv()).await.unwrap().is_none());
}

#[test]
fn test_all_or_nothing_across_entities() {
    use concord::{Assertion, Effect, Op};

    let state = State::open(StateConfig::default());
    let action = state
        .add_action("unit-mysql-0", "restart", Map::new())
        .unwrap();
    let action_doc_id = state.doc_id(&action.id(state.ids()));

    // An update paired with an assertion that cannot hold: the update must
    // leave no trace.
    let revno_before = state
        .store()
        .get(concord::ACTIONS_COLLECTION, &action_doc_id)
        .unwrap()
        .revno;
    let err = state
        .runner()
        .run_ops(vec![
            Op {
                collection: concord::ACTIONS_COLLECTION.to_string(),
                doc_id: action_doc_id.clone(),
                assert: Assertion::DocExists,
                effect: Effect::Update(json!({"tampered": true})),
            },
            Op::assert(
                concord::ACTIONS_COLLECTION,
                state.doc_id("unit-mysql-0_a_no-such-action"),
                Assertion::DocExists,
            ),
        ])
        .unwrap_err();
    assert!(matches!(err, StateError::TransactionAborted));

    let doc = state
        .store()
        .get(concord::ACTIONS_COLLECTION, &action_doc_id)
        .unwrap();
    assert_eq!(doc.revno, revno_before, "first op must not have applied");
    assert!(doc.body.get("tampered").is_none());
}
