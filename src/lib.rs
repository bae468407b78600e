//! # Concord — shared state for cluster controllers
//!
//! Concord is the coordination layer multiple controller processes use to
//! agree on the live topology of a deployment: a transactional entity store
//! with environment-scoped identifiers, optimistic multi-document
//! transactions, change-notification watchers, and an action lifecycle built
//! on top — all without a central lock manager.
//!
//! ## Quick Start
//!
//! ```ignore
//! use concord::{ActionStatus, State, StateConfig};
//! use serde_json::{json, Map};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let state = State::open(StateConfig::default());
//!
//!     // Watch for results landing for this receiver.
//!     let mut watcher = state.watch_action_results_for(&["unit-mysql-0"]);
//!
//!     // Enqueue work against a unit.
//!     let mut parameters = Map::new();
//!     parameters.insert("force".to_string(), json!(true));
//!     let action = state.add_action("unit-mysql-0", "restart", parameters)?;
//!
//!     // ... some worker picks the action up and finalizes it ...
//!     let mut results = Map::new();
//!     results.insert("exit-code".to_string(), json!(0));
//!     state.finalize_action(&action, ActionStatus::Completed, results, "")?;
//!
//!     // The watcher delivers a coalesced changeset.
//!     let changes = watcher.recv().await.unwrap()?;
//!     println!("changed: {changes:?}");
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! Leaves first:
//!
//! 1. **Identifier scheme** ([`ids`]) — maps (environment, local key) pairs
//!    to globally unique document keys and back; every other component
//!    routes keys through it.
//! 2. **Transaction runner** ([`txn`]) — applies ordered lists of
//!    assert-then-effect operations as one atomic unit against the store,
//!    retrying on conflict up to a configured bound.
//! 3. **Change watcher** ([`watcher`]) — tails the store's change feed,
//!    filters, coalesces per-document events into idempotent per-interval
//!    changesets, and delivers them to independent subscribers.
//! 4. **Entity store** ([`state`], [`actions`], [`actionresult`]) — typed
//!    accessors built on the two layers below; the action lifecycle is the
//!    fully worked entity.
//!
//! The store itself ([`store`]) is the in-process stand-in for a replicated
//! document store with native conditional writes and a tailable event feed;
//! ordering and durability are its problem, application-level atomicity and
//! notification are ours.
//!
//! ## Concurrency
//!
//! There is no in-process or distributed lock between controller handles.
//! Correctness under competing writers rests entirely on the conditional
//! apply surfaced through the transaction runner: an operation whose
//! correctness depends on "no one else has done this yet" asserts exactly
//! that, and loses cleanly when wrong.

// Internal modules
mod error;

// Identifier scheme and the state handle
pub mod ids;
pub mod state;

// Storage and transaction layers
pub mod store;
pub mod txn;

// Change notification
pub mod watcher;

// Entity layer
pub mod actionresult;
pub mod actions;
pub mod tag;

// Public API exports
pub use actionresult::{
    action_result_id, action_result_prefix, now_to_the_second, ActionResult, ActionResultDoc,
    ACTION_RESULTS_COLLECTION, RESULT_MARKER,
};
pub use actions::{
    action_id, action_prefix, Action, ActionDoc, ActionStatus, ACTIONS_COLLECTION, ACTION_MARKER,
};
pub use error::{StateError, StateResult};
pub use ids::{EnvIds, ENV_SEPARATOR};
pub use state::{State, StateConfig};
pub use store::{DocKey, Document, DocumentStore, StoreChange, StoreEvent};
pub use tag::{ActionTag, ACTION_TAG_PREFIX};
pub use txn::{Assertion, Effect, Op, TxnHooks, TxnRunner};
pub use watcher::{merge_ids, Change, ChangeWatcher, Changeset, WatchParams, WatcherHub};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use concord::prelude::*;
/// ```
pub mod prelude {
    pub use crate::actionresult::{ActionResult, ActionResultDoc};
    pub use crate::actions::{Action, ActionDoc, ActionStatus};
    pub use crate::error::{StateError, StateResult};
    pub use crate::ids::EnvIds;
    pub use crate::state::{State, StateConfig};
    pub use crate::store::DocumentStore;
    pub use crate::tag::ActionTag;
    pub use crate::txn::{Assertion, Effect, Op, TxnRunner};
    pub use crate::watcher::{Change, ChangeWatcher, Changeset, WatchParams};
}
