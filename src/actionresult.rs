/// Action results: the terminal record of a consumed action.
///
/// A result embeds a full copy of the originating action document, so it is
/// self-contained and does not require the action to still exist. At most
/// one result document exists per action; the storage layer enforces this
/// (a missing-document assertion on a deterministically derived key), not
/// application logic, because multiple controller processes may race to
/// finalize the same action.
use crate::actions::{action_prefix, Action, ActionDoc, ActionStatus};
use crate::ids::EnvIds;
use crate::tag::ActionTag;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Collection holding action result documents.
pub const ACTION_RESULTS_COLLECTION: &str = "actionresults";

/// Marker joining an action local key to a result sequence number.
pub const RESULT_MARKER: &str = "_ar_";

/// The current time truncated to one-second resolution.
///
/// Completion times are stored at whole seconds so comparisons and display
/// stay stable across retries and round trips through the store.
pub fn now_to_the_second() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

/// The stored form of an action result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResultDoc {
    /// The document key. Encodes the id of the action that produced this
    /// result: `<action doc id><marker><sequence>`.
    #[serde(rename = "_id")]
    pub doc_id: String,

    /// The owning environment.
    #[serde(rename = "env-uuid")]
    pub env_uuid: String,

    /// The action that was consumed to produce this result.
    pub action: ActionDoc,

    /// The terminal state of the action; never pending.
    pub status: ActionStatus,

    /// Any error message from the action; empty on success.
    pub message: String,

    /// Structured results from the action.
    pub results: Map<String, JsonValue>,

    /// When the action finished, at one-second resolution.
    pub completed: DateTime<Utc>,
}

/// Compose the local key for a result: `<action local id><marker><sequence>`.
pub fn action_result_id(action_local_id: &str, sequence: u64) -> String {
    format!("{action_local_id}{RESULT_MARKER}{sequence}")
}

/// Prefix matching every result local key for a receiver.
///
/// Result keys extend action keys, so all of a receiver's results share the
/// receiver's action prefix; this is what makes range lookup by receiver
/// work without a secondary index.
pub fn action_result_prefix(receiver: &str) -> String {
    action_prefix(receiver)
}

/// Build the result doc for finalizing `action` with a terminal status.
pub(crate) fn new_action_result_doc(
    action: &Action,
    ids: &EnvIds,
    status: ActionStatus,
    results: Map<String, JsonValue>,
    message: String,
    sequence: u64,
) -> ActionResultDoc {
    let local = action_result_id(&action.id(ids), sequence);
    ActionResultDoc {
        doc_id: ids.doc_id(&local),
        env_uuid: action.doc().env_uuid.clone(),
        action: action.doc().clone(),
        status,
        message,
        results,
        completed: now_to_the_second(),
    }
}

/// The terminal record of an action.
///
/// Like [`Action`], an immutable snapshot; the embedded action document
/// answers every question about what was requested.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionResult {
    doc: ActionResultDoc,
}

impl ActionResult {
    pub(crate) fn new(doc: ActionResultDoc) -> Self {
        Self { doc }
    }

    /// The local id of this result.
    pub fn id(&self, ids: &EnvIds) -> String {
        ids.local_id(&self.doc.doc_id)
    }

    /// The name of the receiver the originating action targeted.
    pub fn receiver(&self) -> &str {
        &self.doc.action.receiver
    }

    /// The UUID of the originating action.
    pub fn uuid(&self) -> &str {
        &self.doc.action.uuid
    }

    /// The name of the originating action.
    pub fn name(&self) -> &str {
        &self.doc.action.name
    }

    /// The parameters the originating action was enqueued with.
    pub fn parameters(&self) -> &Map<String, JsonValue> {
        &self.doc.action.parameters
    }

    /// The terminal state of the action.
    pub fn status(&self) -> ActionStatus {
        self.doc.status
    }

    /// The structured output of the action and any error message.
    pub fn results(&self) -> (&Map<String, JsonValue>, &str) {
        (&self.doc.results, &self.doc.message)
    }

    /// When the action finished.
    pub fn completed(&self) -> DateTime<Utc> {
        self.doc.completed
    }

    /// Verify that this result can produce a valid external tag.
    ///
    /// Call before [`action_tag`](Self::action_tag); malformed receiver/uuid
    /// combinations fail closed here instead of erroring downstream.
    pub fn validate_tag(&self) -> bool {
        self.action_tag().is_some()
    }

    /// The tag of the action this result is for, if well formed.
    pub fn action_tag(&self) -> Option<ActionTag> {
        ActionTag::from_parts(self.receiver(), self.uuid())
    }

    /// The stored document.
    pub fn doc(&self) -> &ActionResultDoc {
        &self.doc
    }
}
