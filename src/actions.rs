/// Actions: units of requested work targeted at a receiver.
///
/// An action is enqueued against a named receiver (usually a running unit)
/// with a name and a structured parameter mapping. Once stored, the action
/// document is never mutated in place: it is either still pending, or
/// consumed exactly once to produce exactly one terminal
/// [`ActionResult`](crate::actionresult::ActionResult). "Pending" is
/// represented by the action document existing with no result document yet.
use crate::ids::EnvIds;
use crate::tag::ActionTag;
use crate::txn::Op;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;

/// Collection holding queued action documents.
pub const ACTIONS_COLLECTION: &str = "actions";

/// Marker joining a receiver name to an action UUID in local keys.
pub const ACTION_MARKER: &str = "_a_";

/// The possible states of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    /// The default status while an action is queued and unconsumed.
    Pending,
    /// The action ran to completion as intended.
    Completed,
    /// The action did not complete successfully.
    Failed,
    /// The action was cancelled before being run.
    Cancelled,
}

impl ActionStatus {
    /// Whether this status is terminal (no further transitions permitted).
    pub fn is_terminal(self) -> bool {
        !matches!(self, ActionStatus::Pending)
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Completed => "completed",
            ActionStatus::Failed => "failed",
            ActionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// The stored form of an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDoc {
    /// The document key; encodes the environment UUID, the receiver and the
    /// action UUID: `<env-uuid>:<receiver><marker><uuid>`.
    #[serde(rename = "_id")]
    pub doc_id: String,

    /// The owning environment.
    #[serde(rename = "env-uuid")]
    pub env_uuid: String,

    /// Name of the receiver this action targets.
    pub receiver: String,

    /// UUID unique within the receiver's action history.
    pub uuid: String,

    /// The action's name, matching a definition the receiver understands.
    pub name: String,

    /// Structured parameters passed to the action.
    pub parameters: Map<String, JsonValue>,
}

/// Compose the local key for an action: `<receiver><marker><uuid>`.
pub fn action_id(receiver: &str, uuid: &str) -> String {
    format!("{receiver}{ACTION_MARKER}{uuid}")
}

/// Prefix matching every action local key for a receiver.
pub fn action_prefix(receiver: &str) -> String {
    format!("{receiver}{ACTION_MARKER}")
}

/// A queued action.
///
/// A short-lived, read-mostly projection wrapping an immutable snapshot of
/// the stored document. Methods that need live state take the owning
/// [`State`](crate::State) handle explicitly.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    doc: ActionDoc,
}

impl Action {
    pub(crate) fn new(doc: ActionDoc) -> Self {
        Self { doc }
    }

    /// The local id of this action.
    pub fn id(&self, ids: &EnvIds) -> String {
        ids.local_id(&self.doc.doc_id)
    }

    /// The name of the receiver this action is enqueued for.
    pub fn receiver(&self) -> &str {
        &self.doc.receiver
    }

    /// The unique suffix of the action's id.
    pub fn uuid(&self) -> &str {
        &self.doc.uuid
    }

    /// The name of the action, as defined by its receiver.
    pub fn name(&self) -> &str {
        &self.doc.name
    }

    /// The parameters the action was enqueued with.
    pub fn parameters(&self) -> &Map<String, JsonValue> {
        &self.doc.parameters
    }

    /// Status of the action: pending until consumed by finalization.
    pub fn status(&self) -> ActionStatus {
        ActionStatus::Pending
    }

    /// Verify that this action can produce a valid external tag.
    pub fn validate_tag(&self) -> bool {
        self.tag().is_some()
    }

    /// The external tag for this action, if its parts are well formed.
    pub fn tag(&self) -> Option<ActionTag> {
        ActionTag::from_parts(self.receiver(), self.uuid())
    }

    /// The stored document.
    pub fn doc(&self) -> &ActionDoc {
        &self.doc
    }
}

/// Build the op that enqueues an action.
///
/// The key is freshly generated so a collision is not expected, but the
/// missing-document assertion guards against key reuse.
pub(crate) fn add_action_op(doc: &ActionDoc) -> crate::error::StateResult<Op> {
    Ok(Op::insert(
        ACTIONS_COLLECTION,
        &doc.doc_id,
        serde_json::to_value(doc)?,
    ))
}
