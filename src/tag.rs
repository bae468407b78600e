/// External-facing action tags.
///
/// Reporting and CLI layers refer to actions by a compound tag built from
/// the receiver name and the action's UUID. Tags are validated on the way
/// out: a malformed receiver/uuid combination fails closed (no tag) rather
/// than blowing up deep in serialization.
use crate::actions::ACTION_MARKER;
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;
use uuid::Uuid;

/// Prefix identifying an action tag string.
pub const ACTION_TAG_PREFIX: &str = "action-";

fn receiver_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // Unit receivers ("unit-mysql-0") and machine receivers ("machine-0").
    PATTERN.get_or_init(|| {
        Regex::new(r"^(unit-[a-z][a-z0-9]*(-[a-z0-9]+)*-(0|[1-9][0-9]*)|machine-(0|[1-9][0-9]*))$")
            .expect("receiver pattern is valid")
    })
}

/// Check whether a string names a well-formed action receiver.
pub fn is_valid_receiver(receiver: &str) -> bool {
    receiver_pattern().is_match(receiver)
}

/// The compound tag for one action: receiver plus UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActionTag {
    receiver: String,
    uuid: Uuid,
}

impl ActionTag {
    /// Build a tag from its parts, validating both.
    ///
    /// Returns `None` when the receiver does not match the receiver grammar
    /// or the uuid is not a well-formed UUID.
    pub fn from_parts(receiver: &str, uuid: &str) -> Option<Self> {
        if !is_valid_receiver(receiver) {
            return None;
        }
        let uuid = Uuid::parse_str(uuid).ok()?;
        Some(Self {
            receiver: receiver.to_string(),
            uuid,
        })
    }

    /// Parse a full tag string, e.g. `action-unit-mysql-0_a_<uuid>`.
    pub fn parse(tag: &str) -> Option<Self> {
        let rest = tag.strip_prefix(ACTION_TAG_PREFIX)?;
        let (receiver, uuid) = rest.rsplit_once(ACTION_MARKER)?;
        Self::from_parts(receiver, uuid)
    }

    /// The receiver this action targets.
    pub fn receiver(&self) -> &str {
        &self.receiver
    }

    /// The action's UUID.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl fmt::Display for ActionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{ACTION_TAG_PREFIX}{}{ACTION_MARKER}{}",
            self.receiver, self.uuid
        )
    }
}
