/// Environment-scoped document identifiers.
///
/// Every stored document's key begins with the UUID of the environment that
/// owns it, joined to a local key by a fixed separator. This is what keeps
/// logically partitioned deployments from trampling each other inside one
/// shared store: two environments can both hold a unit named `mysql/0`
/// because their document keys differ in the prefix.
///
/// All key construction and parsing in the crate goes through [`EnvIds`];
/// no other module concatenates or splits raw key strings.
use crate::error::{StateError, StateResult};

/// Separator between the environment UUID and the local key.
pub const ENV_SEPARATOR: &str = ":";

/// Identifier scheme for one environment.
///
/// Cheap to clone; the [`State`](crate::State) handle owns one and hands out
/// references to components that need to derive or strip keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvIds {
    env_uuid: String,
}

impl EnvIds {
    /// Create the identifier scheme for the given environment UUID.
    pub fn new(env_uuid: impl Into<String>) -> Self {
        Self {
            env_uuid: env_uuid.into(),
        }
    }

    /// The environment UUID this scheme is scoped to.
    pub fn env_uuid(&self) -> &str {
        &self.env_uuid
    }

    fn prefix(&self) -> String {
        format!("{}{}", self.env_uuid, ENV_SEPARATOR)
    }

    /// Derive the globally unique document key for a local key.
    ///
    /// Idempotent: a key already carrying this environment's prefix is
    /// returned unchanged, so call sites can pass either form.
    pub fn doc_id(&self, local: &str) -> String {
        let prefix = self.prefix();
        if local.starts_with(&prefix) {
            local.to_string()
        } else {
            format!("{prefix}{local}")
        }
    }

    /// Strip this environment's prefix from a document key.
    ///
    /// A key that does not carry the prefix is returned unchanged. Use
    /// [`strict_local_id`](Self::strict_local_id) where a foreign prefix
    /// must be treated as an error.
    pub fn local_id(&self, doc_id: &str) -> String {
        match doc_id.strip_prefix(&self.prefix()) {
            Some(local) => local.to_string(),
            None => doc_id.to_string(),
        }
    }

    /// Strip this environment's prefix, failing if it is absent or foreign.
    ///
    /// Returns [`StateError::ScopeMismatch`] when the key's environment
    /// prefix does not equal this scheme's environment. This prevents one
    /// partition's code from silently operating on another partition's
    /// documents.
    pub fn strict_local_id(&self, doc_id: &str) -> StateResult<String> {
        match doc_id.strip_prefix(&self.prefix()) {
            Some(local) => Ok(local.to_string()),
            None => Err(StateError::ScopeMismatch {
                env_uuid: self.env_uuid.clone(),
                doc_id: doc_id.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> EnvIds {
        EnvIds::new("6983ac70-b4d3-4f6b-a839-e8e29b2c5e63")
    }

    #[test]
    fn test_doc_id_prefixes_local_key() {
        let ids = ids();
        assert_eq!(
            ids.doc_id("machine-0"),
            "6983ac70-b4d3-4f6b-a839-e8e29b2c5e63:machine-0"
        );
    }

    #[test]
    fn test_doc_id_is_idempotent() {
        let ids = ids();
        let key = ids.doc_id("machine-0");
        assert_eq!(ids.doc_id(&key), key);
    }

    #[test]
    fn test_local_id_round_trip() {
        let ids = ids();
        for local in ["machine-0", "unit-mysql-0_a_1234", "a:b:c", ""] {
            assert_eq!(ids.local_id(&ids.doc_id(local)), local);
        }
    }

    #[test]
    fn test_local_id_passes_through_unprefixed_keys() {
        let ids = ids();
        assert_eq!(ids.local_id("machine-0"), "machine-0");
    }

    #[test]
    fn test_strict_local_id_accepts_own_environment() {
        let ids = ids();
        let key = ids.doc_id("service-wordpress");
        assert_eq!(ids.strict_local_id(&key).unwrap(), "service-wordpress");
    }

    #[test]
    fn test_strict_local_id_rejects_foreign_environment() {
        let ids = ids();
        let other = EnvIds::new("bb44c02a-0b3f-4b53-9d2c-7c2c9e3a3a11");
        let foreign_key = other.doc_id("service-wordpress");

        let err = ids.strict_local_id(&foreign_key).unwrap_err();
        assert!(matches!(err, StateError::ScopeMismatch { .. }));
    }

    #[test]
    fn test_strict_local_id_rejects_bare_key() {
        let ids = ids();
        let err = ids.strict_local_id("service-wordpress").unwrap_err();
        assert!(matches!(err, StateError::ScopeMismatch { .. }));
    }
}
