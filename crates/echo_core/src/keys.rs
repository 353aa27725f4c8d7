//! Identifier newtypes shared across the crate.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_key!(
    /// Identity of a replica. Each peer owns exactly one feed per space.
    PeerId
);

string_key!(
    /// Stable identity of an object within a space.
    ObjectId
);

string_key!(
    /// Identity of a space (the unit of replication).
    SpaceKey
);

string_key!(
    /// Identity of one transport connection. A peer may hold several.
    ConnectionId
);

impl PeerId {
    /// Generate a fresh random peer id.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl ObjectId {
    /// Generate a fresh random object id.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl SpaceKey {
    /// Generate a fresh random space key.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_ids_are_unique() {
        assert_ne!(ObjectId::random(), ObjectId::random());
        assert_ne!(PeerId::random(), PeerId::random());
    }

    #[test]
    fn test_serde_transparent() {
        let id = PeerId::from("peer-a");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"peer-a\"");
        let back: PeerId = serde_json::from_str("\"peer-a\"").unwrap();
        assert_eq!(back, id);
    }
}
