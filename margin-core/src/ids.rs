//! Type-safe ID newtypes for engine entities
//!
//! Store-assigned ids are opaque strings wrapped in newtypes. Records created
//! optimistically carry a [`LocalId`] until the persistence gateway confirms
//! them; [`Identity`] tracks which of the two a record currently holds.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Macro to define a type-safe ID newtype
macro_rules! define_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new random ID
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Create from an existing string (for ids returned by the store)
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

define_id!(SessionId, "Unique identifier for a chat session");
define_id!(MessageId, "Unique identifier for a persisted message");
define_id!(CommentId, "Unique identifier for a persisted edit comment");
define_id!(ChangelogId, "Unique identifier for a changelog entry");
define_id!(RequestId, "Correlates the comments of one edit batch with its agent run");

/// Temporary id for a record that exists only in the session store.
///
/// Never sent to the persistence gateway.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LocalId(String);

impl LocalId {
    pub fn new() -> Self {
        Self(format!("local-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of an optimistic record: local until the gateway assigns a real id.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Identity<Id> {
    Local(LocalId),
    Persisted(Id),
}

impl<Id> Identity<Id> {
    pub fn is_persisted(&self) -> bool {
        matches!(self, Identity::Persisted(_))
    }

    pub fn persisted(&self) -> Option<&Id> {
        match self {
            Identity::Persisted(id) => Some(id),
            Identity::Local(_) => None,
        }
    }

    pub fn is_local(&self, local: &LocalId) -> bool {
        matches!(self, Identity::Local(l) if l == local)
    }
}

impl<Id: fmt::Display> fmt::Display for Identity<Id> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Local(id) => write!(f, "{}", id),
            Identity::Persisted(id) => write!(f, "{}", id),
        }
    }
}

/// Monotonic id of one agent invocation, used for staleness checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvocationId(u64);

impl InvocationId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_creation() {
        let id1 = MessageId::new();
        let id2 = MessageId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_id_serde_is_transparent() {
        let id = SessionId::from_string("sess-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"sess-1\"");
        let back: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_local_ids_are_distinguishable() {
        let local = LocalId::new();
        assert!(local.as_str().starts_with("local-"));

        let optimistic: Identity<MessageId> = Identity::Local(local.clone());
        assert!(!optimistic.is_persisted());
        assert!(optimistic.is_local(&local));
        assert!(optimistic.persisted().is_none());

        let confirmed: Identity<MessageId> = Identity::Persisted(MessageId::from_string("m-1"));
        assert!(confirmed.is_persisted());
        assert!(!confirmed.is_local(&local));
        assert_eq!(confirmed.persisted().map(|id| id.as_str()), Some("m-1"));
    }

    #[test]
    fn test_invocation_ids_order() {
        assert!(InvocationId::new(1) < InvocationId::new(2));
        assert_eq!(InvocationId::new(7).to_string(), "7");
    }
}
