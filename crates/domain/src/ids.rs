use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix carried by client-generated message ids until the server assigns one.
pub const TEMP_ID_PREFIX: &str = "tmp-";

macro_rules! define_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

// Social IDs
define_id!(UserId);
define_id!(ChatId);
define_id!(MessageId);

// Admin IDs
define_id!(ActivityId);

impl MessageId {
    /// Generate a client-side temporary id for an optimistic message.
    pub fn temporary() -> Self {
        Self(format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4()))
    }

    /// Whether this id was generated locally and not yet replaced by the server.
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporary_ids_are_unique_and_prefixed() {
        let a = MessageId::temporary();
        let b = MessageId::temporary();

        assert_ne!(a, b);
        assert!(a.is_temporary());
        assert!(a.as_str().starts_with(TEMP_ID_PREFIX));
    }

    #[test]
    fn server_ids_are_not_temporary() {
        assert!(!MessageId::new("srv-42").is_temporary());
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = ChatId::from("chat1");
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, "\"chat1\"");

        let back: ChatId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, id);
    }
}
