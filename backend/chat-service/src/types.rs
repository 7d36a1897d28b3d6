//! Typed identifiers for the persisted entities.
//!
//! All of them are plain UUID v4 under the hood and serialize as canonical
//! lowercase UUID strings; the wrapper exists purely for compile-time safety
//! so a `ProblemId` can never be passed where a `ChatId` is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
            Serialize, Deserialize, sqlx::Type,
        )]
        #[serde(transparent)]
        #[sqlx(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }

            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Uuid {
                id.0
            }
        }
    };
}

entity_id!(ChatId);
entity_id!(ProblemId);
entity_id!(MessageId);
entity_id!(
    /// Identifies either a client or a manager; the role is carried by the
    /// endpoint, not by the id.
    UserId
);
entity_id!(JobId);
entity_id!(FailedJobId);
entity_id!(EventId);
entity_id!(
    /// Client-supplied idempotency key of a request.
    RequestId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_canonical_lowercase() {
        let id = MessageId::from_uuid(Uuid::parse_str("6FA459EA-EE8A-3CA4-894E-DB77E160355E").unwrap());
        assert_eq!(id.to_string(), "6fa459ea-ee8a-3ca4-894e-db77e160355e");
    }

    #[test]
    fn parses_back_from_string() {
        let id = ChatId::new();
        let parsed: ChatId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn serde_is_transparent() {
        let id = RequestId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: RequestId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
