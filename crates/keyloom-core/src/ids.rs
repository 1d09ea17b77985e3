//! Validated identifiers.
//!
//! Each identifier is a string newtype checked once at construction. Serde
//! goes through the same check, so a deserialized id is always well formed.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier validation failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    /// Identifier is empty.
    #[error("{kind} must not be empty")]
    Empty {
        /// Identifier kind
        kind: &'static str,
    },

    /// Identifier does not start with its sigil.
    #[error("{kind} must start with '{sigil}': {value}")]
    MissingSigil {
        /// Identifier kind
        kind: &'static str,
        /// Expected leading character
        sigil: char,
        /// Rejected value
        value: String,
    },

    /// Identifier lacks a `localpart:server` split.
    #[error("{kind} must have the form {sigil}localpart:server: {value}")]
    MissingServer {
        /// Identifier kind
        kind: &'static str,
        /// Expected leading character
        sigil: char,
        /// Rejected value
        value: String,
    },

    /// Identifier contains whitespace.
    #[error("{kind} must not contain whitespace: {value:?}")]
    Whitespace {
        /// Identifier kind
        kind: &'static str,
        /// Rejected value
        value: String,
    },
}

fn validate_plain(kind: &'static str, value: &str) -> Result<(), IdError> {
    if value.is_empty() {
        return Err(IdError::Empty { kind });
    }
    if value.chars().any(char::is_whitespace) {
        return Err(IdError::Whitespace { kind, value: value.to_string() });
    }
    Ok(())
}

fn validate_qualified(kind: &'static str, sigil: char, value: &str) -> Result<(), IdError> {
    validate_plain(kind, value)?;

    let Some(rest) = value.strip_prefix(sigil) else {
        return Err(IdError::MissingSigil { kind, sigil, value: value.to_string() });
    };
    match rest.split_once(':') {
        Some((local, server)) if !local.is_empty() && !server.is_empty() => Ok(()),
        _ => Err(IdError::MissingServer { kind, sigil, value: value.to_string() }),
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $validate:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                let validate: fn(&str) -> Result<(), IdError> = $validate;
                validate(&value)?;
                Ok(Self(value))
            }
        }

        impl TryFrom<&str> for $name {
            type Error = IdError;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                Self::try_from(value.to_string())
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::try_from(s)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// A user id of the form `@localpart:server`.
    UserId,
    |value| validate_qualified("user id", '@', value)
);

string_id!(
    /// A device id, unique per user.
    DeviceId,
    |value| validate_plain("device id", value)
);

string_id!(
    /// A room id of the form `!opaque:server`.
    RoomId,
    |value| validate_qualified("room id", '!', value)
);

string_id!(
    /// Correlation id of an outgoing request.
    RequestId,
    |value| validate_plain("request id", value)
);

impl UserId {
    /// Server part of the id.
    pub fn server_name(&self) -> &str {
        self.0.split_once(':').map_or("", |(_, server)| server)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn user_id_parses() {
        let user: UserId = "@alice:example.org".parse().unwrap();
        assert_eq!(user.as_str(), "@alice:example.org");
        assert_eq!(user.server_name(), "example.org");
        assert_eq!(user.to_string(), "@alice:example.org");
    }

    #[test]
    fn user_id_rejects_malformed() {
        assert_eq!(UserId::try_from(""), Err(IdError::Empty { kind: "user id" }));
        assert!(matches!(UserId::try_from("alice:example.org"), Err(IdError::MissingSigil { .. })));
        assert!(matches!(UserId::try_from("@alice"), Err(IdError::MissingServer { .. })));
        assert!(matches!(UserId::try_from("@:example.org"), Err(IdError::MissingServer { .. })));
        assert!(matches!(UserId::try_from("@al ice:x"), Err(IdError::Whitespace { .. })));
    }

    #[test]
    fn room_id_requires_bang() {
        assert!(RoomId::try_from("!room:example.org").is_ok());
        assert!(RoomId::try_from("#room:example.org").is_err());
    }

    #[test]
    fn device_id_accepts_opaque_values() {
        assert!(DeviceId::try_from("ABCDEFGH").is_ok());
        assert!(DeviceId::try_from("").is_err());
    }

    #[test]
    fn serde_validates() {
        let user: UserId = serde_json::from_str("\"@bob:example.org\"").unwrap();
        assert_eq!(serde_json::to_string(&user).unwrap(), "\"@bob:example.org\"");

        assert!(serde_json::from_str::<UserId>("\"bob\"").is_err());
    }

    proptest::proptest! {
        #[test]
        fn qualified_ids_survive_serde(local in "[a-z0-9._=-]{1,16}", server in "[a-z0-9.-]{1,16}(:[0-9]{1,5})?") {
            let user = UserId::try_from(format!("@{local}:{server}")).unwrap();
            let json = serde_json::to_string(&user).unwrap();
            proptest::prop_assert_eq!(serde_json::from_str::<UserId>(&json).unwrap(), user);
        }
    }
}
