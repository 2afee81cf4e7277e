//! Opaque string identifiers.
//!
//! `RoomId` and `UserId` wrap plain strings so the compiler prevents
//! accidentally passing a user where a room was expected. Identifiers are
//! minted externally (room creation, auth) and treated as opaque here.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Actor id used for server-originated events (hydration markers, deaths
/// announced at dawn, crash audit).
pub const SYSTEM_ACTOR: &str = "system";

/// Actor id the AI side-channel writes commands under.
pub const AI_ACTOR: &str = "ai";

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id! {
    /// Identifies one game room. Opaque to the core.
    RoomId
}

string_id! {
    /// Identifies one user (player or storyteller). The reserved actors
    /// [`SYSTEM_ACTOR`] and [`AI_ACTOR`] are also carried as `UserId`s on
    /// events they author.
    UserId
}

impl UserId {
    /// The server itself, for events no player authored.
    pub fn system() -> Self {
        Self(SYSTEM_ACTOR.to_string())
    }

    /// The AI storyteller actor.
    pub fn ai() -> Self {
        Self(AI_ACTOR.to_string())
    }

    pub fn is_ai(&self) -> bool {
        self.0 == AI_ACTOR
    }

    pub fn is_system(&self) -> bool {
        self.0 == SYSTEM_ACTOR
    }
}
