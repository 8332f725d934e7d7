//! Delta lifecycle records and state enums.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            /// Returns the wire/database representation.
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(ParseError::InvalidEnum {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

string_enum!(
    /// Global lifecycle state of a delta.
    DeltaState, "delta state", {
        Accepting => "accepting",
        Accepted => "accepted",
        Committing => "committing",
        Committed => "committed",
        Activating => "activating",
        Activated => "activated",
        ActivateError => "activate-error",
        Remove => "remove",
        Removed => "removed",
        Failed => "failed",
    }
);

string_enum!(
    /// Kind of change a delta carries.
    DeltaType, "delta type", {
        Addition => "addition",
        Reduction => "reduction",
        Modify => "modify",
    }
);

string_enum!(
    /// Track of whether the delta was merged into or removed from the model.
    ModAdd, "modadd state", {
        Idle => "idle",
        Add => "add",
        Added => "added",
        Remove => "remove",
        Removed => "removed",
        Failed => "failed",
    }
);

string_enum!(
    /// A host's view of a delta.
    HostState, "host state", {
        Active => "active",
        Activating => "activating",
        Activated => "activated",
        Cancel => "cancel",
        Remove => "remove",
        Removed => "removed",
        Failed => "failed",
    }
);

string_enum!(
    /// Fine-grained per (uuid, host, port) status reported by workers and agents.
    TimedState, "timed state", {
        Activated => "activated",
        Deactivated => "deactivated",
        ActivateError => "activate-error",
        DeactivateError => "deactivate-error",
        Activating => "activating",
        Deactivating => "deactivating",
        Unknown => "unknown",
    }
);

/// Derives the global status of a delta from its per-port timed states.
///
/// Errors win, then unanimous states, then in-progress states.
pub fn aggregate_timed_states<I>(states: I) -> TimedState
where
    I: IntoIterator<Item = TimedState>,
{
    let states: Vec<TimedState> = states.into_iter().collect();
    if states.is_empty() {
        return TimedState::Unknown;
    }
    let any = |s: TimedState| states.contains(&s);
    let all = |s: TimedState| states.iter().all(|x| *x == s);
    if any(TimedState::ActivateError) {
        TimedState::ActivateError
    } else if any(TimedState::DeactivateError) {
        TimedState::DeactivateError
    } else if all(TimedState::Activated) {
        TimedState::Activated
    } else if all(TimedState::Deactivated) {
        TimedState::Deactivated
    } else if any(TimedState::Activated) {
        TimedState::Activating
    } else if any(TimedState::Deactivated) {
        TimedState::Deactivating
    } else {
        TimedState::Unknown
    }
}

/// The authoritative lifecycle record of a delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub uid: String,
    pub insertdate: i64,
    pub updatedate: i64,
    pub state: DeltaState,
    pub deltat: DeltaType,
    /// Graph fragment, base64 or plain turtle.
    pub content: String,
    pub modelid: String,
    pub modadd: ModAdd,
    /// Error message recorded when the delta failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
