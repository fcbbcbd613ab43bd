//! Protocol states, commands and the static capability map.
//!
//! # State Machine
//!
//! ```text
//!            discover                start_autosample
//! Unknown ─────────────> Command ────────────────────> Autosample ◄──┐
//!    │                      ▲  ▲                          │   │      │ retry ok
//!    └─ discover(autosample)┼──┼──────────────────────────┘   │      │
//!                           │  │ final flush ok   stop        │ fail │
//!                           │  └──────────── Stopping ◄───────┘      │
//!                           │                   │ fail               │
//!                           │ clear ok          ▼                    │
//!                           └────────────── WriteError ──────────────┘
//!
//!   malformed data (halt policy) ──> ConfigError ──clear──> Command
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Current state of the protocol. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtocolState {
    /// Initial state after construction or restart
    #[default]
    Unknown,
    /// Idle; configuration may be changed
    Command,
    /// Streaming; the flush timer is running
    Autosample,
    /// Final flush in progress
    Stopping,
    /// A persist failed; data is retained for retry
    WriteError,
    /// Malformed data was received under the halt policy
    ConfigError,
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolState::Unknown => write!(f, "UNKNOWN"),
            ProtocolState::Command => write!(f, "COMMAND"),
            ProtocolState::Autosample => write!(f, "AUTOSAMPLE"),
            ProtocolState::Stopping => write!(f, "STOPPING"),
            ProtocolState::WriteError => write!(f, "WRITE_ERROR"),
            ProtocolState::ConfigError => write!(f, "CONFIG_ERROR"),
        }
    }
}

impl ProtocolState {
    /// Whether incoming raw data is buffered in this state.
    pub fn accepts_data(&self) -> bool {
        matches!(
            self,
            ProtocolState::Unknown
                | ProtocolState::Autosample
                | ProtocolState::Stopping
                | ProtocolState::WriteError
        )
    }

    /// Whether configuration parameters may be changed.
    pub fn is_idle(&self) -> bool {
        matches!(self, ProtocolState::Unknown | ProtocolState::Command)
    }

    /// `WriteError` or `ConfigError`.
    pub fn is_error(&self) -> bool {
        matches!(self, ProtocolState::WriteError | ProtocolState::ConfigError)
    }
}

/// Where `discover` should land, as reported by the orchestration layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoverHint {
    /// The source is idle
    #[default]
    Command,
    /// The source is already streaming
    Autosample,
}

/// Externally callable operations, used for capability reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    /// Establish the initial state
    Discover,
    /// Begin streaming
    StartAutosample,
    /// End streaming with a final flush
    StopAutosample,
    /// Retry a failed write
    ClearWriteError,
    /// Flush without waiting for the timer
    Flush,
    /// Read a parameter
    Get,
    /// Change a parameter
    Set,
}

impl Capability {
    /// Every capability, in declaration order.
    pub const ALL: [Capability; 7] = [
        Capability::Discover,
        Capability::StartAutosample,
        Capability::StopAutosample,
        Capability::ClearWriteError,
        Capability::Flush,
        Capability::Get,
        Capability::Set,
    ];

    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Discover => "DISCOVER",
            Capability::StartAutosample => "START_AUTOSAMPLE",
            Capability::StopAutosample => "STOP_AUTOSAMPLE",
            Capability::ClearWriteError => "CLEAR_WRITE_ERROR",
            Capability::Flush => "FLUSH",
            Capability::Get => "GET",
            Capability::Set => "SET",
        }
    }

    /// Keep only names that denote a known capability.
    pub fn filter<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<Capability> {
        names
            .into_iter()
            .filter_map(|name| name.parse().ok())
            .collect()
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown capability '{s}'"))
    }
}

/// Commands the orchestration layer may issue in `state`.
pub fn capabilities(state: ProtocolState) -> &'static [Capability] {
    match state {
        ProtocolState::Unknown => &[Capability::Discover, Capability::Get, Capability::Set],
        ProtocolState::Command => &[Capability::StartAutosample, Capability::Get, Capability::Set],
        ProtocolState::Autosample => &[
            Capability::StopAutosample,
            Capability::Flush,
            Capability::Get,
        ],
        ProtocolState::Stopping => &[Capability::Get],
        ProtocolState::WriteError => &[Capability::ClearWriteError, Capability::Get],
        ProtocolState::ConfigError => &[Capability::ClearWriteError, Capability::Get],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [ProtocolState; 6] = [
        ProtocolState::Unknown,
        ProtocolState::Command,
        ProtocolState::Autosample,
        ProtocolState::Stopping,
        ProtocolState::WriteError,
        ProtocolState::ConfigError,
    ];

    #[test]
    fn test_state_names_are_unique() {
        let mut names: Vec<String> = ALL_STATES.iter().map(|s| s.to_string()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), ALL_STATES.len());
    }

    #[test]
    fn test_capability_map() {
        assert_eq!(
            capabilities(ProtocolState::Unknown),
            &[Capability::Discover, Capability::Get, Capability::Set]
        );
        assert!(capabilities(ProtocolState::Autosample).contains(&Capability::StopAutosample));
        assert!(!capabilities(ProtocolState::Autosample).contains(&Capability::Set));
        assert!(capabilities(ProtocolState::WriteError).contains(&Capability::ClearWriteError));
        for state in ALL_STATES {
            assert!(capabilities(state).contains(&Capability::Get));
        }
    }

    #[test]
    fn test_every_capability_is_reachable() {
        for capability in Capability::ALL {
            assert!(
                ALL_STATES
                    .iter()
                    .any(|s| capabilities(*s).contains(&capability)),
                "{capability} is never offered"
            );
        }
    }

    #[test]
    fn test_filter_drops_unknown_names() {
        let mut names: Vec<&str> = Capability::ALL.iter().map(|c| c.as_str()).collect();
        names.push("BOGUS_CAPABILITY");
        let filtered = Capability::filter(names);
        assert_eq!(filtered, Capability::ALL.to_vec());
    }

    #[test]
    fn test_state_predicates() {
        assert!(ProtocolState::Unknown.accepts_data());
        assert!(!ProtocolState::Command.accepts_data());
        assert!(!ProtocolState::ConfigError.accepts_data());
        assert!(ProtocolState::Command.is_idle());
        assert!(!ProtocolState::Autosample.is_idle());
        assert!(ProtocolState::WriteError.is_error());
    }

    #[test]
    fn test_serde_names_match_display() {
        let json = serde_json::to_string(&ProtocolState::WriteError).unwrap();
        assert_eq!(json, "\"WRITE_ERROR\"");
    }
}
