// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Instance state machine (§4.4).
//!
//! This module owns the transition table only. The atomic
//! `TransitionState` primitive that holds the collection lock and persists
//! through the State Store Adapter lives in `hive-daemon::state_machine`,
//! since it needs I/O this crate deliberately can't do.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Instance lifecycle state (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Provisioning,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
    Error,
}

impl InstanceState {
    /// Externally visible EC2-style state code (§4.4).
    pub fn code(self) -> u16 {
        match self {
            InstanceState::Pending => 0,
            InstanceState::Running => 16,
            InstanceState::ShuttingDown => 32,
            InstanceState::Terminated => 48,
            InstanceState::Stopping => 64,
            InstanceState::Stopped => 80,
            // Provisioning and Error are internal refinements with no direct
            // EC2 code; they report as pending/terminated respectively to
            // external callers (see `external_name`).
            InstanceState::Provisioning => 0,
            InstanceState::Error => 48,
        }
    }

    /// Externally visible state name, paired with `code`.
    pub fn external_name(self) -> &'static str {
        match self {
            InstanceState::Pending | InstanceState::Provisioning => "pending",
            InstanceState::Running => "running",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Terminated | InstanceState::Error => "terminated",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceState::Terminated | InstanceState::Error)
    }

    /// True while a live hypervisor process is expected to exist for this
    /// state (§3 invariant 3: the monitor client is non-nil iff running or
    /// transitioning out of running).
    pub fn expects_live_process(self) -> bool {
        matches!(self, InstanceState::Running | InstanceState::Stopping)
    }

    /// The transition table (§4.4). Returns `true` iff `self -> target` is a
    /// legal edge.
    pub fn can_transition_to(self, target: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, target),
            (Pending, Provisioning)
                | (Pending, ShuttingDown)
                | (Pending, Error)
                | (Provisioning, Running)
                | (Provisioning, ShuttingDown)
                | (Provisioning, Error)
                | (Running, Stopping)
                | (Running, ShuttingDown)
                | (Running, Error)
                | (Stopping, Stopped)
                | (Stopping, Error)
                | (Stopped, Pending)
                | (Stopped, ShuttingDown)
                | (ShuttingDown, Terminated)
                | (ShuttingDown, Error)
        )
    }
}

/// A short machine-readable reason recorded alongside a transition into an
/// error-ish state (§7 taxonomy: `volume_preparation_failed`,
/// `launch_failed`, `launch_timeout`, `InsufficientInstanceCapacity`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateReason(pub String);

impl StateReason {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

impl std::fmt::Display for StateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("illegal transition from {from:?} to {to:?}")]
    IllegalTransition { from: InstanceState, to: InstanceState },
}

/// Validate a transition against the table without performing it. The
/// I/O-bearing primitive in `hive-daemon` calls this before touching the
/// collection lock or the store.
pub fn validate_transition(
    from: InstanceState,
    to: InstanceState,
) -> Result<(), TransitionError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(TransitionError::IllegalTransition { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use InstanceState::*;

    #[test]
    fn pending_can_reach_provisioning_shutting_down_or_error_only() {
        assert!(Pending.can_transition_to(Provisioning));
        assert!(Pending.can_transition_to(ShuttingDown));
        assert!(Pending.can_transition_to(Error));
        assert!(!Pending.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Stopped));
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for target in [
            Pending,
            Provisioning,
            Running,
            Stopping,
            Stopped,
            ShuttingDown,
            Terminated,
            Error,
        ] {
            assert!(!Terminated.can_transition_to(target));
            assert!(!Error.can_transition_to(target));
        }
    }

    #[test]
    fn stopped_can_restart_or_terminate() {
        assert!(Stopped.can_transition_to(Pending));
        assert!(Stopped.can_transition_to(ShuttingDown));
        assert!(!Stopped.can_transition_to(Running));
    }

    #[test]
    fn round_trip_transition_requires_both_edges_in_table() {
        // Running -> Stopping -> Stopped -> Pending -> Provisioning -> Running
        // is a legal cycle; Running -> Pending directly is not.
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Pending));
        assert!(!Running.can_transition_to(Pending));
    }

    #[test]
    fn external_codes_match_ec2_numbering() {
        assert_eq!(Pending.code(), 0);
        assert_eq!(Running.code(), 16);
        assert_eq!(ShuttingDown.code(), 32);
        assert_eq!(Terminated.code(), 48);
        assert_eq!(Stopping.code(), 64);
        assert_eq!(Stopped.code(), 80);
    }

    #[test]
    fn validate_transition_matches_can_transition_to() {
        assert!(validate_transition(Pending, Provisioning).is_ok());
        assert_eq!(
            validate_transition(Pending, Running),
            Err(TransitionError::IllegalTransition { from: Pending, to: Running })
        );
    }
}
