// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared error taxonomy (§7).
//!
//! `CoreError` covers failures that originate in pure data-model logic
//! (admission, state-machine validation). `hive-daemon` layers its own
//! I/O-bearing error enums (bus timeouts, store unavailability, process
//! spawn failures) on top of this via `#[from]`.

use crate::state_machine::{InstanceState, TransitionError};
use thiserror::Error;

/// Admission errors (§7): returned to the caller over the bus, no state
/// mutation performed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid instance type: {0}")]
    InvalidInstanceType(String),

    #[error("insufficient instance capacity")]
    InsufficientInstanceCapacity,

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("illegal state transition from {from:?} to {to:?}")]
    IllegalTransition { from: InstanceState, to: InstanceState },
}

impl From<TransitionError> for CoreError {
    fn from(e: TransitionError) -> Self {
        match e {
            TransitionError::IllegalTransition { from, to } => {
                CoreError::IllegalTransition { from, to }
            }
        }
    }
}
