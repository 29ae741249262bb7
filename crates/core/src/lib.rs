// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Data model and pure algorithms for the hive compute daemon.
//!
//! This crate has no I/O: it defines the instance record, the instance-type
//! registry, the resource ledger arithmetic, and the instance state machine
//! transition table. Everything that touches a socket, a process, or disk
//! lives in `hive-daemon`.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod clock;
pub mod cluster;
pub mod error;
pub mod id;
pub mod instance;
pub mod ledger;
pub mod state_machine;
pub mod types;

pub use clock::{Clock, FakeClock, SystemClock};
pub use cluster::{ClusterConfig, NodeInfo};
pub use error::CoreError;
pub use id::IdBuf;
pub use instance::{Instance, NetworkIdentity, RuntimeHandle, VolumeRequest, VolumeRole};
pub use ledger::{AllocationError, ResourceLedger};
pub use state_machine::{InstanceState, StateReason, TransitionError};
pub use types::{InstanceType, InstanceTypeTable};

define_id! {
    /// Opaque instance identity, assigned on create. Never reused.
    pub struct InstanceId("i-");
}

define_id! {
    /// Identifies a single RunInstances call; shared by every instance it creates.
    pub struct ReservationId("r-");
}
