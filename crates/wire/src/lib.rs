// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bus wire format for the hive compute daemon (§6).
//!
//! Every payload on the bus is JSON. This crate owns the subject-name
//! builders and the request/reply shapes; `hive-daemon` owns the actual
//! transport (`MessageBus`) and dispatch.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod ebs;
pub mod hive_admin;
pub mod requests;
pub mod subjects;

pub use ebs::{MountReply, MountRequest};
pub use requests::{
    InstanceDescriptor, Reservation, RunInstancesInput, StartStopTerminateRequest,
};
pub use subjects::Subject;
