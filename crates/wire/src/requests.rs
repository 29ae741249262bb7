// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Payloads for the `ec2.*` subjects (§6).

use serde::{Deserialize, Serialize};

/// `ec2.RunInstances.<type>` request body (§6, §4.5 "Run-instances admission").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInstancesInput {
    pub instance_type: String,
    pub image_id: String,
    pub min_count: u32,
    pub max_count: u32,
    #[serde(default)]
    pub key_name: Option<String>,
    #[serde(default)]
    pub eni_id: Option<String>,
    #[serde(default)]
    pub owner: String,
}

impl RunInstancesInput {
    /// §4.5 step 1: count >= 1, min <= max.
    pub fn validate(&self) -> Result<(), String> {
        if self.min_count < 1 {
            return Err("min_count must be >= 1".to_string());
        }
        if self.min_count > self.max_count {
            return Err("min_count must be <= max_count".to_string());
        }
        Ok(())
    }
}

/// One instance's public descriptor, as returned in a `Reservation`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    pub instance_id: String,
    pub instance_type: String,
    pub state_code: u16,
    pub state_name: String,
}

/// Response envelope for a `RunInstances` call (Glossary: "Reservation").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub reservation_id: String,
    pub owner: String,
    pub created_at_ms: u64,
    pub instances: Vec<InstanceDescriptor>,
}

/// Body for `ec2.start` / `ec2.terminate` / `ec2.cmd.<id>` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StartStopTerminateRequest {
    Start { instance_id: String },
    Stop { instance_id: String, delete_volume: bool },
    Terminate { instance_id: String },
    /// Arbitrary monitor pass-through (§4.6: "arbitrary monitor pass-throughs").
    MonitorCommand { instance_id: String, command: serde_json::Value },
}
