// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Instance type classification (§3 "Instance type").
//!
//! A classification name maps to a `{vCPU, memory, architecture, features}`
//! tuple. The table is immutable once built at startup from host CPU
//! detection; nothing in the daemon mutates it after that.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// CPU architecture a type is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    X86_64,
    Aarch64,
}

/// An immutable instance-type classification: `{vCPU, memory, architecture, features}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceType {
    pub name: String,
    pub vcpus: u32,
    pub memory_mib: u64,
    pub architecture: Architecture,
    pub features: Vec<String>,
}

impl InstanceType {
    pub fn new(name: impl Into<String>, vcpus: u32, memory_mib: u64) -> Self {
        Self {
            name: name.into(),
            vcpus,
            memory_mib,
            architecture: Architecture::X86_64,
            features: Vec::new(),
        }
    }

    pub fn memory_gb(&self) -> f64 {
        self.memory_mib as f64 / 1024.0
    }
}

/// Table of instance types known to this host, keyed by classification name.
///
/// Derived from host CPU detection at startup (§3 "Instance type"). Every
/// non-terminal instance record's classification must exist in this table
/// (§3 invariant 2).
#[derive(Debug, Clone, Default)]
pub struct InstanceTypeTable {
    types: HashMap<String, InstanceType>,
}

impl InstanceTypeTable {
    pub fn new() -> Self {
        Self { types: HashMap::new() }
    }

    pub fn insert(&mut self, ty: InstanceType) {
        self.types.insert(ty.name.clone(), ty);
    }

    pub fn get(&self, name: &str) -> Option<&InstanceType> {
        self.types.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &InstanceType> {
        self.types.values()
    }

    /// The built-in set this host supports, detected from the running CPU.
    ///
    /// Real CPU detection (core count, total memory) is a host-platform
    /// concern that lives in `hive-daemon`; this constructor is the
    /// deterministic fallback used by tests and as the seed table before
    /// host detection narrows it to what actually fits.
    pub fn standard() -> Self {
        let mut table = Self::new();
        for ty in [
            InstanceType::new("t3.nano", 2, 512),
            InstanceType::new("t3.micro", 2, 1024),
            InstanceType::new("t3.small", 2, 2048),
            InstanceType::new("t3.medium", 2, 4096),
            InstanceType::new("m5.large", 2, 8192),
            InstanceType::new("m5.xlarge", 4, 16384),
            InstanceType::new("m5.2xlarge", 8, 32768),
        ] {
            table.insert(ty);
        }
        table
    }
}
