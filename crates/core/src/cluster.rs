// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cluster config (§3 "Cluster config"): the epoch-versioned membership view
//! exchanged via the HTTP cluster-manager surface (§6) and join protocol.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// One node's membership record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub region: String,
    pub az: String,
    pub base_dir: String,
    pub daemon_host: String,
}

/// `{epoch, version, nodes}` (§3). `BTreeMap` keeps iteration order stable so
/// the content hash is deterministic across nodes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub epoch: u64,
    pub version: u64,
    pub nodes: BTreeMap<String, NodeInfo>,
}

impl ClusterConfig {
    /// Bump the epoch and add (or replace) a node's record — called on join.
    pub fn join(&mut self, name: impl Into<String>, info: NodeInfo) {
        self.epoch += 1;
        self.nodes.insert(name.into(), info);
    }

    /// SHA-256 over the shared subset, used to detect divergence between
    /// peers (§3, §6 `configHash`).
    pub fn content_hash(&self) -> String {
        // Serialization is deterministic: BTreeMap iterates in key order and
        // serde_json preserves struct field order.
        let bytes = serde_json::to_vec(&(self.epoch, self.version, &self.nodes))
            .unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        format!("{:x}", hasher.finalize())
    }
}
