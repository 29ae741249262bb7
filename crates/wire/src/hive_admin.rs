// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `hive.*` fan-out status payloads and the HTTP cluster-manager surface
//! bodies (§6).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// `GET /health` response (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub node: String,
    pub status: String,
    pub config_hash: String,
    pub epoch: u64,
    pub uptime_secs: u64,
    pub services: Vec<String>,
    pub service_health: HashMap<String, bool>,
}

/// `POST /join` request body (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub node: String,
    pub region: String,
    pub az: String,
    pub data_dir: String,
    pub daemon_host: String,
}

/// `POST /join` response body (§6). `caCert`/`caKey` and `predastoreConfig`
/// are opaque blobs handed out by the bootstrap TLS plumbing (§1
/// out-of-scope collaborator) — carried here as strings, not parsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub success: bool,
    pub shared_data: serde_json::Value,
    pub config_hash: String,
    pub ca_cert: String,
    pub ca_key: String,
    pub predastore_config: serde_json::Value,
}

/// `GET /config` response body (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigResponse {
    pub config: hive_core::ClusterConfig,
    pub config_hash: String,
}

/// `hive.node.status` / `hive.nodes.discover` fan-out payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node: String,
    pub epoch: u64,
    pub instance_count: u32,
    pub allocated_vcpu: u32,
    pub allocated_memory_mib: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_response_round_trips_through_json() {
        let resp = HealthResponse {
            node: "node-a".into(),
            status: "ok".into(),
            config_hash: "abc123".into(),
            epoch: 3,
            uptime_secs: 42,
            services: vec!["bus".into()],
            service_health: HashMap::new(),
        };
        let bytes = serde_json::to_vec(&resp).unwrap();
        let back: HealthResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.node, "node-a");
        assert_eq!(back.epoch, 3);
    }
}
