// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! State Store Adapter (§4.2): the only component that reads or writes
//! persistent state. A typed façade over `ReplicatedStore`, mirroring the
//! single-choke-point discipline of `MaterializedState::apply_event` in
//! spirit, but here the KV itself is the source of truth rather than a
//! replayed log — so the adapter is CRUD, not event application.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hive_core::{ClusterConfig, Instance};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{DaemonError, DaemonResult};
use crate::store::ReplicatedStore;

fn instances_key(node: &str) -> String {
    format!("instances.{node}")
}

fn stopped_key(id: &str) -> String {
    format!("stopped.{id}")
}

fn shutdown_key(node: &str) -> String {
    format!("shutdown.{node}")
}

fn service_manifest_key(node: &str) -> String {
    format!("service-manifest.{node}")
}

const CLUSTER_CONFIG_KEY: &str = "cluster-config";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceManifest {
    pub services: Vec<String>,
    pub bus_address: String,
    pub object_store_address: String,
}

pub struct StateStoreAdapter {
    store: Arc<dyn ReplicatedStore>,
}

impl StateStoreAdapter {
    /// Connect with exponential backoff capped at 5s, up to 10 attempts
    /// (§4.2). Returns `StoreUnavailable` if the store never becomes
    /// reachable; the daemon refuses to start in that case.
    pub async fn connect(store: Arc<dyn ReplicatedStore>) -> DaemonResult<Self> {
        let mut backoff = Duration::from_millis(100);
        for attempt in 1..=10u32 {
            if store.is_reachable().await {
                return Ok(Self { store });
            }
            warn!(attempt, "state store not yet reachable, retrying");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(5));
        }
        Err(DaemonError::StoreUnavailable { attempts: 10 })
    }

    pub fn new_unchecked(store: Arc<dyn ReplicatedStore>) -> Self {
        Self { store }
    }

    pub async fn write_state(
        &self,
        node: &str,
        instances: &HashMap<String, Instance>,
    ) -> DaemonResult<()> {
        let body =
            serde_json::to_vec(instances).map_err(|e| DaemonError::Store(e.to_string()))?;
        self.store.put(&instances_key(node), body).await
    }

    pub async fn load_state(&self, node: &str) -> DaemonResult<HashMap<String, Instance>> {
        match self.store.get(&instances_key(node)).await? {
            Some(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| DaemonError::Store(e.to_string()))
            }
            None => Ok(HashMap::new()),
        }
    }

    pub async fn write_stopped_instance(&self, id: &str, rec: &Instance) -> DaemonResult<()> {
        let body = serde_json::to_vec(rec).map_err(|e| DaemonError::Store(e.to_string()))?;
        self.store.put(&stopped_key(id), body).await
    }

    pub async fn read_stopped_instance(&self, id: &str) -> DaemonResult<Option<Instance>> {
        match self.store.get(&stopped_key(id)).await? {
            Some(bytes) => {
                Ok(Some(serde_json::from_slice(&bytes).map_err(|e| DaemonError::Store(e.to_string()))?))
            }
            None => Ok(None),
        }
    }

    pub async fn delete_stopped_instance(&self, id: &str) -> DaemonResult<()> {
        self.store.delete(&stopped_key(id)).await
    }

    /// Claims a stopped instance exactly once across the cluster, per §9:
    /// "a compare-and-set on presence suffices". The caller passes the
    /// record it read; the write only lands if nobody else claimed it
    /// first.
    pub async fn claim_stopped_instance(&self, id: &str, expected: &Instance) -> DaemonResult<bool> {
        let expected_bytes =
            serde_json::to_vec(expected).map_err(|e| DaemonError::Store(e.to_string()))?;
        self.store.compare_and_set(&stopped_key(id), Some(&expected_bytes), Vec::new()).await
    }

    pub async fn write_shutdown_marker(&self, node: &str) -> DaemonResult<()> {
        self.store.put(&shutdown_key(node), vec![1]).await
    }

    pub async fn read_shutdown_marker(&self, node: &str) -> DaemonResult<bool> {
        Ok(self.store.get(&shutdown_key(node)).await?.is_some())
    }

    pub async fn delete_shutdown_marker(&self, node: &str) -> DaemonResult<()> {
        self.store.delete(&shutdown_key(node)).await
    }

    pub async fn write_service_manifest(
        &self,
        node: &str,
        manifest: &ServiceManifest,
    ) -> DaemonResult<()> {
        let body = serde_json::to_vec(manifest).map_err(|e| DaemonError::Store(e.to_string()))?;
        self.store.put(&service_manifest_key(node), body).await
    }

    pub async fn is_reachable(&self) -> bool {
        self.store.is_reachable().await
    }

    /// Reads the cluster membership record the HTTP surface (§6) serves
    /// from and mutates on `/join`. Defaults to an empty config when the
    /// store has never seen one, so a brand-new cluster's first node can
    /// still answer `GET /config`.
    pub async fn read_cluster_config(&self) -> DaemonResult<ClusterConfig> {
        match self.store.get(CLUSTER_CONFIG_KEY).await? {
            Some(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| DaemonError::Store(e.to_string()))
            }
            None => Ok(ClusterConfig::default()),
        }
    }

    pub async fn write_cluster_config(&self, config: &ClusterConfig) -> DaemonResult<()> {
        let body = serde_json::to_vec(config).map_err(|e| DaemonError::Store(e.to_string()))?;
        self.store.put(CLUSTER_CONFIG_KEY, body).await
    }

    /// Raise the replication factor to `|cluster.nodes|` on join (§4.2).
    /// Failures are logged and retried on the next membership change; this
    /// call itself never blocks startup.
    pub async fn update_replicas(&self, n: u32) -> DaemonResult<()> {
        match self.store.set_replication_factor(n).await {
            Ok(()) => {
                info!(replicas = n, "replication factor updated");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "failed to raise replication factor, will retry on next membership change");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use hive_core::instance::{LaunchMetadata, RuntimeHandle};
    use hive_core::{Instance, InstanceId, InstanceState};

    fn sample_instance(id: &str) -> Instance {
        Instance {
            id: InstanceId::from_string(id),
            instance_type: "t3.micro".to_string(),
            volumes: Vec::new(),
            network: None,
            state: InstanceState::Pending,
            state_reason: None,
            launch: LaunchMetadata {
                launch_time_ms: 0,
                reservation_id: "r-1".to_string(),
                owner: "test".to_string(),
                last_node: "node-a".to_string(),
            },
            runtime: RuntimeHandle::default(),
        }
    }

    #[tokio::test]
    async fn write_then_load_state_round_trips() {
        let adapter = StateStoreAdapter::new_unchecked(Arc::new(MemStore::new()));
        let mut instances = HashMap::new();
        instances.insert("i-1".to_string(), sample_instance("i-1"));
        adapter.write_state("node-a", &instances).await.unwrap();
        let loaded = adapter.load_state("node-a").await.unwrap();
        assert_eq!(loaded.get("i-1").unwrap().instance_type, "t3.micro");
    }

    #[tokio::test]
    async fn stopped_instance_can_be_claimed_exactly_once() {
        let adapter = StateStoreAdapter::new_unchecked(Arc::new(MemStore::new()));
        let rec = sample_instance("i-1");
        adapter.write_stopped_instance("i-1", &rec).await.unwrap();
        let first = adapter.claim_stopped_instance("i-1", &rec).await.unwrap();
        assert!(first);
        let second = adapter.claim_stopped_instance("i-1", &rec).await.unwrap();
        assert!(!second);
    }

    #[tokio::test]
    async fn shutdown_marker_round_trips() {
        let adapter = StateStoreAdapter::new_unchecked(Arc::new(MemStore::new()));
        assert!(!adapter.read_shutdown_marker("node-a").await.unwrap());
        adapter.write_shutdown_marker("node-a").await.unwrap();
        assert!(adapter.read_shutdown_marker("node-a").await.unwrap());
        adapter.delete_shutdown_marker("node-a").await.unwrap();
        assert!(!adapter.read_shutdown_marker("node-a").await.unwrap());
    }

    #[tokio::test]
    async fn connect_succeeds_immediately_when_reachable() {
        let adapter = StateStoreAdapter::connect(Arc::new(MemStore::new())).await;
        assert!(adapter.is_ok());
    }

    #[tokio::test]
    async fn cluster_config_defaults_empty_then_round_trips() {
        let adapter = StateStoreAdapter::new_unchecked(Arc::new(MemStore::new()));
        let initial = adapter.read_cluster_config().await.unwrap();
        assert_eq!(initial.epoch, 0);
        assert!(initial.nodes.is_empty());

        let mut config = initial;
        config.join(
            "node-a",
            hive_core::cluster::NodeInfo {
                region: "us-east-1".to_string(),
                az: "us-east-1a".to_string(),
                base_dir: "/var/lib/hived".to_string(),
                daemon_host: "10.0.0.1".to_string(),
            },
        );
        adapter.write_cluster_config(&config).await.unwrap();
        let loaded = adapter.read_cluster_config().await.unwrap();
        assert_eq!(loaded.epoch, config.epoch);
        assert!(loaded.nodes.contains_key("node-a"));
    }
}
