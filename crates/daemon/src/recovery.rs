// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Recovery Engine (§4.7): reconciles the persisted owned-instance map
//! against live hypervisor processes after a restart, before the Bus Router
//! starts accepting new admission work.
//!
//! Runs once, at startup, in this order: settle, load, reconcile each
//! instance by its persisted state, re-persist, then bring subscriptions
//! back in line with whatever capacity recovery actually reserved.

use std::collections::HashMap;
use std::sync::Arc;

use hive_core::instance::RuntimeHandle;
use hive_core::{Instance, InstanceId, InstanceState, StateReason};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::config::recovery_settle;
use crate::error::DaemonResult;
use crate::hypervisor::HypervisorDriver;
use crate::orchestrator::LaunchOrchestrator;
use crate::registry::InstanceRegistry;
use crate::resource_registry::ResourceRegistry;
use crate::state_store::StateStoreAdapter;

/// At most this many relaunches run concurrently (§4.7 step 4).
const MAX_CONCURRENT_RELAUNCHES: usize = 2;

/// Runs the full restart-time reconciliation pass (§4.7).
pub async fn recover(
    registry: &Arc<InstanceRegistry>,
    resources: &Arc<ResourceRegistry>,
    state_store: &Arc<StateStoreAdapter>,
    hypervisor: &Arc<dyn HypervisorDriver>,
    orchestrator: &Arc<LaunchOrchestrator>,
) -> DaemonResult<()> {
    let node = registry.node().to_string();

    // Step 1: the clean-shutdown marker distinguishes a graceful exit from a
    // crash. Its absence means peer KV replicas may still be converging, so
    // give them a moment before trusting what we read. The marker itself is
    // deleted in step 5, not here.
    if state_store.read_shutdown_marker(&node).await? {
        info!(node = %node, "recovery: clean-shutdown marker present, prior exit was graceful");
    } else {
        info!(node = %node, "recovery: no clean-shutdown marker, treating as crash recovery");
        tokio::time::sleep(recovery_settle()).await;
    }

    // Step 2.
    let persisted = state_store.load_state(&node).await?;
    info!(node = %node, count = persisted.len(), "recovery: reconciling persisted instance map");

    // Step 3: classify every persisted record. `to_relaunch` collects the
    // ones reset to `pending` here, launched under a bounded semaphore below.
    let mut to_relaunch = Vec::new();
    for (id_str, mut instance) in persisted {
        let id = instance.id;
        debug_assert_eq!(id_str, id.to_string());
        if let Some(id) = reconcile_one(
            &mut instance,
            registry,
            resources,
            state_store,
            hypervisor,
            orchestrator,
            &node,
        )
        .await
        {
            to_relaunch.push(id);
        }
    }

    registry.persist().await?;

    // Step 4: relaunch crashed instances with bounded concurrency so a host
    // full of stale records doesn't thunder-herd the hypervisor.
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_RELAUNCHES));
    let mut handles = Vec::with_capacity(to_relaunch.len());
    for id in to_relaunch {
        let orchestrator = Arc::clone(orchestrator);
        let semaphore = Arc::clone(&semaphore);
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            if let Err(e) = orchestrator.launch_instance(id).await {
                warn!(instance_id = %id, error = %e, "recovery: relaunch failed");
            }
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }

    // Step 5.
    registry.persist().await?;
    resources.update_subscriptions().await?;
    state_store.delete_shutdown_marker(&node).await?;
    info!(node = %node, count = registry.len(), "recovery: reconciliation complete");
    Ok(())
}

/// Classifies and reconciles one persisted record (§4.7 step 3). Returns
/// `Some(id)` when the instance was reset to `pending` and needs relaunching.
#[allow(clippy::too_many_arguments)]
async fn reconcile_one(
    instance: &mut Instance,
    registry: &Arc<InstanceRegistry>,
    resources: &Arc<ResourceRegistry>,
    state_store: &Arc<StateStoreAdapter>,
    hypervisor: &Arc<dyn HypervisorDriver>,
    orchestrator: &Arc<LaunchOrchestrator>,
    node: &str,
) -> Option<InstanceId> {
    let id = instance.id;

    if instance.state == InstanceState::Terminated {
        // Retained only for query history; dropped from the owned map here,
        // not relevant to this node's restart reconciliation.
        return None;
    }

    if instance.state == InstanceState::Stopped {
        instance.launch.last_node = node.to_string();
        migrate_to_stopped(state_store, instance, &id).await;
        return None;
    }

    if !resources.types().contains(&instance.instance_type) {
        // The cluster moved this VM to a host that cannot satisfy its type.
        warn!(instance_id = %id, instance_type = %instance.instance_type, "recovery: instance type unavailable on this host, parking as stopped");
        instance.state = InstanceState::Stopped;
        instance.state_reason = Some(StateReason::new("InsufficientInstanceCapacity"));
        instance.launch.last_node = node.to_string();
        migrate_to_stopped(state_store, instance, &id).await;
        return None;
    }

    if hypervisor.is_running(instance) {
        // A live process survived the restart: take ownership without
        // passing through the state machine (§4.7 step 3).
        instance.runtime.monitor_connected = false;
        registry.insert(instance.clone());
        if let Err(e) = resources.allocate(&instance.instance_type) {
            warn!(instance_id = %id, error = %e, "recovery: failed to re-reserve capacity for a re-owned instance");
        }
        registry.set_state_unchecked(&id, InstanceState::Running);
        match orchestrator.reattach_running(id).await {
            Ok(()) => info!(instance_id = %id, "recovery: re-owned live instance"),
            Err(e) => {
                warn!(instance_id = %id, error = %e, "recovery: failed to reattach monitor, marking error");
                registry.set_state_unchecked(&id, InstanceState::Error);
            }
        }
        return None;
    }

    // No surviving process. Finalize whatever was already in flight;
    // anything that hadn't reached a terminal teardown state is reset to
    // pending and relaunched (§4.7 step 3, §8 scenario 5).
    match instance.state {
        InstanceState::Stopping => {
            info!(instance_id = %id, "recovery: finalizing interrupted stop");
            instance.state = InstanceState::Stopped;
            instance.launch.last_node = node.to_string();
            migrate_to_stopped(state_store, instance, &id).await;
            None
        }
        InstanceState::ShuttingDown => {
            info!(instance_id = %id, "recovery: finalizing interrupted terminate");
            // §4.7 step 3: finalize shutting-down -> terminated rather than
            // dropping the record outright; a terminated instance is kept
            // for query history until garbage-collected (§3).
            instance.state = InstanceState::Terminated;
            instance.launch.last_node = node.to_string();
            registry.insert(instance.clone());
            None
        }
        InstanceState::Pending | InstanceState::Provisioning | InstanceState::Running => {
            info!(instance_id = %id, "recovery: no surviving process, resetting to pending for relaunch");
            if let Err(e) = resources.allocate(&instance.instance_type) {
                warn!(instance_id = %id, error = %e, "recovery: failed to re-reserve capacity ahead of relaunch");
            }
            instance.state = InstanceState::Pending;
            instance.state_reason = None;
            instance.runtime = RuntimeHandle::default();
            registry.insert(instance.clone());
            Some(id)
        }
        InstanceState::Stopped | InstanceState::Terminated | InstanceState::Error => {
            registry.insert(instance.clone());
            None
        }
    }
}

/// A stopped instance lives in the shared cluster-wide map, never in a
/// node's owned map (§3 invariant 4). The per-instance command subjects are
/// not re-subscribed for it.
async fn migrate_to_stopped(state_store: &Arc<StateStoreAdapter>, instance: &Instance, id: &InstanceId) {
    if let Err(e) = state_store.write_stopped_instance(id.as_str(), instance).await {
        warn!(instance_id = %id, error = %e, "recovery: failed to migrate instance to the shared stopped map");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{InProcessBus, MessageBus};
    use crate::volumes::fakes::{FakeNetworkPlumber, FakeVolumeService};
    use crate::store::MemStore;
    use async_trait::async_trait;
    use hive_core::instance::{LaunchMetadata, RuntimeHandle};
    use hive_core::{InstanceId, InstanceTypeTable, ResourceLedger};

    struct AlwaysDownHypervisor;

    #[async_trait]
    impl HypervisorDriver for AlwaysDownHypervisor {
        fn build_args(
            &self,
            _instance: &Instance,
            _ty: &hive_core::InstanceType,
        ) -> DaemonResult<crate::hypervisor::LaunchSpec> {
            Err(crate::error::DaemonError::SpawnFailed("unused in this test".to_string()))
        }
        async fn spawn(&self, _spec: &crate::hypervisor::LaunchSpec) -> DaemonResult<u32> {
            Err(crate::error::DaemonError::SpawnFailed("unused in this test".to_string()))
        }
        async fn await_exit(&self, _pid: u32) -> DaemonResult<i32> {
            Ok(0)
        }
        fn is_running(&self, _instance: &Instance) -> bool {
            false
        }
    }

    fn sample(id: InstanceId, state: InstanceState) -> Instance {
        Instance {
            id,
            instance_type: "t3.micro".to_string(),
            volumes: Vec::new(),
            network: None,
            state,
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

    async fn harness() -> (
        Arc<InstanceRegistry>,
        Arc<ResourceRegistry>,
        Arc<StateStoreAdapter>,
        Arc<dyn HypervisorDriver>,
        Arc<LaunchOrchestrator>,
    ) {
        let bus: Arc<dyn MessageBus> = Arc::new(InProcessBus::new());
        let store = Arc::new(StateStoreAdapter::new_unchecked(Arc::new(MemStore::new())));
        let registry = Arc::new(InstanceRegistry::new("node-a", Arc::clone(&store)));
        let types = InstanceTypeTable::standard();
        let ledger = ResourceLedger::new(4, 8192);
        let resources = Arc::new(ResourceRegistry::new(ledger, types, Arc::clone(&bus)));
        let hypervisor: Arc<dyn HypervisorDriver> = Arc::new(AlwaysDownHypervisor);
        let orchestrator = Arc::new(LaunchOrchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&resources),
            Arc::clone(&store),
            Arc::clone(&hypervisor),
            bus,
            Arc::new(FakeVolumeService::default()),
            Arc::new(FakeNetworkPlumber::default()),
        ));
        (registry, resources, store, hypervisor, orchestrator)
    }

    #[tokio::test]
    async fn a_pending_instance_with_no_live_process_is_relaunched_and_fails_with_no_hypervisor() {
        let (registry, resources, store, hypervisor, orchestrator) = harness().await;
        let id = InstanceId::new();
        let mut snapshot = HashMap::new();
        snapshot.insert(id.to_string(), sample(id, InstanceState::Pending));
        store.write_state("node-a", &snapshot).await.unwrap();

        recover(&registry, &resources, &store, &hypervisor, &orchestrator).await.unwrap();

        // §8 scenario 5: recovery resets a mid-launch instance to pending and
        // relaunches it rather than failing it out directly. With a
        // hypervisor that can never spawn, the relaunch attempt itself fails.
        assert_eq!(registry.get(&id).unwrap().state, InstanceState::ShuttingDown);
    }

    #[tokio::test]
    async fn a_running_instance_with_no_surviving_process_is_reset_to_pending_and_relaunched() {
        let (registry, resources, store, hypervisor, orchestrator) = harness().await;
        let id = InstanceId::new();
        let mut snapshot = HashMap::new();
        snapshot.insert(id.to_string(), sample(id, InstanceState::Running));
        store.write_state("node-a", &snapshot).await.unwrap();

        recover(&registry, &resources, &store, &hypervisor, &orchestrator).await.unwrap();

        // Reset running -> pending happens unconditionally (§4.7 step 3);
        // the subsequent relaunch then fails because the process never comes up.
        assert_eq!(registry.get(&id).unwrap().state, InstanceState::ShuttingDown);
    }

    #[tokio::test]
    async fn a_stopping_instance_with_no_surviving_process_finalizes_to_the_shared_stopped_map() {
        let (registry, resources, store, hypervisor, orchestrator) = harness().await;
        let id = InstanceId::new();
        let mut snapshot = HashMap::new();
        snapshot.insert(id.to_string(), sample(id, InstanceState::Stopping));
        store.write_state("node-a", &snapshot).await.unwrap();

        recover(&registry, &resources, &store, &hypervisor, &orchestrator).await.unwrap();

        assert!(registry.get(&id).is_none());
        let stopped = store.read_stopped_instance(id.as_str()).await.unwrap();
        assert_eq!(stopped.unwrap().state, InstanceState::Stopped);
    }

    #[tokio::test]
    async fn a_shutting_down_instance_with_no_surviving_process_finalizes_to_terminated() {
        let (registry, resources, store, hypervisor, orchestrator) = harness().await;
        let id = InstanceId::new();
        let mut snapshot = HashMap::new();
        snapshot.insert(id.to_string(), sample(id, InstanceState::ShuttingDown));
        store.write_state("node-a", &snapshot).await.unwrap();

        recover(&registry, &resources, &store, &hypervisor, &orchestrator).await.unwrap();

        // §4.7 step 3 finalizes shutting-down -> terminated rather than
        // dropping the record; terminated instances are retained for query
        // history until garbage-collected (§3).
        assert_eq!(registry.get(&id).unwrap().state, InstanceState::Terminated);
    }

    #[tokio::test]
    async fn an_already_stopped_instance_migrates_out_of_the_owned_map() {
        let (registry, resources, store, hypervisor, orchestrator) = harness().await;
        let id = InstanceId::new();
        let mut snapshot = HashMap::new();
        snapshot.insert(id.to_string(), sample(id, InstanceState::Stopped));
        store.write_state("node-a", &snapshot).await.unwrap();

        recover(&registry, &resources, &store, &hypervisor, &orchestrator).await.unwrap();

        assert!(registry.get(&id).is_none());
        assert!(store.read_stopped_instance(id.as_str()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn an_unknown_instance_type_is_parked_as_stopped() {
        let (registry, resources, store, hypervisor, orchestrator) = harness().await;
        let id = InstanceId::new();
        let mut instance = sample(id, InstanceState::Running);
        instance.instance_type = "no.such.type".to_string();
        let mut snapshot = HashMap::new();
        snapshot.insert(id.to_string(), instance);
        store.write_state("node-a", &snapshot).await.unwrap();

        recover(&registry, &resources, &store, &hypervisor, &orchestrator).await.unwrap();

        assert!(registry.get(&id).is_none());
        let stopped = store.read_stopped_instance(id.as_str()).await.unwrap().unwrap();
        assert_eq!(stopped.state_reason, Some(StateReason::new("InsufficientInstanceCapacity")));
    }

    #[tokio::test]
    async fn terminal_states_pass_through_untouched() {
        let (registry, resources, store, hypervisor, orchestrator) = harness().await;
        let id = InstanceId::new();
        let mut snapshot = HashMap::new();
        snapshot.insert(id.to_string(), sample(id, InstanceState::Terminated));
        store.write_state("node-a", &snapshot).await.unwrap();

        recover(&registry, &resources, &store, &hypervisor, &orchestrator).await.unwrap();

        assert!(registry.get(&id).is_none());
    }
}
