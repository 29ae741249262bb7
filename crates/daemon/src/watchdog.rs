// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Watchdogs and heartbeat (§4.8): the monitor heartbeat probe spawned per
//! launched instance, the periodic sweep for instances stuck mid-launch, the
//! cluster-readiness gate new admission work waits behind at startup, and
//! the node-status fan-out publisher.

use std::sync::Arc;
use std::time::Duration;

use hive_core::{InstanceId, InstanceState, StateReason};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::MessageBus;
use crate::config::{heartbeat_interval, pending_watchdog_interval, pending_timeout, readiness_timeout};
use crate::error::DaemonResult;
use crate::monitor::{MonitorChannel, MonitorCommand};
use crate::registry::InstanceRegistry;
use crate::resource_registry::ResourceRegistry;
use crate::state_store::StateStoreAdapter;

/// Periodically probes the guest monitor to confirm the channel is still
/// responsive. Purely diagnostic (§4.4, §9): a failed probe is logged, never
/// turned into a state transition by this task. A guest that stops
/// responding to its monitor either crashes outright (caught by `is_running`
/// the next time a command handler checks it) or is caught on the next
/// restart's recovery pass.
pub fn spawn_heartbeat(monitor: Arc<MonitorChannel>, id: InstanceId, token: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(heartbeat_interval());
        interval.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    let cmd = MonitorCommand { execute: "query-status".to_string(), arguments: None };
                    match monitor.call(cmd).await {
                        Ok(_) => debug!(instance_id = %id, "monitor heartbeat ok"),
                        Err(e) => {
                            warn!(instance_id = %id, error = %e, "monitor heartbeat failed");
                            break;
                        }
                    }
                }
            }
        }
    });
}

/// Sweeps owned instances stuck in `pending`/`provisioning` past
/// `pending_timeout` and fails them out with reason `launch_timeout`
/// (§4.8, §7). A launch that never reaches `running` or `shutting-down` on
/// its own — a hung mount call, a wedged monitor handshake — would otherwise
/// hold capacity forever.
pub fn spawn_pending_watchdog(
    registry: Arc<InstanceRegistry>,
    resources: Arc<ResourceRegistry>,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(pending_watchdog_interval());
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => sweep_pending(&registry, &resources).await,
            }
        }
    });
}

async fn sweep_pending(registry: &InstanceRegistry, resources: &ResourceRegistry) {
    let now = epoch_ms();
    let timeout_ms = pending_timeout().as_millis() as u64;
    let stuck: Vec<(InstanceId, String)> = registry
        .snapshot()
        .into_iter()
        .filter(|(_, inst)| matches!(inst.state, InstanceState::Pending | InstanceState::Provisioning))
        .filter(|(_, inst)| now.saturating_sub(inst.launch.launch_time_ms) > timeout_ms)
        .map(|(id, inst)| (id, inst.instance_type))
        .collect();

    for (id, instance_type) in stuck {
        warn!(instance_id = %id, "pending watchdog: launch exceeded timeout, failing out");
        match registry
            .transition(&id, InstanceState::ShuttingDown, Some(StateReason::new("launch_timeout")))
            .await
        {
            Ok(_) => {
                resources.deallocate(&instance_type);
                let _ = resources.update_subscriptions().await;
            }
            Err(e) => warn!(instance_id = %id, error = %e, "pending watchdog failed to record launch_timeout"),
        }
    }
}

/// Blocks admission work until the bus transport reports itself connected
/// and the object store is TCP-reachable, bounded by `readiness_timeout`
/// (§4.8 cluster-readiness gate). A timeout is not fatal: the spec calls for
/// proceeding either way with a warning, so this always returns `Ok`.
pub async fn await_cluster_ready(bus: &dyn MessageBus, store: &StateStoreAdapter) -> DaemonResult<()> {
    let deadline = tokio::time::Instant::now() + readiness_timeout();
    loop {
        if bus.is_connected().await && store.is_reachable().await {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            warn!("cluster-readiness gate timed out waiting for bus/store, proceeding anyway (§4.8)");
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

/// Publishes this node's status to the `hive.node.status` fan-out subject on
/// the same cadence as the heartbeat (§4.8).
pub fn spawn_node_status_publisher(
    node: String,
    epoch: u64,
    bus: Arc<dyn MessageBus>,
    registry: Arc<InstanceRegistry>,
    resources: Arc<ResourceRegistry>,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(heartbeat_interval());
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    let status = hive_wire::hive_admin::NodeStatus {
                        node: node.clone(),
                        epoch,
                        instance_count: registry.len() as u32,
                        allocated_vcpu: resources.allocated_vcpu(),
                        allocated_memory_mib: resources.allocated_memory_mib(),
                    };
                    match serde_json::to_vec(&status) {
                        Ok(body) => {
                            if let Err(e) = bus.publish(hive_wire::subjects::HIVE_NODE_STATUS, body).await {
                                warn!(error = %e, "failed to publish node status");
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to encode node status"),
                    }
                }
            }
        }
    });
}

fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
