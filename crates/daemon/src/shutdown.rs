// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shutdown Coordinator (§4.9): signal-driven local shutdown plus the
//! RPC-driven, five-phase cluster shutdown protocol.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hive_wire::subjects::ShutdownPhase;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::MessageBus;
use crate::error::DaemonResult;
use crate::orchestrator::LaunchOrchestrator;
use crate::registry::InstanceRegistry;
use crate::router::BusRouter;
use crate::state_store::StateStoreAdapter;
use crate::volumes::NetworkPlumber;

pub struct ShutdownCoordinator {
    node: String,
    bus: Arc<dyn MessageBus>,
    registry: Arc<InstanceRegistry>,
    orchestrator: Arc<LaunchOrchestrator>,
    router: Arc<BusRouter>,
    state_store: Arc<StateStoreAdapter>,
    network: Arc<dyn NetworkPlumber>,
    root_token: CancellationToken,
    /// Set once a cluster-wide shutdown's drain phase has run, so the
    /// signal handler's local path knows not to stop instances twice
    /// (§4.9: "if a cluster shutdown is in progress skip VM stop").
    cluster_drained: Arc<AtomicBool>,
}

impl ShutdownCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node: String,
        bus: Arc<dyn MessageBus>,
        registry: Arc<InstanceRegistry>,
        orchestrator: Arc<LaunchOrchestrator>,
        router: Arc<BusRouter>,
        state_store: Arc<StateStoreAdapter>,
        network: Arc<dyn NetworkPlumber>,
        root_token: CancellationToken,
    ) -> Self {
        Self {
            node,
            bus,
            registry,
            orchestrator,
            router,
            state_store,
            network,
            root_token,
            cluster_drained: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe the five cluster-shutdown fan-out subjects (§4.9). Every
    /// node answers independently; the caller driving the cluster shutdown
    /// aggregates replies and decides whether to proceed to the next phase.
    pub async fn start(self: &Arc<Self>) -> DaemonResult<()> {
        for phase in ShutdownPhase::ALL {
            let subject = phase.subject();
            let mut sub = self.bus.subscribe(&subject).await?;
            let this = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(msg) = sub.receiver.recv().await {
                    let this = Arc::clone(&this);
                    let result = this.run_phase(phase).await;
                    if let Some(reply) = msg.reply {
                        let body = match result {
                            Ok(()) => b"{\"ok\":true}".to_vec(),
                            Err(e) => format!(r#"{{"ok":false,"error":"{e}"}}"#).into_bytes(),
                        };
                        let _ = reply.send(body);
                    }
                }
            });
        }
        Ok(())
    }

    async fn run_phase(&self, phase: ShutdownPhase) -> DaemonResult<()> {
        info!(node = %self.node, phase = phase.as_str(), "cluster shutdown: running phase");
        match phase {
            ShutdownPhase::Gate => {
                self.router.close_gate().await;
            }
            ShutdownPhase::Drain => {
                self.orchestrator.stop_all(false).await;
                self.cluster_drained.store(true, Ordering::SeqCst);
            }
            ShutdownPhase::Storage => {
                // Best-effort: ask the EBS side to sync/flush before the
                // infra phase tears down plumbing underneath it.
                let timeout = Duration::from_secs(10);
                if let Err(e) = self.bus.request(hive_wire::subjects::EBS_SYNC, Vec::new(), timeout).await {
                    warn!(error = %e, "cluster shutdown: storage quiesce request failed, continuing");
                }
            }
            ShutdownPhase::Persist => {
                self.registry.persist().await?;
                self.state_store.write_shutdown_marker(&self.node).await?;
            }
            ShutdownPhase::Infra => {
                for (id, instance) in self.registry.snapshot() {
                    if let Some(net) = instance.network.as_ref() {
                        if net.auto_created {
                            self.network.release_eni(&net.eni_id).await;
                        }
                    }
                    self.network.remove_tap(&format!("tap-{id}")).await;
                }
            }
        }
        Ok(())
    }

    /// Install SIGINT/SIGTERM/SIGHUP handlers for local graceful shutdown
    /// (§4.9). Runs once; returns once a signal has been handled and the
    /// root context cancelled.
    pub async fn run_local_shutdown(self: &Arc<Self>) {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to install SIGINT handler");
                return;
            }
        };
        let mut sighup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to install SIGHUP handler");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
            _ = sighup.recv() => info!("received SIGHUP"),
        }

        self.root_token.cancel();

        if self.cluster_drained.load(Ordering::SeqCst) {
            info!("cluster shutdown already drained instances on this node, skipping local VM stop");
        } else {
            self.orchestrator.stop_all(false).await;
        }

        for phase in ShutdownPhase::ALL {
            let subject = phase.subject();
            let _ = self.bus.unsubscribe(&subject).await;
        }

        if let Err(e) = self.registry.persist().await {
            warn!(error = %e, "failed to flush instance state during local shutdown");
        }
        if let Err(e) = self.state_store.write_shutdown_marker(&self.node).await {
            warn!(error = %e, "failed to write clean-shutdown marker");
        }

        info!("local shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InProcessBus;
    use crate::hypervisor::HypervisorDriver;
    use crate::resource_registry::ResourceRegistry;
    use crate::store::MemStore;
    use crate::volumes::fakes::{FakeNetworkPlumber, FakeVolumeService};
    use async_trait::async_trait;
    use hive_core::{Instance, InstanceTypeTable, ResourceLedger};

    struct NeverRunningHypervisor;

    #[async_trait]
    impl HypervisorDriver for NeverRunningHypervisor {
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

    fn coordinator() -> Arc<ShutdownCoordinator> {
        let bus: Arc<dyn MessageBus> = Arc::new(InProcessBus::new());
        let store = Arc::new(StateStoreAdapter::new_unchecked(Arc::new(MemStore::new())));
        let registry = Arc::new(InstanceRegistry::new("node-a", Arc::clone(&store)));
        let types = InstanceTypeTable::standard();
        let ledger = ResourceLedger::new(4, 8192);
        let resources = Arc::new(ResourceRegistry::new(ledger, types, Arc::clone(&bus)));
        let orchestrator = Arc::new(LaunchOrchestrator::new(
            Arc::clone(&registry),
            resources,
            Arc::clone(&store),
            Arc::new(NeverRunningHypervisor),
            Arc::clone(&bus),
            Arc::new(FakeVolumeService::default()),
            Arc::new(FakeNetworkPlumber::default()),
        ));
        let network = Arc::new(FakeNetworkPlumber::default());
        let router = Arc::new(BusRouter::new(
            Arc::clone(&bus),
            Arc::clone(&orchestrator),
            Arc::clone(&registry),
            Arc::new(ResourceRegistry::new(
                ResourceLedger::new(4, 8192),
                InstanceTypeTable::standard(),
                Arc::clone(&bus),
            )),
        ));
        Arc::new(ShutdownCoordinator::new(
            "node-a".to_string(),
            bus,
            registry,
            orchestrator,
            router,
            store,
            network,
            CancellationToken::new(),
        ))
    }

    #[tokio::test]
    async fn gate_phase_closes_the_router_gate() {
        let coordinator = coordinator();
        coordinator.run_phase(ShutdownPhase::Gate).await.unwrap();
        assert!(coordinator.router.gate().load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn persist_phase_writes_the_clean_shutdown_marker() {
        let coordinator = coordinator();
        coordinator.run_phase(ShutdownPhase::Persist).await.unwrap();
        assert!(coordinator.state_store.read_shutdown_marker("node-a").await.unwrap());
    }
}
