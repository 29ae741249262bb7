// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bus Router (§4.6): the static subscription table for the fleet-wide
//! worker-queue and fan-out subjects. Per-instance command subjects and the
//! dynamic `ec2.RunInstances.<type>` subjects are owned elsewhere (the
//! Launch Orchestrator and the Resource Registry respectively, §4.1, §4.5
//! step 5) since their subject names aren't known until runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::bus::{BusMessage, MessageBus};
use crate::error::DaemonResult;
use crate::orchestrator::LaunchOrchestrator;
use crate::registry::InstanceRegistry;
use crate::resource_registry::ResourceRegistry;

/// Dispatches the fleet-wide subjects onto the Launch Orchestrator and
/// serves read-only describe calls directly off the Instance Registry and
/// Resource Registry. Holds the admission gate the Shutdown Coordinator
/// closes during cluster shutdown's gate phase (§4.9).
pub struct BusRouter {
    bus: Arc<dyn MessageBus>,
    orchestrator: Arc<LaunchOrchestrator>,
    registry: Arc<InstanceRegistry>,
    resources: Arc<ResourceRegistry>,
    gate_closed: Arc<AtomicBool>,
}

impl BusRouter {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        orchestrator: Arc<LaunchOrchestrator>,
        registry: Arc<InstanceRegistry>,
        resources: Arc<ResourceRegistry>,
    ) -> Self {
        Self { bus, orchestrator, registry, resources, gate_closed: Arc::new(AtomicBool::new(false)) }
    }

    pub fn gate(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.gate_closed)
    }

    /// Subscribe every static subject (§4.6). Dynamic per-type and
    /// per-instance subjects are brought up by `ResourceRegistry::
    /// update_subscriptions` and the Launch Orchestrator respectively.
    pub async fn start(self: &Arc<Self>) -> DaemonResult<()> {
        self.spawn_queue_handler(hive_wire::subjects::EC2_START, Self::handle_start).await?;
        self.spawn_queue_handler(hive_wire::subjects::EC2_TERMINATE, Self::handle_terminate).await?;
        self.spawn_queue_handler(
            hive_wire::subjects::EC2_DESCRIBE_INSTANCES,
            Self::handle_describe_instances,
        )
        .await?;
        self.spawn_queue_handler(
            hive_wire::subjects::EC2_DESCRIBE_INSTANCE_TYPES,
            Self::handle_describe_instance_types,
        )
        .await?;
        self.spawn_fanout_handler(hive_wire::subjects::HIVE_NODES_DISCOVER, Self::handle_discover).await?;
        Ok(())
    }

    async fn spawn_queue_handler(
        self: &Arc<Self>,
        subject: &str,
        handler: fn(&Arc<Self>, BusMessage) -> futures_handler::BoxFut,
    ) -> DaemonResult<()> {
        let mut sub = self.bus.subscribe_queue(subject, "hived").await?;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(msg) = sub.receiver.recv().await {
                let this = Arc::clone(&this);
                tokio::spawn(handler(&this, msg));
            }
        });
        Ok(())
    }

    async fn spawn_fanout_handler(
        self: &Arc<Self>,
        subject: &str,
        handler: fn(&Arc<Self>, BusMessage) -> futures_handler::BoxFut,
    ) -> DaemonResult<()> {
        let mut sub = self.bus.subscribe(subject).await?;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(msg) = sub.receiver.recv().await {
                let this = Arc::clone(&this);
                tokio::spawn(handler(&this, msg));
            }
        });
        Ok(())
    }

    fn handle_start(self: &Arc<Self>, msg: BusMessage) -> futures_handler::BoxFut {
        let this = Arc::clone(self);
        Box::pin(async move {
            if this.gate_closed.load(Ordering::SeqCst) {
                reply(msg.reply, br#"{"error":"node is shutting down, not accepting admission work"}"#);
                return;
            }
            let Ok(req) = serde_json::from_slice::<hive_wire::StartStopTerminateRequest>(&msg.payload)
            else {
                reply(msg.reply, br#"{"error":"malformed request"}"#);
                return;
            };
            reply(msg.reply, b"{\"accepted\":true}");
            if let hive_wire::StartStopTerminateRequest::Start { instance_id } = req {
                this.orchestrator.handle_start(&instance_id).await;
            }
        })
    }

    fn handle_terminate(self: &Arc<Self>, msg: BusMessage) -> futures_handler::BoxFut {
        let this = Arc::clone(self);
        Box::pin(async move {
            let Ok(req) = serde_json::from_slice::<hive_wire::StartStopTerminateRequest>(&msg.payload)
            else {
                reply(msg.reply, br#"{"error":"malformed request"}"#);
                return;
            };
            reply(msg.reply, b"{\"accepted\":true}");
            if let hive_wire::StartStopTerminateRequest::Terminate { instance_id } = req {
                this.orchestrator.handle_terminate(&instance_id).await;
            }
        })
    }

    fn handle_describe_instances(self: &Arc<Self>, msg: BusMessage) -> futures_handler::BoxFut {
        let this = Arc::clone(self);
        Box::pin(async move {
            let descriptors: Vec<hive_wire::InstanceDescriptor> = this
                .registry
                .snapshot()
                .into_values()
                .map(|i| hive_wire::InstanceDescriptor {
                    instance_id: i.id.to_string(),
                    instance_type: i.instance_type.clone(),
                    state_code: i.state.code(),
                    state_name: i.state.external_name().to_string(),
                })
                .collect();
            match serde_json::to_vec(&descriptors) {
                Ok(body) => reply_owned(msg.reply, body),
                Err(e) => {
                    warn!(error = %e, "failed to encode describe-instances reply");
                    reply(msg.reply, br#"{"error":"internal error"}"#);
                }
            }
        })
    }

    fn handle_describe_instance_types(self: &Arc<Self>, msg: BusMessage) -> futures_handler::BoxFut {
        let this = Arc::clone(self);
        Box::pin(async move {
            let names: Vec<&str> = this.resources.types().iter().map(|t| t.name.as_str()).collect();
            match serde_json::to_vec(&names) {
                Ok(body) => reply_owned(msg.reply, body),
                Err(e) => {
                    warn!(error = %e, "failed to encode describe-instance-types reply");
                    reply(msg.reply, br#"{"error":"internal error"}"#);
                }
            }
        })
    }

    /// Answer a cluster-discovery ping by publishing our current status,
    /// the same payload the periodic publisher emits (§4.8).
    fn handle_discover(self: &Arc<Self>, _msg: BusMessage) -> futures_handler::BoxFut {
        let this = Arc::clone(self);
        Box::pin(async move {
            let status = hive_wire::hive_admin::NodeStatus {
                node: this.registry.node().to_string(),
                epoch: 0,
                instance_count: this.registry.len() as u32,
                allocated_vcpu: this.resources.allocated_vcpu(),
                allocated_memory_mib: this.resources.allocated_memory_mib(),
            };
            if let Ok(body) = serde_json::to_vec(&status) {
                let _ = this.bus.publish(hive_wire::subjects::HIVE_NODE_STATUS, body).await;
            }
        })
    }

    /// Gate phase of cluster shutdown (§4.9): stop accepting any new
    /// admission work. Unsubscribes every dynamic `ec2.RunInstances.<type>`
    /// subject and flips the flag `ec2.start` checks.
    pub async fn close_gate(&self) {
        self.gate_closed.store(true, Ordering::SeqCst);
        for ty in self.resources.types().iter() {
            let subject = hive_wire::subjects::run_instances(&ty.name);
            let _ = self.bus.unsubscribe(&subject).await;
        }
    }
}

fn reply(channel: Option<tokio::sync::oneshot::Sender<Vec<u8>>>, body: &[u8]) {
    if let Some(channel) = channel {
        let _ = channel.send(body.to_vec());
    }
}

fn reply_owned(channel: Option<tokio::sync::oneshot::Sender<Vec<u8>>>, body: Vec<u8>) {
    if let Some(channel) = channel {
        let _ = channel.send(body);
    }
}

/// A boxed future alias so the handler table can hold plain function
/// pointers instead of a closure-capturing trait object per subject.
mod futures_handler {
    use std::future::Future;
    use std::pin::Pin;

    pub type BoxFut = Pin<Box<dyn Future<Output = ()> + Send>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InProcessBus;
    use crate::hypervisor::HypervisorDriver;
    use crate::state_store::StateStoreAdapter;
    use crate::store::MemStore;
    use crate::volumes::fakes::{FakeNetworkPlumber, FakeVolumeService};
    use async_trait::async_trait;
    use hive_core::{Instance, InstanceType, InstanceTypeTable, ResourceLedger};

    struct NeverRunningHypervisor;

    #[async_trait]
    impl HypervisorDriver for NeverRunningHypervisor {
        fn build_args(
            &self,
            _instance: &Instance,
            _ty: &InstanceType,
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

    fn router() -> Arc<BusRouter> {
        let bus: Arc<dyn MessageBus> = Arc::new(InProcessBus::new());
        let store = Arc::new(StateStoreAdapter::new_unchecked(Arc::new(MemStore::new())));
        let registry = Arc::new(InstanceRegistry::new("node-a", Arc::clone(&store)));
        let types = InstanceTypeTable::standard();
        let ledger = ResourceLedger::new(4, 8192);
        let resources = Arc::new(ResourceRegistry::new(ledger, types, Arc::clone(&bus)));
        let orchestrator = Arc::new(LaunchOrchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&resources),
            store,
            Arc::new(NeverRunningHypervisor),
            Arc::clone(&bus),
            Arc::new(FakeVolumeService::default()),
            Arc::new(FakeNetworkPlumber::default()),
        ));
        Arc::new(BusRouter::new(bus, orchestrator, registry, resources))
    }

    #[tokio::test]
    async fn closing_the_gate_rejects_subsequent_start_requests() {
        let router = router();
        router.start().await.unwrap();
        router.close_gate().await;

        let req = hive_wire::StartStopTerminateRequest::Start { instance_id: "i-missing".to_string() };
        let body = serde_json::to_vec(&req).unwrap();
        let resp = router
            .bus
            .request(hive_wire::subjects::EC2_START, body, std::time::Duration::from_secs(1))
            .await
            .unwrap();
        let text = String::from_utf8(resp).unwrap();
        assert!(text.contains("shutting down"));
    }

    #[tokio::test]
    async fn describe_instances_replies_with_an_empty_list_when_nothing_is_owned() {
        let router = router();
        router.start().await.unwrap();
        let resp = router
            .bus
            .request(
                hive_wire::subjects::EC2_DESCRIBE_INSTANCES,
                Vec::new(),
                std::time::Duration::from_secs(1),
            )
            .await
            .unwrap();
        let descriptors: Vec<hive_wire::InstanceDescriptor> = serde_json::from_slice(&resp).unwrap();
        assert!(descriptors.is_empty());
    }
}
