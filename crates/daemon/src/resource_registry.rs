// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Resource Registry (§4.1): gates admission and keeps the bus's dynamic
//! `ec2.RunInstances.<type>` subscriptions in sync with current capacity.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use hive_core::{CoreError, InstanceTypeTable, ResourceLedger};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::bus::{MessageBus, Subscription};
use crate::error::DaemonResult;
use crate::orchestrator::LaunchOrchestrator;

pub struct ResourceRegistry {
    ledger: RwLock<ResourceLedger>,
    types: InstanceTypeTable,
    bus: Arc<dyn MessageBus>,
    /// Types currently subscribed on `ec2.RunInstances.<type>` (§4.1
    /// `UpdateSubscriptions`). Guarded by the same lock the spec calls out
    /// for the bus subscription map (§5): held only across subscribe/
    /// unsubscribe, never across a bus request.
    subscribed: RwLock<HashSet<String>>,
    /// The admission path each `ec2.RunInstances.<type>` handler dispatches
    /// to. Wired with `set_orchestrator` after construction, since the
    /// orchestrator itself holds a strong `Arc` back to this registry
    /// (§4.1, §4.5) — a strong reference here would cycle, so only a `Weak`
    /// one is kept.
    orchestrator: RwLock<Option<Weak<LaunchOrchestrator>>>,
}

impl ResourceRegistry {
    pub fn new(ledger: ResourceLedger, types: InstanceTypeTable, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            ledger: RwLock::new(ledger),
            types,
            bus,
            subscribed: RwLock::new(HashSet::new()),
            orchestrator: RwLock::new(None),
        }
    }

    /// Wires the Launch Orchestrator admission calls dispatch to. Must be
    /// called before the first `update_subscriptions` that actually admits a
    /// type, or `ec2.RunInstances.<type>` requests arriving before it is set
    /// are logged and dropped.
    pub fn set_orchestrator(&self, orchestrator: &Arc<LaunchOrchestrator>) {
        *self.orchestrator.write() = Some(Arc::downgrade(orchestrator));
    }

    pub fn types(&self) -> &InstanceTypeTable {
        &self.types
    }

    /// §4.1 fit rule, read-only.
    pub fn can_allocate(&self, instance_type: &str, count: u32) -> u32 {
        let Some(ty) = self.types.get(instance_type) else {
            return 0;
        };
        self.ledger.read().can_allocate(ty, count)
    }

    pub fn allocate(&self, instance_type: &str) -> Result<(), CoreError> {
        let ty = self
            .types
            .get(instance_type)
            .ok_or_else(|| CoreError::InvalidInstanceType(instance_type.to_string()))?;
        self.ledger.write().allocate(ty).map_err(|_| CoreError::InsufficientInstanceCapacity)
    }

    pub fn deallocate(&self, instance_type: &str) {
        if let Some(ty) = self.types.get(instance_type) {
            self.ledger.write().deallocate(ty);
        }
    }

    /// Current allocation, for the node-status fan-out payload (§4.8).
    pub fn allocated_vcpu(&self) -> u32 {
        self.ledger.read().allocated_vcpu()
    }

    pub fn allocated_memory_mib(&self) -> u64 {
        self.ledger.read().allocated_memory_mib()
    }

    /// `Available(showCapacity)` (§4.1): with `show_capacity`, one entry per
    /// free slot; otherwise one entry per admissible type.
    pub fn available(&self, show_capacity: bool) -> Vec<String> {
        let ledger = self.ledger.read();
        let mut out = Vec::new();
        for ty in self.types.iter() {
            let slots = ledger.can_allocate(ty, u32::MAX);
            if slots == 0 {
                continue;
            }
            if show_capacity {
                out.extend(std::iter::repeat(ty.name.clone()).take(slots as usize));
            } else {
                out.push(ty.name.clone());
            }
        }
        out
    }

    /// Recompute per-type admissibility and (un)subscribe the dynamic
    /// `ec2.RunInstances.<type>` worker-queue subjects (§4.1, §4.6).
    pub async fn update_subscriptions(&self) -> DaemonResult<()> {
        let admissible: HashSet<String> = {
            let ledger = self.ledger.read();
            self.types
                .iter()
                .filter(|ty| ledger.can_allocate(ty, 1) > 0)
                .map(|ty| ty.name.clone())
                .collect()
        };

        let to_subscribe: Vec<String> = {
            let subscribed = self.subscribed.read();
            admissible.difference(&subscribed).cloned().collect()
        };
        let to_unsubscribe: Vec<String> = {
            let subscribed = self.subscribed.read();
            subscribed.difference(&admissible).cloned().collect()
        };

        for ty in &to_subscribe {
            let subject = hive_wire::subjects::run_instances(ty);
            let sub = self.bus.subscribe_queue(&subject, "hived").await?;
            self.spawn_run_instances_handler(ty.clone(), sub);
            info!(instance_type = %ty, subject = %subject, "subscribed run-instances topic");
        }
        for ty in &to_unsubscribe {
            let subject = hive_wire::subjects::run_instances(ty);
            self.bus.unsubscribe(&subject).await?;
            debug!(instance_type = %ty, subject = %subject, "unsubscribed run-instances topic");
        }

        let mut subscribed = self.subscribed.write();
        *subscribed = admissible;
        Ok(())
    }

    /// Drains one `ec2.RunInstances.<type>` worker-queue subscription: every
    /// message is a `RunInstancesInput`, decoded and handed to the Launch
    /// Orchestrator, with the `Reservation` (or an error) sent back on the
    /// message's own reply channel (§2 data flow, §6, §8 scenario 1).
    fn spawn_run_instances_handler(&self, instance_type: String, mut sub: Subscription) {
        let orchestrator = self.orchestrator.read().clone();
        tokio::spawn(async move {
            while let Some(msg) = sub.receiver.recv().await {
                let reply = msg.reply;
                let Some(orchestrator) = orchestrator.as_ref().and_then(Weak::upgrade) else {
                    warn!(instance_type = %instance_type, "run-instances request arrived with no orchestrator wired, dropping");
                    if let Some(reply) = reply {
                        let _ = reply.send(br#"{"error":"node not ready"}"#.to_vec());
                    }
                    continue;
                };
                let input: hive_wire::RunInstancesInput = match serde_json::from_slice(&msg.payload) {
                    Ok(input) => input,
                    Err(e) => {
                        if let Some(reply) = reply {
                            let _ = reply.send(format!(r#"{{"error":"malformed request: {e}"}}"#).into_bytes());
                        }
                        continue;
                    }
                };
                tokio::spawn(async move {
                    let result = orchestrator.run_instances(input).await;
                    let Some(reply) = reply else { return };
                    let body = match result {
                        Ok(reservation) => serde_json::to_vec(&reservation)
                            .unwrap_or_else(|e| format!(r#"{{"error":"{e}"}}"#).into_bytes()),
                        Err(e) => format!(r#"{{"error":"{e}"}}"#).into_bytes(),
                    };
                    let _ = reply.send(body);
                });
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InProcessBus;
    use hive_core::InstanceTypeTable;

    fn registry() -> ResourceRegistry {
        let types = InstanceTypeTable::standard();
        let ledger = ResourceLedger::new(4, 8192);
        ResourceRegistry::new(ledger, types, Arc::new(InProcessBus::new()))
    }

    #[test]
    fn can_allocate_reflects_ledger_fit_rule() {
        let reg = registry();
        assert!(reg.can_allocate("t3.nano", 10) > 0);
        assert_eq!(reg.can_allocate("no.such.type", 1), 0);
    }

    #[test]
    fn allocate_deallocate_round_trip_restores_capacity() {
        let reg = registry();
        let before = reg.can_allocate("t3.micro", 10);
        reg.allocate("t3.micro").unwrap();
        assert!(reg.can_allocate("t3.micro", 10) < before);
        reg.deallocate("t3.micro");
        assert_eq!(reg.can_allocate("t3.micro", 10), before);
    }

    #[tokio::test]
    async fn update_subscriptions_subscribes_admissible_types_only() {
        let reg = registry();
        reg.update_subscriptions().await.unwrap();
        assert!(reg.subscribed.read().contains("t3.nano"));
    }

    #[tokio::test]
    async fn saturating_a_type_unsubscribes_it() {
        let types = InstanceTypeTable::standard();
        // Just enough for one m5.2xlarge (8 vCPU, 32 GiB), nothing left over.
        let ledger = ResourceLedger::new(8, 32768);
        let reg = ResourceRegistry::new(ledger, types, Arc::new(InProcessBus::new()));
        reg.update_subscriptions().await.unwrap();
        assert!(reg.subscribed.read().contains("m5.2xlarge"));
        reg.allocate("m5.2xlarge").unwrap();
        reg.update_subscriptions().await.unwrap();
        assert!(!reg.subscribed.read().contains("m5.2xlarge"));
    }

    // §8 scenario 1 / §2 data flow: a RunInstances request published on the
    // dynamic subject must actually reach the orchestrator and come back
    // with a reservation, not just sit subscribed with nothing draining it.
    #[tokio::test]
    async fn a_run_instances_request_on_the_dynamic_subject_reaches_the_orchestrator() {
        use crate::hypervisor::{HypervisorDriver, LaunchSpec};
        use crate::orchestrator::LaunchOrchestrator;
        use crate::registry::InstanceRegistry;
        use crate::state_store::StateStoreAdapter;
        use crate::store::MemStore;
        use crate::volumes::fakes::{FakeNetworkPlumber, FakeVolumeService};
        use async_trait::async_trait;
        use hive_core::{Instance, InstanceType};

        struct NeverRunningHypervisor;

        #[async_trait]
        impl HypervisorDriver for NeverRunningHypervisor {
            fn build_args(&self, _instance: &Instance, _ty: &InstanceType) -> DaemonResult<LaunchSpec> {
                Err(crate::error::DaemonError::SpawnFailed("unused in this test".to_string()))
            }
            async fn spawn(&self, _spec: &LaunchSpec) -> DaemonResult<u32> {
                Err(crate::error::DaemonError::SpawnFailed("unused in this test".to_string()))
            }
            async fn await_exit(&self, _pid: u32) -> DaemonResult<i32> {
                Ok(0)
            }
            fn is_running(&self, _instance: &Instance) -> bool {
                false
            }
        }

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
        resources.set_orchestrator(&orchestrator);
        resources.update_subscriptions().await.unwrap();

        let input = hive_wire::RunInstancesInput {
            instance_type: "t3.nano".to_string(),
            image_id: "ami-1".to_string(),
            min_count: 1,
            max_count: 1,
            key_name: None,
            eni_id: None,
            owner: "alice".to_string(),
        };
        let subject = hive_wire::subjects::run_instances("t3.nano");
        let body = serde_json::to_vec(&input).unwrap();
        let resp = bus.request(&subject, body, std::time::Duration::from_secs(1)).await.unwrap();
        let reservation: hive_wire::Reservation = serde_json::from_slice(&resp).unwrap();
        assert_eq!(reservation.instances.len(), 1);
        assert_eq!(reservation.owner, "alice");
    }
}
