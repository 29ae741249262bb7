// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The owned-instance collection (§3 invariants 1/4/5, §4.4 `TransitionState`, §5).
//!
//! `InstanceRegistry` holds the single collection lock every multi-field
//! read or write acquires (§5: "Instances map: a single collection lock
//! guards insertion, deletion, and state-field mutation"). The I/O-bearing
//! `TransitionState` primitive lives here, not in `hive-core`, because it
//! persists through the State Store Adapter before releasing the lock
//! (§4.4) — pure transition-table validation stays in `hive_core::state_machine`.
//!
//! Live runtime handles (the monitor client, the heartbeat cancellation
//! token) are kept in a side table here rather than on the persisted
//! `Instance` record, since neither is serializable and both are rebuilt by
//! the Recovery Engine on restart (§4.7 step 3, §3: "reinitialise transient
//! fields").

use std::collections::HashMap;
use std::sync::Arc;

use hive_core::state_machine::validate_transition;
use hive_core::{CoreError, Instance, InstanceId, InstanceState, StateReason};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{DaemonError, DaemonResult};
use crate::monitor::MonitorChannel;
use crate::state_store::StateStoreAdapter;

pub struct InstanceRegistry {
    node: String,
    instances: Mutex<HashMap<InstanceId, Instance>>,
    launch_locks: Mutex<HashMap<InstanceId, Arc<tokio::sync::Mutex<()>>>>,
    monitor_clients: Mutex<HashMap<InstanceId, Arc<MonitorChannel>>>,
    heartbeat_tokens: Mutex<HashMap<InstanceId, CancellationToken>>,
    store: Arc<StateStoreAdapter>,
}

impl InstanceRegistry {
    pub fn new(node: impl Into<String>, store: Arc<StateStoreAdapter>) -> Self {
        Self {
            node: node.into(),
            instances: Mutex::new(HashMap::new()),
            launch_locks: Mutex::new(HashMap::new()),
            monitor_clients: Mutex::new(HashMap::new()),
            heartbeat_tokens: Mutex::new(HashMap::new()),
            store,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Insert without going through `TransitionState` — used only for the
    /// initial `pending` record at RunInstances admission time (§4.5 step 4
    /// of the admission flow) and by the Recovery Engine (§4.7 step 3),
    /// both of which persist the whole map themselves right after.
    pub fn insert(&self, instance: Instance) {
        self.instances.lock().insert(instance.id, instance);
    }

    pub fn remove(&self, id: &InstanceId) -> Option<Instance> {
        let removed = self.instances.lock().remove(id);
        self.monitor_clients.lock().remove(id);
        if let Some(token) = self.heartbeat_tokens.lock().remove(id) {
            token.cancel();
        }
        self.forget_launch_lock(id);
        removed
    }

    pub fn get(&self, id: &InstanceId) -> Option<Instance> {
        self.instances.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &InstanceId) -> bool {
        self.instances.lock().contains_key(id)
    }

    /// A consistent view of the whole owned map (§3 invariant 1 is checked
    /// against snapshots like this one).
    pub fn snapshot(&self) -> HashMap<InstanceId, Instance> {
        self.instances.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.instances.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.lock().is_empty()
    }

    /// Persist the current owned map as-is. Used after bulk mutations
    /// (volume URI updates, recovery) that don't go through `transition`.
    pub async fn persist(&self) -> DaemonResult<()> {
        let snapshot = self.snapshot();
        self.store.write_state(&self.node, &snapshot).await
    }

    /// Mutate one instance's record in place and persist the whole map.
    /// Used for non-state-machine field updates (volume URIs, runtime
    /// handle) where no transition table edge applies.
    pub async fn update<F>(&self, id: &InstanceId, f: F) -> DaemonResult<Instance>
    where
        F: FnOnce(&mut Instance),
    {
        let snapshot = {
            let mut instances = self.instances.lock();
            let instance = instances.get_mut(id).ok_or_else(|| {
                DaemonError::Core(CoreError::ValidationError(format!("unknown instance {id}")))
            })?;
            f(instance);
            instances.clone()
        };
        self.store.write_state(&self.node, &snapshot).await?;
        self.get(id).ok_or_else(|| {
            DaemonError::Core(CoreError::ValidationError(format!("instance {id} vanished during update")))
        })
    }

    /// Acquire (creating if absent) this instance's per-instance launch
    /// lock, serializing concurrent launch/teardown attempts on the same ID
    /// (§5: "Exactly one task per instance runs the launch pipeline at a time").
    pub fn launch_lock(&self, id: &InstanceId) -> Arc<tokio::sync::Mutex<()>> {
        self.launch_locks
            .lock()
            .entry(*id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub fn forget_launch_lock(&self, id: &InstanceId) {
        self.launch_locks.lock().remove(id);
    }

    pub fn set_monitor(&self, id: &InstanceId, client: Arc<MonitorChannel>) {
        self.monitor_clients.lock().insert(*id, client);
    }

    pub fn monitor(&self, id: &InstanceId) -> Option<Arc<MonitorChannel>> {
        self.monitor_clients.lock().get(id).cloned()
    }

    pub fn clear_monitor(&self, id: &InstanceId) {
        self.monitor_clients.lock().remove(id);
    }

    pub fn set_heartbeat_token(&self, id: &InstanceId, token: CancellationToken) {
        if let Some(old) = self.heartbeat_tokens.lock().insert(*id, token) {
            old.cancel();
        }
    }

    pub fn cancel_heartbeat(&self, id: &InstanceId) {
        if let Some(token) = self.heartbeat_tokens.lock().remove(id) {
            token.cancel();
        }
    }

    /// `TransitionState` (§4.4): validates the edge against the transition
    /// table, updates the in-memory record, persists the whole owned map,
    /// and reverts the in-memory field on persistence failure so the caller
    /// may retry (§4.4, §7 "State-persistence errors"). The collection lock
    /// is held only for the in-memory mutation; the persist call happens
    /// with it released (no lock across a store request, §5).
    pub async fn transition(
        &self,
        id: &InstanceId,
        target: InstanceState,
        reason: Option<StateReason>,
    ) -> DaemonResult<Instance> {
        let (previous, snapshot) = {
            let mut instances = self.instances.lock();
            let instance = instances.get_mut(id).ok_or_else(|| {
                DaemonError::Core(CoreError::ValidationError(format!("unknown instance {id}")))
            })?;
            validate_transition(instance.state, target).map_err(CoreError::from)?;
            let previous = instance.state;
            instance.state = target;
            instance.state_reason = reason;
            (previous, instances.clone())
        };

        if let Err(e) = self.store.write_state(&self.node, &snapshot).await {
            let mut instances = self.instances.lock();
            if let Some(instance) = instances.get_mut(id) {
                instance.state = previous;
            }
            warn!(instance_id = %id, error = %e, "failed to persist state transition, reverted");
            return Err(e);
        }

        info!(instance_id = %id, from = ?previous, to = ?target, "instance transitioned");
        self.get(id).ok_or_else(|| {
            DaemonError::Core(CoreError::ValidationError(format!("instance {id} vanished after transition")))
        })
    }

    /// Direct state assignment used only by recovery (§4.7 step 3), which
    /// re-owns instances without passing through the transition table
    /// (a live process found on restart is taken over, not "transitioned
    /// into" running).
    pub fn set_state_unchecked(&self, id: &InstanceId, state: InstanceState) {
        if let Some(instance) = self.instances.lock().get_mut(id) {
            instance.state = state;
        }
    }
}
