// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Launch Orchestrator (§4.5): the admission flow and the per-instance
//! launch/teardown pipeline.
//!
//! Every step here either leaves the instance exactly where it started or
//! advances it by one state-machine edge; a failure partway through a launch
//! unwinds whatever that step mounted/spawned/subscribed before handing the
//! instance to `ShuttingDown` rather than leaving it stuck mid-pipeline
//! (§4.5, §7 scenario 3, §8).

use std::sync::Arc;
use std::time::Duration;

use hive_core::instance::{LaunchMetadata, RuntimeHandle, VolumeRequest, VolumeRole};
use hive_core::{CoreError, Instance, InstanceId, InstanceState, StateReason};
use hive_wire::ebs::{MountReply, MountRequest};
use hive_wire::{InstanceDescriptor, Reservation, RunInstancesInput, StartStopTerminateRequest};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{BusMessage, MessageBus};
use crate::config::{mount_timeout, spawn_grace, teardown_grace, unmount_rollback_timeout};
use crate::error::{DaemonError, DaemonResult};
use crate::hypervisor::HypervisorDriver;
use crate::monitor::{MonitorChannel, MonitorCommand, MonitorEvent};
use crate::registry::InstanceRegistry;
use crate::resource_registry::ResourceRegistry;
use crate::state_store::StateStoreAdapter;
use crate::volumes::{NetworkPlumber, VolumeService};
use crate::watchdog::spawn_heartbeat;

/// Owns the instance lifecycle pipeline: admission, launch, start/stop/
/// terminate, and the per-instance command subjects those operations are
/// served from.
pub struct LaunchOrchestrator {
    registry: Arc<InstanceRegistry>,
    resources: Arc<ResourceRegistry>,
    state_store: Arc<StateStoreAdapter>,
    hypervisor: Arc<dyn HypervisorDriver>,
    bus: Arc<dyn MessageBus>,
    volumes: Arc<dyn VolumeService>,
    network: Arc<dyn NetworkPlumber>,
}

impl LaunchOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<InstanceRegistry>,
        resources: Arc<ResourceRegistry>,
        state_store: Arc<StateStoreAdapter>,
        hypervisor: Arc<dyn HypervisorDriver>,
        bus: Arc<dyn MessageBus>,
        volumes: Arc<dyn VolumeService>,
        network: Arc<dyn NetworkPlumber>,
    ) -> Self {
        Self { registry, resources, state_store, hypervisor, bus, volumes, network }
    }

    // ---- admission (§4.5 "Run-instances admission") -----------------

    /// Validate, reserve capacity, create pending records, and kick off the
    /// launch pipeline for each in the background. Returns once the
    /// reservation itself is durable; individual launches race independently.
    pub async fn run_instances(
        self: &Arc<Self>,
        input: RunInstancesInput,
    ) -> Result<Reservation, CoreError> {
        input.validate().map_err(CoreError::ValidationError)?;
        if !self.resources.types().contains(&input.instance_type) {
            return Err(CoreError::InvalidInstanceType(input.instance_type.clone()));
        }

        let admissible = self.resources.can_allocate(&input.instance_type, input.max_count);
        if admissible < input.min_count {
            return Err(CoreError::InsufficientInstanceCapacity);
        }

        let mut allocated = 0u32;
        for _ in 0..admissible {
            match self.resources.allocate(&input.instance_type) {
                Ok(()) => allocated += 1,
                Err(_) => break,
            }
        }
        if allocated < input.min_count {
            for _ in 0..allocated {
                self.resources.deallocate(&input.instance_type);
            }
            return Err(CoreError::InsufficientInstanceCapacity);
        }

        let reservation_id = hive_core::ReservationId::new();
        let now_ms = epoch_ms();
        let mut descriptors = Vec::with_capacity(allocated as usize);
        let mut ids = Vec::with_capacity(allocated as usize);

        for _ in 0..allocated {
            let id = InstanceId::new();
            let instance = Instance {
                id,
                instance_type: input.instance_type.clone(),
                volumes: synthesize_volumes(&input),
                network: None,
                state: InstanceState::Pending,
                state_reason: None,
                launch: LaunchMetadata {
                    launch_time_ms: now_ms,
                    reservation_id: reservation_id.to_string(),
                    owner: input.owner.clone(),
                    last_node: self.registry.node().to_string(),
                },
                runtime: RuntimeHandle::default(),
            };
            descriptors.push(InstanceDescriptor {
                instance_id: id.to_string(),
                instance_type: input.instance_type.clone(),
                state_code: InstanceState::Pending.code(),
                state_name: InstanceState::Pending.external_name().to_string(),
            });
            self.registry.insert(instance);
            ids.push(id);
        }

        if let Err(e) = self.registry.persist().await {
            for id in &ids {
                self.registry.remove(id);
            }
            for _ in 0..allocated {
                self.resources.deallocate(&input.instance_type);
            }
            return Err(CoreError::ValidationError(format!(
                "failed to persist new instances: {e}"
            )));
        }
        let _ = self.resources.update_subscriptions().await;

        for id in ids {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = this.launch_instance(id).await {
                    warn!(instance_id = %id, error = %e, "launch failed during run-instances admission");
                }
            });
        }

        Ok(Reservation {
            reservation_id: reservation_id.to_string(),
            owner: input.owner,
            created_at_ms: now_ms,
            instances: descriptors,
        })
    }

    // ---- launch pipeline (§4.5 steps 1-6) ----------------------------

    /// Run the six-step launch pipeline for an already-`pending` instance.
    /// Serialized per instance ID via the registry's launch lock (§5).
    pub async fn launch_instance(self: &Arc<Self>, id: InstanceId) -> DaemonResult<()> {
        let lock = self.registry.launch_lock(&id);
        let _guard = lock.lock().await;

        let instance = self
            .registry
            .get(&id)
            .ok_or_else(|| DaemonError::Core(CoreError::ValidationError(format!("unknown instance {id}"))))?;

        // Step 1: liveness guard — never spawn a second process for an ID
        // that already has one running (§4.5 step 1).
        if self.hypervisor.is_running(&instance) {
            return Err(DaemonError::AlreadyRunning(id.to_string()));
        }

        let ty = self
            .resources
            .types()
            .get(&instance.instance_type)
            .cloned()
            .ok_or_else(|| DaemonError::Core(CoreError::InvalidInstanceType(instance.instance_type.clone())))?;

        self.registry.transition(&id, InstanceState::Provisioning, None).await?;

        // Step 2: mount every volume, unwinding already-mounted ones on
        // partial failure (§4.5 step 2, §7 scenario 3).
        let instance = match self.mount_volumes(&instance).await {
            Ok(volumes) => self.registry.update(&id, |i| i.volumes = volumes).await?,
            Err(e) => {
                self.fail_launch(&id, "volume_preparation_failed").await;
                self.resources.deallocate(&instance.instance_type);
                let _ = self.resources.update_subscriptions().await;
                return Err(e);
            }
        };

        // Step 3: spawn the hypervisor and watch for an immediate crash.
        let spec = match self.hypervisor.build_args(&instance, &ty) {
            Ok(spec) => spec,
            Err(e) => {
                self.rollback_mounts(&instance.volumes).await;
                self.fail_launch(&id, "launch_failed").await;
                self.resources.deallocate(&instance.instance_type);
                let _ = self.resources.update_subscriptions().await;
                return Err(e);
            }
        };

        let pid = match self.hypervisor.spawn(&spec).await {
            Ok(pid) => pid,
            Err(e) => {
                self.rollback_mounts(&instance.volumes).await;
                self.fail_launch(&id, "launch_failed").await;
                self.resources.deallocate(&instance.instance_type);
                let _ = self.resources.update_subscriptions().await;
                return Err(e);
            }
        };

        let instance = self
            .registry
            .update(&id, |i| {
                i.runtime.pid = Some(pid);
                i.runtime.console_log_path = Some(spec.console_log.display().to_string());
                i.runtime.serial_socket_path = Some(spec.serial_socket.display().to_string());
                i.runtime.monitor_socket_path = Some(spec.monitor_socket.display().to_string());
            })
            .await?;

        tokio::time::sleep(spawn_grace()).await;
        if !self.hypervisor.is_running(&instance) {
            self.rollback_mounts(&instance.volumes).await;
            self.fail_launch(&id, "launch_failed").await;
            self.resources.deallocate(&instance.instance_type);
            let _ = self.resources.update_subscriptions().await;
            return Err(DaemonError::SpawnFailed(
                "hypervisor process exited immediately after spawn".to_string(),
            ));
        }

        // Step 4: monitor handshake plus heartbeat.
        let (events_tx, events_rx) = mpsc::channel(32);
        let monitor = match MonitorChannel::connect(&spec.monitor_socket, events_tx).await {
            Ok(monitor) => monitor,
            Err(e) => {
                self.rollback_mounts(&instance.volumes).await;
                self.fail_launch(&id, "launch_failed").await;
                self.resources.deallocate(&instance.instance_type);
                let _ = self.resources.update_subscriptions().await;
                return Err(e);
            }
        };
        self.registry.set_monitor(&id, Arc::clone(&monitor));
        spawn_event_sink(id, events_rx);

        let token = CancellationToken::new();
        self.registry.set_heartbeat_token(&id, token.clone());
        spawn_heartbeat(Arc::clone(&monitor), id, token);

        // Step 5: subscribe the per-instance command and console subjects.
        if let Err(e) = self.subscribe_instance_topics(id).await {
            self.registry.cancel_heartbeat(&id);
            self.registry.clear_monitor(&id);
            self.rollback_mounts(&instance.volumes).await;
            self.fail_launch(&id, "launch_failed").await;
            self.resources.deallocate(&instance.instance_type);
            let _ = self.resources.update_subscriptions().await;
            return Err(e);
        }

        // Step 6: commit to running, mark the boot volume in-use.
        self.registry.transition(&id, InstanceState::Running, None).await?;
        if let Some(boot) = instance.boot_volume() {
            if let Err(e) = self.volumes.mark_in_use(&boot.volume_name, id.as_str()).await {
                warn!(instance_id = %id, error = %e, "failed to mark boot volume in-use, instance is running regardless");
            }
        }

        info!(instance_id = %id, instance_type = %ty.name, "instance launched");
        Ok(())
    }

    async fn mount_volumes(&self, instance: &Instance) -> DaemonResult<Vec<VolumeRequest>> {
        let node = self.registry.node().to_string();
        let mut mounted = Vec::with_capacity(instance.volumes.len());
        for req in &instance.volumes {
            match self.mount_one(&node, req).await {
                Ok(with_uri) => mounted.push(with_uri),
                Err(e) => {
                    warn!(volume = %req.volume_name, error = %e, "volume mount failed, rolling back prior mounts");
                    self.rollback_mounts(&mounted).await;
                    return Err(e);
                }
            }
        }
        Ok(mounted)
    }

    async fn mount_one(&self, node: &str, req: &VolumeRequest) -> DaemonResult<VolumeRequest> {
        let wire_req = MountRequest {
            name: req.volume_name.clone(),
            boot: req.role == VolumeRole::Boot,
            cloud_init: req.role == VolumeRole::CloudInit,
            efi: req.role == VolumeRole::Efi,
            delete_on_termination: req.delete_on_termination,
            device_name: req.device_name.clone(),
            nbd_uri: String::new(),
        };
        let body =
            serde_json::to_vec(&wire_req).map_err(|e| DaemonError::VolumePreparation(e.to_string()))?;
        let subject = hive_wire::subjects::ebs_mount(node);
        let resp = self.bus.request(&subject, body, mount_timeout()).await?;
        let reply: MountReply =
            serde_json::from_slice(&resp).map_err(|e| DaemonError::VolumePreparation(e.to_string()))?;
        if !reply.is_ok() {
            return Err(DaemonError::VolumePreparation(
                reply.error.unwrap_or_else(|| "mount service returned no transport URI".to_string()),
            ));
        }
        let mut mounted = req.clone();
        mounted.nbd_uri = reply.nbd_uri;
        Ok(mounted)
    }

    /// Best-effort: the spec never propagates rollback-unmount failures
    /// (§5); a leaked mount is cleaned up on the next restart's recovery pass.
    async fn rollback_mounts(&self, mounted: &[VolumeRequest]) {
        let node = self.registry.node().to_string();
        for req in mounted.iter().filter(|v| v.is_mounted()) {
            let wire_req = MountRequest {
                name: req.volume_name.clone(),
                boot: req.role == VolumeRole::Boot,
                cloud_init: req.role == VolumeRole::CloudInit,
                efi: req.role == VolumeRole::Efi,
                delete_on_termination: req.delete_on_termination,
                device_name: req.device_name.clone(),
                nbd_uri: req.nbd_uri.clone(),
            };
            let Ok(body) = serde_json::to_vec(&wire_req) else { continue };
            let subject = hive_wire::subjects::ebs_unmount(&node);
            if let Err(e) = self.bus.request(&subject, body, unmount_rollback_timeout()).await {
                warn!(volume = %req.volume_name, error = %e, "rollback unmount failed, continuing");
            }
        }
    }

    async fn fail_launch(&self, id: &InstanceId, reason: &str) {
        if let Err(e) = self
            .registry
            .transition(id, InstanceState::ShuttingDown, Some(StateReason::new(reason)))
            .await
        {
            warn!(instance_id = %id, error = %e, "failed to record launch failure state");
        }
    }

    /// Rebuild the transient runtime state (monitor connection, heartbeat,
    /// per-instance subjects) for an instance the Recovery Engine found
    /// still alive across a restart (§4.7 step 3: "reinitialise transient
    /// fields"). The persisted state is left as `running`; only the
    /// non-persisted side tables are rebuilt here.
    pub async fn reattach_running(self: &Arc<Self>, id: InstanceId) -> DaemonResult<()> {
        let instance = self
            .registry
            .get(&id)
            .ok_or_else(|| DaemonError::Core(CoreError::ValidationError(format!("unknown instance {id}"))))?;
        let socket = instance.runtime.monitor_socket_path.clone().ok_or_else(|| {
            DaemonError::Monitor(format!("instance {id} has no monitor socket path on record"))
        })?;

        let (events_tx, events_rx) = mpsc::channel(32);
        let monitor = MonitorChannel::connect(std::path::Path::new(&socket), events_tx).await?;
        self.registry.set_monitor(&id, Arc::clone(&monitor));
        spawn_event_sink(id, events_rx);

        let token = CancellationToken::new();
        self.registry.set_heartbeat_token(&id, token.clone());
        spawn_heartbeat(Arc::clone(&monitor), id, token);

        self.subscribe_instance_topics(id).await?;
        Ok(())
    }

    // ---- per-instance command subjects (§4.6) ------------------------

    async fn subscribe_instance_topics(self: &Arc<Self>, id: InstanceId) -> DaemonResult<()> {
        let cmd_subject = hive_wire::subjects::instance_command(id.as_str());
        let console_subject = hive_wire::subjects::console_output(id.as_str());
        let _ = self.bus.unsubscribe(&cmd_subject).await;
        let _ = self.bus.unsubscribe(&console_subject).await;

        let mut cmd_sub = self.bus.subscribe(&cmd_subject).await?;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(msg) = cmd_sub.receiver.recv().await {
                let this = Arc::clone(&this);
                tokio::spawn(async move { this.dispatch_command(id, msg).await });
            }
        });

        let mut console_sub = self.bus.subscribe(&console_subject).await?;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(msg) = console_sub.receiver.recv().await {
                let this = Arc::clone(&this);
                tokio::spawn(async move { this.handle_console_output(id, msg).await });
            }
        });

        Ok(())
    }

    async fn dispatch_command(self: Arc<Self>, id: InstanceId, msg: BusMessage) {
        let req: StartStopTerminateRequest = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                if let Some(reply) = msg.reply {
                    let _ = reply.send(format!(r#"{{"error":"{e}"}}"#).into_bytes());
                }
                return;
            }
        };
        // Reply is sent immediately; the command itself runs to completion
        // in the background (§4.6).
        if let Some(reply) = msg.reply {
            let _ = reply.send(b"{\"accepted\":true}".to_vec());
        }
        match req {
            StartStopTerminateRequest::Start { .. } => self.handle_start(id.as_str()).await,
            StartStopTerminateRequest::Stop { delete_volume, .. } => {
                self.handle_stop(id.as_str(), delete_volume).await
            }
            StartStopTerminateRequest::Terminate { .. } => self.handle_terminate(id.as_str()).await,
            StartStopTerminateRequest::MonitorCommand { command, .. } => {
                self.handle_monitor_passthrough(&id, command).await
            }
        }
    }

    async fn handle_console_output(self: Arc<Self>, id: InstanceId, msg: BusMessage) {
        let Some(reply) = msg.reply else { return };
        let Some(instance) = self.registry.get(&id) else {
            let _ = reply.send(b"{\"error\":\"instance not found\"}".to_vec());
            return;
        };
        let body = match &instance.runtime.console_log_path {
            Some(path) => tokio::fs::read(path).await.unwrap_or_default(),
            None => Vec::new(),
        };
        let _ = reply.send(body);
    }

    async fn handle_monitor_passthrough(&self, id: &InstanceId, command: serde_json::Value) {
        let Some(monitor) = self.registry.monitor(id) else {
            warn!(instance_id = %id, "monitor pass-through requested with no monitor connected");
            return;
        };
        let Some(execute) = command.get("execute").and_then(|v| v.as_str()) else {
            warn!(instance_id = %id, "monitor pass-through missing execute field");
            return;
        };
        let cmd =
            MonitorCommand { execute: execute.to_string(), arguments: command.get("arguments").cloned() };
        if let Err(e) = monitor.call(cmd).await {
            warn!(instance_id = %id, error = %e, "monitor pass-through failed");
        }
    }

    // ---- start / stop / terminate (§4.6, §4.5 teardown) --------------

    pub async fn handle_start(self: &Arc<Self>, instance_id: &str) {
        let id = InstanceId::from_string(instance_id);
        if !self.registry.contains(&id) {
            match self.claim_stopped(&id).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(instance_id, "start rejected: instance not found or already claimed elsewhere");
                    return;
                }
                Err(e) => {
                    warn!(instance_id, error = %e, "start rejected: claim failed");
                    return;
                }
            }
        }
        if let Err(e) = self.registry.transition(&id, InstanceState::Pending, None).await {
            warn!(instance_id, error = %e, "start rejected: illegal transition");
            return;
        }
        if let Err(e) = self.launch_instance(id).await {
            warn!(instance_id, error = %e, "launch failed during start");
        }
    }

    /// Claim an instance from the cluster-wide stopped map via
    /// compare-and-set (§9), taking ownership on this node.
    async fn claim_stopped(&self, id: &InstanceId) -> DaemonResult<bool> {
        let Some(rec) = self.state_store.read_stopped_instance(id.as_str()).await? else {
            return Ok(false);
        };
        let claimed = self.state_store.claim_stopped_instance(id.as_str(), &rec).await?;
        if claimed {
            let mut rec = rec;
            rec.launch.last_node = self.registry.node().to_string();
            self.registry.insert(rec);
            self.registry.persist().await?;
        }
        Ok(claimed)
    }

    pub async fn handle_stop(self: &Arc<Self>, instance_id: &str, delete_volume: bool) {
        let id = InstanceId::from_string(instance_id);
        if let Err(e) = self.stop_instance(id, delete_volume).await {
            warn!(instance_id, error = %e, "stop failed");
        }
    }

    pub async fn handle_terminate(self: &Arc<Self>, instance_id: &str) {
        let id = InstanceId::from_string(instance_id);
        if let Err(e) = self.stop_instance(id, true).await {
            warn!(instance_id, error = %e, "terminate failed");
        }
    }

    /// `delete_volume = false` is the stop path (final state `stopped`,
    /// record migrates to the shared stopped map); `true` is the terminate
    /// path (final state `terminated`, record is dropped).
    pub async fn stop_instance(self: &Arc<Self>, id: InstanceId, delete_volume: bool) -> DaemonResult<()> {
        let target = if delete_volume { InstanceState::ShuttingDown } else { InstanceState::Stopping };
        self.registry.transition(&id, target, None).await?;
        self.teardown_one(id, delete_volume).await
    }

    /// Stop or terminate every owned instance in parallel, waiting for all
    /// of them to settle. Used by the Shutdown Coordinator's drain phase.
    pub async fn stop_all(self: &Arc<Self>, delete_volume: bool) {
        let ids: Vec<InstanceId> = self.registry.snapshot().into_keys().collect();
        let mut handles = Vec::with_capacity(ids.len());
        for id in ids {
            let this = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                if let Err(e) = this.stop_instance(id, delete_volume).await {
                    warn!(instance_id = %id, error = %e, "teardown failed during stop-all");
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Finish a teardown that was already under way when the daemon
    /// restarted (§4.7 step 4): the instance is already `stopping` or
    /// `shutting-down`, so this resumes straight into `teardown_one` rather
    /// than re-attempting the transition into it.
    pub async fn resume_teardown(self: &Arc<Self>, id: InstanceId, delete_volume: bool) -> DaemonResult<()> {
        self.teardown_one(id, delete_volume).await
    }

    async fn teardown_one(self: &Arc<Self>, id: InstanceId, delete_volume: bool) -> DaemonResult<()> {
        let lock = self.registry.launch_lock(&id);
        let _guard = lock.lock().await;

        let Some(instance) = self.registry.get(&id) else { return Ok(()) };

        if let Some(monitor) = self.registry.monitor(&id) {
            let cmd = MonitorCommand { execute: "system_powerdown".to_string(), arguments: None };
            if let Err(e) = monitor.call(cmd).await {
                warn!(instance_id = %id, error = %e, "guest powerdown request failed, continuing teardown");
            }
        }

        let deadline = tokio::time::Instant::now() + teardown_grace();
        loop {
            if !self.hypervisor.is_running(&instance) {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                if let Some(pid) = instance.runtime.pid {
                    force_kill(pid);
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        let node = self.registry.node().to_string();
        for req in instance.volumes.iter().filter(|v| v.is_mounted()) {
            let wire_req = MountRequest {
                name: req.volume_name.clone(),
                boot: req.role == VolumeRole::Boot,
                cloud_init: req.role == VolumeRole::CloudInit,
                efi: req.role == VolumeRole::Efi,
                delete_on_termination: req.delete_on_termination,
                device_name: req.device_name.clone(),
                nbd_uri: req.nbd_uri.clone(),
            };
            if let Ok(body) = serde_json::to_vec(&wire_req) {
                let subject = hive_wire::subjects::ebs_unmount(&node);
                if let Err(e) = self.bus.request(&subject, body, unmount_rollback_timeout()).await {
                    warn!(volume = %req.volume_name, error = %e, "unmount failed during teardown, continuing");
                }
            }
        }

        for req in instance.volumes.iter().filter(|v| !v.role.is_internal()) {
            if let Err(e) = self.volumes.mark_available(&req.volume_name).await {
                warn!(volume = %req.volume_name, error = %e, "failed to mark volume available");
            }
        }

        if delete_volume {
            for req in instance.volumes.iter().filter(|v| v.role.is_internal()) {
                let _ = self.volumes.delete(&req.volume_name).await;
            }
            for req in instance
                .volumes
                .iter()
                .filter(|v| !v.role.is_internal() && v.delete_on_termination)
            {
                let _ = self.volumes.delete(&req.volume_name).await;
            }
            if let Some(net) = &instance.network {
                if net.auto_created {
                    self.network.release_eni(&net.eni_id).await;
                }
            }
            self.network.remove_tap(&format!("tap-{id}")).await;
        }

        self.resources.deallocate(&instance.instance_type);
        let _ = self.resources.update_subscriptions().await;
        self.registry.cancel_heartbeat(&id);
        self.registry.clear_monitor(&id);

        let cmd_subject = hive_wire::subjects::instance_command(id.as_str());
        let console_subject = hive_wire::subjects::console_output(id.as_str());

        if delete_volume {
            let _ = self.bus.unsubscribe(&cmd_subject).await;
            let _ = self.bus.unsubscribe(&console_subject).await;
            self.registry.transition(&id, InstanceState::Terminated, None).await?;
            self.registry.remove(&id);
            self.registry.persist().await?;
            info!(instance_id = %id, "instance terminated");
        } else {
            let stopped = self.registry.transition(&id, InstanceState::Stopped, None).await?;
            let _ = self.bus.unsubscribe(&cmd_subject).await;
            let _ = self.bus.unsubscribe(&console_subject).await;
            self.state_store.write_stopped_instance(id.as_str(), &stopped).await?;
            self.registry.remove(&id);
            self.registry.persist().await?;
            info!(instance_id = %id, "instance stopped");
        }

        Ok(())
    }
}

fn synthesize_volumes(input: &RunInstancesInput) -> Vec<VolumeRequest> {
    vec![
        VolumeRequest::new(format!("{}-boot", input.image_id), VolumeRole::Boot, "/dev/vda", true),
        VolumeRequest::new(format!("{}-cloud-init", input.image_id), VolumeRole::CloudInit, "/dev/vdb", true),
        VolumeRequest::new(format!("{}-efi", input.image_id), VolumeRole::Efi, "/dev/vdc", true),
    ]
}

fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Monitor events are informational only (§4.4, §9): this sink logs them and
/// never feeds a state transition.
fn spawn_event_sink(id: InstanceId, mut events: mpsc::Receiver<MonitorEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            debug!(instance_id = %id, event = %event.name, "monitor event (informational)");
        }
    });
}

#[cfg(target_os = "linux")]
fn force_kill(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        warn!(pid, error = %e, "force-kill failed, hypervisor process may be a zombie");
    }
}

#[cfg(not(target_os = "linux"))]
fn force_kill(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InProcessBus;
    use crate::hypervisor::{HypervisorDriver, LaunchSpec};
    use crate::store::MemStore;
    use crate::volumes::fakes::{FakeNetworkPlumber, FakeVolumeService};
    use async_trait::async_trait;
    use hive_core::{InstanceType, InstanceTypeTable, ResourceLedger};
    use parking_lot::Mutex as PlMutex;
    use std::collections::HashSet;

    struct FakeHypervisor {
        alive: PlMutex<HashSet<InstanceId>>,
        fail_spawn: bool,
    }

    impl FakeHypervisor {
        fn new() -> Self {
            Self { alive: PlMutex::new(HashSet::new()), fail_spawn: false }
        }

        fn failing() -> Self {
            Self { alive: PlMutex::new(HashSet::new()), fail_spawn: true }
        }
    }

    #[async_trait]
    impl HypervisorDriver for FakeHypervisor {
        fn build_args(&self, instance: &Instance, ty: &InstanceType) -> DaemonResult<LaunchSpec> {
            Ok(LaunchSpec {
                binary: "/bin/true".into(),
                machine_type: "q35",
                pcie_root_ports: 11,
                kvm: false,
                memory_mib: ty.memory_mib,
                vcpus: ty.vcpus,
                pid_file: std::env::temp_dir().join(format!("{}.pid", instance.id)),
                monitor_socket: std::env::temp_dir().join(format!("{}.monitor", instance.id)),
                serial_socket: std::env::temp_dir().join(format!("{}.serial", instance.id)),
                console_log: std::env::temp_dir().join(format!("{}.log", instance.id)),
                block_devices: Vec::new(),
                nic: crate::hypervisor::NicArg::UserForward {
                    bind: "127.0.0.1".into(),
                    host_port: 0,
                    guest_port: 22,
                },
            })
        }

        async fn spawn(&self, spec: &LaunchSpec) -> DaemonResult<u32> {
            if self.fail_spawn {
                return Err(DaemonError::SpawnFailed("forced failure".to_string()));
            }
            let id = spec.pid_file.file_stem().unwrap().to_string_lossy().to_string();
            self.alive.lock().insert(InstanceId::from_string(id));
            Ok(4242)
        }

        async fn await_exit(&self, _pid: u32) -> DaemonResult<i32> {
            Ok(0)
        }

        fn is_running(&self, instance: &Instance) -> bool {
            self.alive.lock().contains(&instance.id)
        }
    }

    fn orchestrator(hv: FakeHypervisor) -> (Arc<LaunchOrchestrator>, Arc<InstanceRegistry>, Arc<ResourceRegistry>) {
        let bus: Arc<dyn MessageBus> = Arc::new(InProcessBus::new());
        let store = Arc::new(StateStoreAdapter::new_unchecked(Arc::new(MemStore::new())));
        let registry = Arc::new(InstanceRegistry::new("node-a", Arc::clone(&store)));
        let types = InstanceTypeTable::standard();
        let ledger = ResourceLedger::new(16, 65536);
        let resources = Arc::new(ResourceRegistry::new(ledger, types, Arc::clone(&bus)));
        let orch = Arc::new(LaunchOrchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&resources),
            store,
            Arc::new(hv),
            bus,
            Arc::new(FakeVolumeService::default()),
            Arc::new(FakeNetworkPlumber::default()),
        ));
        (orch, registry, resources)
    }

    fn pending_instance(id: InstanceId, instance_type: &str) -> Instance {
        Instance {
            id,
            instance_type: instance_type.to_string(),
            volumes: vec![VolumeRequest::new("vol-1", VolumeRole::Boot, "/dev/vda", true)],
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
    async fn launch_failure_moves_instance_to_shutting_down_and_frees_capacity() {
        let (orch, registry, resources) = orchestrator(FakeHypervisor::failing());
        let id = InstanceId::new();
        registry.insert(pending_instance(id, "t3.micro"));
        registry.persist().await.unwrap();
        resources.allocate("t3.micro").unwrap();

        let before = resources.can_allocate("t3.micro", 1);
        let err = orch.launch_instance(id).await;
        assert!(err.is_err());
        assert_eq!(registry.get(&id).unwrap().state, InstanceState::ShuttingDown);
        assert_eq!(
            registry.get(&id).unwrap().state_reason,
            Some(StateReason::new("launch_failed"))
        );
        assert!(resources.can_allocate("t3.micro", 1) > before);
    }

    #[tokio::test]
    async fn run_instances_rejects_insufficient_capacity() {
        let (orch, _registry, _resources) = orchestrator(FakeHypervisor::new());
        let input = RunInstancesInput {
            instance_type: "m5.2xlarge".to_string(),
            image_id: "ami-1".to_string(),
            min_count: 3,
            max_count: 3,
            key_name: None,
            eni_id: None,
            owner: "alice".to_string(),
        };
        let err = orch.run_instances(input).await;
        assert!(matches!(err, Err(CoreError::InsufficientInstanceCapacity)));
    }

    #[tokio::test]
    async fn run_instances_admits_and_reserves_for_a_type_with_capacity() {
        let (orch, registry, _resources) = orchestrator(FakeHypervisor::new());
        let input = RunInstancesInput {
            instance_type: "t3.nano".to_string(),
            image_id: "ami-1".to_string(),
            min_count: 1,
            max_count: 1,
            key_name: None,
            eni_id: None,
            owner: "alice".to_string(),
        };
        let reservation = orch.run_instances(input).await.unwrap();
        assert_eq!(reservation.instances.len(), 1);
        assert_eq!(reservation.owner, "alice");
        assert!(registry.contains(&InstanceId::from_string(&reservation.instances[0].instance_id)));
    }
}
