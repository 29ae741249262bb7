// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The instance record (§3 "Instance").

use crate::state_machine::{InstanceState, StateReason};
use crate::InstanceId;
use serde::{Deserialize, Serialize};

/// Role a volume request plays in the instance (§3 "Volume request",
/// Glossary). Internal volumes (`CloudInit`, `Efi`) are always cleaned up on
/// terminate; `Attached` is hot-attached and user-visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeRole {
    Boot,
    CloudInit,
    Efi,
    Attached,
}

impl VolumeRole {
    /// Internal volumes are never user-visible and are always removed via
    /// `ebs.delete` on terminate, regardless of delete-on-termination (§4.5).
    pub fn is_internal(self) -> bool {
        matches!(self, VolumeRole::CloudInit | VolumeRole::Efi)
    }
}

/// A mount intent for one volume, and — once `ebs.<node>.mount` has replied
/// — the transport URI the external mount service returned (§3 "Volume
/// request").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRequest {
    pub volume_name: String,
    pub role: VolumeRole,
    pub device_name: String,
    pub delete_on_termination: bool,
    /// Empty until the mount service replies. A request is only considered
    /// mounted once this is set (§3).
    pub nbd_uri: String,
}

impl VolumeRequest {
    pub fn new(
        volume_name: impl Into<String>,
        role: VolumeRole,
        device_name: impl Into<String>,
        delete_on_termination: bool,
    ) -> Self {
        Self {
            volume_name: volume_name.into(),
            role,
            device_name: device_name.into(),
            delete_on_termination,
            nbd_uri: String::new(),
        }
    }

    pub fn is_mounted(&self) -> bool {
        !self.nbd_uri.is_empty()
    }
}

/// The instance's virtual NIC identity (Glossary: ENI).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkIdentity {
    pub eni_id: String,
    pub mac: String,
    pub ip: String,
    /// True when this daemon auto-created the ENI at launch (and so must
    /// release it on terminate, §4.5).
    pub auto_created: bool,
}

/// Pointer to an instance's live runtime, non-persistent fields aside
/// (§3: "a pointer to its live runtime"). Reset on recovery (§4.7 step 3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeHandle {
    pub pid: Option<u32>,
    pub console_log_path: Option<String>,
    pub serial_socket_path: Option<String>,
    pub monitor_socket_path: Option<String>,
    /// True once the monitor handshake (§4.5 step 4) has completed for the
    /// current process. Not persisted across restarts — recovery rebuilds it.
    #[serde(skip)]
    pub monitor_connected: bool,
}

/// Launch metadata (§3 "Instance"): launch time, reservation, owner, node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchMetadata {
    pub launch_time_ms: u64,
    pub reservation_id: String,
    pub owner: String,
    pub last_node: String,
}

/// An instance under this daemon's control (§3 "Instance").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub instance_type: String,
    pub volumes: Vec<VolumeRequest>,
    pub network: Option<NetworkIdentity>,
    pub state: InstanceState,
    pub state_reason: Option<StateReason>,
    pub launch: LaunchMetadata,
    #[serde(default)]
    pub runtime: RuntimeHandle,
}

impl Instance {
    /// All non-EFI volumes need a boot drive argument (§4.3 `BuildArgs`).
    pub fn block_volumes(&self) -> impl Iterator<Item = &VolumeRequest> {
        self.volumes.iter().filter(|v| v.role != VolumeRole::Efi)
    }

    pub fn boot_volume(&self) -> Option<&VolumeRequest> {
        self.volumes.iter().find(|v| v.role == VolumeRole::Boot)
    }

    /// §8 invariant: every volume request in a running instance has a
    /// non-empty transport URI.
    pub fn all_volumes_mounted(&self) -> bool {
        self.volumes.iter().all(VolumeRequest::is_mounted)
    }

    pub fn is_owned(&self) -> bool {
        !matches!(self.state, InstanceState::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_instance() -> Instance {
        Instance {
            id: InstanceId::new(),
            instance_type: "t3.micro".to_string(),
            volumes: vec![VolumeRequest::new("boot", VolumeRole::Boot, "/dev/vda", true)],
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

    #[test]
    fn unmounted_volume_fails_all_volumes_mounted() {
        let instance = sample_instance();
        assert!(!instance.all_volumes_mounted());
    }

    #[test]
    fn mounted_volume_passes_all_volumes_mounted() {
        let mut instance = sample_instance();
        instance.volumes[0].nbd_uri = "nbd://localhost:10809/boot".to_string();
        assert!(instance.all_volumes_mounted());
    }

    #[test]
    fn internal_roles_are_cloud_init_and_efi_only() {
        assert!(VolumeRole::CloudInit.is_internal());
        assert!(VolumeRole::Efi.is_internal());
        assert!(!VolumeRole::Boot.is_internal());
        assert!(!VolumeRole::Attached.is_internal());
    }

    #[test]
    fn stopped_instances_are_not_owned() {
        let mut instance = sample_instance();
        instance.state = InstanceState::Stopped;
        assert!(!instance.is_owned());
        instance.state = InstanceState::Running;
        assert!(instance.is_owned());
    }
}
