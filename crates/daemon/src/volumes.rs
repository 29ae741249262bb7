// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Seams onto the volume and network-plumbing backends (§1 "external
//! collaborators — contracts only"): the image/key/volume/snapshot/tag/
//! VPC/IGW service backends and the host network plumbing primitives.
//!
//! The lifecycle engine only consumes their public operations; their
//! internals are out of scope (§1). These traits cover exactly the
//! operations the Launch Orchestrator calls (§4.5 step 6, teardown).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::bus::MessageBus;
use crate::error::DaemonResult;

#[async_trait]
pub trait VolumeService: Send + Sync {
    /// Bind a volume to this instance (§4.5 step 6: "mark the boot volume
    /// `in-use` via the volume service").
    async fn mark_in_use(&self, volume_name: &str, instance_id: &str) -> DaemonResult<()>;

    /// Release a volume back to `available` (teardown, §4.5).
    async fn mark_available(&self, volume_name: &str) -> DaemonResult<()>;

    /// Delete a volume outright (terminate path, §4.5 teardown).
    async fn delete(&self, volume_name: &str) -> DaemonResult<()>;
}

#[async_trait]
pub trait NetworkPlumber: Send + Sync {
    /// Release an auto-created ENI (§4.5 teardown). Best-effort: callers
    /// never propagate this failure (§5).
    async fn release_eni(&self, eni_id: &str);

    /// Remove a per-instance tap device (§4.5 teardown). Best-effort.
    async fn remove_tap(&self, device: &str);
}

/// Delegates to the volume service backend over the bus (§6: `ec2.{Create,
/// Delete, Describe}Volume` delegated worker-queue subjects).
pub struct BusVolumeService {
    bus: Arc<dyn MessageBus>,
    timeout: Duration,
}

impl BusVolumeService {
    pub fn new(bus: Arc<dyn MessageBus>, timeout: Duration) -> Self {
        Self { bus, timeout }
    }
}

#[derive(serde::Serialize)]
struct MarkInUseReq<'a> {
    volume_name: &'a str,
    instance_id: &'a str,
}

#[async_trait]
impl VolumeService for BusVolumeService {
    async fn mark_in_use(&self, volume_name: &str, instance_id: &str) -> DaemonResult<()> {
        let body = serde_json::to_vec(&MarkInUseReq { volume_name, instance_id })
            .map_err(|e| crate::error::DaemonError::Store(e.to_string()))?;
        self.bus
            .request(&hive_wire::subjects::delegated("Mark", "VolumeInUse"), body, self.timeout)
            .await?;
        Ok(())
    }

    async fn mark_available(&self, volume_name: &str) -> DaemonResult<()> {
        let body = serde_json::to_vec(volume_name)
            .map_err(|e| crate::error::DaemonError::Store(e.to_string()))?;
        self.bus
            .request(&hive_wire::subjects::delegated("Mark", "VolumeAvailable"), body, self.timeout)
            .await?;
        Ok(())
    }

    async fn delete(&self, volume_name: &str) -> DaemonResult<()> {
        let body = serde_json::to_vec(volume_name)
            .map_err(|e| crate::error::DaemonError::Store(e.to_string()))?;
        self.bus
            .request(&hive_wire::subjects::delegated("Delete", "Volume"), body, self.timeout)
            .await?;
        Ok(())
    }
}

/// Delegates to the host network plumbing primitives (§1: "tap creation,
/// switch-port attach — only the capability interface is specified") and
/// the VPC/IGW backend's ENI release operation.
pub struct BusNetworkPlumber {
    bus: Arc<dyn MessageBus>,
    timeout: Duration,
}

impl BusNetworkPlumber {
    pub fn new(bus: Arc<dyn MessageBus>, timeout: Duration) -> Self {
        Self { bus, timeout }
    }
}

#[async_trait]
impl NetworkPlumber for BusNetworkPlumber {
    async fn release_eni(&self, eni_id: &str) {
        let body = match serde_json::to_vec(eni_id) {
            Ok(b) => b,
            Err(e) => {
                warn!(eni_id, error = %e, "failed to encode ENI release request");
                return;
            }
        };
        if let Err(e) = self
            .bus
            .request(&hive_wire::subjects::delegated("Delete", "NetworkInterface"), body, self.timeout)
            .await
        {
            warn!(eni_id, error = %e, "failed to release ENI, continuing teardown best-effort");
        }
    }

    async fn remove_tap(&self, device: &str) {
        let body = match serde_json::to_vec(device) {
            Ok(b) => b,
            Err(e) => {
                warn!(device, error = %e, "failed to encode tap removal request");
                return;
            }
        };
        if let Err(e) = self.bus.request("hive.net.removeTap", body, self.timeout).await {
            warn!(device, error = %e, "failed to remove tap device, continuing teardown best-effort");
        }
    }
}

#[cfg(test)]
pub mod fakes {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default, Clone)]
    pub struct FakeVolumeService {
        pub calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl VolumeService for FakeVolumeService {
        async fn mark_in_use(&self, volume_name: &str, instance_id: &str) -> DaemonResult<()> {
            self.calls.lock().push(format!("mark_in_use:{volume_name}:{instance_id}"));
            Ok(())
        }

        async fn mark_available(&self, volume_name: &str) -> DaemonResult<()> {
            self.calls.lock().push(format!("mark_available:{volume_name}"));
            Ok(())
        }

        async fn delete(&self, volume_name: &str) -> DaemonResult<()> {
            self.calls.lock().push(format!("delete:{volume_name}"));
            Ok(())
        }
    }

    #[derive(Default, Clone)]
    pub struct FakeNetworkPlumber {
        pub calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl NetworkPlumber for FakeNetworkPlumber {
        async fn release_eni(&self, eni_id: &str) {
            self.calls.lock().push(format!("release_eni:{eni_id}"));
        }

        async fn remove_tap(&self, device: &str) {
            self.calls.lock().push(format!("remove_tap:{device}"));
        }
    }
}
