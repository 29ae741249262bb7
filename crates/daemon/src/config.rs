// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon configuration: a TOML file on disk, overridable by `HIVE_*`
//! environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DaemonError, DaemonResult};

/// Protocol version carried on every bus envelope.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// This node's name, unique within the cluster.
    pub node: String,
    pub region: String,
    pub az: String,
    /// Base directory for PID files, sockets, console logs, and state.
    pub data_dir: PathBuf,
    /// Bus client address (NATS URL).
    pub bus_addr: String,
    /// Replicated KV / object-store address.
    pub store_addr: String,
    /// Bind address for the HTTP cluster-manager surface.
    pub http_bind: String,
    /// Allow dev-mode user-mode NIC forwarding even with an ENI present.
    #[serde(default)]
    pub dev_mode: bool,
    #[serde(default = "default_bus_timeout_ms")]
    pub bus_timeout_ms: u64,
}

fn default_bus_timeout_ms() -> u64 {
    30_000
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            node: String::new(),
            region: String::new(),
            az: String::new(),
            data_dir: PathBuf::from("/var/lib/hived"),
            bus_addr: "nats://127.0.0.1:4222".to_string(),
            store_addr: "127.0.0.1:2379".to_string(),
            http_bind: "0.0.0.0:8761".to_string(),
            dev_mode: false,
            bus_timeout_ms: default_bus_timeout_ms(),
        }
    }
}

impl DaemonConfig {
    /// Load from a TOML file, then apply `HIVE_*` environment overrides.
    pub fn load(path: &Path) -> DaemonResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| DaemonError::Config(format!("reading {}: {e}", path.display())))?;
        let mut cfg: DaemonConfig =
            toml::from_str(&text).map_err(|e| DaemonError::Config(e.to_string()))?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("HIVE_NODE") {
            self.node = v;
        }
        if let Ok(v) = std::env::var("HIVE_REGION") {
            self.region = v;
        }
        if let Ok(v) = std::env::var("HIVE_AZ") {
            self.az = v;
        }
        if let Ok(v) = std::env::var("HIVE_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("HIVE_BUS_ADDR") {
            self.bus_addr = v;
        }
        if let Ok(v) = std::env::var("HIVE_STORE_ADDR") {
            self.store_addr = v;
        }
        if let Ok(v) = std::env::var("HIVE_HTTP_BIND") {
            self.http_bind = v;
        }
        if let Ok(v) = std::env::var("HIVE_DEV_MODE") {
            self.dev_mode = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("HIVE_BUS_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.bus_timeout_ms = ms;
            }
        }
    }

    pub fn bus_timeout(&self) -> Duration {
        Duration::from_millis(self.bus_timeout_ms)
    }

    pub fn pid_dir(&self) -> PathBuf {
        self.data_dir.join("run")
    }

    pub fn console_log_dir(&self) -> PathBuf {
        self.data_dir.join("log")
    }

    pub fn socket_dir(&self) -> PathBuf {
        self.data_dir.join("sock")
    }
}

/// Mount request deadline (§4.5 step 2).
pub fn mount_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Rollback-unmount deadline when a later mount in the same launch fails
/// (§5: "10s for rollback unmount").
pub fn unmount_rollback_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Teardown wait for PID-file removal before force-kill (§4.5 teardown).
pub fn teardown_grace() -> Duration {
    Duration::from_secs(60)
}

/// Grace period after spawn to detect immediate crash (§4.5 step 3).
pub fn spawn_grace() -> Duration {
    Duration::from_secs(1)
}

/// Monitor heartbeat interval (§4.8).
pub fn heartbeat_interval() -> Duration {
    Duration::from_secs(30)
}

/// Pending watchdog sweep interval (§4.8).
pub fn pending_watchdog_interval() -> Duration {
    Duration::from_secs(60)
}

/// Pending/provisioning timeout before launch_timeout (§4.8).
pub fn pending_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

/// Cluster-readiness gate timeout (§4.8).
pub fn readiness_timeout() -> Duration {
    Duration::from_secs(2 * 60)
}

/// Crash-mode settling interval before recovery reads KV (§4.7 step 1).
pub fn recovery_settle() -> Duration {
    Duration::from_secs(3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    #[serial_test::serial]
    fn load_applies_env_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hived.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"node = "node-a"
region = "us-east-1"
az = "us-east-1a"
data_dir = "/tmp/hive"
bus_addr = "nats://127.0.0.1:4222"
store_addr = "127.0.0.1:2379"
http_bind = "0.0.0.0:8761"
"#
        )
        .unwrap();

        std::env::set_var("HIVE_NODE", "node-b");
        let cfg = DaemonConfig::load(&path).unwrap();
        std::env::remove_var("HIVE_NODE");

        assert_eq!(cfg.node, "node-b");
        assert_eq!(cfg.region, "us-east-1");
    }

    #[test]
    fn bus_timeout_defaults_to_thirty_seconds() {
        let cfg = DaemonConfig::default();
        assert_eq!(cfg.bus_timeout(), Duration::from_secs(30));
    }
}
