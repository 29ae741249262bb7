// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Hypervisor Driver (§4.3): translates an instance spec into a spawned
//! hypervisor process and wires its I/O.
//!
//! Grounded in the router/adapter split of `RuntimeRouter` (route by
//! config, dispatch through a trait) and the spawn/readiness-poll/reaper
//! pattern of the local coop adapter — here there is only ever one runtime
//! (the host hypervisor), so the trait has a single production
//! implementation instead of a router.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use hive_core::Instance;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::config::DaemonConfig;
use crate::error::{DaemonError, DaemonResult};

/// Number of PCIe root ports reserved for later disk hot-plug (§4.3).
const PCIE_ROOT_PORTS: u32 = 11;

/// Launch arguments built from an instance spec (§4.3 `BuildArgs`).
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub binary: PathBuf,
    pub machine_type: &'static str,
    pub pcie_root_ports: u32,
    pub kvm: bool,
    pub memory_mib: u64,
    pub vcpus: u32,
    pub pid_file: PathBuf,
    pub monitor_socket: PathBuf,
    pub serial_socket: PathBuf,
    pub console_log: PathBuf,
    pub block_devices: Vec<BlockDeviceArg>,
    pub nic: NicArg,
}

#[derive(Debug, Clone)]
pub struct BlockDeviceArg {
    pub nbd_uri: String,
    pub cache: &'static str,
    pub io_thread: bool,
    pub num_queues: u32,
}

#[derive(Debug, Clone)]
pub enum NicArg {
    Tap { device: String, mac: String },
    UserForward { bind: String, host_port: u16, guest_port: u16 },
}

#[async_trait]
pub trait HypervisorDriver: Send + Sync {
    fn build_args(&self, instance: &Instance, ty: &hive_core::InstanceType) -> DaemonResult<LaunchSpec>;
    async fn spawn(&self, spec: &LaunchSpec) -> DaemonResult<u32>;
    async fn await_exit(&self, pid: u32) -> DaemonResult<i32>;
    fn is_running(&self, instance: &Instance) -> bool;
}

pub struct HostHypervisor {
    config_data_dir: PathBuf,
    binary: PathBuf,
    kvm_available: bool,
    dev_mode: bool,
}

impl HostHypervisor {
    pub fn new(config: &DaemonConfig) -> Self {
        Self {
            config_data_dir: config.data_dir.clone(),
            binary: PathBuf::from("/usr/bin/qemu-system-x86_64"),
            kvm_available: std::path::Path::new("/dev/kvm").exists(),
            dev_mode: config.dev_mode,
        }
    }

    fn pid_file(&self, instance_id: &str) -> PathBuf {
        self.config_data_dir.join("run").join(format!("{instance_id}.pid"))
    }

    fn monitor_socket(&self, instance_id: &str) -> PathBuf {
        self.config_data_dir.join("sock").join(format!("{instance_id}.monitor"))
    }

    fn serial_socket(&self, instance_id: &str) -> PathBuf {
        self.config_data_dir.join("sock").join(format!("{instance_id}.serial"))
    }

    fn console_log(&self, instance_id: &str) -> PathBuf {
        self.config_data_dir.join("log").join(format!("{instance_id}.console.log"))
    }

    /// PID-file-plus-signal-0 liveness probe (§4.3 `IsRunning`). No side
    /// effects: reading a PID file and probing with signal 0 never changes
    /// process state.
    fn probe_pid_file(&self, pid_file: &std::path::Path) -> bool {
        let Ok(text) = std::fs::read_to_string(pid_file) else {
            return false;
        };
        let Ok(pid) = text.trim().parse::<i32>() else {
            return false;
        };
        kill(Pid::from_raw(pid), None).is_ok()
    }
}

#[async_trait]
impl HypervisorDriver for HostHypervisor {
    fn build_args(&self, instance: &Instance, ty: &hive_core::InstanceType) -> DaemonResult<LaunchSpec> {
        instance
            .boot_volume()
            .ok_or_else(|| DaemonError::SpawnFailed("no boot volume".to_string()))?;

        let block_devices = instance
            .block_volumes()
            .map(|v| BlockDeviceArg {
                nbd_uri: v.nbd_uri.clone(),
                cache: "none",
                io_thread: true,
                num_queues: ty.vcpus,
            })
            .collect();

        let nic = match &instance.network {
            Some(net) => NicArg::Tap { device: format!("tap-{}", instance.id), mac: net.mac.clone() },
            None => NicArg::UserForward {
                bind: "127.0.0.1".to_string(),
                host_port: 0,
                guest_port: 22,
            },
        };
        if instance.network.is_none() && !self.dev_mode {
            warn!(instance_id = %instance.id, "no ENI present outside dev mode, falling back to user-mode NIC");
        }

        Ok(LaunchSpec {
            binary: self.binary.clone(),
            machine_type: "q35",
            pcie_root_ports: PCIE_ROOT_PORTS,
            kvm: self.kvm_available,
            memory_mib: ty.memory_mib,
            vcpus: ty.vcpus,
            pid_file: self.pid_file(instance.id.as_str()),
            monitor_socket: self.monitor_socket(instance.id.as_str()),
            serial_socket: self.serial_socket(instance.id.as_str()),
            console_log: self.console_log(instance.id.as_str()),
            block_devices,
            nic,
        })
    }

    async fn spawn(&self, spec: &LaunchSpec) -> DaemonResult<u32> {
        let mut cmd = Command::new(&spec.binary);
        cmd.arg("-machine").arg(format!("q35,pcie-root-ports={}", spec.pcie_root_ports));
        if spec.kvm {
            cmd.arg("-accel").arg("kvm").arg("-cpu").arg("host");
        } else {
            cmd.arg("-cpu").arg("qemu64");
        }
        cmd.arg("-m").arg(spec.memory_mib.to_string());
        cmd.arg("-smp").arg(spec.vcpus.to_string());
        cmd.arg("-pidfile").arg(&spec.pid_file);
        cmd.arg("-monitor")
            .arg(format!("unix:{},server,nowait", spec.monitor_socket.display()));
        cmd.arg("-serial").arg(format!("unix:{},server,nowait", spec.serial_socket.display()));
        cmd.arg("-device").arg("virtio-rng-pci");
        for (i, dev) in spec.block_devices.iter().enumerate() {
            cmd.arg("-drive").arg(format!(
                "file={},if=none,cache={},aio=threads,id=drive{i}",
                dev.nbd_uri, dev.cache
            ));
            cmd.arg("-device").arg(format!(
                "virtio-blk-pci,drive=drive{i},num-queues={}",
                dev.num_queues
            ));
        }
        match &spec.nic {
            NicArg::Tap { device, mac } => {
                cmd.arg("-netdev").arg(format!("tap,id=net0,ifname={device},script=no"));
                cmd.arg("-device").arg(format!("virtio-net-pci,netdev=net0,mac={mac}"));
            }
            NicArg::UserForward { bind, host_port, guest_port } => {
                cmd.arg("-netdev").arg(format!(
                    "user,id=net0,hostfwd=tcp:{bind}:{host_port}-:{guest_port}"
                ));
                cmd.arg("-device").arg("virtio-net-pci,netdev=net0");
            }
        }
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| DaemonError::SpawnFailed(format!("failed to spawn hypervisor: {e}")))?;

        if let Some(pid) = child.id() {
            set_oom_priority_higher(pid);
        }

        if let Some(stdout) = child.stdout.take() {
            copy_lines_to_log(stdout, spec.console_log.clone(), "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            copy_lines_to_log(stderr, spec.console_log.clone(), "stderr");
        }

        let pid_file = spec.pid_file.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!(%status, "hypervisor process exited"),
                Err(e) => error!(error = %e, "failed to wait on hypervisor process"),
            }
        });

        wait_for_pid_file(&pid_file).await
    }

    async fn await_exit(&self, pid: u32) -> DaemonResult<i32> {
        loop {
            if kill(Pid::from_raw(pid as i32), None).is_err() {
                return Ok(0);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    fn is_running(&self, instance: &Instance) -> bool {
        self.probe_pid_file(&self.pid_file(instance.id.as_str()))
    }
}

#[cfg(target_os = "linux")]
fn set_oom_priority_higher(pid: u32) {
    let path = format!("/proc/{pid}/oom_score_adj");
    if let Err(e) = std::fs::write(&path, "500") {
        warn!(pid, error = %e, "failed to raise OOM priority, guest may survive host memory pressure at daemon's expense");
    }
}

#[cfg(not(target_os = "linux"))]
fn set_oom_priority_higher(_pid: u32) {}

fn copy_lines_to_log<R>(mut reader: R, log_path: PathBuf, stream: &'static str)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    use tokio::io::{AsyncBufReadExt, BufReader};
    tokio::spawn(async move {
        let mut lines = BufReader::new(&mut reader).lines();
        let file = tokio::fs::OpenOptions::new().create(true).append(true).open(&log_path).await;
        let mut file = match file {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "failed to open console log");
                return;
            }
        };
        use tokio::io::AsyncWriteExt;
        while let Ok(Some(line)) = lines.next_line().await {
            let _ = file.write_all(format!("[{stream}] {line}\n").as_bytes()).await;
        }
    });
}

async fn wait_for_pid_file(pid_file: &std::path::Path) -> DaemonResult<u32> {
    for _ in 0..100 {
        if let Ok(text) = tokio::fs::read_to_string(pid_file).await {
            if let Ok(pid) = text.trim().parse::<u32>() {
                if kill(Pid::from_raw(pid as i32), None).is_ok() {
                    return Ok(pid);
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Err(DaemonError::SpawnFailed("pid file never appeared or process not alive".to_string()))
}
