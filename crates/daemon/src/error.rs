// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon-level error types, layering bus/store/process failures over
//! `hive_core::CoreError`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Core(#[from] hive_core::CoreError),

    #[error("bus error: {0}")]
    Bus(String),

    #[error("bus request to {subject} timed out after {elapsed_ms}ms")]
    BusTimeout { subject: String, elapsed_ms: u64 },

    #[error("store error: {0}")]
    Store(String),

    #[error("store unavailable after {attempts} attempts")]
    StoreUnavailable { attempts: u32 },

    #[error("instance {0} is already running")]
    AlreadyRunning(String),

    #[error("hypervisor spawn failed: {0}")]
    SpawnFailed(String),

    #[error("monitor channel error: {0}")]
    Monitor(String),

    #[error("volume preparation failed: {0}")]
    VolumePreparation(String),

    #[error("launch timed out")]
    LaunchTimeout,

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DaemonResult<T> = Result<T, DaemonError>;
