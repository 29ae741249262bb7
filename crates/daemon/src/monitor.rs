// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Monitor Channel (§4.3, §4.4 "Monitor Channel" component): a duplex
//! JSON-over-socket channel to the guest hypervisor's monitor. Performs the
//! capability handshake, serializes command/response pairs one at a time,
//! and surfaces asynchronous events to a channel the watchdog and state
//! machine can observe.
//!
//! Async events are informational only (§4.4, §5, §9): this module never
//! drives a state transition itself, it only forwards what it reads.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tracing::{debug, warn};

use crate::error::{DaemonError, DaemonResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorCommand {
    pub execute: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MonitorFrame {
    Response { #[serde(rename = "return")] value: serde_json::Value },
    Error { error: serde_json::Value },
    Event { event: String, data: serde_json::Value },
}

/// An asynchronous guest event (STOP, RESUME, POWERDOWN, RESET, ...).
/// Informational only — the command handler that initiated an action owns
/// the transition, never this reader (§4.4, §9).
#[derive(Debug, Clone)]
pub struct MonitorEvent {
    pub name: String,
    pub data: serde_json::Value,
}

struct PendingCall {
    reply: oneshot::Sender<DaemonResult<serde_json::Value>>,
}

/// One command in flight at a time; the read loop holds this lock while
/// decoding so events and replies stay strictly ordered per channel (§5).
pub struct MonitorChannel {
    writer: AsyncMutex<tokio::net::unix::OwnedWriteHalf>,
    pending: Mutex<Option<PendingCall>>,
    events: mpsc::Sender<MonitorEvent>,
}

impl MonitorChannel {
    /// Connect and perform the capability handshake (§4.5 step 4).
    pub async fn connect(
        socket_path: &Path,
        events: mpsc::Sender<MonitorEvent>,
    ) -> DaemonResult<Arc<Self>> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(|e| DaemonError::Monitor(format!("connect {}: {e}", socket_path.display())))?;
        let (read_half, write_half) = stream.into_split();

        let channel = Arc::new(Self {
            writer: AsyncMutex::new(write_half),
            pending: Mutex::new(None),
            events,
        });

        let reader_channel = Arc::clone(&channel);
        tokio::spawn(async move {
            reader_channel.read_loop(read_half).await;
        });

        channel
            .call(MonitorCommand { execute: "qmp_capabilities".to_string(), arguments: None })
            .await?;
        Ok(channel)
    }

    async fn read_loop(self: Arc<Self>, read_half: tokio::net::unix::OwnedReadHalf) {
        let mut lines = BufReader::new(read_half).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!("monitor channel closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "monitor channel read error");
                    break;
                }
            };
            let frame: MonitorFrame = match serde_json::from_str(&line) {
                Ok(f) => f,
                Err(e) => {
                    warn!(error = %e, line = %line, "malformed monitor frame");
                    continue;
                }
            };
            match frame {
                MonitorFrame::Response { value } => self.deliver(Ok(value)),
                MonitorFrame::Error { error } => {
                    self.deliver(Err(DaemonError::Monitor(error.to_string())))
                }
                MonitorFrame::Event { event, data } => {
                    let _ = self.events.try_send(MonitorEvent { name: event, data });
                }
            }
        }
    }

    fn deliver(&self, result: DaemonResult<serde_json::Value>) {
        if let Some(pending) = self.pending.lock().take() {
            let _ = pending.reply.send(result);
        }
    }

    /// Send one command and wait for its reply. Only one call may be in
    /// flight at a time (§5); concurrent callers queue behind the writer
    /// lock naturally since each call awaits its own oneshot before
    /// returning.
    pub async fn call(&self, command: MonitorCommand) -> DaemonResult<serde_json::Value> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.is_some() {
                return Err(DaemonError::Monitor("command already in flight".to_string()));
            }
            *pending = Some(PendingCall { reply: tx });
        }

        let body = serde_json::to_vec(&command).map_err(|e| DaemonError::Monitor(e.to_string()))?;
        self.write_frame(&body).await?;

        rx.await.map_err(|_| DaemonError::Monitor("channel closed before reply".to_string()))?
    }

    async fn write_frame(&self, body: &[u8]) -> DaemonResult<()> {
        let mut stream = self.writer.lock().await;
        stream.write_all(body).await.map_err(DaemonError::Io)?;
        stream.write_all(b"\n").await.map_err(DaemonError::Io)?;
        Ok(())
    }
}
