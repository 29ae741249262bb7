// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The subject-addressed bus abstraction (§3 substrate, §4.6).
//!
//! `MessageBus` is the seam between the lifecycle engine and the real
//! transport. `NatsBus` is the production implementation over `async-nats`;
//! `InProcessBus` is an in-memory test double with the same queue-group and
//! fan-out semantics, used by orchestrator and router tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::error::{DaemonError, DaemonResult};

/// A subscription handle. Dropping it does not unsubscribe; call
/// `MessageBus::unsubscribe` explicitly so the bus router's subscription
/// table stays the single source of truth (§5: "daemon-level lock, held
/// only across subscribe/unsubscribe").
pub struct Subscription {
    pub subject: String,
    pub receiver: mpsc::Receiver<BusMessage>,
}

/// One inbound message: a payload plus an optional reply channel. Worker
/// queue and per-instance subjects always carry a reply channel; fan-out
/// publishes from `publish_fanout` may not expect one.
pub struct BusMessage {
    pub payload: Vec<u8>,
    pub reply: Option<oneshot::Sender<Vec<u8>>>,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Subscribe to a subject in a shared queue group: at most one
    /// subscriber across the fleet receives each message (worker-queue
    /// subjects, §4.6).
    async fn subscribe_queue(&self, subject: &str, group: &str) -> DaemonResult<Subscription>;

    /// Subscribe as a plain (non-queued) subscriber: used for per-instance
    /// command topics and fan-out subjects, where every subscriber must see
    /// every message (§4.6).
    async fn subscribe(&self, subject: &str) -> DaemonResult<Subscription>;

    async fn unsubscribe(&self, subject: &str) -> DaemonResult<()>;

    /// Request/reply with a deadline. Used for `ebs.*` calls and any
    /// synchronous bus round trip (§5: "30s default, 10s rollback unmount,
    /// 5s sync").
    async fn request(&self, subject: &str, payload: Vec<u8>, timeout: Duration)
        -> DaemonResult<Vec<u8>>;

    /// Fire-and-forget publish, used for fan-out replies and node-status
    /// broadcasts.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> DaemonResult<()>;

    /// True once the underlying transport reports itself connected
    /// (§4.8 cluster-readiness gate).
    async fn is_connected(&self) -> bool;
}

/// Production bus over `async-nats`.
pub struct NatsBus {
    client: async_nats::Client,
    subs: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
}

impl NatsBus {
    pub async fn connect(addr: &str) -> DaemonResult<Self> {
        let client =
            async_nats::connect(addr).await.map_err(|e| DaemonError::Bus(e.to_string()))?;
        Ok(Self { client, subs: Mutex::new(HashMap::new()) })
    }

    async fn spawn_forwarder(
        &self,
        subject: String,
        mut sub: async_nats::Subscriber,
    ) -> mpsc::Receiver<BusMessage> {
        use futures_util::StreamExt;

        let (tx, rx) = mpsc::channel(64);
        let client = self.client.clone();
        let handle = tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                let reply_subject = msg.reply.clone();
                let (reply_tx, reply_rx) = oneshot::channel::<Vec<u8>>();
                let forwarded =
                    BusMessage { payload: msg.payload.to_vec(), reply: Some(reply_tx) };
                if tx.send(forwarded).await.is_err() {
                    break;
                }
                if let Some(reply_subject) = reply_subject {
                    let client = client.clone();
                    tokio::spawn(async move {
                        if let Ok(body) = reply_rx.await {
                            let _ = client.publish(reply_subject, body.into()).await;
                        }
                    });
                }
            }
        });
        self.subs.lock().insert(subject, handle);
        rx
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn subscribe_queue(&self, subject: &str, group: &str) -> DaemonResult<Subscription> {
        let sub = self
            .client
            .queue_subscribe(subject.to_string(), group.to_string())
            .await
            .map_err(|e| DaemonError::Bus(e.to_string()))?;
        let receiver = self.spawn_forwarder(subject.to_string(), sub).await;
        Ok(Subscription { subject: subject.to_string(), receiver })
    }

    async fn subscribe(&self, subject: &str) -> DaemonResult<Subscription> {
        let sub = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| DaemonError::Bus(e.to_string()))?;
        let receiver = self.spawn_forwarder(subject.to_string(), sub).await;
        Ok(Subscription { subject: subject.to_string(), receiver })
    }

    async fn unsubscribe(&self, subject: &str) -> DaemonResult<()> {
        if let Some(handle) = self.subs.lock().remove(subject) {
            handle.abort();
        }
        Ok(())
    }

    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> DaemonResult<Vec<u8>> {
        let fut = self.client.request(subject.to_string(), payload.into());
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(msg)) => Ok(msg.payload.to_vec()),
            Ok(Err(e)) => Err(DaemonError::Bus(e.to_string())),
            Err(_) => Err(DaemonError::BusTimeout {
                subject: subject.to_string(),
                elapsed_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> DaemonResult<()> {
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| DaemonError::Bus(e.to_string()))
    }

    async fn is_connected(&self) -> bool {
        matches!(self.client.connection_state(), async_nats::connection::State::Connected)
    }
}

/// In-process test double. Queue-group subjects round-robin across
/// registered subscribers; plain/fan-out subjects deliver to every
/// subscriber. Good enough to drive orchestrator and router tests without a
/// real broker.
#[derive(Default, Clone)]
pub struct InProcessBus {
    inner: Arc<Mutex<InProcessInner>>,
}

#[derive(Default)]
struct InProcessInner {
    queue_subs: HashMap<String, Vec<mpsc::Sender<BusMessage>>>,
    plain_subs: HashMap<String, Vec<mpsc::Sender<BusMessage>>>,
    next_queue_target: HashMap<String, usize>,
    connected: bool,
}

impl InProcessBus {
    pub fn new() -> Self {
        let bus = Self::default();
        bus.inner.lock().connected = true;
        bus
    }
}

#[async_trait]
impl MessageBus for InProcessBus {
    async fn subscribe_queue(&self, subject: &str, _group: &str) -> DaemonResult<Subscription> {
        let (tx, rx) = mpsc::channel(64);
        self.inner.lock().queue_subs.entry(subject.to_string()).or_default().push(tx);
        Ok(Subscription { subject: subject.to_string(), receiver: rx })
    }

    async fn subscribe(&self, subject: &str) -> DaemonResult<Subscription> {
        let (tx, rx) = mpsc::channel(64);
        self.inner.lock().plain_subs.entry(subject.to_string()).or_default().push(tx);
        Ok(Subscription { subject: subject.to_string(), receiver: rx })
    }

    async fn unsubscribe(&self, subject: &str) -> DaemonResult<()> {
        let mut inner = self.inner.lock();
        inner.queue_subs.remove(subject);
        inner.plain_subs.remove(subject);
        Ok(())
    }

    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> DaemonResult<Vec<u8>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let sender = {
            let mut inner = self.inner.lock();
            let targets = inner.queue_subs.get(subject).cloned().unwrap_or_default();
            if targets.is_empty() {
                return Err(DaemonError::Bus(format!("no subscriber for {subject}")));
            }
            let idx = inner.next_queue_target.entry(subject.to_string()).or_insert(0);
            let chosen = targets[*idx % targets.len()].clone();
            *idx += 1;
            chosen
        };
        sender
            .send(BusMessage { payload, reply: Some(reply_tx) })
            .await
            .map_err(|_| DaemonError::Bus(format!("subscriber for {subject} gone")))?;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(_)) => Err(DaemonError::Bus(format!("no reply from {subject}"))),
            Err(_) => {
                Err(DaemonError::BusTimeout { subject: subject.to_string(), elapsed_ms: timeout.as_millis() as u64 })
            }
        }
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> DaemonResult<()> {
        let targets = {
            let inner = self.inner.lock();
            let mut all = inner.plain_subs.get(subject).cloned().unwrap_or_default();
            all.extend(inner.queue_subs.get(subject).cloned().unwrap_or_default());
            all
        };
        for sender in targets {
            let _ = sender.send(BusMessage { payload: payload.clone(), reply: None }).await;
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_process_request_reply_round_trips() {
        let bus = InProcessBus::new();
        let mut sub = bus.subscribe_queue("ec2.start", "hived").await.unwrap();
        tokio::spawn(async move {
            if let Some(msg) = sub.receiver.recv().await {
                if let Some(reply) = msg.reply {
                    let _ = reply.send(b"ok".to_vec());
                }
            }
        });
        let resp = bus.request("ec2.start", b"go".to_vec(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(resp, b"ok");
    }

    #[tokio::test]
    async fn in_process_request_with_no_subscriber_errors() {
        let bus = InProcessBus::new();
        let err = bus.request("ec2.start", b"go".to_vec(), Duration::from_millis(50)).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn fan_out_publish_reaches_every_plain_subscriber() {
        let bus = InProcessBus::new();
        let mut a = bus.subscribe("hive.nodes.discover").await.unwrap();
        let mut b = bus.subscribe("hive.nodes.discover").await.unwrap();
        bus.publish("hive.nodes.discover", b"ping".to_vec()).await.unwrap();
        assert!(a.receiver.recv().await.is_some());
        assert!(b.receiver.recv().await.is_some());
    }
}
