// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The replicated KV substrate abstraction (§3, §4.2).
//!
//! `ReplicatedStore` is the narrow trait the State Store Adapter builds on.
//! Writes are last-writer-wins per key (§4.2); compare-and-set is exposed
//! for the handful of call sites that need it (claiming a stopped instance,
//! §9 "a compare-and-set on presence suffices").

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{DaemonError, DaemonResult};

#[async_trait]
pub trait ReplicatedStore: Send + Sync {
    async fn get(&self, key: &str) -> DaemonResult<Option<Vec<u8>>>;
    async fn put(&self, key: &str, value: Vec<u8>) -> DaemonResult<()>;
    async fn delete(&self, key: &str) -> DaemonResult<()>;

    /// Write `value` only if the key is currently absent (or, when
    /// `expected` is `Some`, only if the current value equals it).
    /// Returns `true` if the write took effect.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> DaemonResult<bool>;

    /// All keys under a prefix, used to load `instances.<node>`-style maps.
    async fn scan_prefix(&self, prefix: &str) -> DaemonResult<Vec<(String, Vec<u8>)>>;

    /// Raise the effective replication factor. Best-effort; failures are
    /// logged and retried on the next membership change (§4.2).
    async fn set_replication_factor(&self, n: u32) -> DaemonResult<()>;

    async fn is_reachable(&self) -> bool;
}

/// In-process store for tests and for crash-recovery scenario fixtures
/// (§8 scenarios 4/5).
#[derive(Default, Clone)]
pub struct MemStore {
    inner: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReplicatedStore for MemStore {
    async fn get(&self, key: &str) -> DaemonResult<Option<Vec<u8>>> {
        Ok(self.inner.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> DaemonResult<()> {
        self.inner.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> DaemonResult<()> {
        self.inner.write().remove(key);
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> DaemonResult<bool> {
        let mut map = self.inner.write();
        let current = map.get(key).map(|v| v.as_slice());
        if current != expected {
            return Ok(false);
        }
        map.insert(key.to_string(), value);
        Ok(true)
    }

    async fn scan_prefix(&self, prefix: &str) -> DaemonResult<Vec<(String, Vec<u8>)>> {
        Ok(self
            .inner
            .read()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn set_replication_factor(&self, _n: u32) -> DaemonResult<()> {
        Ok(())
    }

    async fn is_reachable(&self) -> bool {
        true
    }
}

/// Store connected over the bus's own substrate (§3: "treated as an
/// abstract store"). The production deployment places the replicated KV
/// behind the same transport as the pub/sub bus, so this implementation
/// speaks to it via request/reply subjects rather than a bespoke client.
pub struct BusBackedStore {
    bus: Arc<dyn crate::bus::MessageBus>,
    timeout: std::time::Duration,
}

impl BusBackedStore {
    pub fn new(bus: Arc<dyn crate::bus::MessageBus>, timeout: std::time::Duration) -> Self {
        Self { bus, timeout }
    }

    fn subject(op: &str, key: &str) -> String {
        format!("kv.{op}.{key}")
    }
}

#[async_trait]
impl ReplicatedStore for BusBackedStore {
    async fn get(&self, key: &str) -> DaemonResult<Option<Vec<u8>>> {
        let resp = self.bus.request(&Self::subject("get", key), Vec::new(), self.timeout).await?;
        if resp.is_empty() {
            Ok(None)
        } else {
            Ok(Some(resp))
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> DaemonResult<()> {
        self.bus.request(&Self::subject("put", key), value, self.timeout).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> DaemonResult<()> {
        self.bus.request(&Self::subject("del", key), Vec::new(), self.timeout).await?;
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> DaemonResult<bool> {
        #[derive(serde::Serialize)]
        struct Cas<'a> {
            expected: Option<&'a [u8]>,
            value: &'a [u8],
        }
        let body = serde_json::to_vec(&Cas { expected, value: &value })
            .map_err(|e| DaemonError::Store(e.to_string()))?;
        let resp = self.bus.request(&Self::subject("cas", key), body, self.timeout).await?;
        Ok(resp.first().copied() == Some(1))
    }

    async fn scan_prefix(&self, prefix: &str) -> DaemonResult<Vec<(String, Vec<u8>)>> {
        let resp =
            self.bus.request(&Self::subject("scan", prefix), Vec::new(), self.timeout).await?;
        serde_json::from_slice(&resp).map_err(|e| DaemonError::Store(e.to_string()))
    }

    async fn set_replication_factor(&self, n: u32) -> DaemonResult<()> {
        self.bus
            .request("kv.replicas", n.to_le_bytes().to_vec(), self.timeout)
            .await?;
        Ok(())
    }

    async fn is_reachable(&self) -> bool {
        self.bus.is_connected().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn compare_and_set_rejects_on_mismatch() {
        let store = MemStore::new();
        store.put("k", b"v1".to_vec()).await.unwrap();
        let ok = store.compare_and_set("k", Some(b"wrong"), b"v2".to_vec()).await.unwrap();
        assert!(!ok);
        assert_eq!(store.get("k").await.unwrap(), Some(b"v1".to_vec()));
    }

    #[tokio::test]
    async fn compare_and_set_on_absent_key_requires_none_expected() {
        let store = MemStore::new();
        let ok = store.compare_and_set("fresh", None, b"v".to_vec()).await.unwrap();
        assert!(ok);
        assert_eq!(store.get("fresh").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn scan_prefix_returns_only_matching_keys() {
        let store = MemStore::new();
        store.put("instances.node-a.i-1", b"{}".to_vec()).await.unwrap();
        store.put("instances.node-b.i-2", b"{}".to_vec()).await.unwrap();
        let got = store.scan_prefix("instances.node-a.").await.unwrap();
        assert_eq!(got.len(), 1);
    }
}
