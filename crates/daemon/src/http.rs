// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP cluster-manager surface (§6): `GET /health`, `POST /join`,
//! `GET /config`. Three routes, hand-rolled HTTP/1.1 over a bare
//! `tokio::net::TcpListener` rather than a web framework, in the same
//! accept-loop-plus-spawned-handler shape the bus router and the teacher's
//! socket listener use.
//!
//! The cluster-membership service itself — bootstrap TLS, CA issuance,
//! the `predastoreConfig` blob — is an external collaborator (§1); this
//! surface only maintains the `ClusterConfig` record and hands back
//! whatever opaque join material the config carries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use hive_core::cluster::NodeInfo;
use hive_core::ClusterConfig;
use hive_wire::hive_admin::{ConfigResponse, HealthResponse, JoinRequest, JoinResponse};
use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::bus::MessageBus;
use crate::error::DaemonResult;
use crate::state_store::StateStoreAdapter;

/// Holds the node's view of cluster membership and answers the three
/// HTTP routes (§6). `epoch` tracks `config.epoch` separately as an atomic
/// so `GET /health` can read it without taking the config lock.
pub struct HttpServer {
    node: String,
    region: String,
    az: String,
    data_dir: String,
    start_time: Instant,
    bus: Arc<dyn MessageBus>,
    state_store: Arc<StateStoreAdapter>,
    config: RwLock<ClusterConfig>,
    epoch: AtomicU64,
    services: Vec<String>,
}

impl HttpServer {
    pub async fn new(
        node: String,
        region: String,
        az: String,
        data_dir: String,
        bus: Arc<dyn MessageBus>,
        state_store: Arc<StateStoreAdapter>,
        services: Vec<String>,
    ) -> DaemonResult<Arc<Self>> {
        let config = state_store.read_cluster_config().await?;
        let epoch = config.epoch;
        Ok(Arc::new(Self {
            node,
            region,
            az,
            data_dir,
            start_time: Instant::now(),
            bus,
            state_store,
            config: RwLock::new(config),
            epoch: AtomicU64::new(epoch),
            services,
        }))
    }

    /// Bind and serve until the process exits; each connection is handled in
    /// its own task so a slow or stalled peer never blocks another (§6).
    pub async fn serve(self: Arc<Self>, bind: &str) -> DaemonResult<()> {
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| crate::error::DaemonError::Config(format!("binding {bind}: {e}")))?;
        info!(bind, "HTTP cluster-manager surface listening");
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "HTTP accept error");
                    continue;
                }
            };
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = this.handle(stream).await {
                    warn!(peer = %peer, error = %e, "HTTP connection error");
                }
            });
        }
    }

    async fn handle(&self, stream: TcpStream) -> std::io::Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut request_line = String::new();
        if reader.read_line(&mut request_line).await? == 0 {
            return Ok(());
        }
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or("").to_string();
        let path = parts.next().unwrap_or("").to_string();

        let mut content_length = 0usize;
        loop {
            let mut header_line = String::new();
            if reader.read_line(&mut header_line).await? == 0 {
                break;
            }
            let header_line = header_line.trim_end();
            if header_line.is_empty() {
                break;
            }
            if let Some((name, value)) = header_line.split_once(':') {
                if name.trim().eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
            }
        }

        let mut body = vec![0u8; content_length];
        if content_length > 0 {
            reader.read_exact(&mut body).await?;
        }

        let (status, payload) = self.route(&method, &path, &body).await;
        let response = format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            payload.len()
        );
        write_half.write_all(response.as_bytes()).await?;
        write_half.write_all(&payload).await?;
        write_half.flush().await
    }

    async fn route(&self, method: &str, path: &str, body: &[u8]) -> (&'static str, Vec<u8>) {
        match (method, path) {
            ("GET", "/health") => self.health().await,
            ("POST", "/join") => self.join(body).await,
            ("GET", "/config") => self.get_config(),
            _ => ("404 Not Found", br#"{"error":"not found"}"#.to_vec()),
        }
    }

    async fn health(&self) -> (&'static str, Vec<u8>) {
        let mut service_health = std::collections::HashMap::new();
        service_health.insert("bus".to_string(), self.bus.is_connected().await);
        service_health.insert("store".to_string(), self.state_store.is_reachable().await);
        let all_healthy = service_health.values().all(|ok| *ok);

        let resp = HealthResponse {
            node: self.node.clone(),
            status: if all_healthy { "ok".to_string() } else { "degraded".to_string() },
            config_hash: self.config.read().content_hash(),
            epoch: self.epoch.load(Ordering::SeqCst),
            uptime_secs: self.start_time.elapsed().as_secs(),
            services: self.services.clone(),
            service_health,
        };
        encode_ok(&resp)
    }

    async fn join(&self, body: &[u8]) -> (&'static str, Vec<u8>) {
        let req: JoinRequest = match serde_json::from_slice(body) {
            Ok(r) => r,
            Err(_) => return ("400 Bad Request", br#"{"error":"missing or malformed fields"}"#.to_vec()),
        };
        if req.node.is_empty() || req.region.is_empty() || req.az.is_empty() || req.data_dir.is_empty()
            || req.daemon_host.is_empty()
        {
            return ("400 Bad Request", br#"{"error":"missing fields"}"#.to_vec());
        }

        {
            let config = self.config.read();
            if config.nodes.contains_key(&req.node) {
                return ("409 Conflict", br#"{"error":"node already joined"}"#.to_vec());
            }
        }

        let info = NodeInfo {
            region: req.region,
            az: req.az,
            base_dir: req.data_dir,
            daemon_host: req.daemon_host,
        };

        let snapshot = {
            let mut config = self.config.write();
            config.join(&req.node, info);
            self.epoch.store(config.epoch, Ordering::SeqCst);
            config.clone()
        };

        if let Err(e) = self.state_store.write_cluster_config(&snapshot).await {
            warn!(node = %req.node, error = %e, "failed to persist cluster config after join");
        }

        let resp = JoinResponse {
            success: true,
            shared_data: serde_json::json!({
                "epoch": snapshot.epoch,
                "version": snapshot.version,
            }),
            config_hash: snapshot.content_hash(),
            // Bootstrap TLS material is minted by an out-of-scope collaborator
            // (§1); this surface only carries whatever it's handed.
            ca_cert: String::new(),
            ca_key: String::new(),
            predastore_config: serde_json::Value::Null,
        };
        encode_ok(&resp)
    }

    fn get_config(&self) -> (&'static str, Vec<u8>) {
        let config = self.config.read().clone();
        let resp = ConfigResponse { config_hash: config.content_hash(), config };
        encode_ok(&resp)
    }

    /// Called once at startup so `GET /health`'s `node`/`region`/`az` fields
    /// (and any future self-registration) reflect this process, not just
    /// whatever `ClusterConfig` was loaded from the store.
    pub fn self_node_info(&self) -> NodeInfo {
        NodeInfo {
            region: self.region.clone(),
            az: self.az.clone(),
            base_dir: self.data_dir.clone(),
            daemon_host: self.node.clone(),
        }
    }
}

fn encode_ok<T: serde::Serialize>(value: &T) -> (&'static str, Vec<u8>) {
    match serde_json::to_vec(value) {
        Ok(body) => ("200 OK", body),
        Err(e) => {
            warn!(error = %e, "failed to encode HTTP response body");
            ("500 Internal Server Error", br#"{"error":"internal error"}"#.to_vec())
        }
    }
}
