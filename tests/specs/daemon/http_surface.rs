// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end specs for the HTTP cluster-manager surface (§6): a real
//! `hive_daemon::http::HttpServer` against in-process doubles, driven by
//! the actual `hivectl` binary rather than by calling handlers directly.

use std::sync::Arc;
use std::time::Duration;

use hive_daemon::bus::{InProcessBus, MessageBus};
use hive_daemon::http::HttpServer;
use hive_daemon::state_store::StateStoreAdapter;
use hive_daemon::store::MemStore;

use crate::prelude::*;

/// Starts an `HttpServer` on an ephemeral port backed by fresh in-process
/// doubles and returns its `host:port` address.
async fn spawn_node(node: &str) -> String {
    let bus: Arc<dyn MessageBus> = Arc::new(InProcessBus::new());
    let state_store = StateStoreAdapter::connect(Arc::new(MemStore::new()))
        .await
        .expect("a fresh MemStore always connects");

    let server = HttpServer::new(
        node.to_string(),
        "us-east".into(),
        "us-east-1a".into(),
        "/var/lib/hive".into(),
        bus,
        Arc::new(state_store),
        vec!["bus".into(), "store".into()],
    )
    .await
    .expect("a fresh MemStore always yields a default cluster config");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("binding an ephemeral loopback port");
    let addr = listener.local_addr().expect("listener has a local address").to_string();
    drop(listener);

    tokio::spawn({
        let addr = addr.clone();
        async move {
            let _ = server.serve(&addr).await;
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}

#[tokio::test]
async fn health_reports_ok_for_a_freshly_started_node() {
    let addr = spawn_node("node-a").await;

    cli()
        .args(["--http", &addr, "health"])
        .passes()
        .stdout_has("node-a")
        .stdout_has("Status:     ok");
}

#[tokio::test]
async fn join_adds_the_node_and_bumps_the_epoch() {
    let addr = spawn_node("node-a").await;

    cli()
        .args([
            "--http",
            &addr,
            "join",
            "node-b",
            "--region",
            "us-west",
            "--az",
            "us-west-2a",
            "--data-dir",
            "/var/lib/hive",
            "--daemon-host",
            "10.0.0.9",
        ])
        .passes()
        .stdout_has("Joined cluster as 'node-b'");

    cli()
        .args(["--http", &addr, "--output", "json", "config"])
        .passes()
        .stdout_has("\"epoch\": 1")
        .stdout_has("node-b")
        .stdout_has("10.0.0.9");
}

#[tokio::test]
async fn joining_the_same_node_name_twice_conflicts() {
    let addr = spawn_node("node-a").await;
    let join_args = [
        "--http",
        addr.as_str(),
        "join",
        "node-b",
        "--region",
        "us-west",
        "--az",
        "us-west-2a",
        "--data-dir",
        "/var/lib/hive",
        "--daemon-host",
        "10.0.0.9",
    ];

    cli().args(join_args).passes();
    cli().args(join_args).fails().stderr_has("already joined");
}

#[tokio::test]
async fn join_rejects_a_request_missing_a_required_field() {
    let addr = spawn_node("node-a").await;

    cli()
        .args([
            "--http", &addr, "join", "node-c", "--region", "", "--az", "us-west-2a", "--data-dir",
            "/var/lib/hive", "--daemon-host", "10.0.0.9",
        ])
        .fails()
        .stderr_has("HTTP 400");
}
