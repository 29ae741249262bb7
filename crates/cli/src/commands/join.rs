// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `hivectl join` — POST /join against a cluster-manager node on behalf of
//! a new node (§6). Operator-driven bootstrap; the daemon itself never
//! calls this — it only serves it.

use anyhow::{anyhow, Result};
use hive_wire::hive_admin::{JoinRequest, JoinResponse};

use crate::client::http_post;
use crate::output::{format_or_json, OutputFormat};

#[allow(clippy::too_many_arguments)]
pub async fn run(
    http: &str,
    node: String,
    region: String,
    az: String,
    data_dir: String,
    daemon_host: String,
    format: OutputFormat,
) -> Result<()> {
    let req = JoinRequest { node, region, az, data_dir, daemon_host };
    let body = serde_json::to_vec(&req)?;
    let (status, resp_body) = http_post(http, "/join", &body).await?;
    if status == 409 {
        return Err(anyhow!("node '{}' has already joined this cluster", req.node));
    }
    if status != 200 {
        return Err(anyhow!("join rejected with HTTP {status}: {}", String::from_utf8_lossy(&resp_body)));
    }
    let join: JoinResponse = serde_json::from_slice(&resp_body)?;

    format_or_json(format, &join, || {
        println!("Joined cluster as '{}'", req.node);
        println!("Config hash: {}", join.config_hash);
    })
}
