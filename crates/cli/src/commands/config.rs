// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `hivectl config` — GET /config against a node's cluster-manager surface.

use anyhow::{anyhow, Result};
use hive_wire::hive_admin::ConfigResponse;

use crate::client::http_get;
use crate::output::{format_or_json, OutputFormat};

pub async fn run(http: &str, format: OutputFormat) -> Result<()> {
    let (status, body) = http_get(http, "/config").await?;
    if status != 200 {
        return Err(anyhow!("node returned HTTP {status}: {}", String::from_utf8_lossy(&body)));
    }
    let config: ConfigResponse = serde_json::from_slice(&body)?;

    format_or_json(format, &config, || {
        println!("Epoch:       {}", config.config.epoch);
        println!("Version:     {}", config.config.version);
        println!("Config hash: {}", config.config_hash);
        println!("Nodes:");
        for (name, info) in &config.config.nodes {
            println!("  {name}  {}/{}  {}", info.region, info.az, info.daemon_host);
        }
    })
}
