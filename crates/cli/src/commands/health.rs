// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `hivectl health` — GET /health against a node's cluster-manager surface.

use anyhow::{anyhow, Result};
use hive_wire::hive_admin::HealthResponse;

use crate::client::http_get;
use crate::output::{format_or_json, OutputFormat};

pub async fn run(http: &str, format: OutputFormat) -> Result<()> {
    let (status, body) = http_get(http, "/health").await?;
    if status != 200 {
        return Err(anyhow!("node returned HTTP {status}: {}", String::from_utf8_lossy(&body)));
    }
    let health: HealthResponse = serde_json::from_slice(&body)?;

    format_or_json(format, &health, || {
        println!("Node:       {}", health.node);
        println!("Status:     {}", health.status);
        println!("Epoch:      {}", health.epoch);
        println!("Config:     {}", health.config_hash);
        println!("Uptime:     {}s", health.uptime_secs);
        println!("Services:   {}", health.services.join(", "));
        for (service, ok) in &health.service_health {
            println!("  {service}: {}", if *ok { "ok" } else { "unreachable" });
        }
    })
}
