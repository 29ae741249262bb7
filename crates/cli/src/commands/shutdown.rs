// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `hivectl shutdown <phase>` — drives one step of the cluster-wide
//! shutdown protocol (§4.9). Every node answers the phase's fan-out
//! subject independently, so this publishes with its own reply inbox and
//! collects whatever responses arrive within the window rather than
//! stopping at the first one.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::ValueEnum;
use futures_util::StreamExt;
use hive_wire::subjects::ShutdownPhase as WirePhase;

use crate::output::{format_or_json, OutputFormat};

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum Phase {
    Gate,
    Drain,
    Storage,
    Persist,
    Infra,
}

impl From<Phase> for WirePhase {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Gate => WirePhase::Gate,
            Phase::Drain => WirePhase::Drain,
            Phase::Storage => WirePhase::Storage,
            Phase::Persist => WirePhase::Persist,
            Phase::Infra => WirePhase::Infra,
        }
    }
}

/// How long to wait for node replies on a fan-out shutdown phase before
/// reporting whatever showed up. Generous: the drain phase can take a
/// while to stop every owned instance (§4.9).
const REPLY_WINDOW: Duration = Duration::from_secs(15);

pub async fn run(bus: &str, phase: Phase, format: OutputFormat) -> Result<()> {
    let wire_phase: WirePhase = phase.into();
    let subject = wire_phase.subject();

    let client = async_nats::connect(bus).await.context("connecting to message bus")?;
    let reply_inbox = client.new_inbox();
    let mut replies = client.subscribe(reply_inbox.clone()).await.context("subscribing to reply inbox")?;

    client
        .publish_with_reply(subject.clone(), reply_inbox, Vec::new().into())
        .await
        .with_context(|| format!("publishing phase {}", wire_phase.as_str()))?;
    client.flush().await.context("flushing bus connection")?;

    let mut results = Vec::new();
    let deadline = tokio::time::Instant::now() + REPLY_WINDOW;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, replies.next()).await {
            Ok(Some(msg)) => {
                let value: serde_json::Value =
                    serde_json::from_slice(&msg.payload).unwrap_or(serde_json::Value::Null);
                results.push(value);
            }
            _ => break,
        }
    }

    if results.is_empty() {
        return Err(anyhow!("no node answered phase {} within {:?}", wire_phase.as_str(), REPLY_WINDOW));
    }

    let failures: Vec<&serde_json::Value> =
        results.iter().filter(|r| r.get("ok").and_then(|v| v.as_bool()) != Some(true)).collect();

    let summary = serde_json::json!({
        "phase": wire_phase.as_str(),
        "replies": results,
    });

    format_or_json(format, &summary, || {
        println!("phase {}: {} node(s) replied", wire_phase.as_str(), results.len());
        for (i, reply) in results.iter().enumerate() {
            println!("  [{i}] {reply}");
        }
    })?;

    if !failures.is_empty() {
        return Err(anyhow!("{} node(s) reported a failure for phase {}", failures.len(), wire_phase.as_str()));
    }
    Ok(())
}
