// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Talks to a running node's bus or HTTP cluster-manager surface (§6).
//! `hivectl` has no subscriptions of its own — every call here is a single
//! request/reply round trip.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Issue one NATS request and return the raw reply payload.
pub async fn bus_request(addr: &str, subject: &str, payload: Vec<u8>) -> Result<Vec<u8>> {
    let client = async_nats::connect(addr).await.context("connecting to message bus")?;
    let message = tokio::time::timeout(
        Duration::from_secs(10),
        client.request(subject.to_string(), payload.into()),
    )
    .await
    .map_err(|_| anyhow!("request to {subject} timed out"))?
    .map_err(|e| anyhow!("request to {subject} failed: {e}"))?;
    Ok(message.payload.to_vec())
}

/// Issue one hand-rolled HTTP/1.1 GET against a node's cluster-manager
/// surface (§6), mirroring the wire format `hive_daemon::http` writes.
pub async fn http_get(addr: &str, path: &str) -> Result<(u16, Vec<u8>)> {
    http_request(addr, "GET", path, &[]).await
}

pub async fn http_post(addr: &str, path: &str, body: &[u8]) -> Result<(u16, Vec<u8>)> {
    http_request(addr, "POST", path, body).await
}

async fn http_request(addr: &str, method: &str, path: &str, body: &[u8]) -> Result<(u16, Vec<u8>)> {
    let mut stream = TcpStream::connect(addr).await.with_context(|| format!("connecting to {addr}"))?;

    let mut request = format!(
        "{method} {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    stream.write_all(request.as_bytes()).await?;
    if !body.is_empty() {
        stream.write_all(body).await?;
    }
    request.clear();

    let (read_half, _write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut status_line = String::new();
    reader.read_line(&mut status_line).await?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| anyhow!("malformed HTTP status line: {status_line:?}"))?;

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

    let mut response_body = vec![0u8; content_length];
    if content_length > 0 {
        reader.read_exact(&mut response_body).await?;
    }
    Ok((status, response_body))
}
