// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::ValueEnum;
use serde::Serialize;

#[derive(Clone, Copy, Debug, Default, PartialEq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Format-branch helper for single-record commands (health, config, ...).
///
/// Renders as JSON when `format` is `Json`, otherwise calls `text_fn`.
pub fn format_or_json<T: Serialize>(
    format: OutputFormat,
    data: &T,
    text_fn: impl FnOnce(),
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(data)?),
        OutputFormat::Text => text_fn(),
    }
    Ok(())
}

/// Render a list as text table or JSON. Handles the empty case and the
/// format branch shared across `describe-instances`/`describe-instance-types`.
pub fn handle_list<T: Serialize>(
    format: OutputFormat,
    items: &[T],
    empty_msg: &str,
    render_text: impl FnOnce(&[T]),
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(items)?),
        OutputFormat::Text => {
            if items.is_empty() {
                println!("{}", empty_msg);
            } else {
                render_text(items);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn handle_list_calls_render_text_only_when_non_empty() {
        let called = AtomicBool::new(false);
        handle_list(OutputFormat::Text, &[1, 2, 3], "empty", |_| {
            called.store(true, Ordering::SeqCst);
        })
        .unwrap();
        assert!(called.load(Ordering::SeqCst));

        let called = AtomicBool::new(false);
        handle_list(OutputFormat::Text, &Vec::<i32>::new(), "empty", |_| {
            called.store(true, Ordering::SeqCst);
        })
        .unwrap();
        assert!(!called.load(Ordering::SeqCst));
    }

    #[test]
    fn format_or_json_skips_text_fn_in_json_mode() {
        let called = AtomicBool::new(false);
        format_or_json(OutputFormat::Json, &serde_json::json!({"a": 1}), || {
            called.store(true, Ordering::SeqCst);
        })
        .unwrap();
        assert!(!called.load(Ordering::SeqCst));
    }
}
