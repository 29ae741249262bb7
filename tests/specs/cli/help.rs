// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `hivectl` help output and argument-validation specs. These run without
//! any live bus or node — `hivectl` never touches disk or state on its own.

use crate::prelude::*;

#[test]
fn hivectl_no_args_shows_usage_and_fails() {
    cli().fails().stderr_has("Usage:");
}

#[test]
fn hivectl_help_shows_usage() {
    cli().arg("--help").passes().stdout_has("Usage:");
}

#[test]
fn hivectl_version_reports_a_version() {
    cli().arg("--version").passes().stdout_has("hivectl");
}

#[test]
fn hivectl_join_help_lists_required_fields() {
    cli()
        .args(["join", "--help"])
        .passes()
        .stdout_has("--region")
        .stdout_has("--az")
        .stdout_has("--data-dir")
        .stdout_has("--daemon-host");
}

#[test]
fn hivectl_shutdown_help_lists_every_phase() {
    cli()
        .args(["shutdown", "--help"])
        .passes()
        .stdout_has("gate")
        .stdout_has("drain")
        .stdout_has("storage")
        .stdout_has("persist")
        .stdout_has("infra");
}

#[test]
fn hivectl_health_against_an_unreachable_node_fails_with_context() {
    // A bare TcpStream::connect refusal, not a NATS client retry loop, so
    // this fails fast regardless of bus-reconnect settings.
    cli()
        .args(["--http", "127.0.0.1:1", "health"])
        .fails()
        .stderr_has("hivectl:")
        .stderr_has("connecting to 127.0.0.1:1");
}
