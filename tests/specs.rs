// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Entry point for the workspace integration specs (`cargo test --test
//! specs`). `support` holds the shared `hivectl`-invocation helpers every
//! spec module imports as `crate::prelude::*`.

#[path = "support/mod.rs"]
mod prelude;

#[path = "specs/cli/help.rs"]
mod cli_help;

#[path = "specs/daemon/http_surface.rs"]
mod daemon_http_surface;
