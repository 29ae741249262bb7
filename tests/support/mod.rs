// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared `hivectl`-invocation helpers for the specs under `tests/specs/`.

use assert_cmd::assert::Assert;
use assert_cmd::Command;

/// A fresh `hivectl` invocation, reset to the binary's defaults.
pub fn cli() -> Command {
    Command::cargo_bin("hivectl").expect("hivectl binary is built for the test run")
}

/// Chainable assertions over a finished run's stdout/stderr.
pub struct Outcome(Assert);

impl Outcome {
    pub fn stdout_has(self, needle: &str) -> Self {
        let output = self.0.get_output().stdout.clone();
        let stdout = String::from_utf8_lossy(&output);
        assert!(stdout.contains(needle), "stdout did not contain {needle:?}:\n{stdout}");
        self
    }

    pub fn stderr_has(self, needle: &str) -> Self {
        let output = self.0.get_output().stderr.clone();
        let stderr = String::from_utf8_lossy(&output);
        assert!(stderr.contains(needle), "stderr did not contain {needle:?}:\n{stderr}");
        self
    }
}

pub trait CommandExt {
    fn passes(&mut self) -> Outcome;
    fn fails(&mut self) -> Outcome;
}

impl CommandExt for Command {
    fn passes(&mut self) -> Outcome {
        Outcome(self.assert().success())
    }

    fn fails(&mut self) -> Outcome {
        Outcome(self.assert().failure())
    }
}
