// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `ebs.<node>.mount` / `ebs.<node>.unmount` payloads (§6).
//!
//! The block-storage mount daemon is an external collaborator (§1); only
//! its wire contract is specified here.

use serde::{Deserialize, Serialize};

/// Request body shared by mount and unmount (§6:
/// `{Name, Boot, CloudInit, EFI, DeleteOnTermination, DeviceName, NBDURI}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountRequest {
    pub name: String,
    pub boot: bool,
    pub cloud_init: bool,
    pub efi: bool,
    pub delete_on_termination: bool,
    pub device_name: String,
    /// Set by the caller only for unmount (where the URI is already known);
    /// empty on the initial mount request.
    #[serde(default)]
    pub nbd_uri: String,
}

/// Mount reply: the transport URI the instance's block device binds to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountReply {
    pub nbd_uri: String,
    #[serde(default)]
    pub error: Option<String>,
}

impl MountReply {
    pub fn is_ok(&self) -> bool {
        self.error.is_none() && !self.nbd_uri.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_with_error_is_not_ok() {
        let reply = MountReply { nbd_uri: String::new(), error: Some("no such image".into()) };
        assert!(!reply.is_ok());
    }

    #[test]
    fn reply_with_uri_and_no_error_is_ok() {
        let reply = MountReply { nbd_uri: "nbd://localhost/vol".into(), error: None };
        assert!(reply.is_ok());
    }
}
