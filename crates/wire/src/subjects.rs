// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Subject-name builders (§6 table, §4.6 "A single subscription table").
//!
//! Kept as plain functions rather than an enum: the bus router dispatches on
//! the literal subject string it receives from the bus client, and several
//! subjects are templated on a node name or instance ID that isn't known
//! until runtime (§4.1, §4.6).

/// Worker-queue subject for admitting `RunInstances` calls for one type
/// (§4.1, §4.6). Not in the static subscription table — the Resource
/// Registry subscribes/unsubscribes it as capacity changes.
pub fn run_instances(instance_type: &str) -> String {
    format!("ec2.RunInstances.{instance_type}")
}

/// Per-instance command subject (§3 invariant 5, §4.6). A plain
/// (non-queued) subscription — addressed to the unique owner.
pub fn instance_command(instance_id: &str) -> String {
    format!("ec2.cmd.{instance_id}")
}

/// Per-instance console-output subject (§4.5 step 5).
pub fn console_output(instance_id: &str) -> String {
    format!("ec2.{instance_id}.GetConsoleOutput")
}

pub fn ebs_mount(node: &str) -> String {
    format!("ebs.{node}.mount")
}

pub fn ebs_unmount(node: &str) -> String {
    format!("ebs.{node}.unmount")
}

pub const EBS_DELETE: &str = "ebs.delete";
pub const EBS_SYNC: &str = "ebs.sync";

pub const EC2_START: &str = "ec2.start";
pub const EC2_TERMINATE: &str = "ec2.terminate";
pub const EC2_DESCRIBE_INSTANCES: &str = "ec2.DescribeInstances";
pub const EC2_DESCRIBE_INSTANCE_TYPES: &str = "ec2.DescribeInstanceTypes";

pub fn hive_admin_health(node: &str) -> String {
    format!("hive.admin.{node}.health")
}

pub const HIVE_NODES_DISCOVER: &str = "hive.nodes.discover";
pub const HIVE_NODE_STATUS: &str = "hive.node.status";
pub const HIVE_NODE_VMS: &str = "hive.node.vms";

/// A cluster-shutdown phase (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Gate,
    Drain,
    Storage,
    Persist,
    Infra,
}

impl ShutdownPhase {
    pub const ALL: [ShutdownPhase; 5] = [
        ShutdownPhase::Gate,
        ShutdownPhase::Drain,
        ShutdownPhase::Storage,
        ShutdownPhase::Persist,
        ShutdownPhase::Infra,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ShutdownPhase::Gate => "gate",
            ShutdownPhase::Drain => "drain",
            ShutdownPhase::Storage => "storage",
            ShutdownPhase::Persist => "persist",
            ShutdownPhase::Infra => "infra",
        }
    }

    pub fn subject(self) -> String {
        format!("hive.cluster.shutdown.{}", self.as_str())
    }
}

/// A delegated worker-queue subject for a backend service operation the
/// lifecycle engine consumes but does not implement (§1 out-of-scope
/// collaborators: volume/snapshot/tag/image/keypair/VPC backends).
pub fn delegated(verb: &str, noun: &str) -> String {
    format!("ec2.{verb}{noun}")
}

/// A named bus subject — owned strings for the ones built at runtime, a
/// thin wrapper so `hive-daemon`'s subscription table can key on one type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subject(pub String);

impl Subject {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Subject {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Subject {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
