// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `hivectl describe-instances` — `ec2.DescribeInstances` over the bus (§6).
//! Asks whichever node in the queue group picks up the request; describing
//! a specific node's fleet is out of scope for this surface (§6: the
//! subject has no node-scoping parameter).

use anyhow::Result;
use hive_wire::InstanceDescriptor;

use crate::client::bus_request;
use crate::output::{handle_list, OutputFormat};

pub async fn run(bus: &str, format: OutputFormat) -> Result<()> {
    let body = bus_request(bus, hive_wire::subjects::EC2_DESCRIBE_INSTANCES, Vec::new()).await?;
    let instances: Vec<InstanceDescriptor> = serde_json::from_slice(&body)?;

    handle_list(format, &instances, "No instances found.", |items| {
        println!("{:<24} {:<12} {:<6} {}", "INSTANCE", "TYPE", "CODE", "STATE");
        for i in items {
            println!("{:<24} {:<12} {:<6} {}", i.instance_id, i.instance_type, i.state_code, i.state_name);
        }
    })
}
