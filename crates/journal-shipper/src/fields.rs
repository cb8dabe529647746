// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Builds the context routing templates are evaluated against.
//!
//! Raw journal field names never start with `$`, so synthetic fields and
//! identity facts live in their own `$` namespace and cannot shadow them.

use std::collections::HashMap;

use crate::journal::Message;
use crate::metadata::Facts;

/// Unit that manages containers; its entries carry `CONTAINER_NAME`.
pub const CONTAINER_RUNTIME_UNIT: &str = "docker.service";

pub type Context = HashMap<String, String>;

/// `USER_UNIT`, else `_SYSTEMD_UNIT`, without the template instance:
/// `sshd@1234.service` becomes `sshd.service`.
pub fn unit(message: &Message) -> Option<String> {
    let unit = message.get("USER_UNIT").or_else(|| message.get("_SYSTEMD_UNIT"))?;
    Some(match unit.split_once('@') {
        Some((name, instance)) => match instance.rsplit_once('.') {
            Some((_, suffix)) => format!("{name}.{suffix}"),
            None => name.to_string(),
        },
        None => unit.to_string(),
    })
}

pub fn docker_container(message: &Message) -> Option<String> {
    if message.get("_SYSTEMD_UNIT") != Some(CONTAINER_RUNTIME_UNIT) {
        return None;
    }
    message
        .get("CONTAINER_NAME")
        .map(|name| format!("{name}.container"))
}

/// Raw fields, then synthetic `$unit`/`$docker_container`, then identity
/// facts as `$<key>`.
pub fn build_context(message: &Message, facts: &Facts) -> Context {
    let mut context: Context = message
        .fields
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    if let Some(unit) = unit(message) {
        context.insert("$unit".to_string(), unit);
    }
    if let Some(container) = docker_container(message) {
        context.insert("$docker_container".to_string(), container);
    }
    for (key, value) in facts.iter() {
        context.insert(format!("${key}"), value.to_string());
    }
    context
}
