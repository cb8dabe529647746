// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use crate::error::ShipperError;
use crate::fields::build_context;
use crate::format::{RenderError, Template};
use crate::journal::Message;
use crate::metadata::Facts;

/// A resolved (log group, log stream) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Destination {
    pub group: String,
    pub stream: String,
}

impl Destination {
    pub fn new(group: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            stream: stream.into(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.stream)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("log {which} template: {source}")]
    Render {
        which: &'static str,
        #[source]
        source: RenderError,
    },

    #[error("log {which} template rendered an empty name")]
    EmptyName { which: &'static str },
}

/// Computes destinations from the two routing templates.
#[derive(Debug, Clone)]
pub struct Router {
    group: Template,
    stream: Template,
    facts: Facts,
}

impl Router {
    pub fn new(group: &str, stream: &str, facts: Facts) -> Result<Self, ShipperError> {
        let group = Template::parse(group).map_err(|source| ShipperError::Template {
            which: "log group",
            source,
        })?;
        let stream = Template::parse(stream).map_err(|source| ShipperError::Template {
            which: "log stream",
            source,
        })?;
        Ok(Self { group, stream, facts })
    }

    pub fn route(&self, message: &Message) -> Result<Destination, RouteError> {
        let context = build_context(message, &self.facts);
        let render = |template: &Template, which: &'static str| -> Result<String, RouteError> {
            let name = template
                .render(&context)
                .map_err(|source| RouteError::Render { which, source })?;
            if name.is_empty() {
                return Err(RouteError::EmptyName { which });
            }
            Ok(name)
        };
        Ok(Destination {
            group: render(&self.group, "group")?,
            stream: render(&self.stream, "stream")?,
        })
    }
}
