// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Routing templates.
//!
//! A template is ordinary text with `{...}` field groups, in the spirit of
//! Python's `str.format`, extended with fallback chains:
//!
//! ```text
//! {$docker_container|$unit|SYSLOG_IDENTIFIER|"other"}
//! ```
//!
//! Candidates are tried left to right; the first field present in the
//! context wins, and a quoted literal always resolves to itself. A group may
//! end with a `!s`/`!r` conversion and a `:spec` format spec, applied to the
//! winning value. `{{` and `}}` are literal braces.
//!
//! Templates are parsed once at startup; [`Template::render`] is pure.
//!
//! ```
//! use journal_shipper::format::Template;
//! use std::collections::HashMap;
//!
//! let template = Template::parse(r#"{a|b|"x"}"#).unwrap();
//! let context = HashMap::from([("b".to_string(), "v".to_string())]);
//! assert_eq!(template.render(&context).unwrap(), "v");
//! ```

mod parse;
mod spec;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::BuildHasher;
use std::str::FromStr;

pub use spec::FormatSpec;

/// Something a template can be evaluated against.
pub trait Lookup {
    /// Returns the value of `name`, or `None` when it is absent (absent and
    /// null are the same observable state).
    fn lookup(&self, name: &str) -> Option<&str>;
}

impl<S: BuildHasher> Lookup for HashMap<String, String, S> {
    fn lookup(&self, name: &str) -> Option<&str> {
        self.get(name).map(String::as_str)
    }
}

impl Lookup for BTreeMap<String, String> {
    fn lookup(&self, name: &str) -> Option<&str> {
        self.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("single '}}' encountered at offset {position}")]
    UnmatchedClosingBrace { position: usize },

    #[error("unclosed '{{' opened at offset {position}")]
    UnclosedField { position: usize },

    #[error("nested '{{' at offset {position}")]
    NestedField { position: usize },

    #[error("unterminated quoted literal at offset {position}")]
    UnterminatedLiteral { position: usize },

    #[error("quoted literal at offset {position} contains the '|' delimiter")]
    DelimiterInLiteral { position: usize },

    #[error("invalid field name {name:?} at offset {position}")]
    InvalidFieldName { name: String, position: usize },

    #[error("unexpected character {found:?} at offset {position}")]
    UnexpectedCharacter { found: char, position: usize },

    #[error("unknown conversion {found:?} at offset {position}")]
    InvalidConversion { found: char, position: usize },

    #[error("invalid format spec {spec:?}: {reason}")]
    InvalidFormatSpec { spec: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("no candidate of {{{group}}} resolved")]
    Unresolved { group: String },

    #[error("value {value:?} of {{{group}}} cannot be formatted: {reason}")]
    InvalidValue {
        group: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate {
    Field(String),
    Literal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    Str,
    Repr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldGroup {
    source: String,
    candidates: Vec<Candidate>,
    conversion: Option<Conversion>,
    spec: Option<FormatSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Literal(String),
    Field(FieldGroup),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    nodes: Vec<Node>,
}

impl Candidate {
    fn resolve<'a, L: Lookup + ?Sized>(&'a self, context: &'a L) -> Option<&'a str> {
        match self {
            Candidate::Literal(text) => Some(text),
            Candidate::Field(name) if name.is_empty() || name.bytes().all(|b| b.is_ascii_digit()) => {
                None
            }
            Candidate::Field(name) => context.lookup(name),
        }
    }
}

impl FieldGroup {
    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    fn render<L: Lookup + ?Sized>(&self, context: &L, out: &mut String) -> Result<(), RenderError> {
        let value = self
            .candidates
            .iter()
            .find_map(|candidate| candidate.resolve(context))
            .ok_or_else(|| RenderError::Unresolved {
                group: self.source.clone(),
            })?;

        let converted;
        let value = match self.conversion {
            Some(Conversion::Repr) => {
                converted = repr(value);
                converted.as_str()
            }
            Some(Conversion::Str) | None => value,
        };

        match &self.spec {
            Some(spec) => {
                let formatted = spec.apply(value).map_err(|reason| RenderError::InvalidValue {
                    group: self.source.clone(),
                    value: value.to_string(),
                    reason,
                })?;
                out.push_str(&formatted);
            }
            None => out.push_str(value),
        }
        Ok(())
    }
}

impl Template {
    /// Parses a template. Parsing is total: either the whole string is a
    /// valid template or an error is returned.
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        parse::parse(input)
    }

    /// Evaluates the template against `context`.
    ///
    /// Fails if any field group has no resolvable candidate; there is no
    /// implicit empty default.
    pub fn render<L: Lookup + ?Sized>(&self, context: &L) -> Result<String, RenderError> {
        let mut out = String::with_capacity(self.source.len());
        for node in &self.nodes {
            match node {
                Node::Literal(text) => out.push_str(text),
                Node::Field(group) => group.render(context, &mut out)?,
            }
        }
        Ok(out)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl FromStr for Template {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Template::parse(s)
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Quotes a value the way Python's `repr` quotes a `str`.
fn repr(value: &str) -> String {
    let quote = if value.contains('\'') && !value.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(value.len() + 2);
    out.push(quote);
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_control() => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}
