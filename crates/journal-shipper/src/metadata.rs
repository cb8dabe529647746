// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host identity facts from the EC2 instance identity document.
//!
//! The document is fetched at most once per process. A failed fetch degrades
//! to an empty set of facts: templates that do not reference `$` fields keep
//! working off-EC2.

use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

pub const DEFAULT_METADATA_ENDPOINT: &str = "http://169.254.169.254";
const TOKEN_PATH: &str = "/latest/api/token";
const DOCUMENT_PATH: &str = "/latest/dynamic/instance-identity/document";
const TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";
const TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";
const FETCH_TIMEOUT: Duration = Duration::from_secs(2);

static NO_FACTS: Facts = Facts(BTreeMap::new());

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("Metadata request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Metadata service returned status {0}")]
    Status(reqwest::StatusCode),

    #[error("Identity document is not a JSON object")]
    Malformed,
}

/// Identity facts, keyed without the `$` prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Facts(BTreeMap<String, String>);

impl Facts {
    /// Flattens an identity document: scalars become strings, nulls and
    /// nested values are dropped.
    pub fn from_document(document: &serde_json::Value) -> Option<Self> {
        let object = document.as_object()?;
        let facts = object
            .iter()
            .filter_map(|(key, value)| {
                let value = match value {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Number(n) => n.to_string(),
                    serde_json::Value::Bool(b) => b.to_string(),
                    _ => return None,
                };
                Some((key.clone(), value))
            })
            .collect();
        Some(Self(facts))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Facts {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    NotFetched,
    Fetched,
    Failed,
}

#[derive(Debug)]
enum Fetched {
    Facts(Facts),
    Failed,
}

/// Process-scoped accessor for the identity document.
#[derive(Debug)]
pub struct Metadata {
    endpoint: String,
    client: reqwest::Client,
    cell: OnceCell<Fetched>,
}

impl Metadata {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client: crate::http::get_client(FETCH_TIMEOUT, None),
            cell: OnceCell::new(),
        }
    }

    /// Facts that are already known; never fetched.
    pub fn with_facts(facts: Facts) -> Self {
        let metadata = Self::new(DEFAULT_METADATA_ENDPOINT);
        let _ = metadata.cell.set(Fetched::Facts(facts));
        metadata
    }

    pub fn state(&self) -> FetchState {
        match self.cell.get() {
            None => FetchState::NotFetched,
            Some(Fetched::Facts(_)) => FetchState::Fetched,
            Some(Fetched::Failed) => FetchState::Failed,
        }
    }

    /// The fetched facts, or the empty set if not fetched (yet) or failed.
    pub fn facts(&self) -> &Facts {
        match self.cell.get() {
            Some(Fetched::Facts(facts)) => facts,
            _ => &NO_FACTS,
        }
    }

    /// Fetches the document on first call; later calls return the same
    /// result.
    pub async fn get_or_fetch(&self) -> &Facts {
        let fetched = self
            .cell
            .get_or_init(|| async {
                match self.fetch().await {
                    Ok(facts) => {
                        debug!("METADATA | Fetched {} identity facts", facts.0.len());
                        Fetched::Facts(facts)
                    }
                    Err(e) => {
                        warn!("METADATA | Instance identity unavailable, continuing without it: {e}");
                        Fetched::Failed
                    }
                }
            })
            .await;
        match fetched {
            Fetched::Facts(facts) => facts,
            Fetched::Failed => &NO_FACTS,
        }
    }

    /// Performs one fetch, preferring an IMDSv2 session token and falling
    /// back to an unauthenticated request.
    pub async fn fetch(&self) -> Result<Facts, MetadataError> {
        let token = self.session_token().await;

        let mut request = self.client.get(format!("{}{DOCUMENT_PATH}", self.endpoint));
        if let Some(token) = &token {
            request = request.header(TOKEN_HEADER, token);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(MetadataError::Status(response.status()));
        }
        let document: serde_json::Value = response.json().await?;
        Facts::from_document(&document).ok_or(MetadataError::Malformed)
    }

    async fn session_token(&self) -> Option<String> {
        let response = self
            .client
            .put(format!("{}{TOKEN_PATH}", self.endpoint))
            .header(TOKEN_TTL_HEADER, "21600")
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            debug!("METADATA | No session token (status {}), using IMDSv1", response.status());
            return None;
        }
        response.text().await.ok()
    }
}
