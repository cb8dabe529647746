// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The ingestion side: CloudWatch Logs operations, their classified errors
//! and the log event wire type.

mod client;
pub mod sigv4;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::journal::Message;

pub use client::CloudwatchClient;

/// Bytes CloudWatch adds to every event when computing request size.
pub const EVENT_OVERHEAD_BYTES: usize = 26;
pub const MAX_BATCH_COUNT: usize = 10_000;
pub const MAX_BATCH_BYTES: usize = 1_048_576;
/// Events older than this are rejected by the API.
pub const RETENTION: Duration = Duration::from_secs(14 * 24 * 60 * 60);
/// A request may not span 24 hours; cut batches well before that.
pub const MAX_BATCH_SPAN: Duration = Duration::from_secs(23 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("resource already exists")]
    AlreadyExists,

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("invalid sequence token (expected {expected:?})")]
    InvalidSequenceToken { expected: Option<String> },

    #[error("batch already accepted (next token {expected:?})")]
    DataAlreadyAccepted { expected: Option<String> },

    #[error("throttled: {0}")]
    Throttling(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected response ({status} {code}): {message}")]
    Unexpected {
        status: u16,
        code: String,
        message: String,
    },
}

impl ApiError {
    /// Errors that go away by waiting.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ApiError::Throttling(_) | ApiError::ServiceUnavailable(_) | ApiError::Transport(_)
        )
    }
}

/// One log event as sent in `PutLogEvents`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEvent {
    pub timestamp: i64,
    pub message: String,
}

impl LogEvent {
    /// Encodes the entry's string fields as a JSON object.
    pub fn from_message(message: &Message) -> Result<Self, serde_json::Error> {
        Ok(Self {
            timestamp: message.timestamp_ms(),
            message: serde_json::to_string(&message.fields)?,
        })
    }

    /// Size counted against the request limit.
    pub fn size(&self) -> usize {
        self.message.len() + EVENT_OVERHEAD_BYTES
    }

    pub fn within_retention(&self, now_ms: i64) -> bool {
        now_ms.saturating_sub(self.timestamp) < RETENTION.as_millis() as i64
    }
}

/// Partial rejection reported by a successful `PutLogEvents`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedLogEventsInfo {
    pub too_new_log_event_start_index: Option<i64>,
    pub too_old_log_event_end_index: Option<i64>,
    pub expired_log_event_end_index: Option<i64>,
}

/// The CloudWatch Logs operations the shipper needs.
#[async_trait]
pub trait LogsApi: Send + Sync {
    /// Fails with [`ApiError::AlreadyExists`] if the group exists.
    async fn create_log_group(&self, group: &str) -> Result<(), ApiError>;

    /// Fails with [`ApiError::AlreadyExists`] if the stream exists.
    async fn create_log_stream(&self, group: &str, stream: &str) -> Result<(), ApiError>;

    /// The stream's upload sequence token; `None` for a stream that has never
    /// been written to. Fails with [`ApiError::ResourceNotFound`] if there is
    /// no such stream.
    async fn describe_sequence_token(&self, group: &str, stream: &str) -> Result<Option<String>, ApiError>;

    /// Appends `events`, returning the next sequence token.
    async fn put_log_events(
        &self,
        group: &str,
        stream: &str,
        token: Option<&str>,
        events: &[LogEvent],
    ) -> Result<Option<String>, ApiError>;
}
