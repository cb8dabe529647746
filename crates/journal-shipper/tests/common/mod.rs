// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use journal_shipper::cloudwatch::{ApiError, LogEvent, LogsApi};
use journal_shipper::journal::{JournalSource, Message, SourceError};

/// Builds a journal entry timestamped `offset_ms` after `base_us`.
pub fn entry(cursor: &str, base_us: u64, offset_ms: u64, fields: &[(&str, &str)]) -> Message {
    let fields: BTreeMap<String, String> = fields
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Message::new(fields, cursor, base_us + offset_ms * 1000)
}

pub fn now_us() -> u64 {
    chrono::Utc::now().timestamp_micros() as u64
}

/// An in-memory journal that behaves like `journalctl --follow`: entries
/// appended through a [`JournalHandle`] are read in order.
pub struct FakeSource {
    journal: Arc<Mutex<Vec<Message>>>,
    position: usize,
}

#[derive(Clone, Default)]
pub struct JournalHandle {
    journal: Arc<Mutex<Vec<Message>>>,
}

impl JournalHandle {
    pub fn new(entries: Vec<Message>) -> Self {
        Self {
            journal: Arc::new(Mutex::new(entries)),
        }
    }

    pub fn append(&self, message: Message) {
        self.journal.lock().unwrap().push(message);
    }

    /// A reader positioned after `cursor`, or at the start.
    pub fn source_after(&self, cursor: Option<&str>) -> FakeSource {
        let journal = self.journal.lock().unwrap();
        let position = cursor
            .and_then(|cursor| journal.iter().position(|m| m.cursor == cursor))
            .map_or(0, |index| index + 1);
        FakeSource {
            journal: Arc::clone(&self.journal),
            position,
        }
    }
}

#[async_trait]
impl JournalSource for FakeSource {
    async fn next_entry(&mut self, wait: Duration) -> Result<Option<Message>, SourceError> {
        let next = self.journal.lock().unwrap().get(self.position).cloned();
        match next {
            Some(message) => {
                self.position += 1;
                Ok(Some(message))
            }
            None => {
                tokio::time::sleep(wait).await;
                Ok(None)
            }
        }
    }
}

#[derive(Debug, Default)]
struct Stream {
    appends: u64,
    events: Vec<LogEvent>,
}

impl Stream {
    fn token(&self) -> Option<String> {
        (self.appends > 0).then(|| format!("token-{}", self.appends))
    }
}

#[derive(Debug, Default)]
struct State {
    groups: HashSet<String>,
    streams: HashMap<(String, String), Stream>,
    rejected_streams: HashSet<String>,
    stalled_streams: HashSet<String>,
    invalid_token_errors: usize,
}

/// CloudWatch Logs in memory, including sequence token checks.
#[derive(Debug, Default)]
pub struct InMemoryLogs {
    state: Mutex<State>,
}

impl InMemoryLogs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Appends to `stream` fail with a non-retryable error.
    pub fn reject_stream(&self, stream: &str) {
        self.state
            .lock()
            .unwrap()
            .rejected_streams
            .insert(stream.to_string());
    }

    /// Appends to `stream` never complete.
    pub fn stall_stream(&self, stream: &str) {
        self.state
            .lock()
            .unwrap()
            .stalled_streams
            .insert(stream.to_string());
    }

    pub fn heal(&self) {
        let mut state = self.state.lock().unwrap();
        state.rejected_streams.clear();
        state.stalled_streams.clear();
    }

    /// Appends on behalf of another writer, moving the stream's token on.
    pub fn external_append(&self, group: &str, stream: &str, message: &str) {
        let mut state = self.state.lock().unwrap();
        let stream = state
            .streams
            .entry((group.to_string(), stream.to_string()))
            .or_default();
        stream.appends += 1;
        stream.events.push(LogEvent {
            timestamp: 0,
            message: message.to_string(),
        });
    }

    pub fn streams(&self) -> Vec<(String, String)> {
        let mut streams: Vec<_> = self.state.lock().unwrap().streams.keys().cloned().collect();
        streams.sort();
        streams
    }

    /// The `MESSAGE` field of every event in the stream, in append order.
    pub fn messages(&self, group: &str, stream: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let Some(stream) = state.streams.get(&(group.to_string(), stream.to_string())) else {
            return Vec::new();
        };
        stream
            .events
            .iter()
            .map(|event| {
                serde_json::from_str::<serde_json::Value>(&event.message)
                    .ok()
                    .and_then(|v| v.get("MESSAGE").and_then(|m| m.as_str()).map(str::to_string))
                    .unwrap_or_else(|| event.message.clone())
            })
            .collect()
    }

    pub fn appends(&self, group: &str, stream: &str) -> u64 {
        let state = self.state.lock().unwrap();
        state
            .streams
            .get(&(group.to_string(), stream.to_string()))
            .map_or(0, |s| s.appends)
    }

    pub fn invalid_token_errors(&self) -> usize {
        self.state.lock().unwrap().invalid_token_errors
    }
}

#[async_trait]
impl LogsApi for InMemoryLogs {
    async fn create_log_group(&self, group: &str) -> Result<(), ApiError> {
        if self.state.lock().unwrap().groups.insert(group.to_string()) {
            Ok(())
        } else {
            Err(ApiError::AlreadyExists)
        }
    }

    async fn create_log_stream(&self, group: &str, stream: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        if !state.groups.contains(group) {
            return Err(ApiError::ResourceNotFound(format!("log group {group}")));
        }
        let key = (group.to_string(), stream.to_string());
        if state.streams.contains_key(&key) {
            return Err(ApiError::AlreadyExists);
        }
        state.streams.insert(key, Stream::default());
        Ok(())
    }

    async fn describe_sequence_token(&self, group: &str, stream: &str) -> Result<Option<String>, ApiError> {
        let state = self.state.lock().unwrap();
        state
            .streams
            .get(&(group.to_string(), stream.to_string()))
            .map(Stream::token)
            .ok_or_else(|| ApiError::ResourceNotFound(format!("log stream {stream}")))
    }

    async fn put_log_events(
        &self,
        group: &str,
        stream: &str,
        token: Option<&str>,
        events: &[LogEvent],
    ) -> Result<Option<String>, ApiError> {
        let stalled = self.state.lock().unwrap().stalled_streams.contains(stream);
        if stalled {
            std::future::pending::<()>().await;
        }

        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        if state.rejected_streams.contains(stream) {
            return Err(ApiError::InvalidParameter(format!("{stream} is rejected")));
        }
        let Some(target) = state.streams.get_mut(&(group.to_string(), stream.to_string())) else {
            return Err(ApiError::ResourceNotFound(format!("log stream {stream}")));
        };
        let expected = target.token();
        if token.map(str::to_string) != expected {
            state.invalid_token_errors += 1;
            return Err(ApiError::InvalidSequenceToken { expected });
        }
        target.appends += 1;
        target.events.extend_from_slice(events);
        Ok(target.token())
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
