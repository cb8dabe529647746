// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Uploads one batch to its destination, retrying per error class.
//!
//! The retry policy is a small state machine, [`RetryState`], so it can be
//! exercised without any I/O:
//!
//! | error                    | action                                    |
//! |--------------------------|-------------------------------------------|
//! | invalid sequence token   | refetch the token, retry once             |
//! | throttling, 5xx, network | exponential backoff with jitter, bounded  |
//! | destination missing      | recreate group and stream, bounded        |
//! | anything else            | give up                                   |
//!
//! `DataAlreadyAccepted` means an earlier attempt of the same batch landed,
//! so it counts as success.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::batcher::{Batch, BatchLimits};
use crate::cloudwatch::{ApiError, LogsApi};
use crate::destinations::DestinationCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Attempts allowed for transient errors, first attempt included.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_token_refreshes: u32,
    pub max_recreations: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_token_refreshes: 1,
            max_recreations: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Backoff(Duration),
    RefreshToken,
    Recreate,
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryState {
    config: RetryConfig,
    attempts: u32,
    token_refreshes: u32,
    recreations: u32,
    current_backoff: Duration,
}

impl RetryState {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            attempts: 0,
            token_refreshes: 0,
            recreations: 0,
            current_backoff: config.initial_backoff,
        }
    }

    /// Decides what to do after `error`.
    pub fn on_error(&mut self, error: &ApiError) -> RetryAction {
        match error {
            ApiError::InvalidSequenceToken { .. } => {
                if self.token_refreshes >= self.config.max_token_refreshes {
                    return RetryAction::GiveUp;
                }
                self.token_refreshes += 1;
                RetryAction::RefreshToken
            }
            ApiError::ResourceNotFound(_) => {
                if self.recreations >= self.config.max_recreations {
                    return RetryAction::GiveUp;
                }
                self.recreations += 1;
                RetryAction::Recreate
            }
            e if e.is_transient() => {
                self.attempts += 1;
                if self.attempts >= self.config.max_attempts {
                    return RetryAction::GiveUp;
                }
                RetryAction::Backoff(self.next_backoff())
            }
            _ => RetryAction::GiveUp,
        }
    }

    /// Current backoff plus or minus a quarter, then doubled for next time.
    fn next_backoff(&mut self) -> Duration {
        let backoff_ms = self.current_backoff.as_millis() as u64;
        let spread = (backoff_ms / 2).max(1);
        let jitter = rand::random::<u64>() % spread;
        let delay = Duration::from_millis(backoff_ms - spread / 2 + jitter);
        self.current_backoff = std::cmp::min(self.current_backoff * 2, self.config.max_backoff);
        delay
    }

    /// Transient failures so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadError {
    #[error("malformed batch for {destination}: {reason}")]
    Malformed { destination: String, reason: String },

    #[error("upload to {destination} failed: {source}")]
    Rejected {
        destination: String,
        #[source]
        source: ApiError,
    },
}

impl UploadError {
    /// True when the service was only unavailable, so the same batch may
    /// succeed if sent again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            UploadError::Rejected { source, .. } => source.is_transient(),
            UploadError::Malformed { .. } => false,
        }
    }
}

pub struct Uploader {
    api: Arc<dyn LogsApi>,
    cache: DestinationCache,
    limits: BatchLimits,
    retry: RetryConfig,
}

impl Uploader {
    pub fn new(api: Arc<dyn LogsApi>, limits: BatchLimits, retry: RetryConfig) -> Self {
        Self {
            cache: DestinationCache::new(api.clone()),
            api,
            limits,
            retry,
        }
    }

    pub fn cache(&self) -> &DestinationCache {
        &self.cache
    }

    fn check(&self, batch: &Batch) -> Result<(), String> {
        if batch.is_empty() {
            return Err("batch is empty".to_string());
        }
        if batch.len() > self.limits.max_count {
            return Err(format!("{} events exceed the limit of {}", batch.len(), self.limits.max_count));
        }
        if batch.bytes() > self.limits.max_bytes {
            return Err(format!("{} bytes exceed the limit of {}", batch.bytes(), self.limits.max_bytes));
        }
        if batch.events.windows(2).any(|w| w[1].timestamp < w[0].timestamp) {
            return Err("events are not in timestamp order".to_string());
        }
        Ok(())
    }

    /// Uploads `batch`, returning the destination's next sequence token.
    ///
    /// Callers must not upload two batches for the same destination at once.
    pub async fn upload(&self, batch: &Batch) -> Result<Option<String>, UploadError> {
        let destination = &batch.destination;
        self.check(batch).map_err(|reason| UploadError::Malformed {
            destination: destination.to_string(),
            reason,
        })?;

        let mut retry = RetryState::new(self.retry);
        loop {
            let result = match self.cache.ensure(destination).await {
                Ok(token) => {
                    self.api
                        .put_log_events(
                            &destination.group,
                            &destination.stream,
                            token.as_deref(),
                            &batch.events,
                        )
                        .await
                }
                Err(e) => Err(e),
            };

            let error = match result {
                Ok(next) => {
                    debug!("UPLOADER | Sent {} events to {destination}", batch.len());
                    self.cache.update(destination, next.clone());
                    return Ok(next);
                }
                Err(ApiError::DataAlreadyAccepted { expected }) => {
                    info!("UPLOADER | Batch for {destination} was already accepted");
                    self.cache.update(destination, expected.clone());
                    return Ok(expected);
                }
                Err(e) => e,
            };

            match retry.on_error(&error) {
                RetryAction::Backoff(delay) => {
                    warn!(
                        attempt = retry.attempts(),
                        "UPLOADER | {destination}: {error}, retrying in {} ms",
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryAction::RefreshToken => {
                    debug!("UPLOADER | {destination}: {error}, refreshing sequence token");
                    self.cache.invalidate(destination);
                }
                RetryAction::Recreate => {
                    info!("UPLOADER | {destination}: {error}, recreating");
                    self.cache.forget(destination);
                }
                RetryAction::GiveUp => {
                    return Err(UploadError::Rejected {
                        destination: destination.to_string(),
                        source: error,
                    });
                }
            }
        }
    }
}
