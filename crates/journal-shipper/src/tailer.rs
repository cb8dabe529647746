// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The driver loop: read, route, batch, upload, persist the cursor.
//!
//! Reading is sequential. Uploads run as tasks in a [`JoinSet`], at most one
//! per destination and at most `max_concurrent_uploads` overall. Only the
//! loop touches the batcher and the cursor tracker, so the cursor file has a
//! single writer.
//!
//! A batch that still fails transiently after the uploader's retries goes
//! back to the head of its queue, and its destination sits out until the
//! next flush tick. Any other failure leaves the batch's entries pending for
//! good, so the cursor stays behind them until a restart sends them again.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinError, JoinSet};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batcher::{Batch, BatchLimits, Batcher, DEFAULT_MAX_QUEUE_DEPTH};
use crate::cloudwatch::LogEvent;
use crate::config::ShipperConfig;
use crate::cursor::{CursorFile, CursorTracker};
use crate::error::ShipperError;
use crate::journal::{JournalSource, Message};
use crate::routing::{Destination, Router};
use crate::uploader::{UploadError, Uploader};

/// Pause after a source error that is not a gap.
const SOURCE_ERROR_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct TailerConfig {
    pub flush_interval: Duration,
    pub shutdown_timeout: Duration,
    /// Longest a single read waits for a new entry.
    pub read_wait: Duration,
    pub max_concurrent_uploads: usize,
    pub max_queue_depth: usize,
    pub limits: BatchLimits,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(10),
            read_wait: Duration::from_secs(1),
            max_concurrent_uploads: 4,
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
            limits: BatchLimits::default(),
        }
    }
}

impl From<&ShipperConfig> for TailerConfig {
    fn from(config: &ShipperConfig) -> Self {
        Self {
            flush_interval: config.flush_interval,
            shutdown_timeout: config.shutdown_timeout,
            max_concurrent_uploads: config.max_concurrent_uploads,
            max_queue_depth: config.max_queue_depth,
            limits: config.batch_limits(),
            ..Default::default()
        }
    }
}

struct UploadOutcome {
    batch: Batch,
    result: Result<Option<String>, UploadError>,
}

pub struct Tailer<S> {
    source: S,
    router: Router,
    uploader: Arc<Uploader>,
    cursor_file: CursorFile,
    config: TailerConfig,
    batcher: Batcher,
    tracker: CursorTracker,
    persisted: Option<String>,
    uploads: JoinSet<UploadOutcome>,
    in_flight: HashMap<Destination, AbortHandle>,
    /// Destinations waiting for the next flush tick after a transient failure.
    cooling: HashSet<Destination>,
}

impl<S: JournalSource> Tailer<S> {
    /// `initial_cursor` is the cursor the source was positioned after.
    pub fn new(
        source: S,
        router: Router,
        uploader: Uploader,
        cursor_file: CursorFile,
        initial_cursor: Option<String>,
        config: TailerConfig,
    ) -> Self {
        Self {
            source,
            router,
            uploader: Arc::new(uploader),
            cursor_file,
            batcher: Batcher::new(config.limits, config.max_queue_depth),
            tracker: CursorTracker::new(initial_cursor.clone()),
            persisted: initial_cursor,
            config,
            uploads: JoinSet::new(),
            in_flight: HashMap::new(),
            cooling: HashSet::new(),
        }
    }

    /// Runs until `cancel` fires, then flushes what it can within the
    /// shutdown timeout.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), ShipperError> {
        let mut flush_interval = interval(self.config.flush_interval);
        flush_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        flush_interval.tick().await; // discard first tick, which is instantaneous

        info!("TAILER | Started, resuming after {:?}", self.persisted);
        loop {
            let reading = !self.batcher.is_saturated();
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                Some(joined) = self.uploads.join_next() => {
                    self.on_upload_done(joined);
                    self.dispatch(false);
                }
                _ = flush_interval.tick() => {
                    debug!("TAILER | Flushing {} buffered events", self.batcher.len());
                    self.cooling.clear();
                    self.dispatch(true);
                    self.persist();
                }
                entry = self.source.next_entry(self.config.read_wait), if reading => {
                    match entry {
                        Ok(Some(message)) => self.on_entry(message),
                        Ok(None) => {}
                        Err(e) if e.is_gap() => warn!("TAILER | Skipping unreadable journal data: {e}"),
                        Err(e) => {
                            error!("TAILER | Journal read failed: {e}");
                            tokio::time::sleep(SOURCE_ERROR_DELAY).await;
                        }
                    }
                    let saturated = self.batcher.is_saturated();
                    if saturated {
                        debug!("TAILER | Queue full, pausing reads until uploads catch up");
                    }
                    self.dispatch(saturated);
                }
            }
        }

        self.shutdown().await
    }

    fn on_entry(&mut self, message: Message) {
        let event = match LogEvent::from_message(&message) {
            Ok(event) => event,
            Err(e) => {
                warn!("TAILER | Cannot encode entry {}: {e}", message.cursor);
                self.tracker.skip(&message.cursor);
                return;
            }
        };

        let now_ms = chrono::Utc::now().timestamp_millis();
        if !event.within_retention(now_ms) {
            debug!("TAILER | Skipping entry {} older than the retention window", message.cursor);
            self.tracker.skip(&message.cursor);
            return;
        }

        let destination = match self.router.route(&message) {
            Ok(destination) => destination,
            Err(e) => {
                warn!("TAILER | Dropping unroutable entry {}: {e}", message.cursor);
                self.tracker.skip(&message.cursor);
                return;
            }
        };

        let seq = self.tracker.record(&destination, &message.cursor);
        if let Err(e) = self.batcher.offer(&destination, seq, event) {
            warn!("TAILER | Dropping entry {} for {destination}: {e}", message.cursor);
            self.tracker.confirm(&destination, [seq]);
        }
    }

    /// Starts uploads for ready batches whose destination is idle and not
    /// cooling down.
    fn dispatch(&mut self, force: bool) {
        let capacity = self
            .config
            .max_concurrent_uploads
            .saturating_sub(self.uploads.len());
        let busy: HashSet<Destination> = self
            .in_flight
            .keys()
            .chain(&self.cooling)
            .cloned()
            .collect();

        for batch in self.batcher.take_ready(force, &busy, capacity) {
            let uploader = Arc::clone(&self.uploader);
            let destination = batch.destination.clone();
            debug!(
                group = %destination.group,
                stream = %destination.stream,
                "TAILER | Uploading {} events",
                batch.len()
            );
            let handle = self.uploads.spawn(async move {
                let result = uploader.upload(&batch).await;
                UploadOutcome { batch, result }
            });
            self.in_flight.insert(destination, handle);
        }
    }

    fn on_upload_done(&mut self, joined: Result<UploadOutcome, JoinError>) {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("TAILER | Upload task failed: {e}");
                self.in_flight.retain(|_, handle| !handle.is_finished());
                return;
            }
        };
        let UploadOutcome { batch, result } = outcome;
        self.in_flight.remove(&batch.destination);

        match result {
            Ok(_) => {
                self.tracker.confirm(&batch.destination, batch.seqs);
                self.persist();
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    group = %batch.destination.group,
                    stream = %batch.destination.stream,
                    events = batch.len(),
                    "TAILER | Upload failed, retrying on the next flush: {e}"
                );
                self.cooling.insert(batch.destination.clone());
                self.batcher.requeue(batch);
            }
            Err(e) => {
                // The entries stay pending, which holds the cursor back.
                error!(
                    group = %batch.destination.group,
                    stream = %batch.destination.stream,
                    events = batch.len(),
                    "TAILER | Upload failed, cursor will not advance past these events: {e}"
                );
            }
        }
    }

    /// Writes the safe cursor if it moved.
    fn persist(&mut self) {
        let Some(cursor) = self.tracker.safe_cursor() else {
            return;
        };
        if self.persisted.as_deref() == Some(cursor) {
            return;
        }
        match self.cursor_file.store(cursor) {
            Ok(()) => {
                debug!("TAILER | Persisted cursor {cursor}");
                self.persisted = Some(cursor.to_string());
            }
            Err(e) => error!("TAILER | {e}"),
        }
    }

    async fn shutdown(mut self) -> Result<(), ShipperError> {
        info!(
            "TAILER | Shutting down, flushing {} buffered events",
            self.batcher.len()
        );
        let deadline = Instant::now() + self.config.shutdown_timeout;
        let drained = tokio::time::timeout_at(deadline, self.drain()).await;

        self.uploads.abort_all();
        self.persist();

        if drained.is_err() {
            warn!(
                "TAILER | Shutdown timeout exceeded, {} events unconfirmed",
                self.tracker.pending_count()
            );
            return Err(ShipperError::ShutdownTimeout);
        }
        info!("TAILER | Shutdown complete");
        Ok(())
    }

    async fn drain(&mut self) {
        loop {
            self.cooling.clear();
            self.dispatch(true);
            match self.uploads.join_next().await {
                Some(joined) => self.on_upload_done(joined),
                None => break,
            }
        }
    }
}
