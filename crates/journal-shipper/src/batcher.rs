// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-destination batching of log events.
//!
//! Every destination has one open batch that events are appended to, and a
//! FIFO of sealed batches waiting for upload. A batch is sealed when the next
//! event would break one of the `PutLogEvents` constraints:
//!
//! 1. **Count**: at most `max_count` events
//! 2. **Size**: at most `max_bytes`, counting [`EVENT_OVERHEAD_BYTES`] per event
//! 3. **Span**: the first and last event at most `max_span` apart
//! 4. **Order**: timestamps never decrease inside a batch
//!
//! An event whose timestamp goes backwards is still accepted: it starts a new
//! batch and a warning is logged. The comparison is against the last event
//! offered for the destination, even if its batch has already left.
//!
//! Sealed batches leave the batcher through [`Batcher::drain_ready`] or
//! [`Batcher::take_ready`]; open batches only when the caller forces a flush.
//! A batch whose upload failed transiently goes back with [`Batcher::requeue`].
//!
//! [`EVENT_OVERHEAD_BYTES`]: crate::cloudwatch::EVENT_OVERHEAD_BYTES

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tracing::warn;

use crate::cloudwatch::{LogEvent, MAX_BATCH_BYTES, MAX_BATCH_COUNT, MAX_BATCH_SPAN};
use crate::cursor::Seq;
use crate::routing::Destination;

/// Default bound on the events held for a single destination.
pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 50_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_count: usize,
    pub max_bytes: usize,
    pub max_span: Duration,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_count: MAX_BATCH_COUNT,
            max_bytes: MAX_BATCH_BYTES,
            max_span: MAX_BATCH_SPAN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OfferError {
    #[error("event of {size} bytes exceeds the batch size limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },
}

/// Events for one destination, in upload order, with the sequence numbers
/// used to confirm them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub destination: Destination,
    pub events: Vec<LogEvent>,
    pub seqs: Vec<Seq>,
    bytes: usize,
}

impl Batch {
    fn new(destination: Destination) -> Self {
        Self {
            destination,
            events: Vec::new(),
            seqs: Vec::new(),
            bytes: 0,
        }
    }

    fn push(&mut self, seq: Seq, event: LogEvent) {
        self.bytes += event.size();
        self.events.push(event);
        self.seqs.push(seq);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Request size as CloudWatch counts it.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    fn first_timestamp(&self) -> Option<i64> {
        self.events.first().map(|e| e.timestamp)
    }

}

#[derive(Debug, Default)]
struct Queue {
    open: Option<Batch>,
    sealed: VecDeque<Batch>,
    depth: usize,
}

impl Queue {
    fn seal(&mut self) {
        if let Some(batch) = self.open.take() {
            if !batch.is_empty() {
                self.sealed.push_back(batch);
            }
        }
    }
}

#[derive(Debug)]
pub struct Batcher {
    limits: BatchLimits,
    max_queue_depth: usize,
    queues: HashMap<Destination, Queue>,
    /// Timestamp of the last event offered per destination. Outlives pruning.
    last_timestamps: HashMap<Destination, i64>,
}

impl Default for Batcher {
    fn default() -> Self {
        Self::new(BatchLimits::default(), DEFAULT_MAX_QUEUE_DEPTH)
    }
}

impl Batcher {
    pub fn new(limits: BatchLimits, max_queue_depth: usize) -> Self {
        Self {
            limits,
            max_queue_depth,
            queues: HashMap::new(),
            last_timestamps: HashMap::new(),
        }
    }

    /// Appends an event to its destination's open batch, sealing that batch
    /// first if the event does not fit.
    pub fn offer(&mut self, destination: &Destination, seq: Seq, event: LogEvent) -> Result<(), OfferError> {
        let size = event.size();
        if size > self.limits.max_bytes {
            return Err(OfferError::TooLarge {
                size,
                limit: self.limits.max_bytes,
            });
        }

        let limits = self.limits;
        let timestamp = event.timestamp;
        let previous = self.last_timestamps.insert(destination.clone(), timestamp);
        let out_of_order = match previous {
            Some(last) if timestamp < last => {
                warn!("BATCHER | Out-of-order event for {destination}: {timestamp} is before {last}");
                true
            }
            _ => false,
        };

        let queue = self.queues.entry(destination.clone()).or_default();
        let must_seal = match &queue.open {
            Some(open) => {
                let too_long = open.first_timestamp().is_some_and(|first| {
                    timestamp.saturating_sub(first) > limits.max_span.as_millis() as i64
                });
                let full = open.len() + 1 > limits.max_count || open.bytes() + size > limits.max_bytes;
                out_of_order || too_long || full
            }
            None => false,
        };
        if must_seal {
            queue.seal();
        }

        queue
            .open
            .get_or_insert_with(|| Batch::new(destination.clone()))
            .push(seq, event);
        queue.depth += 1;
        Ok(())
    }

    /// Puts a batch back at the head of its destination's queue, ahead of
    /// everything offered after it.
    pub fn requeue(&mut self, batch: Batch) {
        if batch.is_empty() {
            return;
        }
        let queue = self.queues.entry(batch.destination.clone()).or_default();
        queue.depth += batch.len();
        queue.sealed.push_front(batch);
    }

    /// Removes all ready batches. With `force`, open batches are sealed first.
    pub fn drain_ready(&mut self, force: bool) -> Vec<Batch> {
        let mut ready = Vec::new();
        for queue in self.queues.values_mut() {
            if force {
                queue.seal();
            }
            for batch in queue.sealed.drain(..) {
                queue.depth -= batch.len();
                ready.push(batch);
            }
        }
        self.prune();
        ready
    }

    /// Removes the oldest ready batch of up to `limit` destinations, leaving
    /// the destinations in `busy` untouched so their batches stay in order
    /// behind the upload in flight.
    pub fn take_ready(&mut self, force: bool, busy: &HashSet<Destination>, limit: usize) -> Vec<Batch> {
        let mut ready = Vec::new();
        for (destination, queue) in &mut self.queues {
            if force {
                queue.seal();
            }
            if ready.len() >= limit || busy.contains(destination) {
                continue;
            }
            if let Some(batch) = queue.sealed.pop_front() {
                queue.depth -= batch.len();
                ready.push(batch);
            }
        }
        self.prune();
        ready
    }

    fn prune(&mut self) {
        self.queues
            .retain(|_, queue| queue.open.is_some() || !queue.sealed.is_empty());
    }

    /// True once any destination holds `max_queue_depth` events; the reader
    /// should pause until uploads catch up.
    pub fn is_saturated(&self) -> bool {
        self.queues.values().any(|q| q.depth >= self.max_queue_depth)
    }

    /// Number of events held.
    pub fn len(&self) -> usize {
        self.queues.values().map(|q| q.depth).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tracing_test::traced_test;

    fn event(timestamp: i64, message: &str) -> LogEvent {
        LogEvent {
            timestamp,
            message: message.to_string(),
        }
    }

    fn limits(max_count: usize, max_bytes: usize) -> BatchLimits {
        BatchLimits {
            max_count,
            max_bytes,
            max_span: MAX_BATCH_SPAN,
        }
    }

    #[test]
    fn test_nothing_ready_until_forced() {
        let dest = Destination::new("G", "a");
        let mut batcher = Batcher::default();
        batcher.offer(&dest, 0, event(1, "one")).unwrap();
        batcher.offer(&dest, 1, event(2, "two")).unwrap();

        assert!(batcher.drain_ready(false).is_empty());
        let batches = batcher.drain_ready(true);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].seqs, vec![0, 1]);
        assert_eq!(batches[0].bytes(), 3 + 26 + 3 + 26);
        assert!(batcher.is_empty());
    }

    #[test]
    fn test_count_limit() {
        let dest = Destination::new("G", "a");
        let mut batcher = Batcher::new(limits(2, MAX_BATCH_BYTES), 100);
        for seq in 0..5 {
            batcher.offer(&dest, seq, event(seq as i64, "x")).unwrap();
        }
        let sealed = batcher.drain_ready(false);
        assert_eq!(sealed.iter().map(Batch::len).collect::<Vec<_>>(), vec![2, 2]);
        assert_eq!(batcher.len(), 1);
        assert_eq!(batcher.drain_ready(true)[0].seqs, vec![4]);
    }

    #[test]
    fn test_size_limit() {
        let dest = Destination::new("G", "a");
        // Two 10-byte messages fit in 72 bytes, a third does not.
        let mut batcher = Batcher::new(limits(100, 72), 100);
        for seq in 0..3 {
            batcher.offer(&dest, seq, event(1, "0123456789")).unwrap();
        }
        let sealed = batcher.drain_ready(false);
        assert_eq!(sealed.len(), 1);
        assert_eq!(sealed[0].len(), 2);
        assert_eq!(sealed[0].bytes(), 72);
    }

    #[test]
    fn test_oversized_event_rejected() {
        let dest = Destination::new("G", "a");
        let mut batcher = Batcher::new(limits(100, 30), 100);
        assert_eq!(
            batcher.offer(&dest, 0, event(1, "12345")),
            Err(OfferError::TooLarge { size: 31, limit: 30 })
        );
        assert!(batcher.is_empty());
    }

    #[test]
    fn test_span_limit() {
        let dest = Destination::new("G", "a");
        let hour = 60 * 60 * 1000;
        let mut batcher = Batcher::default();
        batcher.offer(&dest, 0, event(0, "a")).unwrap();
        batcher.offer(&dest, 1, event(23 * hour, "b")).unwrap();
        batcher.offer(&dest, 2, event(23 * hour + 1, "c")).unwrap();

        let batches = batcher.drain_ready(true);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].seqs, vec![0, 1]);
        assert_eq!(batches[1].seqs, vec![2]);
    }

    #[test]
    #[traced_test]
    fn test_out_of_order_starts_new_batch() {
        let dest = Destination::new("G", "a");
        let mut batcher = Batcher::default();
        batcher.offer(&dest, 0, event(10, "a")).unwrap();
        batcher.offer(&dest, 1, event(5, "b")).unwrap();
        batcher.offer(&dest, 2, event(5, "c")).unwrap();

        let batches = batcher.drain_ready(true);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].seqs, vec![0]);
        assert_eq!(batches[1].seqs, vec![1, 2]);
        assert!(logs_contain("Out-of-order event"));
    }

    #[test]
    #[traced_test]
    fn test_out_of_order_after_flush() {
        let dest = Destination::new("G", "a");
        let mut batcher = Batcher::default();
        batcher.offer(&dest, 0, event(10, "a")).unwrap();
        assert_eq!(batcher.take_ready(true, &HashSet::new(), 10).len(), 1);
        assert!(batcher.is_empty());

        batcher.offer(&dest, 1, event(5, "b")).unwrap();
        assert!(logs_contain("Out-of-order event for G/a: 5 is before 10"));

        // Another destination keeps its own history.
        let other = Destination::new("G", "b");
        batcher.offer(&other, 2, event(1, "c")).unwrap();
        assert!(!logs_contain("Out-of-order event for G/b"));
    }

    #[test]
    fn test_requeue_goes_ahead_of_newer_batches() {
        let a = Destination::new("G", "a");
        let mut batcher = Batcher::new(limits(1, MAX_BATCH_BYTES), 100);
        batcher.offer(&a, 0, event(1, "first")).unwrap();
        let mut taken = batcher.take_ready(true, &HashSet::new(), 10);
        assert_eq!(taken.len(), 1);
        batcher.offer(&a, 1, event(2, "second")).unwrap();
        batcher.offer(&a, 2, event(3, "third")).unwrap();

        batcher.requeue(taken.remove(0));
        assert_eq!(batcher.len(), 3);
        let order: Vec<Seq> = batcher
            .drain_ready(true)
            .into_iter()
            .flat_map(|batch| batch.seqs)
            .collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert!(batcher.is_empty());
    }

    #[test]
    fn test_destinations_are_independent() {
        let a = Destination::new("G", "a");
        let b = Destination::new("G", "b");
        let mut batcher = Batcher::default();
        batcher.offer(&a, 0, event(1, "a")).unwrap();
        batcher.offer(&b, 1, event(1, "b")).unwrap();
        batcher.offer(&a, 2, event(2, "a")).unwrap();

        let mut batches = batcher.drain_ready(true);
        batches.sort_by(|x, y| x.destination.cmp(&y.destination));
        assert_eq!(batches[0].destination, a);
        assert_eq!(batches[0].seqs, vec![0, 2]);
        assert_eq!(batches[1].destination, b);
        assert_eq!(batches[1].seqs, vec![1]);
    }

    #[test]
    fn test_take_ready_one_per_destination() {
        let a = Destination::new("G", "a");
        let b = Destination::new("G", "b");
        let mut batcher = Batcher::new(limits(1, MAX_BATCH_BYTES), 100);
        batcher.offer(&a, 0, event(1, "a")).unwrap();
        batcher.offer(&a, 1, event(2, "a")).unwrap();
        batcher.offer(&b, 2, event(1, "b")).unwrap();

        let busy = HashSet::from([b.clone()]);
        let batches = batcher.take_ready(true, &busy, 10);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].seqs, vec![0]);

        let batches = batcher.take_ready(false, &HashSet::new(), 1);
        assert_eq!(batches.len(), 1);

        let mut rest = batcher.take_ready(false, &HashSet::new(), 10);
        rest.extend(batcher.take_ready(false, &HashSet::new(), 10));
        assert_eq!(batches.len() + rest.len(), 2);
        assert!(batcher.is_empty());
    }

    #[test]
    fn test_saturation() {
        let a = Destination::new("G", "a");
        let mut batcher = Batcher::new(limits(2, MAX_BATCH_BYTES), 3);
        for seq in 0..3 {
            assert!(!batcher.is_saturated());
            batcher.offer(&a, seq, event(1, "x")).unwrap();
        }
        assert!(batcher.is_saturated());
        batcher.drain_ready(false);
        assert!(!batcher.is_saturated());
    }

    proptest! {
        /// Every offered event comes out in exactly one batch; batches respect
        /// the limits and are ordered by timestamp.
        #[test]
        fn every_event_in_exactly_one_batch(
            offers in proptest::collection::vec((0usize..3, 0i64..50, "[a-z]{0,20}"), 0..200),
            max_count in 1usize..8,
            max_bytes in 50usize..200,
        ) {
            let destinations = [
                Destination::new("G", "a"),
                Destination::new("G", "b"),
                Destination::new("H", "a"),
            ];
            let limits = BatchLimits { max_count, max_bytes, max_span: Duration::from_millis(30) };
            let mut batcher = Batcher::new(limits, usize::MAX);
            let mut offered = Vec::new();
            let mut batches = Vec::new();

            for (seq, (d, timestamp, message)) in offers.into_iter().enumerate() {
                let seq = seq as Seq;
                if batcher.offer(&destinations[d], seq, event(timestamp, &message)).is_ok() {
                    offered.push((d, seq));
                }
                if seq % 17 == 0 {
                    batches.extend(batcher.drain_ready(false));
                }
            }
            batches.extend(batcher.drain_ready(true));
            prop_assert!(batcher.is_empty());

            let mut seen = Vec::new();
            for batch in &batches {
                prop_assert!(!batch.is_empty());
                prop_assert!(batch.len() <= max_count);
                prop_assert!(batch.bytes() <= max_bytes);
                prop_assert!(batch.events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
                let span = batch.events.last().unwrap().timestamp - batch.events[0].timestamp;
                prop_assert!(span <= 30);
                let d = destinations.iter().position(|d| *d == batch.destination).unwrap();
                seen.extend(batch.seqs.iter().map(|&seq| (d, seq)));
            }
            seen.sort_unstable();
            offered.sort_unstable();
            prop_assert_eq!(seen, offered);
        }
    }
}
