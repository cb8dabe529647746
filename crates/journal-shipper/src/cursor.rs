// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cursor persistence and the safe-cursor computation.
//!
//! The persisted cursor means "everything at or before this entry has been
//! accepted by the ingestion API or deliberately dropped". With uploads to
//! several destinations in flight, that is the cursor of the entry read just
//! before the oldest entry still awaiting confirmation.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::routing::Destination;

#[derive(Debug, thiserror::Error)]
pub enum CursorError {
    #[error("failed to read cursor file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write cursor file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The on-disk cursor: a single opaque token.
#[derive(Debug, Clone)]
pub struct CursorFile {
    path: PathBuf,
}

impl CursorFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the stored cursor; a missing or blank file means none.
    pub fn load(&self) -> Result<Option<String>, CursorError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => {
                let cursor = contents.trim();
                Ok((!cursor.is_empty()).then(|| cursor.to_string()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(CursorError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Replaces the stored cursor. The new contents are written to a
    /// temporary file, synced and renamed over the old file, so a crash
    /// leaves either the old or the new cursor.
    pub fn store(&self, cursor: &str) -> Result<(), CursorError> {
        let write_err = |source: std::io::Error| CursorError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(write_err)?;
            }
        }

        let temp_path = self.path.with_extension(format!("tmp.{}", std::process::id()));
        let mut file = File::create(&temp_path).map_err(write_err)?;
        file.write_all(cursor.as_bytes()).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;
        drop(file);

        fs::rename(&temp_path, &self.path).map_err(write_err)
    }
}

/// Read-order sequence number assigned to each routed entry.
pub type Seq = u64;

/// Tracks which routed entries are still unconfirmed, per destination.
#[derive(Debug, Default)]
pub struct CursorTracker {
    next_seq: Seq,
    latest: Option<String>,
    /// For every unconfirmed entry, the cursor of the entry read before it.
    pending: HashMap<Destination, BTreeMap<Seq, Option<String>>>,
}

impl CursorTracker {
    /// Starts from the persisted cursor, if any.
    pub fn new(initial: Option<String>) -> Self {
        Self {
            latest: initial,
            ..Default::default()
        }
    }

    /// Registers an entry that will be uploaded to `destination`.
    pub fn record(&mut self, destination: &Destination, cursor: &str) -> Seq {
        let seq = self.next_seq;
        self.next_seq += 1;
        let previous = self.latest.replace(cursor.to_string());
        self.pending
            .entry(destination.clone())
            .or_default()
            .insert(seq, previous);
        seq
    }

    /// Registers an entry that will never be uploaded (unroutable, expired).
    pub fn skip(&mut self, cursor: &str) {
        self.next_seq += 1;
        self.latest = Some(cursor.to_string());
    }

    /// Marks entries as accepted by the ingestion API.
    pub fn confirm(&mut self, destination: &Destination, seqs: impl IntoIterator<Item = Seq>) {
        if let Some(pending) = self.pending.get_mut(destination) {
            for seq in seqs {
                pending.remove(&seq);
            }
            if pending.is_empty() {
                self.pending.remove(destination);
            }
        }
    }

    /// The cursor that can be persisted right now.
    pub fn safe_cursor(&self) -> Option<&str> {
        let oldest = self
            .pending
            .values()
            .filter_map(|pending| pending.iter().next())
            .min_by_key(|(seq, _)| **seq);
        match oldest {
            Some((_, previous)) => previous.as_deref(),
            None => self.latest.as_deref(),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().map(BTreeMap::len).sum()
    }

    /// Destinations with entries still awaiting confirmation.
    pub fn pending_destinations(&self) -> impl Iterator<Item = &Destination> {
        self.pending.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_load_missing_and_blank() {
        let dir = tempfile::tempdir().unwrap();
        let file = CursorFile::new(dir.path().join("cursor"));
        assert_eq!(file.load().unwrap(), None);

        std::fs::write(file.path(), "  \n").unwrap();
        assert_eq!(file.load().unwrap(), None);
    }

    #[test]
    fn test_store_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let file = CursorFile::new(dir.path().join("state").join("cursor"));
        file.store("s=abc;i=1").unwrap();
        assert_eq!(file.load().unwrap().as_deref(), Some("s=abc;i=1"));

        file.store("s=abc;i=2").unwrap();
        assert_eq!(file.load().unwrap().as_deref(), Some("s=abc;i=2"));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("state"))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name() != "cursor")
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_load_trims_trailing_newline() {
        let dir = tempfile::tempdir().unwrap();
        let file = CursorFile::new(dir.path().join("cursor"));
        std::fs::write(file.path(), "s=abc;i=9\n").unwrap();
        assert_eq!(file.load().unwrap().as_deref(), Some("s=abc;i=9"));
    }

    #[test]
    fn test_safe_cursor_waits_for_oldest_destination() {
        let a = Destination::new("G", "a");
        let b = Destination::new("G", "b");
        let mut tracker = CursorTracker::new(Some("c0".to_string()));

        let s1 = tracker.record(&a, "c1");
        let s2 = tracker.record(&b, "c2");
        let s3 = tracker.record(&a, "c3");
        assert_eq!(tracker.safe_cursor(), Some("c0"));

        tracker.confirm(&b, [s2]);
        assert_eq!(tracker.safe_cursor(), Some("c0"));

        tracker.confirm(&a, [s1]);
        assert_eq!(tracker.safe_cursor(), Some("c2"));

        tracker.confirm(&a, [s3]);
        assert_eq!(tracker.safe_cursor(), Some("c3"));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn test_skipped_entries_advance_when_nothing_pending() {
        let a = Destination::new("G", "a");
        let mut tracker = CursorTracker::new(None);
        assert_eq!(tracker.safe_cursor(), None);

        tracker.skip("c1");
        assert_eq!(tracker.safe_cursor(), Some("c1"));

        let s2 = tracker.record(&a, "c2");
        tracker.skip("c3");
        assert_eq!(tracker.safe_cursor(), Some("c1"));

        tracker.confirm(&a, [s2]);
        assert_eq!(tracker.safe_cursor(), Some("c3"));
    }

    #[test]
    fn test_failed_batch_stalls_cursor() {
        let a = Destination::new("G", "a");
        let b = Destination::new("G", "b");
        let mut tracker = CursorTracker::new(Some("c0".to_string()));

        let _stuck = tracker.record(&a, "c1");
        let later: Vec<Seq> = (2..10)
            .map(|i| tracker.record(&b, &format!("c{i}")))
            .collect();
        tracker.confirm(&b, later);
        assert_eq!(tracker.safe_cursor(), Some("c0"));
        assert_eq!(tracker.pending_destinations().collect::<Vec<_>>(), vec![&a]);
    }

    proptest! {
        /// The safe cursor never passes an unconfirmed entry, whatever order
        /// confirmations arrive in.
        #[test]
        fn safe_cursor_never_passes_unconfirmed(
            routes in proptest::collection::vec(0usize..3, 1..40),
            order in proptest::collection::vec(any::<prop::sample::Index>(), 0..40),
        ) {
            let destinations = [
                Destination::new("G", "a"),
                Destination::new("G", "b"),
                Destination::new("G", "c"),
            ];
            let mut tracker = CursorTracker::new(None);
            let mut unconfirmed: Vec<(usize, Seq)> = routes
                .iter()
                .enumerate()
                .map(|(i, &d)| (d, tracker.record(&destinations[d], &format!("{i:04}"))))
                .collect();

            for index in order {
                if unconfirmed.is_empty() {
                    break;
                }
                let (d, seq) = unconfirmed.remove(index.index(unconfirmed.len()));
                tracker.confirm(&destinations[d], [seq]);

                let oldest = unconfirmed.iter().map(|&(_, seq)| seq).min();
                if let (Some(safe), Some(oldest)) = (tracker.safe_cursor(), oldest) {
                    // Cursors are zero-padded read positions, so they order like seqs.
                    let oldest_cursor = format!("{oldest:04}");
                    prop_assert!(safe < oldest_cursor.as_str());
                }
            }
        }
    }
}
