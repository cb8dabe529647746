// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The journal side of the pipeline: journal entries and the sources that
//! read them.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn};

pub const CURSOR_FIELD: &str = "__CURSOR";
pub const REALTIME_TIMESTAMP_FIELD: &str = "__REALTIME_TIMESTAMP";

/// Entries older than this are never uploaded, so there is no point in
/// reading further back on a cold start.
pub const DEFAULT_LOOKBACK: Duration = Duration::from_secs(14 * 24 * 60 * 60);

const RESTART_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Undecodable journal entry: {0}")]
    Corrupt(String),

    #[error("Failed to start journal reader: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed to read from journal: {0}")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    /// A gap means one entry was lost but the source can keep going
    /// immediately.
    pub fn is_gap(&self) -> bool {
        matches!(self, SourceError::Corrupt(_))
    }
}

/// One journal entry: its string-valued fields, its cursor and its
/// realtime timestamp in microseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub fields: BTreeMap<String, String>,
    pub cursor: String,
    pub timestamp_us: u64,
}

impl Message {
    pub fn new(fields: BTreeMap<String, String>, cursor: impl Into<String>, timestamp_us: u64) -> Self {
        Self {
            fields,
            cursor: cursor.into(),
            timestamp_us,
        }
    }

    pub fn timestamp_ms(&self) -> i64 {
        i64::try_from(self.timestamp_us / 1_000).unwrap_or(i64::MAX)
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    /// Decodes one line of `journalctl --output=json`.
    ///
    /// Binary fields (arrays of bytes) and fields too large for journalctl to
    /// print (null) are dropped; they have no faithful string form.
    pub fn from_json_line(line: &str) -> Result<Self, SourceError> {
        let value: serde_json::Value =
            serde_json::from_str(line).map_err(|e| SourceError::Corrupt(e.to_string()))?;
        let serde_json::Value::Object(object) = value else {
            return Err(SourceError::Corrupt("entry is not a JSON object".to_string()));
        };

        let fields: BTreeMap<String, String> = object
            .into_iter()
            .filter_map(|(key, value)| match value {
                serde_json::Value::String(s) => Some((key, s)),
                serde_json::Value::Number(n) => Some((key, n.to_string())),
                _ => None,
            })
            .collect();

        let cursor = fields
            .get(CURSOR_FIELD)
            .cloned()
            .ok_or_else(|| SourceError::Corrupt(format!("entry has no {CURSOR_FIELD}")))?;
        let timestamp_us = fields
            .get(REALTIME_TIMESTAMP_FIELD)
            .and_then(|ts| ts.parse::<u64>().ok())
            .ok_or_else(|| SourceError::Corrupt(format!("entry has no valid {REALTIME_TIMESTAMP_FIELD}")))?;

        Ok(Self {
            fields,
            cursor,
            timestamp_us,
        })
    }
}

/// A sequential reader over the journal.
#[async_trait]
pub trait JournalSource: Send {
    /// Returns the next entry, or `None` if nothing arrived within `wait`.
    async fn next_entry(&mut self, wait: Duration) -> Result<Option<Message>, SourceError>;
}

/// Where a fresh `journalctl` process should start reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPosition {
    AfterCursor(String),
    /// Unix seconds.
    Since(i64),
}

impl StartPosition {
    /// Resume after `cursor`, or look back [`DEFAULT_LOOKBACK`] from now.
    pub fn from_cursor(cursor: Option<String>) -> Self {
        match cursor {
            Some(cursor) => StartPosition::AfterCursor(cursor),
            None => StartPosition::Since(chrono::Utc::now().timestamp() - DEFAULT_LOOKBACK.as_secs() as i64),
        }
    }

    fn arg(&self) -> String {
        match self {
            StartPosition::AfterCursor(cursor) => format!("--after-cursor={cursor}"),
            StartPosition::Since(secs) => format!("--since=@{secs}"),
        }
    }
}

struct Reader {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    yielded: usize,
}

/// Follows the journal by driving `journalctl --output=json --follow`.
///
/// When the child exits it is restarted after the last cursor it yielded. A
/// restart that dies before yielding anything (the cursor was rotated away)
/// falls back to the last seen timestamp.
pub struct JournalctlSource {
    program: PathBuf,
    directory: PathBuf,
    start: StartPosition,
    reader: Option<Reader>,
    last_timestamp_us: Option<u64>,
}

impl JournalctlSource {
    pub fn new(directory: impl Into<PathBuf>, start: StartPosition) -> Self {
        Self {
            program: PathBuf::from("journalctl"),
            directory: directory.into(),
            start,
            reader: None,
            last_timestamp_us: None,
        }
    }

    #[must_use]
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn args(&self) -> Vec<String> {
        vec![
            "--output=json".to_string(),
            "--follow".to_string(),
            "--no-tail".to_string(),
            "--quiet".to_string(),
            format!("--directory={}", self.directory.display()),
            self.start.arg(),
        ]
    }

    fn spawn(&mut self) -> Result<&mut Reader, SourceError> {
        if self.reader.is_none() {
            let args = self.args();
            debug!("JOURNAL | Starting {} {}", self.program.display(), args.join(" "));
            let mut child = Command::new(&self.program)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .kill_on_drop(true)
                .spawn()
                .map_err(SourceError::Spawn)?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| SourceError::Spawn(std::io::Error::other("journalctl stdout not captured")))?;
            self.reader = Some(Reader {
                child,
                lines: BufReader::new(stdout).lines(),
                yielded: 0,
            });
        }
        self.reader
            .as_mut()
            .ok_or_else(|| SourceError::Spawn(std::io::Error::other("journal reader unavailable")))
    }

    fn on_exit(&mut self, status: Option<ExitStatus>, yielded: usize) {
        let failed = status.is_some_and(|s| !s.success());
        if failed && yielded == 0 {
            if let StartPosition::AfterCursor(cursor) = &self.start {
                let since = self
                    .last_timestamp_us
                    .map(|us| (us / 1_000_000) as i64)
                    .unwrap_or_else(|| chrono::Utc::now().timestamp() - DEFAULT_LOOKBACK.as_secs() as i64);
                warn!(
                    "JOURNAL | Cannot resume after cursor {cursor}, restarting from @{since}; entries in between may be lost"
                );
                self.start = StartPosition::Since(since);
                return;
            }
        }
        info!("JOURNAL | journalctl exited ({status:?}), restarting");
    }
}

#[async_trait]
impl JournalSource for JournalctlSource {
    async fn next_entry(&mut self, wait: Duration) -> Result<Option<Message>, SourceError> {
        let reader = self.spawn()?;
        let line = match tokio::time::timeout(wait, reader.lines.next_line()).await {
            Err(_elapsed) => return Ok(None),
            Ok(line) => line?,
        };

        match line {
            Some(line) => {
                reader.yielded += 1;
                let message = Message::from_json_line(&line)?;
                self.last_timestamp_us = Some(message.timestamp_us);
                self.start = StartPosition::AfterCursor(message.cursor.clone());
                Ok(Some(message))
            }
            None => {
                let status = match self.reader.take() {
                    Some(mut reader) => {
                        let status = reader.child.wait().await.ok();
                        self.on_exit(status, reader.yielded);
                        status
                    }
                    None => None,
                };
                debug!("JOURNAL | Reader finished with {status:?}");
                tokio::time::sleep(RESTART_DELAY.min(wait)).await;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINE: &str = r#"{"__CURSOR":"s=abc;i=1","__REALTIME_TIMESTAMP":"1700000000123456","MESSAGE":"hello","PRIORITY":"6","_SYSTEMD_UNIT":"sshd.service","BINARY":[1,2,3],"HUGE":null}"#;

    #[test]
    fn test_decode_json_line() {
        let message = Message::from_json_line(LINE).unwrap();
        assert_eq!(message.cursor, "s=abc;i=1");
        assert_eq!(message.timestamp_us, 1_700_000_000_123_456);
        assert_eq!(message.timestamp_ms(), 1_700_000_000_123);
        assert_eq!(message.get("MESSAGE"), Some("hello"));
        assert_eq!(message.get("BINARY"), None);
        assert_eq!(message.get("HUGE"), None);
    }

    #[test]
    fn test_decode_rejects_incomplete_entries() {
        assert!(Message::from_json_line("not json").unwrap_err().is_gap());
        assert!(Message::from_json_line("[1,2]").unwrap_err().is_gap());
        assert!(Message::from_json_line(r#"{"__REALTIME_TIMESTAMP":"1"}"#)
            .unwrap_err()
            .is_gap());
        assert!(Message::from_json_line(r#"{"__CURSOR":"c","__REALTIME_TIMESTAMP":"soon"}"#)
            .unwrap_err()
            .is_gap());
    }

    #[test]
    fn test_start_position_args() {
        assert_eq!(
            StartPosition::AfterCursor("s=1".to_string()).arg(),
            "--after-cursor=s=1"
        );
        assert_eq!(StartPosition::Since(42).arg(), "--since=@42");

        match StartPosition::from_cursor(None) {
            StartPosition::Since(secs) => {
                let expected = chrono::Utc::now().timestamp() - DEFAULT_LOOKBACK.as_secs() as i64;
                assert!((expected - secs).abs() < 5);
            }
            other => panic!("expected since, got {other:?}"),
        }
    }

    #[test]
    fn test_journalctl_args() {
        let source = JournalctlSource::new("/var/log/journal", StartPosition::AfterCursor("c".to_string()));
        let args = source.args();
        assert!(args.contains(&"--output=json".to_string()));
        assert!(args.contains(&"--follow".to_string()));
        assert!(args.contains(&"--directory=/var/log/journal".to_string()));
        assert!(args.contains(&"--after-cursor=c".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reads_entries_from_child_process() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-journalctl");
        std::fs::write(
            &script,
            format!("#!/bin/sh\necho '{LINE}'\necho 'garbage'\nsleep 5\n"),
        )
        .unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let mut source = JournalctlSource::new(dir.path(), StartPosition::Since(0)).with_program(&script);
        let first = source.next_entry(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(first.cursor, "s=abc;i=1");
        assert_eq!(source.start, StartPosition::AfterCursor("s=abc;i=1".to_string()));

        let second = source.next_entry(Duration::from_secs(5)).await;
        assert!(second.unwrap_err().is_gap());

        let idle = source.next_entry(Duration::from_millis(50)).await.unwrap();
        assert!(idle.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rotated_cursor_falls_back_to_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("failing-journalctl");
        std::fs::write(&script, "#!/bin/sh\nexit 1\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let mut source = JournalctlSource::new(dir.path(), StartPosition::AfterCursor("gone".to_string()))
            .with_program(&script);
        source.last_timestamp_us = Some(1_700_000_000_000_000);
        let entry = source.next_entry(Duration::from_secs(2)).await.unwrap();
        assert!(entry.is_none());
        assert_eq!(source.start, StartPosition::Since(1_700_000_000));
    }
}
