//! Append-only audit trail and telemetry sink.
//!
//! One line per finished session:
//! `<rfc3339 timestamp>\t<old serial>\t<new serial>\t<outcome>`, with `-`
//! standing in for a serial that was never known.

use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;
use tracing::{debug, info};

use crate::serial_number::{self, SerialNumber};
use crate::state::machine::AbortReason;

const FIELD_SEPARATOR: char = '\t';
const MISSING: &str = "-";
const OUTCOME_SUCCESS: &str = "success";
const OUTCOME_FAILURE_PREFIX: &str = "failure:";

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("IO error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("Malformed audit record on line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditOutcome {
    Success,
    /// Abort code, see [`AbortReason::code`].
    Failure(String),
}

impl AuditOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AuditOutcome::Success)
    }
}

impl From<&AbortReason> for AuditOutcome {
    fn from(reason: &AbortReason) -> Self {
        AuditOutcome::Failure(reason.code().to_string())
    }
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditOutcome::Success => write!(f, "{}", OUTCOME_SUCCESS),
            AuditOutcome::Failure(code) => write!(f, "{}{}", OUTCOME_FAILURE_PREFIX, code),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditLogRecord {
    pub timestamp: DateTime<Utc>,
    pub old: Option<SerialNumber>,
    pub new: Option<SerialNumber>,
    pub outcome: AuditOutcome,
}

impl AuditLogRecord {
    /// Record stamped with the current time.
    pub fn now(
        old: Option<SerialNumber>,
        new: Option<SerialNumber>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            old,
            new,
            outcome,
        }
    }

    pub fn to_line(&self) -> String {
        let serial = |s: &Option<SerialNumber>| {
            s.as_ref()
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|| MISSING.to_string())
        };
        format!(
            "{ts}{sep}{old}{sep}{new}{sep}{outcome}",
            ts = self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            old = serial(&self.old),
            new = serial(&self.new),
            outcome = self.outcome,
            sep = FIELD_SEPARATOR,
        )
    }

    /// Parse one line written by [`to_line`](Self::to_line). `line_no` is
    /// only used in errors.
    pub fn parse_line(line: &str, line_no: usize) -> Result<Self, AuditError> {
        let malformed = |reason: String| AuditError::Malformed {
            line: line_no,
            reason,
        };
        let fields: Vec<&str> = line.split(FIELD_SEPARATOR).collect();
        let [ts, old, new, outcome] = fields.as_slice() else {
            return Err(malformed(format!("expected 4 fields, got {}", fields.len())));
        };

        let timestamp = DateTime::parse_from_rfc3339(ts)
            .map_err(|e| malformed(format!("timestamp: {}", e)))?
            .with_timezone(&Utc);
        let serial = |s: &str| -> Result<Option<SerialNumber>, AuditError> {
            if s == MISSING {
                return Ok(None);
            }
            serial_number::parse(s)
                .map(Some)
                .map_err(|e| malformed(format!("serial {:?}: {}", s, e)))
        };
        let outcome = if *outcome == OUTCOME_SUCCESS {
            AuditOutcome::Success
        } else if let Some(code) = outcome.strip_prefix(OUTCOME_FAILURE_PREFIX) {
            AuditOutcome::Failure(code.to_string())
        } else {
            return Err(malformed(format!("outcome {:?}", outcome)));
        };

        Ok(Self {
            timestamp,
            old: serial(old)?,
            new: serial(new)?,
            outcome,
        })
    }
}

/// Append-only audit file.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &AuditLogRecord) -> Result<(), AuditError> {
        let io_err = |source| AuditError::Io {
            path: self.path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        // One write per record keeps lines whole under concurrent appenders.
        let line = format!("{}\n", record.to_line());
        file.write_all(line.as_bytes()).map_err(io_err)?;
        file.sync_data().map_err(io_err)?;
        info!(path = %self.path.display(), outcome = %record.outcome, "Audit record appended");
        Ok(())
    }

    /// Every record in the file, oldest first. A missing file is empty.
    pub fn read_all(&self) -> Result<Vec<AuditLogRecord>, AuditError> {
        let io_err = |source| AuditError::Io {
            path: self.path.clone(),
            source,
        };
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(e)),
        };
        let mut records = Vec::new();
        for (i, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(io_err)?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(AuditLogRecord::parse_line(&line, i + 1)?);
        }
        debug!(count = records.len(), "Read audit log");
        Ok(records)
    }
}

/// Result of asking whether a newer tool release exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionStatus {
    UpToDate,
    UpdateAvailable(String),
    /// No answer could be obtained.
    Unknown,
}

/// Where finished-session records are reported beyond the local file.
pub trait Telemetry: Send + Sync {
    fn publish(&self, record: &AuditLogRecord);

    fn send_logs(&self, records: &[AuditLogRecord]) {
        for record in records {
            self.publish(record);
        }
    }

    fn report_version_check(&self, current_version: &str) -> VersionStatus;
}

/// Discards everything.
pub struct NullTelemetry;

impl Telemetry for NullTelemetry {
    fn publish(&self, _record: &AuditLogRecord) {}

    fn report_version_check(&self, _current_version: &str) -> VersionStatus {
        VersionStatus::Unknown
    }
}

/// Logs records through tracing.
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn publish(&self, record: &AuditLogRecord) {
        info!(record = %record.to_line(), "Telemetry record");
    }

    fn report_version_check(&self, current_version: &str) -> VersionStatus {
        info!(version = current_version, "Version check requested");
        VersionStatus::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn sn(s: &str) -> SerialNumber {
        s.parse().unwrap()
    }

    #[test]
    fn test_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit.log"));
        assert!(log.read_all().unwrap().is_empty());

        let ok = AuditLogRecord::now(
            Some(sn("C02123ABCQ6L")),
            Some(sn("C02123XYZQ6L")),
            AuditOutcome::Success,
        );
        let failed = AuditLogRecord::now(
            None,
            None,
            AuditOutcome::from(&AbortReason::ConnectionLost),
        );
        log.append(&ok).unwrap();
        log.append(&failed).unwrap();

        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].old, ok.old);
        assert_eq!(records[0].new, ok.new);
        assert!(records[0].outcome.is_success());
        assert_eq!(
            records[1].outcome,
            AuditOutcome::Failure("connection-lost".into())
        );
        assert_eq!(records[1].old, None);
    }

    #[test]
    fn test_line_format() {
        let record = AuditLogRecord {
            timestamp: DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            old: Some(sn("C02123ABCQ6L")),
            new: None,
            outcome: AuditOutcome::Failure("timeout".into()),
        };
        assert_eq!(
            record.to_line(),
            "2024-03-01T10:00:00.000Z\tC02123ABCQ6L\t-\tfailure:timeout"
        );
    }

    #[test]
    fn test_malformed_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        std::fs::write(&path, "garbage\n").unwrap();
        match AuditLog::new(&path).read_all() {
            Err(AuditError::Malformed { line, .. }) => assert_eq!(line, 1),
            other => panic!("unexpected: {:?}", other),
        }
    }

    struct Recorder(Mutex<Vec<String>>);

    impl Telemetry for Recorder {
        fn publish(&self, record: &AuditLogRecord) {
            self.0.lock().unwrap().push(record.to_line());
        }

        fn report_version_check(&self, _current_version: &str) -> VersionStatus {
            VersionStatus::UpToDate
        }
    }

    #[test]
    fn test_send_logs_publishes_each() {
        let recorder = Recorder(Mutex::new(Vec::new()));
        let records = vec![
            AuditLogRecord::now(None, None, AuditOutcome::Success),
            AuditLogRecord::now(None, None, AuditOutcome::Failure("timeout".into())),
        ];
        recorder.send_logs(&records);
        assert_eq!(recorder.0.lock().unwrap().len(), 2);
        assert_eq!(
            NullTelemetry.report_version_check("0.1.0"),
            VersionStatus::Unknown
        );
    }
}
