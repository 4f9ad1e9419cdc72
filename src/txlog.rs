//! Transaction log: one structured JSON line per study lifecycle transition.
//!
//! Kept deliberately separate from the application log (`tracing`'s default
//! fmt layer) the way spec.md's "two named sinks" calls for — this is the
//! user-visible audit surface, so its shape (timestamp, study key, peer
//! endpoint, outcome, error kind) is a stable contract, not a log line that
//! happens to be greppable. No patient-identifying value is ever written
//! here: only the StudyKey (a UID, never a name) and operational metadata.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    ReceivingStart,
    ProcessingStart,
    ProcessingSuccess,
    SendingStart,
    SendingSuccess,
    Quarantined,
    FatalAbort,
}

#[derive(Serialize)]
struct Record<'a> {
    timestamp: String,
    study_key: &'a str,
    peer_endpoint: Option<&'a str>,
    event: Event,
    outcome: &'static str,
    error_kind: Option<&'static str>,
}

pub struct TransactionLog {
    file: Mutex<std::fs::File>,
}

impl TransactionLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| Error::io(path.to_path_buf(), e))?;
        Ok(TransactionLog { file: Mutex::new(file) })
    }

    /// Appends one JSON-line record. A record's timestamp is taken at the
    /// moment this is called, not queued and stamped later, so entries are
    /// written in the order transitions actually happen.
    pub fn record(&self, study_key: &str, peer_endpoint: Option<&str>, event: Event, error_kind: Option<&'static str>) {
        let outcome = if error_kind.is_some() { "failure" } else { "success" };
        let record = Record {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            study_key,
            peer_endpoint,
            event,
            outcome,
            error_kind,
        };
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialise transaction log record");
                return;
            }
        };
        let mut file = match self.file.lock() {
            Ok(file) => file,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(file, "{line}") {
            tracing::error!(error = %e, "failed to write transaction log record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_appends_one_parseable_json_line_per_call() {
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("transactions.jsonl");
        let log = TransactionLog::open(&path).unwrap();

        log.record("1.2.3", Some("10.0.0.5:104"), Event::ProcessingStart, None);
        log.record("1.2.3", Some("10.0.0.5:104"), Event::Quarantined, Some("roi-empty"));

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "PROCESSING_START");
        assert_eq!(first["outcome"], "success");
        assert!(first["error_kind"].is_null());

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["event"], "QUARANTINED");
        assert_eq!(second["outcome"], "failure");
        assert_eq!(second["error_kind"], "roi-empty");
    }
}
