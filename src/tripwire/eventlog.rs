//! SF-015: Append-only JSONL provenance event log.

use crate::core::error::{Error, Result};
use crate::core::types::{ProvenanceEvent, TimestampedEvent};
use chrono::{SecondsFormat, Utc};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Current time as an RFC 3339 UTC timestamp.
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Generate a run ID.
pub fn generate_run_id() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
    format!("r-{:012x}", nanos & 0xFFFF_FFFF_FFFF)
}

/// Derive the event log path within a state directory.
pub fn event_log_path(state_dir: &Path) -> PathBuf {
    state_dir.join("events.jsonl")
}

/// Append an event to the log at `path`.
pub fn append_event(path: &Path, event: ProvenanceEvent) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::state(parent, e))?;
    }

    let te = TimestampedEvent {
        ts: now_iso8601(),
        event,
    };
    let json = serde_json::to_string(&te).map_err(|e| Error::state(path, e))?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::state(path, e))?;

    writeln!(file, "{}", json).map_err(|e| Error::state(path, e))?;

    Ok(())
}

/// Append when a log is configured; a failed write is logged, never fatal.
pub fn record(path: Option<&Path>, event: ProvenanceEvent) {
    if let Some(path) = path {
        if let Err(e) = append_event(path, event) {
            tracing::warn!(error = %e, "cannot append provenance event");
        }
    }
}

/// Read every event back, oldest first.
pub fn read_events(path: &Path) -> Result<Vec<TimestampedEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path).map_err(|e| Error::state(path, e))?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(|e| Error::state(path, e)))
        .collect()
}
