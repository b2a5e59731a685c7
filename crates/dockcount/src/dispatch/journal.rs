//! Dead-letter audit trail.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, warn};

use crate::model::CountEvent;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Lane buffer full; the oldest buffered event made room.
    Overflow,
    /// Sink refused the event outright.
    Rejected,
    /// Event failed the maximum number of delivery rounds.
    Exhausted,
    /// Still undelivered when the shutdown grace period ended.
    Shutdown,
}

impl DeadLetterReason {
    pub fn label(self) -> &'static str {
        match self {
            DeadLetterReason::Overflow => "overflow",
            DeadLetterReason::Rejected => "rejected",
            DeadLetterReason::Exhausted => "exhausted",
            DeadLetterReason::Shutdown => "shutdown",
        }
    }
}

#[derive(Serialize)]
struct DeadLetterRecord<'a> {
    recorded_at: DateTime<Utc>,
    sink: &'a str,
    reason: DeadLetterReason,
    detail: Option<&'a str>,
    event: &'a CountEvent,
}

/// Logs every dead-lettered event and optionally appends it as a JSON line.
pub struct DeadLetterJournal {
    file: Option<Mutex<File>>,
    path: Option<PathBuf>,
    recorded: AtomicU64,
}

impl DeadLetterJournal {
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => Some(Mutex::new(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| {
                        format!("failed to open dead-letter journal {}", path.display())
                    })?,
            )),
            None => None,
        };
        Ok(Self {
            file,
            path: path.map(Path::to_path_buf),
            recorded: AtomicU64::new(0),
        })
    }

    pub fn disabled() -> Self {
        Self {
            file: None,
            path: None,
            recorded: AtomicU64::new(0),
        }
    }

    pub fn recorded(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }

    pub fn record(
        &self,
        sink: &str,
        reason: DeadLetterReason,
        detail: Option<&str>,
        event: &CountEvent,
    ) {
        self.recorded.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "dock_dead_letters_total",
            "sink" => sink.to_string(),
            "reason" => reason.label()
        )
        .increment(1);
        warn!(
            sink,
            reason = reason.label(),
            detail = detail.unwrap_or(""),
            event_id = event.id,
            direction = event.direction.label(),
            "event dead-lettered"
        );

        let Some(file) = self.file.as_ref() else {
            return;
        };
        let record = DeadLetterRecord {
            recorded_at: Utc::now(),
            sink,
            reason,
            detail,
            event,
        };
        let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
        let written = serde_json::to_writer(&mut *file, &record)
            .map_err(std::io::Error::from)
            .and_then(|()| file.write_all(b"\n"));
        if let Err(err) = written {
            error!(
                path = ?self.path,
                "failed to append dead-letter record: {err}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Direction, EventMetadata, ObjectClass, TrackId};

    #[test]
    fn test_records_append_json_lines() {
        let path = std::env::temp_dir().join(format!(
            "dockcount-journal-{}-{}.jsonl",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let journal = DeadLetterJournal::open(Some(&path)).unwrap();
        let event = CountEvent {
            id: 42,
            direction: Direction::Outbound,
            timestamp: Utc::now(),
            track_id: TrackId(3),
            class: ObjectClass::Box,
            metadata: EventMetadata::default(),
        };
        journal.record("sheets", DeadLetterReason::Overflow, None, &event);
        journal.record("sheets", DeadLetterReason::Shutdown, Some("grace elapsed"), &event);
        assert_eq!(journal.recorded(), 2);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["reason"], "overflow");
        assert_eq!(lines[1]["event"]["id"], 42);
        let _ = std::fs::remove_file(path);
    }
}
