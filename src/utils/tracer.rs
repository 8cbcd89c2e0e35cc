//! Process-wide frame tracer.
//!
//! When enabled, every frame crossing any channel is appended to a file as
//! one JSON line. Toggling never affects protocol state.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use lazy_static::lazy_static;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::codec::FrameTag;

lazy_static! {
    static ref TRACER: Mutex<Option<BufWriter<File>>> = Mutex::new(None);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Serialize)]
struct TraceRecord {
    ts_ms: u128,
    direction: Direction,
    tag: &'static str,
    len: usize,
}

/// Start appending frame records to `path`
pub fn enable_tracer(path: impl AsRef<Path>) -> std::io::Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path.as_ref())?;
    let previous = TRACER.lock().replace(BufWriter::new(file));
    if let Some(mut previous) = previous {
        let _ = previous.flush();
    }
    Ok(())
}

/// Stop tracing and flush what was recorded
pub fn disable_tracer() {
    if let Some(mut writer) = TRACER.lock().take() {
        if let Err(e) = writer.flush() {
            warn!("Failed to flush frame trace: {}", e);
        }
    }
}

pub fn tracer_enabled() -> bool {
    TRACER.lock().is_some()
}

pub(crate) fn record(direction: Direction, tag: FrameTag, len: usize) {
    let mut guard = TRACER.lock();
    let Some(writer) = guard.as_mut() else {
        return;
    };

    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let record = TraceRecord {
        ts_ms,
        direction,
        tag: tag.as_str(),
        len,
    };

    let result = serde_json::to_writer(&mut *writer, &record)
        .map_err(std::io::Error::from)
        .and_then(|_| writer.write_all(b"\n"))
        .and_then(|_| writer.flush());
    if let Err(e) = result {
        warn!("Failed to write frame trace: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracer_toggle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.jsonl");

        enable_tracer(&path).unwrap();
        assert!(tracer_enabled());
        record(Direction::Send, FrameTag::Request, 42);
        record(Direction::Receive, FrameTag::Ack, 5);
        disable_tracer();
        assert!(!tracer_enabled());
        record(Direction::Send, FrameTag::CacheSaveRequest, 1234567);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        // Other tests may trace concurrently through the global tracer
        assert!(lines
            .iter()
            .any(|l| l["direction"] == "send" && l["tag"] == "REQUEST" && l["len"] == 42));
        assert!(lines.iter().any(|l| l["direction"] == "receive" && l["tag"] == "ACK"));
        assert!(!lines.iter().any(|l| l["len"] == 1234567));
    }
}
