use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Diagnostic channel threaded through every pipeline stage.
///
/// Each event is one JSON object:
/// - default fields are `type`, `run_id`, `ts`
/// - caller payload is merged last and can override defaults
/// - the object is fanned out to every sink (JSONL file, in-process channel)
///
/// A writer with no sinks is valid and drops events.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    run_id: String,
    sinks: Vec<EventSink>,
    lock: Mutex<()>,
}

#[derive(Debug)]
enum EventSink {
    Jsonl(PathBuf),
    Channel(Mutex<Sender<Value>>),
}

impl EventWriter {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self::with_sinks(run_id.into(), Vec::new())
    }

    pub fn jsonl(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self::with_sinks(run_id.into(), vec![EventSink::Jsonl(path.into())])
    }

    /// Writer whose events are delivered to the returned receiver.
    pub fn channel(run_id: impl Into<String>) -> (Self, Receiver<Value>) {
        let (tx, rx) = mpsc::channel();
        (
            Self::with_sinks(run_id.into(), vec![EventSink::Channel(Mutex::new(tx))]),
            rx,
        )
    }

    /// JSONL file plus channel, used by the CLI to mirror progress.
    pub fn jsonl_with_channel(
        path: impl Into<PathBuf>,
        run_id: impl Into<String>,
    ) -> (Self, Receiver<Value>) {
        let (tx, rx) = mpsc::channel();
        (
            Self::with_sinks(
                run_id.into(),
                vec![
                    EventSink::Jsonl(path.into()),
                    EventSink::Channel(Mutex::new(tx)),
                ],
            ),
            rx,
        )
    }

    fn with_sinks(run_id: String, sinks: Vec<EventSink>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                run_id,
                sinks,
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "run_id".to_string(),
            Value::String(self.inner.run_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }
        let event = Value::Object(event);

        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        for sink in &self.inner.sinks {
            match sink {
                EventSink::Jsonl(path) => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    let line = serde_json::to_string(&event)?;
                    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
                    file.write_all(line.as_bytes())?;
                    file.write_all(b"\n")?;
                }
                EventSink::Channel(sender) => {
                    let sender = sender
                        .lock()
                        .map_err(|_| anyhow::anyhow!("event channel lock poisoned"))?;
                    // A dropped receiver only means nobody is listening.
                    let _ = sender.send(event.clone());
                }
            }
        }

        Ok(event)
    }

    /// Emit without failing the caller. Stages use this on hot paths where a
    /// diagnostic write error must not change pipeline behaviour.
    pub fn note(&self, event_type: &str, payload: EventPayload) {
        let _ = self.emit(event_type, payload);
    }
}

/// Collects the `type` field of every event currently queued on `rx`.
pub fn drain_types(rx: &Receiver<Value>) -> Vec<String> {
    rx.try_iter()
        .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
        .collect()
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;
    use serde_json::json;

    use super::*;

    #[test]
    fn emit_writes_compact_jsonl_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::jsonl(&path, "run-123");

        let mut payload = EventPayload::new();
        payload.insert("stage".to_string(), json!("router"));
        let emitted = writer.emit("stage_started", payload)?;

        let content = fs::read_to_string(&path)?;
        let line = content.lines().next().unwrap_or("");
        let parsed: Value = serde_json::from_str(line)?;

        assert_eq!(parsed, emitted);
        assert_eq!(parsed["type"], json!("stage_started"));
        assert_eq!(parsed["run_id"], json!("run-123"));
        assert_eq!(parsed["stage"], json!("router"));

        let ts = parsed["ts"].as_str().unwrap_or("");
        DateTime::parse_from_rfc3339(ts)?;
        Ok(())
    }

    #[test]
    fn channel_sink_delivers_events_in_order() -> anyhow::Result<()> {
        let (writer, rx) = EventWriter::channel("run-abc");
        writer.emit("one", EventPayload::new())?;
        writer.clone().emit("two", EventPayload::new())?;

        assert_eq!(drain_types(&rx), vec!["one", "two"]);
        Ok(())
    }

    #[test]
    fn payload_can_override_default_keys() -> anyhow::Result<()> {
        let writer = EventWriter::new("run-123");
        let mut payload = EventPayload::new();
        payload.insert("run_id".to_string(), json!("override-run"));
        let emitted = writer.emit("run_started", payload)?;
        assert_eq!(emitted["run_id"], json!("override-run"));
        Ok(())
    }

    #[test]
    fn dropped_receiver_does_not_fail_emit() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("events.jsonl");
        let (writer, rx) = EventWriter::jsonl_with_channel(&path, "run-1");
        drop(rx);
        writer.emit("still_written", EventPayload::new())?;
        assert_eq!(fs::read_to_string(path)?.lines().count(), 1);
        Ok(())
    }
}
