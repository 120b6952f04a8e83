use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type TracePayload = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StageStatus {
    Pass,
    Fail,
    Skip,
}

/// One pipeline stage as recorded in diagnostics: ordinal, human name,
/// outcome, elapsed time, and a small structured data payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: u32,
    pub name: String,
    pub status: StageStatus,
    pub time_ms: u64,
    #[serde(default)]
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptSummary {
    pub attempt_index: u32,
    pub accepted: bool,
    pub score: u32,
    pub failure_class: Option<String>,
    pub candidate_path: String,
}

/// Caller-facing diagnostics returned with the final image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub prompt_used: String,
    pub stages: Vec<StageRecord>,
    pub attempts: Vec<AttemptSummary>,
    pub warnings: Vec<String>,
    pub identity_lock_applied: bool,
    pub total_time_ms: u64,
}

impl Diagnostics {
    pub fn push_warning(&mut self, message: impl Into<String>) {
        let message = message.into();
        if message.trim().is_empty() {
            return;
        }
        if self.warnings.iter().any(|existing| existing == &message) {
            return;
        }
        self.warnings.push(message);
    }
}

/// Append-only writer for `trace.jsonl`.
///
/// Default fields are `type`, `request_id`, `ts`; the caller payload is
/// merged last and can override them. One compact JSON object per line.
#[derive(Debug, Clone)]
pub struct TraceWriter {
    inner: Arc<TraceWriterInner>,
}

#[derive(Debug)]
struct TraceWriterInner {
    path: PathBuf,
    request_id: String,
    lock: Mutex<()>,
}

impl TraceWriter {
    pub fn new(path: impl Into<PathBuf>, request_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TraceWriterInner {
                path: path.into(),
                request_id: request_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn request_id(&self) -> &str {
        &self.inner.request_id
    }

    pub fn emit(&self, event_type: &str, payload: TracePayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "request_id".to_string(),
            Value::String(self.inner.request_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("trace writer lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }

    /// Emit a stage record both into the trace and back to the caller.
    pub fn emit_stage(&self, record: &StageRecord) -> anyhow::Result<()> {
        let payload = serde_json::to_value(record)?
            .as_object()
            .cloned()
            .unwrap_or_default();
        self.emit("stage", payload)?;
        Ok(())
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
