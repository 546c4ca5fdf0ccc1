//! Per-node append-only operation history (spec.md §6 "History log").
//!
//! Enabled sessions write one JSONL record per persistent-node operation to
//! `<history_base_dir>/<server>/<session>/<node>.jsonl`. Records are append-only
//! and monotonically sequenced per node (spec.md §8 invariant: `seq` never
//! repeats or goes backwards for a given node file).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;

/// Operation kind recorded in a history line (spec.md §6).
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOp {
    Send,
    SendStream,
    Write,
    Run,
    Read,
    Interrupt,
    Delete,
}

#[derive(Debug, Serialize)]
pub struct HistoryRecord {
    pub seq: u64,
    pub ts_start_ms: u128,
    pub ts_end_ms: u128,
    pub op: HistoryOp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lines: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preceding_buffer_seq: Option<usize>,
}

/// Writes append-only JSONL history for one node, truncating long text fields
/// before serialization (original_source `_truncate_messages`, carried per
/// SPEC_FULL.md §C.5) so a long-running conversation does not bloat the file.
pub struct HistoryLogger {
    path: PathBuf,
    seq: AtomicU64,
    max_field_chars: usize,
}

impl HistoryLogger {
    pub fn new(base_dir: &Path, server: &str, session: &str, node: &str) -> std::io::Result<Self> {
        let dir = base_dir.join(server).join(session);
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            path: dir.join(format!("{node}.jsonl")),
            seq: AtomicU64::new(0),
            max_field_chars: 4000,
        })
    }

    pub fn with_max_field_chars(mut self, max: usize) -> Self {
        self.max_field_chars = max;
        self
    }

    /// Truncates `s` to `max_field_chars`, appending a marker when it had to cut.
    pub fn truncate(&self, s: &str) -> String {
        if s.chars().count() <= self.max_field_chars {
            return s.to_string();
        }
        let head: String = s.chars().take(self.max_field_chars).collect();
        format!("{head}... [truncated]")
    }

    /// Recursively truncates string leaves of a JSON value, matching
    /// `truncate` for the scalar case (original_source `_truncate_messages`,
    /// SPEC_FULL.md §C.5) so a large `response` cannot bloat the file either.
    fn truncate_value(&self, value: Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.truncate(&s)),
            Value::Array(items) => Value::Array(items.into_iter().map(|v| self.truncate_value(v)).collect()),
            Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, self.truncate_value(v))).collect()),
            other => other,
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Appends one record, assigning the next sequence number.
    pub async fn append(
        &self,
        op: HistoryOp,
        ts_start_ms: u128,
        ts_end_ms: u128,
        input: Option<String>,
        response: Option<Value>,
        lines: Option<usize>,
        preceding_buffer_seq: Option<usize>,
    ) -> std::io::Result<u64> {
        let seq = self.next_seq();
        let record = HistoryRecord {
            seq,
            ts_start_ms,
            ts_end_ms,
            op,
            input: input.map(|s| self.truncate(&s)),
            response: response.map(|v| self.truncate_value(v)),
            lines,
            preceding_buffer_seq,
        };
        let line = serde_json::to_string(&record).unwrap_or_else(|_| "{}".to_string());
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_marks_long_fields() {
        let dir = tempfile::tempdir().unwrap();
        let logger = HistoryLogger::new(dir.path(), "srv", "sess", "node").unwrap().with_max_field_chars(5);
        let out = logger.truncate("hello world");
        assert!(out.starts_with("hello"));
        assert!(out.ends_with("[truncated]"));
    }

    #[test]
    fn short_fields_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let logger = HistoryLogger::new(dir.path(), "srv", "sess", "node").unwrap();
        assert_eq!(logger.truncate("hi"), "hi");
    }

    #[test]
    fn response_string_fields_are_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let logger = HistoryLogger::new(dir.path(), "srv", "sess", "node").unwrap().with_max_field_chars(5);
        let response = serde_json::json!({"content": "hello world", "usage": {"tokens": 42}});
        let truncated = logger.truncate_value(response);
        assert_eq!(truncated["content"], serde_json::json!("hello... [truncated]"));
        assert_eq!(truncated["usage"]["tokens"], serde_json::json!(42));
    }

    #[tokio::test]
    async fn append_writes_monotonic_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let logger = HistoryLogger::new(dir.path(), "srv", "sess", "node").unwrap();
        let s1 = logger.append(HistoryOp::Send, 0, 1, Some("a".into()), None, None, None).await.unwrap();
        let s2 = logger.append(HistoryOp::Send, 1, 2, Some("b".into()), None, None, None).await.unwrap();
        assert_eq!(s1, 0);
        assert_eq!(s2, 1);
        let contents = std::fs::read_to_string(dir.path().join("srv/sess/node.jsonl")).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
