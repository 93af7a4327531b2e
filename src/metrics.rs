//! ndjson metrics sink (spec §6: metrics are newline-delimited JSON records
//! `{ts, name, value, tags}` appended to `metrics_log_path`).
//!
//! Grounded on the teacher's `metrics-exporter-prometheus` usage in intent
//! (a side-channel observability surface kept separate from the app log)
//! but rendered as appendable ndjson per the spec's external interface,
//! which names no scrape endpoint.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Serialize)]
struct MetricRecord<'a> {
    ts: i64,
    name: &'a str,
    value: f64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    tags: BTreeMap<&'a str, String>,
}

pub struct MetricsSink {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl MetricsSink {
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Emit one metric record with the given tags. Failures to write are
    /// logged, never propagated — metrics must never take down the pipeline.
    pub fn emit(&self, now_ms: i64, name: &str, value: f64, tags: &[(&str, &str)]) {
        let record = MetricRecord {
            ts: now_ms,
            name,
            value,
            tags: tags.iter().map(|(k, v)| (*k, v.to_string())).collect(),
        };
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize metric");
                return;
            }
        };
        let mut file = match self.file.lock() {
            Ok(file) => file,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(file, "{line}") {
            tracing::warn!(error = %e, "failed to write metric");
        }
    }

    pub fn heartbeat(&self, now_ms: i64) {
        self.emit(now_ms, "heartbeat", 1.0, &[]);
    }

    pub fn cursor_lag_ms(&self, now_ms: i64, lag_ms: i64) {
        self.emit(now_ms, "cursor_lag_ms", lag_ms as f64, &[]);
    }

    pub fn ingest_events_admitted(&self, now_ms: i64, count: usize) {
        self.emit(now_ms, "ingest_events_admitted", count as f64, &[]);
    }

    pub fn decision_reject(&self, now_ms: i64, reason: &str) {
        self.emit(now_ms, "decision_rejects_total", 1.0, &[("reason", reason)]);
    }

    pub fn execution_retry_budget_exhausted(&self, now_ms: i64, correlation_id: &str) {
        self.emit(now_ms, "execution_retry_budget_exhausted_total", 1.0, &[("correlation_id", correlation_id)]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;

    #[test]
    fn emits_one_ndjson_line_per_call() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.ndjson");
        let sink = MetricsSink::open(&path).unwrap();
        sink.emit(1_000, "test_metric", 42.0, &[("symbol", "BTC")]);
        sink.heartbeat(1_001);

        let contents = std::fs::read(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(&lines[0].as_ref().unwrap()).unwrap();
        assert_eq!(first["name"], "test_metric");
        assert_eq!(first["tags"]["symbol"], "BTC");
    }
}
