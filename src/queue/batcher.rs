// src/queue/batcher.rs
//! Log batching
//!
//! Guest log lines are chatty; sending one broker message per line would
//! swamp the channel. The batcher buffers lines and flushes the whole buffer
//! once a short window after the first buffered line elapses. Batches
//! preserve arrival order, and `flush` drains whatever is left when a run
//! settles.

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One attributed guest log line, ready for the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLogEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,

    pub level: String,
    pub message: serde_json::Value,

    /// Milliseconds since the epoch, assigned at buffering time
    pub timestamp: i64,
}

impl RunLogEntry {
    pub fn new(step_id: Option<String>, level: &str, message: serde_json::Value) -> Self {
        Self {
            step_id,
            level: level.to_string(),
            message,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

type BatchSink = Arc<dyn Fn(Vec<RunLogEntry>) + Send + Sync>;

/// Window-based batcher feeding a synchronous sink
///
/// The sink runs under the buffer lock, so it must be cheap; handing the
/// batch to a report channel qualifies.
pub struct LogBatcher {
    window: Duration,
    buffer: Arc<Mutex<Vec<RunLogEntry>>>,
    armed: Arc<AtomicBool>,
    sink: BatchSink,
}

impl LogBatcher {
    pub fn new(window: Duration, sink: impl Fn(Vec<RunLogEntry>) + Send + Sync + 'static) -> Self {
        Self {
            window,
            buffer: Arc::new(Mutex::new(Vec::new())),
            armed: Arc::new(AtomicBool::new(false)),
            sink: Arc::new(sink),
        }
    }

    /// Buffer a line; the first line of an idle batcher arms the flush timer
    pub fn push(&self, entry: RunLogEntry) {
        self.buffer.lock().push(entry);

        if !self.armed.swap(true, Ordering::SeqCst) {
            let window = self.window;
            let buffer = self.buffer.clone();
            let armed = self.armed.clone();
            let sink = self.sink.clone();
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                drain(&buffer, &armed, &sink);
            });
        }
    }

    /// Flush whatever is buffered right now, disarming any pending timer's
    /// batch (the timer then finds an empty buffer)
    pub fn flush(&self) {
        drain(&self.buffer, &self.armed, &self.sink);
    }
}

fn drain(buffer: &Mutex<Vec<RunLogEntry>>, armed: &AtomicBool, sink: &BatchSink) {
    let mut buf = buffer.lock();
    armed.store(false, Ordering::SeqCst);
    if buf.is_empty() {
        return;
    }
    let batch = std::mem::take(&mut *buf);
    (sink)(batch);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn collector() -> (Arc<Mutex<Vec<Vec<RunLogEntry>>>>, impl Fn(Vec<RunLogEntry>) + Send + Sync) {
        let batches: Arc<Mutex<Vec<Vec<RunLogEntry>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_batches = batches.clone();
        (batches, move |batch| sink_batches.lock().push(batch))
    }

    fn entry(message: &str) -> RunLogEntry {
        RunLogEntry::new(Some("step-1".to_string()), "info", json!(message))
    }

    #[tokio::test(start_paused = true)]
    async fn test_lines_within_window_share_one_batch() {
        let (batches, sink) = collector();
        let batcher = LogBatcher::new(Duration::from_millis(10), sink);

        batcher.push(entry("a"));
        batcher.push(entry("b"));
        batcher.push(entry("c"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let batches = batches.lock();
        assert_eq!(batches.len(), 1);
        let messages: Vec<&serde_json::Value> = batches[0].iter().map(|e| &e.message).collect();
        assert_eq!(messages, vec![&json!("a"), &json!("b"), &json!("c")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_flush_in_arrival_order() {
        let (batches, sink) = collector();
        let batcher = LogBatcher::new(Duration::from_millis(10), sink);

        batcher.push(entry("a"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        batcher.push(entry("b"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let batches = batches.lock();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0][0].message, json!("a"));
        assert_eq!(batches[1][0].message, json!("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_drains_pending_lines_immediately() {
        let (batches, sink) = collector();
        let batcher = LogBatcher::new(Duration::from_secs(60), sink);

        batcher.push(entry("tail"));
        batcher.flush();

        assert_eq!(batches.lock().len(), 1);

        // the disarmed timer finds nothing to send
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(batches.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_flush_sends_nothing() {
        let (batches, sink) = collector();
        let batcher = LogBatcher::new(Duration::from_millis(10), sink);
        batcher.flush();
        assert!(batches.lock().is_empty());
    }
}
