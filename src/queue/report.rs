// src/queue/report.rs
//! Per-run report channel
//!
//! All progress for one run (step events, log batches, the final
//! run-complete) flows through a single reporter task, so reports reach the
//! broker in emission order with at most one send in flight. Sends retry
//! with backoff; a report that exhausts its budget is logged and dropped
//! rather than wedging the queue.

use crate::queue::backoff::{try_with_backoff, BackoffOptions};
use crate::queue::client::BrokerTransport;
use crate::utils::errors::{EngineError, Result};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct Report {
    event: String,
    payload: serde_json::Value,
}

enum Command {
    Send(Report),
    Shutdown,
}

/// Cloneable enqueue side of a reporter, for sinks that outlive the caller's
/// borrow (e.g. the log batcher's flush timer)
#[derive(Clone)]
pub struct ReporterHandle {
    tx: UnboundedSender<Command>,
}

impl ReporterHandle {
    pub fn enqueue(&self, event: &str, payload: serde_json::Value) -> Result<()> {
        self.tx
            .send(Command::Send(Report {
                event: event.to_string(),
                payload,
            }))
            .map_err(|_| EngineError::Transport("reporter closed".to_string()))
    }
}

pub struct Reporter {
    tx: UnboundedSender<Command>,
    worker: JoinHandle<()>,
}

impl Reporter {
    pub fn new(transport: Arc<dyn BrokerTransport>, topic: String, backoff: BackoffOptions) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();

        let worker = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                let report = match command {
                    Command::Send(report) => report,
                    Command::Shutdown => break,
                };

                let result = try_with_backoff(
                    |_attempt| transport.push(&topic, &report.event, report.payload.clone()),
                    backoff,
                )
                .await;

                match result {
                    Ok(_) => debug!(topic = %topic, event = %report.event, "report delivered"),
                    Err(e) => {
                        warn!(topic = %topic, event = %report.event, error = %e, "report dropped")
                    }
                }
            }
        });

        Self { tx, worker }
    }

    /// Queue one report; delivery order matches enqueue order
    pub fn enqueue(&self, event: &str, payload: serde_json::Value) -> Result<()> {
        self.handle().enqueue(event, payload)
    }

    pub fn handle(&self) -> ReporterHandle {
        ReporterHandle { tx: self.tx.clone() }
    }

    /// Deliver everything queued so far, then stop the reporter task
    ///
    /// Handles still alive can keep enqueueing without error, but nothing
    /// sent after close reaches the broker.
    pub async fn close(self) {
        let _ = self.tx.send(Command::Shutdown);
        let _ = self.worker.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::socket::Envelope;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::broadcast;

    struct FlakyTransport {
        sent: Mutex<Vec<String>>,
        failures_left: AtomicU32,
        inbound: broadcast::Sender<Envelope>,
    }

    impl FlakyTransport {
        fn new(failures: u32) -> Self {
            let (inbound, _) = broadcast::channel(8);
            Self {
                sent: Mutex::new(Vec::new()),
                failures_left: AtomicU32::new(failures),
                inbound,
            }
        }
    }

    #[async_trait]
    impl BrokerTransport for FlakyTransport {
        async fn join(&self, _topic: &str, _payload: serde_json::Value) -> Result<serde_json::Value> {
            Ok(json!({}))
        }

        async fn leave(&self, _topic: &str) -> Result<()> {
            Ok(())
        }

        async fn push(
            &self,
            _topic: &str,
            event: &str,
            _payload: serde_json::Value,
        ) -> Result<serde_json::Value> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(EngineError::Transport("flaky".to_string()));
            }
            self.sent.lock().push(event.to_string());
            Ok(json!({}))
        }

        fn subscribe(&self) -> broadcast::Receiver<Envelope> {
            self.inbound.subscribe()
        }
    }

    fn fast_backoff() -> BackoffOptions {
        BackoffOptions {
            max_attempts: 3,
            min: std::time::Duration::from_millis(1),
            max: std::time::Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_reports_arrive_in_order() {
        let transport = Arc::new(FlakyTransport::new(0));
        let reporter = Reporter::new(transport.clone(), "run:1".to_string(), fast_backoff());

        reporter.enqueue("run:start", json!({})).unwrap();
        reporter.enqueue("step:start", json!({"step_id": "a"})).unwrap();
        reporter.enqueue("run:complete", json!({})).unwrap();
        reporter.close().await;

        assert_eq!(
            *transport.sent.lock(),
            vec!["run:start", "step:start", "run:complete"]
        );
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let transport = Arc::new(FlakyTransport::new(2));
        let reporter = Reporter::new(transport.clone(), "run:1".to_string(), fast_backoff());

        reporter.enqueue("run:start", json!({})).unwrap();
        reporter.close().await;

        assert_eq!(*transport.sent.lock(), vec!["run:start"]);
    }

    #[tokio::test]
    async fn test_exhausted_report_is_dropped_not_blocking() {
        // 3 failures eat the whole budget for the first report
        let transport = Arc::new(FlakyTransport::new(3));
        let reporter = Reporter::new(transport.clone(), "run:1".to_string(), fast_backoff());

        reporter.enqueue("run:start", json!({})).unwrap();
        reporter.enqueue("run:complete", json!({})).unwrap();
        reporter.close().await;

        // the second report still made it out
        assert_eq!(*transport.sent.lock(), vec!["run:complete"]);
    }

    #[tokio::test]
    async fn test_handle_enqueues_through_the_same_queue() {
        let transport = Arc::new(FlakyTransport::new(0));
        let reporter = Reporter::new(transport.clone(), "run:1".to_string(), fast_backoff());

        let handle = reporter.handle();
        reporter.enqueue("run:start", json!({})).unwrap();
        handle.enqueue("run:log", json!({"logs": []})).unwrap();
        reporter.close().await;

        assert_eq!(*transport.sent.lock(), vec!["run:start", "run:log"]);
    }
}
