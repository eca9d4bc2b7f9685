// src/queue/socket.rs
//! Websocket channel transport
//!
//! Speaks the broker's channel protocol: every frame is a JSON envelope of
//! `{topic, event, payload, ref}`. Requests carry a unique `ref`; the broker
//! replies with the same `ref` and a `{status, response}` payload. Frames
//! without a matching `ref` are broker-initiated events (e.g. `run:cancel`)
//! and fan out to subscribers.
//!
//! The connection is not assumed to be stable. When the read loop ends
//! (broker close or read error) the write half is torn down and every
//! awaiting request is failed; the next request redials the broker under
//! the configured backoff before giving up.

use crate::queue::backoff::{try_with_backoff, BackoffOptions};
use crate::utils::errors::{EngineError, Result};
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Wire frame of the channel protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub event: String,

    #[serde(default)]
    pub payload: serde_json::Value,

    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;
type PendingReplies = Arc<DashMap<String, oneshot::Sender<serde_json::Value>>>;

/// `None` while disconnected; refilled by the next request's redial
type WriterSlot = Arc<tokio::sync::Mutex<Option<WsSink>>>;

const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// A broker socket
///
/// Cheap to share behind an `Arc`; requests are serialized on the write
/// half, replies are demultiplexed by `ref`.
pub struct Socket {
    url: String,
    reconnect: BackoffOptions,
    writer: WriterSlot,
    pending: PendingReplies,
    inbound: broadcast::Sender<Envelope>,
    counter: AtomicU64,

    /// Bumped on every dial; a stale watchdog must not tear down a newer
    /// connection
    generation: Arc<AtomicU64>,
}

impl Socket {
    pub async fn connect(url: &str) -> Result<Self> {
        let pending: PendingReplies = Arc::new(DashMap::new());
        let (inbound, _) = broadcast::channel(256);
        let writer: WriterSlot = Arc::new(tokio::sync::Mutex::new(None));
        let generation = Arc::new(AtomicU64::new(0));

        let sink = dial(url, writer.clone(), pending.clone(), inbound.clone(), generation.clone()).await?;
        *writer.lock().await = Some(sink);

        Ok(Self {
            url: url.to_string(),
            reconnect: BackoffOptions::default(),
            writer,
            pending,
            inbound,
            counter: AtomicU64::new(1),
            generation,
        })
    }

    /// Retry policy applied when redialing a dead connection
    pub fn with_reconnect_backoff(mut self, options: BackoffOptions) -> Self {
        self.reconnect = options;
        self
    }

    /// Broker-initiated events (frames without a pending `ref`)
    ///
    /// Subscriptions survive reconnects: the broadcast channel is attached
    /// to every read loop this socket spawns.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.inbound.subscribe()
    }

    /// Send one request frame and await its reply payload
    pub async fn request(
        &self,
        topic: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let reference = self.counter.fetch_add(1, Ordering::SeqCst).to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(reference.clone(), tx);

        let frame = serde_json::to_string(&Envelope {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
            reference: Some(reference.clone()),
        })?;

        if let Err(e) = self.send(Message::Text(frame)).await {
            self.pending.remove(&reference);
            return Err(e);
        }

        let reply = tokio::time::timeout(REPLY_TIMEOUT, rx)
            .await
            .map_err(|_| {
                self.pending.remove(&reference);
                EngineError::Transport(format!("no reply to {} within {:?}", event, REPLY_TIMEOUT))
            })?
            .map_err(|_| EngineError::Transport("connection closed".to_string()))?;

        unwrap_reply(event, reply)
    }

    /// Write one frame, redialing first if the connection is down
    ///
    /// A send failure tears the writer down; the second pass redials before
    /// giving up, so a broker restart between requests costs one redial, not
    /// a dead worker.
    async fn send(&self, message: Message) -> Result<()> {
        for _ in 0..2 {
            let mut slot = self.writer.lock().await;
            if slot.is_none() {
                *slot = Some(try_with_backoff(|_| self.redial(), self.reconnect).await?);
            }
            if let Some(sink) = slot.as_mut() {
                match sink.send(message.clone()).await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        warn!(error = %e, "send failed, tearing the socket down");
                        *slot = None;
                    }
                }
            }
        }
        Err(EngineError::Transport("broker socket unavailable".to_string()))
    }

    async fn redial(&self) -> Result<WsSink> {
        debug!(url = %self.url, "redialing broker");
        dial(
            &self.url,
            self.writer.clone(),
            self.pending.clone(),
            self.inbound.clone(),
            self.generation.clone(),
        )
        .await
    }
}

/// Open a connection and spawn its read loop; the watchdog clears the
/// writer slot when the loop ends so the next request knows to redial.
async fn dial(
    url: &str,
    writer: WriterSlot,
    pending: PendingReplies,
    inbound: broadcast::Sender<Envelope>,
    generation: Arc<AtomicU64>,
) -> Result<WsSink> {
    let (stream, _response) = connect_async(url)
        .await
        .map_err(|e| EngineError::Transport(format!("connect {}: {}", url, e)))?;
    debug!(url, "broker socket connected");

    let dialed = generation.fetch_add(1, Ordering::SeqCst) + 1;
    let (sink, reader) = stream.split();
    tokio::spawn(async move {
        read_loop(reader, pending.clone(), inbound).await;
        let mut slot = writer.lock().await;
        if generation.load(Ordering::SeqCst) == dialed {
            *slot = None;
            // wake every awaiting request with a closed-channel error
            pending.clear();
        }
    });

    Ok(sink)
}

/// Unpack a `{status, response}` reply, surfacing broker-side rejections
fn unwrap_reply(event: &str, reply: serde_json::Value) -> Result<serde_json::Value> {
    match reply.get("status").and_then(|s| s.as_str()) {
        Some("ok") => Ok(reply.get("response").cloned().unwrap_or(serde_json::Value::Null)),
        Some(status) => Err(EngineError::Protocol(format!(
            "broker rejected {}: {} {}",
            event,
            status,
            reply.get("response").cloned().unwrap_or_default()
        ))),
        None => Ok(reply),
    }
}

async fn read_loop(mut reader: WsSource, pending: PendingReplies, inbound: broadcast::Sender<Envelope>) {
    while let Some(message) = reader.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<Envelope>(&text) {
                Ok(envelope) => {
                    if let Some(reference) = envelope.reference.as_deref() {
                        if let Some((_, tx)) = pending.remove(reference) {
                            let _ = tx.send(envelope.payload);
                            continue;
                        }
                    }
                    // no subscriber is fine; events are best effort
                    let _ = inbound.send(envelope);
                }
                Err(e) => warn!(error = %e, "unparseable frame from broker"),
            },
            Ok(Message::Close(_)) => {
                debug!("broker closed the socket");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "broker socket read failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = Envelope {
            topic: "run:abc".to_string(),
            event: "fetch:plan".to_string(),
            payload: json!({}),
            reference: Some("7".to_string()),
        };
        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(wire["topic"], json!("run:abc"));
        assert_eq!(wire["ref"], json!("7"));

        let parsed: Envelope = serde_json::from_value(wire).unwrap();
        assert_eq!(parsed.reference.as_deref(), Some("7"));
    }

    #[test]
    fn test_reply_unwrapping() {
        let ok = json!({"status": "ok", "response": {"runs": []}});
        assert_eq!(unwrap_reply("claim", ok).unwrap(), json!({"runs": []}));

        let rejected = json!({"status": "error", "response": "unauthorized"});
        assert!(matches!(
            unwrap_reply("claim", rejected),
            Err(EngineError::Protocol(_))
        ));

        // bare payloads pass through unchanged
        let bare = json!({"plan": {}});
        assert_eq!(unwrap_reply("fetch:plan", bare.clone()).unwrap(), bare);
    }

    /// Echo server that drops its first connection, then answers one
    /// request on the second
    async fn flaky_broker() -> (String, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            drop(ws);

            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                if let Message::Text(text) = message {
                    let request: Envelope = serde_json::from_str(&text).unwrap();
                    let reply = Envelope {
                        topic: request.topic,
                        event: "phx_reply".to_string(),
                        payload: json!({"status": "ok", "response": {"pong": true}}),
                        reference: request.reference,
                    };
                    ws.send(Message::Text(serde_json::to_string(&reply).unwrap()))
                        .await
                        .unwrap();
                    break;
                }
            }
        });

        (url, server)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_request_redials_after_broker_drop() {
        let (url, server) = flaky_broker().await;

        let socket = Socket::connect(&url)
            .await
            .unwrap()
            .with_reconnect_backoff(BackoffOptions {
                max_attempts: 5,
                min: Duration::from_millis(10),
                max: Duration::from_millis(50),
            });

        // let the watchdog notice the dropped connection
        tokio::time::sleep(Duration::from_millis(100)).await;

        let reply = socket.request("worker:queue", "ping", json!({})).await.unwrap();
        assert_eq!(reply, json!({"pong": true}));
        server.await.unwrap();
    }
}
