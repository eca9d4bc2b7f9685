// src/queue/client.rs
//! Broker queue client
//!
//! Typed operations over the channel transport: claiming runs from the
//! shared queue, fetching run materials, and reporting lifecycle progress.
//! The transport itself is a trait so orchestration logic tests against an
//! in-memory broker.

use crate::model::plan::ExecutionPlan;
use crate::queue::socket::{Envelope, Socket};
use crate::utils::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Topic every worker claims from
pub const QUEUE_TOPIC: &str = "worker:queue";

#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn join(&self, topic: &str, payload: serde_json::Value) -> Result<serde_json::Value>;

    async fn leave(&self, topic: &str) -> Result<()>;

    async fn push(
        &self,
        topic: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value>;

    /// Broker-initiated events (cancellation etc.)
    fn subscribe(&self) -> broadcast::Receiver<Envelope>;
}

#[async_trait]
impl BrokerTransport for Socket {
    async fn join(&self, topic: &str, payload: serde_json::Value) -> Result<serde_json::Value> {
        self.request(topic, "phx_join", payload).await
    }

    async fn leave(&self, topic: &str) -> Result<()> {
        self.request(topic, "phx_leave", json!({})).await?;
        Ok(())
    }

    async fn push(
        &self,
        topic: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.request(topic, event, payload).await
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        Socket::subscribe(self)
    }
}

/// One run handed out by a claim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimedRun {
    pub id: String,

    /// Run-scoped join token
    pub token: String,
}

/// Materials returned by `fetch:plan`
#[derive(Debug, Clone, Deserialize)]
pub struct RunMaterials {
    pub plan: ExecutionPlan,

    /// Dataclip seeding the initial state, fetched separately
    #[serde(default)]
    pub starting_dataclip_id: Option<String>,
}

pub struct QueueClient {
    transport: Arc<dyn BrokerTransport>,
    worker_token: String,

    /// Stable identity for this worker process, minted at startup
    worker_id: String,
}

impl QueueClient {
    pub fn new(transport: Arc<dyn BrokerTransport>, worker_token: &str) -> Self {
        Self {
            transport,
            worker_token: worker_token.to_string(),
            worker_id: ulid::Ulid::new().to_string(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn transport(&self) -> Arc<dyn BrokerTransport> {
        self.transport.clone()
    }

    pub fn run_topic(run_id: &str) -> String {
        format!("run:{}", run_id)
    }

    /// Join the shared claim queue
    pub async fn join_queue(&self) -> Result<()> {
        self.transport
            .join(
                QUEUE_TOPIC,
                json!({ "token": self.worker_token, "worker_id": self.worker_id }),
            )
            .await?;
        Ok(())
    }

    /// Ask the broker for up to `demand` runs
    pub async fn claim(&self, demand: usize) -> Result<Vec<ClaimedRun>> {
        if demand == 0 {
            return Ok(Vec::new());
        }
        let reply = self
            .transport
            .push(QUEUE_TOPIC, "claim", json!({ "demand": demand }))
            .await?;
        let runs: Vec<ClaimedRun> =
            serde_json::from_value(reply.get("runs").cloned().unwrap_or(json!([])))?;
        if !runs.is_empty() {
            debug!(count = runs.len(), "claimed runs");
        }
        Ok(runs)
    }

    /// Join a claimed run's private topic
    pub async fn join_run(&self, run: &ClaimedRun) -> Result<()> {
        self.transport
            .join(&Self::run_topic(&run.id), json!({ "token": run.token }))
            .await?;
        Ok(())
    }

    pub async fn leave_run(&self, run_id: &str) -> Result<()> {
        self.transport.leave(&Self::run_topic(run_id)).await
    }

    pub async fn fetch_plan(&self, run_id: &str) -> Result<RunMaterials> {
        let reply = self
            .transport
            .push(&Self::run_topic(run_id), "fetch:plan", json!({}))
            .await?;
        Ok(serde_json::from_value(reply)?)
    }

    pub async fn fetch_credential(
        &self,
        run_id: &str,
        credential_id: &str,
    ) -> Result<serde_json::Value> {
        self.transport
            .push(
                &Self::run_topic(run_id),
                "fetch:credential",
                json!({ "id": credential_id }),
            )
            .await
    }

    pub async fn fetch_dataclip(&self, run_id: &str, dataclip_id: &str) -> Result<serde_json::Value> {
        self.transport
            .push(
                &Self::run_topic(run_id),
                "fetch:dataclip",
                json!({ "id": dataclip_id }),
            )
            .await
    }
}
