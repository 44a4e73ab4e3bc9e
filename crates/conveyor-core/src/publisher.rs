//! Event publishers for lifecycle envelopes.
//!
//! Publication is fire-and-forget: failures are logged and never
//! propagate back into the pipeline runtime, so an event-subsystem
//! outage cannot fail jobs.

use async_trait::async_trait;
use conveyor_job::EventEnvelope;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Fire-and-forget publication of lifecycle events onto named channels.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, channel: &str, event: &EventEnvelope);
}

/// Publisher that only logs envelopes. The default when no pub/sub
/// backend is configured.
pub struct LogPublisher;

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn publish(&self, channel: &str, event: &EventEnvelope) {
        debug!(
            channel,
            event_type = event.event_type.as_str(),
            execution_id = event.execution_id,
            job = %event.job_name,
            "lifecycle event"
        );
    }
}

/// In-process publisher backed by a tokio broadcast channel; used by
/// tests and embedded subscribers.
pub struct BroadcastPublisher {
    sender: broadcast::Sender<(String, EventEnvelope)>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(String, EventEnvelope)> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventPublisher for BroadcastPublisher {
    async fn publish(&self, channel: &str, event: &EventEnvelope) {
        // Send fails only when no subscriber exists, which is fine for
        // fire-and-forget delivery.
        let _ = self.sender.send((channel.to_string(), event.clone()));
    }
}

/// Publisher speaking the Upstash-style Redis REST protocol: each
/// `PUBLISH` is a POST of `["PUBLISH", channel, payload]`.
pub struct RedisPublisher {
    url: String,
    token: String,
    client: reqwest::Client,
}

impl RedisPublisher {
    pub fn new(url: impl Into<String>, token: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            client,
        }
    }

    async fn execute(&self, command: Vec<Value>) -> Result<(), reqwest::Error> {
        self.client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.token))
            .json(&command)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl EventPublisher for RedisPublisher {
    async fn publish(&self, channel: &str, event: &EventEnvelope) {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(channel, error = %e, "failed to serialize event envelope");
                return;
            }
        };

        let command = vec![
            Value::String("PUBLISH".to_string()),
            Value::String(channel.to_string()),
            Value::String(payload),
        ];
        if let Err(e) = self.execute(command).await {
            warn!(
                channel,
                execution_id = event.execution_id,
                error = %e,
                "event publication failed"
            );
        }
    }
}
