//! Event delivery: module `emit` syscalls and run lifecycle notifications
//!
//! Events go to an [`EventSink`]: the HTTP event bus when one is configured,
//! otherwise the log. Lifecycle delivery failures are logged and never fail
//! the run.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::EventsConfig;
use crate::utils::{current_timestamp_millis, log_error_async};

/// Lifecycle notification kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    #[serde(rename = "run.started")]
    Started,
    #[serde(rename = "run.finished")]
    Finished,
    /// Covers the error, denied and timeout terminal states
    #[serde(rename = "run.error")]
    Error,
}

impl LifecycleEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEvent::Started => "run.started",
            LifecycleEvent::Finished => "run.finished",
            LifecycleEvent::Error => "run.error",
        }
    }
}

/// Envelope for everything published to the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// `run.started`, `run.finished`, `run.error` or `module.event`
    #[serde(rename = "type")]
    pub event_type: String,
    pub run_id: String,
    pub principal: String,
    pub timestamp_ms: u64,
    pub payload: Value,
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("event delivery failed: {0}")]
    Delivery(String),
    #[error("event bus returned status {0}")]
    Status(u16),
    #[error("event sink closed")]
    Closed,
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: EventEnvelope) -> Result<(), EventError>;
}

/// Writes events to the log only
pub struct LogEventSink;

#[async_trait]
impl EventSink for LogEventSink {
    async fn publish(&self, event: EventEnvelope) -> Result<(), EventError> {
        info!(
            "event {} run={} principal={} payload={}",
            event.event_type, event.run_id, event.principal, event.payload
        );
        Ok(())
    }
}

/// POSTs events to the bus as JSON
pub struct HttpEventSink {
    client: reqwest::Client,
    url: String,
}

impl HttpEventSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, EventError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EventError::Delivery(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl EventSink for HttpEventSink {
    async fn publish(&self, event: EventEnvelope) -> Result<(), EventError> {
        let response = self
            .client
            .post(&self.url)
            .json(&event)
            .send()
            .await
            .map_err(|e| EventError::Delivery(e.to_string()))?;
        if !response.status().is_success() {
            return Err(EventError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Forwards events into an in-process channel (embedding and tests)
pub struct ChannelEventSink {
    sender: mpsc::UnboundedSender<EventEnvelope>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EventEnvelope>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn publish(&self, event: EventEnvelope) -> Result<(), EventError> {
        self.sender.send(event).map_err(|_| EventError::Closed)
    }
}

/// Build the sink described by configuration
pub fn sink_from_config(config: &EventsConfig) -> Result<Arc<dyn EventSink>, EventError> {
    match config.url {
        Some(ref url) => Ok(Arc::new(HttpEventSink::new(
            url.clone(),
            Duration::from_millis(config.timeout_ms),
        )?)),
        None => Ok(Arc::new(LogEventSink)),
    }
}

/// Publishes module events and lifecycle notifications
pub struct EventPublisher {
    sink: Arc<dyn EventSink>,
}

impl EventPublisher {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    /// Forward an event emitted by a module
    pub async fn publish_module_event(
        &self,
        run_id: &str,
        principal: &str,
        event: Value,
    ) -> Result<(), EventError> {
        debug!("Run {} emitted event", run_id);
        self.sink
            .publish(EventEnvelope {
                event_type: "module.event".to_string(),
                run_id: run_id.to_string(),
                principal: principal.to_string(),
                timestamp_ms: current_timestamp_millis(),
                payload: event,
            })
            .await
    }

    /// Publish a lifecycle notification carrying a run snapshot
    pub async fn publish_lifecycle<T: Serialize>(
        &self,
        kind: LifecycleEvent,
        run_id: &str,
        principal: &str,
        snapshot: &T,
    ) {
        let payload = serde_json::to_value(snapshot).unwrap_or(Value::Null);
        let envelope = EventEnvelope {
            event_type: kind.as_str().to_string(),
            run_id: run_id.to_string(),
            principal: principal.to_string(),
            timestamp_ms: current_timestamp_millis(),
            payload,
        };
        log_error_async(
            || self.sink.publish(envelope),
            &format!("Failed to publish {} for run {}", kind.as_str(), run_id),
        )
        .await;
    }
}
