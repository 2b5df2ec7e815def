//! Bus boundary: envelopes, routing topics and the HTTP gateway client.

use crate::collectors::TelemetryRecord;
use crate::config::BusConfig;
use crate::error::PublishError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// Fields promoted to the envelope and removed from the payload
const ENVELOPE_FIELDS: &[&str] = &["id", "agent_id", "timestamp", "created_at"];

/// `events.raw.<agent_id>.<category>`
pub fn topic_for(agent_id: &str, category: &str) -> String {
    format!("events.raw.{}.{}", agent_id, category)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event_id: String,
    pub agent_id: String,
    pub event_type: String,
    /// RFC 3339
    pub timestamp: String,
    pub payload: Value,
}

impl Envelope {
    pub fn from_record<R: TelemetryRecord>(record: &R) -> Result<Self, PublishError> {
        let mut payload = serde_json::to_value(record)?;
        if let Value::Object(map) = &mut payload {
            for field in ENVELOPE_FIELDS {
                map.remove(*field);
            }
        }
        Ok(Self {
            event_id: record.id().to_string(),
            agent_id: record.agent_id().to_string(),
            event_type: R::CATEGORY.to_string(),
            timestamp: record.timestamp().to_rfc3339(),
            payload,
        })
    }
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), PublishError>;
    async fn close(&self) -> Result<(), PublishError>;
}

/// Publishes through the bus HTTP gateway: one POST per envelope, routing key in a header
pub struct HttpPublisher {
    client: reqwest::Client,
    publish_url: String,
    closed: AtomicBool,
}

impl HttpPublisher {
    pub fn new(endpoint: &str, config: &BusConfig) -> Result<Self, PublishError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            client,
            publish_url: format!(
                "{}/api/v1/exchanges/{}/publish",
                endpoint.trim_end_matches('/'),
                config.exchange
            ),
            closed: AtomicBool::new(false),
        })
    }

    pub fn publish_url(&self) -> &str {
        &self.publish_url
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), PublishError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PublishError::Closed);
        }
        let res = self
            .client
            .post(&self.publish_url)
            .header("X-Routing-Key", topic)
            .json(envelope)
            .send()
            .await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(PublishError::Status {
                status: status.as_u16(),
                body,
            });
        }
        debug!(topic, event_id = %envelope.event_id, "published");
        Ok(())
    }

    async fn close(&self) -> Result<(), PublishError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("bus publisher closed");
        }
        Ok(())
    }
}

/// Used when the bus is disabled; events are only persisted
#[derive(Debug, Default)]
pub struct NullPublisher;

#[async_trait]
impl Publisher for NullPublisher {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), PublishError> {
        debug!(topic, event_id = %envelope.event_id, "bus disabled, not publishing");
        Ok(())
    }

    async fn close(&self) -> Result<(), PublishError> {
        Ok(())
    }
}

/// HTTP publisher when the bus is enabled with an endpoint, otherwise the null publisher
pub fn publisher_from_config(config: &BusConfig) -> Result<Box<dyn Publisher>, PublishError> {
    match (&config.endpoint, config.enabled) {
        (Some(endpoint), true) => {
            let publisher = HttpPublisher::new(endpoint, config)?;
            info!(url = %publisher.publish_url(), "bus publishing enabled");
            Ok(Box::new(publisher))
        }
        _ => Ok(Box::new(NullPublisher)),
    }
}
