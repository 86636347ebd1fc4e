//! Delivery orchestration: envelope in, downstream incident out.
//!
//! [`SyncHandler`] is the consumer-side endpoint of the pipeline. It
//! transforms the envelope into the downstream shape (identity by default),
//! creates an incident through the resilient HTTP client, and escalates any
//! failure, terminal or retry-exhausted alike, by publishing the original
//! envelope to the dead-letter stream keyed by `event_id`. A failed
//! dead-letter publish is logged and dropped; there is no further tier.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info};

use crate::event::Envelope;
use crate::http::HttpError;
use crate::publisher::{Publish, PublishOutcome};
use crate::ticketing::{IncidentReceipt, TicketingApi};
use crate::DLQ_TOPIC;

/// Errors a handler may report to the consumer loop.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("downstream call failed: {0}")]
    Http(#[from] HttpError),

    #[error("handler failed: {0}")]
    Failed(String),
}

/// Consumer dispatch seam. Handlers own their failure handling; the loop
/// only logs whatever they return.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError>;
}

/// Pure, swappable transform from envelope to downstream shape.
pub type Transform = Arc<dyn Fn(&Envelope) -> Value + Send + Sync>;

/// The customer-to-ticketing sync handler.
pub struct SyncHandler {
    ticketing: Arc<dyn TicketingApi>,
    dead_letters: Arc<dyn Publish>,
    transform: Transform,
}

impl SyncHandler {
    /// Handler with the identity transform: the downstream record is the
    /// envelope's `entity` block as emitted.
    pub fn new(ticketing: Arc<dyn TicketingApi>, dead_letters: Arc<dyn Publish>) -> Self {
        Self {
            ticketing,
            dead_letters,
            transform: Arc::new(|envelope| {
                serde_json::to_value(envelope).unwrap_or(Value::Null)
            }),
        }
    }

    /// Replace the transform, e.g. to reshape fields for a different table.
    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    async fn deliver(&self, envelope: &Envelope) -> Result<IncidentReceipt, HandlerError> {
        let transformed = (self.transform)(envelope);

        let record = transformed
            .get("entity")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));
        let idempotency_key = transformed
            .get("idempotency_key")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_default();

        let receipt = self
            .ticketing
            .create_incident(&record, &idempotency_key)
            .await?;

        Ok(receipt)
    }

    fn dead_letter(&self, envelope: &Envelope) {
        let key = envelope.event_id.to_string();
        match self.dead_letters.publish(DLQ_TOPIC, &key, envelope) {
            PublishOutcome::Accepted => info!(
                event_id = %envelope.event_id,
                topic = DLQ_TOPIC,
                "Envelope routed to dead-letter stream"
            ),
            // Designed worst case: the envelope is gone. Operators recover
            // from logs.
            PublishOutcome::Rejected => error!(
                event_id = %envelope.event_id,
                topic = DLQ_TOPIC,
                "Dead-letter publish failed, dropping envelope"
            ),
        }
    }
}

#[async_trait]
impl Handler for SyncHandler {
    fn name(&self) -> &str {
        "sync"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        match self.deliver(envelope).await {
            Ok(receipt) => {
                info!(
                    event_id = %envelope.event_id,
                    idempotency_key = %envelope.idempotency_key,
                    status = receipt.status,
                    sys_id = receipt.sys_id.as_deref().unwrap_or("-"),
                    "Incident created downstream"
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    event_id = %envelope.event_id,
                    event_type = %envelope.event_type,
                    error = %err,
                    "Downstream delivery failed, escalating to dead-letter"
                );
                self.dead_letter(envelope);
                // Resolved via the dead-letter stream; nothing for the
                // consumer loop to act on.
                Ok(())
            }
        }
    }
}
