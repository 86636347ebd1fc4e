//! Downstream ticketing API client.
//!
//! Creates incident records over the table API. The idempotency key travels
//! verbatim in `short_description` so the downstream system can deduplicate
//! redelivered events; nothing on this side checks it.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::TicketingConfig;
use crate::http::{HttpClient, HttpError};

/// Incident table endpoint, relative to the configured base URL.
pub const INCIDENT_TABLE_PATH: &str = "/api/now/table/incident";

/// What the handler needs back from an incident creation.
#[derive(Debug, Clone)]
pub struct IncidentReceipt {
    pub status: u16,
    /// Downstream-assigned record id, when the response carries one.
    pub sys_id: Option<String>,
}

/// Seam for the downstream ticketing system.
#[async_trait]
pub trait TicketingApi: Send + Sync {
    /// Create an incident for `record`, forwarding `idempotency_key` verbatim.
    async fn create_incident(
        &self,
        record: &Value,
        idempotency_key: &str,
    ) -> Result<IncidentReceipt, HttpError>;
}

/// ServiceNow-style table API client backed by [`HttpClient`].
#[derive(Debug, Clone)]
pub struct ServiceNowClient {
    http: HttpClient,
}

impl ServiceNowClient {
    pub fn new(config: &TicketingConfig) -> Self {
        let http = HttpClient::new()
            .with_base_url(&config.base_url)
            .with_basic_auth(&config.username, &config.password)
            .with_timeout(config.timeout())
            .with_max_retries(config.max_retries)
            .with_jitter(config.jitter);

        Self { http }
    }

    /// Wire body for an incident creation request.
    fn incident_body(record: &Value, idempotency_key: &str) -> Value {
        json!({
            "short_description": idempotency_key,
            "description": record.to_string(),
        })
    }
}

#[async_trait]
impl TicketingApi for ServiceNowClient {
    async fn create_incident(
        &self,
        record: &Value,
        idempotency_key: &str,
    ) -> Result<IncidentReceipt, HttpError> {
        let body = Self::incident_body(record, idempotency_key);

        let mut headers = HashMap::new();
        headers.insert("Accept".to_string(), "application/json".to_string());
        headers.insert("Content-Type".to_string(), "application/json".to_string());

        debug!(
            idempotency_key = %idempotency_key,
            "Creating downstream incident"
        );

        let response = self
            .http
            .post_json(INCIDENT_TABLE_PATH, &body, Some(&headers))
            .await?;

        let sys_id = response
            .data
            .as_json()
            .and_then(|v| v.pointer("/result/sys_id"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        Ok(IncidentReceipt {
            status: response.status,
            sys_id,
        })
    }
}
