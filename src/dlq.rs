//! Operator tooling over the dead-letter stream.
//!
//! Envelopes land here when downstream delivery fails terminally or after
//! retry exhaustion. Reprocessing is manual by design: this module exists so
//! an operator can count, inspect, and clear entries while doing it.

use std::collections::HashMap;

use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use thiserror::Error;
use tracing::{debug, info};

use crate::event::Envelope;
use crate::DLQ_TOPIC;

/// Errors from dead-letter stream operations.
#[derive(Debug, Error)]
pub enum DlqError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Redis(String),

    #[error("entry {id} does not decode: {reason}")]
    Corrupt { id: String, reason: String },
}

/// One dead-lettered envelope with its stream position.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub stream_id: String,
    /// The publish key, which is the envelope's event id.
    pub key: String,
    pub envelope: Envelope,
}

/// Read/maintenance handle for the dead-letter stream.
#[derive(Clone)]
pub struct DeadLetterQueue {
    pool: Pool,
}

impl DeadLetterQueue {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Number of entries currently on the stream.
    pub async fn count(&self) -> Result<u64, DlqError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| DlqError::Connection(e.to_string()))?;

        let count: u64 = cmd("XLEN")
            .arg(DLQ_TOPIC)
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::Redis(e.to_string()))?;

        Ok(count)
    }

    /// List up to `count` entries starting at `offset`, oldest first.
    pub async fn list(&self, count: usize, offset: usize) -> Result<Vec<DeadLetter>, DlqError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| DlqError::Connection(e.to_string()))?;

        let entries: Vec<(String, Vec<(String, String)>)> = cmd("XRANGE")
            .arg(DLQ_TOPIC)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(count + offset)
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::Redis(e.to_string()))?;

        let letters = entries
            .into_iter()
            .skip(offset)
            .take(count)
            .map(|(id, fields)| decode_entry(id, fields))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(count = letters.len(), "Retrieved dead-letter entries");
        Ok(letters)
    }

    /// Fetch a single entry by stream id.
    pub async fn get(&self, id: &str) -> Result<Option<DeadLetter>, DlqError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| DlqError::Connection(e.to_string()))?;

        let mut entries: Vec<(String, Vec<(String, String)>)> = cmd("XRANGE")
            .arg(DLQ_TOPIC)
            .arg(id)
            .arg(id)
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::Redis(e.to_string()))?;

        match entries.pop() {
            Some((id, fields)) => Ok(Some(decode_entry(id, fields)?)),
            None => Ok(None),
        }
    }

    /// Remove an entry after manual review or external reprocessing.
    pub async fn remove(&self, id: &str) -> Result<bool, DlqError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| DlqError::Connection(e.to_string()))?;

        let removed: u64 = cmd("XDEL")
            .arg(DLQ_TOPIC)
            .arg(id)
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::Redis(e.to_string()))?;

        if removed > 0 {
            info!(id = %id, "Removed dead-letter entry");
            Ok(true)
        } else {
            debug!(id = %id, "Dead-letter entry not found");
            Ok(false)
        }
    }
}

fn decode_entry(id: String, fields: Vec<(String, String)>) -> Result<DeadLetter, DlqError> {
    let map: HashMap<String, String> = fields.into_iter().collect();

    let key = map.get("key").cloned().unwrap_or_default();
    let raw = map.get("envelope").ok_or_else(|| DlqError::Corrupt {
        id: id.clone(),
        reason: "missing 'envelope' field".to_string(),
    })?;

    let envelope: Envelope = serde_json::from_str(raw).map_err(|e| DlqError::Corrupt {
        id: id.clone(),
        reason: e.to_string(),
    })?;

    Ok(DeadLetter {
        stream_id: id,
        key,
        envelope,
    })
}
