//! Event envelope and builder.
//!
//! Every observed Customer mutation becomes one immutable [`Envelope`]. The
//! envelope carries two identifiers with different contracts:
//!
//! - `event_id`: fresh v4 UUID per emission, tracing only.
//! - `idempotency_key`: v5 UUID derived from `(event_type, entity_type,
//!   entity_id)` under a fixed namespace. Repeated emissions describing the
//!   same logical transition on the same entity share this key, so a
//!   downstream consumer can recognize duplicates. Nothing in this crate
//!   deduplicates on it; the key is generated and forwarded only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::{EVENT_SOURCE, SCHEMA_VERSION};

/// Namespace for deterministic v5 idempotency keys. Changing this breaks
/// duplicate recognition across deployments, so it is fixed forever.
pub const IDEMPOTENCY_NAMESPACE: Uuid = Uuid::from_bytes([
    0xa1, 0xb2, 0xc3, 0xd4, 0xe5, 0xf6, 0x78, 0x90, 0xab, 0xcd, 0xef, 0x12, 0x34, 0x56, 0x78,
    0x90,
]);

/// Known customer event types. The envelope stores the wire string, so new
/// types can flow through consumers without a code change here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The record was newly created by this save.
    Created,
    /// An existing record was modified.
    Updated,
}

impl EventKind {
    /// Wire representation of the event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "record.created",
            EventKind::Updated => "record.updated",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `{type, id}` pair identifying the mutated record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub id: String,
}

/// Envelope metadata block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub schema_version: u32,
}

/// A versioned customer event, one per mutation observation.
///
/// Serialized as JSON onto the event stream; the field names are the wire
/// contract and must not change without bumping `metadata.schema_version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique per emission, used for tracing only.
    pub event_id: Uuid,

    /// Deterministic key for `(event_type, entity.type, entity.id)`.
    pub idempotency_key: Uuid,

    /// Event type string, e.g. "record.created".
    pub event_type: String,

    /// UTC instant the entity was last modified.
    pub occurred_at: DateTime<Utc>,

    /// Static identifier of the emitting system.
    pub source: String,

    /// The mutated record.
    pub entity: EntityRef,

    /// Field snapshot at mutation time.
    pub payload: Value,

    pub metadata: EventMetadata,
}

/// Customer field snapshot supplied by the persistence layer on save.
///
/// `id` and `updated_at` are optional at this boundary because the storage
/// layer owns them; the builder treats their absence as a construction error.
#[derive(Debug, Clone, Default)]
pub struct CustomerSnapshot {
    pub id: Option<Uuid>,
    pub name: String,
    pub email: String,
    pub status: String,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Errors raised while constructing an envelope.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The snapshot lacks a field the envelope cannot be built without.
    #[error("snapshot missing required field '{0}'")]
    MissingField(&'static str),
}

/// Build a versioned customer event following the event contract.
///
/// Pure apart from the fresh `event_id`: the idempotency key depends only on
/// the event type and entity identity, never on time or payload. Fails if
/// the snapshot lacks `id` or `updated_at`; a partial envelope is never
/// emitted.
pub fn build_customer_event(
    kind: EventKind,
    customer: &CustomerSnapshot,
) -> Result<Envelope, BuildError> {
    let id = customer.id.ok_or(BuildError::MissingField("id"))?;
    let updated_at = customer
        .updated_at
        .ok_or(BuildError::MissingField("updated_at"))?;

    let idempotency_name = format!("{}:customer:{}", kind.as_str(), id);
    let idempotency_key = Uuid::new_v5(&IDEMPOTENCY_NAMESPACE, idempotency_name.as_bytes());

    Ok(Envelope {
        event_id: Uuid::new_v4(),
        idempotency_key,
        event_type: kind.as_str().to_string(),
        occurred_at: updated_at.with_timezone(&Utc),
        source: EVENT_SOURCE.to_string(),
        entity: EntityRef {
            entity_type: "customer".to_string(),
            id: id.to_string(),
        },
        payload: json!({
            "name": customer.name,
            "email": customer.email,
            "status": customer.status,
        }),
        metadata: EventMetadata {
            schema_version: SCHEMA_VERSION,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn snapshot() -> CustomerSnapshot {
        CustomerSnapshot {
            id: Some(Uuid::new_v4()),
            name: "Alice".to_string(),
            email: "a@x.com".to_string(),
            status: "active".to_string(),
            updated_at: Some(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()),
        }
    }

    #[test]
    fn test_idempotency_key_is_stable_across_calls() {
        let customer = snapshot();
        let a = build_customer_event(EventKind::Created, &customer).unwrap();
        let b = build_customer_event(EventKind::Created, &customer).unwrap();
        assert_eq!(a.idempotency_key, b.idempotency_key);
    }

    #[test]
    fn test_idempotency_key_ignores_payload_and_time() {
        let mut customer = snapshot();
        let a = build_customer_event(EventKind::Updated, &customer).unwrap();

        customer.name = "Alicia".to_string();
        customer.status = "inactive".to_string();
        customer.updated_at = Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        let b = build_customer_event(EventKind::Updated, &customer).unwrap();

        assert_eq!(a.idempotency_key, b.idempotency_key);
    }

    #[test]
    fn test_idempotency_key_differs_per_event_type() {
        let customer = snapshot();
        let created = build_customer_event(EventKind::Created, &customer).unwrap();
        let updated = build_customer_event(EventKind::Updated, &customer).unwrap();
        assert_ne!(created.idempotency_key, updated.idempotency_key);
    }

    #[test]
    fn test_idempotency_key_differs_per_entity() {
        let a = build_customer_event(EventKind::Created, &snapshot()).unwrap();
        let b = build_customer_event(EventKind::Created, &snapshot()).unwrap();
        assert_ne!(a.idempotency_key, b.idempotency_key);
    }

    #[test]
    fn test_event_id_is_fresh_per_emission() {
        let customer = snapshot();
        let a = build_customer_event(EventKind::Created, &customer).unwrap();
        let b = build_customer_event(EventKind::Created, &customer).unwrap();
        assert_ne!(a.event_id, b.event_id);
    }

    #[test]
    fn test_missing_id_is_a_construction_error() {
        let mut customer = snapshot();
        customer.id = None;
        let err = build_customer_event(EventKind::Created, &customer).unwrap_err();
        assert!(matches!(err, BuildError::MissingField("id")));
    }

    #[test]
    fn test_missing_updated_at_is_a_construction_error() {
        let mut customer = snapshot();
        customer.updated_at = None;
        let err = build_customer_event(EventKind::Updated, &customer).unwrap_err();
        assert!(matches!(err, BuildError::MissingField("updated_at")));
    }

    #[test]
    fn test_envelope_wire_shape() {
        let customer = snapshot();
        let envelope = build_customer_event(EventKind::Created, &customer).unwrap();

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["event_type"], "record.created");
        assert_eq!(value["source"], "internal-system");
        assert_eq!(value["entity"]["type"], "customer");
        assert_eq!(value["entity"]["id"], customer.id.unwrap().to_string());
        assert_eq!(value["payload"]["name"], "Alice");
        assert_eq!(value["payload"]["email"], "a@x.com");
        assert_eq!(value["payload"]["status"], "active");
        assert_eq!(value["metadata"]["schema_version"], 1);

        // Round-trips through the wire form unchanged.
        let back: Envelope = serde_json::from_value(value).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn test_namespace_matches_published_contract() {
        assert_eq!(
            IDEMPOTENCY_NAMESPACE.to_string(),
            "a1b2c3d4-e5f6-7890-abcd-ef1234567890"
        );
    }
}
