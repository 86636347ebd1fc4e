//! Post-commit mutation hook.
//!
//! The persistence layer calls [`CustomerChangeObserver::record_saved`]
//! synchronously after every successful Customer write, with the field
//! snapshot and whether the record was newly created. Event construction
//! failures are logged and the save proceeds without an event; publishing
//! is fire-and-forget on top of that. Nothing here can abort the caller's
//! write path.

use std::sync::Arc;

use tracing::{error, info};

use crate::event::{build_customer_event, CustomerSnapshot, EventKind};
use crate::publisher::Publish;
use crate::EVENT_TOPIC;

/// Observer wired between the persistence layer and the publisher.
pub struct CustomerChangeObserver {
    publisher: Arc<dyn Publish>,
}

impl CustomerChangeObserver {
    pub fn new(publisher: Arc<dyn Publish>) -> Self {
        Self { publisher }
    }

    /// Hook invoked after a successful Customer save.
    ///
    /// Builds the envelope and enqueues it on the event stream keyed by the
    /// entity id, so all events for one entity stay ordered relative to each
    /// other on a key-partitioned log.
    pub fn record_saved(&self, customer: &CustomerSnapshot, created: bool) {
        let kind = if created {
            EventKind::Created
        } else {
            EventKind::Updated
        };

        info!(
            event_type = %kind,
            customer_id = ?customer.id,
            email = %customer.email,
            status = %customer.status,
            "Customer save observed"
        );

        let envelope = match build_customer_event(kind, customer) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Fatal for this emission only; the save already succeeded.
                error!(
                    event_type = %kind,
                    customer_id = ?customer.id,
                    error = %e,
                    "Could not build event, save proceeds without one"
                );
                return;
            }
        };

        info!(
            event_type = %envelope.event_type,
            event_id = %envelope.event_id,
            entity_id = %envelope.entity.id,
            "Event built"
        );

        self.publisher
            .publish(EVENT_TOPIC, &envelope.entity.id, &envelope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::test_support::RecordingPublisher;
    use chrono::Utc;
    use uuid::Uuid;

    fn snapshot() -> CustomerSnapshot {
        CustomerSnapshot {
            id: Some(Uuid::new_v4()),
            name: "Alice".into(),
            email: "a@x.com".into(),
            status: "active".into(),
            updated_at: Some(Utc::now()),
        }
    }

    #[test]
    fn test_create_then_update_emit_distinct_event_types_and_keys() {
        let publisher = Arc::new(RecordingPublisher::default());
        let observer = CustomerChangeObserver::new(publisher.clone());

        let mut customer = snapshot();
        observer.record_saved(&customer, true);

        customer.status = "inactive".into();
        observer.record_saved(&customer, false);

        let calls = publisher.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);

        let created = &calls[0].2;
        let updated = &calls[1].2;
        assert_eq!(created.event_type, "record.created");
        assert_eq!(updated.event_type, "record.updated");
        assert_ne!(created.idempotency_key, updated.idempotency_key);

        // Both keyed by the entity id for partition affinity.
        assert_eq!(calls[0].0, EVENT_TOPIC);
        assert_eq!(calls[0].1, created.entity.id);
        assert_eq!(calls[1].1, updated.entity.id);
    }

    #[test]
    fn test_build_failure_is_swallowed() {
        let publisher = Arc::new(RecordingPublisher::default());
        let observer = CustomerChangeObserver::new(publisher.clone());

        let mut customer = snapshot();
        customer.id = None;

        // Must not panic and must not publish.
        observer.record_saved(&customer, true);
        assert!(publisher.calls.lock().unwrap().is_empty());
    }
}
