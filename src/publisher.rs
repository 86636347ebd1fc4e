//! Stream publisher with a strict never-propagate contract.
//!
//! Publishing happens on the primary write path of the upstream service, so
//! a broker outage must never abort a save. [`Publish::publish`] therefore
//! returns a [`PublishOutcome`] instead of a `Result`: the caller learns
//! whether the envelope was accepted for delivery, and nothing more. Broker
//! acknowledgement is observed on a separate task and only logged; retry is
//! the transport's business, not this component's.

use std::sync::{Arc, Mutex};

use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::event::Envelope;

/// Maximum entries retained per stream (older entries are trimmed).
const STREAM_MAX_LEN: usize = 100_000;

/// Typed result of an enqueue attempt. Deliberately not a `Result`: neither
/// variant is an error to the caller's write path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The envelope was serialized and handed to the transport.
    Accepted,
    /// The envelope could not be enqueued; it was logged and dropped.
    Rejected,
}

impl PublishOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, PublishOutcome::Accepted)
    }
}

/// Seam for envelope publication, implemented by [`RedisPublisher`] in
/// production and by recording doubles in tests.
pub trait Publish: Send + Sync {
    /// Enqueue `envelope` on `topic`, keyed by `key`.
    ///
    /// Must not block on broker acknowledgement and must never panic or
    /// propagate transport failures.
    fn publish(&self, topic: &str, key: &str, envelope: &Envelope) -> PublishOutcome;
}

/// Publisher backed by Redis Streams.
///
/// Holds the process-wide connection pool, created once at startup and
/// shared by reference. Safe for concurrent use from multiple save paths.
#[derive(Clone)]
pub struct RedisPublisher {
    pool: Pool,
    in_flight: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl RedisPublisher {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            in_flight: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut handles = self.in_flight.lock().unwrap();
        // Completed appends are reaped here so the ledger stays bounded in
        // long-running processes.
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Wait for every in-flight append to reach the broker (or fail and be
    /// logged). Short-lived tools call this before exiting so accepted
    /// envelopes are not lost to process teardown. The publish contract is
    /// unchanged: outcomes still surface only in logs.
    pub async fn flush(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut in_flight = self.in_flight.lock().unwrap();
            in_flight.drain(..).collect()
        };

        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Publish for RedisPublisher {
    fn publish(&self, topic: &str, key: &str, envelope: &Envelope) -> PublishOutcome {
        let event_id = envelope.event_id;
        let event_type = envelope.event_type.clone();

        info!(
            topic = %topic,
            key = %key,
            event_type = %event_type,
            event_id = %event_id,
            "Publishing envelope"
        );

        let value = match serde_json::to_string(envelope) {
            Ok(v) => v,
            Err(e) => {
                error!(
                    topic = %topic,
                    event_id = %event_id,
                    error = %e,
                    "Failed to serialize envelope, dropping"
                );
                return PublishOutcome::Rejected;
            }
        };

        // Append on a separate task so the caller never waits on the broker.
        // The task doubles as the delivery callback: it logs the assigned
        // stream id on success and the failure otherwise.
        let pool = self.pool.clone();
        let topic = topic.to_string();
        let key = key.to_string();
        let handle = tokio::spawn(async move {
            let mut conn = match pool.get().await {
                Ok(c) => c,
                Err(e) => {
                    error!(
                        topic = %topic,
                        event_id = %event_id,
                        error = %e,
                        "Failed to get Redis connection for publish"
                    );
                    return;
                }
            };

            let result: Result<String, _> = cmd("XADD")
                .arg(&topic)
                .arg("MAXLEN")
                .arg("~")
                .arg(STREAM_MAX_LEN)
                .arg("*")
                .arg("key")
                .arg(&key)
                .arg("envelope")
                .arg(&value)
                .query_async(&mut conn)
                .await;

            match result {
                Ok(id) => debug!(
                    topic = %topic,
                    stream_id = %id,
                    event_type = %event_type,
                    event_id = %event_id,
                    "Envelope delivered to stream"
                ),
                Err(e) => error!(
                    topic = %topic,
                    event_type = %event_type,
                    event_id = %event_id,
                    error = %e,
                    "Envelope delivery failed"
                ),
            }
        });
        self.track(handle);

        PublishOutcome::Accepted
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingPublisher;
    use super::*;
    use crate::event::{build_customer_event, CustomerSnapshot, EventKind};
    use chrono::Utc;
    use uuid::Uuid;

    fn envelope() -> Envelope {
        let snapshot = CustomerSnapshot {
            id: Some(Uuid::new_v4()),
            name: "Alice".into(),
            email: "a@x.com".into(),
            status: "active".into(),
            updated_at: Some(Utc::now()),
        };
        build_customer_event(EventKind::Created, &snapshot).unwrap()
    }

    #[test]
    fn test_outcome_accessors() {
        assert!(PublishOutcome::Accepted.is_accepted());
        assert!(!PublishOutcome::Rejected.is_accepted());
    }

    fn unreachable_pool() -> Pool {
        deadpool_redis::Config::from_url("redis://127.0.0.1:1")
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .unwrap()
    }

    #[tokio::test]
    async fn test_flush_waits_for_spawned_appends() {
        let publisher = RedisPublisher::new(unreachable_pool());
        let envelope = envelope();

        let outcome = publisher.publish(crate::EVENT_TOPIC, &envelope.entity.id, &envelope);
        assert!(outcome.is_accepted());
        assert_eq!(publisher.in_flight.lock().unwrap().len(), 1);

        // The append task fails against the unreachable broker; flush must
        // still wait it out and drain the ledger rather than hang or leak.
        publisher.flush().await;
        assert!(publisher.in_flight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_flush_with_nothing_in_flight_returns_immediately() {
        let publisher = RedisPublisher::new(unreachable_pool());
        publisher.flush().await;
        assert!(publisher.in_flight.lock().unwrap().is_empty());
    }

    #[test]
    fn test_recording_publisher_captures_topic_and_key() {
        let publisher = RecordingPublisher::default();
        let envelope = envelope();

        let outcome = publisher.publish(crate::EVENT_TOPIC, &envelope.entity.id, &envelope);
        assert!(outcome.is_accepted());

        let calls = publisher.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "internal.customer.events");
        assert_eq!(calls[0].1, envelope.entity.id);
        assert_eq!(calls[0].2, envelope);
    }
}
