//! # Relay
//!
//! A resilient delivery pipeline that propagates Customer changes to a
//! downstream ticketing system through a Redis Streams event log.
//!
//! ## Architecture
//!
//! ```text
//! save hook -> EventBuilder -> Publisher -> stream -> Consumer -> SyncHandler -> HTTP
//!                                                                     |
//!                                                            (failure) v
//!                                                          dead-letter stream
//! ```
//!
//! ## Modules
//!
//! - [`event`]: Versioned event envelope and the idempotent builder
//! - [`publisher`]: Fire-and-forget stream append, never propagates
//! - [`consumer`]: At-least-once poll/dispatch loop over a consumer group
//! - [`http`]: HTTP client with classified retry and exponential backoff
//! - [`ticketing`]: Downstream incident API client
//! - [`handler`]: Delivery orchestration with dead-letter escalation
//! - [`observer`]: Post-commit hook invoked by the persistence layer
//! - [`dlq`]: Operator tooling over the dead-letter stream

pub mod config;
pub mod consumer;
pub mod dlq;
pub mod event;
pub mod handler;
pub mod http;
pub mod observer;
pub mod publisher;
pub mod shutdown;
pub mod ticketing;

// Re-export commonly used types at crate root
pub use event::{build_customer_event, CustomerSnapshot, Envelope, EventKind};
pub use handler::{Handler, SyncHandler};
pub use http::HttpClient;
pub use publisher::{Publish, PublishOutcome, RedisPublisher};

/// Stream carrying customer change events, keyed by entity id.
pub const EVENT_TOPIC: &str = "internal.customer.events";

/// Dead-letter stream for envelopes that could not be delivered downstream,
/// keyed by event id.
pub const DLQ_TOPIC: &str = "internal.customer.events.dlq";

/// Static system identifier stamped into every envelope.
pub const EVENT_SOURCE: &str = "internal-system";

/// Default consumer group name for sync workers.
pub const DEFAULT_CONSUMER_GROUP: &str = "sync-service";

/// Envelope schema version, bumped on breaking payload changes.
pub const SCHEMA_VERSION: u32 = 1;
