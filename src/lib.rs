//! # Event Relay
//!
//! Relays every event raised inside a host application, as a JSON document,
//! to a topic exchange on an AMQP broker.
//!
//! ## Architecture
//!
//! ```text
//! Host event -> DispatchListener -> normalize -> JobQueue (Redis stream)
//!     ... later ...
//! relay-worker -> PublishJob -> BrokerPublisher -> AMQP exchange
//! ```
//!
//! ## Modules
//!
//! - [`inspect`]: Introspection capability every event is seen through
//! - [`normalize`]: Bounded, JSON-safe conversion of events
//! - [`envelope`]: Queued/published message with capture metadata
//! - [`listener`]: Capture path, called once per host event
//! - [`queue`]: Delivery queue backends
//! - [`job`]: Deferred publish job
//! - [`publisher`]: Broker connection lifecycle and publishing
//! - [`settings`]: Setting store and configuration resolver
//! - [`config`]: Service configuration for the binaries
//! - [`api`]: HTTP surface of the relay server

pub mod api;
pub mod config;
pub mod envelope;
pub mod inspect;
pub mod job;
pub mod listener;
pub mod normalize;
pub mod publisher;
pub mod queue;
pub mod settings;
pub mod shutdown;

// Re-export commonly used types at crate root
pub use envelope::Envelope;
pub use inspect::{DynamicObject, Inspect, Reflected};
pub use job::PublishJob;
pub use listener::DispatchListener;
pub use normalize::{normalize, NormalizedEvent};
pub use publisher::BrokerPublisher;
pub use settings::ConfigResolver;

/// Identifier of this integration; scopes settings and environment variables.
pub const APP_ID: &str = "webhook_rabbitmq";

/// Job type under which envelopes are queued for publishing.
pub const PUBLISH_JOB: &str = "webhook_rabbitmq.publish";
