//! Broker publisher.
//!
//! [`BrokerPublisher::publish`] owns the whole connection lifecycle for one
//! envelope: connect, declare the exchange, publish, and always try to close.
//! Every failure ends in a log line; nothing is returned to the caller.
//!
//! The broker itself sits behind the [`Connector`] / [`BrokerConnection`]
//! pair:
//!
//! - [`AmqpConnector`](amqp::AmqpConnector): AMQP 0-9-1 via `lapin`
//!   (feature `amqp`, on by default)
//! - [`MemoryBroker`]: records declarations and messages in memory
//!
//! A publisher built without a connector degrades to a logged no-op.

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

use crate::envelope::Envelope;
use crate::settings::{ConfigResolver, ConnectionOptions, RelaySettings};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub use memory::{MemoryBroker, PublishedMessage};

/// Body published when the envelope cannot be encoded.
pub const FALLBACK_BODY: &[u8] = br#"{"error":"json_encode_failed"}"#;

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// AMQP delivery mode for messages that survive a broker restart.
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Errors raised while talking to the broker.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("exchange declaration failed: {0}")]
    Declare(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("close failed: {0}")]
    Close(String),
}

/// Message properties sent with each publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: String,
    pub delivery_mode: u8,
}

impl MessageProperties {
    /// Persistent JSON message.
    pub fn persistent_json() -> Self {
        Self {
            content_type: CONTENT_TYPE_JSON.to_string(),
            delivery_mode: DELIVERY_MODE_PERSISTENT,
        }
    }
}

/// An open broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Declare an exchange. Repeating an identical declaration is a no-op.
    async fn declare_exchange(
        &self,
        name: &str,
        kind: &str,
        durable: bool,
    ) -> Result<(), PublishError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), PublishError>;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<(), PublishError>;
}

/// Opens broker connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        options: &ConnectionOptions,
    ) -> Result<Box<dyn BrokerConnection>, PublishError>;
}

/// Encode an envelope as the message body.
pub fn encode_body(envelope: &Envelope) -> Vec<u8> {
    serde_json::to_vec(envelope).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to encode envelope, publishing error marker");
        FALLBACK_BODY.to_vec()
    })
}

/// Publishes envelopes to the configured exchange.
#[derive(Clone)]
pub struct BrokerPublisher {
    config: ConfigResolver,
    connector: Option<Arc<dyn Connector>>,
}

impl BrokerPublisher {
    pub fn new(config: ConfigResolver, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector: Some(connector),
        }
    }

    /// Publisher with no broker client; every publish is skipped.
    pub fn unavailable(config: ConfigResolver) -> Self {
        Self {
            config,
            connector: None,
        }
    }

    /// Publisher using the broker client compiled into this build.
    pub fn from_runtime(config: ConfigResolver) -> Self {
        #[cfg(feature = "amqp")]
        {
            Self::new(config, Arc::new(amqp::AmqpConnector::new()))
        }
        #[cfg(not(feature = "amqp"))]
        {
            Self::unavailable(config)
        }
    }

    pub fn is_available(&self) -> bool {
        self.connector.is_some()
    }

    /// Publish one envelope. Failures are logged, never returned.
    pub async fn publish(&self, envelope: &Envelope) {
        let Some(connector) = &self.connector else {
            warn!("No broker client available; skipping publish");
            return;
        };

        let settings = match self.config.snapshot().await {
            Ok(settings) => settings,
            Err(e) => {
                error!(error = %e, "Broker publish failed: could not read settings");
                return;
            }
        };

        let connection = match connector.connect(&settings.connection_options()).await {
            Ok(connection) => connection,
            Err(e) => {
                error!(
                    error = %e,
                    host = %settings.host,
                    port = settings.port,
                    "Broker publish failed"
                );
                return;
            }
        };

        if let Err(e) = deliver(connection.as_ref(), &settings, envelope).await {
            error!(
                error = %e,
                exchange = %settings.exchange,
                class = %envelope.event().class,
                "Broker publish failed"
            );
        }

        if connection.is_connected() {
            if let Err(e) = connection.close().await {
                debug!(error = %e, "Ignoring error while closing broker connection");
            }
        }
    }
}

async fn deliver(
    connection: &dyn BrokerConnection,
    settings: &RelaySettings,
    envelope: &Envelope,
) -> Result<(), PublishError> {
    connection
        .declare_exchange(&settings.exchange, &settings.exchange_type, true)
        .await?;

    let routing_key = envelope.routing_key(&settings.routing_prefix);
    let body = encode_body(envelope);

    connection
        .publish(
            &settings.exchange,
            &routing_key,
            &body,
            &MessageProperties::persistent_json(),
        )
        .await?;

    info!(
        exchange = %settings.exchange,
        routing_key = %routing_key,
        bytes = body.len(),
        "Event published"
    );
    Ok(())
}
