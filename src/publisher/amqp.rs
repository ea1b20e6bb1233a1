//! AMQP 0-9-1 broker client over `lapin`.

use super::{BrokerConnection, Connector, MessageProperties, PublishError};
use crate::settings::ConnectionOptions;
use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions};
use lapin::types::{FieldTable, ShortString};
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::debug;

/// Reply code sent when closing a connection normally.
const REPLY_SUCCESS: u16 = 200;

/// Map a configured exchange type to the AMQP exchange kind.
pub fn exchange_kind(kind: &str) -> ExchangeKind {
    match kind {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "headers" => ExchangeKind::Headers,
        "topic" => ExchangeKind::Topic,
        other => ExchangeKind::Custom(other.to_string()),
    }
}

/// Build the broker URI from connection options.
///
/// The vhost is carried as-is, so `/` needs no percent-encoding.
pub fn broker_uri(options: &ConnectionOptions) -> AMQPUri {
    AMQPUri {
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: options.login.clone(),
                password: options.password.clone(),
            },
            host: options.host.clone(),
            port: options.port,
        },
        vhost: options.vhost.clone(),
        ..Default::default()
    }
}

/// Opens one AMQP connection and channel per publish.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpConnector;

impl AmqpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(
        &self,
        options: &ConnectionOptions,
    ) -> Result<Box<dyn BrokerConnection>, PublishError> {
        debug!(host = %options.host, port = options.port, vhost = %options.vhost, "Connecting to broker");

        let connection = Connection::connect_uri(broker_uri(options), ConnectionProperties::default())
            .await
            .map_err(|e| PublishError::Connect(e.to_string()))?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close(REPLY_SUCCESS, "channel setup failed").await;
                return Err(PublishError::Connect(e.to_string()));
            }
        };

        Ok(Box::new(AmqpConnection {
            connection,
            channel,
        }))
    }
}

struct AmqpConnection {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: &str,
        durable: bool,
    ) -> Result<(), PublishError> {
        let options = ExchangeDeclareOptions {
            durable,
            ..Default::default()
        };

        self.channel
            .exchange_declare(name, exchange_kind(kind), options, FieldTable::default())
            .await
            .map_err(|e| PublishError::Declare(e.to_string()))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), PublishError> {
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(properties.content_type.clone()))
            .with_delivery_mode(properties.delivery_mode);

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(|e| PublishError::Publish(e.to_string()))?
            .await
            .map_err(|e| PublishError::Publish(e.to_string()))?;

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> Result<(), PublishError> {
        self.connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| PublishError::Close(e.to_string()))
    }
}
