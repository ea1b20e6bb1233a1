//! In-memory broker.
//!
//! Behaves like a single broker node: exchanges persist across connections,
//! redeclaring an exchange with the same type succeeds, and redeclaring it
//! with a different type fails the way AMQP's `PRECONDITION_FAILED` does.

use super::{BrokerConnection, Connector, MessageProperties, PublishError};
use crate::settings::ConnectionOptions;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// A message accepted by the [`MemoryBroker`].
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

#[derive(Debug, Default)]
struct BrokerState {
    /// name -> (kind, durable)
    exchanges: HashMap<String, (String, bool)>,
    declarations: Vec<(String, String, bool)>,
    published: Vec<PublishedMessage>,
    connections_opened: usize,
    open_connections: usize,
}

/// Shared handle to an in-memory broker. Clones see the same state.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    reachable: Arc<AtomicBool>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            reachable: Arc::new(AtomicBool::new(true)),
        }
    }

    /// A broker every connection attempt fails against.
    pub fn unreachable() -> Self {
        let broker = Self::new();
        broker.set_reachable(false);
        broker
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Create an exchange out of band, as another client would.
    pub fn preset_exchange(&self, name: &str, kind: &str) {
        self.with_state(|state| {
            state
                .exchanges
                .insert(name.to_string(), (kind.to_string(), true));
        });
    }

    /// Successful exchange declarations, in order.
    pub fn exchanges(&self) -> Vec<(String, String, bool)> {
        self.with_state(|state| state.declarations.clone())
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.with_state(|state| state.published.clone())
    }

    pub fn connections_opened(&self) -> usize {
        self.with_state(|state| state.connections_opened)
    }

    /// Connections opened and not yet closed.
    pub fn open_connections(&self) -> usize {
        self.with_state(|state| state.open_connections)
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut BrokerState) -> T) -> T {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(
        &self,
        options: &ConnectionOptions,
    ) -> Result<Box<dyn BrokerConnection>, PublishError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(PublishError::Connect(format!(
                "connection refused ({}:{})",
                options.host, options.port
            )));
        }

        self.with_state(|state| {
            state.connections_opened += 1;
            state.open_connections += 1;
        });

        Ok(Box::new(MemoryConnection {
            broker: self.clone(),
            open: AtomicBool::new(true),
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    open: AtomicBool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<(), PublishError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PublishError::Publish("connection closed".to_string()))
        }
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: &str,
        durable: bool,
    ) -> Result<(), PublishError> {
        self.ensure_open()?;
        self.broker.with_state(|state| {
            if let Some((existing, _)) = state.exchanges.get(name) {
                if existing != kind {
                    return Err(PublishError::Declare(format!(
                        "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}': received '{}' but current is '{}'",
                        name, kind, existing
                    )));
                }
            }
            state
                .exchanges
                .insert(name.to_string(), (kind.to_string(), durable));
            state
                .declarations
                .push((name.to_string(), kind.to_string(), durable));
            Ok(())
        })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), PublishError> {
        self.ensure_open()?;
        self.broker.with_state(|state| {
            if !state.exchanges.contains_key(exchange) {
                return Err(PublishError::Publish(format!(
                    "NOT_FOUND - no exchange '{}'",
                    exchange
                )));
            }
            state.published.push(PublishedMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                body: body.to_vec(),
                properties: properties.clone(),
            });
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), PublishError> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.broker.with_state(|state| state.open_connections -= 1);
        }
        Ok(())
    }
}
