//! The message queued for delivery and finally published.
//!
//! An [`Envelope`] wraps a [`NormalizedEvent`] with capture-time metadata.
//! It is built once by the listener and then only read: the publish job
//! receives exactly what was captured.
//!
//! # Example
//!
//! ```json
//! {
//!   "meta": {
//!     "timestamp": 1765447200,
//!     "currentUserId": "alice",
//!     "host": "cloud-01",
//!     "appId": "webhook_rabbitmq"
//!   },
//!   "event": {
//!     "class": "OCA\\Files\\Event\\NodeCreatedEvent",
//!     "interfaces": ["OCP\\EventDispatcher\\Event"],
//!     "values": {"getPath": "/alice/files/report.pdf"}
//!   }
//! }
//! ```

use crate::normalize::NormalizedEvent;
use crate::APP_ID;
use serde::{Deserialize, Serialize};

/// Capture-time metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    /// Seconds since the epoch when the event was captured
    timestamp: i64,

    /// Acting user at capture time
    #[serde(rename = "currentUserId")]
    current_user_id: Option<String>,

    /// Host name of the capturing machine
    host: Option<String>,

    /// Identifier of this integration
    #[serde(rename = "appId")]
    app_id: String,
}

impl Meta {
    pub fn new(timestamp: i64) -> Self {
        Self {
            timestamp,
            current_user_id: None,
            host: None,
            app_id: APP_ID.to_string(),
        }
    }

    /// Set the acting user
    pub fn with_current_user_id(mut self, user_id: Option<String>) -> Self {
        self.current_user_id = user_id;
        self
    }

    /// Set the host name
    pub fn with_host(mut self, host: Option<String>) -> Self {
        self.host = host;
        self
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn current_user_id(&self) -> Option<&str> {
        self.current_user_id.as_deref()
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }
}

/// A normalized event plus its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    meta: Meta,
    event: NormalizedEvent,
}

impl Envelope {
    pub fn new(meta: Meta, event: NormalizedEvent) -> Self {
        Self { meta, event }
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn event(&self) -> &NormalizedEvent {
        &self.event
    }

    /// Routing key for this envelope: `<prefix>.<class>`, with namespace
    /// separators turned into dots and everything lowercased.
    pub fn routing_key(&self, prefix: &str) -> String {
        let class = if self.event.class.is_empty() {
            "unknown".to_string()
        } else {
            self.event.class.replace('\\', ".").to_lowercase()
        };
        format!("{}.{}", prefix, class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map, Value};

    fn test_envelope(class: &str) -> Envelope {
        let mut values = Map::new();
        values.insert("getUserId".to_string(), json!("u123"));
        Envelope::new(
            Meta::new(1765447200)
                .with_current_user_id(Some("alice".to_string()))
                .with_host(Some("cloud-01".to_string())),
            NormalizedEvent {
                class: class.to_string(),
                interfaces: vec!["OCP\\EventDispatcher\\Event".to_string()],
                values,
            },
        )
    }

    #[test]
    fn test_routing_key() {
        let envelope = test_envelope("Foo\\Bar\\BazEvent");
        assert_eq!(envelope.routing_key("nextcloud"), "nextcloud.foo.bar.bazevent");
    }

    #[test]
    fn test_routing_key_without_namespace() {
        let envelope = test_envelope("UserCreatedEvent");
        assert_eq!(envelope.routing_key("nextcloud"), "nextcloud.usercreatedevent");
    }

    #[test]
    fn test_routing_key_empty_class() {
        let envelope = test_envelope("");
        assert_eq!(envelope.routing_key("nc"), "nc.unknown");
    }

    #[test]
    fn test_envelope_serialize() {
        let value = serde_json::to_value(test_envelope("UserCreatedEvent")).unwrap();

        assert_eq!(
            value,
            json!({
                "meta": {
                    "timestamp": 1765447200,
                    "currentUserId": "alice",
                    "host": "cloud-01",
                    "appId": "webhook_rabbitmq"
                },
                "event": {
                    "class": "UserCreatedEvent",
                    "interfaces": ["OCP\\EventDispatcher\\Event"],
                    "values": {"getUserId": "u123"}
                }
            })
        );
    }

    #[test]
    fn test_missing_user_serializes_as_null() {
        let envelope = Envelope::new(
            Meta::new(0),
            NormalizedEvent {
                class: "X".to_string(),
                interfaces: vec![],
                values: Map::new(),
            },
        );

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["meta"]["currentUserId"], Value::Null);
        assert_eq!(value["meta"]["host"], Value::Null);
    }

    #[test]
    fn test_envelope_survives_queue_round_trip() {
        let envelope = test_envelope("OCA\\Test\\Event");
        let stored = serde_json::to_string(&envelope).unwrap();
        let restored: Envelope = serde_json::from_str(&stored).unwrap();

        assert_eq!(restored, envelope);
        assert_eq!(restored.meta().current_user_id(), Some("alice"));
        assert_eq!(restored.meta().app_id(), APP_ID);
    }
}
