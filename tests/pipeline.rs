//! Capture-to-broker tests: listener, memory queue, publish job, memory broker.

use async_trait::async_trait;
use event_relay::envelope::{Envelope, Meta};
use event_relay::listener::FixedClock;
use event_relay::normalize::NormalizedEvent;
use event_relay::publisher::MemoryBroker;
use event_relay::queue::MemoryJobQueue;
use event_relay::settings::{MemorySettingStore, SettingStore, SettingsError};
use event_relay::{
    BrokerPublisher, ConfigResolver, DispatchListener, DynamicObject, PublishJob, Reflected,
    APP_ID, PUBLISH_JOB,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

struct Relay {
    store: Arc<MemorySettingStore>,
    queue: Arc<MemoryJobQueue>,
    listener: DispatchListener,
    job: PublishJob,
}

fn relay(broker: &MemoryBroker) -> Relay {
    let store = Arc::new(MemorySettingStore::with_values(
        APP_ID,
        [
            ("routing_prefix", "nextcloud"),
            ("exchange", "nextcloud.events"),
            ("exchange_type", "topic"),
        ],
    ));
    let queue = Arc::new(MemoryJobQueue::new());
    let config = ConfigResolver::with_env(store.clone(), Arc::new(HashMap::<String, String>::new()));

    let listener = DispatchListener::new(config.clone(), queue.clone())
        .with_clock(Arc::new(FixedClock(1765447200)))
        .with_principal(Arc::new(Some("admin".to_string())));
    let job = PublishJob::new(
        config.clone(),
        BrokerPublisher::new(config, Arc::new(broker.clone())),
    );

    Relay {
        store,
        queue,
        listener,
        job,
    }
}

impl Relay {
    /// Run every queued job, as the worker would.
    async fn run_queued(&self) {
        for queued in self.queue.drain() {
            assert_eq!(queued.job_type, PUBLISH_JOB);
            self.job.run(queued.argument).await;
        }
    }
}

fn user_created() -> DynamicObject {
    DynamicObject::new("UserCreatedEvent").value("getUserId", "u123")
}

#[tokio::test]
async fn test_user_created_reaches_exchange() {
    let broker = MemoryBroker::new();
    let relay = relay(&broker);

    relay.listener.on_event(&user_created()).await;
    assert_eq!(relay.queue.len(), 1);
    relay.run_queued().await;

    let messages = broker.published();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].exchange, "nextcloud.events");
    assert_eq!(messages[0].routing_key, "nextcloud.usercreatedevent");
    assert_eq!(messages[0].properties.content_type, "application/json");
    assert_eq!(messages[0].properties.delivery_mode, 2);

    let body = String::from_utf8(messages[0].body.clone()).unwrap();
    assert!(body.contains(r#""values":{"getUserId":"u123"}"#));

    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["meta"]["appId"], APP_ID);
    assert_eq!(body["meta"]["timestamp"], 1765447200);
    assert_eq!(body["meta"]["currentUserId"], "admin");
    assert_eq!(body["event"]["class"], "UserCreatedEvent");

    assert_eq!(
        broker.exchanges(),
        vec![("nextcloud.events".to_string(), "topic".to_string(), true)]
    );
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn test_nested_values_are_summarized() {
    let broker = MemoryBroker::new();
    let relay = relay(&broker);

    let node = DynamicObject::new("OC\\Files\\Node\\File")
        .value("getPath", "/alice/files/report.pdf")
        .value("getSize", 2048);
    let storage = DynamicObject::new("OC\\Files\\Storage\\Local");
    let event = DynamicObject::new("OCP\\Files\\Events\\Node\\NodeWrittenEvent")
        .value("getNode", Reflected::object(node))
        .value("getStorage", Reflected::object(storage))
        .value("getTags", vec![vec!["a"], vec!["b", "c"]])
        .failing("getOwner", "session closed")
        .value("stopPropagation", true);

    relay.listener.on_event(&event).await;
    relay.run_queued().await;

    let messages = broker.published();
    assert_eq!(messages.len(), 1);
    assert_eq!(
        messages[0].routing_key,
        "nextcloud.ocp.files.events.node.nodewrittenevent"
    );

    let body: Value = serde_json::from_slice(&messages[0].body).unwrap();
    assert_eq!(
        body["event"]["values"],
        json!({
            "getNode": {
                "_class": "OC\\Files\\Node\\File",
                "getPath": "/alice/files/report.pdf"
            },
            "getStorage": "[OC\\Files\\Storage\\Local]",
            "getTags": [["a"], ["b", "c"]]
        })
    );
}

#[tokio::test]
async fn test_unreachable_broker_does_not_stop_capture() {
    let broker = MemoryBroker::unreachable();
    let relay = relay(&broker);

    relay.listener.on_event(&user_created()).await;
    relay.run_queued().await;
    assert!(broker.published().is_empty());

    // Later events are still captured and publish once the broker is back
    relay.listener.on_event(&user_created()).await;
    assert_eq!(relay.queue.len(), 1);

    broker.set_reachable(true);
    relay.run_queued().await;
    assert_eq!(broker.published().len(), 1);
}

#[tokio::test]
async fn test_disabled_relay_queues_nothing() {
    let broker = MemoryBroker::new();
    let relay = relay(&broker);
    relay
        .store
        .set_value(APP_ID, "publish_enabled", "0")
        .await
        .unwrap();

    relay.listener.on_event(&user_created()).await;

    assert!(relay.queue.is_empty());
    assert_eq!(broker.connections_opened(), 0);
}

#[tokio::test]
async fn test_existing_exchange_is_redeclared() {
    let broker = MemoryBroker::new();
    broker.preset_exchange("nextcloud.events", "topic");
    let relay = relay(&broker);

    relay.listener.on_event(&user_created()).await;
    relay.listener.on_event(&user_created()).await;
    relay.run_queued().await;

    assert_eq!(broker.published().len(), 2);
    assert_eq!(broker.connections_opened(), 2);
}

#[tokio::test]
async fn test_mismatched_exchange_type_drops_message() {
    let broker = MemoryBroker::new();
    broker.preset_exchange("nextcloud.events", "fanout");
    let relay = relay(&broker);

    relay.listener.on_event(&user_created()).await;
    relay.run_queued().await;

    assert!(broker.published().is_empty());
    assert_eq!(broker.open_connections(), 0);
}

/// Setting store whose backend is down.
struct UnreachableStore;

#[async_trait]
impl SettingStore for UnreachableStore {
    async fn get_value(&self, _scope: &str, _key: &str) -> Result<Option<String>, SettingsError> {
        Err(SettingsError::Connection("connection refused".to_string()))
    }

    async fn set_value(&self, _scope: &str, _key: &str, _value: &str) -> Result<(), SettingsError> {
        Err(SettingsError::Connection("connection refused".to_string()))
    }

    async fn delete_value(&self, _scope: &str, _key: &str) -> Result<(), SettingsError> {
        Err(SettingsError::Connection("connection refused".to_string()))
    }
}

fn unreachable_settings() -> ConfigResolver {
    ConfigResolver::with_env(
        Arc::new(UnreachableStore),
        Arc::new(HashMap::<String, String>::new()),
    )
}

#[tokio::test]
async fn test_settings_outage_during_capture_queues_nothing() {
    let queue = Arc::new(MemoryJobQueue::new());
    let listener = DispatchListener::new(unreachable_settings(), queue.clone());

    listener.on_event(&user_created()).await;

    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_settings_outage_during_job_opens_no_connection() {
    let broker = MemoryBroker::new();
    let config = unreachable_settings();
    let job = PublishJob::new(
        config.clone(),
        BrokerPublisher::new(config, Arc::new(broker.clone())),
    );

    job.run(json!({
        "meta": {"timestamp": 1765447200, "currentUserId": null, "host": null, "appId": APP_ID},
        "event": {"class": "UserCreatedEvent", "interfaces": [], "values": {}}
    }))
    .await;

    assert_eq!(broker.connections_opened(), 0);
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn test_settings_outage_during_publish_returns() {
    let broker = MemoryBroker::new();
    let publisher = BrokerPublisher::new(unreachable_settings(), Arc::new(broker.clone()));
    let envelope = Envelope::new(
        Meta::new(1765447200),
        NormalizedEvent {
            class: "UserCreatedEvent".to_string(),
            interfaces: vec![],
            values: serde_json::Map::new(),
        },
    );

    publisher.publish(&envelope).await;

    assert_eq!(broker.connections_opened(), 0);
    assert!(broker.published().is_empty());
}
