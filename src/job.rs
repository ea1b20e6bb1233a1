//! Publish job.
//!
//! Runs on a worker, possibly long after the event was captured and possibly
//! more than once. The enabled flag is checked again because settings may
//! have changed since the job was queued.

use crate::envelope::Envelope;
use crate::publisher::BrokerPublisher;
use crate::settings::ConfigResolver;
use serde_json::Value;
use tracing::{debug, warn};

/// Deferred publish of one captured envelope.
#[derive(Clone)]
pub struct PublishJob {
    config: ConfigResolver,
    publisher: BrokerPublisher,
}

impl PublishJob {
    pub fn new(config: ConfigResolver, publisher: BrokerPublisher) -> Self {
        Self { config, publisher }
    }

    /// Run the job with its queued argument.
    pub async fn run(&self, argument: Value) {
        match self.config.is_enabled().await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Publishing disabled, dropping queued event");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Failed to read enabled flag, publish job skipped");
                return;
            }
        }

        if !argument.is_object() {
            warn!("Publish job argument is not an object");
            return;
        }

        let envelope: Envelope = match serde_json::from_value(argument) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Publish job argument is not an event envelope");
                return;
            }
        };

        self.publisher.publish(&envelope).await;
    }
}
