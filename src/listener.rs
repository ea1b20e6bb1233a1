//! Dispatch listener.
//!
//! The host calls [`DispatchListener::on_event`] for every event it raises,
//! in-line with its own dispatch. The listener only normalizes and queues;
//! publishing happens later in [`PublishJob`](crate::job::PublishJob).
//! Nothing that goes wrong in here reaches the host.

use crate::envelope::{Envelope, Meta};
use crate::inspect::Inspect;
use crate::normalize::normalize;
use crate::queue::{JobQueue, QueueError};
use crate::settings::{ConfigResolver, SettingsError};
use crate::PUBLISH_JOB;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Failure to resolve the acting user.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct PrincipalError(pub String);

/// Errors on the capture path. Logged, never returned to the host.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("principal lookup failed: {0}")]
    Principal(#[from] PrincipalError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Who is acting when an event is raised.
pub trait PrincipalSource: Send + Sync {
    /// Id of the current user, `None` outside a user session.
    fn current_user_id(&self) -> Result<Option<String>, PrincipalError>;
}

/// A fixed principal, e.g. one taken from a request header.
impl PrincipalSource for Option<String> {
    fn current_user_id(&self) -> Result<Option<String>, PrincipalError> {
        Ok(self.clone())
    }
}

/// Time source for capture timestamps.
pub trait Clock: Send + Sync {
    /// Seconds since the epoch.
    fn now(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// A clock stuck at one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub i64);

impl Clock for FixedClock {
    fn now(&self) -> i64 {
        self.0
    }
}

/// Best-effort name of the local machine.
pub fn local_host_name() -> Option<String> {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
}

/// Captures host events and queues them for publishing.
#[derive(Clone)]
pub struct DispatchListener {
    config: ConfigResolver,
    queue: Arc<dyn JobQueue>,
    principal: Arc<dyn PrincipalSource>,
    clock: Arc<dyn Clock>,
}

impl DispatchListener {
    /// Listener with no session principal and the system clock.
    pub fn new(config: ConfigResolver, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            config,
            queue,
            principal: Arc::new(None::<String>),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_principal(mut self, principal: Arc<dyn PrincipalSource>) -> Self {
        self.principal = principal;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Handle one event using the listener's own principal source.
    pub async fn on_event(&self, event: &dyn Inspect) {
        self.on_event_as(event, self.principal.as_ref()).await;
    }

    /// Handle one event raised on behalf of `principal`.
    pub async fn on_event_as(&self, event: &dyn Inspect, principal: &dyn PrincipalSource) {
        match self.config.is_enabled().await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!(error = %e, "Failed to read enabled flag, event not queued");
                return;
            }
        }

        if let Err(e) = self.capture(event, principal).await {
            warn!(
                error = %e,
                class = %event.type_name(),
                "Failed to enqueue publish job"
            );
        }
    }

    async fn capture(
        &self,
        event: &dyn Inspect,
        principal: &dyn PrincipalSource,
    ) -> Result<(), ListenerError> {
        let normalized = normalize(event);

        let meta = Meta::new(self.clock.now())
            .with_current_user_id(principal.current_user_id()?)
            .with_host(local_host_name());

        let envelope = Envelope::new(meta, normalized);
        let payload = serde_json::to_value(&envelope)?;

        self.queue.add(PUBLISH_JOB, payload).await?;

        debug!(
            class = %envelope.event().class,
            values = envelope.event().values.len(),
            "Event queued for publishing"
        );
        Ok(())
    }
}
