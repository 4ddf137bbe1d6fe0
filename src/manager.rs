//! The public facade tying the pieces together.
//!
//! [`MqttManager`] validates a [`Config`] and, given a transport and its
//! event feed, wires up the subscription registry, connection manager and
//! publisher into a ready-to-use [`MqttInstance`]. The instance is the only
//! type applications normally interact with.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::connection::ConnectionManager;
use crate::error::ClientError;
use crate::publisher::Publisher;
use crate::registry::{Subscription, SubscriptionRegistry};
use crate::retry::BackoffPolicy;
use crate::state::ConnectionState;
use crate::transport::{MessageHandler, QoS, Transport, TransportEvent};
use validator::Validate;

/// Builder that validates configuration before any connection work starts.
#[derive(Debug, Clone)]
pub struct MqttManager {
    config: Config,
}

impl MqttManager {
    /// Validates the configuration; invalid settings fail here, not at
    /// connect time.
    pub fn from_config(config: Config) -> Result<Self, ClientError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// The validated configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Wires the components over the given transport and starts the
    /// connection lifecycle in the background.
    ///
    /// `events` must be the receiving side of the channel the transport
    /// emits its [`TransportEvent`]s on. Returns immediately; the initial
    /// connect proceeds asynchronously with retries.
    pub fn build_and_start(
        &self,
        transport: Arc<dyn Transport>,
        events: mpsc::Receiver<TransportEvent>,
    ) -> MqttInstance {
        info!(
            "starting MQTT client for {} (client id: {})",
            self.config.server_uri,
            self.config.effective_client_id()
        );

        let cancel = CancellationToken::new();
        let registry = Arc::new(SubscriptionRegistry::new(
            Arc::clone(&transport),
            cancel.clone(),
        ));
        let connection = ConnectionManager::start(
            Arc::clone(&transport),
            events,
            Arc::clone(&registry),
            &self.config,
            cancel.clone(),
        );
        let publisher = Publisher::new(
            transport,
            Arc::clone(&connection),
            BackoffPolicy::publish(self.config.publish.clone()),
            cancel.clone(),
        );

        MqttInstance {
            connection,
            registry,
            publisher,
            cancel,
        }
    }
}

/// A running client: managed connection, subscription registry, publisher.
///
/// Cheap to clone; clones share the same underlying client.
#[derive(Debug, Clone)]
pub struct MqttInstance {
    connection: Arc<ConnectionManager>,
    registry: Arc<SubscriptionRegistry>,
    publisher: Publisher,
    cancel: CancellationToken,
}

impl MqttInstance {
    /// Records a desired subscription; see
    /// [`SubscriptionRegistry::register`].
    pub async fn subscribe(&self, topic: &str, qos: QoS, handler: Arc<dyn MessageHandler>) {
        self.registry.register(topic, qos, handler).await;
    }

    /// Removes a desired subscription; see
    /// [`SubscriptionRegistry::unregister`].
    pub async fn unsubscribe(&self, topic: &str, qos: QoS) {
        self.registry.unregister(topic, qos).await;
    }

    /// Publishes one message with retries; see [`Publisher::publish`].
    pub async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), ClientError> {
        self.publisher.publish(topic, payload, qos, retain).await
    }

    /// Fire-and-forget publish; see [`Publisher::publish_async`].
    pub fn publish_async(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> tokio::task::JoinHandle<Result<(), ClientError>> {
        self.publisher.publish_async(topic, payload, qos, retain)
    }

    /// Whether the managed connection is currently established.
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Current lifecycle state of the managed connection.
    pub async fn state(&self) -> ConnectionState {
        self.connection.state().await
    }

    /// Snapshot of the desired subscription set.
    pub async fn subscriptions(&self) -> Vec<Subscription> {
        self.registry.list().await
    }

    /// Token observed by all background work; cancelled by [`shutdown`].
    ///
    /// [`shutdown`]: MqttInstance::shutdown
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Stops background work, disconnects and releases the transport.
    pub async fn shutdown(&self) {
        self.connection.shutdown().await;
    }
}
