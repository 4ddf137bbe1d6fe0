//! The protocol-client capability boundary.
//!
//! The wire protocol itself (framing, QoS handshake, TLS) is not part of this
//! crate. This module defines the seam an implementation must fill:
//!
//! - [`Transport`]: the command side (connect, disconnect, publish,
//!   subscribe, unsubscribe, connection flag).
//! - [`TransportEvent`]: the event side, delivered asynchronously over a
//!   `tokio::sync::mpsc` channel on the transport's own task.
//!
//! The split mirrors the usual client/event-loop pairing of async MQTT
//! stacks: commands go down through a cheap cloneable handle, events come
//! back up through a single receiver consumed by the connection manager.
//!
//! Inbound application messages are handed to a [`MessageHandler`] as an
//! [`InboundMessage`]; translating raw payloads into application types is the
//! dispatch layer's job, not this crate's.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::TransportError;

/// Delivery guarantee level for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QoS {
    /// Fire and forget.
    AtMostOnce,
    /// Acknowledged delivery; duplicates possible.
    AtLeastOnce,
    /// Exactly-once handshake.
    ExactlyOnce,
}

impl QoS {
    /// Converts the wire-level numeric QoS into the enum.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    /// The wire-level numeric value.
    pub fn as_u8(&self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

/// A raw inbound message as handed to the dispatch layer.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Topic the message arrived on.
    pub topic: String,
    /// Raw payload bytes; interpretation is the handler's concern.
    pub payload: Vec<u8>,
    /// Delivery QoS the broker used.
    pub qos: QoS,
    /// Whether the broker flagged this as a retained message.
    pub retained: bool,
    /// Whether the broker flagged this as a possible duplicate.
    pub duplicate: bool,
    /// When the message was received locally.
    pub arrived_at: SystemTime,
}

/// Callback invoked for each inbound message on a subscribed topic.
///
/// Implemented automatically for plain closures:
///
/// ```ignore
/// let handler = Arc::new(|msg: InboundMessage| {
///     println!("{}: {} bytes", msg.topic, msg.payload.len());
/// });
/// ```
pub trait MessageHandler: Send + Sync {
    /// Called on the transport's delivery task; keep it cheap and offload
    /// heavy work.
    fn on_message(&self, message: InboundMessage);
}

impl<F> MessageHandler for F
where
    F: Fn(InboundMessage) + Send + Sync,
{
    fn on_message(&self, message: InboundMessage) {
        self(message)
    }
}

/// Options handed to [`Transport::connect`].
///
/// Derived once from [`Config`] at build time so the generated client id
/// stays stable across reconnects.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Broker address.
    pub server_uri: String,
    /// Client identifier, already resolved (never empty).
    pub client_id: String,
    /// Optional username.
    pub username: Option<String>,
    /// Optional password.
    pub password: Option<String>,
    /// Connect timeout.
    pub connection_timeout: Duration,
    /// Keep-alive interval.
    pub keep_alive: Duration,
    /// Clean-session flag.
    pub clean_session: bool,
}

impl ConnectOptions {
    /// Builds connect options from a validated configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            server_uri: config.server_uri.clone(),
            client_id: config.effective_client_id(),
            username: config.username.clone(),
            password: config.password.clone(),
            connection_timeout: Duration::from_secs(config.connection_timeout),
            keep_alive: Duration::from_secs(config.keep_alive),
            clean_session: config.clean_session,
        }
    }
}

/// Asynchronous notifications emitted by the transport.
///
/// Delivered on the transport's own task, in order, over the mpsc channel the
/// connection manager consumes.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A connect handshake completed.
    ConnectComplete {
        /// False for the first-ever connect, true for a reconnect after a
        /// loss. Reconnects trigger subscription resynchronization.
        is_reconnect: bool,
        /// The broker address the session was established against.
        server_uri: String,
    },
    /// The established connection was lost.
    ConnectionLost {
        /// Human-readable cause, for logging.
        cause: String,
    },
}

/// The external protocol-client capability.
///
/// Implementations wrap a concrete MQTT stack. All methods must be safe to
/// call from multiple tasks; this crate serializes connect/disconnect calls
/// under the connection manager's lock, but publish/subscribe may arrive
/// concurrently.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establishes a session with the broker.
    async fn connect(&self, options: &ConnectOptions) -> Result<(), TransportError>;

    /// Gracefully ends the current session. Safe to call when disconnected.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Releases the underlying resources. The transport is unusable
    /// afterwards.
    async fn close(&self) -> Result<(), TransportError>;

    /// Publishes one message.
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError>;

    /// Subscribes to a topic filter, routing inbound messages to `handler`.
    async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), TransportError>;

    /// Removes a broker-side subscription.
    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Current low-level connection flag.
    fn is_connected(&self) -> bool;
}

impl fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Transport {{ connected: {} }}", self.is_connected())
    }
}
