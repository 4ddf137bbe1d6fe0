//! Resilient client layer over an MQTT transport.
//!
//! Broker connections fail: the broker restarts, the network flaps, a load
//! balancer drops idle sessions. This crate keeps a client usable across all
//! of that with three cooperating pieces:
//!
//! - a generic **retry engine** ([`retry`]) driving any fallible async
//!   operation through a configurable backoff policy, with permanent
//!   failures (bad credentials, protocol mismatch) short-circuiting the
//!   attempt budget;
//! - a **connection manager** ([`connection`]) owning the lifecycle state
//!   machine, retrying the initial connect, and re-establishing lost
//!   connections with exactly one reconnect in flight at a time;
//! - a **subscription registry** ([`registry`]) remembering every desired
//!   subscription and replaying the full set after each reconnect, so
//!   broker-side state always converges back to what the application asked
//!   for.
//!
//! A retrying [`Publisher`] sits on top, checking connection state before
//! each attempt so a publish issued during an outage can still succeed once
//! the reconnect lands.
//!
//! The wire protocol itself is not implemented here. Implement [`Transport`]
//! over your MQTT stack of choice and feed its notifications through a
//! [`TransportEvent`] channel; everything else is wiring.
//!
//! # Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use mqtt_guardian::{Config, InboundMessage, MqttManager, QoS};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         server_uri: "tcp://mqtt.example.com:1883".into(),
//!         client_id: "gateway-01".into(),
//!         ..Default::default()
//!     };
//!
//!     let (transport, events) = my_transport::connect_pair(&config);
//!     let instance = MqttManager::from_config(config)?
//!         .build_and_start(Arc::new(transport), events);
//!
//!     instance
//!         .subscribe("sensor/#", QoS::AtLeastOnce, Arc::new(|msg: InboundMessage| {
//!             println!("{}: {} bytes", msg.topic, msg.payload.len());
//!         }))
//!         .await;
//!
//!     instance
//!         .publish("gateway/status", b"online", QoS::AtLeastOnce, true)
//!         .await?;
//!
//!     instance.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected ──connect attempt──> Connecting ──ack──> Connected
//!       ▲                                                   │
//!       └──────────────── connection lost ──────────────────┘
//!                  (backoff, then one reconnect)
//! ```
//!
//! After each reconnect the registry replays all subscriptions, preceded by
//! a short settle delay so the fresh session stabilizes first. A periodic
//! health probe (on by default) catches connects the event feed missed; the
//! replay it triggers is idempotent, so double-triggering is harmless.
//!
//! # Errors
//!
//! Operations return [`ClientError`]. Retryable failures surface as
//! [`ClientError::RetryExhausted`] carrying the attempt count and the last
//! underlying [`TransportError`]; shutdown during a backoff wait surfaces as
//! [`ClientError::Interrupted`]. See [`error`] for the full taxonomy.

pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod publisher;
pub mod registry;
pub mod retry;
pub mod state;
pub mod transport;

pub use config::{BackoffKind, Config, RetryConfig};
pub use connection::ConnectionManager;
pub use error::{ClientError, TransportError};
pub use manager::{MqttInstance, MqttManager};
pub use publisher::Publisher;
pub use registry::{Subscription, SubscriptionRegistry};
pub use retry::{BackoffPolicy, RetryContext, RetryPolicy};
pub use state::ConnectionState;
pub use transport::{
    ConnectOptions, InboundMessage, MessageHandler, QoS, Transport, TransportEvent,
};

/// Convenience alias for results carrying [`ClientError`].
pub type Result<T> = std::result::Result<T, ClientError>;
