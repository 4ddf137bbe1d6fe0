//! Error types for the resilient MQTT client layer.
//!
//! Two error types cover the whole crate:
//!
//! - [`TransportError`]: failures reported by the underlying protocol-client
//!   capability (the [`Transport`](crate::transport::Transport) trait). Each
//!   variant is classified as retryable or not via
//!   [`TransportError::is_retryable`].
//! - [`ClientError`]: the unified error returned by this crate's operations.
//!   It wraps transport failures and adds the terminal conditions this layer
//!   itself produces: retry exhaustion and cancellation.
//!
//! # Error Categories
//!
//! **Transient** (retried per policy): `Timeout`, `BrokerUnreachable`,
//! `NotConnected`, `Io`.
//!
//! **Permanent** (fail immediately regardless of remaining attempt budget):
//! `MalformedClient`, `UnsupportedProtocolVersion`, `InvalidClientId`,
//! `AuthenticationFailed`, `NotAuthorized`.
//!
//! **Terminal** (synthesized by this layer): `RetryExhausted` once the retry
//! budget is consumed, `Interrupted` when shutdown cancels a pending wait.
//!
//! # Usage
//!
//! Callers branch on "gave up after N tries" vs. the original failure class:
//!
//! ```ignore
//! match publisher.publish("sensor/temp", payload, QoS::AtLeastOnce, false).await {
//!     Ok(()) => {}
//!     Err(ClientError::RetryExhausted { attempts, source }) => {
//!         eprintln!("gave up after {attempts} attempts: {source}");
//!     }
//!     Err(e) => eprintln!("publish failed: {e}"),
//! }
//! ```

use thiserror::Error;

/// Failure reported by the external protocol-client capability.
///
/// Variants are deliberately coarse: this layer only needs to know how a
/// failure classifies for retry purposes, not the wire-level detail. The
/// payload strings carry the underlying cause for logging.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The client sent something the broker considers malformed.
    ///
    /// Indicates a local programming or configuration error. Never retried.
    #[error("malformed client request: {0}")]
    MalformedClient(String),

    /// The broker rejected the protocol version offered during CONNECT.
    ///
    /// Permanent incompatibility. Never retried.
    #[error("unsupported protocol version")]
    UnsupportedProtocolVersion,

    /// The broker rejected the client identifier.
    ///
    /// Usually an invalid or colliding client id. Never retried.
    #[error("invalid client identifier")]
    InvalidClientId,

    /// The broker rejected the supplied credentials.
    ///
    /// Retrying with the same credentials cannot succeed. Never retried.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// The client is authenticated but not authorized for the operation.
    ///
    /// Never retried.
    #[error("not authorized")]
    NotAuthorized,

    /// The operation did not complete within the transport's timeout.
    ///
    /// Transient; retried per policy.
    #[error("operation timed out")]
    Timeout,

    /// The broker could not be reached (DNS failure, refused connection,
    /// network down). Transient; retried per policy.
    #[error("broker unreachable: {0}")]
    BrokerUnreachable(String),

    /// The operation requires an established connection and there is none.
    ///
    /// Treated like any other transient failure: the connection manager may
    /// restore the connection before the retry budget runs out.
    #[error("client is not connected")]
    NotConnected,

    /// Generic I/O failure on an established connection.
    ///
    /// Transient; retried per policy. Carries the message only so the type
    /// stays cheap to clone into retry contexts.
    #[error("I/O error: {0}")]
    Io(String),
}

impl TransportError {
    /// Whether a retry can possibly succeed for this failure.
    ///
    /// Non-retryable failures short-circuit the retry loop regardless of the
    /// remaining attempt budget.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            TransportError::MalformedClient(_)
                | TransportError::UnsupportedProtocolVersion
                | TransportError::InvalidClientId
                | TransportError::AuthenticationFailed
                | TransportError::NotAuthorized
        )
    }
}

/// The unified error type for operations on this crate's public surface.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A transport failure that was not retried (retries disabled, or the
    /// caller invoked the transport directly).
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The retry budget for an operation was consumed without success.
    ///
    /// Always wraps the last underlying failure and the total attempt count,
    /// so callers can distinguish "gave up after N tries" from the original
    /// failure category.
    #[error("retry exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        /// Total attempts made, including the final failing one.
        attempts: u32,
        /// The failure observed on the last attempt.
        #[source]
        source: TransportError,
    },

    /// A pending retry wait was cancelled by shutdown.
    ///
    /// Terminal for the operation; never silently swallowed.
    #[error("operation interrupted by shutdown")]
    Interrupted,

    /// Configuration validation failed at build time.
    #[error("configuration error: {0}")]
    Config(#[from] validator::ValidationErrors),
}

impl ClientError {
    /// Returns the attempt count if this error is a retry exhaustion.
    pub fn exhausted_attempts(&self) -> Option<u32> {
        match self {
            ClientError::RetryExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}
