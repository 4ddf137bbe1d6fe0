//! Publishing with per-message retry.
//!
//! The [`Publisher`] pushes one message through the retry executor with the
//! publish policy. Every attempt first consults the connection manager's
//! state: when disconnected, the attempt fails with
//! [`TransportError::NotConnected`], which is transient, so a reconnect
//! completing mid-backoff lets a later attempt of the same publish succeed.
//!
//! No queueing, persistence or deduplication happens here. A publish that
//! exhausts its budget is reported to the caller and dropped; retries of a
//! QoS > 0 message may produce broker-side duplicates, which is inherent to
//! at-least-once delivery.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::ConnectionManager;
use crate::error::{ClientError, TransportError};
use crate::retry::{self, BackoffPolicy};
use crate::transport::{QoS, Transport};

/// Retrying publisher bound to one managed connection.
///
/// Cheap to clone; clones share the transport and policy.
#[derive(Clone)]
pub struct Publisher {
    transport: Arc<dyn Transport>,
    manager: Arc<ConnectionManager>,
    policy: Arc<BackoffPolicy>,
    cancel: CancellationToken,
}

impl Publisher {
    /// Builds a publisher over the given transport and connection manager.
    pub fn new(
        transport: Arc<dyn Transport>,
        manager: Arc<ConnectionManager>,
        policy: BackoffPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            manager,
            policy: Arc::new(policy),
            cancel,
        }
    }

    /// Publishes one message, retrying per the publish policy.
    ///
    /// Returns once the broker accepted the message, or with
    /// [`ClientError::RetryExhausted`] after the last failed attempt, or
    /// with [`ClientError::Interrupted`] when shutdown cancels a pending
    /// backoff wait.
    pub async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), ClientError> {
        let transport = Arc::clone(&self.transport);
        let manager = Arc::clone(&self.manager);
        let topic_owned = topic.to_string();
        let payload_owned = payload.to_vec();

        retry::execute(self.policy.as_ref(), &self.cancel, topic, move || {
            let transport = Arc::clone(&transport);
            let manager = Arc::clone(&manager);
            let topic = topic_owned.clone();
            let payload = payload_owned.clone();
            async move {
                if !manager.is_connected() {
                    return Err(TransportError::NotConnected);
                }
                transport.publish(&topic, &payload, qos, retain).await
            }
        })
        .await?;

        debug!("published {} bytes to '{}'", payload.len(), topic);
        Ok(())
    }

    /// Fire-and-forget variant: spawns the publish onto the runtime and
    /// returns a handle the caller may await or drop.
    pub fn publish_async(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> JoinHandle<Result<(), ClientError>> {
        let this = self.clone();
        let topic = topic.to_string();
        let payload = payload.to_vec();
        tokio::spawn(async move { this.publish(&topic, &payload, qos, retain).await })
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("connected", &self.manager.is_connected())
            .finish_non_exhaustive()
    }
}
