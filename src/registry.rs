//! Durable record of desired topic subscriptions.
//!
//! The registry owns the mapping of `(topic, qos)` to handler and is the
//! single source of truth for "what should be subscribed". The broker-side
//! subscription state converges toward the registry, never the other way
//! around: entries are added and removed only by explicit calls, and the
//! connection manager replays the full set after every reconnect.
//!
//! Resynchronization is idempotent and partial-failure tolerant: a topic
//! that fails to resubscribe is logged and skipped, and the next reconnect
//! cycle tries it again. A `register` call racing a resync pass defers its
//! immediate subscribe; the entry is still recorded, so convergence may take
//! one extra reconnect cycle. That window is by contract eventual, not a
//! bug.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::transport::{MessageHandler, QoS, Transport};

/// Pause between successive subscribe calls during a resync pass, so a large
/// set does not hit the broker as a single burst.
const RESUBSCRIBE_PACING: Duration = Duration::from_millis(10);

/// One desired subscription: topic filter, QoS level and handler.
///
/// Keyed by `(topic, qos)`, not topic alone: the same topic registered at
/// two QoS levels is two independent entries.
#[derive(Clone)]
pub struct Subscription {
    topic: String,
    qos: QoS,
    handler: Arc<dyn MessageHandler>,
}

impl Subscription {
    /// The topic filter (may contain wildcards).
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The QoS level requested for this subscription.
    pub fn qos(&self) -> QoS {
        self.qos
    }

    /// The handler inbound messages are routed to.
    pub fn handler(&self) -> Arc<dyn MessageHandler> {
        self.handler.clone()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("qos", &self.qos)
            .finish_non_exhaustive()
    }
}

/// Registry of desired subscriptions with replay onto the live connection.
///
/// Holds a reference to the transport so it can issue subscribe calls
/// itself; it never transitions connection state, that is the connection
/// manager's job.
pub struct SubscriptionRegistry {
    transport: Arc<dyn Transport>,
    entries: RwLock<HashMap<(String, QoS), Subscription>>,
    resyncing: AtomicBool,
    cancel: CancellationToken,
}

impl SubscriptionRegistry {
    /// Creates an empty registry backed by the given transport.
    pub fn new(transport: Arc<dyn Transport>, cancel: CancellationToken) -> Self {
        Self {
            transport,
            entries: RwLock::new(HashMap::new()),
            resyncing: AtomicBool::new(false),
            cancel,
        }
    }

    /// Records a desired subscription; last write wins per `(topic, qos)`.
    ///
    /// If the connection is currently established and no resync pass is in
    /// progress, a subscribe call is issued immediately; a failure there is
    /// logged and left to the next reconnect cycle. Registration itself
    /// never fails for connectivity reasons.
    pub async fn register(&self, topic: &str, qos: QoS, handler: Arc<dyn MessageHandler>) {
        let subscription = Subscription {
            topic: topic.to_string(),
            qos,
            handler: handler.clone(),
        };
        {
            let mut entries = self.entries.write().await;
            entries.insert((topic.to_string(), qos), subscription);
        }

        if self.transport.is_connected() && !self.resyncing.load(Ordering::Acquire) {
            match self.transport.subscribe(topic, qos, handler).await {
                Ok(()) => debug!("subscribed to topic: {} with QoS {}", topic, qos.as_u8()),
                Err(e) => warn!(
                    "immediate subscribe to '{}' failed (will retry on reconnect): {}",
                    topic, e
                ),
            }
        }
    }

    /// Removes a desired subscription and, if connected, unsubscribes.
    ///
    /// Unsubscribe failures are logged and not surfaced: the entry is
    /// already gone from the desired set, which is what matters.
    pub async fn unregister(&self, topic: &str, qos: QoS) {
        let removed = {
            let mut entries = self.entries.write().await;
            entries.remove(&(topic.to_string(), qos))
        };
        if removed.is_none() {
            debug!("unregister for unknown subscription: {} QoS {}", topic, qos.as_u8());
        }

        if self.transport.is_connected() {
            if let Err(e) = self.transport.unsubscribe(topic).await {
                warn!("failed to unsubscribe from '{}': {}", topic, e);
            }
        }
    }

    /// Replays the full desired set onto the active connection.
    ///
    /// Idempotent and safe to call concurrently with `register`: the resync
    /// flag makes concurrent registrations skip their immediate subscribe so
    /// nothing is double-subscribed. Overlapping triggers (a reconnect event
    /// racing the health probe) coalesce into one pass: whoever wins the
    /// flag runs, the other returns immediately. Failures on individual
    /// topics are logged and do not abort the pass; no per-topic retry
    /// happens here, a later reconnect cycle converges the rest.
    pub async fn resubscribe_all(&self) {
        if self
            .resyncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("resubscription pass already in progress");
            return;
        }

        let snapshot: Vec<Subscription> = {
            let entries = self.entries.read().await;
            entries.values().cloned().collect()
        };

        if snapshot.is_empty() {
            debug!("no topics to resubscribe");
            self.resyncing.store(false, Ordering::Release);
            return;
        }

        info!("resubscribing to {} topics after reconnection", snapshot.len());
        for subscription in snapshot {
            match self
                .transport
                .subscribe(
                    subscription.topic(),
                    subscription.qos(),
                    subscription.handler(),
                )
                .await
            {
                Ok(()) => debug!(
                    "resubscribed to topic: {} with QoS {}",
                    subscription.topic(),
                    subscription.qos().as_u8()
                ),
                Err(e) => error!(
                    "failed to resubscribe to topic: {}: {}",
                    subscription.topic(),
                    e
                ),
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    warn!("resubscription pass interrupted by shutdown");
                    break;
                }
                _ = tokio::time::sleep(RESUBSCRIBE_PACING) => {}
            }
        }

        self.resyncing.store(false, Ordering::Release);
        info!("resubscription pass completed");
    }

    /// Snapshot of the desired subscription set.
    pub async fn list(&self) -> Vec<Subscription> {
        let entries = self.entries.read().await;
        entries.values().cloned().collect()
    }

    /// Number of desired subscriptions.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// True when no subscriptions are registered.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("resyncing", &self.resyncing.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::transport::mock::MockTransport;
    use crate::transport::InboundMessage;

    fn noop_handler() -> Arc<dyn MessageHandler> {
        Arc::new(|_msg: InboundMessage| {})
    }

    #[tokio::test]
    async fn test_register_while_connected_subscribes_immediately() {
        let transport = MockTransport::new();
        transport.set_connected(true);
        let registry = SubscriptionRegistry::new(transport.clone(), CancellationToken::new());

        registry
            .register("sensor/temp", QoS::AtLeastOnce, noop_handler())
            .await;

        assert_eq!(
            transport.subscribe_log(),
            vec![("sensor/temp".to_string(), QoS::AtLeastOnce)]
        );
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_register_while_disconnected_only_records() {
        let transport = MockTransport::new();
        let registry = SubscriptionRegistry::new(transport.clone(), CancellationToken::new());

        registry
            .register("sensor/temp", QoS::AtMostOnce, noop_handler())
            .await;

        assert!(transport.subscribe_log().is_empty());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_register_failure_still_records_entry() {
        let transport = MockTransport::new();
        transport.set_connected(true);
        transport.fail_next_subscribe(TransportError::Io("queue full".into()));
        let registry = SubscriptionRegistry::new(transport.clone(), CancellationToken::new());

        registry
            .register("sensor/temp", QoS::AtLeastOnce, noop_handler())
            .await;

        // Immediate subscribe failed but the desired state is kept.
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_same_topic_two_qos_levels_are_independent() {
        let transport = MockTransport::new();
        let registry = SubscriptionRegistry::new(transport.clone(), CancellationToken::new());

        registry
            .register("sensor/temp", QoS::AtMostOnce, noop_handler())
            .await;
        registry
            .register("sensor/temp", QoS::AtLeastOnce, noop_handler())
            .await;

        assert_eq!(registry.len().await, 2);

        registry.unregister("sensor/temp", QoS::AtMostOnce).await;
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.list().await[0].qos(), QoS::AtLeastOnce);
    }

    #[tokio::test]
    async fn test_register_same_key_twice_is_last_write_wins() {
        let transport = MockTransport::new();
        let registry = SubscriptionRegistry::new(transport.clone(), CancellationToken::new());

        registry
            .register("cmd/#", QoS::AtLeastOnce, noop_handler())
            .await;
        registry
            .register("cmd/#", QoS::AtLeastOnce, noop_handler())
            .await;

        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_all_is_idempotent() {
        let transport = MockTransport::new();
        transport.set_connected(true);
        let registry = SubscriptionRegistry::new(transport.clone(), CancellationToken::new());

        // Record entries without immediate subscribes.
        transport.set_connected(false);
        for topic in ["a", "b", "c"] {
            registry
                .register(topic, QoS::AtLeastOnce, noop_handler())
                .await;
        }
        transport.set_connected(true);

        registry.resubscribe_all().await;
        assert_eq!(transport.subscribe_log().len(), 3);
        assert_eq!(registry.len().await, 3);

        registry.resubscribe_all().await;
        assert_eq!(transport.subscribe_log().len(), 6);
        assert_eq!(registry.len().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_all_with_empty_set_is_a_noop() {
        let transport = MockTransport::new();
        transport.set_connected(true);
        let registry = SubscriptionRegistry::new(transport.clone(), CancellationToken::new());

        registry.resubscribe_all().await;
        assert!(transport.subscribe_log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_all_tolerates_partial_failure() {
        let transport = MockTransport::new();
        transport.set_connected(true);
        let registry = SubscriptionRegistry::new(transport.clone(), CancellationToken::new());

        transport.set_connected(false);
        for topic in ["a", "b", "c"] {
            registry
                .register(topic, QoS::AtMostOnce, noop_handler())
                .await;
        }
        transport.set_connected(true);
        transport.fail_next_subscribe(TransportError::Timeout);

        registry.resubscribe_all().await;

        // One topic failed, the other two still went through.
        assert_eq!(transport.subscribe_log().len(), 2);
        assert_eq!(registry.len().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_during_resync_defers_immediate_subscribe() {
        let transport = MockTransport::new();
        let registry = Arc::new(SubscriptionRegistry::new(
            transport.clone(),
            CancellationToken::new(),
        ));

        transport.set_connected(false);
        registry.register("a", QoS::AtLeastOnce, noop_handler()).await;
        transport.set_connected(true);

        let resync = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.resubscribe_all().await })
        };
        // Let the pass subscribe "a" and park on its pacing sleep.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(transport.subscribe_log().len(), 1);

        registry.register("b", QoS::AtLeastOnce, noop_handler()).await;

        // Recorded, but the immediate subscribe was deferred: the pass in
        // flight owns the connection's subscribe traffic.
        assert_eq!(registry.len().await, 2);
        assert_eq!(transport.subscribe_log().len(), 1);

        resync.await.unwrap();

        // The next pass picks the deferred entry up.
        registry.resubscribe_all().await;
        assert_eq!(transport.subscribe_log().len(), 3);
        assert!(transport.subscribe_log().iter().any(|(t, _)| t == "b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_resync_triggers_coalesce_into_one_pass() {
        let transport = MockTransport::new();
        let registry = Arc::new(SubscriptionRegistry::new(
            transport.clone(),
            CancellationToken::new(),
        ));

        transport.set_connected(false);
        for topic in ["a", "b", "c"] {
            registry
                .register(topic, QoS::AtMostOnce, noop_handler())
                .await;
        }
        transport.set_connected(true);

        let first = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.resubscribe_all().await })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        // A second trigger mid-pass returns without duplicating subscribes.
        registry.resubscribe_all().await;
        first.await.unwrap();

        assert_eq!(transport.subscribe_log().len(), 3);
    }

    #[tokio::test]
    async fn test_unregister_while_connected_unsubscribes() {
        let transport = MockTransport::new();
        transport.set_connected(true);
        let registry = SubscriptionRegistry::new(transport.clone(), CancellationToken::new());

        registry
            .register("sensor/temp", QoS::AtLeastOnce, noop_handler())
            .await;
        registry.unregister("sensor/temp", QoS::AtLeastOnce).await;

        assert_eq!(transport.unsubscribe_calls(), 1);
        assert!(registry.is_empty().await);
    }
}
