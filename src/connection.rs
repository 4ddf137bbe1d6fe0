//! Connection lifecycle management.
//!
//! The [`ConnectionManager`] owns the single logical broker connection and
//! its [`ConnectionState`]. It drives the initial connect and every
//! reconnect through the retry executor with the connect policy, consumes
//! the transport's event feed, and invokes the subscription registry at
//! exactly the moments broker-side state is at risk.
//!
//! # Behavior
//!
//! **Initial connect**: started immediately by [`ConnectionManager::start`].
//! If the whole retry budget is exhausted, the manager does not surface the
//! error; it logs and schedules a delayed reconnect, so construction never
//! blocks indefinitely and never crashes the owning process.
//!
//! **Connection lost**: state goes to `Disconnected` and exactly one
//! reconnect is scheduled, after a delay computed from the connect backoff
//! at attempt count 1. Every distinct loss starts a fresh backoff series.
//! The internal reconnect loop never surfaces exhaustion to callers; it logs
//! and schedules another cycle for as long as automatic reconnect is
//! enabled.
//!
//! **Reconnect acknowledged**: when the transport reports a completed
//! connect with the reconnect flag set, the manager waits a short settle
//! delay and then replays all subscriptions. The delay is cancellable at
//! shutdown; the replay is idempotent.
//!
//! **Health probe**: a periodic sample of the transport's connection flag
//! catches a connect the event feed missed and triggers the same replay.
//! Double-triggering is harmless because the replay is idempotent.
//!
//! # Concurrency
//!
//! All state transitions and the connect/disconnect calls on the transport
//! are serialized under one `tokio::sync::Mutex`. Reconnect attempts are
//! serialized by a pending flag: never two in flight. A cheap atomic mirror
//! of "connected" exists for hot-path reads by the publisher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{ClientError, TransportError};
use crate::registry::SubscriptionRegistry;
use crate::retry::{self, BackoffPolicy, RetryContext, RetryPolicy};
use crate::state::ConnectionState;
use crate::transport::{ConnectOptions, Transport, TransportEvent};

/// Upper bound on how long shutdown waits for background tasks.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Delay before the first health probe sample.
const PROBE_INITIAL_DELAY: Duration = Duration::from_secs(10);

/// Interval between health probe samples.
const PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Owns the broker connection and its lifecycle state machine.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    registry: Arc<SubscriptionRegistry>,
    options: ConnectOptions,
    policy: BackoffPolicy,
    automatic_reconnect: bool,
    settle_delay: Duration,

    /// The exclusive lock: every state transition and every
    /// connect/disconnect call on the transport happens under it.
    state: Mutex<ConnectionState>,

    /// Lock-free mirror of `state.is_connected()` for hot-path reads.
    connected: AtomicBool,

    /// Ensures at most one scheduled reconnect is pending at a time.
    reconnect_pending: AtomicBool,

    cancel: CancellationToken,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Builds the manager and immediately starts its background work: the
    /// initial connect, the transport event loop, and (if configured) the
    /// health probe.
    pub fn start(
        transport: Arc<dyn Transport>,
        events: mpsc::Receiver<TransportEvent>,
        registry: Arc<SubscriptionRegistry>,
        config: &Config,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            transport,
            registry,
            options: ConnectOptions::from_config(config),
            policy: BackoffPolicy::connect(config.connect.clone()),
            automatic_reconnect: config.automatic_reconnect,
            settle_delay: Duration::from_millis(config.settle_delay_ms),
            state: Mutex::new(ConnectionState::Disconnected),
            connected: AtomicBool::new(false),
            reconnect_pending: AtomicBool::new(false),
            cancel,
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        manager.spawn(Self::run_event_loop(Arc::clone(&manager), events));
        manager.spawn(Self::run_initial_connect(Arc::clone(&manager)));
        if config.health_probe {
            manager.spawn(Self::run_health_probe(Arc::clone(&manager)));
        }

        manager
    }

    /// Whether the connection currently reports `Connected`.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.lock().await
    }

    /// Stops background work with a bounded grace period, then disconnects
    /// and releases the transport. Safe to call even if the client never
    /// successfully connected, and safe to call twice.
    pub async fn shutdown(&self) {
        info!("shutting down connection manager");
        self.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = self.lock_tasks().drain(..).collect();
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        for mut handle in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                warn!("background task did not stop within the grace period, aborting");
                handle.abort();
            }
        }

        let mut state = self.state.lock().await;
        if state.is_connected() {
            if let Err(e) = self.transport.disconnect().await {
                warn!("error during disconnect: {}", e);
            }
        }
        if let Err(e) = self.transport.close().await {
            warn!("error closing transport: {}", e);
        }
        self.transition(&mut state, ConnectionState::Disconnected);

        info!("connection manager shutdown completed");
    }

    /// Updates the state under the held lock and keeps the atomic mirror in
    /// sync. Logs only actual transitions.
    fn transition(&self, state: &mut ConnectionState, next: ConnectionState) {
        if *state != next {
            info!("connection state changed: {} -> {}", state, next);
            *state = next;
            self.connected.store(next.is_connected(), Ordering::Release);
        }
    }

    /// Spawns a background task. Handles of tasks that already finished are
    /// reaped first, so the list stays bounded no matter how many reconnect
    /// cycles a flapping connection produces.
    fn spawn(self: &Arc<Self>, future: impl std::future::Future<Output = ()> + Send + 'static) {
        let mut tasks = self.lock_tasks();
        tasks.retain(|handle| !handle.is_finished());
        tasks.push(tokio::spawn(future));
    }

    /// The task list mutex is never held across an await, so poisoning can
    /// only mean a panic mid-push; the list itself is still usable.
    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Initial connect, driven through the retry executor. Exhaustion is
    /// logged and converted into a scheduled reconnect; it never propagates.
    async fn run_initial_connect(self: Arc<Self>) {
        match self.connect_with_retry().await {
            Ok(()) => {}
            Err(ClientError::Interrupted) => {}
            Err(e) => {
                error!("failed to connect to broker after all retry attempts: {}", e);
                self.schedule_reconnect();
            }
        }
    }

    /// One full pass through the connect retry budget.
    async fn connect_with_retry(self: &Arc<Self>) -> Result<(), ClientError> {
        let this = Arc::clone(self);
        let tag = self.options.server_uri.clone();
        retry::execute(&self.policy, &self.cancel, &tag, move || {
            let this = Arc::clone(&this);
            async move { this.try_connect_once().await }
        })
        .await
    }

    /// A single connect attempt, serialized under the exclusive lock.
    async fn try_connect_once(self: Arc<Self>) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if state.is_connected() {
            debug!("connect attempt skipped, already connected");
            return Ok(());
        }
        self.transition(&mut state, ConnectionState::Connecting);

        info!("attempting to connect to {}", self.options.server_uri);
        match self.transport.connect(&self.options).await {
            Ok(()) => {
                self.transition(&mut state, ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                self.transition(&mut state, ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// The delay before a scheduled reconnect: a fresh backoff series,
    /// computed at attempt count 1 from the connect configuration.
    fn reconnect_delay(&self) -> Duration {
        let ctx = RetryContext::new(1, Instant::now(), None, &self.options.server_uri);
        self.policy.next_interval(&ctx)
    }

    /// Schedules exactly one delayed reconnect. No-op when automatic
    /// reconnect is disabled or one is already pending.
    fn schedule_reconnect(self: &Arc<Self>) {
        if !self.automatic_reconnect || !self.policy.config().enabled {
            debug!("automatic reconnect disabled, not scheduling");
            return;
        }
        if self.reconnect_pending.swap(true, Ordering::AcqRel) {
            debug!("reconnect already scheduled");
            return;
        }

        let delay = self.reconnect_delay();
        info!("scheduling reconnect in {} ms", delay.as_millis());

        let this = Arc::clone(self);
        self.spawn(async move {
            tokio::select! {
                _ = this.cancel.cancelled() => {
                    this.reconnect_pending.store(false, Ordering::Release);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            this.reconnect_pending.store(false, Ordering::Release);

            match this.connect_with_retry().await {
                Ok(()) => {}
                Err(ClientError::Interrupted) => {}
                Err(e) => {
                    error!("reconnect failed: {}; scheduling another cycle", e);
                    this.schedule_reconnect();
                }
            }
        });
    }

    /// Consumes the transport's event feed until shutdown.
    async fn run_event_loop(self: Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => {
                    let Some(event) = event else {
                        warn!("transport event channel closed");
                        break;
                    };
                    self.handle_event(event).await;
                }
            }
        }
    }

    async fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::ConnectComplete {
                is_reconnect,
                server_uri,
            } => {
                {
                    let mut state = self.state.lock().await;
                    self.transition(&mut state, ConnectionState::Connected);
                }
                info!(
                    "connection {} to {}",
                    if is_reconnect { "re-established" } else { "established" },
                    server_uri
                );
                if is_reconnect {
                    self.spawn_resync_after_settle();
                }
            }
            TransportEvent::ConnectionLost { cause } => {
                {
                    let mut state = self.state.lock().await;
                    self.transition(&mut state, ConnectionState::Disconnected);
                }
                warn!("connection lost: {}", cause);
                self.schedule_reconnect();
            }
        }
    }

    /// Waits out the settle delay, then replays all subscriptions. The wait
    /// is cancellable at shutdown.
    fn spawn_resync_after_settle(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.spawn(async move {
            tokio::select! {
                _ = this.cancel.cancelled() => return,
                _ = tokio::time::sleep(this.settle_delay) => {}
            }
            this.registry.resubscribe_all().await;
        });
    }

    /// Periodically samples the transport's connection flag. Catches a
    /// not-connected to connected transition the event feed missed and
    /// triggers the resubscription the missed event would have.
    async fn run_health_probe(self: Arc<Self>) {
        tokio::select! {
            _ = self.cancel.cancelled() => return,
            _ = tokio::time::sleep(PROBE_INITIAL_DELAY) => {}
        }

        let mut last = self.transport.is_connected();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(PROBE_INTERVAL) => {}
            }

            let current = self.transport.is_connected();
            if current && !last {
                let missed = {
                    let mut state = self.state.lock().await;
                    if state.is_connected() {
                        false
                    } else {
                        info!("health probe observed a recovery missed by the event feed");
                        self.transition(&mut state, ConnectionState::Connected);
                        true
                    }
                };
                if missed {
                    self.registry.resubscribe_all().await;
                }
            }
            last = current;
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("server_uri", &self.options.server_uri)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackoffKind, RetryConfig};
    use crate::transport::mock::MockTransport;
    use crate::transport::{InboundMessage, MessageHandler, QoS};

    fn test_config() -> Config {
        Config {
            client_id: "test".to_string(),
            settle_delay_ms: 2_000,
            health_probe: false,
            connect: RetryConfig {
                enabled: true,
                max_attempts: 5,
                base_interval_ms: 100,
                max_interval_ms: 100,
                multiplier: 1.0,
                backoff: BackoffKind::Fixed,
            },
            ..Default::default()
        }
    }

    fn noop_handler() -> Arc<dyn MessageHandler> {
        Arc::new(|_msg: InboundMessage| {})
    }

    struct Harness {
        transport: Arc<MockTransport>,
        registry: Arc<SubscriptionRegistry>,
        manager: Arc<ConnectionManager>,
        events: mpsc::Sender<TransportEvent>,
    }

    fn start(config: Config) -> Harness {
        let transport = MockTransport::new();
        let cancel = CancellationToken::new();
        let registry = Arc::new(SubscriptionRegistry::new(
            transport.clone(),
            cancel.clone(),
        ));
        let (events, events_rx) = mpsc::channel(16);
        let manager = ConnectionManager::start(
            transport.clone(),
            events_rx,
            registry.clone(),
            &config,
            cancel,
        );
        Harness {
            transport,
            registry,
            manager,
            events,
        }
    }

    /// Lets spawned tasks and paused-clock timers make progress.
    async fn settle(duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_connect_reaches_connected() {
        let h = start(test_config());
        settle(Duration::from_millis(1)).await;

        assert!(h.manager.is_connected());
        assert_eq!(h.manager.state().await, ConnectionState::Connected);
        assert_eq!(h.transport.connect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_connect_retries_transient_failures() {
        let transport_failures = 2;
        let h = {
            let transport = MockTransport::new();
            for _ in 0..transport_failures {
                transport.fail_next_connect(TransportError::BrokerUnreachable("down".into()));
            }
            let cancel = CancellationToken::new();
            let registry = Arc::new(SubscriptionRegistry::new(
                transport.clone(),
                cancel.clone(),
            ));
            let (events, events_rx) = mpsc::channel(16);
            let manager = ConnectionManager::start(
                transport.clone(),
                events_rx,
                registry.clone(),
                &test_config(),
                cancel,
            );
            Harness {
                transport,
                registry,
                manager,
                events,
            }
        };

        // Two failed attempts with a 100 ms fixed backoff, success on the third.
        settle(Duration::from_millis(250)).await;
        assert_eq!(h.transport.connect_calls(), 3);
        assert!(h.manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_initial_connect_schedules_reconnect() {
        let transport = MockTransport::new();
        // More failures than the 5-attempt budget.
        for _ in 0..6 {
            transport.fail_next_connect(TransportError::Timeout);
        }
        let cancel = CancellationToken::new();
        let registry = Arc::new(SubscriptionRegistry::new(
            transport.clone(),
            cancel.clone(),
        ));
        let (_events, events_rx) = mpsc::channel(16);
        let manager = ConnectionManager::start(
            transport.clone(),
            events_rx,
            registry,
            &test_config(),
            cancel,
        );

        // Budget exhausted after 5 attempts, then one scheduled reconnect
        // cycle (100 ms delay) succeeds on its first attempt.
        settle(Duration::from_millis(700)).await;
        assert_eq!(transport.connect_calls(), 7);
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_lost_schedules_exactly_one_reconnect() {
        let h = start(test_config());
        settle(Duration::from_millis(1)).await;
        assert_eq!(h.transport.connect_calls(), 1);

        h.transport.set_connected(false);
        h.events
            .send(TransportEvent::ConnectionLost {
                cause: "broken pipe".into(),
            })
            .await
            .unwrap();
        settle(Duration::from_millis(1)).await;
        assert_eq!(h.manager.state().await, ConnectionState::Disconnected);

        // A duplicate loss event must not stack a second reconnect.
        h.events
            .send(TransportEvent::ConnectionLost {
                cause: "still broken".into(),
            })
            .await
            .unwrap();

        settle(Duration::from_millis(300)).await;
        assert_eq!(h.transport.connect_calls(), 2);
        assert!(h.manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_event_triggers_resync_after_settle_delay() {
        let h = start(test_config());
        settle(Duration::from_millis(1)).await;

        h.registry
            .register("sensor/temp", QoS::AtLeastOnce, noop_handler())
            .await;
        let subscribes_before = h.transport.subscribe_log().len();

        h.events
            .send(TransportEvent::ConnectComplete {
                is_reconnect: true,
                server_uri: "tcp://localhost:1883".into(),
            })
            .await
            .unwrap();

        // Before the settle delay elapses nothing is replayed.
        settle(Duration::from_millis(1_000)).await;
        assert_eq!(h.transport.subscribe_log().len(), subscribes_before);

        settle(Duration::from_millis(1_500)).await;
        assert_eq!(h.transport.subscribe_log().len(), subscribes_before + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_connect_event_does_not_resync() {
        let h = start(test_config());
        settle(Duration::from_millis(1)).await;

        h.registry
            .register("sensor/temp", QoS::AtLeastOnce, noop_handler())
            .await;
        let subscribes_before = h.transport.subscribe_log().len();

        h.events
            .send(TransportEvent::ConnectComplete {
                is_reconnect: false,
                server_uri: "tcp://localhost:1883".into(),
            })
            .await
            .unwrap();

        settle(Duration::from_secs(5)).await;
        assert_eq!(h.transport.subscribe_log().len(), subscribes_before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_then_loss_then_reconnect_subscribes_exactly_once() {
        let h = start(test_config());
        settle(Duration::from_millis(1)).await;

        // Register while disconnected from the transport's point of view.
        h.transport.set_connected(false);
        h.registry
            .register("cmd/#", QoS::AtLeastOnce, noop_handler())
            .await;
        assert!(h.transport.subscribe_log().is_empty());

        h.events
            .send(TransportEvent::ConnectionLost {
                cause: "reset".into(),
            })
            .await
            .unwrap();
        settle(Duration::from_millis(200)).await;

        h.events
            .send(TransportEvent::ConnectComplete {
                is_reconnect: true,
                server_uri: "tcp://localhost:1883".into(),
            })
            .await
            .unwrap();
        settle(Duration::from_millis(2_500)).await;

        assert_eq!(
            h.transport.subscribe_log(),
            vec![("cmd/#".to_string(), QoS::AtLeastOnce)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_probe_recovers_missed_connect_event() {
        let mut config = test_config();
        config.health_probe = true;
        let h = start(config);
        settle(Duration::from_millis(1)).await;

        h.registry
            .register("sensor/temp", QoS::AtMostOnce, noop_handler())
            .await;
        let subscribes_before = h.transport.subscribe_log().len();

        // Drop the connection without delivering any events, then restore
        // the low-level flag: only the probe can notice.
        h.transport.set_connected(false);
        {
            let mut state = h.manager.state.lock().await;
            h.manager
                .transition(&mut state, ConnectionState::Disconnected);
        }
        settle(Duration::from_secs(11)).await;
        h.transport.set_connected(true);

        settle(Duration::from_secs(11)).await;
        assert!(h.manager.is_connected());
        assert_eq!(h.transport.subscribe_log().len(), subscribes_before + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_safe_when_never_connected() {
        let transport = MockTransport::new();
        transport.fail_next_connect(TransportError::AuthenticationFailed);
        let cancel = CancellationToken::new();
        let registry = Arc::new(SubscriptionRegistry::new(
            transport.clone(),
            cancel.clone(),
        ));
        let (_events, events_rx) = mpsc::channel(16);
        let manager = ConnectionManager::start(
            transport.clone(),
            events_rx,
            registry,
            &test_config(),
            cancel,
        );
        settle(Duration::from_millis(1)).await;

        manager.shutdown().await;
        // Never connected, so no disconnect was sent, but resources were
        // released.
        assert_eq!(transport.disconnect_calls(), 0);
        assert_eq!(transport.close_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_disconnects_when_connected() {
        let h = start(test_config());
        settle(Duration::from_millis(1)).await;
        assert!(h.manager.is_connected());

        h.manager.shutdown().await;
        assert_eq!(h.transport.disconnect_calls(), 1);
        assert_eq!(h.transport.close_calls(), 1);
        assert_eq!(h.manager.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_list_stays_bounded_across_reconnect_cycles() {
        let h = start(test_config());
        settle(Duration::from_millis(1)).await;
        assert!(h.manager.is_connected());

        for cycle in 0..50 {
            h.transport.set_connected(false);
            h.events
                .send(TransportEvent::ConnectionLost {
                    cause: format!("flap {}", cycle),
                })
                .await
                .unwrap();
            settle(Duration::from_millis(150)).await;
            assert!(h.manager.is_connected());
        }

        // Only the event loop plus at most the latest finished reconnect
        // task remain; completed handles from earlier cycles were reaped.
        let retained = h.manager.lock_tasks().len();
        assert!(retained <= 3, "task list grew to {} handles", retained);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_reconnect_when_automatic_reconnect_disabled() {
        let mut config = test_config();
        config.automatic_reconnect = false;
        let h = start(config);
        settle(Duration::from_millis(1)).await;
        assert_eq!(h.transport.connect_calls(), 1);

        h.transport.set_connected(false);
        h.events
            .send(TransportEvent::ConnectionLost {
                cause: "gone".into(),
            })
            .await
            .unwrap();

        settle(Duration::from_secs(2)).await;
        assert_eq!(h.transport.connect_calls(), 1);
        assert_eq!(h.manager.state().await, ConnectionState::Disconnected);
    }
}
