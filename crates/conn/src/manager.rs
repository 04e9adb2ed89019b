//! Single-flight reconnection with bounded exponential backoff.

use futures::future::BoxFuture;
use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use webcell_channel::Peer;
use webcell_core::{Error, ReconnectConfig, Result};

use crate::classify;

pub type PeerFactory = Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn Peer>>> + Send + Sync>;
pub type ReconnectHook = Arc<dyn Fn(Arc<dyn Peer>) + Send + Sync>;
/// Uniform sample in [-1, 1]; injectable so backoff is deterministic in
/// tests.
pub type JitterSource = Arc<dyn Fn() -> f64 + Send + Sync>;

const JITTER_FRACTION: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Reconnecting,
    Closed,
}

/// Delay before attempt `k`: `min(initial * 2^k, max)` adjusted by a
/// ±20 % jitter factor. The jitter is symmetric and may undershoot the
/// unjittered minimum.
fn attempt_delay(config: &ReconnectConfig, attempt: u32, jitter: f64) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let base = config
        .initial_delay_ms
        .saturating_mul(factor)
        .min(config.max_delay_ms);
    let jittered = base as f64 * (1.0 + JITTER_FRACTION * jitter);
    Duration::from_millis(jittered.max(0.0) as u64)
}

struct Managed {
    peer: Option<Arc<dyn Peer>>,
    factory: Option<PeerFactory>,
    on_reconnect: Option<ReconnectHook>,
    state: ConnectionState,
    /// Bumped on every peer swap; disconnect watchers for an older
    /// generation are stale and must not trigger a sequence.
    generation: u64,
}

type Outcome = std::result::Result<(), Arc<Error>>;

struct ManagerInner {
    config: ReconnectConfig,
    jitter: JitterSource,
    managed: Mutex<Managed>,
    in_flight: Mutex<Option<broadcast::Sender<Outcome>>>,
    attempts: AtomicU32,
}

/// Keeps a direct controller-to-peer connection usable across peer
/// crashes. Explicitly constructed and owned by the composition root;
/// tests build fresh instances instead of resetting globals.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self::with_jitter(
            config,
            Arc::new(|| rand::thread_rng().gen_range(-1.0..=1.0)),
        )
    }

    pub fn with_jitter(config: ReconnectConfig, jitter: JitterSource) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                jitter,
                managed: Mutex::new(Managed {
                    peer: None,
                    factory: None,
                    on_reconnect: None,
                    state: ConnectionState::Closed,
                    generation: 0,
                }),
                in_flight: Mutex::new(None),
                attempts: AtomicU32::new(0),
            }),
        }
    }

    /// Bind the active peer and the factory that can replace it. A
    /// disconnect from the peer starts a reconnection sequence without
    /// waiting for any caller to notice.
    pub async fn bind(&self, peer: Arc<dyn Peer>, factory: PeerFactory) {
        let generation = {
            let mut managed = self.inner.managed.lock().await;
            managed.peer = Some(peer.clone());
            managed.factory = Some(factory);
            managed.state = ConnectionState::Connected;
            managed.generation += 1;
            managed.generation
        };
        self.spawn_disconnect_watcher(peer, generation);
    }

    /// Hook invoked with the fresh peer after every successful reconnect.
    pub async fn set_on_reconnect(&self, hook: ReconnectHook) {
        self.inner.managed.lock().await.on_reconnect = Some(hook);
    }

    pub async fn peer(&self) -> Option<Arc<dyn Peer>> {
        self.inner.managed.lock().await.peer.clone()
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.managed.lock().await.state
    }

    /// Total reconnect attempts over this manager's lifetime. Monotonic;
    /// only [`reset_attempts`](Self::reset_attempts) clears it.
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    pub fn reset_attempts(&self) {
        self.inner.attempts.store(0, Ordering::SeqCst);
    }

    pub async fn close(&self) {
        let peer = {
            let mut managed = self.inner.managed.lock().await;
            managed.state = ConnectionState::Closed;
            managed.generation += 1;
            managed.peer.take()
        };
        if let Some(peer) = peer {
            peer.close().await;
        }
    }

    /// Run an operation, repairing the connection and retrying exactly
    /// once when it fails with a connection-classified error. Other
    /// errors propagate unchanged.
    pub async fn run_guarded<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match op().await {
            Ok(value) => Ok(value),
            Err(e) if classify::is_connection_error(&e) => {
                debug!(error = %e, "operation hit a connection error, repairing");
                self.reconnect().await?;
                op().await
            }
            Err(e) => Err(e),
        }
    }

    /// Join the in-flight reconnection sequence, or start one. All
    /// concurrent triggers share a single sequence.
    pub async fn reconnect(&self) -> Result<()> {
        let mut rx = {
            // Read-check-then-set under one lock acquisition with no
            // intervening await, so two callers cannot both observe "no
            // sequence running".
            let mut in_flight = self.inner.in_flight.lock().await;
            match in_flight.as_ref() {
                Some(tx) => tx.subscribe(),
                None => {
                    let (tx, rx) = broadcast::channel(1);
                    *in_flight = Some(tx.clone());
                    let manager = self.clone();
                    tokio::spawn(async move {
                        let outcome = manager.run_sequence().await.map_err(Arc::new);
                        // Cleared unconditionally, success or failure.
                        *manager.inner.in_flight.lock().await = None;
                        let _ = tx.send(outcome);
                    });
                    rx
                }
            }
        };

        match rx.recv().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(reclone_error(&e)),
            Err(_) => Err(Error::Other(
                "reconnect sequence dropped without settling".to_string(),
            )),
        }
    }

    async fn run_sequence(&self) -> Result<()> {
        let inner = &self.inner;
        {
            let mut managed = inner.managed.lock().await;
            if managed.factory.is_none() {
                managed.state = ConnectionState::Closed;
                return Err(Error::Config(
                    "no peer factory bound; call bind() before reconnecting".to_string(),
                ));
            }
            managed.state = ConnectionState::Reconnecting;
        }

        let overall = Duration::from_millis(inner.config.overall_timeout_ms);
        let cancel = CancellationToken::new();
        let deadline = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(overall).await;
                cancel.cancel();
            })
        };

        let mut last_error: Option<Error> = None;
        let mut outcome: Option<Result<()>> = None;
        for attempt in 0..inner.config.max_attempts {
            // The overall deadline is checked before and after each
            // sleep; it does not cancel a factory call in progress.
            if cancel.is_cancelled() {
                outcome = Some(Err(abort_error(overall)));
                break;
            }
            let delay = attempt_delay(&inner.config, attempt, (inner.jitter)());
            debug!(attempt, delay_ms = delay.as_millis() as u64, "backing off before reconnect");
            tokio::time::sleep(delay).await;
            if cancel.is_cancelled() {
                outcome = Some(Err(abort_error(overall)));
                break;
            }

            inner.attempts.fetch_add(1, Ordering::SeqCst);
            match self.try_attempt().await {
                Ok(()) => {
                    outcome = Some(Ok(()));
                    break;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "reconnect attempt failed");
                    last_error = Some(e);
                }
            }
        }
        deadline.abort();

        let result = outcome.unwrap_or_else(|| {
            Err(Error::Exhausted(format!(
                "failed to reconnect after {} attempts (last error: {}). Restart the browser peer, then bind it again.",
                inner.config.max_attempts,
                last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".to_string()),
            )))
        });

        match &result {
            Ok(()) => info!("reconnected to peer"),
            Err(_) => {
                inner.managed.lock().await.state = ConnectionState::Closed;
            }
        }
        result
    }

    /// One attempt: fresh peer from the factory, swap it in, best-effort
    /// close of the stale one, re-register the disconnect watcher, run
    /// the caller's hook.
    async fn try_attempt(&self) -> Result<()> {
        let factory = {
            let managed = self.inner.managed.lock().await;
            managed.factory.clone().ok_or_else(|| {
                Error::Config("no peer factory bound; call bind() before reconnecting".to_string())
            })?
        };

        let new_peer = factory().await?;

        let (old_peer, hook, generation) = {
            let mut managed = self.inner.managed.lock().await;
            let old = managed.peer.replace(new_peer.clone());
            managed.generation += 1;
            managed.state = ConnectionState::Connected;
            (old, managed.on_reconnect.clone(), managed.generation)
        };

        if let Some(old) = old_peer {
            old.close().await;
        }

        self.spawn_disconnect_watcher(new_peer.clone(), generation);
        if let Some(hook) = hook {
            hook(new_peer);
        }
        Ok(())
    }

    fn spawn_disconnect_watcher(&self, peer: Arc<dyn Peer>, generation: u64) {
        let manager = self.clone();
        let mut rx = peer.subscribe_disconnect();
        tokio::spawn(async move {
            let reason = match rx.recv().await {
                Ok(reason) => reason,
                Err(_) => return,
            };
            {
                let mut managed = manager.inner.managed.lock().await;
                if managed.generation != generation
                    || managed.state == ConnectionState::Closed
                {
                    return;
                }
                managed.state = ConnectionState::Reconnecting;
            }
            info!(reason = %reason, "peer disconnected, starting reconnection");
            if let Err(e) = manager.reconnect().await {
                warn!(error = %e, "background reconnection failed");
            }
        });
    }
}

fn abort_error(overall: Duration) -> Error {
    Error::Exhausted(format!(
        "reconnect sequence aborted after exceeding its overall timeout of {}ms. Restart the browser peer, then bind it again.",
        overall.as_millis()
    ))
}

/// `Error` is not `Clone`; rebuild the variants that matter for callers
/// waiting on the shared sequence.
fn reclone_error(e: &Error) -> Error {
    match e {
        Error::Exhausted(s) => Error::Exhausted(s.clone()),
        Error::Timeout(s) => Error::Timeout(s.clone()),
        Error::Config(s) => Error::Config(s.clone()),
        other => Error::Other(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicBool;
    use tokio::sync::Notify;
    use webcell_channel::PeerEvent;

    struct MockPeer {
        connected: AtomicBool,
        disconnects: broadcast::Sender<String>,
        events: broadcast::Sender<PeerEvent>,
    }

    impl MockPeer {
        fn new() -> Arc<Self> {
            let (disconnects, _) = broadcast::channel(4);
            let (events, _) = broadcast::channel(4);
            Arc::new(Self {
                connected: AtomicBool::new(true),
                disconnects,
                events,
            })
        }

        fn drop_connection(&self, reason: &str) {
            self.connected.store(false, Ordering::SeqCst);
            let _ = self.disconnects.send(reason.to_string());
        }
    }

    #[async_trait]
    impl Peer for MockPeer {
        async fn send_request(
            &self,
            _method: &str,
            _params: Value,
            _timeout: Duration,
        ) -> Result<Value> {
            Ok(json!({"ok": true}))
        }

        async fn close(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }

        fn subscribe_events(&self) -> broadcast::Receiver<PeerEvent> {
            self.events.subscribe()
        }

        fn subscribe_disconnect(&self) -> broadcast::Receiver<String> {
            self.disconnects.subscribe()
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    fn fast_config(max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            max_attempts,
            initial_delay_ms: 1,
            max_delay_ms: 4,
            overall_timeout_ms: 5_000,
        }
    }

    fn zero_jitter() -> JitterSource {
        Arc::new(|| 0.0)
    }

    fn counting_factory(count: Arc<AtomicU32>) -> PeerFactory {
        Arc::new(move || {
            let count = count.clone();
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(MockPeer::new() as Arc<dyn Peer>)
            })
        })
    }

    #[test]
    fn test_backoff_deterministic_with_zero_jitter() {
        let config = ReconnectConfig {
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 5000,
            overall_timeout_ms: 30_000,
        };
        let delays: Vec<u64> = (0..5)
            .map(|k| attempt_delay(&config, k, 0.0).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 5000, 5000]);
    }

    #[test]
    fn test_jitter_is_symmetric_without_floor() {
        let config = ReconnectConfig {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 10_000,
            overall_timeout_ms: 30_000,
        };
        assert_eq!(attempt_delay(&config, 0, 1.0), Duration::from_millis(1200));
        // A negative sample undershoots the unjittered minimum; that is
        // accepted behavior, not clamped.
        assert_eq!(attempt_delay(&config, 0, -1.0), Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_exhaustion_after_exact_attempt_count() {
        let manager = ConnectionManager::with_jitter(fast_config(2), zero_jitter());
        let calls = Arc::new(AtomicU32::new(0));
        let factory: PeerFactory = {
            let calls = calls.clone();
            Arc::new(move || {
                let calls = calls.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Transport("connect refused".to_string()))
                })
            })
        };
        manager.bind(MockPeer::new(), factory).await;

        let err = manager.reconnect().await.unwrap_err();
        match &err {
            Error::Exhausted(msg) => {
                assert!(msg.contains("2 attempts"), "message: {}", msg);
                assert!(msg.contains("connect refused"), "message: {}", msg);
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(manager.state().await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_single_flight_under_concurrency() {
        let manager = ConnectionManager::with_jitter(fast_config(3), zero_jitter());
        let calls = Arc::new(AtomicU32::new(0));
        let release = Arc::new(Notify::new());
        let factory: PeerFactory = {
            let calls = calls.clone();
            let release = release.clone();
            Arc::new(move || {
                let calls = calls.clone();
                let release = release.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    release.notified().await;
                    Ok(MockPeer::new() as Arc<dyn Peer>)
                })
            })
        };
        manager.bind(MockPeer::new(), factory).await;

        let mut triggers = Vec::new();
        for _ in 0..10 {
            let manager = manager.clone();
            triggers.push(tokio::spawn(async move { manager.reconnect().await }));
        }
        // Let every trigger attach to the shared sequence, then let the
        // one factory call finish.
        tokio::time::sleep(Duration::from_millis(100)).await;
        release.notify_waiters();

        for trigger in triggers {
            trigger.await.unwrap().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_run_guarded_retries_once_after_repair() {
        let manager = ConnectionManager::with_jitter(fast_config(3), zero_jitter());
        let factory_calls = Arc::new(AtomicU32::new(0));
        manager
            .bind(MockPeer::new(), counting_factory(factory_calls.clone()))
            .await;

        let op_calls = Arc::new(AtomicU32::new(0));
        let result = manager
            .run_guarded(|| {
                let op_calls = op_calls.clone();
                async move {
                    if op_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(Error::ChannelClosed("connection closed".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 42);
        assert_eq!(op_calls.load(Ordering::SeqCst), 2);
        assert_eq!(factory_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_guarded_propagates_application_errors() {
        let manager = ConnectionManager::with_jitter(fast_config(3), zero_jitter());
        let factory_calls = Arc::new(AtomicU32::new(0));
        manager
            .bind(MockPeer::new(), counting_factory(factory_calls.clone()))
            .await;

        let op_calls = Arc::new(AtomicU32::new(0));
        let err = manager
            .run_guarded(|| {
                let op_calls = op_calls.clone();
                async move {
                    op_calls.fetch_add(1, Ordering::SeqCst);
                    Err::<Value, _>(Error::Remote {
                        code: -32601,
                        message: "no such element".to_string(),
                    })
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Remote { .. }));
        assert_eq!(op_calls.load(Ordering::SeqCst), 1);
        assert_eq!(factory_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disconnect_event_triggers_background_reconnect() {
        let manager = ConnectionManager::with_jitter(fast_config(3), zero_jitter());
        let factory_calls = Arc::new(AtomicU32::new(0));
        let peer = MockPeer::new();
        manager
            .bind(peer.clone(), counting_factory(factory_calls.clone()))
            .await;

        peer.drop_connection("connection closed");

        for _ in 0..100 {
            if manager.state().await == ConnectionState::Connected
                && factory_calls.load(Ordering::SeqCst) == 1
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(factory_calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_stale_disconnect_does_not_retrigger() {
        let manager = ConnectionManager::with_jitter(fast_config(3), zero_jitter());
        let factory_calls = Arc::new(AtomicU32::new(0));
        let first = MockPeer::new();
        manager
            .bind(first.clone(), counting_factory(factory_calls.clone()))
            .await;

        manager.reconnect().await.unwrap();
        assert_eq!(factory_calls.load(Ordering::SeqCst), 1);

        // The replaced peer's disconnect is stale and must not start
        // another sequence.
        first.drop_connection("connection closed");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(factory_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_overall_timeout_aborts_sequence() {
        let config = ReconnectConfig {
            max_attempts: 5,
            initial_delay_ms: 100,
            max_delay_ms: 100,
            overall_timeout_ms: 50,
        };
        let manager = ConnectionManager::with_jitter(config, zero_jitter());
        let factory_calls = Arc::new(AtomicU32::new(0));
        manager
            .bind(MockPeer::new(), counting_factory(factory_calls.clone()))
            .await;

        let err = manager.reconnect().await.unwrap_err();
        match err {
            Error::Exhausted(msg) => assert!(msg.contains("overall timeout"), "message: {}", msg),
            other => panic!("expected abort, got {:?}", other),
        }
        assert_eq!(factory_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reconnect_without_factory_is_config_error() {
        let manager = ConnectionManager::with_jitter(fast_config(3), zero_jitter());
        let err = manager.reconnect().await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_on_reconnect_hook_receives_fresh_peer() {
        let manager = ConnectionManager::with_jitter(fast_config(3), zero_jitter());
        let factory_calls = Arc::new(AtomicU32::new(0));
        manager
            .bind(MockPeer::new(), counting_factory(factory_calls.clone()))
            .await;

        let hook_calls = Arc::new(AtomicU32::new(0));
        {
            let hook_calls = hook_calls.clone();
            manager
                .set_on_reconnect(Arc::new(move |peer| {
                    assert!(peer.is_connected());
                    hook_calls.fetch_add(1, Ordering::SeqCst);
                }))
                .await;
        }

        manager.reconnect().await.unwrap();
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_counter_is_monotonic_until_reset() {
        let manager = ConnectionManager::with_jitter(fast_config(1), zero_jitter());
        let factory_calls = Arc::new(AtomicU32::new(0));
        manager
            .bind(MockPeer::new(), counting_factory(factory_calls.clone()))
            .await;

        manager.reconnect().await.unwrap();
        manager.reconnect().await.unwrap();
        assert_eq!(manager.attempts(), 2);
        manager.reset_attempts();
        assert_eq!(manager.attempts(), 0);
    }
}
