//! Heartbeat-based liveness tracking.
//!
//! Agents assert liveness by writing pulses under their entity's global
//! key; the `PresenceBoard` runs a sync loop that classifies each
//! watched key as alive or dead from pulse freshness and notifies
//! subscribers. A key is alive while its latest pulse is fresher than
//! the staleness window and dead otherwise.
//!
//! Delivery contract: a new subscription receives the key's current
//! state immediately (which may be a stale artifact of subscription
//! startup, hence the debounce in [`wait_alive`]); every sync cycle
//! re-confirms `alive = true` to subscribers, while `alive = false` is
//! delivered only on a fresh transition. The board therefore never
//! legitimately reports dead twice in a row, which makes the double-dead
//! condition an invariant violation rather than a steady state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::error::{Result, StateError};

/// Timing configuration for the presence subsystem.
#[derive(Debug, Clone, Copy)]
pub struct PresenceConfig {
    /// How often the sync loop evaluates pulse freshness. Pingers write
    /// at half this period.
    pub period: Duration,
    /// How old a pulse may be before its key is considered dead. Must
    /// exceed `period` or fresh pulses could expire unobserved.
    pub staleness: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(500),
            staleness: Duration::from_millis(1500),
        }
    }
}

/// One liveness notification for a subscribed key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceChange {
    /// The global key the notification is about.
    pub key: String,
    /// Whether the key currently has a fresh pulse.
    pub alive: bool,
}

type KeySubscribers = HashMap<u64, mpsc::UnboundedSender<PresenceChange>>;

#[derive(Debug)]
pub(crate) struct BoardInner {
    config: PresenceConfig,
    pulses: Mutex<HashMap<String, Instant>>,
    /// Last state reported to subscribers, per key; used to report dead
    /// only on transitions.
    reported: Mutex<HashMap<String, bool>>,
    subscribers: Mutex<HashMap<String, KeySubscribers>>,
    next_token: AtomicU64,
    stop_tx: watch::Sender<bool>,
    failed_tx: watch::Sender<bool>,
    failure: Mutex<Option<String>>,
}

impl BoardInner {
    fn is_alive(&self, key: &str, now: Instant) -> bool {
        self.pulses
            .lock()
            .get(key)
            .is_some_and(|pulse| now.duration_since(*pulse) < self.config.staleness)
    }

    fn record_pulse(&self, key: &str) {
        self.pulses.lock().insert(key.to_string(), Instant::now());
    }

    fn sync(&self) {
        let now = Instant::now();
        let mut subscribers = self.subscribers.lock();
        let mut reported = self.reported.lock();
        for (key, feeds) in subscribers.iter_mut() {
            let alive = self.is_alive(key, now);
            let transitioned = reported.get(key).copied() != Some(alive);
            if alive || transitioned {
                feeds.retain(|_, tx| {
                    tx.send(PresenceChange {
                        key: key.clone(),
                        alive,
                    })
                    .is_ok()
                });
            }
            reported.insert(key.clone(), alive);
        }
    }

    fn record_failure(&self, reason: &str) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(reason.to_string());
        }
        drop(failure);
        // send_replace: the flag must stick even with no receiver yet,
        // so future observers see the failure too.
        self.failed_tx.send_replace(true);
    }
}

/// The liveness-pulse store and its sync loop.
///
/// Cloning the board shares the same underlying state; the sync loop
/// lives until [`stop`](Self::stop) is called.
#[derive(Debug, Clone)]
pub struct PresenceBoard {
    inner: Arc<BoardInner>,
}

impl PresenceBoard {
    /// Start a presence board and its sync loop. Must be called from
    /// within a tokio runtime.
    #[must_use]
    pub fn start(config: PresenceConfig) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let (failed_tx, _) = watch::channel(false);
        let inner = Arc::new(BoardInner {
            config,
            pulses: Mutex::new(HashMap::new()),
            reported: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(0),
            stop_tx,
            failed_tx,
            failure: Mutex::new(None),
        });

        let loop_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(loop_inner.config.period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        tracing::debug!("presence sync loop stopped");
                        return;
                    }
                    _ = ticker.tick() => loop_inner.sync(),
                }
            }
        });

        Self { inner }
    }

    /// Record a fresh liveness pulse for a key.
    pub fn write_pulse(&self, key: &str) {
        self.inner.record_pulse(key);
    }

    /// Whether the key currently has a fresh pulse.
    #[must_use]
    pub fn alive(&self, key: &str) -> bool {
        self.inner.is_alive(key, Instant::now())
    }

    /// Subscribe to one key's liveness notifications. The current state
    /// is delivered immediately; the subscription is released when the
    /// returned handle is dropped.
    #[must_use]
    pub fn subscribe(&self, key: &str) -> PresenceSub {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);

        let alive = self.inner.is_alive(key, Instant::now());
        let _ = tx.send(PresenceChange {
            key: key.to_string(),
            alive,
        });
        // Seed the transition tracker so the sync loop does not repeat
        // the initial dead report.
        self.inner.reported.lock().insert(key.to_string(), alive);
        self.inner
            .subscribers
            .lock()
            .entry(key.to_string())
            .or_default()
            .insert(token, tx);

        PresenceSub {
            key: key.to_string(),
            token,
            rx,
            inner: Arc::clone(&self.inner),
        }
    }

    /// A signal set once the board has permanently failed or been
    /// stopped while observers may still be waiting.
    #[must_use]
    pub fn failed(&self) -> watch::Receiver<bool> {
        self.inner.failed_tx.subscribe()
    }

    /// The captured failure, replayed to every current and future
    /// observer.
    #[must_use]
    pub fn failure(&self) -> Option<StateError> {
        self.inner
            .failure
            .lock()
            .as_ref()
            .map(|reason| StateError::PresenceFailed(reason.clone()))
    }

    /// Stop the sync loop. Safe to call more than once; anyone blocked
    /// in [`wait_alive`] observes the failure instead of parking
    /// forever.
    pub fn stop(&self) {
        self.inner.record_failure("presence watcher stopped");
        self.inner.stop_tx.send_replace(true);
    }

    pub(crate) fn inner(&self) -> &Arc<BoardInner> {
        &self.inner
    }
}

/// An active subscription to one key's liveness notifications.
#[derive(Debug)]
pub struct PresenceSub {
    key: String,
    token: u64,
    rx: mpsc::UnboundedReceiver<PresenceChange>,
    inner: Arc<BoardInner>,
}

impl PresenceSub {
    /// Receive the next notification.
    pub async fn recv(&mut self) -> Option<PresenceChange> {
        self.rx.recv().await
    }
}

impl Drop for PresenceSub {
    fn drop(&mut self) {
        if let Some(feeds) = self.inner.subscribers.lock().get_mut(&self.key) {
            feeds.remove(&self.token);
        }
    }
}

/// An agent-side pinger keeping one key alive.
///
/// Writes a pulse immediately on start and then at half the board's
/// sync period. Stopping is explicit; dropping the handle also stops
/// the background task.
#[derive(Debug)]
pub struct Pinger {
    key: String,
    stop_tx: watch::Sender<bool>,
}

impl Pinger {
    pub(crate) fn start(board: &PresenceBoard, key: String) -> Self {
        let inner = Arc::clone(board.inner());
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task_key = key.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.period / 2);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        tracing::debug!(key = %task_key, "pinger stopped");
                        return;
                    }
                    _ = ticker.tick() => inner.record_pulse(&task_key),
                }
            }
        });
        tracing::debug!(key = %key, "pinger started");
        Self { key, stop_tx }
    }

    /// The global key this pinger keeps alive.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Stop pulsing. Safe to call more than once.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }
}

impl Drop for Pinger {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The debounce state machine driven by presence notifications.
///
/// Success requires the alive condition to persist across two
/// consecutive notifications; a contradictory dead report resets the
/// debounce, and a second consecutive dead report is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Debounce {
    /// Nothing observed yet.
    NoSignal,
    /// One alive report seen; one more confirms.
    TentativeAlive,
    /// One dead report seen; another is an invariant violation.
    TentativeDead,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Step {
    Confirmed,
    Fatal,
    Pending(Debounce),
}

impl Debounce {
    pub(crate) fn step(self, alive: bool) -> Step {
        match (self, alive) {
            (Self::TentativeAlive, true) => Step::Confirmed,
            (_, true) => Step::Pending(Self::TentativeAlive),
            (Self::TentativeDead, false) => Step::Fatal,
            (_, false) => Step::Pending(Self::TentativeDead),
        }
    }
}

/// Block until the key's liveness is confirmed on two consecutive
/// notification cycles, the timeout elapses, or the board fails —
/// whichever fires first. The temporary subscription is released on
/// every return path.
pub(crate) async fn wait_alive(
    board: &PresenceBoard,
    key: &str,
    timeout: Duration,
) -> Result<()> {
    let mut sub = board.subscribe(key);
    let mut failed = board.failed();
    if *failed.borrow() {
        return Err(board
            .failure()
            .unwrap_or_else(|| StateError::PresenceFailed("presence watcher stopped".into())));
    }

    let deadline = Instant::now() + timeout;
    let mut debounce = Debounce::NoSignal;
    loop {
        tokio::select! {
            change = sub.recv() => {
                let Some(change) = change else {
                    return Err(board.failure().unwrap_or_else(|| {
                        StateError::PresenceFailed("presence subscription closed".into())
                    }));
                };
                match debounce.step(change.alive) {
                    Step::Confirmed => return Ok(()),
                    Step::Fatal => {
                        return Err(StateError::DoubleDead {
                            key: key.to_string(),
                        })
                    }
                    Step::Pending(next) => debounce = next,
                }
            }
            () = tokio::time::sleep_until(deadline) => return Err(StateError::StillNotAlive),
            _ = failed.changed() => {
                return Err(board.failure().unwrap_or_else(|| {
                    StateError::PresenceFailed("presence watcher stopped".into())
                }));
            }
        }
    }
}
