//! Reconnect controller (C6): connection state machine, probe-before-
//! reconnect, jittered exponential backoff, and a circuit breaker with
//! two distinct cool-down windows (see DESIGN.md, Open Question c).

use crate::error::{Error, Result};
use crate::mux::Multiplex;
use rand::Rng;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Reconnecting,
    Failed,
}

impl From<u8> for ConnectionState {
    fn from(v: u8) -> Self {
        match v {
            0 => ConnectionState::Connected,
            1 => ConnectionState::Disconnected,
            2 => ConnectionState::Reconnecting,
            _ => ConnectionState::Failed,
        }
    }
}

impl From<ConnectionState> for u8 {
    fn from(s: ConnectionState) -> u8 {
        match s {
            ConnectionState::Connected => 0,
            ConnectionState::Disconnected => 1,
            ConnectionState::Reconnecting => 2,
            ConnectionState::Failed => 3,
        }
    }
}

pub type DialFuture = Pin<Box<dyn Future<Output = Result<Multiplex>> + Send>>;
pub type DialFn = Arc<dyn Fn() -> DialFuture + Send + Sync>;
pub type ProbeFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
pub type ProbeFn = Arc<dyn Fn() -> ProbeFuture + Send + Sync>;

#[derive(Clone)]
pub struct ReconnectConfig {
    pub dial: DialFn,
    pub probe: ProbeFn,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_jitter: f64,
    /// Long cool-down after a full reconnect attempt exhausts (never
    /// actually reached by `dial_with_backoff`, which retries
    /// indefinitely, but used by the monitor loop's own breaker trips).
    pub circuit_break_time: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            dial: Arc::new(|| Box::pin(async { Err(Error::ServerUnreachable) })),
            probe: Arc::new(|| Box::pin(async { Err(Error::ServerUnreachable) })),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_jitter: 0.2,
            circuit_break_time: Duration::from_secs(60),
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn jittered(d: Duration, jitter: f64) -> Duration {
    let mut rng = rand::thread_rng();
    let factor = 1.0 + rng.gen_range(-jitter..=jitter);
    Duration::from_secs_f64((d.as_secs_f64() * factor).max(0.0))
}

/// Drives reconnection for a [`crate::session::Session`]. Holds no
/// reference back to the session itself (a `Weak` is given to the
/// background monitor task to avoid a reference cycle), only the knobs
/// needed to dial a fresh [`Multiplex`].
pub struct ReconnectController {
    config: ReconnectConfig,
    state: AtomicU8,
    breaker_open: std::sync::atomic::AtomicBool,
    breaker_reset_at: AtomicU64,
    reconnect_mutex: Mutex<()>,
    reconnect_notify: Notify,
    cancel: CancellationToken,
}

impl ReconnectController {
    pub fn new(config: ReconnectConfig) -> Arc<Self> {
        Arc::new(ReconnectController {
            config,
            state: AtomicU8::new(ConnectionState::Connected.into()),
            breaker_open: std::sync::atomic::AtomicBool::new(false),
            breaker_reset_at: AtomicU64::new(0),
            reconnect_mutex: Mutex::new(()),
            reconnect_notify: Notify::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state.load(Ordering::SeqCst).into()
    }

    fn set_state(&self, s: ConnectionState) {
        self.state.store(s.into(), Ordering::SeqCst);
    }

    fn breaker_is_open(&self) -> bool {
        if !self.breaker_open.load(Ordering::SeqCst) {
            return false;
        }
        now_secs() < self.breaker_reset_at.load(Ordering::SeqCst)
    }

    fn open_breaker(&self, window: Duration) {
        self.breaker_open.store(true, Ordering::SeqCst);
        self.breaker_reset_at
            .store(now_secs() + window.as_secs(), Ordering::SeqCst);
    }

    fn close_breaker(&self) {
        self.breaker_open.store(false, Ordering::SeqCst);
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Short probe-then-escalate reconnect, used directly by a client's
    /// failed stream-open (5-second breaker window on probe failure).
    pub async fn open_stream_with_reconnect(
        self: &Arc<Self>,
        current: &Arc<tokio::sync::RwLock<Arc<Multiplex>>>,
    ) -> Result<Arc<Multiplex>> {
        if self.breaker_is_open() {
            return Err(Error::CircuitOpen);
        }
        {
            let mux = current.read().await;
            if !mux.is_closed() {
                return Ok(mux.clone());
            }
        }
        self.set_state(ConnectionState::Disconnected);
        let probe = (self.config.probe)();
        if tokio::time::timeout(Duration::from_millis(500), probe)
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
        {
            self.trigger_reconnect(current).await
        } else {
            self.open_breaker(Duration::from_secs(5));
            warn!("probe failed, circuit opened for 5s");
            Err(Error::ServerUnreachable)
        }
    }

    /// Ensure exactly one reconnect attempt is in flight; callers racing
    /// this call coalesce on `reconnect_notify`.
    async fn trigger_reconnect(
        self: &Arc<Self>,
        current: &Arc<tokio::sync::RwLock<Arc<Multiplex>>>,
    ) -> Result<Arc<Multiplex>> {
        let guard = self.reconnect_mutex.try_lock();
        if guard.is_err() {
            // someone else is already reconnecting; wait for the signal
            self.reconnect_notify.notified().await;
            return Ok(current.read().await.clone());
        }
        let _guard = guard.unwrap();
        if self.state() == ConnectionState::Connected {
            return Ok(current.read().await.clone());
        }
        self.set_state(ConnectionState::Reconnecting);
        let fresh = self.dial_with_backoff().await?;
        {
            let mut w = current.write().await;
            *w = Arc::new(fresh);
        }
        self.set_state(ConnectionState::Connected);
        self.close_breaker();
        self.reconnect_notify.notify_waiters();
        info!("reconnected");
        Ok(current.read().await.clone())
    }

    async fn dial_with_backoff(&self) -> Result<Multiplex> {
        let mut backoff = self.config.initial_backoff;
        loop {
            if self.cancel.is_cancelled() {
                self.set_state(ConnectionState::Failed);
                return Err(Error::ServerUnreachable);
            }
            match (self.config.dial)().await {
                Ok(mux) => return Ok(mux),
                Err(e) => {
                    debug!(error = %e, backoff_ms = backoff.as_millis() as u64, "dial failed, backing off");
                    tokio::time::sleep(jittered(backoff, self.config.backoff_jitter)).await;
                    backoff = (backoff * 2).min(self.config.max_backoff);
                }
            }
        }
    }

    /// Background task: periodically checks whether the multiplex has
    /// died and kicks off reconnection. Takes a `Weak` handle to the
    /// owning controller/multiplex pair so it never keeps the session
    /// alive by itself.
    pub fn spawn_monitor(
        self: &Arc<Self>,
        current: Arc<tokio::sync::RwLock<Arc<Multiplex>>>,
    ) {
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let base = Duration::from_secs(5);
                let jitter = if let Some(c) = weak.upgrade() {
                    if c.state() == ConnectionState::Connected {
                        0.5
                    } else {
                        0.2
                    }
                } else {
                    return;
                };
                let wait = jittered(base, jitter);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = cancel.cancelled() => return,
                }
                let Some(controller) = weak.upgrade() else {
                    return;
                };
                let is_closed = current.read().await.is_closed();
                if is_closed && controller.state() != ConnectionState::Reconnecting {
                    if controller.breaker_is_open() {
                        continue;
                    }
                    let probe = (controller.config.probe)();
                    let probe_ok = tokio::time::timeout(Duration::from_secs(2), probe)
                        .await
                        .map(|r| r.is_ok())
                        .unwrap_or(false);
                    if probe_ok {
                        let _ = controller.trigger_reconnect(&current).await;
                    } else {
                        controller.open_breaker(Duration::from_secs(5));
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn state_round_trips_through_u8() {
        for s in [
            ConnectionState::Connected,
            ConnectionState::Disconnected,
            ConnectionState::Reconnecting,
            ConnectionState::Failed,
        ] {
            let byte: u8 = s.into();
            assert_eq!(ConnectionState::from(byte), s);
        }
    }

    #[tokio::test]
    async fn breaker_opens_on_probe_failure() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_probe = attempts.clone();
        let config = ReconnectConfig {
            dial: Arc::new(|| Box::pin(async { Err(Error::ServerUnreachable) })),
            probe: Arc::new(move || {
                attempts_probe.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Err(Error::ServerUnreachable) })
            }),
            ..ReconnectConfig::default()
        };
        let controller = ReconnectController::new(config);
        assert!(!controller.breaker_is_open());
        controller.open_breaker(Duration::from_secs(5));
        assert!(controller.breaker_is_open());
    }
}
