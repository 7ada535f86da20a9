use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const IDLE_EVICTION_THRESHOLD: Duration = Duration::from_secs(300);

/// Per-host limiter state for the server-hint layer. `not_before` only ever
/// advances (§8's host-limiter monotonicity law); `last_used` feeds the
/// sweeper's idle eviction.
pub struct HostState {
    not_before: Mutex<Instant>,
    last_used: Mutex<Instant>,
}

impl HostState {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            not_before: Mutex::new(now),
            last_used: Mutex::new(now),
        }
    }

    pub fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    pub fn not_before(&self) -> Instant {
        *self.not_before.lock()
    }

    /// Advances `not_before` only if `candidate` is strictly greater,
    /// preserving monotonicity under concurrent or out-of-order header
    /// responses for the same host.
    pub fn advance_not_before(&self, candidate: Instant) {
        let mut not_before = self.not_before.lock();
        if candidate > *not_before {
            *not_before = candidate;
        }
    }

    fn is_idle_and_past(&self, now: Instant, idle_threshold: Duration) -> bool {
        let idle = now.saturating_duration_since(*self.last_used.lock());
        idle > idle_threshold && *self.not_before.lock() <= now
    }
}

/// Lock-free-read, per-entry-mutex-mutation map of host limiter state, with
/// a background sweeper evicting hosts idle beyond
/// [`IDLE_EVICTION_THRESHOLD`] whose `not_before` already lies in the past.
/// `close` is idempotent and stops the sweeper; dropping the map without
/// calling `close` leaves the sweeper task running until the runtime shuts
/// down (no `Drop` impl does the stopping, since a synchronous `Drop` cannot
/// await the task's exit the way `close` does).
pub struct HostStateMap {
    entries: DashMap<String, Arc<HostState>>,
    shutdown: Notify,
    shutdown_requested: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl HostStateMap {
    pub fn new() -> Arc<Self> {
        let map = Arc::new(Self {
            entries: DashMap::new(),
            shutdown: Notify::new(),
            shutdown_requested: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        });

        let sweeper_map = map.clone();
        let handle = tokio::spawn(async move { sweeper_map.sweep_loop().await });
        *map.sweeper.lock() = Some(handle);
        map
    }

    pub fn get_or_create(&self, host: &str) -> Arc<HostState> {
        self.entries.entry(host.to_string()).or_insert_with(|| Arc::new(HostState::new())).clone()
    }

    async fn sweep_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                    if self.shutdown_requested.load(Ordering::SeqCst) {
                        break;
                    }
                    self.sweep_once();
                }
            }
        }
    }

    fn sweep_once(&self) {
        let now = Instant::now();
        self.entries.retain(|_, state| !state.is_idle_and_past(now, IDLE_EVICTION_THRESHOLD));
    }

    /// Idempotent: signals the sweeper and waits for it to exit.
    pub async fn close(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();

        let handle = self.sweeper.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
