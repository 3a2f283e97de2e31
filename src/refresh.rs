use crate::pool::ProxyPool;
use chrono::{DateTime, Utc};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

/// Base rotation sleep plus up to four whole minutes of jitter.
const ROTATION_BASE: Duration = Duration::from_secs(5 * 60);
const ROTATION_STEP_SECS: u64 = 60;
const ROTATION_STEPS: u64 = 5;

/// Wall-clock bookkeeping for the scrape cycle. Written by the orchestrator
/// after each completed refresh, read by the status surface.
#[derive(Debug, Default)]
pub struct ScrapeTiming {
    inner: Mutex<TimingState>,
}

#[derive(Debug, Default, Clone, Copy)]
struct TimingState {
    last: Option<DateTime<Utc>>,
    next: Option<DateTime<Utc>>,
}

impl ScrapeTiming {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a refresh that just completed; the next one is expected one
    /// interval from now.
    pub fn record(&self, interval: Duration) {
        let now = Utc::now();
        let next = chrono::Duration::from_std(interval)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(now);

        let mut state = self.lock();
        state.last = Some(now);
        state.next = Some(next);
    }

    /// `(last_scrape, next_scrape)`, both `None` before the first refresh.
    pub fn snapshot(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        let state = self.lock();
        (state.last, state.next)
    }

    fn lock(&self) -> MutexGuard<'_, TimingState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Sender half of the manual-refresh mailbox. The slot holds at most one
/// pending signal; triggers that arrive while one is pending are dropped.
#[derive(Debug, Clone)]
pub struct RefreshHandle {
    tx: mpsc::Sender<()>,
}

impl RefreshHandle {
    /// Non-blocking trigger; a full slot means a refresh is already pending.
    pub fn trigger(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Builds the single-slot coalescing channel for manual refresh requests.
pub fn refresh_channel() -> (RefreshHandle, mpsc::Receiver<()>) {
    let (tx, rx) = mpsc::channel(1);
    (RefreshHandle { tx }, rx)
}

/// Sleep before the next automatic upstream rotation. The delay is sampled
/// independently of pool contents.
pub fn rotation_delay<R: Rng>(rng: &mut R) -> Duration {
    ROTATION_BASE + Duration::from_secs(ROTATION_STEP_SECS * rng.gen_range(0..ROTATION_STEPS))
}

/// Rotates the active upstream forever on a randomized cadence. Pools
/// holding one proxy or none are left alone.
pub async fn rotation_loop(pool: Arc<ProxyPool>) {
    let mut rng = SmallRng::from_entropy();
    loop {
        tokio::time::sleep(rotation_delay(&mut rng)).await;
        if pool.size() > 1 {
            pool.switch_next();
        }
    }
}
