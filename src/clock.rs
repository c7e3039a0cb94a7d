use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Time source for every deadline in the core.
pub trait Clock {
    /// Monotonic milliseconds since an arbitrary origin.
    fn now_ms(&self) -> u64;
    /// Wall-clock seconds since the Unix epoch, if the clock has been set.
    fn unix_time(&self) -> Option<i64> {
        None
    }
    /// Yield for one poll step inside a bounded bus wait.
    fn pause(&self);
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    const POLL_STEP: Duration = Duration::from_millis(1);

    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn unix_time(&self) -> Option<i64> {
        let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).ok()?;
        i64::try_from(since_epoch.as_secs()).ok()
    }

    fn pause(&self) {
        std::thread::sleep(Self::POLL_STEP);
    }
}

/// Hand-driven clock for tests and replay. Clones share the same time, so the
/// simulated bus and the logger see one timeline; `pause` advances it by one
/// millisecond.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now_ms: Rc<Cell<u64>>,
    unix_origin: Rc<Cell<Option<i64>>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(now_ms: u64) -> Self {
        let clock = Self::new();
        clock.now_ms.set(now_ms);
        clock
    }

    pub fn advance(&self, ms: u64) {
        self.now_ms.set(self.now_ms.get().saturating_add(ms));
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.set(now_ms);
    }

    /// Pin the wall clock: `unix_time` reports `epoch_s` at the current
    /// monotonic time and moves with it.
    pub fn set_unix_time(&self, epoch_s: i64) {
        let elapsed_s = (self.now_ms.get() / 1000) as i64;
        self.unix_origin.set(Some(epoch_s - elapsed_s));
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.get()
    }

    fn unix_time(&self) -> Option<i64> {
        self.unix_origin.get().map(|origin| origin + (self.now_ms.get() / 1000) as i64)
    }

    fn pause(&self) {
        self.advance(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::new();
        let other = clock.clone();
        clock.advance(250);
        other.pause();
        assert_eq!(clock.now_ms(), 251);
        assert_eq!(other.now_ms(), 251);
    }

    #[test]
    fn test_manual_unix_time_tracks_monotonic() {
        let clock = ManualClock::starting_at(5_000);
        assert_eq!(clock.unix_time(), None);
        clock.set_unix_time(1_700_000_000);
        clock.advance(3_000);
        assert_eq!(clock.unix_time(), Some(1_700_000_003));
    }
}
