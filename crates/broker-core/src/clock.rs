//! Monotonic versioning clock. Every pool mutation is stamped with a tick
//! from this clock; ticks must never repeat or go backwards even when two
//! mutations land in the same wall-clock millisecond.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tokio::time::{interval, Duration};

/// Ticks are wall-clock milliseconds, nudged forward to stay strictly
/// increasing; a background corrector pulls a clock that's drifted ahead
/// of real time back down gradually rather than snapping it.
const DRIFT_CORRECTION_PER_TICK_MS: i64 = 1;
const DRIFT_CORRECTOR_INTERVAL: Duration = Duration::from_secs(1);

fn wall_clock_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Shared, cheaply-cloneable monotonic clock.
#[derive(Clone)]
pub struct Clock {
    last: Arc<AtomicI64>,
}

impl Clock {
    pub fn new() -> Self {
        Clock {
            last: Arc::new(AtomicI64::new(wall_clock_millis())),
        }
    }

    /// Returns a tick strictly greater than every tick previously returned
    /// by this clock. CAS-loops against wall-clock time so concurrent
    /// callers never observe the same value.
    pub fn now(&self) -> i64 {
        loop {
            let synthetic = wall_clock_millis();
            let prev = self.last.load(Ordering::Acquire);
            let candidate = synthetic.max(prev + 1);
            if self
                .last
                .compare_exchange_weak(prev, candidate, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return candidate;
            }
        }
    }

    /// Spawn the background drift corrector: once a second, if the clock
    /// has run ahead of wall-clock time (because ticks were consumed faster
    /// than milliseconds pass), pull it back down by at most
    /// `DRIFT_CORRECTION_PER_TICK_MS` per tick of wall-clock elapsed, never
    /// allowing `last` to move backwards past a value already handed out.
    pub fn spawn_corrector(&self, mut stop: watch::Receiver<bool>) {
        let last = self.last.clone();
        tokio::spawn(async move {
            let mut ticker = interval(DRIFT_CORRECTOR_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let wall = wall_clock_millis();
                        let current = last.load(Ordering::Acquire);
                        if current > wall {
                            let corrected = (current - DRIFT_CORRECTION_PER_TICK_MS).max(wall);
                            let _ = last.compare_exchange(
                                current,
                                corrected,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            );
                        }
                    }
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_strictly_increasing_across_many_calls() {
        let clock = Clock::new();
        let mut prev = clock.now();
        for _ in 0..10_000 {
            let next = clock.now();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn now_is_strictly_increasing_under_concurrent_contention() {
        let clock = Clock::new();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let clock = clock.clone();
            handles.push(std::thread::spawn(move || {
                (0..2_000).map(move |_| clock.now()).collect::<Vec<_>>()
            }));
        }
        let mut all: Vec<i64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let unique_count = {
            let mut sorted = all.clone();
            sorted.sort_unstable();
            sorted.dedup();
            sorted.len()
        };
        all.sort_unstable();
        assert_eq!(unique_count, all.len(), "every tick must be unique");
    }

    #[tokio::test(start_paused = true)]
    async fn corrector_pulls_an_artificially_advanced_clock_back_towards_wall_time() {
        let clock = Clock::new();
        let (tx, rx) = watch::channel(false);
        // push the clock far ahead of wall-clock time
        clock.last.store(wall_clock_millis() + 10_000, Ordering::Release);
        clock.spawn_corrector(rx);
        let before = clock.last.load(Ordering::Acquire);
        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        let after = clock.last.load(Ordering::Acquire);
        assert!(after < before, "corrector should have pulled the clock down");
        let _ = tx.send(true);
    }
}
