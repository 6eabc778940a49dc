//! The fixed-window roll shared by the count and token rate-limit engines.
//!
//! Both engines describe the same roll rule, once per counter shape (a
//! single `remaining`, a `(prompt_remaining, completion_remaining)` pair);
//! this module holds the one rule, and each engine supplies its own counter
//! shape around it.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// `FRESH -> ACTIVE -> {EXHAUSTED, EXPIRED -> FRESH}`, generic over whatever
/// counters a particular rate-limit flavor tracks.
pub struct Window<T> {
    window: Duration,
    state: Mutex<WindowState<T>>,
}

struct WindowState<T> {
    counters: T,
    reset_time: Instant,
}

impl<T: Clone> Window<T> {
    pub fn new(window: Duration, initial: T, now: Instant) -> Self {
        Self {
            window,
            state: Mutex::new(WindowState {
                counters: initial,
                reset_time: now + window,
            }),
        }
    }

    /// Rolls the window if expired, then hands the (possibly fresh) counters
    /// and the current `reset_time` to `f` under a single lock so the
    /// roll-then-mutate sequence is atomic with respect to other requests.
    pub fn with_counters<R>(
        &self,
        now: Instant,
        fresh: impl FnOnce() -> T,
        f: impl FnOnce(&mut T) -> R,
    ) -> (R, Instant) {
        let mut state = self.state.lock();
        if now > state.reset_time {
            state.counters = fresh();
            state.reset_time = now + self.window;
        }
        let result = f(&mut state.counters);
        (result, state.reset_time)
    }

    pub fn reset_time(&self) -> Instant {
        self.state.lock().reset_time
    }

    pub fn seconds_until_reset(&self, now: Instant) -> u64 {
        self.reset_time().saturating_duration_since(now).as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolls_window_once_expired() {
        let now = Instant::now();
        let window = Window::new(Duration::from_secs(60), 2u32, now);

        let (remaining, _) = window.with_counters(now, || 2, |r| {
            *r -= 1;
            *r
        });
        assert_eq!(remaining, 1);

        let later = now + Duration::from_secs(61);
        let (remaining, reset) = window.with_counters(later, || 2, |r| *r);
        assert_eq!(remaining, 2, "window should have rolled back to fresh");
        assert!(reset > later);
    }

    #[test]
    fn does_not_roll_before_expiry() {
        let now = Instant::now();
        let window = Window::new(Duration::from_secs(60), 2u32, now);
        window.with_counters(now, || 2, |r| *r -= 1);
        let (remaining, _) = window.with_counters(now + Duration::from_secs(5), || 2, |r| *r);
        assert_eq!(remaining, 1);
    }
}
