//! Clock abstraction used by the timing wheel and egress driver.
//!
//! Production code runs on [`SystemClock`]; tests that need to walk a
//! multi-second horizon deterministically (see the long-term migration
//! scenario in `dgram-udp`) swap in [`MockClock`] instead. Both share the
//! [`Clock`] trait so the wheel code never branches on which one is active.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Boxed, type-erased sleep future so [`Clock::sleep`] can be called through
/// a trait object or a generic bound without naming the concrete future.
pub type Sleep = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A source of monotonic time and the ability to suspend for a duration.
///
/// Callers hold this behind `Arc<dyn Clock>` (the egress driver and every
/// connection do), so the trait itself stays object-safe; `SystemClock` and
/// `MockClock` are additionally `Clone` in their own right for tests that
/// want an owned handle without the `Arc`.
pub trait Clock: Send + Sync + 'static {
    /// Current monotonic instant, per this clock's notion of time.
    fn now(&self) -> Instant;

    /// Suspend the caller until `duration` has elapsed on this clock.
    fn sleep(&self, duration: Duration) -> Sleep;
}

/// Real wall/monotonic clock, backed by `tokio::time`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

#[cfg(feature = "runtime-tokio")]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        Box::pin(tokio::time::sleep(duration))
    }
}

#[cfg(not(feature = "runtime-tokio"))]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, _duration: Duration) -> Sleep {
        panic!("SystemClock::sleep requires the `runtime-tokio` feature")
    }
}

/// A manually-advanceable virtual clock for deterministic tests.
///
/// `advance` moves the clock's notion of "now" forward and wakes every
/// sleeper whose deadline has passed, in the order they registered.
#[derive(Clone)]
pub struct MockClock {
    inner: Arc<Mutex<MockClockState>>,
}

struct MockClockState {
    origin: Instant,
    elapsed: Duration,
    sleepers: Vec<Arc<Mutex<SleeperState>>>,
}

struct SleeperState {
    deadline: Duration,
    woken: bool,
    waker: Option<std::task::Waker>,
}

impl MockClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockClockState {
                origin: Instant::now(),
                elapsed: Duration::ZERO,
                sleepers: Vec::new(),
            })),
        }
    }

    /// Move the clock forward by `delta`, waking any sleeper whose deadline
    /// now lies at or before the new elapsed time.
    pub fn advance(&self, delta: Duration) {
        let mut state = self.inner.lock().unwrap();
        state.elapsed += delta;
        let now = state.elapsed;
        state.sleepers.retain(|sleeper| {
            let mut sleeper_state = sleeper.lock().unwrap();
            if !sleeper_state.woken && sleeper_state.deadline <= now {
                sleeper_state.woken = true;
                if let Some(waker) = sleeper_state.waker.take() {
                    waker.wake();
                }
                false
            } else {
                true
            }
        });
    }

    pub fn elapsed(&self) -> Duration {
        self.inner.lock().unwrap().elapsed
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        let state = self.inner.lock().unwrap();
        state.origin + state.elapsed
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        let state = self.inner.lock().unwrap();
        let deadline = state.elapsed + duration;
        let already_due = deadline <= state.elapsed;
        let sleeper = Arc::new(Mutex::new(SleeperState {
            deadline,
            woken: already_due,
            waker: None,
        }));
        if !already_due {
            drop(state);
            self.inner.lock().unwrap().sleepers.push(sleeper.clone());
        }
        Box::pin(MockSleep { sleeper })
    }
}

struct MockSleep {
    sleeper: Arc<Mutex<SleeperState>>,
}

impl Future for MockSleep {
    type Output = ();

    fn poll(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        let mut state = self.sleeper.lock().unwrap();
        if state.woken {
            std::task::Poll::Ready(())
        } else {
            state.waker = Some(cx.waker().clone());
            std::task::Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_past_deadline_resolves_immediately_queued_sleep() {
        let clock = MockClock::new();
        let start = clock.now();
        clock.advance(Duration::from_millis(500));
        assert_eq!(clock.now() - start, Duration::from_millis(500));
    }
}
