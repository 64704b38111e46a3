//! Time sources for the tracing deadline.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Monotonic time elapsed since some fixed start
pub trait Clock
{
    /// Time elapsed since the clock was created.
    fn elapsed(&self) -> Duration;
}

/// Wall clock backed by [`Instant`]
#[derive(Debug, Clone, Copy)]
pub struct SystemClock
{
    start: Instant,
}

impl SystemClock
{
    /// Start counting now.
    #[must_use]
    pub fn start() -> Self
    {
        Self { start: Instant::now() }
    }
}

impl Clock for SystemClock
{
    fn elapsed(&self) -> Duration
    {
        self.start.elapsed()
    }
}

/// Clock advanced explicitly, shared between a replay controller and the tracer
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Rc<Cell<Duration>>);

impl ManualClock
{
    /// A clock at zero.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration)
    {
        self.0.set(self.0.get() + by);
    }
}

impl Clock for ManualClock
{
    fn elapsed(&self) -> Duration
    {
        self.0.get()
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_manual_clock_is_shared()
    {
        let clock = ManualClock::new();
        let handle = clock.clone();
        handle.advance(Duration::from_millis(250));
        handle.advance(Duration::from_millis(250));
        assert_eq!(clock.elapsed(), Duration::from_millis(500));
    }
}
