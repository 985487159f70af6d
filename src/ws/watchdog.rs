//! Restartable single-shot inactivity timers.

use std::future::pending;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::{Instant, Sleep, sleep_until};

/// Stand-in deadline for periods too long to add to the current instant.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline_after(period: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(period).unwrap_or(now + FAR_FUTURE)
}

/// A single-shot alarm that fires once `period` has elapsed since the last [`Watchdog::reset`].
///
/// Meant to be polled from a `tokio::select!` loop through [`Watchdog::expired`]. After it
/// fires the watchdog stays disarmed until reset again. Dropping it cancels it.
///
/// Periods too large to represent, such as [`Duration::MAX`], never fire in practice.
#[derive(Debug)]
pub struct Watchdog {
    period: Duration,
    sleep: Pin<Box<Sleep>>,
    armed: bool,
}

impl Watchdog {
    /// Create a watchdog that is armed from now.
    #[must_use]
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            sleep: Box::pin(sleep_until(deadline_after(period))),
            armed: true,
        }
    }

    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Re-arm the alarm a full period from now.
    pub fn reset(&mut self) {
        self.sleep.as_mut().reset(deadline_after(self.period));
        self.armed = true;
    }

    /// Resolves when the alarm fires. Never resolves while disarmed.
    ///
    /// Cancel safe: dropping the returned future leaves the deadline untouched.
    pub async fn expired(&mut self) {
        if !self.armed {
            pending::<()>().await;
        }
        self.sleep.as_mut().await;
        self.armed = false;
    }
}
