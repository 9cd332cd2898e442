use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::adapters::RateLimitInfo;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Per-adapter request budget: a request quota per window plus a cap on
/// concurrent upstream calls. Never waits; callers get the delay instead.
#[derive(Clone)]
pub struct RateBudget {
    limiter: Arc<DirectRateLimiter>,
    clock: DefaultClock,
    in_flight: Arc<Semaphore>,
    info: RateLimitInfo,
}

/// Held for the duration of one upstream call.
#[derive(Debug)]
pub struct RatePermit {
    _permit: OwnedSemaphorePermit,
}

impl RateBudget {
    pub fn new(info: RateLimitInfo) -> Self {
        let quota = quota_from_window(info.window, info.requests_per_window);
        Self {
            limiter: Arc::new(RateLimiter::direct(quota)),
            clock: DefaultClock::default(),
            in_flight: Arc::new(Semaphore::new(info.max_concurrency.max(1))),
            info,
        }
    }

    pub const fn info(&self) -> RateLimitInfo {
        self.info
    }

    /// Takes one request from the budget, or returns how long to wait.
    pub fn try_acquire(&self) -> Result<RatePermit, Duration> {
        let permit = Arc::clone(&self.in_flight)
            .try_acquire_owned()
            .map_err(|_| self.cell_period())?;

        match self.limiter.check() {
            Ok(()) => Ok(RatePermit { _permit: permit }),
            Err(not_until) => Err(not_until.wait_time_from(self.clock.now())),
        }
    }

    pub fn available_concurrency(&self) -> usize {
        self.in_flight.available_permits()
    }

    fn cell_period(&self) -> Duration {
        let limit = self.info.requests_per_window.max(1);
        self.info.window / limit
    }
}

fn quota_from_window(quota_window: Duration, quota_limit: u32) -> Quota {
    let safe_limit = NonZeroU32::new(quota_limit.max(1)).unwrap_or(NonZeroU32::MIN);

    let seconds_per_cell = (quota_window.as_secs_f64() / f64::from(safe_limit.get())).max(0.001);
    let period = Duration::from_secs_f64(seconds_per_cell);

    Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(safe_limit))
        .allow_burst(safe_limit)
}
