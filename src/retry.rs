//! Bounded retry with exponential backoff around a single usage fetch, and
//! the wake-up control block shared by the poll thread and the foreground.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::models::UsageData;
use crate::poller::{ErrorKind, FetchError};
use crate::settings::MAX_POLL_INTERVAL_SECS;

pub const MAX_RETRIES: u32 = 3;
const RETRY_BASE: Duration = Duration::from_secs(2);
const RATE_LIMIT_FACTOR: u32 = 4;
/// Longest single backoff, whatever the server asks for in `Retry-After`.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(MAX_POLL_INTERVAL_SECS);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub rate_limit_factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            base_delay: RETRY_BASE,
            rate_limit_factor: RATE_LIMIT_FACTOR,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): 2s, 4s, 8s for the
    /// default policy, scaled up for rate limiting. Never above [`MAX_RETRY_DELAY`].
    pub fn delay_for(&self, retry: u32, error: &FetchError) -> Duration {
        let backoff = self
            .base_delay
            .saturating_mul(1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX));
        let delay = match error {
            FetchError::RateLimited { retry_after } => {
                let scaled = backoff.saturating_mul(self.rate_limit_factor);
                retry_after.map_or(scaled, |ra| ra.max(scaled))
            }
            _ => backoff,
        };
        delay.min(MAX_RETRY_DELAY)
    }
}

/// Run `attempt` until it succeeds, fails with an auth error, or the retry
/// budget is spent.
///
/// `on_retry(retry, error, delay)` is called before each backoff sleep. A stop
/// request during a sleep ends the sequence with [`FetchError::Cancelled`].
pub fn fetch_with_retry<F, R>(
    policy: &RetryPolicy,
    control: &PollControl,
    mut attempt: F,
    mut on_retry: R,
) -> Result<UsageData, FetchError>
where
    F: FnMut() -> Result<UsageData, FetchError>,
    R: FnMut(u32, &FetchError, Duration),
{
    let mut retry = 0;
    loop {
        if control.is_stopped() {
            return Err(FetchError::Cancelled);
        }

        let error = match attempt() {
            Ok(data) => return Ok(data),
            Err(e) => e,
        };

        match error.kind() {
            ErrorKind::Auth => {
                debug!("Auth failure, skipping remaining retries: {error}");
                return Err(error);
            }
            _ if matches!(error, FetchError::Cancelled) => return Err(error),
            _ if retry >= policy.max_retries => {
                warn!("Giving up after {retry} retries: {error}");
                return Err(error);
            }
            _ => {}
        }

        retry += 1;
        let delay = policy.delay_for(retry, &error);
        warn!("Fetch failed ({error}); retry {retry}/{} in {delay:?}", policy.max_retries);
        on_retry(retry, &error, delay);

        if !control.sleep(delay) {
            return Err(FetchError::Cancelled);
        }
    }
}

/// `now + duration`, or `None` when that is past what `Instant` can hold.
pub(crate) fn deadline_after(duration: Duration) -> Option<Instant> {
    Instant::now().checked_add(duration)
}

/// Why a [`PollControl::wait`] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wake {
    Timeout,
    Refresh,
    Stop,
}

#[derive(Debug, Default)]
struct ControlState {
    stopped: bool,
    refresh_requested: bool,
}

/// Stop and refresh requests for the poll thread.
///
/// All sleeps on the poll thread go through here so a stop request ends them
/// immediately.
#[derive(Debug, Default)]
pub struct PollControl {
    state: Mutex<ControlState>,
    cond: Condvar,
}

impl PollControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn stop(&self) {
        self.lock().stopped = true;
        self.cond.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    pub fn request_refresh(&self) {
        self.lock().refresh_requested = true;
        self.cond.notify_all();
    }

    /// Sleep for `duration` unless stopped. Returns `false` when stopped.
    ///
    /// Refresh requests do not cut this short; they stay pending for the next
    /// [`wait`](Self::wait).
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = deadline_after(duration);
        let mut state = self.lock();
        loop {
            if state.stopped {
                return false;
            }
            let Some(remaining) = time_left(deadline) else {
                return true;
            };
            state = self.park(state, remaining);
        }
    }

    /// Wait for the next poll: a timeout, a refresh request, or a stop.
    pub fn wait(&self, duration: Duration) -> Wake {
        let deadline = deadline_after(duration);
        let mut state = self.lock();
        loop {
            if state.stopped {
                return Wake::Stop;
            }
            if state.refresh_requested {
                state.refresh_requested = false;
                return Wake::Refresh;
            }
            let Some(remaining) = time_left(deadline) else {
                return Wake::Timeout;
            };
            state = self.park(state, remaining);
        }
    }

    /// Block until notified, or for `timeout` when there is one.
    fn park<'a>(
        &self,
        state: MutexGuard<'a, ControlState>,
        timeout: Option<Duration>,
    ) -> MutexGuard<'a, ControlState> {
        match timeout {
            Some(t) => self
                .cond
                .wait_timeout(state, t)
                .unwrap_or_else(|e| e.into_inner())
                .0,
            None => self.cond.wait(state).unwrap_or_else(|e| e.into_inner()),
        }
    }
}

/// Time left before `deadline`: `None` once it has passed, `Some(None)` when
/// there is no deadline at all.
fn time_left(deadline: Option<Instant>) -> Option<Option<Duration>> {
    match deadline {
        None => Some(None),
        Some(d) => {
            let now = Instant::now();
            (now < d).then(|| Some(d - now))
        }
    }
}
