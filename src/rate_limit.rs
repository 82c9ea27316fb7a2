//! Sliding-window request throttle
//!
//! At most `max_requests` requests are admitted per rolling `window`. A
//! throttle signal from the remote adds a fixed cool-down on top of the
//! window, independent of how full it is.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::config::RateLimitConfig;

#[derive(Debug)]
struct LimiterState {
    /// Admission timestamps, oldest first
    requests: VecDeque<Instant>,
    paused_until: Option<Instant>,
}

/// Protocol-wide request limiter shared by every remote caller
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    retry_delay: Duration,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration, retry_delay: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            retry_delay,
            state: Mutex::new(LimiterState {
                requests: VecDeque::with_capacity(max_requests),
                paused_until: None,
            }),
        }
    }

    pub fn from_config(cfg: &RateLimitConfig) -> Self {
        Self::new(
            cfg.max_requests,
            Duration::from_secs(cfg.window_secs),
            Duration::from_secs(cfg.throttle_pause_secs),
        )
    }

    /// Wait until one more request fits in the window, then record it.
    ///
    /// Never fails. The state lock is only held while deciding; sleeping
    /// happens outside it and the decision is re-taken afterwards.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.lock();
                let now = Instant::now();

                match state.paused_until {
                    Some(until) if until > now => Some(until - now),
                    _ => {
                        state.paused_until = None;
                        Self::prune(&mut state.requests, now, self.window);

                        if state.requests.len() < self.max_requests {
                            state.requests.push_back(now);
                            None
                        } else {
                            // Full: the oldest entry decides when a slot frees up
                            state
                                .requests
                                .front()
                                .map(|oldest| {
                                    (*oldest + self.window).saturating_duration_since(now)
                                })
                        }
                    }
                }
            };

            match wait {
                None => return,
                Some(delay) => {
                    debug!("Rate limit reached, waiting {:.1}s", delay.as_secs_f64());
                    // Zero-length waits can occur at the exact window edge
                    sleep(delay.max(Duration::from_millis(1))).await;
                }
            }
        }
    }

    /// Impose the throttle cool-down, starting now
    pub fn record_throttled(&self) {
        let mut state = self.lock();
        let until = Instant::now() + self.retry_delay;
        if state.paused_until.map_or(true, |current| current < until) {
            state.paused_until = Some(until);
        }
        warn!(
            "Remote throttled us, pausing requests for {}s",
            self.retry_delay.as_secs()
        );
    }

    /// Requests admitted within the current window
    pub fn current_rate(&self) -> usize {
        let mut state = self.lock();
        Self::prune(&mut state.requests, Instant::now(), self.window);
        state.requests.len()
    }

    pub fn is_paused(&self) -> bool {
        self.lock()
            .paused_until
            .is_some_and(|until| until > Instant::now())
    }

    fn prune(requests: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(oldest) = requests.front() {
            if now.duration_since(*oldest) >= window {
                requests.pop_front();
            } else {
                break;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LimiterState> {
        // A poisoned limiter still holds valid timestamps
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
