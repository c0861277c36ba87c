use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// Strict sliding-window limiter: at most `max_requests` calls are allowed to
/// start in any trailing `window` duration. `acquire()` suspends the caller
/// until a slot frees rather than rejecting (P5), matching the directory
/// API's quota semantics — there is no burst allowance beyond the window.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            timestamps: Mutex::new(VecDeque::with_capacity(max_requests)),
        }
    }

    pub fn per_minute(max_requests: usize) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    /// Block until a slot is free, then record the call as having started.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut timestamps = self.timestamps.lock().await;
                let now = Instant::now();
                while let Some(&front) = timestamps.front() {
                    if now.duration_since(front) >= self.window {
                        timestamps.pop_front();
                    } else {
                        break;
                    }
                }

                if timestamps.len() < self.max_requests {
                    timestamps.push_back(now);
                    None
                } else {
                    let oldest = *timestamps.front().expect("len >= max_requests > 0");
                    Some(self.window - now.duration_since(oldest))
                }
            };

            match wait {
                None => return,
                Some(duration) => {
                    debug!(?duration, "rate limit window full, waiting for a slot");
                    tokio::time::sleep(duration).await;
                }
            }
        }
    }

    /// Number of calls currently counted within the active window.
    pub async fn in_flight_count(&self) -> usize {
        let mut timestamps = self.timestamps.lock().await;
        let now = Instant::now();
        while let Some(&front) = timestamps.front() {
            if now.duration_since(front) >= self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
        timestamps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_max_requests_immediately() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert_eq!(limiter.in_flight_count().await, 3);
    }

    #[tokio::test]
    async fn fourth_call_waits_for_the_window_to_slide() {
        let limiter = RateLimiter::new(2, Duration::from_millis(50));
        limiter.acquire().await;
        limiter.acquire().await;

        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}
