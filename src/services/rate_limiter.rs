use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

/// Process-wide token bucket shared by every verification job.
///
/// The bucket holds `capacity` tokens and each spent token comes back exactly
/// one `period` after it was taken, so no window of length `period` ever sees
/// more than `capacity` admissions. Waiters queue on a fair mutex and are
/// admitted roughly in arrival order.
pub struct RateLimiter {
    capacity: usize,
    period: Duration,
    spent: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Limiter admitting `per_second` operations per second.
    pub fn per_second(per_second: u32) -> Self {
        Self::new(per_second, Duration::from_secs(1))
    }

    pub fn new(capacity: u32, period: Duration) -> Self {
        let capacity = capacity.max(1) as usize;
        Self { capacity, period, spent: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    /// Sustained admissions per second.
    pub fn rate(&self) -> f64 {
        self.capacity as f64 / self.period.as_secs_f64()
    }

    /// Wait for a token and consume it.
    pub async fn acquire(&self) {
        let mut spent = self.spent.lock().await;

        if spent.len() >= self.capacity {
            if let Some(&oldest) = spent.front() {
                let refill_at = oldest + self.period;
                if Instant::now() < refill_at {
                    sleep_until(refill_at).await;
                }
            }
            spent.pop_front();
        }

        spent.push_back(Instant::now());
    }

    /// Take a token only if one is available right now.
    ///
    /// Returns false without waiting when the bucket is empty or another
    /// caller is queued on it.
    pub fn try_acquire(&self) -> bool {
        let Ok(mut spent) = self.spent.try_lock() else {
            return false;
        };
        let now = Instant::now();

        while spent.front().is_some_and(|&t| t + self.period <= now) {
            spent.pop_front();
        }
        if spent.len() >= self.capacity {
            return false;
        }
        spent.push_back(now);
        true
    }
}
