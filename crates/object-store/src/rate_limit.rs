//! Token-bucket rate limiting for bucket operations.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Simple token bucket; callers await [`acquire`] before each operation.
///
/// [`acquire`]: TokenBucket::acquire
pub struct TokenBucket {
    state: Mutex<BucketState>,
    rate_per_sec: f64,
    burst: f64,
}

struct BucketState {
    tokens: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_sec: u32, burst: u32) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                refilled_at: Instant::now(),
            }),
            rate_per_sec: rate_per_sec as f64,
            burst: burst as f64,
        }
    }

    /// Time to wait before the next operation may proceed; zero when a
    /// token was available immediately.
    fn reserve(&self) -> Duration {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(state.refilled_at).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.burst);
        state.refilled_at = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Duration::ZERO
        } else {
            let deficit = 1.0 - state.tokens;
            state.tokens -= 1.0;
            Duration::from_secs_f64(deficit / self.rate_per_sec)
        }
    }

    /// Wait for a token.
    pub async fn acquire(&self) {
        let wait = self.reserve();
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}
