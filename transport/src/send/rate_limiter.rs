use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::trace;

/// Token bucket pacing the packets of a send stream.
///
/// The bucket holds up to `burst_size` bytes worth of tokens and is refilled at `rate` bytes
///  per second. Sending a packet takes its size in tokens; the balance may go negative, in
///  which case the sender waits until it is back at zero. The first `burst_size` bytes go out
///  without delay, everything after that at `rate`.
pub struct RateLimiter {
    rate: f64,
    burst_size: f64,
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(rate: f64, burst_size: usize) -> RateLimiter {
        RateLimiter {
            rate,
            burst_size: burst_size as f64,
            tokens: burst_size as f64,
            last_refill: Instant::now(),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate <= 0.0
    }

    /// Takes tokens for `bytes` and returns how long the sender has to wait before it may send
    pub fn reserve(&mut self, bytes: usize, now: Instant) -> Duration {
        if self.is_unlimited() {
            return Duration::ZERO;
        }

        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst_size);
        self.last_refill = now;

        self.tokens -= bytes as f64;
        if self.tokens >= 0.0 {
            Duration::ZERO
        }
        else {
            Duration::from_secs_f64(-self.tokens / self.rate)
        }
    }

    pub async fn acquire(&mut self, bytes: usize) {
        let delay = self.reserve(bytes, Instant::now());
        if !delay.is_zero() {
            trace!("rate limit: waiting {:?} before sending {} bytes", delay, bytes);
            sleep(delay).await;
        }
    }
}
