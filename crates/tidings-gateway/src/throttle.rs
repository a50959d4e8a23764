use std::time::Duration;

use tokio::time::Instant;

/// Timer resolution; shorter sleeps could spin on float rounding.
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Token bucket pacing one session's writer.
#[derive(Debug)]
pub struct Throttle {
    tokens: f64,
    capacity: f64,
    /// Tokens per second.
    rate: f64,
    last_refill: Instant,
}

impl Throttle {
    /// `burst` frames per `per`, starting full.
    pub fn new(burst: u32, per: Duration) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            tokens: capacity,
            capacity,
            rate: capacity / per.as_secs_f64(),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
    }

    pub fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Waits until a token is available and takes it.
    pub async fn acquire(&mut self) {
        loop {
            if self.try_acquire() {
                return;
            }
            let missing = 1.0 - self.tokens;
            let wait = Duration::from_secs_f64(missing / self.rate).max(MIN_WAIT);
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn allows_a_burst_then_refuses() {
        let mut throttle = Throttle::new(10, Duration::from_millis(100));
        for _ in 0..10 {
            assert!(throttle.try_acquire());
        }
        assert!(!throttle.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn refills_over_time() {
        let mut throttle = Throttle::new(10, Duration::from_millis(100));
        for _ in 0..10 {
            throttle.acquire().await;
        }

        tokio::time::advance(Duration::from_millis(100)).await;
        for _ in 0..10 {
            assert!(throttle.try_acquire());
        }
        assert!(!throttle.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_the_next_token() {
        let mut throttle = Throttle::new(10, Duration::from_millis(100));
        let start = Instant::now();
        for _ in 0..11 {
            throttle.acquire().await;
        }
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(9), "waited {waited:?}");
        assert!(waited < Duration::from_millis(50), "waited {waited:?}");
    }
}
