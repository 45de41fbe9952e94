// src/bus/rate_limit.rs
use std::time::Instant;

/// Continuous-refill token bucket, one per source label.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    rate: f64,
    capacity: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Starts full.
    pub fn new(rate: f64, burst_secs: f64, now: Instant) -> Self {
        let rate = rate.max(0.0);
        let capacity = (rate * burst_secs).max(1.0);
        Self {
            tokens: capacity,
            rate,
            capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Consume one token if available.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Refilled to capacity by `now`; dropping it loses nothing.
    pub fn is_idle(&self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens + elapsed * self.rate >= self.capacity
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn burst_then_refill() {
        let t0 = Instant::now();
        let mut b = TokenBucket::new(2.0, 5.0, t0);
        assert_eq!(b.capacity(), 10.0);
        let ok = (0..13).filter(|_| b.try_acquire(t0)).count();
        assert_eq!(ok, 10);
        // Half a second at 2/s is one token.
        assert!(b.try_acquire(t0 + Duration::from_millis(500)));
        assert!(!b.try_acquire(t0 + Duration::from_millis(500)));
    }

    #[test]
    fn refill_never_exceeds_capacity() {
        let t0 = Instant::now();
        let mut b = TokenBucket::new(1.0, 5.0, t0);
        assert!(b.try_acquire(t0));
        b.refill(t0 + Duration::from_secs(3600));
        assert_eq!(b.tokens(), 5.0);
    }

    #[test]
    fn idle_once_refilled() {
        let t0 = Instant::now();
        let mut b = TokenBucket::new(1.0, 2.0, t0);
        assert!(b.is_idle(t0));
        assert!(b.try_acquire(t0));
        assert!(!b.is_idle(t0));
        assert!(b.is_idle(t0 + Duration::from_secs(1)));
    }
}
