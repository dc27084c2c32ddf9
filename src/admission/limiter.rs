//! Per-(rule, scope key) rate limiter state machines.
//!
//! A [`Limiter`] is a pure function of time and requested token count: it
//! knows nothing about rules, queues, or strategies beyond the algorithm tag
//! it was created with. The manager owns exactly one limiter per
//! (rule id, scope key) pair and serializes all access to it.

use tracing::trace;

use super::rule::{Algorithm, RuleLimits, Strategy};

/// The outcome of one limiter evaluation, enriched by the manager with
/// strategy and queue details before it reaches the caller. Never persisted.
#[derive(Debug, Clone)]
pub struct Decision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Credit left after a successful admission, or credit available before
    /// the rejected request.
    pub remaining: u64,
    /// When the current window/credit resets, in monotonic milliseconds.
    pub reset_at_ms: u64,
    /// How long to wait before retrying a rejected request.
    pub retry_after_ms: Option<u64>,
    /// Strategy applied to this decision. `None` until the manager
    /// dispatches; the leaky bucket sets `Delay` on successful admissions.
    pub strategy: Option<Strategy>,
    /// Advisory delay for `delay`-strategy admissions.
    pub estimated_delay_ms: Option<u64>,
    /// Estimated position in the admission queue for `queue` dispatches.
    pub queue_position: Option<usize>,
    /// Ids of every rule that throttled this request.
    pub throttled_by: Vec<String>,
}

impl Decision {
    /// An unconditional allow with unlimited remaining credit, used when no
    /// rule matched the request.
    pub fn allow_unlimited(now_ms: u64) -> Self {
        Self {
            allowed: true,
            remaining: u64::MAX,
            reset_at_ms: now_ms,
            retry_after_ms: None,
            strategy: None,
            estimated_delay_ms: None,
            queue_position: None,
            throttled_by: Vec::new(),
        }
    }

    fn allow(remaining: u64, reset_at_ms: u64) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_at_ms,
            retry_after_ms: None,
            strategy: None,
            estimated_delay_ms: None,
            queue_position: None,
            throttled_by: Vec::new(),
        }
    }

    fn deny(remaining: u64, reset_at_ms: u64, retry_after_ms: u64) -> Self {
        Self {
            allowed: false,
            remaining,
            reset_at_ms,
            retry_after_ms: Some(retry_after_ms),
            strategy: None,
            estimated_delay_ms: None,
            queue_position: None,
            throttled_by: Vec::new(),
        }
    }
}

/// Mutable rate limiter state for one (rule id, scope key) pair.
///
/// Created lazily on the first matching request, reset when the owning
/// rule's limits change, and discarded only on explicit rule removal or a
/// manager-wide clear. Idle keys are never expired.
#[derive(Debug)]
pub struct Limiter {
    algorithm: Algorithm,
    limits: RuleLimits,
    /// Token-bucket credit.
    tokens: u64,
    /// Last refill (token bucket) or leak (leaky bucket) timestamp.
    last_refill_ms: u64,
    /// Start of the current counting window (fixed/sliding window).
    window_start_ms: u64,
    /// Requests counted in the current window.
    count: u64,
    /// Leaky-bucket fill level.
    level: f64,
    /// Whether the last evaluation throttled.
    throttled: bool,
    /// When the throttle lifts, if currently throttled.
    throttled_until_ms: Option<u64>,
}

impl Limiter {
    /// Create a limiter with full credit as of `now_ms`.
    pub fn new(algorithm: Algorithm, limits: RuleLimits, now_ms: u64) -> Self {
        let mut limiter = Self {
            algorithm,
            limits,
            tokens: 0,
            last_refill_ms: now_ms,
            window_start_ms: now_ms,
            count: 0,
            level: 0.0,
            throttled: false,
            throttled_until_ms: None,
        };
        limiter.reset(now_ms);
        limiter
    }

    /// Reinitialize to full credit and an empty window. Used after a rule's
    /// limits are edited.
    pub fn reset(&mut self, now_ms: u64) {
        self.tokens = self.limits.capacity();
        self.last_refill_ms = now_ms;
        self.count = 0;
        self.level = 0.0;
        self.throttled = false;
        self.throttled_until_ms = None;
        self.window_start_ms = match self.algorithm {
            // Fixed windows are aligned to absolute window boundaries.
            Algorithm::FixedWindow if self.limits.window_ms > 0 => {
                (now_ms / self.limits.window_ms) * self.limits.window_ms
            }
            _ => now_ms,
        };
    }

    /// Replace the algorithm and limits and reset. The manager calls this on
    /// rule updates and adaptive rescales so in-flight keys keep their
    /// identity.
    pub fn reconfigure(&mut self, algorithm: Algorithm, limits: RuleLimits, now_ms: u64) {
        self.algorithm = algorithm;
        self.limits = limits;
        self.reset(now_ms);
    }

    /// Evaluate a request for `requested` tokens at `now_ms`.
    pub fn check(&mut self, now_ms: u64, requested: u64) -> Decision {
        let decision = match self.algorithm {
            Algorithm::TokenBucket | Algorithm::Adaptive => {
                self.check_token_bucket(now_ms, requested)
            }
            Algorithm::FixedWindow => self.check_fixed_window(now_ms, requested),
            Algorithm::SlidingWindow => self.check_sliding_window(now_ms, requested),
            Algorithm::LeakyBucket => self.check_leaky_bucket(now_ms, requested),
        };

        self.throttled = !decision.allowed;
        self.throttled_until_ms = if decision.allowed {
            None
        } else {
            decision.retry_after_ms.map(|r| now_ms + r)
        };

        trace!(
            algorithm = ?self.algorithm,
            requested = requested,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "Limiter evaluated"
        );

        decision
    }

    fn check_token_bucket(&mut self, now_ms: u64, requested: u64) -> Decision {
        let capacity = self.limits.capacity();
        let requests = self.limits.requests;
        let window = self.limits.window_ms;

        // Integer refill: floor(elapsed / window * requests). The timestamp
        // only advances when at least one whole token accrues, so fractional
        // progress is not lost to frequent checks.
        if window > 0 && requests > 0 {
            let elapsed = now_ms.saturating_sub(self.last_refill_ms);
            let refill = elapsed.saturating_mul(requests) / window;
            if refill > 0 {
                self.tokens = (self.tokens + refill).min(capacity);
                self.last_refill_ms = now_ms;
            }
        }

        // Time until the bucket is full again.
        let reset_at_ms = if requests > 0 && self.tokens < capacity {
            now_ms + div_ceil((capacity - self.tokens) * window, requests)
        } else {
            now_ms
        };

        if self.tokens >= requested {
            self.tokens -= requested;
            Decision::allow(self.tokens, reset_at_ms)
        } else {
            let deficit = requested - self.tokens;
            let retry_after = if requests > 0 {
                div_ceil(deficit * window, requests)
            } else {
                window
            };
            Decision::deny(self.tokens, reset_at_ms, retry_after)
        }
    }

    fn check_fixed_window(&mut self, now_ms: u64, requested: u64) -> Decision {
        let requests = self.limits.requests;
        let window = self.limits.window_ms.max(1);

        let index = now_ms / window;
        if index * window > self.window_start_ms {
            self.count = 0;
            self.window_start_ms = index * window;
        }
        let reset_at_ms = (index + 1) * window;

        if self.count + requested <= requests {
            self.count += requested;
            Decision::allow(requests - self.count, reset_at_ms)
        } else {
            Decision::deny(
                requests.saturating_sub(self.count),
                reset_at_ms,
                reset_at_ms.saturating_sub(now_ms),
            )
        }
    }

    // Coarse rolling counter: the window is measured from the last reset
    // instant, not from absolute boundaries. This approximates a sliding
    // window and is kept deliberately; an exact per-timestamp log would
    // admit differently under bursts.
    fn check_sliding_window(&mut self, now_ms: u64, requested: u64) -> Decision {
        let requests = self.limits.requests;
        let window = self.limits.window_ms;

        if now_ms.saturating_sub(self.window_start_ms) >= window {
            self.count = 0;
            self.window_start_ms = now_ms;
        }
        let reset_at_ms = self.window_start_ms + window;

        if self.count + requested <= requests {
            self.count += requested;
            Decision::allow(requests - self.count, reset_at_ms)
        } else {
            Decision::deny(
                requests.saturating_sub(self.count),
                reset_at_ms,
                reset_at_ms.saturating_sub(now_ms),
            )
        }
    }

    fn check_leaky_bucket(&mut self, now_ms: u64, requested: u64) -> Decision {
        let requests = self.limits.requests as f64;
        let window = self.limits.window_ms.max(1) as f64;

        // The bucket leaks at requests/window per millisecond.
        let elapsed = now_ms.saturating_sub(self.last_refill_ms) as f64;
        self.level = (self.level - elapsed * requests / window).max(0.0);
        self.last_refill_ms = now_ms;

        if self.level + requested as f64 <= requests {
            self.level += requested as f64;
            // The admitted request contributes to its own smoothing delay.
            let delay = (self.level * window / requests).round() as u64;
            let mut decision =
                Decision::allow((requests - self.level).floor() as u64, now_ms + delay);
            decision.strategy = Some(Strategy::Delay);
            decision.estimated_delay_ms = Some(delay);
            decision
        } else {
            let overflow = self.level + requested as f64 - requests;
            let retry_after = (overflow * window / requests).ceil() as u64;
            Decision::deny(
                (requests - self.level).floor() as u64,
                now_ms + retry_after,
                retry_after,
            )
        }
    }

    /// Current leaky-bucket fill level.
    pub fn level(&self) -> f64 {
        self.level
    }

    /// Current token-bucket credit.
    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    /// Whether the last evaluation throttled.
    pub fn is_throttled(&self) -> bool {
        self.throttled
    }

    /// When the current throttle lifts, if throttled.
    pub fn throttled_until_ms(&self) -> Option<u64> {
        self.throttled_until_ms
    }
}

fn div_ceil(numerator: u64, denominator: u64) -> u64 {
    if denominator == 0 {
        return 0;
    }
    (numerator + denominator - 1) / denominator
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(requests: u64, window_ms: u64) -> RuleLimits {
        RuleLimits {
            requests,
            window_ms,
            burst: None,
        }
    }

    #[test]
    fn test_token_bucket_admits_until_empty() {
        // 5 per second; 5 quick requests pass, the 6th is rejected with
        // retry_after of one token's worth of refill (1000 / 5 = 200ms).
        let mut limiter = Limiter::new(Algorithm::TokenBucket, limits(5, 1000), 0);

        for i in 0..5 {
            let decision = limiter.check(i * 2, 1);
            assert!(decision.allowed, "request {} should be admitted", i);
        }

        let decision = limiter.check(10, 1);
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.retry_after_ms, Some(200));
    }

    #[test]
    fn test_token_bucket_conservation() {
        // Credit never exceeds capacity and never goes negative.
        let mut limiter = Limiter::new(
            Algorithm::TokenBucket,
            RuleLimits {
                requests: 10,
                window_ms: 1000,
                burst: Some(15),
            },
            0,
        );

        assert_eq!(limiter.tokens(), 15);

        // Long idle must not overfill.
        limiter.check(100_000, 0);
        assert_eq!(limiter.tokens(), 15);

        let mut admitted = 0u64;
        for i in 0..40 {
            if limiter.check(100_000 + i, 1).allowed {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 15);
        assert_eq!(limiter.tokens(), 0);
    }

    #[test]
    fn test_token_bucket_refills_over_time() {
        let mut limiter = Limiter::new(Algorithm::TokenBucket, limits(10, 1000), 0);
        for _ in 0..10 {
            assert!(limiter.check(0, 1).allowed);
        }
        assert!(!limiter.check(0, 1).allowed);

        // 500ms later, half the budget is back.
        let decision = limiter.check(500, 5);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(!limiter.check(500, 1).allowed);
    }

    #[test]
    fn test_token_bucket_multi_token_retry_after() {
        let mut limiter = Limiter::new(Algorithm::TokenBucket, limits(10, 1000), 0);
        assert!(limiter.check(0, 10).allowed);

        // Asking for 4 with 0 available: 4 tokens at 100ms each.
        let decision = limiter.check(0, 4);
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_ms, Some(400));
    }

    #[test]
    fn test_fixed_window_independent_budgets() {
        // Full budget, advance exactly one window, full budget again.
        let mut limiter = Limiter::new(Algorithm::FixedWindow, limits(5, 1000), 0);

        let decision = limiter.check(10, 5);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(!limiter.check(20, 1).allowed);

        let decision = limiter.check(1010, 5);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[test]
    fn test_fixed_window_reset_time_is_boundary() {
        let mut limiter = Limiter::new(Algorithm::FixedWindow, limits(5, 1000), 0);
        let decision = limiter.check(2300, 1);
        assert!(decision.allowed);
        assert_eq!(decision.reset_at_ms, 3000);

        for _ in 0..4 {
            limiter.check(2300, 1);
        }
        let decision = limiter.check(2400, 1);
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_ms, Some(600));
    }

    #[test]
    fn test_sliding_window_rolls_from_last_reset() {
        let mut limiter = Limiter::new(Algorithm::SlidingWindow, limits(3, 1000), 0);

        // First request at t=500 starts the counting interval at t=0 (the
        // limiter's creation instant), so the reset lands at t=1000.
        assert!(limiter.check(500, 3).allowed);
        assert!(!limiter.check(900, 1).allowed);

        // Window expires 1000ms after the last reset instant, not at a
        // calendar boundary.
        let decision = limiter.check(1100, 1);
        assert!(decision.allowed);
        assert_eq!(decision.reset_at_ms, 2100);
    }

    #[test]
    fn test_leaky_bucket_admission_reports_delay() {
        let mut limiter = Limiter::new(Algorithm::LeakyBucket, limits(10, 1000), 0);

        let decision = limiter.check(0, 1);
        assert!(decision.allowed);
        assert_eq!(decision.strategy, Some(Strategy::Delay));
        // One token at 10/sec drain: 100ms of smoothing.
        assert_eq!(decision.estimated_delay_ms, Some(100));

        let decision = limiter.check(0, 4);
        assert!(decision.allowed);
        assert_eq!(decision.estimated_delay_ms, Some(500));
    }

    #[test]
    fn test_leaky_bucket_rejects_on_overflow() {
        let mut limiter = Limiter::new(Algorithm::LeakyBucket, limits(10, 1000), 0);
        assert!(limiter.check(0, 10).allowed);

        let decision = limiter.check(0, 1);
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_ms, Some(100));
    }

    #[test]
    fn test_leaky_bucket_monotonic_drain() {
        let mut limiter = Limiter::new(Algorithm::LeakyBucket, limits(10, 1000), 0);
        assert!(limiter.check(0, 10).allowed);

        // With no further load, zero-token observations show a
        // non-increasing level that reaches 0 after a full window idle.
        let mut previous = limiter.level();
        for t in [100u64, 250, 400, 700, 999] {
            limiter.check(t, 0);
            assert!(limiter.level() <= previous);
            previous = limiter.level();
        }

        limiter.check(1100, 0);
        assert_eq!(limiter.level(), 0.0);
    }

    #[test]
    fn test_reset_restores_full_credit() {
        let mut limiter = Limiter::new(Algorithm::TokenBucket, limits(5, 1000), 0);
        for _ in 0..5 {
            limiter.check(0, 1);
        }
        assert!(!limiter.check(0, 1).allowed);
        assert!(limiter.is_throttled());

        limiter.reset(0);
        assert!(!limiter.is_throttled());
        assert!(limiter.check(0, 5).allowed);
    }

    #[test]
    fn test_throttled_until_tracks_retry() {
        let mut limiter = Limiter::new(Algorithm::TokenBucket, limits(5, 1000), 0);
        limiter.check(0, 5);
        assert!(limiter.throttled_until_ms().is_none());

        limiter.check(0, 1);
        assert_eq!(limiter.throttled_until_ms(), Some(200));
    }

    #[test]
    fn test_reconfigure_resets_state() {
        let mut limiter = Limiter::new(Algorithm::TokenBucket, limits(5, 1000), 0);
        limiter.check(0, 5);

        limiter.reconfigure(Algorithm::TokenBucket, limits(20, 1000), 0);
        assert_eq!(limiter.tokens(), 20);
        assert!(limiter.check(0, 20).allowed);
    }

    #[test]
    fn test_reconfigure_switches_algorithm() {
        let mut limiter = Limiter::new(Algorithm::TokenBucket, limits(5, 1000), 0);
        limiter.check(0, 5);

        limiter.reconfigure(Algorithm::FixedWindow, limits(5, 1000), 0);
        for _ in 0..5 {
            assert!(limiter.check(0, 1).allowed);
        }
        // A token bucket would have refilled 2 tokens by now; a fixed window
        // stays spent until the 1000ms boundary.
        let decision = limiter.check(500, 1);
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_ms, Some(500));
        assert!(limiter.check(1000, 1).allowed);
    }

    #[test]
    fn test_adaptive_uses_token_bucket_arithmetic() {
        let mut limiter = Limiter::new(Algorithm::Adaptive, limits(5, 1000), 0);
        for _ in 0..5 {
            assert!(limiter.check(0, 1).allowed);
        }
        let decision = limiter.check(0, 1);
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_ms, Some(200));
    }
}
