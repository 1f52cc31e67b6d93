//! Per-identity token bucket state.

use serde::{Deserialize, Serialize};

use super::LimiterConfig;

/// Durable bucket snapshot. All timestamps are unix milliseconds so the
/// state survives a process restart unchanged.
///
/// Invariant: `0 <= tokens <= max_tokens`; tokens only grow by
/// time-proportional refill and shrink by exactly one per granted request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketState {
    pub tokens: f64,
    pub last_refill_ms: i64,
    /// Open backoff window, if any.
    pub backoff_until_ms: Option<i64>,
    /// Length of the most recent backoff window, for exponential doubling.
    pub last_backoff_ms: Option<i64>,
}

impl BucketState {
    /// A freshly created bucket starts full.
    pub fn full(cfg: &LimiterConfig, now_ms: i64) -> Self {
        Self {
            tokens: cfg.max_tokens,
            last_refill_ms: now_ms,
            backoff_until_ms: None,
            last_backoff_ms: None,
        }
    }

    /// Continuous refill: `tokens = min(max, tokens + elapsed * rate)`.
    pub fn refill(&mut self, now_ms: i64, cfg: &LimiterConfig) {
        let elapsed_ms = now_ms.saturating_sub(self.last_refill_ms);
        if elapsed_ms <= 0 {
            return;
        }
        let gained = (elapsed_ms as f64 / 1000.0) * cfg.refill_rate;
        self.tokens = (self.tokens + gained).min(cfg.max_tokens).max(0.0);
        self.last_refill_ms = now_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> LimiterConfig {
        LimiterConfig {
            max_tokens: 10.0,
            refill_rate: 2.0,
            ..LimiterConfig::default()
        }
    }

    #[test]
    fn refill_is_time_proportional_and_capped() {
        let cfg = cfg();
        let mut b = BucketState::full(&cfg, 0);
        b.tokens = 1.0;

        // 500ms at 2 tokens/s adds exactly one token.
        b.refill(500, &cfg);
        assert!((b.tokens - 2.0).abs() < 1e-9);

        // A long gap caps at max_tokens.
        b.refill(60_000, &cfg);
        assert!((b.tokens - 10.0).abs() < 1e-9);
    }

    #[test]
    fn refill_ignores_non_positive_elapsed() {
        let cfg = cfg();
        let mut b = BucketState::full(&cfg, 1_000);
        b.tokens = 3.0;
        b.refill(1_000, &cfg);
        assert!((b.tokens - 3.0).abs() < 1e-9);
        // Clock skew backwards must not drain or refill.
        b.refill(500, &cfg);
        assert!((b.tokens - 3.0).abs() < 1e-9);
        assert_eq!(b.last_refill_ms, 1_000);
    }
}
