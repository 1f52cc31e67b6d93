//! Backoff window computation for server throttling signals.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use super::LimiterConfig;

/// Compute the next backoff window.
///
/// A parseable positive hint (seconds, or an absolute RFC 2822 / RFC 3339
/// time) wins. Otherwise the previous window doubles (or the configured
/// initial window starts one), jittered by a factor in [0.8, 1.2]. Either
/// way the result is capped at `max_backoff`.
pub fn backoff_delay(
    hint: Option<&str>,
    previous: Option<Duration>,
    cfg: &LimiterConfig,
    now_ms: i64,
) -> Duration {
    if let Some(delay) = hint.and_then(|h| parse_retry_after(h, now_ms)) {
        return delay.min(cfg.max_backoff);
    }

    let base = match previous {
        Some(prev) if prev > Duration::ZERO => prev.saturating_mul(2),
        _ => cfg.initial_backoff,
    };
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    base.mul_f64(jitter).min(cfg.max_backoff)
}

/// Parse a `Retry-After` style hint: plain seconds first, then an absolute
/// HTTP date or RFC 3339 timestamp relative to `now_ms`. Returns `None`
/// for anything non-positive or unparseable.
pub fn parse_retry_after(hint: &str, now_ms: i64) -> Option<Duration> {
    let hint = hint.trim();
    if hint.is_empty() {
        return None;
    }

    if let Ok(secs) = hint.parse::<f64>() {
        if secs > 0.0 && secs.is_finite() {
            return Some(Duration::from_millis((secs * 1000.0) as u64));
        }
        return None;
    }

    let absolute = DateTime::parse_from_rfc2822(hint)
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(hint).ok())?;
    let target_ms = absolute.with_timezone(&Utc).timestamp_millis();
    let delta = target_ms.saturating_sub(now_ms);
    if delta > 0 {
        Some(Duration::from_millis(delta as u64))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_seconds() {
        assert_eq!(parse_retry_after("2", 0), Some(Duration::from_secs(2)));
        assert_eq!(
            parse_retry_after(" 1.5 ", 0),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(parse_retry_after("0", 0), None);
        assert_eq!(parse_retry_after("-3", 0), None);
        assert_eq!(parse_retry_after("soon", 0), None);
    }

    #[test]
    fn parses_absolute_times() {
        // 10s after the reference instant.
        let now_ms = 1_445_412_480_000i64;
        let d = parse_retry_after("Wed, 21 Oct 2015 07:28:10 GMT", now_ms).unwrap();
        assert_eq!(d, Duration::from_secs(10));

        // A date in the past yields no delay.
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:27:00 GMT", now_ms),
            None
        );
    }

    #[test]
    fn doubles_previous_window_with_jitter_and_cap() {
        let cfg = LimiterConfig {
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            ..LimiterConfig::default()
        };

        let first = backoff_delay(None, None, &cfg, 0);
        assert!(first >= Duration::from_secs(4));
        assert!(first <= Duration::from_secs(6));

        let doubled = backoff_delay(None, Some(Duration::from_secs(10)), &cfg, 0);
        assert!(doubled >= Duration::from_secs(16));
        assert!(doubled <= Duration::from_secs(24));

        let capped = backoff_delay(None, Some(Duration::from_secs(500)), &cfg, 0);
        assert_eq!(capped, Duration::from_secs(60));
    }

    #[test]
    fn hint_wins_over_doubling() {
        let cfg = LimiterConfig::default();
        let d = backoff_delay(Some("7"), Some(Duration::from_secs(100)), &cfg, 0);
        assert_eq!(d, Duration::from_secs(7));
    }
}
