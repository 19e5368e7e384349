// ── factgraph Engine: HTTP Retry & Circuit-Breaker ─────────────────────────
//
// Shared outbound-HTTP plumbing for the chat and embedding clients.
//
//   • Exponential backoff with ±25% jitter (base 1s, max 30s, 3 retries)
//   • Retry on 429 (rate limit), 500, 502, 503, 504, 529
//   • Respects `Retry-After` header
//   • Circuit breaker: N consecutive failures → fail fast for a cooldown

use crate::atoms::error::{EngineError, EngineResult};
use log::warn;
use reqwest::{Client, RequestBuilder, Response};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

// ── Constants ──────────────────────────────────────────────────────────────

/// Default maximum number of retry attempts per request.
pub const MAX_RETRIES: u32 = 3;

/// Initial retry delay in milliseconds (doubles each attempt).
const INITIAL_RETRY_DELAY_MS: u64 = 1_000;

/// Maximum retry delay cap in milliseconds.
const MAX_RETRY_DELAY_MS: u64 = 30_000;

const CONNECT_TIMEOUT_SECS: u64 = 10;

// ── Client factory ─────────────────────────────────────────────────────────

/// Build a rustls-backed client with connect and whole-request timeouts.
pub fn build_client(timeout_secs: u64) -> EngineResult<Client> {
    Ok(Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .build()?)
}

// ── Retryable status detection ─────────────────────────────────────────────

/// Check if an HTTP status code represents a transient/retryable error.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504 | 529)
}

// ── Backoff delay ──────────────────────────────────────────────────────────

/// Backoff for `attempt` (0-based), honouring a server `Retry-After` if given.
pub fn backoff_delay(attempt: u32, retry_after_secs: Option<u64>) -> Duration {
    let base_ms = INITIAL_RETRY_DELAY_MS.saturating_mul(2u64.saturating_pow(attempt));
    let capped_ms = base_ms.min(MAX_RETRY_DELAY_MS);
    let delay_ms = match retry_after_secs {
        // Server-specified delay, capped at 60s and floored at our backoff.
        Some(secs) => (secs.min(60) * 1000).max(capped_ms),
        None => capped_ms,
    };
    Duration::from_millis(apply_jitter(delay_ms))
}

/// Sleep for the backoff delay. Returns the slept duration for logging.
pub async fn retry_delay(attempt: u32, retry_after_secs: Option<u64>) -> Duration {
    let delay = backoff_delay(attempt, retry_after_secs);
    tokio::time::sleep(delay).await;
    delay
}

/// Apply ±25% jitter to prevent thundering-herd effects.
pub(crate) fn apply_jitter(base_ms: u64) -> u64 {
    jitter_with(base_ms, rand_jitter())
}

/// Scale `sample` (0..JITTER_RESOLUTION) onto the full ±25% band.
fn jitter_with(base_ms: u64, sample: i64) -> u64 {
    let jitter_range = (base_ms / 4) as i64;
    if jitter_range == 0 {
        return base_ms.max(100);
    }
    let sample = sample.clamp(0, JITTER_RESOLUTION - 1);
    let offset = sample * (2 * jitter_range + 1) / JITTER_RESOLUTION - jitter_range;
    let result = base_ms as i64 + offset;
    result.max(100) as u64
}

const JITTER_RESOLUTION: i64 = 1000;

/// Jitter source from system clock nanos, in 0..JITTER_RESOLUTION.
fn rand_jitter() -> i64 {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos as i64) % JITTER_RESOLUTION
}

// ── Retry-After header parsing ─────────────────────────────────────────────

/// Parse Retry-After header value (integer seconds only).
/// HTTP-date format falls back to computed backoff.
pub fn parse_retry_after(header_value: &str) -> Option<u64> {
    header_value.trim().parse::<u64>().ok()
}

fn retry_after_of(resp: &Response) -> Option<u64> {
    resp.headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after)
}

// ── Circuit Breaker ────────────────────────────────────────────────────────

/// Trips after N consecutive failures, then rejects requests for a cooldown
/// period before letting a probe through.
///
///   Closed   normal operation, requests pass through
///   Open     rejecting requests (cooldown active)
///   HalfOpen cooldown expired, one probe request allowed
pub struct CircuitBreaker {
    consecutive_failures: AtomicU32,
    /// Epoch secs when the circuit was tripped open.
    tripped_at: AtomicU64,
    threshold: u32,
    cooldown_secs: u64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl CircuitBreaker {
    pub const fn new(threshold: u32, cooldown_secs: u64) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            tripped_at: AtomicU64::new(0),
            threshold,
            cooldown_secs,
        }
    }

    /// `Ok(())` if a request may go out, `Err` while the circuit is open.
    pub fn check(&self, provider: &str) -> EngineResult<()> {
        let failures = self.consecutive_failures.load(Ordering::Relaxed);
        if failures < self.threshold {
            return Ok(());
        }
        let elapsed = now_secs().saturating_sub(self.tripped_at.load(Ordering::Relaxed));
        if elapsed < self.cooldown_secs {
            Err(EngineError::provider(
                provider,
                format!(
                    "circuit open after {} consecutive failures, cooling down for {}s",
                    failures,
                    self.cooldown_secs - elapsed
                ),
            ))
        } else {
            Ok(())
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.tripped_at.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        let prev = self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        if prev + 1 >= self.threshold {
            self.tripped_at.store(now_secs(), Ordering::Relaxed);
            warn!(
                "[circuit-breaker] Tripped after {} consecutive failures, cooling down {}s",
                prev + 1,
                self.cooldown_secs
            );
        }
    }
}

// ── Send with retry ────────────────────────────────────────────────────────

/// Send a request built by `build`, retrying transient failures.
///
/// Returns the first successful response. Non-retryable HTTP statuses come
/// back as `EngineError::Provider` carrying the status and a body excerpt.
pub async fn send_with_retry<F>(
    provider: &str,
    breaker: &CircuitBreaker,
    build: F,
) -> EngineResult<Response>
where
    F: Fn() -> RequestBuilder,
{
    breaker.check(provider)?;

    let mut last_error: Option<EngineError> = None;
    let mut retry_after: Option<u64> = None;
    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            let delay = retry_delay(attempt - 1, retry_after.take()).await;
            warn!("[{}] Retry {}/{} after {:?}", provider, attempt, MAX_RETRIES, delay);
        }

        let resp = match build().send().await {
            Ok(r) => r,
            Err(e) => {
                breaker.record_failure();
                warn!("[{}] Request failed: {}", provider, e);
                last_error = Some(EngineError::Network(e));
                continue;
            }
        };

        if resp.status().is_success() {
            breaker.record_success();
            return Ok(resp);
        }

        let status = resp.status().as_u16();
        retry_after = retry_after_of(&resp);
        let body = resp.text().await.unwrap_or_default();
        let excerpt: String = body.chars().take(300).collect();
        let err = EngineError::provider(provider, format!("HTTP {status}: {excerpt}"));
        breaker.record_failure();

        if !is_retryable_status(status) {
            return Err(err);
        }
        last_error = Some(err);
    }

    Err(last_error.unwrap_or_else(|| EngineError::provider(provider, "retries exhausted")))
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses() {
        for s in [429, 500, 502, 503, 504, 529] {
            assert!(is_retryable_status(s));
        }
        for s in [200, 400, 401, 403, 404] {
            assert!(!is_retryable_status(s));
        }
    }

    #[test]
    fn parse_retry_after_valid() {
        assert_eq!(parse_retry_after("5"), Some(5));
        assert_eq!(parse_retry_after(" 30 "), Some(30));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn jitter_stays_in_range() {
        for base in [100, 1000, 5000, 30_000] {
            let result = apply_jitter(base);
            let lower = (base as f64 * 0.7) as u64;
            let upper = (base as f64 * 1.3) as u64;
            assert!(result >= lower.max(100) && result <= upper, "jitter({base}) = {result}");
        }
    }

    #[test]
    fn jitter_spans_both_sides_for_large_bases() {
        for base in [4_000u64, 30_000] {
            let quarter = base / 4;
            assert_eq!(jitter_with(base, 0), base - quarter);
            assert!(jitter_with(base, 999) >= base + quarter - quarter / 100);
            assert!(jitter_with(base, 999) <= base + quarter);
            let mid = jitter_with(base, 500);
            assert!(mid.abs_diff(base) <= quarter / 100 + 1, "jitter_with({base}, 500) = {mid}");
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert!(backoff_delay(0, None) <= Duration::from_millis(1_300));
        assert!(backoff_delay(3, None) >= Duration::from_millis(6_000));
        assert!(backoff_delay(20, None) <= Duration::from_millis(37_500));
        assert!(backoff_delay(0, Some(10)) >= Duration::from_millis(7_500));
    }

    #[test]
    fn circuit_breaker_trips_and_recovers() {
        let cb = CircuitBreaker::new(3, 60);
        assert!(cb.check("test").is_ok());
        cb.record_failure();
        cb.record_failure();
        assert!(cb.check("test").is_ok());

        cb.record_failure();
        let err = cb.check("test").unwrap_err();
        assert!(matches!(err, EngineError::Provider { .. }));

        cb.record_success();
        assert!(cb.check("test").is_ok());
    }

    #[test]
    fn circuit_breaker_half_opens_after_cooldown() {
        let cb = CircuitBreaker::new(1, 0);
        cb.record_failure();
        assert!(cb.check("test").is_ok());
    }
}
