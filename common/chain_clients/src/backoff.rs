//! Exponential backoff with full jitter for requests to chain data providers.
//!
//! Connection failures and rate limiting (HTTP 429) are retried for the longest period since they
//! are expected when backfilling against hosted archive nodes. Any other non-OK status is retried
//! for a shorter, per-method period. A 404 is never retried: it is handed back to the caller which
//! treats it as a terminal "not found".

use crate::{metrics, Error};
use log::{debug, warn};
use rand::Rng;
use reqwest::{header::RETRY_AFTER, RequestBuilder, Response, StatusCode};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total time spent retrying connection failures and rate-limit responses.
    pub transient_budget: Duration,
    /// Total time spent retrying other non-OK responses.
    pub status_budget: Duration,
    /// Delay ceiling of the first retry. Doubles with each attempt.
    pub base_delay: Duration,
    /// Upper bound on a single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const fn get() -> Self {
        Self {
            transient_budget: Duration::from_secs(300),
            status_budget: Duration::from_secs(30),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }

    pub const fn post() -> Self {
        Self {
            transient_budget: Duration::from_secs(300),
            status_budget: Duration::from_secs(300),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }

    /// A policy which never retries. Useful for tests and one-shot CLI commands.
    pub const fn none() -> Self {
        Self {
            transient_budget: Duration::ZERO,
            status_budget: Duration::ZERO,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Full jitter: a uniformly random delay between zero and the exponential ceiling.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let ceiling = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
            .min(self.max_delay);
        let ceiling_ms = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
        if ceiling_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling_ms))
    }
}

enum Outcome {
    Done(Response),
    Transient(Error, Option<Duration>),
    Status(StatusCode),
}

/// Sends `request`, retrying according to `policy`.
///
/// Returns the response for `200 OK` and `404 Not Found`. Every other outcome is retried until
/// the relevant budget is exhausted, at which point the last error is returned.
pub async fn send_with_backoff(
    request: RequestBuilder,
    policy: &RetryPolicy,
    client_label: &str,
) -> Result<Response, Error> {
    let start = Instant::now();
    let mut attempt = 0;

    loop {
        let attempt_request = request.try_clone().ok_or(Error::RequestNotCloneable)?;

        let outcome = match attempt_request.send().await {
            Ok(response) => match response.status() {
                StatusCode::OK | StatusCode::NOT_FOUND => Outcome::Done(response),
                StatusCode::TOO_MANY_REQUESTS => {
                    let retry_after = retry_after(&response);
                    warn!(
                        "Rate limited by {} provider, retry-after: {:?}",
                        client_label, retry_after
                    );
                    Outcome::Transient(Error::RateLimited, retry_after)
                }
                status => {
                    let body = response.text().await.unwrap_or_default();
                    warn!(
                        "Non-200 status code from {} provider, status: {}, response: {}",
                        client_label, status, body
                    );
                    Outcome::Status(status)
                }
            },
            Err(e) if e.is_connect() || e.is_timeout() => {
                warn!("Unable to reach {} provider: {}", client_label, e);
                Outcome::Transient(Error::Unreachable(e), None)
            }
            Err(e) => return Err(Error::HttpClient(e)),
        };

        let elapsed = start.elapsed();
        let (error, budget, requested_delay) = match outcome {
            Outcome::Done(response) => return Ok(response),
            Outcome::Transient(error, retry_after) => {
                (error, policy.transient_budget, retry_after)
            }
            Outcome::Status(status) => (Error::StatusCode(status), policy.status_budget, None),
        };

        if elapsed >= budget {
            debug!(
                "Giving up on {} request after {} attempts in {:?}",
                client_label,
                attempt + 1,
                elapsed
            );
            return Err(error);
        }

        // A server-provided `retry-after` is honoured with an extra second of margin.
        let delay = requested_delay
            .map(|d| d + Duration::from_secs(1))
            .unwrap_or_else(|| policy.jittered_delay(attempt))
            .min(budget - elapsed);

        watch_metrics::inc_counter_vec(&metrics::CHAIN_CLIENT_RETRIES, &[client_label]);
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_is_bounded_by_exponential_ceiling() {
        let policy = RetryPolicy::get();
        for attempt in 0..10 {
            let ceiling = Duration::from_secs(1)
                .saturating_mul(2u32.pow(attempt))
                .min(policy.max_delay);
            for _ in 0..50 {
                assert!(policy.jittered_delay(attempt) <= ceiling);
            }
        }
    }

    #[test]
    fn no_retry_policy_never_sleeps() {
        assert_eq!(RetryPolicy::none().jittered_delay(5), Duration::ZERO);
    }

    #[test]
    fn post_retries_status_codes_longer_than_get() {
        assert!(RetryPolicy::post().status_budget > RetryPolicy::get().status_budget);
        assert_eq!(
            RetryPolicy::post().transient_budget,
            RetryPolicy::get().transient_budget
        );
    }
}
