//! Retry-with-backoff and Retry-Fetch
//!
//! A "created" event can arrive before the new row is readable on the server
//! that emitted it. [`fetch_with_retry`] polls the store a bounded number of
//! times and reports a typed [`FetchError::NotYetVisible`] when the entity
//! never shows up, which callers must not confuse with a deletion.
//!
//! **Backoff Strategy:**
//! - Initial delay: `interval` (default 1s)
//! - Multiplier: `multiplier` (default 1.0, i.e. fixed spacing)
//! - Delay capped at `max_interval`

use crate::config::RetrySettings;
use crate::query::Query;
use crate::store::{Record, RemoteStore};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Bounded polling parameters
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            interval: Duration::from_millis(settings.interval_ms),
            multiplier: if settings.multiplier >= 1.0 { settings.multiplier } else { 1.0 },
            max_interval: Duration::from_millis(settings.max_interval_ms),
        }
    }
}

impl RetryPolicy {
    /// Fixed-interval policy
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
            multiplier: 1.0,
            max_interval: interval,
        }
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let cap = self.max_interval.max(self.interval);
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.interval.as_secs_f64() * self.multiplier.powi(exponent);
        // Overflow and infinity both land on the cap
        Duration::try_from_secs_f64(secs).map_or(cap, |delay| delay.min(cap))
    }
}

/// Why a bounded fetch gave up
#[derive(Debug, Error)]
pub enum FetchError {
    /// Every attempt answered cleanly but the entity never appeared
    #[error("{what} not yet visible after {attempts} attempts")]
    NotYetVisible { what: String, attempts: u32 },

    /// The final attempt failed with a store error
    #[error("{what} could not be fetched after {attempts} attempts: {source}")]
    Store {
        what: String,
        attempts: u32,
        #[source]
        source: crate::Error,
    },
}

impl FetchError {
    pub fn is_not_yet_visible(&self) -> bool {
        matches!(self, FetchError::NotYetVisible { .. })
    }
}

/// Poll `operation` until it yields `Some`, at most `policy.max_attempts` times
///
/// Store errors count as attempts and are logged at warn. The outcome of the
/// last attempt decides the error kind when nothing was found.
pub async fn retry_until_found<F, Fut, T>(
    what: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = crate::Result<Option<T>>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        let last_error = match operation().await {
            Ok(Some(found)) => {
                if attempt > 1 {
                    tracing::debug!(what, attempt, "Entity became visible after retry");
                }
                return Ok(found);
            }
            Ok(None) => {
                tracing::debug!(what, attempt, max_attempts = policy.max_attempts, "Entity not visible yet");
                None
            }
            Err(err) => {
                tracing::warn!(what, attempt, error = %err, "Fetch attempt failed");
                Some(err)
            }
        };

        if attempt >= policy.max_attempts {
            return Err(match last_error {
                Some(source) => FetchError::Store {
                    what: what.to_string(),
                    attempts: attempt,
                    source,
                },
                None => FetchError::NotYetVisible {
                    what: what.to_string(),
                    attempts: attempt,
                },
            });
        }

        tokio::time::sleep(policy.delay_after(attempt)).await;
    }
}

/// Fetch an entity by id, waiting out write-visibility lag
pub async fn fetch_with_retry(
    store: &dyn RemoteStore,
    entity_type: &str,
    id: &str,
    projections: &[&str],
    policy: &RetryPolicy,
) -> Result<Record, FetchError> {
    let what = format!("{} {} on {}", entity_type, id, store.server_name());
    retry_until_found(&what, policy, || store.get(entity_type, id, projections)).await
}

/// Run a query until it returns at least one record
pub async fn fetch_query_with_retry(
    store: &dyn RemoteStore,
    query: &Query,
    policy: &RetryPolicy,
) -> Result<Record, FetchError> {
    let what = format!("{} on {}", query.render(), store.server_name());
    retry_until_found(&what, policy, || store.query_first(query)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy::fixed(attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_found_on_first_attempt() {
        let calls = AtomicU32::new(0);
        let result = retry_until_found("x", &fast(5), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(Some(42)) }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_found_on_third_attempt() {
        let calls = AtomicU32::new(0);
        let result = retry_until_found("x", &fast(5), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok(if n == 3 { Some("record") } else { None }) }
        })
        .await;

        assert_eq!(result.unwrap(), "record");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_never_found_is_not_yet_visible() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_until_found("x", &fast(4), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(None) }
        })
        .await;

        let err = result.unwrap_err();
        assert!(err.is_not_yet_visible());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_store_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result = retry_until_found("x", &fast(5), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(Error::Query("temporarily unavailable".into()))
                } else {
                    Ok(Some(n))
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_last_store_error_is_reported() {
        let result: Result<(), _> = retry_until_found("x", &fast(2), || async {
            Err(Error::Query("down".into()))
        })
        .await;

        assert!(matches!(result, Err(FetchError::Store { attempts: 2, .. })));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            interval: Duration::from_millis(100),
            multiplier: 2.0,
            max_interval: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
        assert_eq!(policy.delay_after(4), Duration::from_millis(500));
    }

    #[test]
    fn test_steep_backoff_stays_at_cap() {
        let policy = RetryPolicy::from(&RetrySettings {
            max_attempts: 30,
            interval_ms: 1000,
            multiplier: 10.0,
            max_interval_ms: 10_000,
        });
        for attempt in 1..=30 {
            assert!(policy.delay_after(attempt) <= Duration::from_secs(10));
        }
        assert_eq!(policy.delay_after(30), Duration::from_secs(10));
        assert_eq!(policy.delay_after(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_policy_from_settings_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.interval, Duration::from_secs(1));
        assert_eq!(policy.delay_after(3), Duration::from_secs(1));
    }
}
