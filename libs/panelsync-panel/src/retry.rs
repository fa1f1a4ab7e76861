use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::{PanelError, Result};

/// Bounded exponential backoff. Only transport failures and rate-limit
/// responses are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub factor: u32,
    /// Upper bound applied to server supplied `Retry-After` hints.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            factor: 2,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Delay before retry number `retry` (zero based): base * factor^retry.
    pub fn backoff(&self, retry: u32) -> Duration {
        let multiplier = self.factor.saturating_pow(retry);
        self.base_delay.saturating_mul(multiplier)
    }

    fn delay_for(&self, retry: u32, hint: Option<Duration>) -> Duration {
        match hint {
            Some(hint) => hint.min(self.max_delay),
            None => self.backoff(retry),
        }
    }
}

/// Result of a single attempt as seen by the retry loop.
#[derive(Debug)]
pub enum AttemptOutcome<T> {
    Finished(Result<T>),
    RateLimited { retry_after: Option<Duration> },
    TransportError(String),
}

/// Parses a `Retry-After` header: delta seconds (fractions allowed) or an
/// HTTP date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<f64>() {
        if secs.is_finite() && secs >= 0.0 {
            // Oversized hints saturate and are capped by the policy later.
            return Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX));
        }
        return None;
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    let wait = at.with_timezone(&Utc) - Utc::now();
    Some(wait.to_std().unwrap_or(Duration::ZERO))
}

/// Drives `attempt` until it finishes or the retry budget is spent.
///
/// `sleep` is injected so the schedule can be observed without waiting.
pub async fn run<T, A, AF, S, SF>(
    policy: &RetryPolicy,
    method: &str,
    path: &str,
    mut attempt: A,
    mut sleep: S,
) -> Result<T>
where
    A: FnMut(u32) -> AF,
    AF: Future<Output = AttemptOutcome<T>>,
    S: FnMut(Duration) -> SF,
    SF: Future<Output = ()>,
{
    let mut retry = 0u32;
    loop {
        let delay = match attempt(retry).await {
            AttemptOutcome::Finished(result) => return result,
            AttemptOutcome::RateLimited { retry_after } => {
                if retry >= policy.max_retries {
                    return Err(PanelError::RateLimited {
                        method: method.to_string(),
                        path: path.to_string(),
                        attempts: retry + 1,
                    });
                }
                let delay = policy.delay_for(retry, retry_after);
                warn!(
                    "Rate limited on {} {}, retrying in {:?} ({}/{})",
                    method,
                    path,
                    delay,
                    retry + 1,
                    policy.max_retries
                );
                delay
            }
            AttemptOutcome::TransportError(message) => {
                if retry >= policy.max_retries {
                    return Err(PanelError::Transport {
                        method: method.to_string(),
                        path: path.to_string(),
                        attempts: retry + 1,
                        message,
                    });
                }
                let delay = policy.backoff(retry);
                warn!(
                    "Transport error on {} {}: {}. Retrying in {:?} ({}/{})",
                    method,
                    path,
                    message,
                    delay,
                    retry + 1,
                    policy.max_retries
                );
                delay
            }
        };
        sleep(delay).await;
        retry += 1;
    }
}
