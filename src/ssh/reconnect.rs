//! Retry with exponential backoff for tunnel start-up.

use anyhow::Result;
use std::future::Future;
use std::time::Duration;

/// Configuration for reconnection behavior
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Initial delay before first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Maximum number of retries after the first attempt (None = infinite)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: Some(1),
        }
    }
}

impl ReconnectConfig {
    /// Fixed number of retries starting at `delay`
    pub fn with_retries(retries: u32, delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_attempts: Some(retries),
            ..Self::default()
        }
    }
}

/// Exponential backoff iterator for reconnection attempts
pub struct ExponentialBackoff {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_delay: config.initial_delay,
            attempt: 0,
            config,
        }
    }

    /// Get the next delay, or None if max attempts reached
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.config.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }

        let delay = self.current_delay;
        self.attempt += 1;

        let next =
            Duration::from_secs_f64(self.current_delay.as_secs_f64() * self.config.multiplier);
        self.current_delay = next.min(self.config.max_delay);

        Some(delay)
    }

    /// Current attempt number (1-based after first call to next_delay)
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Maximum number of retries (u32::MAX if unlimited)
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.unwrap_or(u32::MAX)
    }
}

/// Decide whether a tunnel failure is worth another attempt.
///
/// Authentication and host-key failures never are. Network-level failures
/// are. Anything unrecognised fails fast.
pub fn is_retriable_error(error: &anyhow::Error) -> bool {
    let error_str = format!("{:#}", error).to_lowercase();

    let non_retriable_patterns = [
        "permission denied",
        "authentication failed",
        "auth fail",
        "host key verification failed",
        "no supported authentication",
        "too many authentication failures",
        "invalid password",
        "key rejected",
        "publickey denied",
    ];

    if non_retriable_patterns
        .iter()
        .any(|pattern| error_str.contains(pattern))
    {
        return false;
    }

    let retriable_patterns = [
        "connection refused",
        "connection timed out",
        "connection reset",
        "network unreachable",
        "host unreachable",
        "no route to host",
        "not listening",
        "address already in use",
        "temporary failure",
        "try again",
        "exited immediately",
    ];

    retriable_patterns
        .iter()
        .any(|pattern| error_str.contains(pattern))
}

/// Run `op` until it succeeds, fails permanently, or the backoff runs out.
pub async fn retry_with_backoff<T, F, Fut>(
    config: ReconnectConfig,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = ExponentialBackoff::new(config);

    loop {
        match op().await {
            Ok(value) => {
                if backoff.attempt() > 0 {
                    tracing::info!("{} succeeded after {} retries", what, backoff.attempt());
                }
                return Ok(value);
            }
            Err(e) if !is_retriable_error(&e) => {
                tracing::warn!("{} failed with non-retriable error: {:#}", what, e);
                return Err(e);
            }
            Err(e) => match backoff.next_delay() {
                Some(delay) => {
                    tracing::info!(
                        "{} attempt {} failed ({:#}), retrying in {:?}",
                        what,
                        backoff.attempt(),
                        e,
                        delay
                    );
                    smol::Timer::after(delay).await;
                }
                None => {
                    tracing::error!(
                        "{} failed after {} retries: {:#}",
                        what,
                        backoff.max_attempts(),
                        e
                    );
                    return Err(e);
                }
            },
        }
    }
}
