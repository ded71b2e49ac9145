//! One retry loop for every remote call.
//!
//! Callers supply a classifier that sorts each error into a `FailureClass`;
//! the policy decides per class how long to cool down and when to give up.
//! Metadata fetches and media downloads share this loop with different
//! policies.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use aweme_common::{DownloadConfig, RetryConfig};
use tracing::warn;

use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Connection refused, DNS failure, connect/read timeout.
    Connectivity,
    /// Local resource exhaustion (connection pool, file descriptors).
    Exhaustion,
    /// The server answered but not usefully (non-2xx, empty body).
    Transient,
    /// Never retried.
    Fatal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub cooldown: Duration,
    pub max_cooldown: Duration,
    /// Grow the cooldown linearly with each failure of this class.
    pub escalating: bool,
    /// Failures of this class tolerated before giving up. `None` retries
    /// forever.
    pub max_attempts: Option<u32>,
}

impl Backoff {
    pub fn fixed(cooldown: Duration) -> Self {
        Self {
            cooldown,
            max_cooldown: cooldown,
            escalating: false,
            max_attempts: None,
        }
    }

    pub fn escalating(cooldown: Duration, max_cooldown: Duration) -> Self {
        Self {
            cooldown,
            max_cooldown: max_cooldown.max(cooldown),
            escalating: true,
            max_attempts: None,
        }
    }

    pub fn limit(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Cooldown after the `n`th failure (1-based) of this class.
    pub fn delay(&self, n: u32) -> Duration {
        if !self.escalating {
            return self.cooldown;
        }
        self.cooldown
            .checked_mul(n.max(1))
            .unwrap_or(self.max_cooldown)
            .min(self.max_cooldown)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub connectivity: Backoff,
    pub exhaustion: Backoff,
    pub transient: Backoff,
    /// Ceiling on attempts across all classes.
    pub max_attempts: Option<u32>,
}

/// Why a retried operation stopped.
#[derive(Debug)]
pub struct Failure<E> {
    pub error: E,
    pub class: FailureClass,
    pub attempts: u32,
    /// A retryable failure that ran out of attempts, as opposed to a fatal one.
    pub exhausted: bool,
}

impl RetryPolicy {
    /// Metadata requests: connectivity loss is waited out indefinitely,
    /// HTTP errors escalate from a minute and give up after ten tries.
    pub fn metadata() -> Self {
        Self::from_config(&RetryConfig::default())
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            connectivity: Backoff::fixed(Duration::from_secs(config.connectivity_cooldown_secs))
                .limit(config.connectivity_max_attempts),
            exhaustion: Backoff::fixed(Duration::from_secs(config.exhaustion_cooldown_secs)),
            transient: Backoff::escalating(
                Duration::from_secs(config.http_cooldown_secs),
                Duration::from_secs(config.http_max_cooldown_secs),
            )
            .limit(Some(config.http_max_attempts)),
            max_attempts: None,
        }
    }

    /// Media downloads: ten attempts overall, whatever went wrong.
    pub fn media() -> Self {
        Self::media_from_config(&DownloadConfig::default())
    }

    pub fn media_from_config(config: &DownloadConfig) -> Self {
        let network = Backoff::fixed(Duration::from_secs(config.network_cooldown_secs));
        Self {
            connectivity: network.clone(),
            exhaustion: network,
            transient: Backoff::fixed(Duration::from_secs(config.status_cooldown_secs)),
            max_attempts: Some(config.max_attempts),
        }
    }

    fn backoff(&self, class: FailureClass) -> Option<&Backoff> {
        match class {
            FailureClass::Connectivity => Some(&self.connectivity),
            FailureClass::Exhaustion => Some(&self.exhaustion),
            FailureClass::Transient => Some(&self.transient),
            FailureClass::Fatal => None,
        }
    }

    /// Run `op` until it succeeds, fails fatally, or a ceiling is hit. A
    /// ceiling of `n` means `n` attempts with a cooldown between each.
    pub async fn run<T, E, F, Fut, C>(
        &self,
        clock: &dyn Clock,
        label: &str,
        classify: C,
        mut op: F,
    ) -> Result<T, Failure<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> FailureClass,
        E: Display,
    {
        let mut attempts = 0u32;
        let mut per_class = [0u32; 3];

        loop {
            attempts += 1;
            let error = match op().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let class = classify(&error);
            let Some(backoff) = self.backoff(class) else {
                return Err(Failure {
                    error,
                    class,
                    attempts,
                    exhausted: false,
                });
            };

            let slot = &mut per_class[class as usize];
            *slot += 1;
            let failures = *slot;

            let class_spent = backoff.max_attempts.is_some_and(|max| failures >= max);
            let total_spent = self.max_attempts.is_some_and(|max| attempts >= max);
            if class_spent || total_spent {
                warn!(label, attempts, ?class, error = %error, "retry: giving up");
                return Err(Failure {
                    error,
                    class,
                    attempts,
                    exhausted: true,
                });
            }

            let cooldown = backoff.delay(failures);
            warn!(
                label,
                attempt = attempts,
                ?class,
                cooldown_secs = cooldown.as_secs_f64(),
                error = %error,
                "retry: cooling down"
            );
            clock.sleep(cooldown).await;
        }
    }
}
