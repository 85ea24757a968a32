// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry with exponential backoff for transient backend failures.
//!
//! Connection setup and the idempotent store queries go through [`retry`]
//! with one of the presets below; which preset depends on who is waiting.
//! Appends are the exception: a failed ingest surfaces to the producer
//! immediately so it can apply its own backpressure.
//!
//! # Example
//!
//! ```
//! use proxy_data_cache::RetryConfig;
//!
//! // Startup: surface a bad store URL quickly instead of hanging
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_attempts, Some(5));
//!
//! // Daemon: a running cache never gives up on its local database
//! let daemon = RetryConfig::daemon();
//! assert_eq!(daemon.max_attempts, None);
//!
//! // Query: a couple of quick tries, then let the caller decide
//! let query = RetryConfig::query();
//! assert_eq!(query.max_attempts, Some(3));
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

/// Retry policy: how many tries, and how the delay between them grows.
///
/// `max_attempts` counts total tries including the first, so `Some(1)`
/// means no retry at all and `None` means keep trying forever.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_attempts: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::daemon()
    }
}

impl RetryConfig {
    /// Initial-connection policy: five tries over a few seconds, then
    /// fail so a misconfigured store URL is caught at startup.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_attempts: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Runtime-reconnection policy: retry forever, backoff capped at
    /// five minutes. Once the cache is up it must outlive database
    /// restarts.
    #[must_use]
    pub fn daemon() -> Self {
        Self {
            max_attempts: None,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            factor: 2.0,
        }
    }

    /// Per-operation policy: three quick tries. Used for idempotent
    /// reads and deletes where the caller has its own recovery path.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_attempts: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Minimal delays so unit tests exercising failure paths stay fast.
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_attempts: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }
}

/// Run `operation` until it succeeds or the policy is exhausted,
/// returning the last error in that case.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!(
                        "Operation '{}' recovered after {} failed attempts",
                        operation_name, attempts
                    );
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                if let Some(max) = config.max_attempts {
                    if attempts >= max {
                        return Err(err);
                    }
                    warn!(
                        "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                        operation_name, attempts, max, err, delay
                    );
                } else {
                    warn!(
                        "Operation '{}' failed (attempt {}, retrying indefinitely): {}. Next retry in {:?}...",
                        operation_name, attempts, err, delay
                    );
                }

                sleep(delay).await;
                delay = (delay.mul_f64(config.factor)).min(config.max_delay);
            }
        }
    }
}
