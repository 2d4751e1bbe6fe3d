use std::fmt::Display;
use std::future::Future;

use tokio::time::Duration;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_warn};

/// Retry schedule for [`exponential_backoff`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Attempts before giving up; `None` retries forever.
    pub times: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(20_000),
            factor: 2.0,
            times: None,
        }
    }
}

impl BackoffConfig {
    /// Delays waited after the first, second, ... failed attempt.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let max_delay = self.max_delay;
        let factor = self.factor;
        let schedule = std::iter::successors(Some(self.initial_delay.min(max_delay)), move |delay| {
            Some(delay.mul_f64(factor).min(max_delay))
        });
        schedule.take(self.times.map_or(usize::MAX, |times| times as usize))
    }
}

/// Run `operation` until it succeeds, sleeping along `config.delays()` after
/// each failure. After `config.times` failed attempts `default` is returned;
/// errors are never propagated.
pub async fn exponential_backoff<T, E, F, Fut>(
    config: &BackoffConfig,
    default: T,
    mut operation: F,
) -> T
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0u32;
    for delay in config.delays() {
        attempt += 1;
        match operation(attempt).await {
            Ok(value) => return value,
            Err(err) => {
                log_debug!("attempt {attempt} failed: {err}; retrying in {delay:?}");
            }
        }
        tokio::time::sleep(delay).await;
    }

    log_warn!("giving up after {attempt} attempts; using fallback value");
    default
}
