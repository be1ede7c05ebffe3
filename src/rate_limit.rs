//! # Rate-limited executor
//!
//! One [`RateLimitedExecutor`] is shared by every caller of the Amazon Ads API
//! (all account sources and the refresh scheduler) so the sliding window sees
//! all upstream traffic. Each attempt waits for window capacity, runs under a
//! per-attempt deadline and is retried according to its [`FailureClass`].

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use metrics::{counter, histogram};
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tracing::{debug, warn};

use crate::ads_api::{FailureClass, UpstreamError};
use crate::config::RateLimitConfig;
use crate::error::AdsError;
use crate::telemetry::{METRIC_LIMITER_WAIT, METRIC_UPSTREAM_RETRIES};

/// Start times of the operations admitted within the current window.
#[derive(Debug)]
struct SlidingWindow {
    capacity: usize,
    window: Duration,
    starts: VecDeque<Instant>,
}

impl SlidingWindow {
    /// Admit an operation at `now`, or return the instant capacity frees up.
    fn try_admit(&mut self, now: Instant) -> Result<(), Instant> {
        while let Some(&oldest) = self.starts.front() {
            if now.duration_since(oldest) >= self.window {
                self.starts.pop_front();
            } else {
                break;
            }
        }

        if self.starts.len() < self.capacity {
            self.starts.push_back(now);
            return Ok(());
        }

        match self.starts.front() {
            Some(&oldest) => Err(oldest + self.window),
            None => Ok(()),
        }
    }
}

/// Backoff and retry budgets.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
    pub max_rate_limit_retries: u32,
    pub max_transient_retries: u32,
    pub request_timeout: Duration,
}

impl RetryPolicy {
    /// `min(base * 2^retry + jitter, max)`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        let exponential = self.base_delay.saturating_mul(factor);

        let jitter_bound = exponential.as_secs_f64() * self.jitter_factor;
        let jitter = if jitter_bound > 0.0 {
            Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..jitter_bound))
        } else {
            Duration::ZERO
        };

        exponential.saturating_add(jitter).min(self.max_delay)
    }
}

impl From<&RateLimitConfig> for RetryPolicy {
    fn from(config: &RateLimitConfig) -> Self {
        Self {
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            jitter_factor: config.jitter_factor,
            max_rate_limit_retries: config.max_retries,
            max_transient_retries: config.max_transient_retries,
            request_timeout: config.request_timeout(),
        }
    }
}

/// Sliding-window limiter plus retry loop around idempotent upstream calls.
#[derive(Debug)]
pub struct RateLimitedExecutor {
    window: Mutex<SlidingWindow>,
    policy: RetryPolicy,
}

impl RateLimitedExecutor {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self::with_policy(
            config.ops_per_window as usize,
            config.window(),
            RetryPolicy::from(config),
        )
    }

    pub fn with_policy(capacity: usize, window: Duration, policy: RetryPolicy) -> Self {
        Self {
            window: Mutex::new(SlidingWindow {
                capacity: capacity.max(1),
                window,
                starts: VecDeque::with_capacity(capacity.max(1)),
            }),
            policy,
        }
    }

    /// Block until the window has room for one more operation.
    pub async fn acquire(&self) {
        let requested = Instant::now();
        loop {
            let admitted = self.window.lock().await.try_admit(Instant::now());
            match admitted {
                Ok(()) => break,
                Err(wake_at) => sleep_until(wake_at).await,
            }
        }
        histogram!(METRIC_LIMITER_WAIT).record(requested.elapsed().as_secs_f64());
    }

    /// Run `operation` until it succeeds, fails fatally or exhausts the
    /// retry budget of its failure class. `operation` must be idempotent.
    pub async fn execute<T, F, Fut>(&self, name: &'static str, mut operation: F) -> Result<T, AdsError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let mut attempts: u32 = 0;
        let mut rate_limit_retries: u32 = 0;
        let mut transient_retries: u32 = 0;

        loop {
            self.acquire().await;
            attempts += 1;

            let error = match timeout(self.policy.request_timeout, operation()).await {
                Ok(Ok(value)) => {
                    if attempts > 1 {
                        debug!(operation = name, attempts, "Upstream call succeeded after retry");
                    }
                    return Ok(value);
                }
                Ok(Err(error)) => error,
                Err(_) => UpstreamError::Timeout,
            };

            let class = error.class();
            let delay = match class {
                FailureClass::Fatal => return Err(error.into()),
                FailureClass::RateLimit => {
                    if rate_limit_retries >= self.policy.max_rate_limit_retries {
                        warn!(operation = name, attempts, "Rate limit retry budget exhausted");
                        return Err(AdsError::RateLimitExceeded { attempts });
                    }
                    let delay = match &error {
                        UpstreamError::RateLimited {
                            retry_after: Some(hint),
                        } => *hint,
                        _ => self.policy.backoff(rate_limit_retries),
                    };
                    rate_limit_retries += 1;
                    delay
                }
                FailureClass::Transient => {
                    if transient_retries >= self.policy.max_transient_retries {
                        warn!(operation = name, attempts, error = %error, "Transient retry budget exhausted");
                        return Err(AdsError::UpstreamUnavailable {
                            attempts,
                            reason: error.to_string(),
                        });
                    }
                    let delay = self.policy.backoff(transient_retries);
                    transient_retries += 1;
                    delay
                }
            };

            counter!(METRIC_UPSTREAM_RETRIES, "class" => class_label(class), "operation" => name)
                .increment(1);
            warn!(
                operation = name,
                attempts,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "Upstream call failed, retrying"
            );
            sleep(delay).await;
        }
    }
}

fn class_label(class: FailureClass) -> &'static str {
    match class {
        FailureClass::RateLimit => "rate_limit",
        FailureClass::Transient => "transient",
        FailureClass::Fatal => "fatal",
    }
}
