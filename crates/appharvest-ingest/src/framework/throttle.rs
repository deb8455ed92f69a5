//! Adaptive request pacing
//!
//! One [`AdaptiveThrottle`] per worker process. Before every upstream call the
//! worker awaits [`AdaptiveThrottle::wait_for_next_request`]; afterwards it
//! reports the outcome with `record_success` / `record_error`. The throttle
//! never sleeps longer than the effective delay it computes.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use crate::upstream::UpstreamError;

/// Sliding window for the requests-per-minute estimate
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Throttle configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottleConfig {
    pub base_delay: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Above this many requests in the window the delay doubles
    pub high_water_rpm: usize,
    /// Below this many (and no recent errors) the delay shrinks
    pub low_water_rpm: usize,
    /// `should_abort` fires once consecutive errors exceed this
    pub abort_after_errors: u32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(2000),
            min_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            high_water_rpm: 30,
            low_water_rpm: 10,
            abort_after_errors: 10,
        }
    }
}

/// Error classification returned by [`AdaptiveThrottle::record_error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Gateway,
    RateLimit,
    Timeout,
    Unknown,
}

impl ErrorClass {
    /// Delay multiplier applied on an error of this class
    pub fn multiplier(self) -> f64 {
        match self {
            ErrorClass::Gateway => 3.0,
            ErrorClass::RateLimit => 2.0,
            ErrorClass::Timeout => 1.5,
            ErrorClass::Unknown => 1.2,
        }
    }

    pub fn classify(error: &UpstreamError) -> Self {
        match error {
            UpstreamError::Server { .. } => ErrorClass::Gateway,
            UpstreamError::RateLimited(_) => ErrorClass::RateLimit,
            UpstreamError::Timeout(_) => ErrorClass::Timeout,
            UpstreamError::Network(msg) | UpstreamError::Malformed(msg) => {
                Self::classify_message(msg)
            },
        }
    }

    /// Fallback for untyped messages
    pub fn classify_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("502") || lower.contains("gateway") {
            ErrorClass::Gateway
        } else if lower.contains("429") || lower.contains("rate") {
            ErrorClass::RateLimit
        } else if lower.contains("timeout") || lower.contains("timed out") {
            ErrorClass::Timeout
        } else {
            ErrorClass::Unknown
        }
    }
}

/// Snapshot for periodic progress logging
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ThrottleStats {
    pub successes: u64,
    pub errors: u64,
    pub rate_limit_hits: u64,
    pub current_delay_ms: u64,
    pub requests_per_minute: usize,
    pub consecutive_errors: u32,
}

/// Multiply at millisecond resolution
fn scale(delay: Duration, factor: f64) -> Duration {
    Duration::from_millis((delay.as_millis() as f64 * factor).round() as u64)
}

pub struct AdaptiveThrottle {
    config: ThrottleConfig,
    current_delay: Duration,
    consecutive_errors: u32,
    recent_requests: VecDeque<Instant>,
    last_request: Option<Instant>,
    successes: u64,
    errors: u64,
    rate_limit_hits: u64,
}

impl AdaptiveThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        let current_delay = config.base_delay.clamp(config.min_delay, config.max_delay);
        Self {
            config,
            current_delay,
            consecutive_errors: 0,
            recent_requests: VecDeque::new(),
            last_request: None,
            successes: 0,
            errors: 0,
            rate_limit_hits: 0,
        }
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.recent_requests.front() {
            if now.duration_since(oldest) >= RATE_WINDOW {
                self.recent_requests.pop_front();
            } else {
                break;
            }
        }
    }

    /// Delay that would apply to a request issued with `in_window` requests
    /// (including itself) in the trailing minute
    fn effective_delay(&self, in_window: usize) -> Duration {
        let mut delay = self.current_delay;

        if in_window > self.config.high_water_rpm {
            delay = delay.saturating_mul(2);
        } else if in_window < self.config.low_water_rpm && self.consecutive_errors == 0 {
            delay = scale(delay, 0.8).max(self.config.min_delay);
        }

        if self.consecutive_errors > 0 {
            let factor = 2f64.powi(self.consecutive_errors.min(16) as i32);
            delay = scale(delay, factor);
        }

        delay.min(self.config.max_delay)
    }

    /// Wait out the remainder of the effective delay since the previous request.
    ///
    /// Returns how long it slept.
    pub async fn wait_for_next_request(&mut self) -> Duration {
        let now = Instant::now();
        self.prune(now);
        self.recent_requests.push_back(now);

        let delay = self.effective_delay(self.recent_requests.len());
        let wait = match self.last_request {
            Some(last) => delay.saturating_sub(now.duration_since(last)),
            None => Duration::ZERO,
        };

        if !wait.is_zero() {
            tracing::trace!(wait_ms = wait.as_millis() as u64, "Throttling next request");
            tokio::time::sleep(wait).await;
        }

        self.last_request = Some(Instant::now());
        wait
    }

    pub fn record_success(&mut self) {
        self.successes += 1;
        self.consecutive_errors = 0;
        self.rate_limit_hits = self.rate_limit_hits.saturating_sub(1);
        self.current_delay = scale(self.current_delay, 0.95).max(self.config.min_delay);
    }

    pub fn record_error(&mut self, error: &UpstreamError) -> ErrorClass {
        let class = ErrorClass::classify(error);
        self.record_classified(class);
        class
    }

    pub fn record_classified(&mut self, class: ErrorClass) {
        self.errors += 1;
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        if class == ErrorClass::RateLimit {
            self.rate_limit_hits += 1;
        }
        self.current_delay = scale(self.current_delay, class.multiplier()).min(self.config.max_delay);
    }

    pub fn should_abort(&self) -> bool {
        self.consecutive_errors > self.config.abort_after_errors
    }

    pub fn stats(&self) -> ThrottleStats {
        ThrottleStats {
            successes: self.successes,
            errors: self.errors,
            rate_limit_hits: self.rate_limit_hits,
            current_delay_ms: self.current_delay.as_millis() as u64,
            requests_per_minute: self.recent_requests.len(),
            consecutive_errors: self.consecutive_errors,
        }
    }
}
