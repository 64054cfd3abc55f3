//! Circuit breaker for failure isolation
//!
//! Protects worker capacity from an operation class that is failing
//! pervasively. Every execution attempt asks the breaker for admission;
//! executed outcomes feed a rolling window that decides when to trip.
//!
//! # State Machine
//!
//! ```text
//! ┌─────────┐  failure ratio met   ┌─────────┐  open duration   ┌──────────┐
//! │ Closed  │ ──────────────────► │  Open   │ ───────────────► │ HalfOpen │
//! └─────────┘                      └─────────┘                  └──────────┘
//!      ▲                                ▲                            │
//!      │         trial success          │       trial failure        │
//!      └────────────────────────────────┴────────────────────────────┘
//! ```
//!
//! Admission rejections are never fed back into the window - otherwise a
//! rejection storm would keep the circuit open forever.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - admissions allowed, outcomes tracked
    Closed,

    /// Failure ratio met - admissions rejected without execution
    Open,

    /// Probing recovery - a bounded number of trial admissions allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum BreakerConfigError {
    /// Failure ratio outside (0, 1]
    #[error("failure_ratio must be in (0, 1], got {0}")]
    FailureRatio(f64),

    /// Minimum sample size below 1
    #[error("min_samples must be at least 1")]
    MinSamples,

    /// Trial budget below 1
    #[error("trial_count must be at least 1")]
    TrialCount,
}

/// Circuit breaker configuration
///
/// # Example
///
/// ```
/// use conveyor::BreakerConfig;
/// use std::time::Duration;
///
/// let config = BreakerConfig::default()
///     .with_failure_ratio(0.5)
///     .with_min_samples(4)
///     .with_open_duration(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakerConfig {
    /// Fraction of failures in the window that opens the circuit (0, 1]
    pub failure_ratio: f64,

    /// Minimum outcomes in the window before the ratio is evaluated
    pub min_samples: usize,

    /// Time the circuit stays open before trialing recovery
    #[serde(with = "duration_millis")]
    pub open_duration: Duration,

    /// Concurrent trial admissions permitted while half-open
    pub trial_count: usize,

    /// Rolling window over which outcomes are counted
    #[serde(with = "duration_millis")]
    pub window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_ratio: 0.5,
            min_samples: 10,
            open_duration: Duration::from_secs(30),
            trial_count: 2,
            window: Duration::from_secs(60),
        }
    }
}

impl BreakerConfig {
    /// Create a new breaker configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure ratio that opens the circuit
    pub fn with_failure_ratio(mut self, ratio: f64) -> Self {
        self.failure_ratio = ratio;
        self
    }

    /// Set the minimum sample size before the ratio is evaluated
    pub fn with_min_samples(mut self, samples: usize) -> Self {
        self.min_samples = samples;
        self
    }

    /// Set how long the circuit stays open before trialing
    pub fn with_open_duration(mut self, duration: Duration) -> Self {
        self.open_duration = duration;
        self
    }

    /// Set the half-open trial budget
    pub fn with_trial_count(mut self, count: usize) -> Self {
        self.trial_count = count;
        self
    }

    /// Set the rolling sample window
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), BreakerConfigError> {
        if !(self.failure_ratio > 0.0 && self.failure_ratio <= 1.0) {
            return Err(BreakerConfigError::FailureRatio(self.failure_ratio));
        }
        if self.min_samples < 1 {
            return Err(BreakerConfigError::MinSamples);
        }
        if self.trial_count < 1 {
            return Err(BreakerConfigError::TrialCount);
        }
        Ok(())
    }
}

/// Admission rejected because the circuit is open (or the half-open trial
/// budget is exhausted, which callers observe identically)
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("circuit breaker is open")]
pub struct BreakerRejected;

struct BreakerInner {
    state: CircuitState,
    /// Timestamped executed outcomes, oldest first; `true` means success
    window: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    trials_in_flight: usize,
}

/// Permit for one admitted execution
///
/// Must be consumed with [`success`](Self::success) or
/// [`failure`](Self::failure) so the outcome feeds the rolling window and,
/// for half-open trials, releases the trial slot.
#[must_use = "the execution outcome must be reported back to the breaker"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
}

impl BreakerPermit<'_> {
    /// Report that the admitted execution succeeded
    pub fn success(self) {
        self.breaker.record(true, self.trial);
    }

    /// Report that the admitted execution failed
    pub fn failure(self) {
        self.breaker.record(false, self.trial);
    }
}

/// Failure-rate tracker gating whether new tasks may run
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a breaker in the closed state
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                window: VecDeque::new(),
                opened_at: None,
                trials_in_flight: 0,
            }),
        }
    }

    /// Get the breaker configuration
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Ask whether one execution may proceed
    ///
    /// The open-to-half-open transition is evaluated here: once the open
    /// duration has elapsed, the first admission request becomes the first
    /// trial. A transition performed by one caller is immediately visible
    /// to all others; there are no stale reads of the open/closed decision.
    pub fn admit(&self) -> Result<BreakerPermit<'_>, BreakerRejected> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(BreakerPermit {
                breaker: self,
                trial: false,
            }),
            CircuitState::Open => {
                let expired = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.open_duration)
                    .unwrap_or(false);
                if expired {
                    inner.state = CircuitState::HalfOpen;
                    inner.trials_in_flight = 1;
                    info!(state = %CircuitState::HalfOpen, "circuit breaker trialing recovery");
                    Ok(BreakerPermit {
                        breaker: self,
                        trial: true,
                    })
                } else {
                    Err(BreakerRejected)
                }
            }
            CircuitState::HalfOpen => {
                if inner.trials_in_flight < self.config.trial_count {
                    inner.trials_in_flight += 1;
                    Ok(BreakerPermit {
                        breaker: self,
                        trial: true,
                    })
                } else {
                    // Trial budget exhausted: reject as if open
                    Err(BreakerRejected)
                }
            }
        }
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Force the breaker closed and clear its window
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.window.clear();
        inner.opened_at = None;
        inner.trials_in_flight = 0;
    }

    fn record(&self, success: bool, trial: bool) {
        let mut inner = self.inner.lock();
        if trial && inner.trials_in_flight > 0 {
            inner.trials_in_flight -= 1;
        }

        match inner.state {
            CircuitState::HalfOpen => {
                // Late completions from before the trip carry no trial
                // evidence about recovery.
                if !trial {
                    return;
                }
                if success {
                    inner.state = CircuitState::Closed;
                    inner.window.clear();
                    inner.opened_at = None;
                    inner.trials_in_flight = 0;
                    info!(state = %CircuitState::Closed, "circuit breaker recovered");
                } else {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.window.clear();
                    inner.trials_in_flight = 0;
                    warn!(state = %CircuitState::Open, "trial failed, circuit breaker reopened");
                }
            }
            CircuitState::Closed => {
                let now = Instant::now();
                inner.window.push_back((now, success));
                while let Some(&(at, _)) = inner.window.front() {
                    if now.duration_since(at) > self.config.window {
                        inner.window.pop_front();
                    } else {
                        break;
                    }
                }

                let samples = inner.window.len();
                if samples >= self.config.min_samples {
                    let failures = inner.window.iter().filter(|(_, ok)| !ok).count();
                    let ratio = failures as f64 / samples as f64;
                    if ratio >= self.config.failure_ratio {
                        inner.state = CircuitState::Open;
                        inner.opened_at = Some(now);
                        inner.window.clear();
                        warn!(failures, samples, ratio, "failure ratio met, circuit breaker opened");
                    } else {
                        debug!(failures, samples, "outcome recorded");
                    }
                }
            }
            CircuitState::Open => {
                // Completion landed after the trip; the window restarts
                // from the next half-open trial.
            }
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
