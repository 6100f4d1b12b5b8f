//! Retry controller for outbound SUT and annotator calls
//!
//! Implements bounded exponential backoff for transient failures. Errors are
//! classified as either `Transient` (rate limit, timeout, connection reset)
//! or `Fatal` (malformed request, authentication failure, not found). Fatal
//! errors are returned on the attempt that produced them.
//!
//! The controller performs no caching; `pipeline::CachedCaller` composes the
//! cache around it.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Retry classification of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Worth retrying after a delay
    Transient,
    /// Never retried
    Fatal,
}

/// Classifies errors for the retry controller
pub trait Classify {
    /// Whether this error is transient or fatal
    fn error_class(&self) -> ErrorClass;

    /// Server-suggested delay before the next attempt
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Error kind taxonomy for outbound calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallErrorKind {
    /// Rate limit exceeded (retryable after delay)
    RateLimited,

    /// Request timed out (retryable)
    Timeout,

    /// Connection reset or refused (retryable)
    ConnectionReset,

    /// Provider temporarily unavailable, e.g. HTTP 5xx (retryable)
    Unavailable,

    /// Request rejected as malformed (not retryable - fix the request)
    MalformedRequest,

    /// Authentication or authorization failed (not retryable)
    Authentication,

    /// Model or endpoint not found (not retryable)
    NotFound,

    /// Internal adapter error (not retryable - bug)
    Internal,
}

impl CallErrorKind {
    /// Check if this error kind is retryable
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CallErrorKind::RateLimited
                | CallErrorKind::Timeout
                | CallErrorKind::ConnectionReset
                | CallErrorKind::Unavailable
        )
    }

    /// Check if this error kind is fatal (never retry)
    pub fn is_fatal(&self) -> bool {
        !self.is_transient()
    }

    /// Map an HTTP status code to an error kind.
    ///
    /// Returns `None` for success codes.
    pub fn from_http_status(status: u16) -> Option<Self> {
        let kind = match status {
            200..=399 => return None,
            401 | 403 => CallErrorKind::Authentication,
            404 | 410 => CallErrorKind::NotFound,
            408 => CallErrorKind::Timeout,
            429 => CallErrorKind::RateLimited,
            500..=599 => CallErrorKind::Unavailable,
            _ => CallErrorKind::MalformedRequest,
        };
        Some(kind)
    }
}

/// Structured error from a SUT or annotator call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("[{kind:?}] {message}")]
pub struct CallError {
    /// Error kind (determines retryability)
    pub kind: CallErrorKind,

    /// Human-readable error message
    pub message: String,

    /// Underlying provider error code (if applicable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// Suggested retry delay (for retryable errors)
    #[serde(default, skip_serializing_if = "Option::is_none", with = "humantime_serde")]
    pub retry_after: Option<Duration>,
}

impl CallError {
    /// Create a new call error
    pub fn new(kind: CallErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            retry_after: None,
        }
    }

    /// Add a provider error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Add retry delay
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    /// Create a rate limit error
    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self {
            kind: CallErrorKind::RateLimited,
            message: "Rate limit exceeded".to_string(),
            code: Some("RATE_LIMITED".to_string()),
            retry_after,
        }
    }

    /// Create a timeout error
    pub fn timeout(after: Duration) -> Self {
        Self::new(
            CallErrorKind::Timeout,
            format!("Call timed out after {:?}", after),
        )
        .with_code("TIMEOUT")
    }

    /// Create a connection reset error
    pub fn connection_reset(message: impl Into<String>) -> Self {
        Self::new(CallErrorKind::ConnectionReset, message)
    }

    /// Create a malformed request error
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(CallErrorKind::MalformedRequest, message)
    }

    /// Create an authentication error
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(CallErrorKind::Authentication, message).with_code("AUTHENTICATION")
    }

    /// Create a not-found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(CallErrorKind::NotFound, message)
    }
}

impl Classify for CallError {
    fn error_class(&self) -> ErrorClass {
        if self.kind.is_transient() {
            ErrorClass::Transient
        } else {
            ErrorClass::Fatal
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: usize,
    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Maximum delay between retries
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Add up to 25% jitter to each delay
    pub add_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: false,
        }
    }
}

impl RetryConfig {
    /// A single attempt, no backoff
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Attempt budget, counting the first call (at least 1)
    pub fn with_max_attempts(self, attempts: usize) -> Self {
        Self {
            max_attempts: attempts.max(1),
            ..self
        }
    }

    pub fn with_initial_delay(self, initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            ..self
        }
    }

    pub fn with_max_delay(self, max_delay: Duration) -> Self {
        Self { max_delay, ..self }
    }

    /// Growth factor between consecutive delays (at least 1.0)
    pub fn with_backoff_multiplier(self, multiplier: f64) -> Self {
        Self {
            backoff_multiplier: multiplier.max(1.0),
            ..self
        }
    }

    pub fn with_jitter(self, add_jitter: bool) -> Self {
        Self { add_jitter, ..self }
    }

    /// Reject budgets and schedules that cannot work
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if !(self.backoff_multiplier >= 1.0) {
            return Err("backoff_multiplier must be >= 1.0".to_string());
        }
        if self.initial_delay > self.max_delay {
            return Err("initial_delay must not exceed max_delay".to_string());
        }
        Ok(())
    }

    /// Exponential delay before retry number `retry` (0-indexed), capped at
    /// `max_delay`. Jitter is not applied.
    pub fn delay_for_attempt(&self, retry: usize) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let grown = self.initial_delay.as_nanos() as f64 * self.backoff_multiplier.powi(exponent);
        // 0 * inf is NaN for a zero initial delay
        if grown.is_nan() {
            return Duration::ZERO;
        }
        if grown >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }
        Duration::from_nanos(grown.round() as u64)
    }

    /// Delay before retry number `retry` with jitter derived from `seed`.
    ///
    /// With `add_jitter` the delay grows by up to 25%, still capped at
    /// `max_delay`. The same `(seed, retry)` always yields the same delay.
    pub fn jittered_delay(&self, retry: usize, seed: u64) -> Duration {
        let base = self.delay_for_attempt(retry);
        if !self.add_jitter {
            return base;
        }
        let extra = base.mul_f64(0.25 * jitter_fraction(seed, retry));
        (base + extra).min(self.max_delay)
    }
}

/// Uniform value in [0, 1) from SHA-256 of `(seed, retry)`
fn jitter_fraction(seed: u64, retry: usize) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(seed.to_le_bytes());
    hasher.update((retry as u64).to_le_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_le_bytes(head) >> 11) as f64 / (1u64 << 53) as f64
}

/// Per-call retry state. Lives only for the duration of one outbound call.
#[derive(Debug)]
pub struct RetryState {
    config: RetryConfig,
    attempt: usize,
    backoffs: usize,
    jitter_seed: u64,
    last_error_kind: Option<ErrorClass>,
    backoff_deadline: Option<Instant>,
}

impl RetryState {
    /// Create a new retry state
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            attempt: 0,
            backoffs: 0,
            jitter_seed: 0,
            last_error_kind: None,
            backoff_deadline: None,
        }
    }

    /// Seed for this call's jitter
    pub fn with_jitter_seed(mut self, seed: u64) -> Self {
        self.jitter_seed = seed;
        self
    }

    /// Start a new attempt and return its number (1-indexed)
    pub fn begin_attempt(&mut self) -> usize {
        self.attempt += 1;
        self.backoff_deadline = None;
        self.attempt
    }

    /// Record the classification of a failed attempt
    pub fn record_failure(&mut self, class: ErrorClass) {
        self.last_error_kind = Some(class);
    }

    /// Check if another attempt is allowed
    pub fn should_retry(&self) -> bool {
        self.attempt < self.config.max_attempts
    }

    /// Compute the next backoff delay and arm the deadline.
    ///
    /// A `retry_after` hint raises the delay but never beyond `max_delay`.
    pub fn schedule_backoff(&mut self, retry_after: Option<Duration>) -> Duration {
        let mut delay = self.config.jittered_delay(self.backoffs, self.jitter_seed);
        if let Some(hint) = retry_after {
            delay = delay.max(hint.min(self.config.max_delay));
        }
        self.backoffs += 1;
        self.backoff_deadline = Some(Instant::now() + delay);
        delay
    }

    /// Get current attempt number (1-indexed)
    pub fn current_attempt(&self) -> usize {
        self.attempt
    }

    /// Number of backoff delays scheduled so far
    pub fn backoffs(&self) -> usize {
        self.backoffs
    }

    /// Get remaining attempts
    pub fn remaining_attempts(&self) -> usize {
        self.config.max_attempts.saturating_sub(self.attempt)
    }

    /// Classification of the most recent failure
    pub fn last_error_kind(&self) -> Option<ErrorClass> {
        self.last_error_kind
    }

    /// When the pending backoff elapses
    pub fn backoff_deadline(&self) -> Option<Instant> {
        self.backoff_deadline
    }
}

/// What happened on a single attempt
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Succeeded,
    Transient(String),
    Fatal(String),
}

/// Observation emitted after every attempt
#[derive(Debug, Clone)]
pub struct AttemptEvent {
    /// Attempt number (1-indexed)
    pub attempt: usize,
    /// Outcome of this attempt
    pub outcome: AttemptOutcome,
    /// Backoff before the next attempt, if one is scheduled
    pub delay: Option<Duration>,
}

/// Receives attempt events for logging or metrics
pub trait AttemptObserver: Send + Sync {
    fn on_attempt(&self, event: &AttemptEvent);
}

impl<F> AttemptObserver for F
where
    F: Fn(&AttemptEvent) + Send + Sync,
{
    fn on_attempt(&self, event: &AttemptEvent) {
        self(event)
    }
}

/// Failure returned by the retry controller
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RetryError<E> {
    /// Non-retryable error, returned on the attempt that produced it
    #[error("fatal error on attempt {attempt}: {error}")]
    Fatal { attempt: usize, error: E },

    /// Transient errors persisted through every allowed attempt
    #[error("retries exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: usize, last: E },
}

impl<E> RetryError<E> {
    /// Number of attempts made
    pub fn attempts(&self) -> usize {
        match self {
            RetryError::Fatal { attempt, .. } => *attempt,
            RetryError::Exhausted { attempts, .. } => *attempts,
        }
    }

    /// The underlying error
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Fatal { error, .. } => error,
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

/// Wraps outbound calls with classification-aware exponential backoff
#[derive(Clone, Default)]
pub struct RetryController {
    config: RetryConfig,
    observer: Option<Arc<dyn AttemptObserver>>,
    calls: Arc<AtomicU64>,
}

impl fmt::Debug for RetryController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryController")
            .field("config", &self.config)
            .field("has_observer", &self.observer.is_some())
            .finish()
    }
}

impl RetryController {
    /// Create a controller with the given configuration
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            observer: None,
            calls: Arc::default(),
        }
    }

    /// Attach an observer notified after every attempt
    pub fn with_observer(mut self, observer: Arc<dyn AttemptObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// The active configuration
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    fn observe(&self, attempt: usize, outcome: AttemptOutcome, delay: Option<Duration>) {
        if let Some(observer) = &self.observer {
            observer.on_attempt(&AttemptEvent {
                attempt,
                outcome,
                delay,
            });
        }
    }

    /// Execute `operation`, retrying transient failures.
    ///
    /// Dropping the returned future abandons the sequence; nothing is
    /// recorded for a partially completed call.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        let seed = self.calls.fetch_add(1, Ordering::Relaxed);
        self.call_seeded(seed, operation).await
    }

    /// Like [`call`](Self::call), with jitter derived from `seed`.
    ///
    /// Seeding from the call's cache key gives a replayed call the same
    /// backoff schedule.
    pub async fn call_seeded<F, Fut, T, E>(
        &self,
        seed: u64,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        let mut state = RetryState::new(self.config.clone()).with_jitter_seed(seed);

        loop {
            let attempt = state.begin_attempt();
            let error = match operation().await {
                Ok(result) => {
                    self.observe(attempt, AttemptOutcome::Succeeded, None);
                    return Ok(result);
                }
                Err(e) => e,
            };

            let class = error.error_class();
            state.record_failure(class);

            if class == ErrorClass::Fatal {
                tracing::debug!(attempt, error = %error, "fatal error, not retrying");
                self.observe(attempt, AttemptOutcome::Fatal(error.to_string()), None);
                return Err(RetryError::Fatal { attempt, error });
            }

            if !state.should_retry() {
                tracing::warn!(attempts = attempt, error = %error, "retry budget exhausted");
                self.observe(attempt, AttemptOutcome::Transient(error.to_string()), None);
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: error,
                });
            }

            let delay = state.schedule_backoff(error.retry_after());
            tracing::debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "transient error, backing off"
            );
            self.observe(
                attempt,
                AttemptOutcome::Transient(error.to_string()),
                Some(delay),
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Execute an async operation with retries
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, operation: F) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: Classify + fmt::Display,
{
    RetryController::new(config.clone()).call(operation).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> RetryConfig {
        RetryConfig::default()
            .with_initial_delay(Duration::from_millis(10))
            .with_max_attempts(3)
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert!(!config.add_jitter);
    }

    #[test]
    fn test_retry_config_no_retry() {
        let config = RetryConfig::no_retry();
        assert_eq!(config.max_attempts, 1);
    }

    #[test]
    fn test_delay_calculation() {
        let config = RetryConfig::default();

        // Exponential backoff: 500ms, 1000ms, 2000ms
        assert_eq!(config.delay_for_attempt(0).as_millis(), 500);
        assert_eq!(config.delay_for_attempt(1).as_millis(), 1000);
        assert_eq!(config.delay_for_attempt(2).as_millis(), 2000);
    }

    #[test]
    fn test_delay_capped_at_max() {
        let config = RetryConfig::default()
            .with_jitter(true)
            .with_max_delay(Duration::from_secs(1));

        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(1));
        assert_eq!(config.jittered_delay(10, 42), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(usize::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_is_bounded_and_reproducible() {
        let config = RetryConfig::default().with_jitter(true);
        let base = config.delay_for_attempt(1);

        let delays: Vec<Duration> = (0..32).map(|seed| config.jittered_delay(1, seed)).collect();
        for (seed, delay) in delays.iter().enumerate() {
            assert!(*delay >= base && *delay <= base.mul_f64(1.25), "{delay:?}");
            assert_eq!(*delay, config.jittered_delay(1, seed as u64));
        }
        assert!(delays.iter().any(|d| *d != delays[0]));

        let plain = RetryConfig::default();
        assert_eq!(plain.jittered_delay(1, 7), plain.delay_for_attempt(1));
    }

    #[test]
    fn test_validate() {
        assert!(RetryConfig::default().validate().is_ok());
        let slow_start = RetryConfig::default()
            .with_initial_delay(Duration::from_secs(60))
            .with_max_delay(Duration::from_secs(1));
        assert!(slow_start.validate().is_err());
        let shrinking = RetryConfig {
            backoff_multiplier: 0.5,
            ..RetryConfig::default()
        };
        assert!(shrinking.validate().is_err());
    }

    #[test]
    fn test_http_status_classification() {
        assert_eq!(CallErrorKind::from_http_status(200), None);
        assert_eq!(
            CallErrorKind::from_http_status(429),
            Some(CallErrorKind::RateLimited)
        );
        assert!(CallErrorKind::from_http_status(503).unwrap().is_transient());
        assert!(CallErrorKind::from_http_status(400).unwrap().is_fatal());
        assert!(CallErrorKind::from_http_status(401).unwrap().is_fatal());
        assert!(CallErrorKind::from_http_status(404).unwrap().is_fatal());
    }

    #[test]
    fn test_retry_state() {
        let mut state = RetryState::new(RetryConfig::default().with_max_attempts(3));
        assert_eq!(state.remaining_attempts(), 3);

        state.begin_attempt();
        state.record_failure(ErrorClass::Transient);
        assert!(state.should_retry());
        let delay = state.schedule_backoff(None);
        assert_eq!(delay, Duration::from_millis(500));
        assert!(state.backoff_deadline().is_some());

        state.begin_attempt();
        assert_eq!(state.schedule_backoff(Some(Duration::from_secs(5))), Duration::from_secs(5));

        state.begin_attempt();
        assert!(!state.should_retry());
        assert_eq!(state.remaining_attempts(), 0);
        assert_eq!(state.backoffs(), 2);
        assert_eq!(state.last_error_kind(), Some(ErrorClass::Transient));
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_transient_failures_then_success() {
        let attempts = AtomicUsize::new(0);
        let delays = Arc::new(Mutex::new(Vec::new()));
        let recorded = delays.clone();
        let controller = RetryController::new(fast_config()).with_observer(Arc::new(
            move |event: &AttemptEvent| {
                if let Some(delay) = event.delay {
                    recorded.lock().unwrap().push(delay);
                }
            },
        ));

        let result = controller
            .call(|| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(CallError::connection_reset("reset by peer"))
                    } else {
                        Ok("success")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(
            *delays.lock().unwrap(),
            vec![Duration::from_millis(10), Duration::from_millis(20)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_not_retried() {
        let attempts = AtomicUsize::new(0);
        let controller = RetryController::new(fast_config());

        let result: Result<(), _> = controller
            .call(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(CallError::authentication("bad key")) }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Fatal { attempt: 1, .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_carries_last_error() {
        let attempts = AtomicUsize::new(0);
        let config = fast_config().with_max_attempts(2);

        let result: Result<(), _> = with_retry(&config, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move { Err(CallError::timeout(Duration::from_secs(n as u64 + 1))) }
        })
        .await;

        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 2);
                assert_eq!(last.kind, CallErrorKind::Timeout);
                assert!(last.message.contains("2s"));
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_is_honoured() {
        let attempts = AtomicUsize::new(0);
        let delays = Arc::new(Mutex::new(Vec::new()));
        let recorded = delays.clone();
        let controller = RetryController::new(fast_config()).with_observer(Arc::new(
            move |event: &AttemptEvent| {
                if let Some(delay) = event.delay {
                    recorded.lock().unwrap().push(delay);
                }
            },
        ));

        let result = controller
            .call(|| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(CallError::rate_limited(Some(Duration::from_secs(2))))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(*delays.lock().unwrap(), vec![Duration::from_secs(2)]);
    }
}
