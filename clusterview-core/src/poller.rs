//! Bounded polling of a condition against an asynchronously converging system
//!
//! A [`ConditionPoller`] waits `initial_delay`, then evaluates a predicate every
//! `poll_interval` until it reports [`Observation::Satisfied`], the `timeout`
//! budget runs out, or its cancellation token fires. Time is read through an
//! injectable [`Clock`] so tests can run on virtual time.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result, Transient};

/// Retry budget for one verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub initial_delay: Duration,
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub max_attempts: Option<u32>,
}

impl PollPolicy {
    #[must_use]
    pub const fn new(initial_delay: Duration, poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            initial_delay,
            poll_interval,
            timeout,
            max_attempts: None,
        }
    }

    /// 2s initial delay, 10s interval, 5 minute budget
    #[must_use]
    pub const fn standard() -> Self {
        Self::new(
            Duration::from_secs(2),
            Duration::from_secs(10),
            Duration::from_secs(300),
        )
    }

    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(Error::Configuration(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        if self.max_attempts == Some(0) {
            return Err(Error::Configuration(
                "max attempts must be at least one when set".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Result of one predicate evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation<T> {
    /// Terminal: the condition holds
    Satisfied(T),
    /// Not ready yet; the value is kept as the latest diagnostic snapshot
    Unsatisfied(T),
}

impl Observation<bool> {
    #[must_use]
    pub const fn from_bool(ready: bool) -> Self {
        if ready {
            Self::Satisfied(true)
        } else {
            Self::Unsatisfied(false)
        }
    }
}

/// Most recent thing the predicate produced before the poller gave up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LastObservation<T, E> {
    Value(T),
    Error(E),
}

/// Terminal state of a poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T, E> {
    Succeeded(T),
    TimedOut(Option<LastObservation<T, E>>),
    Cancelled,
}

impl<T, E> PollOutcome<T, E> {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    /// The succeeded value, or the last unsatisfied value seen before timing out
    #[must_use]
    pub fn last_value(&self) -> Option<&T> {
        match self {
            Self::Succeeded(value) | Self::TimedOut(Some(LastObservation::Value(value))) => Some(value),
            _ => None,
        }
    }
}

/// Source of time for the poller
#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;

    async fn sleep(&self, duration: Duration);
}

/// Real time through tokio (honours paused time in tests)
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual time: `sleep` returns immediately after advancing the clock
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, duration: Duration) {
        *self.offset.lock() += duration;
    }

    /// Virtual time elapsed since creation
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

/// Bounded-retry evaluator of a predicate
#[derive(Debug, Clone)]
pub struct ConditionPoller {
    policy: PollPolicy,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    description: String,
}

impl ConditionPoller {
    /// Create a poller on tokio time with its own cancellation token
    pub fn new(policy: PollPolicy) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            policy,
            clock: Arc::new(TokioClock),
            cancel: CancellationToken::new(),
            description: "condition".to_string(),
        })
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Human-readable name of the condition, used in logs
    #[must_use]
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub const fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Evaluate `check` until it is satisfied, the budget is spent, or the poll is cancelled.
    ///
    /// Transient errors are logged and retried. Any other error aborts the
    /// poll and is returned as `Err`.
    pub async fn until<T, E, F, Fut>(&self, mut check: F) -> std::result::Result<PollOutcome<T, E>, E>
    where
        E: Transient + fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<Observation<T>, E>>,
    {
        let policy = self.policy;
        let start = self.clock.now();

        if policy.timeout < policy.initial_delay {
            debug!(
                condition = %self.description,
                "Timeout is shorter than the initial delay, not evaluating"
            );
            return Ok(PollOutcome::TimedOut(None));
        }

        if !policy.initial_delay.is_zero() && !self.pause(policy.initial_delay).await {
            info!(condition = %self.description, "Poll cancelled during initial delay");
            return Ok(PollOutcome::Cancelled);
        }

        let mut attempts: u32 = 0;
        let mut last = None;

        loop {
            if self.cancel.is_cancelled() {
                info!(condition = %self.description, attempts, "Poll cancelled");
                return Ok(PollOutcome::Cancelled);
            }

            let elapsed = self.elapsed_since(start);
            if elapsed > policy.timeout || policy.max_attempts.is_some_and(|max| attempts >= max) {
                return Ok(self.give_up(attempts, elapsed, last));
            }

            attempts += 1;
            info!(
                condition = %self.description,
                attempt = attempts,
                elapsed_ms = millis(elapsed),
                remaining_ms = millis(policy.timeout.saturating_sub(elapsed)),
                "Evaluating condition"
            );

            let result = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    info!(condition = %self.description, attempts, "Poll cancelled during evaluation");
                    return Ok(PollOutcome::Cancelled);
                }
                result = check() => result,
            };

            match result {
                Ok(Observation::Satisfied(value)) => {
                    info!(
                        condition = %self.description,
                        attempts,
                        elapsed_ms = millis(self.elapsed_since(start)),
                        "Condition satisfied"
                    );
                    return Ok(PollOutcome::Succeeded(value));
                }
                Ok(Observation::Unsatisfied(value)) => {
                    debug!(condition = %self.description, attempt = attempts, "Condition not met yet");
                    last = Some(LastObservation::Value(value));
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        condition = %self.description,
                        attempt = attempts,
                        error = %e,
                        "Condition check failed, retrying"
                    );
                    last = Some(LastObservation::Error(e));
                }
                Err(e) => {
                    warn!(
                        condition = %self.description,
                        attempt = attempts,
                        error = %e,
                        "Condition check failed with a non-retryable error"
                    );
                    return Err(e);
                }
            }

            // Skip a sleep that could only end past the budget
            let elapsed = self.elapsed_since(start);
            let exhausted = policy.max_attempts.is_some_and(|max| attempts >= max);
            if exhausted || elapsed + policy.poll_interval > policy.timeout {
                return Ok(self.give_up(attempts, elapsed, last));
            }

            if !self.pause(policy.poll_interval).await {
                info!(condition = %self.description, attempts, "Poll cancelled while waiting");
                return Ok(PollOutcome::Cancelled);
            }
        }
    }

    /// Sleep unless cancelled first; returns false on cancellation
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            () = self.clock.sleep(duration) => true,
        }
    }

    fn elapsed_since(&self, start: Instant) -> Duration {
        self.clock.now().saturating_duration_since(start)
    }

    fn give_up<T, E>(
        &self,
        attempts: u32,
        elapsed: Duration,
        last: Option<LastObservation<T, E>>,
    ) -> PollOutcome<T, E> {
        warn!(
            condition = %self.description,
            attempts,
            elapsed_ms = millis(elapsed),
            timeout_ms = millis(self.policy.timeout),
            "Condition not met within budget"
        );
        PollOutcome::TimedOut(last)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum TestError {
        NotYet(String),
        Broken(String),
    }

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Self::NotYet(msg) => write!(f, "not yet: {msg}"),
                Self::Broken(msg) => write!(f, "broken: {msg}"),
            }
        }
    }

    impl Transient for TestError {
        fn is_transient(&self) -> bool {
            matches!(self, Self::NotYet(_))
        }
    }

    fn ticks(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn manual_poller(policy: PollPolicy) -> (ConditionPoller, ManualClock) {
        let clock = ManualClock::new();
        let poller = ConditionPoller::new(policy)
            .unwrap()
            .with_clock(Arc::new(clock.clone()));
        (poller, clock)
    }

    #[test]
    fn test_zero_interval_rejected() {
        let policy = PollPolicy::new(Duration::ZERO, Duration::ZERO, ticks(5));
        let err = ConditionPoller::new(policy).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_zero_max_attempts_rejected() {
        let policy = PollPolicy::new(Duration::ZERO, ticks(1), ticks(5)).with_max_attempts(0);
        assert!(policy.validate().is_err());
    }

    #[tokio::test]
    async fn test_timeout_shorter_than_initial_delay() {
        let (poller, clock) = manual_poller(PollPolicy::new(ticks(10), ticks(1), ticks(5)));
        let calls = AtomicU32::new(0);

        let outcome = poller
            .until(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>(Observation::from_bool(true))
            })
            .await
            .unwrap();

        assert_eq!(outcome, PollOutcome::TimedOut(None));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_states() {
        let (poller, clock) = manual_poller(PollPolicy::new(Duration::ZERO, ticks(1), ticks(5)));
        let calls = AtomicU32::new(0);

        let outcome = poller
            .until(|| async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 4 {
                    Ok::<_, TestError>(Observation::Unsatisfied(n))
                } else {
                    Ok(Observation::Satisfied(n))
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome, PollOutcome::Succeeded(4));
        assert_eq!(clock.elapsed(), ticks(3));
    }

    #[tokio::test]
    async fn test_timed_out_carries_last_value() {
        let (poller, clock) = manual_poller(PollPolicy::new(ticks(1), ticks(1), ticks(4)));
        let calls = AtomicU32::new(0);

        let outcome = poller
            .until(|| async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok::<_, TestError>(Observation::Unsatisfied(format!("attempt {n}")))
            })
            .await
            .unwrap();

        // Attempts at t = 1, 2, 3, 4
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(
            outcome,
            PollOutcome::TimedOut(Some(LastObservation::Value("attempt 4".to_string())))
        );
        assert_eq!(clock.elapsed(), ticks(4));
    }

    #[tokio::test]
    async fn test_timed_out_carries_last_transient_error() {
        let (poller, _clock) = manual_poller(PollPolicy::new(Duration::ZERO, ticks(2), ticks(5)));
        let calls = AtomicU32::new(0);

        let outcome = poller
            .until(|| async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n == 1 {
                    Ok(Observation::Unsatisfied(()))
                } else {
                    Err(TestError::NotYet(format!("peer down on attempt {n}")))
                }
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            outcome,
            PollOutcome::TimedOut(Some(LastObservation::Error(TestError::NotYet(
                "peer down on attempt 3".to_string()
            ))))
        );
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let (poller, _clock) = manual_poller(PollPolicy::new(Duration::ZERO, ticks(1), ticks(5)));
        let calls = AtomicU32::new(0);

        let result = poller
            .until(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<Observation<()>, _>(TestError::Broken("bad selector".to_string()))
            })
            .await;

        assert_eq!(result.unwrap_err(), TestError::Broken("bad selector".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_max_attempts_caps_evaluations() {
        let policy = PollPolicy::new(Duration::ZERO, ticks(1), ticks(60)).with_max_attempts(3);
        let (poller, clock) = manual_poller(policy);
        let calls = AtomicU32::new(0);

        let outcome = poller
            .until(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>(Observation::from_bool(false))
            })
            .await
            .unwrap();

        assert!(matches!(outcome, PollOutcome::TimedOut(Some(LastObservation::Value(false)))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(clock.elapsed(), ticks(2));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let (poller, _clock) = manual_poller(PollPolicy::new(Duration::ZERO, ticks(1), ticks(5)));
        poller.cancellation_token().cancel();

        let outcome = poller
            .until(|| async { Ok::<_, TestError>(Observation::from_bool(true)) })
            .await
            .unwrap();

        assert_eq!(outcome, PollOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_wait_returns_within_interval() {
        let policy = PollPolicy::new(Duration::ZERO, Duration::from_secs(10), Duration::from_secs(60));
        let poller = ConditionPoller::new(policy).unwrap();
        let token = poller.cancellation_token();
        let calls = Arc::new(AtomicU32::new(0));

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            token.cancel();
        });

        let started = Instant::now();
        let counter = Arc::clone(&calls);
        let outcome = poller
            .until(move || {
                let counter = Arc::clone(&counter);
                async move {
                    // Would succeed on the second attempt if the wait were not cancelled
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok::<_, TestError>(Observation::from_bool(n >= 2))
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome, PollOutcome::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_in_flight_check() {
        let policy = PollPolicy::new(Duration::ZERO, Duration::from_secs(1), Duration::from_secs(60));
        let poller = ConditionPoller::new(policy).unwrap();
        let token = poller.cancellation_token();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            token.cancel();
        });

        let outcome = poller
            .until(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, TestError>(Observation::from_bool(true))
            })
            .await
            .unwrap();

        assert_eq!(outcome, PollOutcome::Cancelled);
    }

    #[test]
    fn test_last_value_accessor() {
        let done: PollOutcome<u32, TestError> = PollOutcome::Succeeded(7);
        assert_eq!(done.last_value(), Some(&7));
        assert!(done.is_success());

        let timed_out: PollOutcome<u32, TestError> =
            PollOutcome::TimedOut(Some(LastObservation::Error(TestError::NotYet("x".into()))));
        assert_eq!(timed_out.last_value(), None);
        assert!(!timed_out.is_success());
    }
}
