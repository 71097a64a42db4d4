//! Bounded-retry execution with exponential backoff and jitter.
//!
//! The executor owns one circuit breaker per guarded target and never
//! raises: every call returns a [`RetryOutcome`] carrying data-or-error
//! plus the full attempt trail, so callers can distinguish an exhausted
//! retry budget from a breaker rejection without unwinding.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::breaker::{Admission, CircuitBreaker};
use super::classify::{classify, ErrorKind};
use crate::error::{Error, Result};

/// Retry policy, merged per call with the executor defaults.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// When set, only these kinds are considered retryable.
    pub retryable_kinds: Option<Vec<ErrorKind>>,
    /// Custom veto: returning false stops retrying even for a retryable class.
    pub retry_if: Option<Arc<dyn Fn(&Error) -> bool + Send + Sync>>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("retryable_kinds", &self.retryable_kinds)
            .field("retry_if", &self.retry_if.is_some())
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            retryable_kinds: None,
            retry_if: None,
        }
    }
}

/// One entry in the per-call attempt log.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    pub index: u32,
    /// Backoff delay slept after this attempt failed (zero for the last).
    pub delay: Duration,
    pub error: String,
    pub retryable: bool,
}

/// Discriminated result of a retried call.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    /// Failed attempts, in order. Empty when the first attempt succeeded.
    pub attempts: Vec<RetryAttempt>,
    /// True when the breaker rejected the call before any invocation.
    pub circuit_open: bool,
    pub elapsed: Duration,
}

impl<T> RetryOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Snapshot of executor-wide retry statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryMetrics {
    pub total_attempts: u64,
    pub successful_retries: u64,
    pub failed_retries: u64,
    pub total_retry_time: Duration,
    pub average_retry_delay: Duration,
    pub circuit_breaker_trips: u64,
}

#[derive(Default)]
struct MetricsInner {
    total_attempts: u64,
    successful_retries: u64,
    failed_retries: u64,
    total_retry_time: Duration,
    delay_count: u64,
}

/// Executes operations with bounded retries against one guarded target.
pub struct RetryExecutor {
    policy: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
    metrics: Mutex<MetricsInner>,
    abort: Option<watch::Receiver<bool>>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            policy,
            breaker,
            metrics: Mutex::new(MetricsInner::default()),
            abort: None,
        }
    }

    /// Bind an abort signal; pending backoff sleeps resolve immediately
    /// when it fires.
    pub fn with_abort(mut self, abort: watch::Receiver<bool>) -> Self {
        self.abort = Some(abort);
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute `op` under the executor's default policy.
    pub async fn execute<T, F, Fut>(&self, context: &str, op: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.execute_with_policy(context, self.policy.clone(), op).await
    }

    /// Execute `op` with a per-call policy override.
    pub async fn execute_with_policy<T, F, Fut>(
        &self,
        context: &str,
        policy: RetryPolicy,
        mut op: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let started = Instant::now();

        match self.breaker.acquire() {
            Admission::Rejected { retry_after } => {
                debug!(
                    context,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "call rejected, circuit breaker open"
                );
                return RetryOutcome {
                    result: Err(Error::CircuitOpen(self.breaker.target().to_string())),
                    attempts: Vec::new(),
                    circuit_open: true,
                    elapsed: started.elapsed(),
                };
            }
            Admission::Admitted | Admission::Probe => {}
        }

        let mut attempts = Vec::new();

        for attempt in 0..=policy.max_attempts {
            self.metrics.lock().expect("metrics lock poisoned").total_attempts += 1;

            match op().await {
                Ok(value) => {
                    self.breaker.record_success();
                    if attempt > 0 {
                        let mut m = self.metrics.lock().expect("metrics lock poisoned");
                        m.successful_retries += 1;
                        debug!(context, attempt, "operation recovered after retry");
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                        circuit_open: false,
                        elapsed: started.elapsed(),
                    };
                }
                Err(error) => {
                    self.breaker.record_failure();
                    let class = classify(&error);
                    let retryable = attempt < policy.max_attempts
                        && class.retryable
                        && policy
                            .retryable_kinds
                            .as_ref()
                            .map_or(true, |kinds| kinds.contains(&class.kind))
                        && policy.retry_if.as_ref().map_or(true, |pred| pred(&error));

                    let delay = if retryable {
                        jittered_backoff(&policy, attempt)
                    } else {
                        Duration::ZERO
                    };

                    attempts.push(RetryAttempt {
                        index: attempt,
                        delay,
                        error: error.to_string(),
                        retryable,
                    });

                    if !retryable {
                        warn!(
                            context,
                            attempt,
                            kind = ?class.kind,
                            error = %error,
                            "giving up on operation"
                        );
                        let mut m = self.metrics.lock().expect("metrics lock poisoned");
                        m.failed_retries += 1;
                        drop(m);
                        return RetryOutcome {
                            result: Err(error),
                            attempts,
                            circuit_open: false,
                            elapsed: started.elapsed(),
                        };
                    }

                    debug!(
                        context,
                        attempt,
                        kind = ?class.kind,
                        delay_ms = delay.as_millis() as u64,
                        "attempt failed, backing off"
                    );
                    {
                        let mut m = self.metrics.lock().expect("metrics lock poisoned");
                        m.total_retry_time += delay;
                        m.delay_count += 1;
                    }

                    if !self.sleep_cancellable(delay).await {
                        if let Some(last) = attempts.last_mut() {
                            last.retryable = false;
                        }
                        let mut m = self.metrics.lock().expect("metrics lock poisoned");
                        m.failed_retries += 1;
                        drop(m);
                        return RetryOutcome {
                            result: Err(Error::Cancelled),
                            attempts,
                            circuit_open: false,
                            elapsed: started.elapsed(),
                        };
                    }
                }
            }
        }

        unreachable!("retry loop always returns from its final attempt")
    }

    /// Sleep for `delay`, returning false if the abort signal fired first.
    async fn sleep_cancellable(&self, delay: Duration) -> bool {
        match self.abort.clone() {
            Some(mut abort) => {
                if *abort.borrow() {
                    return false;
                }
                tokio::select! {
                    _ = tokio::time::sleep(delay) => true,
                    _ = abort.changed() => !*abort.borrow(),
                }
            }
            None => {
                tokio::time::sleep(delay).await;
                true
            }
        }
    }

    /// Current metrics snapshot, including breaker trips.
    pub fn metrics(&self) -> RetryMetrics {
        let m = self.metrics.lock().expect("metrics lock poisoned");
        let average_retry_delay = if m.delay_count > 0 {
            m.total_retry_time / m.delay_count as u32
        } else {
            Duration::ZERO
        };
        RetryMetrics {
            total_attempts: m.total_attempts,
            successful_retries: m.successful_retries,
            failed_retries: m.failed_retries,
            total_retry_time: m.total_retry_time,
            average_retry_delay,
            circuit_breaker_trips: self.breaker.trips(),
        }
    }

    /// Reset metrics to zero. Never happens implicitly.
    pub fn reset_metrics(&self) {
        *self.metrics.lock().expect("metrics lock poisoned") = MetricsInner::default();
    }
}

/// `min(base * 2^attempt, max)` perturbed by up to ±10% so concurrent
/// retriers do not synchronize into a storm.
fn jittered_backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exp = policy
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(policy.max_delay);
    let jitter = rand::thread_rng().gen_range(-0.10..=0.10);
    exp.mul_f64(1.0 + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn executor(max_attempts: u32, base_ms: u64) -> RetryExecutor {
        let policy = RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_secs(30),
            ..Default::default()
        };
        RetryExecutor::new(policy, Arc::new(CircuitBreaker::new("test")))
    }

    #[tokio::test(start_paused = true)]
    async fn success_on_attempt_k_invokes_k_plus_one_times() {
        let exec = executor(3, 10);
        let calls = AtomicU32::new(0);

        let outcome = exec
            .execute("test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::Network("flaky".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert!(outcome.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.attempts.len(), 2);
        assert!(!outcome.circuit_open);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempts_preserve_last_error() {
        let exec = executor(2, 10);
        let calls = AtomicU32::new(0);

        let outcome: RetryOutcome<()> = exec
            .execute("test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(Error::Timeout(format!("attempt {n}"))) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.attempts.len(), 3);
        match outcome.result {
            Err(Error::Timeout(msg)) => assert_eq!(msg, "attempt 2"),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_short_circuits_after_one_invocation() {
        let exec = executor(5, 10);
        let calls = AtomicU32::new(0);

        let outcome: RetryOutcome<()> = exec
            .execute("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(Error::Client {
                        status: 400,
                        message: "bad request".into(),
                    })
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.attempts.len(), 1);
        assert!(!outcome.attempts[0].retryable);
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_a_backoff_progression() {
        // base=1000ms, max=30s, maxAttempts=3; attempts 0,1 fail, 2 succeeds.
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            ..Default::default()
        };
        let exec = RetryExecutor::new(policy, Arc::new(CircuitBreaker::new("test")));
        let calls = AtomicU32::new(0);

        let outcome = exec
            .execute("scenario-a", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::Network("down".into()))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(outcome.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.attempts.len(), 2);

        let d0 = outcome.attempts[0].delay.as_millis() as f64;
        let d1 = outcome.attempts[1].delay.as_millis() as f64;
        assert!((900.0..=1100.0).contains(&d0), "delay 0 was {d0}ms");
        assert!((1800.0..=2200.0).contains(&d1), "delay 1 was {d1}ms");
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_b_breaker_blocks_then_recovers() {
        // threshold=5, cooldown=60s; one attempt per call.
        let breaker = Arc::new(CircuitBreaker::with_settings(
            "synthesis",
            5,
            Duration::from_secs(60),
        ));
        let policy = RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        };
        let exec = RetryExecutor::new(policy, breaker);
        let calls = AtomicU32::new(0);

        for _ in 0..5 {
            let outcome: RetryOutcome<()> = exec
                .execute("scenario-b", || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(Error::Connection("refused".into())) }
                })
                .await;
            assert!(!outcome.circuit_open);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        // Sixth call inside the cooldown: rejected without invoking.
        let outcome: RetryOutcome<()> = exec
            .execute("scenario-b", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert!(outcome.circuit_open);
        assert!(matches!(outcome.result, Err(Error::CircuitOpen(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        tokio::time::advance(Duration::from_secs(61)).await;

        let outcome = exec
            .execute("scenario-b", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert!(outcome.is_success());
        assert_eq!(exec.breaker().failure_count(), 0);
        assert_eq!(exec.metrics().circuit_breaker_trips, 1);
    }

    #[test]
    fn backoff_delay_stays_within_jitter_bounds() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(4),
            ..Default::default()
        };
        for attempt in 0..6 {
            let nominal = (1000u128 * 2u128.pow(attempt)).min(4000);
            for _ in 0..50 {
                let d = jittered_backoff(&policy, attempt).as_millis();
                let lo = nominal * 9 / 10;
                let hi = nominal * 11 / 10;
                assert!(
                    d >= lo && d <= hi,
                    "attempt {attempt}: {d}ms outside [{lo}, {hi}]"
                );
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn abort_cancels_pending_backoff() {
        let (tx, rx) = watch::channel(false);
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(3600),
            ..Default::default()
        };
        let exec = RetryExecutor::new(policy, Arc::new(CircuitBreaker::new("test")))
            .with_abort(rx);

        let handle = tokio::spawn(async move {
            exec.execute("abort-test", || async {
                Err::<(), _>(Error::Network("down".into()))
            })
            .await
        });

        tokio::task::yield_now().await;
        tx.send(true).expect("receiver alive");

        let outcome = handle.await.expect("task panicked");
        assert!(matches!(outcome.result, Err(Error::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn metrics_accumulate_and_reset() {
        let exec = executor(1, 10);
        let calls = AtomicU32::new(0);
        let _ = exec
            .execute("m", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(Error::Network("x".into()))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        let m = exec.metrics();
        assert_eq!(m.total_attempts, 2);
        assert_eq!(m.successful_retries, 1);
        assert!(m.average_retry_delay > Duration::ZERO);

        exec.reset_metrics();
        assert_eq!(exec.metrics().total_attempts, 0);
    }
}
