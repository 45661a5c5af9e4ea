use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    clients::queue::DurableQueue,
    error::{BreakerError, QueueError},
    models::{
        circuit_breaker::{CircuitBreakerConfig, CircuitSnapshot, CircuitState},
        queue::QueueEntry,
    },
};

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
    opened_at: Option<(Instant, DateTime<Utc>)>,
    trial_in_flight: bool,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            opened_at: None,
            trial_in_flight: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

/// Clears the half-open trial slot if the trial call is dropped before it resolves.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut inner = self.breaker.lock();
            inner.trial_in_flight = false;
            debug!(service = %self.breaker.service_name, "Half-open trial call abandoned");
        }
    }
}

/// Guards queue publishes. State lives in process memory and every
/// transition happens under one lock; the lock is never held across an await.
pub struct CircuitBreaker {
    service_name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(service_name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let service_name = service_name.into();
        info!(
            service = %service_name,
            failure_threshold = config.failure_threshold,
            cool_down_seconds = config.cool_down.as_secs(),
            "Circuit breaker initialized"
        );

        Self {
            service_name,
            config,
            inner: Mutex::new(BreakerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        // State stays consistent even if a holder panicked; every write is a plain field store.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publishes `entry` through the breaker. `Err(BreakerError::Open)` means
    /// the queue was not touched and the caller should take the fallback path.
    pub async fn attempt_publish(
        &self,
        queue: &dyn DurableQueue,
        entry: &QueueEntry,
    ) -> Result<(), BreakerError> {
        self.call(|| queue.push(entry)).await
    }

    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, QueueError>>,
    {
        let admission = self.admit()?;
        let mut guard = TrialGuard {
            breaker: self,
            armed: admission == Admission::Trial,
        };

        let result = operation().await;
        guard.armed = false;

        match result {
            Ok(value) => {
                self.record_success(admission);
                Ok(value)
            }
            Err(e) => {
                self.record_failure(admission, &e);
                Err(BreakerError::Queue(e))
            }
        }
    }

    fn admit(&self) -> Result<Admission, BreakerError> {
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .map(|(at, _)| at.elapsed() >= self.config.cool_down)
                    .unwrap_or(true);

                if !cooled_down {
                    debug!(service = %self.service_name, "Circuit breaker is open, short-circuiting");
                    return Err(BreakerError::Open);
                }

                info!(service = %self.service_name, "Circuit breaker half-open, probing");
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                Ok(Admission::Trial)
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    debug!(service = %self.service_name, "Trial call in flight, short-circuiting");
                    return Err(BreakerError::Open);
                }
                inner.trial_in_flight = true;
                Ok(Admission::Trial)
            }
        }
    }

    fn record_success(&self, admission: Admission) {
        let mut inner = self.lock();

        match (inner.state, admission) {
            (CircuitState::HalfOpen, Admission::Trial) => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.trial_in_flight = false;
                info!(service = %self.service_name, "Circuit breaker closed after successful trial call");
            }
            (CircuitState::Closed, _) => {
                inner.consecutive_failures = 0;
            }
            // A call admitted before the breaker opened; it says nothing about recovery.
            _ => {}
        }
    }

    fn record_failure(&self, admission: Admission, error: &QueueError) {
        let mut inner = self.lock();
        inner.last_failure_at = Some(Utc::now());

        match (inner.state, admission) {
            (CircuitState::HalfOpen, Admission::Trial) => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some((Instant::now(), Utc::now()));
                inner.trial_in_flight = false;
                warn!(
                    service = %self.service_name,
                    error = %error,
                    "Circuit breaker reopened after failed trial call"
                );
            }
            (CircuitState::Closed, _) => {
                inner.consecutive_failures += 1;
                debug!(
                    service = %self.service_name,
                    failures = inner.consecutive_failures,
                    threshold = self.config.failure_threshold,
                    error = %error,
                    "Circuit breaker failure recorded"
                );

                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some((Instant::now(), Utc::now()));
                    warn!(
                        service = %self.service_name,
                        failures = inner.consecutive_failures,
                        "Circuit breaker opened due to consecutive failures"
                    );
                }
            }
            _ => {
                inner.consecutive_failures += 1;
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();

        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            cool_down_seconds: self.config.cool_down.as_secs(),
            last_failure_at: inner.last_failure_at,
            opened_at: inner.opened_at.map(|(_, at)| at),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicU32, Ordering},
        },
        time::Duration,
    };

    use super::*;

    fn breaker(threshold: u32, cool_down_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "queue",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                cool_down: Duration::from_secs(cool_down_secs),
            },
        )
    }

    async fn fail(breaker: &CircuitBreaker, calls: &AtomicU32) -> Result<(), BreakerError> {
        breaker
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(QueueError::QueueUnavailable("down".to_string()))
            })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker, calls: &AtomicU32) -> Result<(), BreakerError> {
        breaker
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_stops_calling_the_queue() {
        let breaker = breaker(3, 30);
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            assert!(matches!(fail(&breaker, &calls).await, Err(BreakerError::Queue(_))));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        for _ in 0..10 {
            assert!(matches!(succeed(&breaker, &calls).await, Err(BreakerError::Open)));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.consecutive_failures, 3);
        assert!(snapshot.opened_at.is_some());
        assert!(snapshot.last_failure_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn success_while_closed_resets_the_count() {
        let breaker = breaker(3, 30);
        let calls = AtomicU32::new(0);

        fail(&breaker, &calls).await.unwrap_err();
        fail(&breaker, &calls).await.unwrap_err();
        succeed(&breaker, &calls).await.unwrap();
        fail(&breaker, &calls).await.unwrap_err();
        fail(&breaker, &calls).await.unwrap_err();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_trial_after_cool_down_closes() {
        let breaker = breaker(1, 30);
        let calls = AtomicU32::new(0);

        fail(&breaker, &calls).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(matches!(succeed(&breaker, &calls).await, Err(BreakerError::Open)));

        tokio::time::advance(Duration::from_secs(1)).await;
        succeed(&breaker, &calls).await.unwrap();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
        assert!(breaker.snapshot().opened_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens_for_another_cool_down() {
        let breaker = breaker(1, 30);
        let calls = AtomicU32::new(0);

        fail(&breaker, &calls).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(30)).await;

        assert!(matches!(fail(&breaker, &calls).await, Err(BreakerError::Queue(_))));
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(matches!(succeed(&breaker, &calls).await, Err(BreakerError::Open)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_trial_runs_while_half_open() {
        let breaker = Arc::new(breaker(1, 30));
        let calls = AtomicU32::new(0);
        fail(&breaker, &calls).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(30)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .call(|| async move {
                        let _ = release_rx.await;
                        Ok(())
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert!(matches!(succeed(&breaker, &calls).await, Err(BreakerError::Open)));

        release_tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_trial_frees_the_slot() {
        let breaker = breaker(1, 30);
        let calls = AtomicU32::new(0);
        fail(&breaker, &calls).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(30)).await;

        let pending = breaker.call(|| std::future::pending::<Result<(), QueueError>>());
        let _ = tokio::time::timeout(Duration::from_millis(10), pending).await;

        succeed(&breaker, &calls).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
