//! Retry coordination
//!
//! Runs a unit's attempts and applies timeouts to its body. Shared
//! resources are held by the caller for the whole loop; only the
//! per-attempt context is rebuilt.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::context::TestContext;
use crate::error::EngineError;
use crate::models::{EngineEvent, EventBus, Failure, Outcome, TestUnit};

/// Outcome of a single attempt
#[derive(Clone, Debug, PartialEq)]
pub enum AttemptOutcome {
    Passed,
    Skipped(String),
    Failed(Failure),
}

/// Final verdict after all attempts
#[derive(Clone, Debug, PartialEq)]
pub enum RetryVerdict {
    Passed { attempts: u32 },
    Failed { failure: Failure, attempts: u32 },
    Skipped { reason: String, attempts: u32 },
}

impl RetryVerdict {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryVerdict::Passed { attempts }
            | RetryVerdict::Failed { attempts, .. }
            | RetryVerdict::Skipped { attempts, .. } => *attempts,
        }
    }
}

#[derive(Clone)]
pub struct RetryCoordinator {
    default_timeout: Option<Duration>,
    grace: Duration,
    events: EventBus,
}

impl RetryCoordinator {
    pub fn new(default_timeout: Option<Duration>, grace: Duration, events: EventBus) -> Self {
        Self {
            default_timeout,
            grace,
            events,
        }
    }

    /// Run up to `retry_budget + 1` attempts, stopping at the first pass or skip
    pub async fn execute<F, Fut>(&self, unit: &TestUnit, mut attempt: F) -> RetryVerdict
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = AttemptOutcome>,
    {
        let max_attempts = unit.retry_budget.saturating_add(1);
        let mut last_failure = None;

        for number in 1..=max_attempts {
            if number > 1 {
                self.events.publish(EngineEvent::Retrying {
                    id: unit.id.clone(),
                    attempt: number,
                });
            }
            self.events.publish(EngineEvent::Running {
                id: unit.id.clone(),
                attempt: number,
            });
            debug!("{} attempt {}/{}", unit.id, number, max_attempts);

            match attempt(number).await {
                AttemptOutcome::Passed => return RetryVerdict::Passed { attempts: number },
                AttemptOutcome::Skipped(reason) => {
                    return RetryVerdict::Skipped {
                        reason,
                        attempts: number,
                    }
                }
                AttemptOutcome::Failed(failure) => {
                    if number < max_attempts {
                        info!("{} failed attempt {}, retrying: {}", unit.id, number, failure);
                    }
                    last_failure = Some(failure);
                }
            }
        }

        RetryVerdict::Failed {
            failure: last_failure.unwrap_or_else(|| Failure::body("no attempt was made")),
            attempts: max_attempts,
        }
    }

    /// Execute the body once, bounded by the unit's timeout
    ///
    /// On timeout the body is cancelled and given the grace period to unwind
    /// before the attempt is reported as timed out.
    pub async fn run_body(&self, unit: &TestUnit, ctx: TestContext) -> AttemptOutcome {
        let mut handle = tokio::spawn((unit.body)(ctx));

        let joined = match unit.timeout.or(self.default_timeout) {
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    handle.abort();
                    if tokio::time::timeout(self.grace, handle).await.is_err() {
                        warn!("{} did not unwind within {}ms of cancellation", unit.id, self.grace.as_millis());
                    }
                    let error = EngineError::Timeout(limit);
                    warn!("{} {}", unit.id, error);
                    return AttemptOutcome::Failed(error.into());
                }
            },
            None => handle.await,
        };

        match joined {
            Ok(Outcome::Pass) => AttemptOutcome::Passed,
            Ok(Outcome::Skip(reason)) => AttemptOutcome::Skipped(reason),
            Ok(Outcome::Fail(message)) | Ok(Outcome::Retry(message)) => {
                AttemptOutcome::Failed(EngineError::BodyFailure(message).into())
            }
            Err(e) if e.is_panic() => {
                AttemptOutcome::Failed(EngineError::BodyFailure(panic_message(e)).into())
            }
            Err(e) => AttemptOutcome::Failed(EngineError::BodyFailure(e.to_string()).into()),
        }
    }
}

fn panic_message(error: tokio::task::JoinError) -> String {
    let payload = error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextSeed;
    use crate::models::FailureKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn coordinator() -> RetryCoordinator {
        RetryCoordinator::new(None, Duration::from_millis(50), EventBus::new())
    }

    async fn run(coordinator: &RetryCoordinator, unit: &TestUnit) -> RetryVerdict {
        let seed = ContextSeed::default();
        coordinator
            .execute(unit, |n| coordinator.run_body(unit, seed.attempt(unit, n)))
            .await
    }

    #[tokio::test]
    async fn test_passes_on_later_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let unit = TestUnit::new("flaky").retry(3).body(move |ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if ctx.attempt() < 3 {
                    Outcome::Fail("not yet".into())
                } else {
                    Outcome::Pass
                }
            }
        });

        let verdict = run(&coordinator(), &unit).await;
        assert_eq!(verdict, RetryVerdict::Passed { attempts: 3 });
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_budget_reports_last_error() {
        let unit = TestUnit::new("broken")
            .retry(1)
            .body(|ctx| async move { Outcome::Fail(format!("attempt {}", ctx.attempt())) });

        match run(&coordinator(), &unit).await {
            RetryVerdict::Failed { failure, attempts } => {
                assert_eq!(attempts, 2);
                assert_eq!(failure.kind, FailureKind::Body);
                assert!(failure.message.ends_with("attempt 2"));
            }
            other => panic!("unexpected verdict {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_explicit_retry_outcome_consumes_budget() {
        let unit = TestUnit::new("r").retry(1).body(|ctx| async move {
            if ctx.attempt() == 1 {
                Outcome::Retry("warming up".into())
            } else {
                Outcome::Pass
            }
        });
        assert_eq!(run(&coordinator(), &unit).await.attempts(), 2);
    }

    #[tokio::test]
    async fn test_timeout_cancels_body() {
        let unit = TestUnit::new("slow")
            .timeout(Duration::from_millis(20))
            .body(|_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Outcome::Pass
            });

        match run(&coordinator(), &unit).await {
            RetryVerdict::Failed { failure, attempts } => {
                assert_eq!(attempts, 1);
                assert_eq!(failure.kind, FailureKind::Timeout);
            }
            other => panic!("unexpected verdict {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_panicking_body_is_a_body_failure() {
        let unit = TestUnit::new("boom").body(|ctx| async move {
            assert!(ctx.attempt() > 1, "kaboom");
            Outcome::Pass
        });
        match run(&coordinator(), &unit).await {
            RetryVerdict::Failed { failure, .. } => {
                assert_eq!(failure.kind, FailureKind::Body);
                assert!(failure.message.contains("kaboom"));
            }
            other => panic!("unexpected verdict {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_events_published() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let coordinator = RetryCoordinator::new(None, Duration::from_millis(10), events);
        let unit = TestUnit::new("e")
            .retry(1)
            .body(|ctx| async move {
                if ctx.attempt() == 1 {
                    Outcome::Fail("x".into())
                } else {
                    Outcome::Pass
                }
            });
        run(&coordinator, &unit).await;

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                EngineEvent::Running { id: "e".into(), attempt: 1 },
                EngineEvent::Retrying { id: "e".into(), attempt: 2 },
                EngineEvent::Running { id: "e".into(), attempt: 2 },
            ]
        );
    }
}
