//! Unit runner
//!
//! Executes one admitted unit end to end: shared resources, Before hooks,
//! the retried body, After hooks, result, and finally resource release.
//! The result is recorded and published before any resource is released,
//! so disposal can never change it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

use super::retry::{AttemptOutcome, RetryCoordinator, RetryVerdict};
use crate::context::ContextSeed;
use crate::hooks::HookOrchestrator;
use crate::models::{EngineEvent, EventBus, Failure, TestResult, TestStatus, TestUnit};
use crate::resources::{ResourceKey, ResourceRegistry};
use crate::utils::Timer;

/// A unit released for execution, with everything reserved for it
#[derive(Clone, Debug)]
pub struct Job {
    pub unit: Arc<TestUnit>,
    /// Registry entries reserved at discovery
    pub keys: Vec<ResourceKey>,
    /// Terminal results of the unit's transitive dependencies
    pub dependencies: HashMap<String, TestResult>,
}

impl Job {
    pub fn new(unit: Arc<TestUnit>) -> Self {
        Self {
            unit,
            keys: Vec::new(),
            dependencies: HashMap::new(),
        }
    }
}

#[derive(Default)]
struct StoreInner {
    results: Vec<TestResult>,
    index: HashMap<String, usize>,
}

/// Terminal results in completion order
#[derive(Default)]
pub struct ResultStore {
    inner: Mutex<StoreInner>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a terminal result; the first result for an id wins
    pub fn record(&self, result: TestResult) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.index.contains_key(&result.id) {
            return false;
        }
        let position = inner.results.len();
        inner.index.insert(result.id.clone(), position);
        inner.results.push(result);
        true
    }

    pub fn get(&self, id: &str) -> Option<TestResult> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.index.get(id).map(|&i| inner.results[i].clone())
    }

    pub fn snapshot(&self) -> Vec<TestResult> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .results
            .clone()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .results
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct UnitRunner {
    registry: Arc<ResourceRegistry>,
    hooks: Arc<HookOrchestrator>,
    retry: RetryCoordinator,
    results: ResultStore,
    events: EventBus,
}

impl UnitRunner {
    pub fn new(
        registry: Arc<ResourceRegistry>,
        hooks: Arc<HookOrchestrator>,
        retry: RetryCoordinator,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            hooks,
            retry,
            results: ResultStore::new(),
            events,
        }
    }

    pub fn results(&self) -> &ResultStore {
        &self.results
    }

    /// Execute an admitted unit
    pub async fn run(&self, job: Job) -> TestResult {
        let unit = job.unit.clone();
        if let Some(reason) = unit.skip_reason.clone() {
            return self.skip(job, reason).await;
        }
        let timer = Timer::start(unit.id.clone());
        info!("Running {}", unit);

        let mut seed = ContextSeed {
            dependencies: job.dependencies.clone(),
            ..ContextSeed::default()
        };
        for key in &job.keys {
            match self.registry.acquire(key).await {
                Ok(handle) => {
                    seed.resources.insert(key.resource.clone(), handle);
                }
                Err(error) => {
                    let verdict = RetryVerdict::Failed {
                        failure: error.into(),
                        attempts: 0,
                    };
                    return self.finalize(job, verdict, timer.stop()).await;
                }
            }
        }

        if let Err(failure) = self.hooks.run_before_scopes(&unit).await {
            let verdict = RetryVerdict::Failed {
                failure,
                attempts: 0,
            };
            return self.finalize(job, verdict, timer.stop()).await;
        }

        let verdict = self
            .retry
            .execute(&unit, |number| self.attempt(&unit, &seed, number))
            .await;
        self.finalize(job, verdict, timer.stop()).await
    }

    /// One attempt: test-level Before hooks, body, test-level After hooks
    ///
    /// After hooks run even when Before hooks or the body failed.
    async fn attempt(&self, unit: &TestUnit, seed: &ContextSeed, number: u32) -> AttemptOutcome {
        let ctx = seed.attempt(unit, number);
        let outcome = match self.hooks.run_before_test(&ctx).await {
            Ok(()) => self.retry.run_body(unit, ctx.clone()).await,
            Err(failure) => AttemptOutcome::Failed(failure),
        };
        match (outcome, self.hooks.run_after_test(&ctx).await) {
            (AttemptOutcome::Passed, Err(failure)) => AttemptOutcome::Failed(failure),
            (outcome, _) => outcome,
        }
    }

    /// Report a unit skipped without running it
    pub async fn skip(&self, job: Job, reason: String) -> TestResult {
        let verdict = RetryVerdict::Skipped {
            reason,
            attempts: 0,
        };
        self.finalize(job, verdict, 0).await
    }

    /// Report a unit failed without running it
    pub async fn fail(&self, job: Job, failure: Failure) -> TestResult {
        let verdict = RetryVerdict::Failed {
            failure,
            attempts: 0,
        };
        self.finalize(job, verdict, 0).await
    }

    async fn finalize(&self, job: Job, verdict: RetryVerdict, duration_ms: u64) -> TestResult {
        let unit = &job.unit;
        let mut result = match verdict {
            RetryVerdict::Passed { attempts } => TestResult::passed(unit, attempts, duration_ms),
            RetryVerdict::Failed { failure, attempts } => {
                TestResult::failed(unit, failure, attempts, duration_ms)
            }
            RetryVerdict::Skipped { reason, attempts } => {
                TestResult::skipped(unit, reason, attempts)
            }
        };

        // Closing the class or assembly may run their After tiers
        if let Err(failure) = self.hooks.finish_test(unit).await {
            if result.status == TestStatus::Passed {
                result = TestResult::failed(unit, failure, result.attempts, duration_ms);
            } else {
                self.hooks.record(unit.id.clone(), &failure);
            }
        }

        self.publish(&result);
        self.registry.release_all(&job.keys).await;
        result
    }

    /// Record a terminal result and emit its event
    pub(crate) fn publish(&self, result: &TestResult) {
        if !self.results.record(result.clone()) {
            warn!("{} already has a terminal result", result.id);
            return;
        }
        let event = match result.status {
            TestStatus::Passed => {
                info!("✓ {} passed ({} attempt(s))", result.id, result.attempts);
                EngineEvent::Passed {
                    id: result.id.clone(),
                    attempts: result.attempts,
                }
            }
            TestStatus::Failed => {
                let failure = result
                    .failure
                    .clone()
                    .unwrap_or_else(|| Failure::body("unknown failure"));
                warn!("✗ {} failed: {}", result.id, failure);
                EngineEvent::Failed {
                    id: result.id.clone(),
                    failure,
                    attempts: result.attempts,
                }
            }
            TestStatus::Skipped => {
                let reason = result.skip_reason.clone().unwrap_or_default();
                info!("○ {} skipped: {}", result.id, reason);
                EngineEvent::Skipped {
                    id: result.id.clone(),
                    reason,
                }
            }
        };
        self.events.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{HookDescriptor, HookDirection, HookScope, HookTable};
    use crate::models::{FailureKind, Outcome, SharedScope};
    use crate::resources::{ResourceDefinition, ScopeOwner};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn runner(definitions: Vec<ResourceDefinition>, hooks: Vec<HookDescriptor>) -> UnitRunner {
        let events = EventBus::new();
        UnitRunner::new(
            Arc::new(ResourceRegistry::new(definitions).unwrap()),
            Arc::new(HookOrchestrator::new(HookTable::new(hooks))),
            RetryCoordinator::new(None, Duration::from_millis(50), events.clone()),
            events,
        )
    }

    fn job(runner: &UnitRunner, unit: TestUnit) -> Job {
        let keys = runner
            .registry
            .reserve(&unit.resources, &ScopeOwner::from(&unit));
        Job {
            keys,
            ..Job::new(Arc::new(unit))
        }
    }

    #[tokio::test]
    async fn test_retry_reuses_shared_resources() {
        let inits = Arc::new(AtomicU32::new(0));
        let counter = inits.clone();
        let pool = ResourceDefinition::new("pool", move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(7u32)
            }
        });
        let runner = runner(vec![pool], Vec::new());

        let unit = TestUnit::new("flaky")
            .resource("pool", SharedScope::PerClass)
            .retry(2)
            .body(|ctx| async move {
                if ctx.resource::<u32>("pool").map(|v| *v) != Some(7) {
                    return Outcome::Fail("resource missing".into());
                }
                if ctx.attempt() <= 2 {
                    Outcome::Fail("flaky".into())
                } else {
                    Outcome::Pass
                }
            });

        let job = job(&runner, unit);
        let result = runner.run(job).await;
        assert_eq!(result.status, TestStatus::Passed);
        assert_eq!(result.attempts, 3);
        assert_eq!(inits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disposal_failure_keeps_pass() {
        let scratch = ResourceDefinition::new("scratch", |_| async { Ok::<_, String>(()) })
            .on_dispose(|_| async { Err("cannot remove directory".to_string()) });
        let runner = runner(vec![scratch], Vec::new());

        let unit = TestUnit::new("writes").resource("scratch", SharedScope::None);
        let result = runner.run(job(&runner, unit)).await;

        assert_eq!(result.status, TestStatus::Passed);
        assert_eq!(runner.registry.diagnostics().len(), 1);
        assert_eq!(
            runner.results().get("writes").map(|r| r.status),
            Some(TestStatus::Passed)
        );
    }

    #[tokio::test]
    async fn test_resource_failure_fails_requesters_only() {
        let broken = ResourceDefinition::new("broken", |_| async {
            Err::<(), _>("refused".to_string())
        });
        let runner = runner(vec![broken], Vec::new());

        let needs = TestUnit::new("needs").resource("broken", SharedScope::PerSession);
        let result = runner.run(job(&runner, needs)).await;
        assert_eq!(result.status, TestStatus::Failed);
        assert_eq!(result.attempts, 0);
        assert_eq!(
            result.failure.map(|f| f.kind),
            Some(FailureKind::ResourceInitialization)
        );

        let free = runner.run(job(&runner, TestUnit::new("free"))).await;
        assert_eq!(free.status, TestStatus::Passed);
    }

    #[tokio::test]
    async fn test_after_test_hook_failure_fails_passing_test() {
        let hook = HookDescriptor::after("verify", HookScope::Test, |_| async {
            Err("leaked connection".to_string())
        });
        let runner = runner(Vec::new(), vec![hook]);

        let result = runner.run(job(&runner, TestUnit::new("a"))).await;
        assert_eq!(result.status, TestStatus::Failed);
        assert_eq!(
            result.failure.map(|f| f.kind),
            Some(FailureKind::Hook {
                scope: HookScope::Test,
                direction: HookDirection::After
            })
        );
    }

    #[tokio::test]
    async fn test_static_skip_runs_nothing() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let runner = runner(Vec::new(), Vec::new());
        let unit = TestUnit::new("todo").skip("not implemented").body(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Outcome::Pass }
        });

        let result = runner.run(job(&runner, unit)).await;
        assert_eq!(result.status, TestStatus::Skipped);
        assert_eq!(result.skip_reason.as_deref(), Some("not implemented"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_result_store_first_wins() {
        let store = ResultStore::new();
        let unit = TestUnit::new("a");
        assert!(store.record(TestResult::passed(&unit, 1, 1)));
        assert!(!store.record(TestResult::skipped(&unit, "late", 0)));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("a").map(|r| r.status), Some(TestStatus::Passed));
    }
}
