//! Test execution engine
//!
//! The `Engine` consumes a stream of discovered units and drives them to
//! terminal results. A single coordinator task owns the dependency graph;
//! execution happens on spawned tasks that report back over a channel.

pub mod parallel;
pub mod retry;
pub mod runner;

pub use parallel::ParallelController;
pub use retry::{AttemptOutcome, RetryCoordinator, RetryVerdict};
pub use runner::{Job, ResultStore, UnitRunner};

use chrono::Utc;
use futures::Stream;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::discovery::{DiscoveryEvent, DiscoveryPipeline};
use crate::error::EngineError;
use crate::hooks::{HookDescriptor, HookOrchestrator, HookTable};
use crate::models::{
    Diagnostic, DiagnosticKind, EngineEvent, EventBus, Failure, RunSummary, TestResult,
    TestStatus, TestUnit,
};
use crate::resources::{ResourceDefinition, ResourceKey, ResourceRegistry, ScopeOwner};
use crate::scheduling::{ConstraintScheduler, DependencyResolver, Resolution};

/// Test execution engine for one session
pub struct Engine {
    config: EngineConfig,
    resources: Vec<ResourceDefinition>,
    hooks: Vec<HookDescriptor>,
    events: EventBus,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            resources: Vec::new(),
            hooks: Vec::new(),
            events: EventBus::new(),
        }
    }

    pub fn with_resource(mut self, definition: ResourceDefinition) -> Self {
        self.resources.push(definition);
        self
    }

    pub fn with_resources(mut self, definitions: Vec<ResourceDefinition>) -> Self {
        self.resources.extend(definitions);
        self
    }

    pub fn with_hook(mut self, hook: HookDescriptor) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_hooks(mut self, hooks: Vec<HookDescriptor>) -> Self {
        self.hooks.extend(hooks);
        self
    }

    /// Receive every state transition of the session
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Run a fixed set of units
    pub async fn run_units(self, units: Vec<TestUnit>) -> Result<RunSummary, EngineError> {
        self.run(futures::stream::iter(units)).await
    }

    /// Run every unit the discovery stream yields
    ///
    /// Fails only when the resource definitions themselves are invalid;
    /// everything else is reported per test or as a session diagnostic.
    pub async fn run<S>(self, discovery: S) -> Result<RunSummary, EngineError>
    where
        S: Stream<Item = TestUnit> + Send + 'static,
    {
        let started_at = Utc::now();
        let registry = Arc::new(ResourceRegistry::new(self.resources)?);
        let hooks = Arc::new(HookOrchestrator::new(HookTable::new(self.hooks)));
        let constraints = Arc::new(ConstraintScheduler::new());
        let retry = RetryCoordinator::new(
            self.config.default_timeout(),
            self.config.timeout_grace(),
            self.events.clone(),
        );
        let runner = Arc::new(UnitRunner::new(
            registry.clone(),
            hooks.clone(),
            retry,
            self.events.clone(),
        ));
        let controller = Arc::new(ParallelController::new(
            runner.clone(),
            constraints.clone(),
            self.config.max_parallelism,
        ));

        info!(
            "Starting session (max parallelism {})",
            self.config.max_parallelism
        );
        self.events.publish(EngineEvent::SessionStarted { at: started_at });

        let pipeline = DiscoveryPipeline::new(
            self.config.discovery_timeout(),
            self.config.max_discovered_units,
        );
        let mut discovered = pipeline.spawn(discovery);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        let mut coordinator = Coordinator {
            resolver: DependencyResolver::new(self.config.max_resolution_passes),
            units: HashMap::new(),
            in_flight: 0,
            fail_fast: self.config.fail_fast,
            aborted: None,
            diagnostics: Vec::new(),
            registry: registry.clone(),
            hooks: hooks.clone(),
            constraints,
            controller,
            events: self.events.clone(),
            done: done_tx,
        };

        let mut discovering = true;
        loop {
            tokio::select! {
                event = discovered.recv(), if discovering => match event {
                    Some(DiscoveryEvent::Unit(unit)) => coordinator.discover(unit),
                    Some(DiscoveryEvent::Finished { count }) => {
                        debug!("Sealing after {} discovered unit(s)", count);
                        discovering = false;
                        coordinator.seal().await;
                    }
                    Some(DiscoveryEvent::Aborted(error)) => {
                        discovering = false;
                        coordinator.abort(error);
                        coordinator.seal().await;
                    }
                    None => {
                        discovering = false;
                        coordinator.seal().await;
                    }
                },
                Some(result) = done_rx.recv(), if coordinator.in_flight > 0 => {
                    coordinator.complete(result);
                }
                else => break,
            }
            if !discovering && coordinator.in_flight == 0 {
                break;
            }
        }

        coordinator.strand().await;
        hooks.run_after_session().await;
        registry.shutdown().await;

        let mut diagnostics = coordinator.diagnostics;
        diagnostics.extend(hooks.diagnostics());
        diagnostics.extend(registry.diagnostics());

        let summary = RunSummary::new(
            started_at,
            runner.results().snapshot(),
            diagnostics,
            coordinator.aborted,
        );
        info!(
            "Session finished - Pass: {} | Fail: {} | Skip: {} ({}ms)",
            summary.passed, summary.failed, summary.skipped, summary.duration_ms
        );
        self.events.publish(EngineEvent::SessionFinished {
            at: summary.finished_at,
            passed: summary.passed,
            failed: summary.failed,
            skipped: summary.skipped,
        });
        Ok(summary)
    }
}

/// A discovered unit and what the engine holds for it
struct Tracked {
    unit: Arc<TestUnit>,
    keys: Vec<ResourceKey>,
    /// Resource requests were valid at discovery
    valid: bool,
    enlisted: bool,
}

enum Action {
    Run,
    Skip(String),
    Fail(Failure),
}

struct Coordinator {
    resolver: DependencyResolver,
    units: HashMap<String, Tracked>,
    in_flight: usize,
    fail_fast: bool,
    aborted: Option<String>,
    diagnostics: Vec<Diagnostic>,
    registry: Arc<ResourceRegistry>,
    hooks: Arc<HookOrchestrator>,
    constraints: Arc<ConstraintScheduler>,
    controller: Arc<ParallelController>,
    events: EventBus,
    done: mpsc::UnboundedSender<TestResult>,
}

impl Coordinator {
    fn discover(&mut self, unit: TestUnit) {
        self.events.publish(EngineEvent::Discovered {
            id: unit.id.clone(),
        });
        if self.resolver.contains(&unit.id) {
            let error = EngineError::DuplicateTest(unit.id.clone());
            warn!("{}", error);
            self.diagnostics.push(Diagnostic::new(
                DiagnosticKind::Discovery,
                unit.id.clone(),
                error.to_string(),
            ));
            return;
        }

        let invalid = self.registry.validate(&unit.resources).err();
        let unit = Arc::new(unit);
        let id = unit.id.clone();
        self.units.insert(
            id.clone(),
            Tracked {
                unit: unit.clone(),
                keys: Vec::new(),
                valid: invalid.is_none(),
                enlisted: false,
            },
        );
        if unit.selected {
            self.enlist(&id);
        }

        let resolutions = match invalid {
            Some(error) => self.resolver.register_failed(&unit, error),
            None => self.resolver.register(&unit),
        };
        self.apply(resolutions);
    }

    /// Count the unit toward its hook scopes, join its constraint keys and
    /// reserve its resources
    ///
    /// Only selected or activated units get here; a dormant unit must not
    /// bridge constraint groups it will never run in.
    fn enlist(&mut self, id: &str) {
        let Some(tracked) = self.units.get_mut(id) else {
            return;
        };
        if tracked.enlisted {
            return;
        }
        tracked.enlisted = true;
        self.hooks.register(&tracked.unit);
        self.constraints.enlist(&tracked.unit.constraint_keys);
        if tracked.valid {
            tracked.keys = self
                .registry
                .reserve(&tracked.unit.resources, &ScopeOwner::from(&*tracked.unit));
        }
    }

    fn apply(&mut self, resolutions: Vec<Resolution>) {
        for resolution in resolutions {
            match resolution {
                Resolution::Activated(id) => self.enlist(&id),
                Resolution::Ready(id) => {
                    self.events.publish(EngineEvent::Ready { id: id.clone() });
                    self.dispatch(&id, Action::Run);
                }
                Resolution::Skipped { id, reason } => self.dispatch(&id, Action::Skip(reason)),
                Resolution::Failed { id, error } => {
                    self.dispatch(&id, Action::Fail(error.into()))
                }
            }
        }
    }

    fn dispatch(&mut self, id: &str, action: Action) {
        // Published units are always enlisted first
        self.enlist(id);
        let Some(tracked) = self.units.get(id) else {
            error!("Dispatch of unknown unit {}", id);
            return;
        };

        let results = self.controller.runner().results();
        let dependencies = self
            .resolver
            .transitive_dependencies(id)
            .into_iter()
            .filter_map(|dep| results.get(&dep).map(|r| (dep, r)))
            .collect();
        let job = Job {
            unit: tracked.unit.clone(),
            keys: tracked.keys.clone(),
            dependencies,
        };

        self.in_flight += 1;
        let controller = self.controller.clone();
        let done = self.done.clone();
        let unit = tracked.unit.clone();
        tokio::spawn(async move {
            let runner = controller.runner().clone();
            let task = tokio::spawn(async move {
                match action {
                    Action::Run => controller.drive(job).await,
                    Action::Skip(reason) => controller.runner().skip(job, reason).await,
                    Action::Fail(failure) => controller.runner().fail(job, failure).await,
                }
            });
            let result = match task.await {
                Ok(result) => result,
                Err(e) => {
                    error!("Execution of {} aborted: {}", unit.id, e);
                    let result = TestResult::failed(
                        &unit,
                        Failure::body(format!("engine task failed: {e}")),
                        0,
                        0,
                    );
                    runner.publish(&result);
                    result
                }
            };
            let _ = done.send(result);
        });
    }

    fn complete(&mut self, result: TestResult) {
        self.in_flight = self.in_flight.saturating_sub(1);
        if self.fail_fast && result.visible && result.status == TestStatus::Failed {
            self.controller.halt("fail-fast");
        }
        let resolutions = self.resolver.mark_terminal(&result.id, result.status);
        self.apply(resolutions);
    }

    fn abort(&mut self, error: EngineError) {
        self.diagnostics.push(Diagnostic::new(
            DiagnosticKind::Discovery,
            "discovery",
            error.to_string(),
        ));
        self.controller.halt("discovery aborted");
        self.aborted = Some(error.to_string());
    }

    /// Discovery is over: resolve what is left, then close idle scopes
    async fn seal(&mut self) {
        let resolutions = self.resolver.seal();
        self.apply(resolutions);
        self.hooks.seal().await;
        self.registry.seal().await;
    }

    /// Report units that could never be released
    async fn strand(&mut self) {
        for id in self.resolver.stranded() {
            let Some(tracked) = self.units.get(&id) else {
                continue;
            };
            let state = self
                .resolver
                .state(&id)
                .map_or_else(|| "untracked".to_string(), |s| s.to_string());
            warn!("{} never became ready (still {})", id, state);
            let job = Job {
                unit: tracked.unit.clone(),
                keys: tracked.keys.clone(),
                dependencies: HashMap::new(),
            };
            self.controller
                .runner()
                .skip(job, "dependencies never completed".to_string())
                .await;
        }
    }
}
