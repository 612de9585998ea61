//! Scripted test plans
//!
//! A `TestPlan` describes resources, hooks and tests in YAML or JSON. Test
//! bodies are scripts (sleep, fail for N attempts, flake, hang) so the
//! engine can be driven end to end from the command line.

use anyhow::{Context, Result};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::config::file::is_yaml_file;
use crate::hooks::{HookDescriptor, HookDirection, HookScope};
use crate::models::{
    DependencySpec, Outcome, ParallelLimit, ResourceRequest, TestUnit, DEFAULT_ASSEMBLY,
};
use crate::resources::ResourceDefinition;

/// Full plan file structure
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestPlan {
    /// Pause before each unit is handed to the engine
    pub discovery_delay_ms: u64,
    pub resources: Vec<PlanResource>,
    pub hooks: Vec<PlanHook>,
    pub tests: Vec<PlanTest>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanResource {
    pub name: String,
    #[serde(default)]
    pub init_ms: u64,
    #[serde(default)]
    pub fail_init: bool,
    #[serde(default)]
    pub fail_dispose: bool,
    #[serde(default)]
    pub depends_on: Vec<ResourceRequest>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanHook {
    pub name: String,
    pub scope: HookScope,
    pub direction: HookDirection,
    /// Declaring class; absent means the hook runs for every class
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub assembly: Option<String>,
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub fail: bool,
}

/// A dependency declaration: a bare id, or the detailed form
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlanDependency {
    Id(String),
    Detailed {
        on: String,
        /// Match every instance sharing this base name
        #[serde(default)]
        any: bool,
        #[serde(default)]
        proceed_on_failure: bool,
    },
}

impl PlanDependency {
    fn to_spec(&self) -> DependencySpec {
        match self {
            PlanDependency::Id(id) => DependencySpec::on(id),
            PlanDependency::Detailed {
                on,
                any,
                proceed_on_failure,
            } => {
                let spec = if *any {
                    DependencySpec::on_any(on)
                } else {
                    DependencySpec::on(on)
                };
                if *proceed_on_failure {
                    spec.proceed_on_failure()
                } else {
                    spec
                }
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanTest {
    pub id: String,
    /// Base name shared by instances; defaults to the id
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub assembly: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<PlanDependency>,
    #[serde(default)]
    pub constraint_keys: Vec<String>,
    #[serde(default)]
    pub constraint_order: i32,
    #[serde(default)]
    pub resources: Vec<ResourceRequest>,
    #[serde(default)]
    pub retry: u32,
    #[serde(default)]
    pub parallel_limit: Option<ParallelLimit>,
    #[serde(default)]
    pub parallel_group: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub skip: Option<String>,
    #[serde(default)]
    pub script: Script,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptOutcome {
    #[default]
    Pass,
    Fail,
    Skip,
}

/// Scripted behaviour of a test body
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Script {
    pub duration_ms: u64,
    /// Attempts 1..=N fail before the scripted outcome applies
    pub fail_attempts: u32,
    pub outcome: ScriptOutcome,
    /// Probability in [0, 1] that an attempt fails at random
    pub flaky_rate: f64,
    pub message: Option<String>,
    /// Never complete; only a timeout ends the attempt
    pub hang: bool,
}

impl Script {
    pub async fn play(&self, attempt: u32) -> Outcome {
        if self.hang {
            std::future::pending::<()>().await;
        }
        if self.duration_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.duration_ms)).await;
        }
        if attempt <= self.fail_attempts {
            return Outcome::Fail(format!("scripted failure on attempt {attempt}"));
        }
        if self.flaky_rate > 0.0 && rand::random::<f64>() < self.flaky_rate {
            return Outcome::Fail(format!("flaky failure on attempt {attempt}"));
        }
        let message = || self.message.clone().unwrap_or_else(|| "scripted".to_string());
        match self.outcome {
            ScriptOutcome::Pass => Outcome::Pass,
            ScriptOutcome::Fail => Outcome::Fail(message()),
            ScriptOutcome::Skip => Outcome::Skip(message()),
        }
    }
}

impl TestPlan {
    /// Load plan from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read test plan: {}", path.display()))?;

        let plan: Self = if is_yaml_file(path) {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML plan: {}", path.display()))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON plan: {}", path.display()))?
        };

        plan.validate()
            .with_context(|| format!("Invalid test plan: {}", path.display()))?;
        Ok(plan)
    }

    /// Structural checks; graph problems are left to the engine so they
    /// surface per test
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for resource in &self.resources {
            if !names.insert(resource.name.as_str()) {
                anyhow::bail!("Duplicate resource '{}'", resource.name);
            }
        }
        for test in &self.tests {
            if test.id.is_empty() {
                anyhow::bail!("Test with empty id");
            }
            if !(0.0..=1.0).contains(&test.script.flaky_rate) {
                anyhow::bail!(
                    "Test '{}': flaky_rate must be within 0 and 1, got {}",
                    test.id,
                    test.script.flaky_rate
                );
            }
            if test.parallel_limit.as_ref().is_some_and(|l| l.limit == 0) {
                anyhow::bail!("Test '{}': parallel limit must be at least 1", test.id);
            }
        }
        Ok(())
    }

    pub fn resources(&self) -> Vec<ResourceDefinition> {
        self.resources.iter().map(build_resource).collect()
    }

    pub fn hooks(&self) -> Vec<HookDescriptor> {
        self.hooks.iter().map(build_hook).collect()
    }

    /// Every planned test as a unit; those not matching `filter` are deselected
    pub fn units(&self, filter: Option<&str>) -> Vec<TestUnit> {
        self.tests
            .iter()
            .map(|test| {
                let unit = build_unit(test);
                match filter {
                    Some(pattern) if !unit.id.contains(pattern) && !unit.name.contains(pattern) => {
                        unit.deselected()
                    }
                    _ => unit,
                }
            })
            .collect()
    }

    /// Stream units as a discovery source would
    pub fn stream(&self, filter: Option<&str>) -> impl Stream<Item = TestUnit> + Send + 'static {
        let delay = Duration::from_millis(self.discovery_delay_ms);
        futures::stream::iter(self.units(filter)).then(move |unit| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            unit
        })
    }

    /// Example plan for documentation and `config init`
    pub fn example() -> Self {
        let yaml = r#"
discovery_delay_ms: 5
resources:
  - name: database
    init_ms: 50
hooks:
  - name: migrate
    scope: session
    direction: before
tests:
  - id: login
    class: AuthTests
    resources:
      - { resource: database, scope: per_session }
  - id: checkout
    class: OrderTests
    depends_on: [login]
    constraint_keys: [orders-table]
    script: { duration_ms: 20 }
  - id: refund
    class: OrderTests
    constraint_keys: [orders-table]
    retry: 2
    script: { fail_attempts: 1 }
"#;
        serde_yaml::from_str(yaml).unwrap_or_default()
    }
}

fn build_resource(plan: &PlanResource) -> ResourceDefinition {
    let name = plan.name.clone();
    let init_ms = plan.init_ms;
    let fail_init = plan.fail_init;
    let mut definition = ResourceDefinition::new(plan.name.clone(), move |ctx| {
        let name = name.clone();
        async move {
            if init_ms > 0 {
                tokio::time::sleep(Duration::from_millis(init_ms)).await;
            }
            if fail_init {
                return Err(format!("scripted initialization failure of '{name}'"));
            }
            debug!("Constructed {}", ctx.key());
            Ok(ctx.key().to_string())
        }
    });
    for request in &plan.depends_on {
        definition = definition.depends_on(request.resource.clone(), request.scope.clone());
    }
    if plan.fail_dispose {
        let name = plan.name.clone();
        definition = definition.on_dispose(move |_| {
            let name = name.clone();
            async move { Err(format!("scripted disposal failure of '{name}'")) }
        });
    }
    definition
}

fn build_hook(plan: &PlanHook) -> HookDescriptor {
    let name = plan.name.clone();
    let fail = plan.fail;
    let hook = HookDescriptor::new(plan.name.clone(), plan.scope, plan.direction, move |_| {
        let name = name.clone();
        async move {
            if fail {
                Err(format!("scripted failure in hook '{name}'"))
            } else {
                Ok(())
            }
        }
    })
    .order(plan.order);

    match (&plan.class, &plan.assembly) {
        (Some(class), assembly) => hook.in_class(
            assembly.clone().unwrap_or_else(|| DEFAULT_ASSEMBLY.to_string()),
            class.clone(),
        ),
        (None, Some(assembly)) => hook.in_assembly(assembly.clone()),
        (None, None) => hook,
    }
}

fn build_unit(test: &PlanTest) -> TestUnit {
    let script = test.script.clone();
    let mut unit = TestUnit::new(test.id.clone())
        .retry(test.retry)
        .constraint_order(test.constraint_order)
        .body(move |ctx| {
            let script = script.clone();
            async move { script.play(ctx.attempt()).await }
        });

    if let Some(name) = &test.name {
        unit = unit.with_name(name.clone());
    }
    if let Some(class) = &test.class {
        unit = unit.in_class(class.clone());
    }
    if let Some(assembly) = &test.assembly {
        unit = unit.in_assembly(assembly.clone());
    }
    for dependency in &test.depends_on {
        unit = unit.depends_on(dependency.to_spec());
    }
    for key in &test.constraint_keys {
        unit = unit.constraint_key(key.clone());
    }
    for request in &test.resources {
        unit = unit.resource(request.resource.clone(), request.scope.clone());
    }
    if let Some(limit) = &test.parallel_limit {
        unit = unit.parallel_limit(limit.name.clone(), limit.limit);
    }
    if let Some(group) = &test.parallel_group {
        unit = unit.parallel_group(group.clone());
    }
    if let Some(ms) = test.timeout_ms {
        unit = unit.timeout(Duration::from_millis(ms));
    }
    if let Some(reason) = &test.skip {
        unit = unit.skip(reason.clone());
    }
    unit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::executor::Engine;
    use crate::models::{InstanceMatch, TestStatus};
    use tempfile::tempdir;

    const PLAN: &str = r#"
resources:
  - name: db
  - name: cache
    fail_dispose: true
    depends_on:
      - { resource: db, scope: per_session }
hooks:
  - name: connect
    scope: class
    direction: before
    class: Broken
    fail: true
tests:
  - id: a
    resources:
      - { resource: cache, scope: per_class }
  - id: b
    depends_on:
      - a
      - { on: c, proceed_on_failure: true }
  - id: c
    script: { outcome: fail, message: nope }
  - id: d
    class: Broken
  - id: e
    retry: 2
    parallel_group: flaky
    script: { fail_attempts: 2 }
  - id: f
    skip: not on this platform
"#;

    fn plan() -> TestPlan {
        serde_yaml::from_str(PLAN).unwrap()
    }

    #[test]
    fn test_parse_dependency_forms() {
        let plan = plan();
        let b = plan.tests.iter().find(|t| t.id == "b").unwrap();
        let specs: Vec<_> = b.depends_on.iter().map(PlanDependency::to_spec).collect();
        assert_eq!(specs[0], DependencySpec::on("a"));
        assert!(specs[1].proceed_on_failure);
        assert_eq!(specs[1].instance, InstanceMatch::Same);
    }

    #[test]
    fn test_filter_deselects_non_matching() {
        let units = plan().units(Some("b"));
        let selected: Vec<_> = units.iter().filter(|u| u.selected).map(|u| &u.id).collect();
        assert_eq!(selected, vec!["b"]);
        assert_eq!(units.len(), 6);
        let e = units.iter().find(|u| u.id == "e").unwrap();
        assert_eq!(e.parallel_group.as_deref(), Some("flaky"));
    }

    #[test]
    fn test_validate_rejects_bad_flaky_rate() {
        let mut plan = plan();
        plan.tests[0].script.flaky_rate = 1.5;
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_load_json_plan() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plan.json");
        std::fs::write(&path, r#"{"tests": [{"id": "only"}]}"#).unwrap();
        let plan = TestPlan::load(&path).unwrap();
        assert_eq!(plan.tests.len(), 1);
        assert_eq!(plan.tests[0].script, Script::default());
    }

    #[test]
    fn test_example_plan_parses() {
        let plan = TestPlan::example();
        assert_eq!(plan.tests.len(), 3);
        assert!(plan.validate().is_ok());
    }

    #[tokio::test]
    async fn test_script_outcomes() {
        let script = Script {
            fail_attempts: 1,
            ..Script::default()
        };
        assert!(matches!(script.play(1).await, Outcome::Fail(_)));
        assert_eq!(script.play(2).await, Outcome::Pass);

        let skip = Script {
            outcome: ScriptOutcome::Skip,
            ..Script::default()
        };
        assert_eq!(skip.play(1).await, Outcome::Skip("scripted".to_string()));
    }

    #[tokio::test]
    async fn test_plan_runs_through_engine() {
        let plan = plan();
        let summary = Engine::new(EngineConfig::default().with_parallelism(4))
            .with_resources(plan.resources())
            .with_hooks(plan.hooks())
            .run(plan.stream(None))
            .await
            .unwrap();

        let status = |id: &str| summary.result(id).map(|r| r.status);
        assert_eq!(status("a"), Some(TestStatus::Passed));
        assert_eq!(status("b"), Some(TestStatus::Passed));
        assert_eq!(status("c"), Some(TestStatus::Failed));
        assert_eq!(status("d"), Some(TestStatus::Failed));
        assert_eq!(status("e"), Some(TestStatus::Passed));
        assert_eq!(status("f"), Some(TestStatus::Skipped));
        assert_eq!(summary.result("e").map(|r| r.attempts), Some(3));
        // The failing disposer is a warning, not a test failure
        assert!(summary.diagnostics.iter().any(|d| d.message.contains("cache")));
    }
}
