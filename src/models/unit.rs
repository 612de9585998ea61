//! Test unit descriptors
//!
//! A `TestUnit` is one schedulable test instance as handed over by discovery.
//! Inherited hooks and constraints are already flattened into it.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::Outcome;
use crate::context::TestContext;

/// Executable test body, invoked once per attempt
pub type TestBody = Arc<dyn Fn(TestContext) -> BoxFuture<'static, Outcome> + Send + Sync>;

/// Which instances of a dependency target a declaration matches
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceMatch {
    /// Exactly the unit whose id equals the target
    Same,
    /// Every unit whose base name equals the target
    Any,
}

/// A declared test-to-test dependency
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    pub target: String,
    pub instance: InstanceMatch,
    #[serde(default)]
    pub proceed_on_failure: bool,
}

impl DependencySpec {
    /// Depend on the unit with this exact id
    pub fn on(id: impl Into<String>) -> Self {
        Self {
            target: id.into(),
            instance: InstanceMatch::Same,
            proceed_on_failure: false,
        }
    }

    /// Depend on every instance sharing this base name
    pub fn on_any(name: impl Into<String>) -> Self {
        Self {
            target: name.into(),
            instance: InstanceMatch::Any,
            proceed_on_failure: false,
        }
    }

    /// Run the dependent even when this dependency does not pass
    pub fn proceed_on_failure(mut self) -> Self {
        self.proceed_on_failure = true;
        self
    }
}

impl fmt::Display for DependencySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.instance {
            InstanceMatch::Same => write!(f, "{}", self.target),
            InstanceMatch::Any => write!(f, "any instance of {}", self.target),
        }
    }
}

/// Sharing scope of a shared resource request
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharedScope {
    /// A fresh instance per request
    None,
    /// Shared by every request carrying the same key
    Keyed(String),
    /// Shared by the tests of one class
    PerClass,
    /// Shared by the tests of one assembly
    PerAssembly,
    /// Shared by the whole session
    PerSession,
}

impl fmt::Display for SharedScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SharedScope::None => write!(f, "none"),
            SharedScope::Keyed(key) => write!(f, "keyed:{key}"),
            SharedScope::PerClass => write!(f, "class"),
            SharedScope::PerAssembly => write!(f, "assembly"),
            SharedScope::PerSession => write!(f, "session"),
        }
    }
}

/// A (resource-type, scope) pair requested by a test or by another resource
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub resource: String,
    pub scope: SharedScope,
}

impl ResourceRequest {
    pub fn new(resource: impl Into<String>, scope: SharedScope) -> Self {
        Self {
            resource: resource.into(),
            scope,
        }
    }
}

/// Named concurrency cap shared across tests
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParallelLimit {
    pub name: String,
    pub limit: usize,
}

impl ParallelLimit {
    pub fn new(name: impl Into<String>, limit: usize) -> Self {
        Self {
            name: name.into(),
            limit: limit.max(1),
        }
    }
}

/// Lifecycle state of a test unit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestState {
    Discovered,
    Pending,
    Ready,
    Running,
    Retrying { attempt: u32 },
    Passed,
    Failed,
    Skipped,
}

impl TestState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TestState::Passed | TestState::Failed | TestState::Skipped
        )
    }
}

impl fmt::Display for TestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestState::Discovered => write!(f, "discovered"),
            TestState::Pending => write!(f, "pending"),
            TestState::Ready => write!(f, "ready"),
            TestState::Running => write!(f, "running"),
            TestState::Retrying { attempt } => write!(f, "retrying (attempt {attempt})"),
            TestState::Passed => write!(f, "passed"),
            TestState::Failed => write!(f, "failed"),
            TestState::Skipped => write!(f, "skipped"),
        }
    }
}

pub const DEFAULT_CLASS: &str = "Default";
pub const DEFAULT_ASSEMBLY: &str = "default";

/// One schedulable, executable test instance
#[derive(Clone)]
pub struct TestUnit {
    /// Stable unique identity
    pub id: String,
    /// Base name shared by every instance of the same test
    pub name: String,
    pub class_name: String,
    pub assembly: String,
    pub dependencies: Vec<DependencySpec>,
    pub constraint_keys: Vec<String>,
    /// Admission order among waiting members of a constraint group
    pub constraint_order: i32,
    pub resources: Vec<ResourceRequest>,
    pub retry_budget: u32,
    pub parallel_limit: Option<ParallelLimit>,
    /// Units of one parallel group never overlap units of another
    pub parallel_group: Option<String>,
    pub timeout: Option<Duration>,
    pub skip_reason: Option<String>,
    /// False when the active selection filtered this test out
    pub selected: bool,
    pub body: TestBody,
}

impl TestUnit {
    /// Create a unit whose body passes immediately
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            class_name: DEFAULT_CLASS.to_string(),
            assembly: DEFAULT_ASSEMBLY.to_string(),
            dependencies: Vec::new(),
            constraint_keys: Vec::new(),
            constraint_order: 0,
            resources: Vec::new(),
            retry_budget: 0,
            parallel_limit: None,
            parallel_group: None,
            timeout: None,
            skip_reason: None,
            selected: true,
            body: Arc::new(|_| async { Outcome::Pass }.boxed()),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn in_class(mut self, class_name: impl Into<String>) -> Self {
        self.class_name = class_name.into();
        self
    }

    pub fn in_assembly(mut self, assembly: impl Into<String>) -> Self {
        self.assembly = assembly.into();
        self
    }

    pub fn depends_on(mut self, dependency: DependencySpec) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn constraint_key(mut self, key: impl Into<String>) -> Self {
        self.constraint_keys.push(key.into());
        self
    }

    pub fn constraint_order(mut self, order: i32) -> Self {
        self.constraint_order = order;
        self
    }

    pub fn resource(mut self, resource: impl Into<String>, scope: SharedScope) -> Self {
        self.resources.push(ResourceRequest::new(resource, scope));
        self
    }

    pub fn retry(mut self, budget: u32) -> Self {
        self.retry_budget = budget;
        self
    }

    pub fn parallel_limit(mut self, name: impl Into<String>, limit: usize) -> Self {
        self.parallel_limit = Some(ParallelLimit::new(name, limit));
        self
    }

    pub fn parallel_group(mut self, group: impl Into<String>) -> Self {
        self.parallel_group = Some(group.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn skip(mut self, reason: impl Into<String>) -> Self {
        self.skip_reason = Some(reason.into());
        self
    }

    pub fn deselected(mut self) -> Self {
        self.selected = false;
        self
    }

    /// Set the test body
    pub fn body<F, Fut>(mut self, body: F) -> Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        self.body = Arc::new(move |ctx| body(ctx).boxed());
        self
    }
}

impl fmt::Debug for TestUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestUnit")
            .field("id", &self.id)
            .field("class_name", &self.class_name)
            .field("assembly", &self.assembly)
            .field("dependencies", &self.dependencies)
            .field("constraint_keys", &self.constraint_keys)
            .field("resources", &self.resources)
            .field("retry_budget", &self.retry_budget)
            .field("parallel_limit", &self.parallel_limit)
            .field("parallel_group", &self.parallel_group)
            .field("timeout", &self.timeout)
            .field("selected", &self.selected)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for TestUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.class_name, self.id)
    }
}
