//! Execution contexts handed to test bodies and hooks
//!
//! A fresh `TestContext` is built for every attempt, so per-attempt state
//! never leaks into a retry. Shared resources and dependency results are
//! carried over unchanged.

use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::hooks::HookScope;
use crate::models::{TestResult, TestStatus, TestUnit};
use crate::resources::ResourceHandle;

struct ContextInner {
    id: String,
    name: String,
    class_name: String,
    assembly: String,
    attempt: u32,
    items: Mutex<HashMap<String, Value>>,
    resources: HashMap<String, ResourceHandle>,
    dependencies: HashMap<String, TestResult>,
}

/// Per-attempt view of a running test
#[derive(Clone)]
pub struct TestContext {
    inner: Arc<ContextInner>,
}

impl TestContext {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn class_name(&self) -> &str {
        &self.inner.class_name
    }

    pub fn assembly(&self) -> &str {
        &self.inner.assembly
    }

    /// 1-based attempt number
    pub fn attempt(&self) -> u32 {
        self.inner.attempt
    }

    pub fn set_item(&self, key: impl Into<String>, value: Value) {
        self.inner
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value);
    }

    pub fn item(&self, key: &str) -> Option<Value> {
        self.inner
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Typed access to a shared resource requested by this test
    pub fn resource<T: Any + Send + Sync>(&self, resource: &str) -> Option<Arc<T>> {
        self.inner.resources.get(resource).and_then(|h| h.get::<T>())
    }

    pub fn resource_handle(&self, resource: &str) -> Option<&ResourceHandle> {
        self.inner.resources.get(resource)
    }

    /// Terminal result of a direct or transitive dependency
    pub fn dependency_result(&self, id: &str) -> Option<&TestResult> {
        self.inner.dependencies.get(id)
    }

    pub fn dependency_passed(&self, id: &str) -> bool {
        self.dependency_result(id)
            .is_some_and(|r| r.status == TestStatus::Passed)
    }

    pub fn dependency_results(&self) -> impl Iterator<Item = &TestResult> {
        self.inner.dependencies.values()
    }
}

/// Attempt-independent inputs a `TestContext` is built from
#[derive(Clone, Default)]
pub struct ContextSeed {
    pub resources: HashMap<String, ResourceHandle>,
    pub dependencies: HashMap<String, TestResult>,
}

impl ContextSeed {
    /// Build the context for one attempt; the item bag starts empty
    pub fn attempt(&self, unit: &TestUnit, attempt: u32) -> TestContext {
        TestContext {
            inner: Arc::new(ContextInner {
                id: unit.id.clone(),
                name: unit.name.clone(),
                class_name: unit.class_name.clone(),
                assembly: unit.assembly.clone(),
                attempt,
                items: Mutex::new(HashMap::new()),
                resources: self.resources.clone(),
                dependencies: self.dependencies.clone(),
            }),
        }
    }
}

/// What a hook callback sees
#[derive(Clone)]
pub struct HookContext {
    pub scope: HookScope,
    /// Empty for session hooks
    pub assembly: Option<String>,
    /// Set for class and test hooks
    pub class_name: Option<String>,
    /// Set for test hooks
    pub test: Option<TestContext>,
}

impl HookContext {
    pub fn session() -> Self {
        Self {
            scope: HookScope::Session,
            assembly: None,
            class_name: None,
            test: None,
        }
    }

    pub fn assembly(assembly: &str) -> Self {
        Self {
            scope: HookScope::Assembly,
            assembly: Some(assembly.to_string()),
            class_name: None,
            test: None,
        }
    }

    pub fn class(assembly: &str, class_name: &str) -> Self {
        Self {
            scope: HookScope::Class,
            assembly: Some(assembly.to_string()),
            class_name: Some(class_name.to_string()),
            test: None,
        }
    }

    pub fn test(ctx: &TestContext) -> Self {
        Self {
            scope: HookScope::Test,
            assembly: Some(ctx.assembly().to_string()),
            class_name: Some(ctx.class_name().to_string()),
            test: Some(ctx.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_items_are_per_attempt() {
        let unit = TestUnit::new("cart").in_class("Shop");
        let seed = ContextSeed::default();

        let first = seed.attempt(&unit, 1);
        first.set_item("token", json!("abc"));
        assert_eq!(first.item("token"), Some(json!("abc")));

        let second = seed.attempt(&unit, 2);
        assert_eq!(second.attempt(), 2);
        assert!(second.item("token").is_none());
    }

    #[test]
    fn test_dependency_results_visible() {
        let login = TestUnit::new("login");
        let mut seed = ContextSeed::default();
        seed.dependencies
            .insert("login".to_string(), TestResult::passed(&login, 1, 5));

        let ctx = seed.attempt(&TestUnit::new("checkout"), 1);
        assert!(ctx.dependency_passed("login"));
        assert!(!ctx.dependency_passed("missing"));
        assert_eq!(ctx.dependency_results().count(), 1);
    }

    #[test]
    fn test_hook_context_for_test() {
        let unit = TestUnit::new("a").in_class("K").in_assembly("asm");
        let ctx = ContextSeed::default().attempt(&unit, 1);
        let hook = HookContext::test(&ctx);
        assert_eq!(hook.scope, HookScope::Test);
        assert_eq!(hook.class_name.as_deref(), Some("K"));
        assert_eq!(hook.assembly.as_deref(), Some("asm"));
        assert_eq!(hook.test.map(|t| t.id().to_string()), Some("a".to_string()));
    }
}
