//! Setup and teardown hooks
//!
//! Hooks are registered once as typed descriptors and looked up by scope,
//! direction and origin when a tier has to run.

pub mod orchestrator;

pub use orchestrator::HookOrchestrator;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::context::HookContext;

/// Lifetime a hook is bound to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookScope {
    Test,
    Class,
    Assembly,
    Session,
}

impl fmt::Display for HookScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookScope::Test => write!(f, "test"),
            HookScope::Class => write!(f, "class"),
            HookScope::Assembly => write!(f, "assembly"),
            HookScope::Session => write!(f, "session"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookDirection {
    Before,
    After,
}

impl fmt::Display for HookDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookDirection::Before => write!(f, "before"),
            HookDirection::After => write!(f, "after"),
        }
    }
}

/// Where a hook was declared
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HookOrigin {
    /// Cross-cutting: runs for every instance of its scope
    Every,
    /// Bound to the declaring class (and its assembly)
    Declared {
        assembly: String,
        class_name: Option<String>,
    },
}

pub type HookCallback =
    Arc<dyn Fn(HookContext) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// One registered hook
#[derive(Clone)]
pub struct HookDescriptor {
    pub name: String,
    pub scope: HookScope,
    pub direction: HookDirection,
    pub origin: HookOrigin,
    /// Lower runs first for Before hooks, last for After hooks
    pub order: i32,
    pub callback: HookCallback,
}

impl HookDescriptor {
    /// Create an "every" hook
    pub fn new<F, Fut>(
        name: impl Into<String>,
        scope: HookScope,
        direction: HookDirection,
        callback: F,
    ) -> Self
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        Self {
            name: name.into(),
            scope,
            direction,
            origin: HookOrigin::Every,
            order: 0,
            callback: Arc::new(move |ctx| callback(ctx).boxed()),
        }
    }

    pub fn before<F, Fut>(name: impl Into<String>, scope: HookScope, callback: F) -> Self
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        Self::new(name, scope, HookDirection::Before, callback)
    }

    pub fn after<F, Fut>(name: impl Into<String>, scope: HookScope, callback: F) -> Self
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        Self::new(name, scope, HookDirection::After, callback)
    }

    /// Bind to a declaring class
    pub fn in_class(mut self, assembly: impl Into<String>, class_name: impl Into<String>) -> Self {
        self.origin = HookOrigin::Declared {
            assembly: assembly.into(),
            class_name: Some(class_name.into()),
        };
        self
    }

    /// Bind to an assembly without a specific class
    pub fn in_assembly(mut self, assembly: impl Into<String>) -> Self {
        self.origin = HookOrigin::Declared {
            assembly: assembly.into(),
            class_name: None,
        };
        self
    }

    pub fn order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn is_every(&self) -> bool {
        matches!(self.origin, HookOrigin::Every)
    }

    /// Whether a declared hook applies to the given scope instance
    fn applies_to(&self, assembly: Option<&str>, class_name: Option<&str>) -> bool {
        match &self.origin {
            HookOrigin::Every => true,
            HookOrigin::Declared {
                assembly: own_assembly,
                class_name: own_class,
            } => match self.scope {
                HookScope::Session => true,
                HookScope::Assembly => assembly == Some(own_assembly.as_str()),
                HookScope::Class | HookScope::Test => {
                    assembly == Some(own_assembly.as_str())
                        && own_class.is_some()
                        && own_class.as_deref() == class_name
                }
            },
        }
    }
}

impl fmt::Debug for HookDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookDescriptor")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("direction", &self.direction)
            .field("origin", &self.origin)
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

/// Immutable lookup table of every registered hook
#[derive(Clone, Debug, Default)]
pub struct HookTable {
    hooks: Vec<Arc<HookDescriptor>>,
}

impl HookTable {
    pub fn new(hooks: Vec<HookDescriptor>) -> Self {
        Self {
            hooks: hooks.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Hooks of one tier in execution order
    ///
    /// Before tiers run by ascending order then declaration order; After
    /// tiers are the exact mirror.
    pub fn tier(
        &self,
        scope: HookScope,
        direction: HookDirection,
        every: bool,
        assembly: Option<&str>,
        class_name: Option<&str>,
    ) -> Vec<Arc<HookDescriptor>> {
        let mut tier: Vec<(usize, Arc<HookDescriptor>)> = self
            .hooks
            .iter()
            .enumerate()
            .filter(|(_, h)| {
                h.scope == scope
                    && h.direction == direction
                    && h.is_every() == every
                    && h.applies_to(assembly, class_name)
            })
            .map(|(index, h)| (index, h.clone()))
            .collect();

        tier.sort_by_key(|(index, h)| (h.order, *index));
        if direction == HookDirection::After {
            tier.reverse();
        }
        tier.into_iter().map(|(_, h)| h).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(name: &str, scope: HookScope, direction: HookDirection) -> HookDescriptor {
        HookDescriptor::new(name, scope, direction, |_| async { Ok(()) })
    }

    fn names(tier: &[Arc<HookDescriptor>]) -> Vec<&str> {
        tier.iter().map(|h| h.name.as_str()).collect()
    }

    #[test]
    fn test_before_tier_ascending_order() {
        let table = HookTable::new(vec![
            noop("late", HookScope::Class, HookDirection::Before).order(5),
            noop("first", HookScope::Class, HookDirection::Before).order(-1),
            noop("second", HookScope::Class, HookDirection::Before),
            noop("third", HookScope::Class, HookDirection::Before),
        ]);
        let tier = table.tier(HookScope::Class, HookDirection::Before, true, None, None);
        assert_eq!(names(&tier), vec!["first", "second", "third", "late"]);
    }

    #[test]
    fn test_after_tier_mirrors_before() {
        let table = HookTable::new(vec![
            noop("a", HookScope::Test, HookDirection::After).order(1),
            noop("b", HookScope::Test, HookDirection::After).order(2),
            noop("c", HookScope::Test, HookDirection::After).order(1),
        ]);
        let tier = table.tier(HookScope::Test, HookDirection::After, true, None, None);
        assert_eq!(names(&tier), vec!["b", "c", "a"]);
    }

    #[test]
    fn test_declared_hooks_match_their_class() {
        let table = HookTable::new(vec![
            noop("orders", HookScope::Class, HookDirection::Before).in_class("shop", "Orders"),
            noop("users", HookScope::Class, HookDirection::Before).in_class("shop", "Users"),
            noop("asm", HookScope::Assembly, HookDirection::Before).in_assembly("shop"),
            noop("every", HookScope::Class, HookDirection::Before),
        ]);

        let declared = table.tier(
            HookScope::Class,
            HookDirection::Before,
            false,
            Some("shop"),
            Some("Orders"),
        );
        assert_eq!(names(&declared), vec!["orders"]);

        let assembly = table.tier(
            HookScope::Assembly,
            HookDirection::Before,
            false,
            Some("other"),
            None,
        );
        assert!(assembly.is_empty());
    }

    #[test]
    fn test_scope_serde() {
        assert_eq!(serde_json::to_string(&HookScope::Assembly).unwrap(), "\"assembly\"");
        let direction: HookDirection = serde_yaml::from_str("after").unwrap();
        assert_eq!(direction, HookDirection::After);
    }
}
