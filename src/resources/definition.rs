//! Shared resource definitions and scope keys

use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::models::{ResourceRequest, SharedScope, TestUnit};

/// A constructed shared object
pub type ResourceInstance = Arc<dyn Any + Send + Sync>;

pub type ResourceInit =
    Arc<dyn Fn(InitContext) -> BoxFuture<'static, Result<ResourceInstance, String>> + Send + Sync>;

pub type ResourceDispose =
    Arc<dyn Fn(ResourceInstance) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// How to build, and tear down, one type of shared resource
#[derive(Clone)]
pub struct ResourceDefinition {
    pub name: String,
    /// Resources acquired before this one's initializer starts
    pub dependencies: Vec<ResourceRequest>,
    pub(crate) init: ResourceInit,
    pub(crate) dispose: Option<ResourceDispose>,
}

impl ResourceDefinition {
    pub fn new<F, Fut, T>(name: impl Into<String>, init: F) -> Self
    where
        F: Fn(InitContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, String>> + Send + 'static,
        T: Any + Send + Sync,
    {
        let init: ResourceInit = Arc::new(move |ctx| {
            init(ctx)
                .map(|built| built.map(|value| Arc::new(value) as ResourceInstance))
                .boxed()
        });
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            init,
            dispose: None,
        }
    }

    /// Declare a nested resource this one acquires during construction
    pub fn depends_on(mut self, resource: impl Into<String>, scope: SharedScope) -> Self {
        self.dependencies
            .push(ResourceRequest::new(resource, scope));
        self
    }

    pub fn on_dispose<F, Fut>(mut self, dispose: F) -> Self
    where
        F: Fn(ResourceInstance) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.dispose = Some(Arc::new(move |instance| dispose(instance).boxed()));
        self
    }
}

impl fmt::Debug for ResourceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceDefinition")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("disposable", &self.dispose.is_some())
            .finish()
    }
}

/// Read handle to a constructed shared resource
#[derive(Clone)]
pub struct ResourceHandle {
    pub key: ResourceKey,
    instance: ResourceInstance,
}

impl ResourceHandle {
    pub(crate) fn new(key: ResourceKey, instance: ResourceInstance) -> Self {
        Self { key, instance }
    }

    /// Typed access to the instance
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.instance.clone().downcast::<T>().ok()
    }

    pub fn instance(&self) -> &ResourceInstance {
        &self.instance
    }
}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle").field("key", &self.key).finish()
    }
}

/// Passed to an initializer; nested resources are already constructed
pub struct InitContext {
    key: ResourceKey,
    nested: HashMap<String, ResourceHandle>,
}

impl InitContext {
    pub(crate) fn new(key: ResourceKey, nested: HashMap<String, ResourceHandle>) -> Self {
        Self { key, nested }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn nested<T: Any + Send + Sync>(&self, resource: &str) -> Option<Arc<T>> {
        self.nested.get(resource).and_then(|h| h.get::<T>())
    }

    pub fn nested_handle(&self, resource: &str) -> Option<&ResourceHandle> {
        self.nested.get(resource)
    }
}

/// The requester a scope key is resolved against
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScopeOwner {
    pub test_id: String,
    pub class_name: String,
    pub assembly: String,
}

impl From<&TestUnit> for ScopeOwner {
    fn from(unit: &TestUnit) -> Self {
        Self {
            test_id: unit.id.clone(),
            class_name: unit.class_name.clone(),
            assembly: unit.assembly.clone(),
        }
    }
}

/// Sharing boundary of one resource instance
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScopeKey {
    Unique(String),
    Keyed(String),
    Class(String),
    Assembly(String),
    Session,
}

impl ScopeKey {
    /// Resolve a declared scope for a requester; `path` disambiguates unique requests
    pub fn resolve(scope: &SharedScope, owner: &ScopeOwner, path: &str) -> Self {
        match scope {
            SharedScope::None => ScopeKey::Unique(path.to_string()),
            SharedScope::Keyed(key) => ScopeKey::Keyed(key.clone()),
            SharedScope::PerClass => {
                ScopeKey::Class(format!("{}::{}", owner.assembly, owner.class_name))
            }
            SharedScope::PerAssembly => ScopeKey::Assembly(owner.assembly.clone()),
            SharedScope::PerSession => ScopeKey::Session,
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeKey::Unique(path) => write!(f, "unique:{path}"),
            ScopeKey::Keyed(key) => write!(f, "keyed:{key}"),
            ScopeKey::Class(class) => write!(f, "class:{class}"),
            ScopeKey::Assembly(assembly) => write!(f, "assembly:{assembly}"),
            ScopeKey::Session => write!(f, "session"),
        }
    }
}

/// Identity of one registry entry: resource type plus resolved scope
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub resource: String,
    pub scope: ScopeKey,
}

impl ResourceKey {
    pub fn new(resource: impl Into<String>, scope: ScopeKey) -> Self {
        Self {
            resource: resource.into(),
            scope,
        }
    }

    pub fn is_unique(&self) -> bool {
        matches!(self.scope, ScopeKey::Unique(_))
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.resource, self.scope)
    }
}
