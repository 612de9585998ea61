//! Shared resource registry
//!
//! Owns reference counts and lifetimes of objects shared across tests.
//!
//! Counts are taken at reservation time (when a test is discovered), not at
//! first use, so a resource is never disposed while a not-yet-started test
//! still needs it. Every entry also holds one reference on each nested
//! resource it acquires during construction; an outer resource is therefore
//! always disposed before the resources it was built from, whatever their
//! scopes.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::definition::{
    InitContext, ResourceDefinition, ResourceHandle, ResourceInstance, ResourceKey, ScopeKey,
    ScopeOwner,
};
use crate::error::EngineError;
use crate::models::{Diagnostic, DiagnosticKind, ResourceRequest};

type InitCell = Arc<OnceCell<Result<ResourceInstance, String>>>;

struct Entry {
    refs: usize,
    /// Edges to the resources this one acquires during construction
    nested: Vec<ResourceKey>,
    cell: InitCell,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<ResourceKey, Entry>,
    sealed: bool,
    diagnostics: Vec<Diagnostic>,
    disposal_log: Vec<ResourceKey>,
}

/// Reference-counted store of shared resources for one session
pub struct ResourceRegistry {
    definitions: HashMap<String, Arc<ResourceDefinition>>,
    state: Mutex<RegistryState>,
}

impl ResourceRegistry {
    /// Build a registry, rejecting unknown nested resources and definition cycles
    pub fn new(definitions: Vec<ResourceDefinition>) -> Result<Self, EngineError> {
        let definitions: HashMap<String, Arc<ResourceDefinition>> = definitions
            .into_iter()
            .map(|d| (d.name.clone(), Arc::new(d)))
            .collect();

        for definition in definitions.values() {
            for nested in &definition.dependencies {
                if !definitions.contains_key(&nested.resource) {
                    return Err(EngineError::UnknownResource(nested.resource.clone()));
                }
            }
        }
        check_definition_cycles(&definitions)?;

        Ok(Self {
            definitions,
            state: Mutex::new(RegistryState::default()),
        })
    }

    pub fn empty() -> Self {
        Self {
            definitions: HashMap::new(),
            state: Mutex::new(RegistryState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check that every requested resource type is defined
    pub fn validate(&self, requests: &[ResourceRequest]) -> Result<(), EngineError> {
        match requests
            .iter()
            .find(|r| !self.definitions.contains_key(&r.resource))
        {
            Some(missing) => Err(EngineError::UnknownResource(missing.resource.clone())),
            None => Ok(()),
        }
    }

    /// Take one reference on every resource a test will use
    ///
    /// Requests must have been validated.
    pub fn reserve(&self, requests: &[ResourceRequest], owner: &ScopeOwner) -> Vec<ResourceKey> {
        let mut state = self.lock();
        requests
            .iter()
            .enumerate()
            .filter(|(_, request)| self.definitions.contains_key(&request.resource))
            .map(|(index, request)| {
                let path = format!("{}#{}", owner.test_id, index);
                let key = ResourceKey::new(
                    request.resource.clone(),
                    ScopeKey::resolve(&request.scope, owner, &path),
                );
                self.reserve_key(&mut state, key.clone(), owner);
                key
            })
            .collect()
    }

    fn reserve_key(&self, state: &mut RegistryState, key: ResourceKey, owner: &ScopeOwner) {
        let mut stack = vec![key];
        while let Some(key) = stack.pop() {
            if let Some(entry) = state.entries.get_mut(&key) {
                entry.refs += 1;
                continue;
            }
            let Some(definition) = self.definitions.get(&key.resource) else {
                continue;
            };
            let nested: Vec<ResourceKey> = definition
                .dependencies
                .iter()
                .enumerate()
                .map(|(index, request)| {
                    let path = format!("{key}/{index}");
                    ResourceKey::new(
                        request.resource.clone(),
                        ScopeKey::resolve(&request.scope, owner, &path),
                    )
                })
                .collect();
            debug!("Reserved shared resource {} ({} nested)", key, nested.len());
            stack.extend(nested.iter().cloned());
            state.entries.insert(
                key,
                Entry {
                    refs: 1,
                    nested,
                    cell: Arc::new(OnceCell::new()),
                },
            );
        }
    }

    /// Get the constructed resource, building it on first use
    ///
    /// Concurrent first callers await the same construction. A failed
    /// construction is permanent for this key.
    pub async fn acquire(&self, key: &ResourceKey) -> Result<ResourceHandle, EngineError> {
        self.acquire_key(key.clone()).await
    }

    fn acquire_key(&self, key: ResourceKey) -> BoxFuture<'_, Result<ResourceHandle, EngineError>> {
        async move {
            let (cell, nested) = {
                let state = self.lock();
                let entry = state
                    .entries
                    .get(&key)
                    .ok_or_else(|| EngineError::UnknownResource(key.to_string()))?;
                (entry.cell.clone(), entry.nested.clone())
            };
            let definition = self
                .definitions
                .get(&key.resource)
                .cloned()
                .ok_or_else(|| EngineError::UnknownResource(key.resource.clone()))?;

            let built = cell
                .get_or_init(|| async {
                    let mut handles = HashMap::new();
                    for nested_key in &nested {
                        match self.acquire_key(nested_key.clone()).await {
                            Ok(handle) => {
                                handles.insert(nested_key.resource.clone(), handle);
                            }
                            Err(e) => return Err(format!("nested resource {nested_key}: {e}")),
                        }
                    }
                    info!("Initializing shared resource {}", key);
                    let init = definition.init.clone();
                    let ctx = InitContext::new(key.clone(), handles);
                    // A panic is a failed construction like any other
                    let built = match tokio::spawn(async move { init(ctx).await }).await {
                        Ok(built) => built,
                        Err(e) => Err(format!("resource initializer panicked: {e}")),
                    };
                    if let Err(e) = &built {
                        warn!("Shared resource {} failed to initialize: {}", key, e);
                    }
                    built
                })
                .await;

            match built {
                Ok(instance) => Ok(ResourceHandle::new(key, instance.clone())),
                Err(message) => Err(EngineError::ResourceInitialization {
                    resource: key.to_string(),
                    message: message.clone(),
                }),
            }
        }
        .boxed()
    }

    /// Drop one reference; disposes whatever reaches zero and may go
    pub async fn release(&self, key: &ResourceKey) {
        let candidate = {
            let mut state = self.lock();
            match state.entries.get_mut(key) {
                Some(entry) => {
                    entry.refs = entry.refs.saturating_sub(1);
                    (entry.refs == 0).then(|| key.clone())
                }
                None => None,
            }
        };
        if let Some(key) = candidate {
            self.cascade(VecDeque::from([key])).await;
        }
    }

    pub async fn release_all(&self, keys: &[ResourceKey]) {
        for key in keys {
            self.release(key).await;
        }
    }

    /// No more reservations will arrive; dispose everything already unreferenced
    pub async fn seal(&self) {
        let idle: VecDeque<ResourceKey> = {
            let mut state = self.lock();
            state.sealed = true;
            let mut idle: Vec<ResourceKey> = state
                .entries
                .iter()
                .filter(|(_, e)| e.refs == 0)
                .map(|(k, _)| k.clone())
                .collect();
            idle.sort();
            idle.into()
        };
        self.cascade(idle).await;
    }

    /// Dispose every remaining entry, outermost first
    pub async fn shutdown(&self) {
        loop {
            let layer: Vec<(ResourceKey, Entry)> = {
                let mut state = self.lock();
                state.sealed = true;
                let referenced: HashSet<ResourceKey> = state
                    .entries
                    .values()
                    .flat_map(|e| e.nested.iter().cloned())
                    .collect();
                let mut roots: Vec<ResourceKey> = state
                    .entries
                    .keys()
                    .filter(|k| !referenced.contains(*k))
                    .cloned()
                    .collect();
                roots.sort();
                roots
                    .into_iter()
                    .filter_map(|k| state.entries.remove(&k).map(|e| (k, e)))
                    .collect()
            };
            if layer.is_empty() {
                break;
            }
            for (key, entry) in layer {
                if entry.refs > 0 {
                    debug!("Force-disposing {} with {} live reference(s)", key, entry.refs);
                }
                self.dispose_entry(&key, &entry).await;
            }
        }
    }

    fn may_dispose(state: &RegistryState, key: &ResourceKey) -> bool {
        state
            .entries
            .get(key)
            .is_some_and(|e| e.refs == 0 && (state.sealed || key.is_unique()))
    }

    async fn cascade(&self, mut pending: VecDeque<ResourceKey>) {
        while let Some(key) = pending.pop_front() {
            let entry = {
                let mut state = self.lock();
                if Self::may_dispose(&state, &key) {
                    state.entries.remove(&key)
                } else {
                    None
                }
            };
            let Some(entry) = entry else {
                continue;
            };

            self.dispose_entry(&key, &entry).await;

            let mut state = self.lock();
            for nested in &entry.nested {
                if let Some(inner) = state.entries.get_mut(nested) {
                    inner.refs = inner.refs.saturating_sub(1);
                    if inner.refs == 0 {
                        pending.push_back(nested.clone());
                    }
                }
            }
        }
    }

    async fn dispose_entry(&self, key: &ResourceKey, entry: &Entry) {
        let instance = match entry.cell.get() {
            Some(Ok(instance)) => Some(instance.clone()),
            _ => None,
        };
        let dispose = self
            .definitions
            .get(&key.resource)
            .and_then(|d| d.dispose.clone());

        if let (Some(instance), Some(dispose)) = (instance.clone(), dispose) {
            debug!("Disposing shared resource {}", key);
            let outcome = match tokio::spawn(dispose(instance)).await {
                Ok(result) => result,
                Err(e) => Err(format!("disposer panicked: {e}")),
            };
            if let Err(message) = outcome {
                let error = EngineError::Disposal {
                    resource: key.to_string(),
                    message,
                };
                warn!("{}", error);
                self.lock().diagnostics.push(Diagnostic::new(
                    DiagnosticKind::Disposal,
                    key.to_string(),
                    error.to_string(),
                ));
            }
        }

        if instance.is_some() {
            self.lock().disposal_log.push(key.clone());
        }
    }

    /// Disposal failures recorded so far
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.lock().diagnostics.clone()
    }

    /// Constructed resources in the order they were disposed
    pub fn disposal_log(&self) -> Vec<ResourceKey> {
        self.lock().disposal_log.clone()
    }

    pub fn ref_count(&self, key: &ResourceKey) -> Option<usize> {
        self.lock().entries.get(key).map(|e| e.refs)
    }

    pub fn is_live(&self, key: &ResourceKey) -> bool {
        self.lock().entries.contains_key(key)
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::empty()
    }
}

fn check_definition_cycles(
    definitions: &HashMap<String, Arc<ResourceDefinition>>,
) -> Result<(), EngineError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit(
        name: &str,
        definitions: &HashMap<String, Arc<ResourceDefinition>>,
        marks: &mut HashMap<String, Mark>,
        path: &mut Vec<String>,
    ) -> Result<(), EngineError> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = path.iter().position(|p| p == name).unwrap_or(0);
                let mut cycle = path[start..].to_vec();
                cycle.push(name.to_string());
                return Err(EngineError::ResourceCycle(cycle));
            }
            None => {}
        }
        marks.insert(name.to_string(), Mark::Visiting);
        path.push(name.to_string());
        if let Some(definition) = definitions.get(name) {
            for nested in &definition.dependencies {
                visit(&nested.resource, definitions, marks, path)?;
            }
        }
        path.pop();
        marks.insert(name.to_string(), Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    let mut names: Vec<&String> = definitions.keys().collect();
    names.sort();
    for name in names {
        visit(name, definitions, &mut marks, &mut Vec::new())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SharedScope, TestUnit};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn owner(id: &str, class: &str) -> ScopeOwner {
        ScopeOwner::from(&TestUnit::new(id).in_class(class))
    }

    fn request(resource: &str, scope: SharedScope) -> ResourceRequest {
        ResourceRequest::new(resource, scope)
    }

    fn counting(name: &str, counter: Arc<AtomicUsize>) -> ResourceDefinition {
        ResourceDefinition::new(name, move |ctx: InitContext| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, String>(ctx.key().to_string())
            }
        })
        .on_dispose(|_| async { Ok(()) })
    }

    #[test]
    fn test_definition_cycle_rejected() {
        let a = ResourceDefinition::new("a", |_| async { Ok::<_, String>(()) })
            .depends_on("b", SharedScope::PerSession);
        let b = ResourceDefinition::new("b", |_| async { Ok::<_, String>(()) })
            .depends_on("a", SharedScope::PerSession);
        let error = ResourceRegistry::new(vec![a, b]).err().unwrap();
        assert!(matches!(error, EngineError::ResourceCycle(_)));
    }

    #[test]
    fn test_unknown_nested_rejected() {
        let a = ResourceDefinition::new("a", |_| async { Ok::<_, String>(()) })
            .depends_on("ghost", SharedScope::PerSession);
        assert_eq!(
            ResourceRegistry::new(vec![a]).err(),
            Some(EngineError::UnknownResource("ghost".to_string()))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_acquire_constructs_once() {
        let built = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(ResourceRegistry::new(vec![counting("db", built.clone())]).unwrap());

        let mut keys = Vec::new();
        for i in 0..8 {
            let owner = owner(&format!("t{i}"), "C");
            keys.extend(registry.reserve(&[request("db", SharedScope::PerSession)], &owner));
        }

        let mut handles = Vec::new();
        for key in keys.clone() {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move { registry.acquire(&key).await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert_eq!(registry.ref_count(&keys[0]), Some(8));
    }

    #[tokio::test]
    async fn test_failed_initialization_is_permanent() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let broken = ResourceDefinition::new("broken", move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("connection refused".to_string())
            }
        });
        let registry = ResourceRegistry::new(vec![broken]).unwrap();
        let keys = registry.reserve(
            &[request("broken", SharedScope::PerSession)],
            &owner("t1", "C"),
        );

        for _ in 0..3 {
            let error = registry.acquire(&keys[0]).await.unwrap_err();
            assert!(matches!(error, EngineError::ResourceInitialization { .. }));
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_initializer_fails_permanently() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let crashing = ResourceDefinition::new("driver", move |_| {
            let counter = counter.clone();
            async move {
                let seen = counter.fetch_add(1, Ordering::SeqCst);
                assert!(seen > 100, "driver crashed");
                Ok::<(), String>(())
            }
        });
        let registry = ResourceRegistry::new(vec![crashing]).unwrap();
        let keys = registry.reserve(
            &[request("driver", SharedScope::PerSession)],
            &owner("t1", "C"),
        );

        for _ in 0..3 {
            match registry.acquire(&keys[0]).await {
                Err(EngineError::ResourceInitialization { message, .. }) => {
                    assert!(message.contains("panicked"));
                }
                other => panic!("unexpected acquire result {other:?}"),
            }
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_nested_resources_outlive_their_dependents() {
        let built = Arc::new(AtomicUsize::new(0));
        let session = counting("R", built.clone());
        let class = ResourceDefinition::new("S", |ctx: InitContext| {
            let inner = ctx.nested::<String>("R");
            async move {
                // Nested resource is fully built before this initializer runs
                let inner = inner.ok_or_else(|| "R missing".to_string())?;
                Ok::<_, String>(format!("S over {inner}"))
            }
        })
        .depends_on("R", SharedScope::PerSession)
        .on_dispose(|_| async { Ok(()) });
        let registry = ResourceRegistry::new(vec![session, class]).unwrap();

        let requests = [
            request("R", SharedScope::PerSession),
            request("S", SharedScope::PerClass),
        ];
        let first = registry.reserve(&requests, &owner("a", "One"));
        let second = registry.reserve(&requests, &owner("b", "Two"));

        for key in first.iter().chain(second.iter()) {
            registry.acquire(key).await.unwrap();
        }
        assert_eq!(built.load(Ordering::SeqCst), 1);

        registry.release_all(&first).await;
        registry.release_all(&second).await;
        // Nothing goes before discovery is sealed
        assert!(registry.disposal_log().is_empty());

        registry.seal().await;
        let order: Vec<String> = registry
            .disposal_log()
            .iter()
            .map(|k| k.to_string())
            .collect();
        assert_eq!(
            order,
            vec![
                "S@class:default::One".to_string(),
                "S@class:default::Two".to_string(),
                "R@session".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_unique_resource_disposed_on_release() {
        let built = Arc::new(AtomicUsize::new(0));
        let registry = ResourceRegistry::new(vec![counting("tmp", built.clone())]).unwrap();

        let first = registry.reserve(&[request("tmp", SharedScope::None)], &owner("a", "C"));
        let second = registry.reserve(&[request("tmp", SharedScope::None)], &owner("b", "C"));
        assert_ne!(first[0], second[0]);

        registry.acquire(&first[0]).await.unwrap();
        registry.acquire(&second[0]).await.unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 2);

        registry.release(&first[0]).await;
        assert!(!registry.is_live(&first[0]));
        assert!(registry.is_live(&second[0]));
    }

    #[tokio::test]
    async fn test_disposal_failure_becomes_diagnostic() {
        let failing = ResourceDefinition::new("leaky", |_| async { Ok::<_, String>(()) })
            .on_dispose(|_| async { Err("socket still open".to_string()) });
        let registry = ResourceRegistry::new(vec![failing]).unwrap();
        let keys = registry.reserve(
            &[request("leaky", SharedScope::PerAssembly)],
            &owner("a", "C"),
        );
        registry.acquire(&keys[0]).await.unwrap();
        registry.seal().await;
        registry.release(&keys[0]).await;

        let diagnostics = registry.diagnostics();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].kind, DiagnosticKind::Disposal);
        assert!(diagnostics[0].message.contains("socket still open"));
    }

    #[tokio::test]
    async fn test_shutdown_disposes_outermost_first() {
        let built = Arc::new(AtomicUsize::new(0));
        let inner = counting("inner", built.clone());
        let outer = counting("outer", built.clone()).depends_on("inner", SharedScope::PerSession);
        let registry = ResourceRegistry::new(vec![inner, outer]).unwrap();
        let keys = registry.reserve(
            &[request("outer", SharedScope::PerSession)],
            &owner("a", "C"),
        );
        registry.acquire(&keys[0]).await.unwrap();

        // Reference still held: shutdown disposes regardless, in dependency order
        registry.shutdown().await;
        let order: Vec<String> = registry
            .disposal_log()
            .iter()
            .map(|k| k.resource.clone())
            .collect();
        assert_eq!(order, vec!["outer".to_string(), "inner".to_string()]);
    }
}
