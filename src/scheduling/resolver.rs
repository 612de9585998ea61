//! Dependency resolution
//!
//! Builds the test dependency graph incrementally as units are discovered
//! and reports every readiness change as a `Resolution`. Tests that are
//! filtered out of the selection stay dormant until a selected test depends
//! on them, at which point they are activated and executed hidden.

use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::models::{DependencySpec, InstanceMatch, TestState, TestStatus, TestUnit};

/// A readiness change the engine must act on
#[derive(Clone, Debug, PartialEq)]
pub enum Resolution {
    /// Every dependency is terminal and none blocks execution
    Ready(String),
    /// A dormant test became required by a selected test
    Activated(String),
    Skipped { id: String, reason: String },
    Failed { id: String, error: EngineError },
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum NodeState {
    Waiting,
    Published,
    Terminal(TestStatus),
}

#[derive(Clone, Debug)]
enum Verdict {
    Skip(String),
    Fail(EngineError),
}

#[derive(Debug)]
struct Node {
    name: String,
    /// Declarations not yet bound to a discovered target
    pending: Vec<DependencySpec>,
    deps: Vec<String>,
    /// Dependents and whether each proceeds when this node does not pass
    dependents: Vec<(String, bool)>,
    /// Bound dependencies not yet terminal
    waiting: usize,
    active: bool,
    state: NodeState,
    verdict: Option<Verdict>,
}

/// Incremental dependency graph over discovered tests
#[derive(Debug)]
pub struct DependencyResolver {
    nodes: HashMap<String, Node>,
    /// Same-instance declarations waiting for their target, keyed by target id
    awaiting: HashMap<String, Vec<String>>,
    max_passes: usize,
    sealed: bool,
}

impl DependencyResolver {
    pub fn new(max_passes: usize) -> Self {
        Self {
            nodes: HashMap::new(),
            awaiting: HashMap::new(),
            max_passes: max_passes.max(1),
            sealed: false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add a discovered unit and bind whatever can be bound
    pub fn register(&mut self, unit: &TestUnit) -> Vec<Resolution> {
        self.insert(unit, unit.dependencies.clone(), None)
    }

    /// Add a unit already known to be broken; dependents still bind to it
    pub fn register_failed(&mut self, unit: &TestUnit, error: EngineError) -> Vec<Resolution> {
        self.insert(unit, Vec::new(), Some(Verdict::Fail(error)))
    }

    fn insert(
        &mut self,
        unit: &TestUnit,
        specs: Vec<DependencySpec>,
        verdict: Option<Verdict>,
    ) -> Vec<Resolution> {
        let mut out = Vec::new();
        if self.nodes.contains_key(&unit.id) {
            warn!("Ignoring duplicate registration of {}", unit.id);
            return out;
        }

        self.nodes.insert(
            unit.id.clone(),
            Node {
                name: unit.name.clone(),
                pending: specs.clone(),
                deps: Vec::new(),
                dependents: Vec::new(),
                waiting: 0,
                active: unit.selected,
                state: NodeState::Waiting,
                verdict,
            },
        );
        debug!("Registered {} ({} dependencies)", unit.id, specs.len());

        // Own declarations whose target is already known
        for spec in specs.iter().filter(|s| s.instance == InstanceMatch::Same) {
            if self.nodes.contains_key(&spec.target) {
                self.bind(&unit.id, spec, &mut out);
            } else {
                self.awaiting
                    .entry(spec.target.clone())
                    .or_default()
                    .push(unit.id.clone());
            }
        }

        // Earlier declarations that were waiting for this unit
        if let Some(waiters) = self.awaiting.remove(&unit.id) {
            for waiter in waiters {
                let spec = self.nodes.get(&waiter).and_then(|n| {
                    n.pending
                        .iter()
                        .find(|s| s.instance == InstanceMatch::Same && s.target == unit.id)
                        .cloned()
                });
                if let Some(spec) = spec {
                    self.bind(&waiter, &spec, &mut out);
                    self.try_publish(&waiter, &mut out);
                }
            }
        }

        self.try_publish(&unit.id, &mut out);
        out
    }

    /// Record a terminal outcome and release or skip dependents; idempotent
    pub fn mark_terminal(&mut self, id: &str, status: TestStatus) -> Vec<Resolution> {
        let mut out = Vec::new();
        let dependents = match self.nodes.get_mut(id) {
            Some(node) if !matches!(node.state, NodeState::Terminal(_)) => {
                node.state = NodeState::Terminal(status);
                node.dependents.clone()
            }
            _ => return out,
        };

        for (dependent, proceed) in dependents {
            if let Some(node) = self.nodes.get_mut(&dependent) {
                node.waiting = node.waiting.saturating_sub(1);
                if status != TestStatus::Passed && !proceed && node.verdict.is_none() {
                    node.verdict = Some(Verdict::Skip(blocked_reason(id, status)));
                }
            }
            self.try_publish(&dependent, &mut out);
        }
        out
    }

    /// Whether a unit has been released for execution
    pub fn is_ready(&self, id: &str) -> bool {
        self.nodes
            .get(id)
            .is_some_and(|n| n.state == NodeState::Published && n.verdict.is_none())
    }

    /// Discovery is complete: resolve any-instance and forward declarations
    ///
    /// Runs bounded resolution passes; whatever is still unbound afterwards
    /// fails with a diagnostic naming the missing target.
    pub fn seal(&mut self) -> Vec<Resolution> {
        let mut out = Vec::new();
        self.sealed = true;
        self.awaiting.clear();

        for pass in 1..=self.max_passes {
            let mut progress = false;
            let mut ids: Vec<String> = self
                .nodes
                .iter()
                .filter(|(_, n)| !n.pending.is_empty())
                .map(|(id, _)| id.clone())
                .collect();
            ids.sort();

            for id in ids {
                let specs = self.nodes.get(&id).map(|n| n.pending.clone()).unwrap_or_default();
                for spec in specs {
                    let targets = self.targets_of(&id, &spec);
                    if targets.is_empty() {
                        continue;
                    }
                    progress = true;
                    self.remove_pending(&id, &spec);
                    for target in targets {
                        let bound = DependencySpec {
                            target,
                            instance: InstanceMatch::Same,
                            proceed_on_failure: spec.proceed_on_failure,
                        };
                        self.link(&id, &bound, &mut out);
                    }
                }
            }
            debug!("Resolution pass {} complete (progress: {})", pass, progress);
            if !progress {
                break;
            }
        }

        let mut unresolved: Vec<(String, String)> = self
            .nodes
            .iter_mut()
            .filter(|(_, n)| !n.pending.is_empty())
            .map(|(id, n)| {
                let target = n.pending[0].target.clone();
                n.pending.clear();
                (id.clone(), target)
            })
            .collect();
        unresolved.sort();

        for (id, target) in unresolved {
            let error = EngineError::MissingDependency {
                test: id.clone(),
                target,
            };
            warn!("{}", error);
            if let Some(node) = self.nodes.get_mut(&id) {
                if node.verdict.is_none() {
                    node.verdict = Some(Verdict::Fail(error));
                }
            }
        }

        let mut ids: Vec<String> = self.nodes.keys().cloned().collect();
        ids.sort();
        for id in ids {
            self.try_publish(&id, &mut out);
        }
        out
    }

    /// Every unit this one depends on, directly or transitively
    pub fn transitive_dependencies(&self, id: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<String> = self
            .nodes
            .get(id)
            .map(|n| n.deps.iter().cloned().collect())
            .unwrap_or_default();
        let mut found = Vec::new();
        while let Some(dep) = queue.pop_front() {
            if dep == id || !seen.insert(dep.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(&dep) {
                queue.extend(node.deps.iter().cloned());
            }
            found.push(dep);
        }
        found
    }

    /// Lifecycle state as far as the graph knows it
    ///
    /// Dormant units report `Discovered`. Once released a unit stays `Ready`
    /// here until its result arrives; the runner owns the finer states.
    pub fn state(&self, id: &str) -> Option<TestState> {
        let node = self.nodes.get(id)?;
        Some(match node.state {
            NodeState::Waiting if !node.active => TestState::Discovered,
            NodeState::Waiting => TestState::Pending,
            NodeState::Published => TestState::Ready,
            NodeState::Terminal(TestStatus::Passed) => TestState::Passed,
            NodeState::Terminal(TestStatus::Failed) => TestState::Failed,
            NodeState::Terminal(TestStatus::Skipped) => TestState::Skipped,
        })
    }

    /// Active units that were never released; only meaningful once sealed
    pub fn stranded(&self) -> Vec<String> {
        if !self.sealed {
            return Vec::new();
        }
        let mut ids: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.active && n.state == NodeState::Waiting)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Direct dependency edges, sorted, for display
    pub fn edges(&self) -> Vec<(String, String)> {
        let mut edges: Vec<(String, String)> = self
            .nodes
            .iter()
            .flat_map(|(id, n)| n.deps.iter().map(move |d| (id.clone(), d.clone())))
            .collect();
        edges.sort();
        edges
    }

    fn targets_of(&self, id: &str, spec: &DependencySpec) -> Vec<String> {
        match spec.instance {
            InstanceMatch::Same => {
                if self.nodes.contains_key(&spec.target) {
                    vec![spec.target.clone()]
                } else {
                    Vec::new()
                }
            }
            InstanceMatch::Any => {
                let mut targets: Vec<String> = self
                    .nodes
                    .iter()
                    .filter(|(other, n)| other.as_str() != id && n.name == spec.target)
                    .map(|(other, _)| other.clone())
                    .collect();
                targets.sort();
                targets
            }
        }
    }

    fn remove_pending(&mut self, id: &str, spec: &DependencySpec) {
        if let Some(node) = self.nodes.get_mut(id) {
            if let Some(index) = node.pending.iter().position(|s| s == spec) {
                node.pending.remove(index);
            }
        }
    }

    fn bind(&mut self, dependent: &str, spec: &DependencySpec, out: &mut Vec<Resolution>) {
        self.remove_pending(dependent, spec);
        self.link(dependent, spec, out);
    }

    /// Add the edge `dependent -> spec.target`
    fn link(&mut self, dependent: &str, spec: &DependencySpec, out: &mut Vec<Resolution>) {
        let target = spec.target.as_str();
        let (target_state, target_active) = match self.nodes.get(target) {
            Some(n) => (n.state, n.active),
            None => return,
        };
        if let Some(cycle) = self.find_cycle(dependent, target) {
            self.fail_cycle(&cycle, out);
        }

        let dependent_active = match self.nodes.get_mut(dependent) {
            Some(node) => {
                node.deps.push(target.to_string());
                match target_state {
                    NodeState::Terminal(status) => {
                        if status != TestStatus::Passed
                            && !spec.proceed_on_failure
                            && node.verdict.is_none()
                        {
                            node.verdict = Some(Verdict::Skip(blocked_reason(target, status)));
                        }
                    }
                    _ => node.waiting += 1,
                }
                node.active
            }
            None => return,
        };
        if let Some(node) = self.nodes.get_mut(target) {
            node.dependents
                .push((dependent.to_string(), spec.proceed_on_failure));
        }

        if dependent_active && !target_active {
            self.activate(target, out);
        }
    }

    /// Path `dependent -> target -> ... -> dependent` if the new edge closes a cycle
    fn find_cycle(&self, dependent: &str, target: &str) -> Option<Vec<String>> {
        if dependent == target {
            return Some(vec![dependent.to_string(), dependent.to_string()]);
        }
        let mut parent: HashMap<String, String> = HashMap::new();
        let mut stack = vec![target.to_string()];
        let mut seen = HashSet::from([target.to_string()]);
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.get(&current) else {
                continue;
            };
            for next in &node.deps {
                if next == dependent {
                    let mut path = vec![dependent.to_string()];
                    let mut back = vec![current.clone()];
                    let mut cursor = current.clone();
                    while let Some(previous) = parent.get(&cursor) {
                        back.push(previous.clone());
                        cursor = previous.clone();
                    }
                    back.reverse();
                    path.extend(back);
                    path.push(dependent.to_string());
                    return Some(path);
                }
                if seen.insert(next.clone()) {
                    parent.insert(next.clone(), current.clone());
                    stack.push(next.clone());
                }
            }
        }
        None
    }

    fn fail_cycle(&mut self, cycle: &[String], out: &mut Vec<Resolution>) {
        let members: Vec<String> = cycle[..cycle.len().saturating_sub(1)].to_vec();
        for member in &members {
            let error = EngineError::CircularDependency {
                test: member.clone(),
                cycle: cycle.to_vec(),
            };
            if let Some(node) = self.nodes.get_mut(member) {
                if node.verdict.is_none() && node.state == NodeState::Waiting {
                    warn!("{}", error);
                    node.verdict = Some(Verdict::Fail(error));
                }
            }
        }
        for member in &members {
            self.try_publish(member, out);
        }
    }

    /// Mark a dormant unit and everything it depends on as required
    fn activate(&mut self, id: &str, out: &mut Vec<Resolution>) {
        let mut stack = vec![id.to_string()];
        let mut activated = Vec::new();
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.get_mut(&current) else {
                continue;
            };
            if node.active {
                continue;
            }
            node.active = true;
            debug!("Activated {} for a selected dependent", current);
            out.push(Resolution::Activated(current.clone()));
            stack.extend(node.deps.iter().cloned());
            activated.push(current);
        }
        for current in activated {
            self.try_publish(&current, out);
        }
    }

    fn try_publish(&mut self, id: &str, out: &mut Vec<Resolution>) {
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        if !node.active || node.state != NodeState::Waiting {
            return;
        }
        let resolution = match &node.verdict {
            Some(Verdict::Fail(error)) => Resolution::Failed {
                id: id.to_string(),
                error: error.clone(),
            },
            Some(Verdict::Skip(reason)) => Resolution::Skipped {
                id: id.to_string(),
                reason: reason.clone(),
            },
            None if node.pending.is_empty() && node.waiting == 0 => {
                Resolution::Ready(id.to_string())
            }
            None => return,
        };
        node.state = NodeState::Published;
        out.push(resolution);
    }
}

fn blocked_reason(dependency: &str, status: TestStatus) -> String {
    match status {
        TestStatus::Skipped => format!("dependency '{dependency}' was skipped"),
        _ => format!("dependency '{dependency}' failed"),
    }
}
