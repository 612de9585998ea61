//! Constraint key scheduling
//!
//! Tests whose constraint keys intersect, transitively, form one group and
//! never overlap in execution. Admission is decided over the whole key set
//! under a single lock, and each group has one waiting queue ordered by
//! `constraint_order` then arrival, so there is no per-key lock ordering to
//! deadlock on.
//!
//! Groups only ever merge. When a newly discovered test joins two groups
//! that each have a running member, both keep running; nothing further is
//! admitted into the merged group until it has drained.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Result of an admission request
#[derive(Debug)]
pub enum Admission {
    Granted,
    /// Resolves once the unit has been admitted on release of another member
    Queued(oneshot::Receiver<()>),
}

#[derive(Debug)]
struct Waiter {
    id: String,
    wake: oneshot::Sender<()>,
}

#[derive(Debug, Default)]
struct Group {
    running: HashSet<String>,
    waiting: BTreeMap<(i32, u64), Waiter>,
}

#[derive(Debug, Default)]
struct ConstraintState {
    parent: HashMap<String, String>,
    groups: HashMap<String, Group>,
    arrivals: u64,
}

impl ConstraintState {
    fn find(&mut self, key: &str) -> String {
        if !self.parent.contains_key(key) {
            self.parent.insert(key.to_string(), key.to_string());
            self.groups.insert(key.to_string(), Group::default());
            return key.to_string();
        }
        let mut root = key.to_string();
        while let Some(next) = self.parent.get(&root).filter(|p| **p != root) {
            root = next.clone();
        }
        // Path compression
        let mut cursor = key.to_string();
        while cursor != root {
            let next = self.parent.insert(cursor.clone(), root.clone());
            match next {
                Some(next) => cursor = next,
                None => break,
            }
        }
        root
    }

    fn union(&mut self, a: &str, b: &str) -> String {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return ra;
        }
        self.parent.insert(rb.clone(), ra.clone());
        if let Some(absorbed) = self.groups.remove(&rb) {
            let group = self.groups.entry(ra.clone()).or_default();
            if !absorbed.running.is_empty() && !group.running.is_empty() {
                debug!("Merging constraint groups '{}' and '{}' while both run", ra, rb);
            }
            group.running.extend(absorbed.running);
            group.waiting.extend(absorbed.waiting);
        }
        ra
    }

    /// Unify all keys of one unit and return the group root
    fn unify(&mut self, keys: &[String]) -> Option<String> {
        let (first, rest) = keys.split_first()?;
        let mut root = self.find(first);
        for key in rest {
            root = self.union(&root, key);
        }
        Some(root)
    }
}

/// Mutual-exclusion scheduler over constraint groups
#[derive(Debug, Default)]
pub struct ConstraintScheduler {
    state: Mutex<ConstraintState>,
}

impl ConstraintScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ConstraintState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make a group aware of a unit's keys before it is ready to run
    ///
    /// Called when a unit is enlisted so group membership is known early.
    pub fn enlist(&self, keys: &[String]) {
        self.lock().unify(keys);
    }

    /// Admit immediately when the unit's group is idle, otherwise queue it
    pub fn admit(&self, id: &str, keys: &[String], order: i32) -> Admission {
        let mut state = self.lock();
        let Some(root) = state.unify(keys) else {
            return Admission::Granted;
        };
        state.arrivals += 1;
        let arrival = state.arrivals;
        let group = state.groups.entry(root.clone()).or_default();

        if group.running.is_empty() && group.waiting.is_empty() {
            group.running.insert(id.to_string());
            debug!("Admitted {} into constraint group '{}'", id, root);
            return Admission::Granted;
        }

        let (wake, rx) = oneshot::channel();
        group.waiting.insert(
            (order, arrival),
            Waiter {
                id: id.to_string(),
                wake,
            },
        );
        debug!(
            "Queued {} behind {} running member(s) of constraint group '{}'",
            id,
            group.running.len(),
            root
        );
        Admission::Queued(rx)
    }

    /// Wait until the unit holds its whole key set
    pub async fn acquire(&self, id: &str, keys: &[String], order: i32) {
        if let Admission::Queued(rx) = self.admit(id, keys, order) {
            if rx.await.is_err() {
                warn!("Admission channel for {} closed before grant", id);
            }
        }
    }

    /// Wait for admission and return a hold that releases the keys on drop
    ///
    /// The keys are released even when the holder unwinds.
    pub async fn hold<'a>(
        &'a self,
        id: &'a str,
        keys: &'a [String],
        order: i32,
    ) -> ConstraintHold<'a> {
        self.acquire(id, keys, order).await;
        ConstraintHold {
            scheduler: self,
            id,
            keys,
        }
    }

    /// Non-blocking admission; never queues
    pub fn try_admit(&self, id: &str, keys: &[String]) -> bool {
        let mut state = self.lock();
        let Some(root) = state.unify(keys) else {
            return true;
        };
        let group = state.groups.entry(root).or_default();
        if group.running.is_empty() && group.waiting.is_empty() {
            group.running.insert(id.to_string());
            true
        } else {
            false
        }
    }

    /// Clear a unit's hold and admit the next waiter once the group drains
    ///
    /// Returns the ids admitted by this release.
    pub fn release(&self, id: &str, keys: &[String]) -> Vec<String> {
        let mut state = self.lock();
        let Some(root) = state.unify(keys) else {
            return Vec::new();
        };
        let Some(group) = state.groups.get_mut(&root) else {
            return Vec::new();
        };
        group.running.remove(id);

        let mut admitted = Vec::new();
        while group.running.is_empty() {
            let Some((_, waiter)) = group.waiting.pop_first() else {
                break;
            };
            group.running.insert(waiter.id.clone());
            if waiter.wake.send(()).is_ok() {
                debug!("Admitted {} into constraint group '{}'", waiter.id, root);
                admitted.push(waiter.id);
            } else {
                group.running.remove(&waiter.id);
            }
        }
        admitted
    }

    /// Number of units currently holding keys in the key's group
    pub fn running_in_group(&self, key: &str) -> usize {
        let mut state = self.lock();
        let root = state.find(key);
        state.groups.get(&root).map_or(0, |g| g.running.len())
    }

    /// Partition units into constraint groups; units without keys are left out
    pub fn groups<'a, I>(units: I) -> Vec<Vec<String>>
    where
        I: IntoIterator<Item = (&'a str, &'a [String])>,
    {
        let mut state = ConstraintState::default();
        let units: Vec<(&str, &[String])> = units.into_iter().collect();
        for (_, keys) in &units {
            state.unify(keys);
        }

        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (id, keys) in &units {
            if let Some(first) = keys.first() {
                let root = state.find(first);
                grouped.entry(root).or_default().push(id.to_string());
            }
        }
        let mut groups: Vec<Vec<String>> = grouped.into_values().collect();
        groups.sort();
        groups
    }
}

/// Admission held by one unit, released on drop
pub struct ConstraintHold<'a> {
    scheduler: &'a ConstraintScheduler,
    id: &'a str,
    keys: &'a [String],
}

impl Drop for ConstraintHold<'_> {
    fn drop(&mut self) {
        let admitted = self.scheduler.release(self.id, self.keys);
        if !admitted.is_empty() {
            debug!("{} released constraint group to {:?}", self.id, admitted);
        }
    }
}
