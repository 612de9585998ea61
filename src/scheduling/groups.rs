//! Parallel groups
//!
//! Units sharing a parallel group name run concurrently with each other but
//! never alongside units of another group. Ungrouped units pass freely. One
//! group is active at a time; when it drains, the group of the earliest
//! waiter becomes active and all of its waiters are admitted together.
//!
//! Composes with constraint keys: a grouped unit that also carries keys is
//! serialised within its group by the constraint scheduler.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Debug)]
struct Waiter {
    group: String,
    id: String,
    wake: oneshot::Sender<()>,
}

#[derive(Debug, Default)]
struct GateState {
    active: Option<String>,
    running: usize,
    waiting: VecDeque<Waiter>,
}

impl GateState {
    /// Switch to the earliest waiter's group and admit every waiter of it
    fn rotate(&mut self) {
        while self.running == 0 {
            let Some(next) = self.waiting.front().map(|w| w.group.clone()) else {
                self.active = None;
                return;
            };
            let (admitted, rest): (VecDeque<Waiter>, VecDeque<Waiter>) = self
                .waiting
                .drain(..)
                .partition(|w| w.group == next);
            self.waiting = rest;
            for waiter in admitted {
                if waiter.wake.send(()).is_ok() {
                    debug!("Admitted {} with parallel group '{}'", waiter.id, next);
                    self.running += 1;
                }
            }
            self.active = Some(next);
        }
    }
}

#[derive(Debug, Default)]
pub struct ParallelGroupGate {
    state: Mutex<GateState>,
}

impl ParallelGroupGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait until the unit's group is the active one
    ///
    /// Returns `None` for ungrouped units. A unit does not join its already
    /// active group while another group is waiting, so groups cannot starve
    /// each other.
    pub async fn enter<'a>(&'a self, id: &str, group: Option<&'a str>) -> Option<GroupPermit<'a>> {
        let group = group?;
        let queued = {
            let mut state = self.lock();
            let idle = state.running == 0 && state.waiting.is_empty();
            let joinable = state.active.as_deref() == Some(group)
                && state.waiting.iter().all(|w| w.group == group);
            if idle || joinable {
                state.active = Some(group.to_string());
                state.running += 1;
                None
            } else {
                let (wake, rx) = oneshot::channel();
                state.waiting.push_back(Waiter {
                    group: group.to_string(),
                    id: id.to_string(),
                    wake,
                });
                debug!(
                    "{} waits for parallel group '{}' ({:?} active)",
                    id, group, state.active
                );
                Some(rx)
            }
        };

        if let Some(rx) = queued {
            if rx.await.is_err() {
                warn!("Parallel group gate for {} closed before grant", id);
            }
        }
        Some(GroupPermit { gate: self, group })
    }

    /// Name of the group currently running, if any
    pub fn active(&self) -> Option<String> {
        self.lock().active.clone()
    }

    fn leave(&self) {
        let mut state = self.lock();
        state.running = state.running.saturating_sub(1);
        state.rotate();
    }
}

/// Membership of the active parallel group, released on drop
#[derive(Debug)]
pub struct GroupPermit<'a> {
    gate: &'a ParallelGroupGate,
    group: &'a str,
}

impl GroupPermit<'_> {
    pub fn group(&self) -> &str {
        self.group
    }
}

impl Drop for GroupPermit<'_> {
    fn drop(&mut self) {
        self.gate.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_ungrouped_needs_no_permit() {
        let gate = ParallelGroupGate::new();
        assert!(gate.enter("a", None).await.is_none());
        assert!(gate.active().is_none());
    }

    #[tokio::test]
    async fn test_same_group_shares_the_gate() {
        let gate = ParallelGroupGate::new();
        let first = gate.enter("a", Some("io")).await;
        let second = gate.enter("b", Some("io")).await;
        assert_eq!(first.as_ref().map(|p| p.group()), Some("io"));
        assert!(second.is_some());
        assert_eq!(gate.active().as_deref(), Some("io"));

        drop(first);
        drop(second);
        assert!(gate.active().is_none());
    }

    #[test]
    fn test_other_group_waits_for_drain() {
        let gate = ParallelGroupGate::new();
        let held = tokio_test::block_on(gate.enter("a", Some("alpha")));

        let mut beta = tokio_test::task::spawn(gate.enter("b", Some("beta")));
        tokio_test::assert_pending!(beta.poll());
        // A late alpha member queues behind beta instead of jumping ahead
        let mut late = tokio_test::task::spawn(gate.enter("c", Some("alpha")));
        tokio_test::assert_pending!(late.poll());

        drop(held);
        assert!(beta.is_woken());
        let beta_permit = tokio_test::assert_ready!(beta.poll());
        tokio_test::assert_pending!(late.poll());
        assert_eq!(gate.active().as_deref(), Some("beta"));

        drop(beta_permit);
        assert!(tokio_test::assert_ready!(late.poll()).is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_groups_never_overlap() {
        let gate = Arc::new(ParallelGroupGate::new());
        let alpha = Arc::new(AtomicUsize::new(0));
        let beta = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let gate = gate.clone();
                let (mine, other) = if i % 2 == 0 {
                    (alpha.clone(), beta.clone())
                } else {
                    (beta.clone(), alpha.clone())
                };
                let overlap = overlap.clone();
                tokio::spawn(async move {
                    let group = if i % 2 == 0 { "alpha" } else { "beta" };
                    let id = format!("t{i}");
                    let _permit = gate.enter(&id, Some(group)).await;
                    mine.fetch_add(1, Ordering::SeqCst);
                    if other.load(Ordering::SeqCst) > 0 {
                        overlap.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    mine.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(overlap.load(Ordering::SeqCst), 0);
    }
}
