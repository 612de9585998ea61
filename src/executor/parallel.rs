//! Parallel execution controller
//!
//! Bounds concurrency with a global worker semaphore. A ready unit passes
//! four gates in a fixed order: its named parallel limit, its parallel
//! group, constraint key admission, then a worker slot. Every gate is a
//! guard released in reverse, also when the unit's task unwinds.

use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;
use tracing::{debug, info};

use super::runner::{Job, UnitRunner};
use crate::models::TestResult;
use crate::scheduling::{ConstraintScheduler, ParallelGroupGate, ParallelLimiter};

pub struct ParallelController {
    runner: Arc<UnitRunner>,
    constraints: Arc<ConstraintScheduler>,
    limiter: ParallelLimiter,
    groups: ParallelGroupGate,
    workers: Arc<Semaphore>,
    max_parallelism: usize,
    halt: Mutex<Option<String>>,
}

impl ParallelController {
    pub fn new(
        runner: Arc<UnitRunner>,
        constraints: Arc<ConstraintScheduler>,
        max_parallelism: usize,
    ) -> Self {
        let max_parallelism = max_parallelism.max(1);
        Self {
            runner,
            constraints,
            limiter: ParallelLimiter::new(),
            groups: ParallelGroupGate::new(),
            workers: Arc::new(Semaphore::new(max_parallelism)),
            max_parallelism,
            halt: Mutex::new(None),
        }
    }

    pub fn runner(&self) -> &Arc<UnitRunner> {
        &self.runner
    }

    /// Stop starting new units; those not yet running are skipped with `reason`
    pub fn halt(&self, reason: impl Into<String>) {
        let mut halt = self.halt.lock().unwrap_or_else(PoisonError::into_inner);
        if halt.is_none() {
            let reason = reason.into();
            info!("Halting execution: {}", reason);
            *halt = Some(reason);
        }
    }

    pub fn halted(&self) -> Option<String> {
        self.halt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of units executing right now
    pub fn active(&self) -> usize {
        self.max_parallelism - self.workers.available_permits()
    }

    /// Run a ready unit once it clears every admission gate
    pub async fn drive(&self, job: Job) -> TestResult {
        let unit = job.unit.clone();
        if let Some(reason) = unit.skip_reason.clone() {
            return self.runner.skip(job, reason).await;
        }

        let limit = self.limiter.acquire(unit.parallel_limit.as_ref()).await;
        let group = self
            .groups
            .enter(&unit.id, unit.parallel_group.as_deref())
            .await;
        let hold = self
            .constraints
            .hold(&unit.id, &unit.constraint_keys, unit.constraint_order)
            .await;
        let worker = self.workers.clone().acquire_owned().await.ok();
        debug!("{} admitted ({} active)", unit.id, self.active());

        let result = match self.halted() {
            Some(reason) => self.runner.skip(job, reason).await,
            None => self.runner.run(job).await,
        };

        drop(worker);
        drop(hold);
        drop(group);
        drop(limit);
        result
    }
}
