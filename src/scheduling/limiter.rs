//! Named parallel limits
//!
//! A secondary semaphore per limit name, shared by every test declaring it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::models::ParallelLimit;

#[derive(Debug, Default)]
pub struct ParallelLimiter {
    semaphores: Mutex<HashMap<String, (usize, Arc<Semaphore>)>>,
}

impl ParallelLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn semaphore(&self, limit: &ParallelLimit) -> Arc<Semaphore> {
        let mut semaphores = self
            .semaphores
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (capacity, semaphore) = semaphores
            .entry(limit.name.clone())
            .or_insert_with(|| {
                debug!("Created parallel limit '{}' ({})", limit.name, limit.limit);
                (limit.limit, Arc::new(Semaphore::new(limit.limit)))
            });
        if *capacity != limit.limit {
            // The first declaration of a name fixes its capacity
            warn!(
                "Parallel limit '{}' redeclared as {}, keeping {}",
                limit.name, limit.limit, capacity
            );
        }
        semaphore.clone()
    }

    /// Wait for a slot under the unit's named limit, if it has one
    pub async fn acquire(&self, limit: Option<&ParallelLimit>) -> Option<OwnedSemaphorePermit> {
        let semaphore = self.semaphore(limit?);
        semaphore.acquire_owned().await.ok()
    }

    pub fn available(&self, name: &str) -> Option<usize> {
        self.semaphores
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|(_, s)| s.available_permits())
    }
}
