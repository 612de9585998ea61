//! Streaming discovery pipeline
//!
//! Bridges an asynchronous stream of discovered units to the engine so
//! execution starts before discovery ends. A circuit breaker bounds total
//! discovery time and the number of units; tripping it aborts discovery
//! with a fatal diagnostic instead of truncating the test set silently.

pub mod plan;

pub use plan::TestPlan;

use futures::{Stream, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::models::TestUnit;

/// Bounded so a fast producer cannot run ahead of the engine unchecked
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
pub enum DiscoveryEvent {
    Unit(TestUnit),
    Finished { count: usize },
    Aborted(EngineError),
}

#[derive(Clone, Debug)]
pub struct DiscoveryPipeline {
    timeout: Duration,
    max_units: usize,
}

impl DiscoveryPipeline {
    pub fn new(timeout: Duration, max_units: usize) -> Self {
        Self { timeout, max_units }
    }

    /// Consume the stream on a background task
    ///
    /// The receiver always ends with exactly one `Finished` or `Aborted`
    /// event unless it is dropped first.
    pub fn spawn<S>(self, discovery: S) -> mpsc::Receiver<DiscoveryEvent>
    where
        S: Stream<Item = TestUnit> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let last = self.drain(discovery, &tx).await;
            let _ = tx.send(last).await;
        });
        rx
    }

    async fn drain<S>(&self, discovery: S, tx: &mpsc::Sender<DiscoveryEvent>) -> DiscoveryEvent
    where
        S: Stream<Item = TestUnit> + Send,
    {
        let deadline = Instant::now() + self.timeout;
        let mut discovery = Box::pin(discovery);
        let mut count = 0usize;

        loop {
            match tokio::time::timeout_at(deadline, discovery.next()).await {
                Err(_) => {
                    let error = EngineError::DiscoveryAborted(format!(
                        "discovery exceeded {}s after {} unit(s)",
                        self.timeout.as_secs_f64(),
                        count
                    ));
                    warn!("{}", error);
                    return DiscoveryEvent::Aborted(error);
                }
                Ok(None) => {
                    info!("Discovery finished: {} unit(s)", count);
                    return DiscoveryEvent::Finished { count };
                }
                Ok(Some(unit)) => {
                    count += 1;
                    if count > self.max_units {
                        let error = EngineError::DiscoveryAborted(format!(
                            "more than {} units discovered",
                            self.max_units
                        ));
                        warn!("{}", error);
                        return DiscoveryEvent::Aborted(error);
                    }
                    debug!("Discovered {}", unit.id);
                    if tx.send(DiscoveryEvent::Unit(unit)).await.is_err() {
                        return DiscoveryEvent::Finished { count };
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(mut rx: mpsc::Receiver<DiscoveryEvent>) -> (Vec<String>, DiscoveryEvent) {
        let mut ids = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                DiscoveryEvent::Unit(unit) => ids.push(unit.id),
                last => return (ids, last),
            }
        }
        panic!("stream ended without a terminal event");
    }

    #[tokio::test]
    async fn test_streams_all_units() {
        let units = (0..3).map(|i| TestUnit::new(format!("t{i}")));
        let pipeline = DiscoveryPipeline::new(Duration::from_secs(5), 10);
        let (ids, last) = collect(pipeline.spawn(futures::stream::iter(units))).await;
        assert_eq!(ids, vec!["t0", "t1", "t2"]);
        assert!(matches!(last, DiscoveryEvent::Finished { count: 3 }));
    }

    #[tokio::test]
    async fn test_unit_cap_trips_breaker() {
        let units = (0..5).map(|i| TestUnit::new(format!("t{i}")));
        let pipeline = DiscoveryPipeline::new(Duration::from_secs(5), 2);
        let (ids, last) = collect(pipeline.spawn(futures::stream::iter(units))).await;
        assert_eq!(ids.len(), 2);
        assert!(matches!(last, DiscoveryEvent::Aborted(EngineError::DiscoveryAborted(_))));
    }

    #[tokio::test]
    async fn test_slow_discovery_trips_breaker() {
        let never_ends = futures::stream::iter(vec![TestUnit::new("first")])
            .chain(futures::stream::pending());
        let pipeline = DiscoveryPipeline::new(Duration::from_millis(30), 10);
        let (ids, last) = collect(pipeline.spawn(never_ends)).await;
        assert_eq!(ids, vec!["first"]);
        assert!(matches!(last, DiscoveryEvent::Aborted(_)));
    }
}
