//! Engine event stream
//!
//! Per-test state transitions plus session start/end, fanned out to every
//! subscriber (reporters, IDE adapters).

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

use super::{Failure, TestState};

/// A state transition observed by the engine
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    SessionStarted {
        at: DateTime<Utc>,
    },
    Discovered {
        id: String,
    },
    Ready {
        id: String,
    },
    Running {
        id: String,
        attempt: u32,
    },
    Retrying {
        id: String,
        attempt: u32,
    },
    Passed {
        id: String,
        attempts: u32,
    },
    Failed {
        id: String,
        failure: Failure,
        attempts: u32,
    },
    Skipped {
        id: String,
        reason: String,
    },
    SessionFinished {
        at: DateTime<Utc>,
        passed: usize,
        failed: usize,
        skipped: usize,
    },
}

impl EngineEvent {
    /// Id of the test this event concerns, if any
    pub fn test_id(&self) -> Option<&str> {
        match self {
            EngineEvent::Discovered { id }
            | EngineEvent::Ready { id }
            | EngineEvent::Running { id, .. }
            | EngineEvent::Retrying { id, .. }
            | EngineEvent::Passed { id, .. }
            | EngineEvent::Failed { id, .. }
            | EngineEvent::Skipped { id, .. } => Some(id),
            EngineEvent::SessionStarted { .. } | EngineEvent::SessionFinished { .. } => None,
        }
    }

    /// State the test entered with this event
    pub fn state(&self) -> Option<TestState> {
        match self {
            EngineEvent::Discovered { .. } => Some(TestState::Discovered),
            EngineEvent::Ready { .. } => Some(TestState::Ready),
            EngineEvent::Running { .. } => Some(TestState::Running),
            EngineEvent::Retrying { attempt, .. } => Some(TestState::Retrying { attempt: *attempt }),
            EngineEvent::Passed { .. } => Some(TestState::Passed),
            EngineEvent::Failed { .. } => Some(TestState::Failed),
            EngineEvent::Skipped { .. } => Some(TestState::Skipped),
            EngineEvent::SessionStarted { .. } | EngineEvent::SessionFinished { .. } => None,
        }
    }
}

/// Fan-out publisher for engine events
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<EngineEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber; it sees every event published afterwards
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<EngineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Publish to every live subscriber, dropping closed ones
    pub fn publish(&self, event: EngineEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(EngineEvent::Ready { id: "a".into() });

        assert_eq!(first.try_recv().unwrap().test_id(), Some("a"));
        assert_eq!(second.try_recv().unwrap().test_id(), Some("a"));
    }

    #[test]
    fn test_closed_subscribers_are_dropped() {
        let bus = EventBus::new();
        let closed = bus.subscribe();
        drop(closed);
        let mut open = bus.subscribe();

        bus.publish(EngineEvent::Discovered { id: "x".into() });
        assert!(open.try_recv().is_ok());
        assert_eq!(bus.subscribers.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = EngineEvent::Retrying {
            id: "flaky".into(),
            attempt: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "retrying");
        assert_eq!(json["attempt"], 2);
    }

    #[test]
    fn test_event_state() {
        let retry = EngineEvent::Retrying {
            id: "flaky".into(),
            attempt: 2,
        };
        assert_eq!(retry.state(), Some(TestState::Retrying { attempt: 2 }));
        assert_eq!(retry.state().map(|s| s.to_string()).as_deref(), Some("retrying (attempt 2)"));
        let skipped = EngineEvent::Skipped {
            id: "a".into(),
            reason: "off".into(),
        };
        assert!(skipped.state().is_some_and(|s| s.is_terminal()));
        assert_eq!(EngineEvent::SessionStarted { at: Utc::now() }.state(), None);
    }
}
