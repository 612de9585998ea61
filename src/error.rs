//! Engine error taxonomy
//!
//! Every failure the engine can attribute to a test, a hook, a shared
//! resource or discovery itself.

use std::time::Duration;
use thiserror::Error;

use crate::hooks::{HookDirection, HookScope};
use crate::models::{Failure, FailureKind};

/// Errors raised by the execution engine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("circular dependency detected: {}", cycle.join(" -> "))]
    CircularDependency { test: String, cycle: Vec<String> },

    #[error("dependency '{target}' of test '{test}' was never discovered")]
    MissingDependency { test: String, target: String },

    #[error("duplicate test id '{0}'")]
    DuplicateTest(String),

    #[error("{direction} {scope} hook '{hook}' failed: {message}")]
    HookFailure {
        hook: String,
        scope: HookScope,
        direction: HookDirection,
        message: String,
    },

    #[error("test body failed: {0}")]
    BodyFailure(String),

    #[error("shared resource '{resource}' failed to initialize: {message}")]
    ResourceInitialization { resource: String, message: String },

    #[error("shared resource definitions form a cycle: {}", .0.join(" -> "))]
    ResourceCycle(Vec<String>),

    #[error("unknown shared resource '{0}'")]
    UnknownResource(String),

    #[error("disposal of shared resource '{resource}' failed: {message}")]
    Disposal { resource: String, message: String },

    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("discovery aborted: {0}")]
    DiscoveryAborted(String),
}

impl EngineError {
    /// Classify this error for test result reporting
    pub fn kind(&self) -> FailureKind {
        match self {
            EngineError::CircularDependency { .. }
            | EngineError::MissingDependency { .. }
            | EngineError::DuplicateTest(_)
            | EngineError::ResourceCycle(_)
            | EngineError::UnknownResource(_)
            | EngineError::DiscoveryAborted(_) => FailureKind::Discovery,
            EngineError::HookFailure {
                scope, direction, ..
            } => FailureKind::Hook {
                scope: *scope,
                direction: *direction,
            },
            EngineError::BodyFailure(_) => FailureKind::Body,
            EngineError::ResourceInitialization { .. } => FailureKind::ResourceInitialization,
            EngineError::Disposal { .. } => FailureKind::Disposal,
            EngineError::Timeout(_) => FailureKind::Timeout,
        }
    }
}

impl From<EngineError> for Failure {
    fn from(error: EngineError) -> Self {
        Failure::new(error.kind(), error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_path() {
        let error = EngineError::CircularDependency {
            test: "a".to_string(),
            cycle: vec!["a".to_string(), "b".to_string(), "a".to_string()],
        };
        assert_eq!(error.to_string(), "circular dependency detected: a -> b -> a");
        assert_eq!(error.kind(), FailureKind::Discovery);
    }

    #[test]
    fn test_hook_failure_is_tagged_with_scope() {
        let error = EngineError::HookFailure {
            hook: "start_db".to_string(),
            scope: HookScope::Class,
            direction: HookDirection::Before,
            message: "boom".to_string(),
        };
        let failure = Failure::from(error);
        assert_eq!(
            failure.kind,
            FailureKind::Hook {
                scope: HookScope::Class,
                direction: HookDirection::Before
            }
        );
        assert!(failure.message.contains("start_db"));
    }

    #[test]
    fn test_timeout_display() {
        let error = EngineError::Timeout(Duration::from_millis(250));
        assert_eq!(error.to_string(), "timed out after 250ms");
    }
}
