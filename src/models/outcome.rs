//! Test outcome and result models
//!
//! Defines what a body returns, how failures are classified and the
//! terminal result reported for every test.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::TestUnit;
use crate::hooks::{HookDirection, HookScope};

/// Value returned by a test body for one attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Pass,
    Fail(String),
    Skip(String),
    /// Explicit request for another attempt; fails once the budget is spent
    Retry(String),
}

/// Origin of a test failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    Discovery,
    Hook {
        scope: HookScope,
        direction: HookDirection,
    },
    Body,
    ResourceInitialization,
    Disposal,
    Timeout,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Discovery => write!(f, "discovery"),
            FailureKind::Hook { scope, direction } => write!(f, "hook ({direction} {scope})"),
            FailureKind::Body => write!(f, "body"),
            FailureKind::ResourceInitialization => write!(f, "resource initialization"),
            FailureKind::Disposal => write!(f, "disposal"),
            FailureKind::Timeout => write!(f, "timeout"),
        }
    }
}

/// A classified failure
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn body(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Body, message)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

/// Terminal status of a test
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
}

impl TestStatus {
    pub fn symbol(&self) -> &'static str {
        match self {
            TestStatus::Passed => "✓",
            TestStatus::Failed => "✗",
            TestStatus::Skipped => "○",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TestStatus::Passed)
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestStatus::Passed => write!(f, "PASS"),
            TestStatus::Failed => write!(f, "FAIL"),
            TestStatus::Skipped => write!(f, "SKIP"),
        }
    }
}

/// Terminal result of a single test
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestResult {
    pub id: String,
    pub name: String,
    pub class_name: String,
    pub assembly: String,
    pub status: TestStatus,
    pub attempts: u32,
    pub duration_ms: u64,
    pub failure: Option<Failure>,
    pub skip_reason: Option<String>,
    /// False for tests that only ran because a selected test depends on them
    pub visible: bool,
    pub finished_at: DateTime<Utc>,
}

impl TestResult {
    fn base(unit: &TestUnit, status: TestStatus, attempts: u32, duration_ms: u64) -> Self {
        Self {
            id: unit.id.clone(),
            name: unit.name.clone(),
            class_name: unit.class_name.clone(),
            assembly: unit.assembly.clone(),
            status,
            attempts,
            duration_ms,
            failure: None,
            skip_reason: None,
            visible: unit.selected,
            finished_at: Utc::now(),
        }
    }

    pub fn passed(unit: &TestUnit, attempts: u32, duration_ms: u64) -> Self {
        Self::base(unit, TestStatus::Passed, attempts, duration_ms)
    }

    pub fn failed(unit: &TestUnit, failure: Failure, attempts: u32, duration_ms: u64) -> Self {
        Self {
            failure: Some(failure),
            ..Self::base(unit, TestStatus::Failed, attempts, duration_ms)
        }
    }

    pub fn skipped(unit: &TestUnit, reason: impl Into<String>, attempts: u32) -> Self {
        Self {
            skip_reason: Some(reason.into()),
            ..Self::base(unit, TestStatus::Skipped, attempts, 0)
        }
    }

    pub fn message(&self) -> Option<String> {
        match self.status {
            TestStatus::Passed => None,
            TestStatus::Failed => self.failure.as_ref().map(|f| f.to_string()),
            TestStatus::Skipped => self.skip_reason.clone(),
        }
    }
}

impl fmt::Display for TestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}::{} [{}ms, {} attempt(s)]",
            self.status.symbol(),
            self.class_name,
            self.id,
            self.duration_ms,
            self.attempts
        )?;
        if let Some(msg) = self.message() {
            write!(f, " - {msg}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_creation() {
        let unit = TestUnit::new("login").in_class("AuthTests");
        let result = TestResult::passed(&unit, 2, 40);
        assert!(result.status.is_success());
        assert_eq!(result.attempts, 2);
        assert!(result.visible);
        assert!(result.message().is_none());
    }

    #[test]
    fn test_failed_result_carries_kind() {
        let unit = TestUnit::new("login").deselected();
        let result = TestResult::failed(&unit, Failure::body("assertion failed"), 3, 10);
        assert_eq!(result.status, TestStatus::Failed);
        assert!(!result.visible);
        assert_eq!(
            result.message().as_deref(),
            Some("[body] assertion failed")
        );
    }

    #[test]
    fn test_failure_kind_serializes_tagged() {
        let kind = FailureKind::Hook {
            scope: HookScope::Class,
            direction: HookDirection::Before,
        };
        let json = serde_json::to_value(kind).unwrap();
        assert_eq!(json["kind"], "hook");
        assert_eq!(json["scope"], "class");
        assert_eq!(json["direction"], "before");
    }

    #[test]
    fn test_skipped_display() {
        let unit = TestUnit::new("checkout");
        let result = TestResult::skipped(&unit, "dependency 'login' failed", 0);
        let text = result.to_string();
        assert!(text.starts_with("○ Default::checkout"));
        assert!(text.ends_with("dependency 'login' failed"));
    }
}
