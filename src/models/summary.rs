//! Session summary models
//!
//! Aggregates terminal results and the supplementary diagnostics of a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{TestResult, TestStatus};

/// Category of a session-level diagnostic
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    Discovery,
    Hook,
    Disposal,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticKind::Discovery => write!(f, "discovery"),
            DiagnosticKind::Hook => write!(f, "hook"),
            DiagnosticKind::Disposal => write!(f, "disposal"),
        }
    }
}

/// Supplementary warning attached to the session summary, never to a test
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub subject: String,
    pub message: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            subject: subject.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.kind, self.subject, self.message)
    }
}

/// Summary of one test session
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Tests executed only because a selected test depends on them
    pub hidden: usize,
    pub duration_ms: u64,
    /// Fatal discovery error that cut the session short
    pub aborted: Option<String>,
    pub results: Vec<TestResult>,
    pub diagnostics: Vec<Diagnostic>,
}

impl RunSummary {
    pub fn new(
        started_at: DateTime<Utc>,
        results: Vec<TestResult>,
        diagnostics: Vec<Diagnostic>,
        aborted: Option<String>,
    ) -> Self {
        let finished_at = Utc::now();
        let count = |status: TestStatus| {
            results
                .iter()
                .filter(|r| r.visible && r.status == status)
                .count()
        };
        let passed = count(TestStatus::Passed);
        let failed = count(TestStatus::Failed);
        let skipped = count(TestStatus::Skipped);
        let hidden = results.iter().filter(|r| !r.visible).count();
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;

        Self {
            started_at,
            finished_at,
            total: passed + failed + skipped,
            passed,
            failed,
            skipped,
            hidden,
            duration_ms,
            aborted,
            results,
            diagnostics,
        }
    }

    pub fn pass_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.passed as f64 / self.total as f64) * 100.0
        }
    }

    /// True when no visible test failed and discovery completed
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.aborted.is_none()
    }

    pub fn result(&self, id: &str) -> Option<&TestResult> {
        self.results.iter().find(|r| r.id == id)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Test Session - {}", self.started_at.format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        for result in self.results.iter().filter(|r| r.visible) {
            writeln!(f, "  {result}")?;
        }
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        writeln!(
            f,
            "Total: {} | Pass: {} | Fail: {} | Skip: {}",
            self.total, self.passed, self.failed, self.skipped
        )?;
        for diagnostic in &self.diagnostics {
            writeln!(f, "warning: {diagnostic}")?;
        }
        if let Some(reason) = &self.aborted {
            writeln!(f, "ABORTED: {reason}")?;
        }
        writeln!(
            f,
            "Pass Rate: {:.1}% | Duration: {}ms",
            self.pass_rate(),
            self.duration_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Failure, TestUnit};

    #[test]
    fn test_summary_counts_visible_only() {
        let a = TestUnit::new("a");
        let b = TestUnit::new("b");
        let hidden = TestUnit::new("setup").deselected();
        let results = vec![
            TestResult::passed(&a, 1, 10),
            TestResult::failed(&b, Failure::body("nope"), 2, 5),
            TestResult::passed(&hidden, 1, 3),
        ];

        let summary = RunSummary::new(Utc::now(), results, Vec::new(), None);
        assert_eq!(summary.total, 2);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.hidden, 1);
        assert!(!summary.is_success());
        assert_eq!(summary.pass_rate(), 50.0);
    }

    #[test]
    fn test_aborted_summary_is_not_success() {
        let summary = RunSummary::new(Utc::now(), Vec::new(), Vec::new(), Some("timeout".into()));
        assert!(!summary.is_success());
        assert!(summary.to_string().contains("ABORTED: timeout"));
    }
}
