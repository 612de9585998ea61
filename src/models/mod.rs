//! Data models for the execution engine
//!
//! Test units, outcomes, results, events and session summaries.

mod event;
mod outcome;
mod summary;
mod unit;

pub use event::{EngineEvent, EventBus};
pub use outcome::{Failure, FailureKind, Outcome, TestResult, TestStatus};
pub use summary::{Diagnostic, DiagnosticKind, RunSummary};
pub use unit::{
    DependencySpec, InstanceMatch, ParallelLimit, ResourceRequest, SharedScope, TestBody,
    TestState, TestUnit, DEFAULT_ASSEMBLY, DEFAULT_CLASS,
};
