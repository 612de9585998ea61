//! Scheduling
//!
//! Dependency resolution, constraint key admission, parallel groups and
//! named parallel limits.

pub mod constraints;
pub mod groups;
pub mod limiter;
pub mod resolver;

pub use constraints::{Admission, ConstraintHold, ConstraintScheduler};
pub use groups::{GroupPermit, ParallelGroupGate};
pub use limiter::ParallelLimiter;
pub use resolver::{DependencyResolver, Resolution};
