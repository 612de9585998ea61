//! Test Orchestrator - parallel test execution engine
//!
//! Turns a stream of discovered test units into terminal results while
//! honouring declared dependencies, mutual-exclusion constraint keys,
//! scoped shared resources, lifecycle hooks, retries and timeouts.
//!
//! ## Usage
//!
//! ```no_run
//! use test_orchestrator::config::EngineConfig;
//! use test_orchestrator::executor::Engine;
//! use test_orchestrator::models::{DependencySpec, Outcome, TestUnit};
//!
//! # async fn demo() -> Result<(), test_orchestrator::error::EngineError> {
//! let login = TestUnit::new("login").body(|_| async { Outcome::Pass });
//! let checkout = TestUnit::new("checkout")
//!     .depends_on(DependencySpec::on("login"))
//!     .constraint_key("orders-table");
//!
//! let summary = Engine::new(EngineConfig::default())
//!     .run_units(vec![checkout, login])
//!     .await?;
//! assert!(summary.is_success());
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod context;
pub mod discovery;
pub mod error;
pub mod executor;
pub mod hooks;
pub mod models;
pub mod output;
pub mod resources;
pub mod scheduling;
pub mod utils;

pub use config::EngineConfig;
pub use error::EngineError;
pub use executor::Engine;
pub use models::{RunSummary, TestUnit};
