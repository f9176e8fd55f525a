//! # Fault Localization
//!
//! Statement-level fault localization for test suites.
//!
//! This library provides functionality to:
//! - Run test files on isolated workers and attribute coverage to each test
//! - Aggregate pass/fail evidence per statement
//! - Rank statements with spectrum based formulas (dStar, Ochiai, Tarantula, Barinel, Op2)
//! - Rank statements by mutating the syntax tree and re-running the affected tests
//! - Score a ranking against known faults with the EXAM metric
//!
//! Running tests needs a [`worker::TestHarness`] for the framework under
//! test, so [`runner::run_tests`] and [`mutation::localize_by_mutation`] are
//! library entry points only. The binary works from recorded outcomes. Seed
//! the scheduler from earlier runs with [`runner::RunnerOptions::with_history`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use fault_localization::prelude::*;
//! use std::path::Path;
//!
//! fn main() -> Result<()> {
//!     let outcomes: Vec<TestOutcome> =
//!         serde_json::from_str(&std::fs::read_to_string("outcomes.json")?)?;
//!     let file_results = gather_file_results(&outcomes);
//!     let faults = localize_faults(
//!         &outcomes,
//!         &file_results,
//!         &IgnoreGlobs::default(),
//!         Formula::Dstar.scorer(2.0),
//!     );
//!     record_faults(Path::new("./faults/faults.json"), &faults)?;
//!     Ok(())
//! }
//! ```

pub mod ast;
pub mod benchmark;
pub mod config;
pub mod coverage;
pub mod error;
pub mod evaluation;
pub mod evidence;
pub mod faults;
pub mod messages;
pub mod mutation;
pub mod operators;
pub mod runner;
pub mod sbfl;
pub mod sqlite;
pub mod worker;

pub use error::{FaultError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::ast::{AstMap, Node, NodeKind};
    pub use crate::benchmark::calculate_exam_score;
    pub use crate::config::FaultConfig;
    pub use crate::coverage::{CoverageSnapshot, CoverageStore, ExpressionSpan};
    pub use crate::error::{FaultError, Result};
    pub use crate::evidence::{gather_file_results, Stats};
    pub use crate::faults::{read_fault_file, record_faults, Fault};
    pub use crate::messages::TestOutcome;
    pub use crate::mutation::{localize_by_mutation, MutationTestRunner, SearchOptions};
    pub use crate::runner::{run_tests, RunnerOptions, TesterResults};
    pub use crate::sbfl::{localize_faults, Formula, IgnoreGlobs};
    pub use crate::worker::{TestContext, TestHarness};
}
