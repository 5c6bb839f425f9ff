//! Evaluator: compile once, run every test case, decide one verdict.
//!
//! Execution itself is delegated to [`crate::runner::Sandbox`]; this module
//! only interprets results.

pub mod compare;
pub mod exec;
pub mod model;

pub use compare::{Comparator, ComparatorKind};
pub use exec::Evaluator;
pub use model::{Evaluation, ScoringMode, Stage, Submission, TestCaseSpec, Verdict};
