//! Engine modules: the ordered step pipeline and its end-of-run report.
//!
//! The engine sits between configuration (which steps, in what order) and
//! execution (the step runner). It decides per step whether to resume, skip,
//! or run, and persists every transition.

pub mod orchestrator;
pub mod summary;
