//! Experiment step harness.
//!
//! Runs the steps of an experiment plan under a timeout and retry policy,
//! evaluates declarative checks against the artifacts each attempt leaves
//! behind, and persists machine-readable state for an external agent that
//! reads it between runs. The crate is split the same way throughout:
//!
//! - **[`core`]**: Pure, deterministic logic (plan model, comparisons, invariants,
//!   retry decisions). No I/O.
//! - **[`io`]**: Side-effecting operations (plan and config files, process
//!   execution, check evaluation, artifacts, events). Trait seams allow
//!   scripted replacements in tests.
//!
//! Orchestration modules ([`step`], [`plan`], [`validate`]) combine core logic
//! with I/O to implement the CLI commands.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod plan;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;
