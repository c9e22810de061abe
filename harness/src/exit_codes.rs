//! Stable exit codes for harness CLI commands.

/// The step, the plan or the validation succeeded.
pub const OK: i32 = 0;
/// A step or plan failed, the plan was invalid, or the harness hit an error.
pub const FAILURE: i32 = 1;
