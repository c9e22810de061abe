//! I/O helpers for harness commands.

pub mod artifacts;
pub mod backoff;
pub mod checks;
pub mod command;
pub mod config;
pub mod events;
pub mod plan_store;
pub mod process;
pub mod report;
