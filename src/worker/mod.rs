//! Shard execution.
//!
//! [`Executor`] is the seam between the scheduler and whatever actually runs
//! a shard; [`ShellExecutor`] runs commands through `sh -c` and writes the
//! per-shard result files (`exitCode`, `stdout`, `stderr`).

pub mod executor;

pub use executor::{write_results, Executor, ShellExecutor};
