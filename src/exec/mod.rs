// src/exec/mod.rs

//! Shell step functions.
//!
//! - [`command`] runs a single shell command as a step, streaming its output
//!   to `tracing` and killing it when the step's token is cancelled.
//! - [`builder`] turns a validated task file into graphs of shell steps.

pub mod builder;
pub mod command;

pub use builder::{build_task_graph, build_task_graph_with};
pub use command::{shell_step, ShellCommand};
