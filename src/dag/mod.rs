// src/dag/mod.rs

//! Core DAG engine.
//!
//! - [`context`] carries per-node state and the cancellation scopes
//!   (lifecycle, execution, control).
//! - [`vertex`] is a single step with its step function and dependencies.
//! - [`graph`] compiles vertices into a DAG and runs it concurrently.
//! - [`error`] defines the errors all of the above report.

pub mod context;
pub mod error;
pub mod graph;
pub mod vertex;

pub use context::{with_timeout, ControlScope, ExecutionContext, State};
pub use error::DagError;
pub use graph::Graph;
pub use vertex::{Vertex, VertexFn, VertexFuture};
