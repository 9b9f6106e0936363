// src/dag/vertex.rs

//! A single schedulable step.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio_util::sync::CancellationToken;

use crate::dag::context::{ExecutionContext, State};
use crate::dag::error::DagError;
use crate::dag::graph::{Graph, GraphInner};

/// Future returned by a step function.
pub type VertexFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Step function: `(execution token, graph name, vertex name) -> result`.
///
/// The token is cancelled when the step is killed, its graph is killed, or
/// the caller's token passed to [`Graph::run`] fires.
pub type VertexFn = Arc<dyn Fn(CancellationToken, String, String) -> VertexFuture + Send + Sync>;

/// Compiled wiring of a vertex inside its graph.
#[derive(Default)]
pub(crate) struct Links {
    /// 1-based position in the owning graph; 0 while unattached.
    pub(crate) id: usize,
    pub(crate) graph: Weak<GraphInner>,
    pub(crate) deps: Vec<Vertex>,
    /// Positions of the vertices that depend on this one.
    pub(crate) adjs: Vec<usize>,
    pub(crate) ndeps: usize,
    pub(crate) root: bool,
}

pub(crate) struct VertexInner {
    pub(crate) ctx: ExecutionContext,
    func: VertexFn,
    links: Mutex<Links>,
}

/// Handle to a step. Cloning is cheap and refers to the same step.
#[derive(Clone)]
pub struct Vertex {
    pub(crate) inner: Arc<VertexInner>,
}

impl fmt::Debug for Vertex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vertex")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Vertex {
    /// Create a vertex from an async closure.
    pub fn new<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(CancellationToken, String, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let func: VertexFn = Arc::new(
            move |ctx: CancellationToken, graph: String, vertex: String| -> VertexFuture {
                Box::pin(func(ctx, graph, vertex))
            },
        );
        Self::from_fn(name, func)
    }

    /// Create a vertex from an already boxed step function.
    pub fn from_fn(name: impl Into<String>, func: VertexFn) -> Self {
        Self {
            inner: Arc::new(VertexInner {
                ctx: ExecutionContext::new(name),
                func,
                links: Mutex::new(Links::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.ctx.name()
    }

    /// Position in the owning graph (1-based); 0 if not added to a graph.
    pub fn id(&self) -> usize {
        self.links().id
    }

    /// The graph this vertex was added to, if it is still alive.
    pub fn graph(&self) -> Option<Graph> {
        self.links().graph.upgrade().map(|inner| Graph { inner })
    }

    /// Whether the last compile found no dependencies for this vertex.
    pub fn is_root(&self) -> bool {
        self.links().root
    }

    /// Names of the direct dependencies.
    pub fn dependencies(&self) -> Vec<String> {
        self.links()
            .deps
            .iter()
            .map(|d| d.name().to_string())
            .collect()
    }

    pub fn ptr_eq(&self, other: &Vertex) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn links(&self) -> MutexGuard<'_, Links> {
        self.inner.links.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn call(&self, token: CancellationToken, graph: &str) -> VertexFuture {
        (self.inner.func)(token, graph.to_string(), self.name().to_string())
    }

    /// Declare dependencies of this vertex.
    ///
    /// Dependencies not yet attached to a graph are added to this vertex's
    /// graph first, so a graph can be built by adding only its terminal
    /// vertices and wiring dependencies backwards. On a vertex outside any
    /// graph the edges are recorded and attached by [`crate::dag::Graph::add_vertex`].
    pub fn with_deps<'a>(&self, deps: impl IntoIterator<Item = &'a Vertex>) -> Result<(), DagError> {
        let deps: Vec<Vertex> = deps.into_iter().cloned().collect();

        if let Some(graph) = self.graph() {
            for dep in &deps {
                if dep.id() == 0 {
                    graph.add_vertex(dep)?;
                }
            }
        }

        self.links().deps.extend(deps);
        Ok(())
    }

    /// Forced kill of this vertex only.
    pub fn kill(&self) -> Result<(), DagError> {
        self.inner.ctx.kill()?;
        if let Some(graph) = self.graph() {
            graph
                .inner
                .events
                .try_emit(format!("kill step {} in task {}", self.name(), graph.name()));
        }
        Ok(())
    }

    /// Pause before (or right after) execution. See
    /// [`ExecutionContext::pause`] for the duration rules.
    pub fn pause(&self, duration: &str) -> Result<(), DagError> {
        if self.inner.ctx.pause(duration) {
            if let Some(graph) = self.graph() {
                graph
                    .inner
                    .events
                    .try_emit(format!("pause step {} in task {}", self.name(), graph.name()));
            }
        }
        Ok(())
    }

    pub fn resume(&self) {
        if self.inner.ctx.resume() {
            if let Some(graph) = self.graph() {
                graph
                    .inner
                    .events
                    .try_emit(format!("resume step {} in task {}", self.name(), graph.name()));
            }
        }
    }

    pub async fn wait_resume(&self) {
        self.inner.ctx.wait_resume().await
    }

    pub fn state(&self) -> State {
        self.inner.ctx.state()
    }
}
