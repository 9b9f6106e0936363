// src/dag/graph.rs

//! Compiled step graph and its concurrent topological executor.
//!
//! Execution is a parallel Kahn's algorithm: every root vertex starts in its
//! own Tokio task, and a vertex is spawned by whichever dependency finishes
//! last (its remaining-dependency counter reaching zero). There is no
//! throttling inside a graph; admission control for whole graphs lives in
//! [`crate::engine::WorkerPool`].

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dag::context::{ExecutionContext, State};
use crate::dag::error::DagError;
use crate::dag::vertex::Vertex;
use crate::engine::events::{emit_event, EventBus};
use crate::engine::registry::{graph_key, vertex_key, Handle, Registry};
use crate::engine::Engine;

pub(crate) struct GraphInner {
    pub(crate) ctx: ExecutionContext,
    vertices: Mutex<Vec<Vertex>>,
    pub(crate) registry: Registry,
    pub(crate) events: EventBus,
}

/// Handle to a graph. Cloning is cheap and refers to the same graph.
#[derive(Clone)]
pub struct Graph {
    pub(crate) inner: Arc<GraphInner>,
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Graph {
    /// Create a graph and register it under `graph#<name>#graph`.
    pub fn new(name: impl Into<String>, engine: &Engine) -> Self {
        let graph = Self {
            inner: Arc::new(GraphInner {
                ctx: ExecutionContext::new(name),
                vertices: Mutex::new(Vec::new()),
                registry: engine.registry().clone(),
                events: engine.events().clone(),
            }),
        };
        graph.inner.ctx.init_lifecycle(None);
        graph
            .inner
            .registry
            .join(graph_key(graph.name()), Handle::Graph(graph.clone()));
        debug!(task = %graph.name(), "graph created");
        graph
    }

    pub fn name(&self) -> &str {
        self.inner.ctx.name()
    }

    pub fn ptr_eq(&self, other: &Graph) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn vertices_guard(&self) -> MutexGuard<'_, Vec<Vertex>> {
        self.inner.vertices_guard()
    }

    /// Snapshot of the vertices in insertion order.
    pub fn vertices(&self) -> Vec<Vertex> {
        self.vertices_guard().clone()
    }

    pub fn vertex(&self, name: &str) -> Option<Vertex> {
        self.vertices_guard()
            .iter()
            .find(|v| v.name() == name)
            .cloned()
    }

    /// Forced kill: cancels the graph's lifecycle and with it every vertex.
    pub fn kill(&self) -> Result<(), DagError> {
        self.inner.ctx.kill()?;
        self.inner.registry.remove(&graph_key(self.name()));
        self.inner
            .events
            .try_emit(format!("kill task {}", self.name()));
        info!(task = %self.name(), "graph killed");
        Ok(())
    }

    pub fn pause(&self, duration: &str) -> Result<(), DagError> {
        if self.inner.ctx.pause(duration) {
            self.inner
                .events
                .try_emit(format!("pause task {}", self.name()));
        }
        Ok(())
    }

    pub fn resume(&self) {
        if self.inner.ctx.resume() {
            self.inner
                .events
                .try_emit(format!("resume task {}", self.name()));
        }
    }

    pub async fn wait_resume(&self) {
        self.inner.ctx.wait_resume().await
    }

    pub fn state(&self) -> State {
        self.inner.ctx.state()
    }

    /// Add a vertex to this graph.
    ///
    /// Re-adding a vertex that is already part of this graph returns it
    /// unchanged. Adding after a successful compile fails with
    /// [`DagError::DuplicateCompile`].
    pub fn add_vertex(&self, vertex: &Vertex) -> Result<Vertex, DagError> {
        let mut vertices = self.vertices_guard();

        if self.inner.ctx.visited() {
            self.inner.events.try_emit(format!(
                "duplicate step {} in task {}",
                vertex.name(),
                self.name()
            ));
            return Err(DagError::DuplicateCompile);
        }

        let mut links = vertex.links();
        if links.id > 0 {
            let same_graph = links
                .graph
                .upgrade()
                .is_some_and(|g| Arc::ptr_eq(&g, &self.inner));
            if !same_graph {
                return Err(DagError::ForeignVertex(vertex.name().to_string()));
            }
            return vertices
                .get(links.id - 1)
                .cloned()
                .ok_or_else(|| DagError::ForeignVertex(vertex.name().to_string()));
        }

        // Vertex lifecycle hangs off the graph's, so a graph kill reaches it.
        vertex
            .inner
            .ctx
            .init_lifecycle(self.inner.ctx.lifecycle().as_ref());
        links.id = vertices.len() + 1;
        links.graph = Arc::downgrade(&self.inner);
        drop(links);

        vertices.push(vertex.clone());
        self.inner.registry.join(
            vertex_key(self.name(), vertex.name()),
            Handle::Vertex(vertex.clone()),
        );
        debug!(task = %self.name(), step = %vertex.name(), "vertex added");
        drop(vertices);

        // Dependencies declared before the vertex joined a graph follow it.
        let deps = vertex.links().deps.clone();
        for dep in deps.iter().filter(|d| d.id() == 0) {
            self.add_vertex(dep)?;
        }

        Ok(vertex.clone())
    }

    /// Compile the graph unless it is already compiled and `force` is false.
    pub fn validator(&self, force: bool) -> Result<(), DagError> {
        let mut vertices = self.vertices_guard();
        if vertices.is_empty() {
            return Err(DagError::EmptyGraph);
        }
        if self.inner.ctx.visited() && !force {
            return Ok(());
        }
        self.compile(&mut vertices)
    }

    /// Rebuild adjacency from dependencies and check for cycles.
    ///
    /// On failure the graph is left empty and uncompiled, and every vertex is
    /// detached so the caller can rebuild from scratch.
    fn compile(&self, vertices: &mut Vec<Vertex>) -> Result<(), DagError> {
        self.reset(vertices);

        let result = self
            .link_vertices(vertices)
            .and_then(|()| detect_cycle(vertices));

        match result {
            Ok(()) => {
                for v in vertices.iter() {
                    v.inner.ctx.set_visited(true);
                }
                self.inner.ctx.set_visited(true);
                debug!(task = %self.name(), vertices = vertices.len(), "graph compiled");
                Ok(())
            }
            Err(err) => {
                warn!(task = %self.name(), error = %err, "graph compile failed");
                for v in vertices.iter() {
                    let mut links = v.links();
                    links.id = 0;
                    links.graph = Default::default();
                    drop(links);
                    self.inner
                        .registry
                        .remove(&vertex_key(self.name(), v.name()));
                }
                vertices.clear();
                self.inner.ctx.set_visited(false);
                Err(err)
            }
        }
    }

    fn reset(&self, vertices: &[Vertex]) {
        self.inner.ctx.set_visited(false);
        for v in vertices {
            v.inner.ctx.set_visited(false);
            let mut links = v.links();
            links.adjs.clear();
            links.ndeps = 0;
            links.root = false;
        }
    }

    fn link_vertices(&self, vertices: &[Vertex]) -> Result<(), DagError> {
        let mut names = HashSet::new();
        let mut edges = Vec::new();

        for (idx, v) in vertices.iter().enumerate() {
            if !names.insert(v.name()) {
                return Err(DagError::DuplicateVertexName);
            }

            let deps = v.links().deps.clone();
            for dep in &deps {
                let dep_idx = dep.id().checked_sub(1);
                let attached = dep_idx
                    .and_then(|i| vertices.get(i))
                    .is_some_and(|known| known.ptr_eq(dep));
                match dep_idx {
                    Some(dep_idx) if attached => edges.push((dep_idx, idx)),
                    _ => {
                        return Err(DagError::UnknownDependency {
                            vertex: v.name().to_string(),
                            dep: dep.name().to_string(),
                        });
                    }
                }
            }

            let mut links = v.links();
            links.ndeps = deps.len();
            links.root = deps.is_empty();
        }

        // Edge dep -> v: v becomes an adjacency of dep.
        for (dep_idx, idx) in edges {
            vertices[dep_idx].links().adjs.push(idx);
        }

        Ok(())
    }

    /// Vertices grouped by depth: level 0 holds the roots, level `n` the
    /// vertices whose longest dependency chain has length `n`.
    pub fn plan(&self) -> Result<Vec<Vec<String>>, DagError> {
        self.validator(false)?;
        let vertices = self.vertices_guard();

        let adjs: Vec<Vec<usize>> = vertices.iter().map(|v| v.links().adjs.clone()).collect();
        // Counters are consumed by runs, so derive in-degrees from the edges.
        let mut indegree = vec![0usize; adjs.len()];
        for &adj in adjs.iter().flatten() {
            indegree[adj] += 1;
        }
        let mut current: Vec<usize> = (0..vertices.len()).filter(|&i| indegree[i] == 0).collect();
        let mut levels = Vec::new();

        while !current.is_empty() {
            let mut next = Vec::new();
            for &i in &current {
                for &adj in &adjs[i] {
                    indegree[adj] -= 1;
                    if indegree[adj] == 0 {
                        next.push(adj);
                    }
                }
            }
            levels.push(
                current
                    .iter()
                    .map(|&i| vertices[i].name().to_string())
                    .collect(),
            );
            current = next;
        }

        Ok(levels)
    }

    /// Run the graph to completion.
    ///
    /// `ctx` is the caller's token: cancelling it (or a deadline built with
    /// [`crate::dag::with_timeout`]) ends the run with [`DagError::Canceled`]
    /// reported by the affected steps, while [`Graph::kill`] ends it with
    /// [`DagError::ForceKill`]. A failing step does not stop independent
    /// branches; all step errors are joined into the returned error.
    pub async fn run(&self, ctx: CancellationToken) -> Result<(), DagError> {
        emit_event!(self.inner.events, "start task {}", self.name());
        info!(task = %self.name(), "graph run starting");

        if let Err(err) = self.validator(true) {
            emit_event!(self.inner.events, "invalid task {}, {}", self.name(), err);
            self.inner.registry.remove(&graph_key(self.name()));
            return Err(err);
        }

        let vertices = self.vertices();
        if !self.inner.ctx.is_killed() {
            self.register(&vertices);
        }

        let result = self.execute(&vertices, &ctx).await;
        self.finish(&vertices);

        match result {
            Ok(()) => {
                emit_event!(self.inner.events, "end task {}", self.name());
                info!(task = %self.name(), "graph run finished");
                Ok(())
            }
            Err(err) => {
                emit_event!(self.inner.events, "error exec task {}, {}", self.name(), err);
                warn!(task = %self.name(), error = %err, "graph run failed");
                Err(err)
            }
        }
    }

    fn register(&self, vertices: &[Vertex]) {
        let registry = &self.inner.registry;
        registry.join(graph_key(self.name()), Handle::Graph(self.clone()));
        for v in vertices {
            registry.join(vertex_key(self.name(), v.name()), Handle::Vertex(v.clone()));
        }
    }

    async fn execute(&self, vertices: &[Vertex], ctx: &CancellationToken) -> Result<(), DagError> {
        let graph_ctx = &self.inner.ctx;
        let execution = graph_ctx.init_execution(ctx)?;
        graph_ctx.rearm();
        enter_running(graph_ctx);

        for v in vertices {
            v.inner.ctx.rearm();
            v.inner.ctx.init_execution(&execution)?;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<DagError>();
        for root in vertices.iter().filter(|v| v.is_root()) {
            tokio::spawn(run_vertex(Arc::clone(&self.inner), root.clone(), tx.clone()));
        }
        // Every vertex task holds a sender; the channel closes once the last
        // reachable vertex has settled.
        drop(tx);

        let mut errors = Vec::new();
        while let Some(err) = rx.recv().await {
            errors.push(err);
        }

        self.report_unreached(vertices).await;

        if graph_ctx.is_killed() && !errors.iter().any(DagError::is_force_kill) {
            errors.insert(0, DagError::ForceKill);
        }

        match DagError::join(errors) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Log and announce vertices that never became schedulable because a
    /// dependency failed or was killed.
    async fn report_unreached(&self, vertices: &[Vertex]) {
        let unreached: Vec<&Vertex> = vertices.iter().filter(|v| v.links().ndeps > 0).collect();
        for v in unreached {
            warn!(
                task = %self.name(),
                step = %v.name(),
                "step never started; an upstream step did not complete"
            );
            emit_event!(self.inner.events, "skipped step {} in task {}", v.name(), self.name());
        }
    }

    fn finish(&self, vertices: &[Vertex]) {
        let graph_ctx = &self.inner.ctx;
        graph_ctx.finish_execution();
        graph_ctx.set_state(State::Stopped);

        let registry = &self.inner.registry;
        for v in vertices {
            v.inner.ctx.finish_execution();
            registry.remove(&vertex_key(self.name(), v.name()));
        }
        registry.remove(&graph_key(self.name()));
    }
}

impl GraphInner {
    fn vertices_guard(&self) -> MutexGuard<'_, Vec<Vertex>> {
        self.vertices.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Everything that happens to one vertex between "started" and
    /// "settled": pause gates, the step function, the post-run pause gate.
    async fn execute_vertex(&self, vertex: &Vertex) -> Result<(), DagError> {
        let gname = self.ctx.name();
        let vname = vertex.name();
        let vctx = &vertex.inner.ctx;
        let graph_exec = self.ctx.execution().ok_or(DagError::Context)?;
        let exec = vctx.execution().ok_or(DagError::Context)?;

        // Graph-level pause.
        if let Some(control) = self.ctx.control() {
            emit_event!(self.events, "step {} paused because task {} is paused", vname, gname);
            tokio::select! {
                _ = graph_exec.cancelled() => return Err(self.ctx.interruption()),
                _ = control.done() => {
                    emit_event!(self.events, "resumed step {} in task {}", vname, gname);
                }
            }
        }
        enter_running(&self.ctx);

        // Vertex-level pause before execution.
        if let Some(control) = vctx.control() {
            emit_event!(self.events, "paused step {} in task {}", vname, gname);
            tokio::select! {
                _ = exec.cancelled() => return Err(vctx.interruption()),
                _ = control.done() => {
                    emit_event!(self.events, "resumed step {} in task {}", vname, gname);
                }
            }
        }

        if exec.is_cancelled() || graph_exec.is_cancelled() {
            return Err(vctx.interruption());
        }

        enter_running(vctx);
        debug!(task = %gname, step = %vname, "running step function");

        // The step runs in its own task so a panic surfaces as an error.
        match tokio::spawn(vertex.call(exec.clone(), gname)).await {
            Ok(Ok(())) => {}
            // A step that gives up because its token fired reports the
            // interruption, not its own error.
            Ok(Err(err)) if exec.is_cancelled() => {
                debug!(task = %gname, step = %vname, error = %err, "step interrupted");
                return Err(vctx.interruption());
            }
            Ok(Err(err)) => return Err(DagError::Step(err)),
            Err(join) if join.is_panic() => {
                return Err(DagError::Panicked(panic_message(join.into_panic())));
            }
            Err(_) => return Err(vctx.interruption()),
        }

        // Vertex-level pause after execution, before releasing dependents.
        if let Some(control) = vctx.control() {
            emit_event!(self.events, "paused step {} in task {}", vname, gname);
            tokio::select! {
                _ = exec.cancelled() => return Err(vctx.interruption()),
                _ = control.done() => {
                    emit_event!(self.events, "resumed step {} in task {}", vname, gname);
                }
            }
        }

        if vctx.is_killed() {
            return Err(DagError::ForceKill);
        }
        Ok(())
    }

    /// Decrement the counters of every dependent and spawn the ones that
    /// became ready.
    fn release_dependents(
        self: &Arc<Self>,
        vertex: &Vertex,
        tx: &mpsc::UnboundedSender<DagError>,
    ) -> Result<(), DagError> {
        let graph_exec = self.ctx.execution().ok_or(DagError::Context)?;
        let adjs = vertex.links().adjs.clone();
        let mut ready = Vec::new();

        {
            let vertices = self.vertices_guard();
            for idx in adjs {
                if graph_exec.is_cancelled() {
                    return Err(self.ctx.interruption());
                }
                let Some(dependent) = vertices.get(idx) else {
                    continue;
                };
                let mut links = dependent.links();
                links.ndeps = links.ndeps.saturating_sub(1);
                if links.ndeps == 0 {
                    ready.push(dependent.clone());
                }
            }
        }

        for dependent in ready {
            debug!(task = %self.ctx.name(), step = %dependent.name(), "dependencies satisfied");
            tokio::spawn(run_vertex(Arc::clone(self), dependent, tx.clone()));
        }
        Ok(())
    }
}

/// One invocation of a vertex. Returns a boxed future so vertex tasks can
/// spawn their dependents recursively.
fn run_vertex(
    graph: Arc<GraphInner>,
    vertex: Vertex,
    tx: mpsc::UnboundedSender<DagError>,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        let gname = graph.ctx.name().to_string();
        let vname = vertex.name().to_string();
        emit_event!(graph.events, "start step {} in task {}", vname, gname);

        let outcome = graph.execute_vertex(&vertex).await;

        vertex.inner.ctx.finish_execution();
        vertex.inner.ctx.set_state(State::Stopped);
        graph.registry.remove(&vertex_key(&gname, &vname));

        let outcome = match outcome {
            Ok(()) => {
                emit_event!(graph.events, "stopped step {} in task {}", vname, gname);
                graph.release_dependents(&vertex, &tx)
            }
            Err(err) => Err(err),
        };

        if let Err(err) = outcome {
            emit_event!(graph.events, "error exec step {} in task {}, {}", vname, gname, err);
            warn!(task = %gname, step = %vname, error = %err, "step failed");
            // The receiver only goes away once `run` has returned.
            let _ = tx.send(err.in_vertex(vname));
        }
    })
}

/// `Unknown`/`Resume` become `Running`; a pending pause is kept.
fn enter_running(ctx: &ExecutionContext) {
    if ctx.state() != State::Paused {
        ctx.set_state(State::Running);
    }
}

/// Iterative DFS with an explicit stack; a back edge into the current path
/// is a cycle.
fn detect_cycle(vertices: &[Vertex]) -> Result<(), DagError> {
    let adjs: Vec<Vec<usize>> = vertices.iter().map(|v| v.links().adjs.clone()).collect();
    let mut visited = vec![false; adjs.len()];
    let mut on_path = vec![false; adjs.len()];

    for start in 0..adjs.len() {
        if visited[start] {
            continue;
        }
        visited[start] = true;
        on_path[start] = true;
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];

        while let Some(top) = stack.last_mut() {
            let node = top.0;
            match adjs[node].get(top.1).copied() {
                Some(adj) => {
                    top.1 += 1;
                    if on_path[adj] {
                        return Err(DagError::CycleDetected);
                    }
                    if !visited[adj] {
                        visited[adj] = true;
                        on_path[adj] = true;
                        stack.push((adj, 0));
                    }
                }
                None => {
                    on_path[node] = false;
                    stack.pop();
                }
            }
        }
    }

    Ok(())
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
