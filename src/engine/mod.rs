// src/engine/mod.rs

//! Runtime services around the graph engine.
//!
//! An [`Engine`] owns the registry and the event bus every graph it builds
//! reports to, and exposes the management surface used by callers that only
//! know task and step names:
//! - [`registry`]: name -> graph/vertex handles
//! - [`events`]: broadcast bus of human-readable lifecycle events
//! - [`pool`]: admission control for whole graphs

pub mod events;
pub mod pool;
pub mod registry;

use std::str::FromStr;

use tracing::{debug, info};

use crate::dag::{DagError, Graph, State};

pub use events::{EventBus, EventStream, DEFAULT_EVENT_BUFFER, DEFAULT_SUBSCRIBER_BUFFER};
pub use pool::{PoolStats, WorkerPool};
pub use registry::{graph_key, vertex_key, Control, Handle, Registry};

/// Sizing of the engine's event bus.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub event_buffer: usize,
    pub subscriber_buffer: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            event_buffer: DEFAULT_EVENT_BUFFER,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

/// Management action on a task or step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Kill,
    /// Pause, optionally for a duration such as `"30s"`; empty means until
    /// resumed.
    Pause(String),
    Resume,
}

impl Action {
    /// Build an action from its name and an optional pause duration.
    pub fn from_parts(action: &str, duration: Option<&str>) -> Result<Self, String> {
        match action.trim().to_ascii_lowercase().as_str() {
            "kill" => Ok(Action::Kill),
            "pause" => Ok(Action::Pause(duration.unwrap_or_default().to_string())),
            "resume" => Ok(Action::Resume),
            other => Err(format!(
                "unknown action '{other}'; expected kill, pause or resume"
            )),
        }
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::from_parts(s, None)
    }
}

/// Registry + event bus shared by a set of graphs. Clones share both.
#[derive(Clone)]
pub struct Engine {
    registry: Registry,
    events: EventBus,
}

impl Engine {
    /// Create an engine. Requires a Tokio runtime (the event bus spawns its
    /// fan-out task).
    pub fn new(options: EngineOptions) -> Self {
        debug!(?options, "engine created");
        Self {
            registry: Registry::new(),
            events: EventBus::new(options.event_buffer, options.subscriber_buffer),
        }
    }

    /// Create a graph registered with this engine.
    pub fn graph(&self, name: impl Into<String>) -> Graph {
        Graph::new(name, self)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn graph_manager(&self, task: &str) -> Result<Graph, DagError> {
        self.registry.graph_manager(task)
    }

    pub fn vertex_manager(&self, task: &str, step: &str) -> Result<crate::dag::Vertex, DagError> {
        self.registry.vertex_manager(task, step)
    }

    pub fn subscribe_event(&self) -> Result<(EventStream, i64), DagError> {
        self.events.subscribe()
    }

    pub fn unsubscribe_event(&self, id: i64) {
        self.events.unsubscribe(id)
    }

    /// Apply an action to a registered task.
    ///
    /// Pause only acts on a task that is not already paused and resume only
    /// on one that is.
    pub fn manage_task(&self, task: &str, action: &Action) -> Result<(), DagError> {
        let graph = self.graph_manager(task)?;
        debug!(task, ?action, "manage task");
        match action {
            Action::Kill => graph.kill(),
            Action::Pause(duration) => {
                if graph.state() != State::Paused {
                    graph.pause(duration)?;
                }
                Ok(())
            }
            Action::Resume => {
                if graph.state() == State::Paused {
                    graph.resume();
                }
                Ok(())
            }
        }
    }

    /// Apply an action to a registered step.
    ///
    /// A step that is already executing cannot be paused; that fails with
    /// [`DagError::Running`].
    pub fn manage_step(&self, task: &str, step: &str, action: &Action) -> Result<(), DagError> {
        let vertex = self.vertex_manager(task, step)?;
        debug!(task, step, ?action, "manage step");
        match action {
            Action::Kill => vertex.kill(),
            Action::Pause(duration) => match vertex.state() {
                State::Running => Err(DagError::Running),
                State::Paused => Ok(()),
                _ => vertex.pause(duration),
            },
            Action::Resume => {
                if vertex.state() == State::Paused {
                    vertex.resume();
                }
                Ok(())
            }
        }
    }

    /// Kill every registered graph, clear the registry and close the bus.
    pub fn shutdown(&self) {
        let graphs = self.registry.graphs();
        info!(graphs = graphs.len(), "engine shutting down");
        for graph in graphs {
            if let Err(err) = graph.kill() {
                debug!(task = %graph.name(), error = %err, "kill on shutdown failed");
            }
        }
        self.registry.clear();
        self.events.close();
    }
}
