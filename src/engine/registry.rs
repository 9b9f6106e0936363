// src/engine/registry.rs

//! Process-wide name -> handle registry.
//!
//! Graphs register under `graph#<task>#graph`, vertices under
//! `graph#<task>#vertex#<step>#vertex#graph`. Entries are added when a graph
//! or vertex is created and refreshed at the start of every run; they are
//! removed when the node finishes, is killed, or fails validation.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use crate::dag::{DagError, Graph, State, Vertex};

/// Operations shared by graphs and vertices for external control.
pub trait Control: Send + Sync {
    fn name(&self) -> &str;

    fn kill(&self) -> Result<(), DagError>;

    fn pause(&self, duration: &str) -> Result<(), DagError>;

    fn resume(&self);

    fn state(&self) -> State;

    fn wait_resume(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

impl Control for Graph {
    fn name(&self) -> &str {
        Graph::name(self)
    }

    fn kill(&self) -> Result<(), DagError> {
        Graph::kill(self)
    }

    fn pause(&self, duration: &str) -> Result<(), DagError> {
        Graph::pause(self, duration)
    }

    fn resume(&self) {
        Graph::resume(self)
    }

    fn state(&self) -> State {
        Graph::state(self)
    }

    fn wait_resume(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(Graph::wait_resume(self))
    }
}

impl Control for Vertex {
    fn name(&self) -> &str {
        Vertex::name(self)
    }

    fn kill(&self) -> Result<(), DagError> {
        Vertex::kill(self)
    }

    fn pause(&self, duration: &str) -> Result<(), DagError> {
        Vertex::pause(self, duration)
    }

    fn resume(&self) {
        Vertex::resume(self)
    }

    fn state(&self) -> State {
        Vertex::state(self)
    }

    fn wait_resume(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(Vertex::wait_resume(self))
    }
}

/// A registered node.
#[derive(Clone, Debug)]
pub enum Handle {
    Graph(Graph),
    Vertex(Vertex),
}

impl Handle {
    fn as_control(&self) -> &dyn Control {
        match self {
            Handle::Graph(g) => g as &dyn Control,
            Handle::Vertex(v) => v as &dyn Control,
        }
    }
}

impl Control for Handle {
    fn name(&self) -> &str {
        self.as_control().name()
    }

    fn kill(&self) -> Result<(), DagError> {
        self.as_control().kill()
    }

    fn pause(&self, duration: &str) -> Result<(), DagError> {
        self.as_control().pause(duration)
    }

    fn resume(&self) {
        self.as_control().resume()
    }

    fn state(&self) -> State {
        self.as_control().state()
    }

    fn wait_resume(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.as_control().wait_resume()
    }
}

/// Registry key of a graph.
pub fn graph_key(task: &str) -> String {
    format!("graph#{task}#graph")
}

/// Registry key of a vertex inside a graph.
pub fn vertex_key(task: &str, step: &str) -> String {
    format!("graph#{task}#vertex#{step}#vertex#graph")
}

/// Shared, concurrent map of registered nodes. Clones share the same map.
#[derive(Clone, Default)]
pub struct Registry {
    entries: Arc<DashMap<String, Handle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry.
    pub fn join(&self, key: String, handle: Handle) {
        trace!(%key, "registry join");
        self.entries.insert(key, handle);
    }

    /// Remove and return an entry; [`DagError::NotFound`] if absent.
    pub fn leave(&self, key: &str) -> Result<Handle, DagError> {
        trace!(%key, "registry leave");
        self.entries
            .remove(key)
            .map(|(_, handle)| handle)
            .ok_or(DagError::NotFound)
    }

    /// Remove an entry if present.
    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn get(&self, key: &str) -> Option<Handle> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Look up a graph by task name.
    ///
    /// An entry of the wrong kind under the graph key is evicted and reported
    /// as [`DagError::WrongType`].
    pub fn graph_manager(&self, task: &str) -> Result<Graph, DagError> {
        let key = graph_key(task);
        match self.get(&key).ok_or(DagError::NotFound)? {
            Handle::Graph(g) => Ok(g),
            Handle::Vertex(_) => {
                self.remove(&key);
                Err(DagError::WrongType)
            }
        }
    }

    /// Look up a vertex by task and step name.
    pub fn vertex_manager(&self, task: &str, step: &str) -> Result<Vertex, DagError> {
        let key = vertex_key(task, step);
        match self.get(&key).ok_or(DagError::NotFound)? {
            Handle::Vertex(v) => Ok(v),
            Handle::Graph(_) => {
                self.remove(&key);
                Err(DagError::WrongType)
            }
        }
    }

    /// Every registered graph.
    pub fn graphs(&self) -> Vec<Graph> {
        self.entries
            .iter()
            .filter_map(|e| match e.value() {
                Handle::Graph(g) => Some(g.clone()),
                Handle::Vertex(_) => None,
            })
            .collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
