// src/dag/error.rs

//! Errors produced by the graph engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DagError {
    #[error("context is null")]
    Context,

    #[error("was forcibly terminated")]
    ForceKill,

    #[error("canceled by caller")]
    Canceled,

    #[error("not found or closed")]
    NotFound,

    #[error("is running, can't pause")]
    Running,

    #[error("wrong interface type, cannot be closed")]
    WrongType,

    #[error("dependency cycle detected")]
    CycleDetected,

    #[error("duplicate vertex name")]
    DuplicateVertexName,

    #[error("duplicate compile graph")]
    DuplicateCompile,

    #[error("the vertex of the graph is null")]
    EmptyGraph,

    #[error("step '{vertex}' depends on '{dep}', which is not part of this graph")]
    UnknownDependency { vertex: String, dep: String },

    #[error("step '{0}' already belongs to another graph")]
    ForeignVertex(String),

    #[error("event bus has been closed, cannot subscribe")]
    EventBusClosed,

    #[error(transparent)]
    Step(anyhow::Error),

    #[error("step panicked: {0}")]
    Panicked(String),

    #[error("step {vertex}: {source}")]
    Vertex {
        vertex: String,
        #[source]
        source: Box<DagError>,
    },

    #[error("{}", join_messages(.0))]
    Joined(Vec<DagError>),
}

fn join_messages(errors: &[DagError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

impl DagError {
    /// Combine errors the way `errors.Join` does: nothing for an empty list,
    /// the error itself for a single entry, `Joined` otherwise.
    pub fn join(mut errors: Vec<DagError>) -> Option<DagError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(DagError::Joined(errors)),
        }
    }

    /// Attach the name of the step that produced this error.
    pub fn in_vertex(self, vertex: impl Into<String>) -> DagError {
        DagError::Vertex {
            vertex: vertex.into(),
            source: Box::new(self),
        }
    }

    /// Whether `pred` holds for this error or anything it wraps.
    pub fn contains(&self, pred: &dyn Fn(&DagError) -> bool) -> bool {
        if pred(self) {
            return true;
        }
        match self {
            DagError::Vertex { source, .. } => source.contains(pred),
            DagError::Joined(errors) => errors.iter().any(|e| e.contains(pred)),
            _ => false,
        }
    }

    pub fn is_force_kill(&self) -> bool {
        self.contains(&|e: &DagError| matches!(e, DagError::ForceKill))
    }

    pub fn is_canceled(&self) -> bool {
        self.contains(&|e: &DagError| matches!(e, DagError::Canceled))
    }

    /// Names of the steps that reported an error, in report order.
    pub fn failed_vertices(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_vertices(&mut names);
        names
    }

    fn collect_vertices<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            DagError::Vertex { vertex, .. } => out.push(vertex.as_str()),
            DagError::Joined(errors) => {
                for e in errors {
                    e.collect_vertices(out);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_flattens_trivial_cases() {
        assert!(DagError::join(Vec::new()).is_none());
        let single = DagError::join(vec![DagError::ForceKill]).unwrap();
        assert!(matches!(single, DagError::ForceKill));
        let many = DagError::join(vec![DagError::ForceKill, DagError::Canceled]).unwrap();
        assert!(matches!(many, DagError::Joined(ref v) if v.len() == 2));
    }

    #[test]
    fn predicates_see_through_wrappers() {
        let err = DagError::Joined(vec![
            DagError::Step(anyhow::anyhow!("boom")).in_vertex("a"),
            DagError::ForceKill.in_vertex("b"),
        ]);
        assert!(err.is_force_kill());
        assert!(!err.is_canceled());
        assert_eq!(err.failed_vertices(), vec!["a", "b"]);
        assert!(err.to_string().contains("step a: boom"));
    }
}
