// src/exec/builder.rs

//! Build graphs of shell steps from a validated task file.

use std::collections::BTreeMap;

use tracing::debug;

use crate::config::ConfigFile;
use crate::dag::{DagError, Graph, Vertex, VertexFn};
use crate::engine::Engine;
use crate::exec::command::{shell_step, ShellCommand};

/// Build the graph of task `name` with every step running its shell command.
pub fn build_task_graph(engine: &Engine, cfg: &ConfigFile, name: &str) -> Result<Graph, DagError> {
    build_task_graph_with(engine, cfg, name, |_, command| shell_step(command))
}

/// Build the graph of task `name`, creating each step function with
/// `make_step(step_name, command)`.
pub fn build_task_graph_with<F>(
    engine: &Engine,
    cfg: &ConfigFile,
    name: &str,
    mut make_step: F,
) -> Result<Graph, DagError>
where
    F: FnMut(&str, ShellCommand) -> VertexFn,
{
    let task = cfg.task.get(name).ok_or(DagError::NotFound)?;
    let graph = engine.graph(name);

    let mut vertices: BTreeMap<&str, Vertex> = BTreeMap::new();
    for (step, step_cfg) in task.step.iter() {
        let command = ShellCommand::new(step_cfg.cmd.clone()).with_env(step_cfg.env.clone());
        let vertex = Vertex::from_fn(step.clone(), make_step(step, command));
        graph.add_vertex(&vertex)?;
        vertices.insert(step.as_str(), vertex);
    }

    for (step, step_cfg) in task.step.iter() {
        let Some(vertex) = vertices.get(step.as_str()) else {
            continue;
        };
        let deps = step_cfg
            .after
            .iter()
            .map(|dep| {
                vertices.get(dep.as_str()).ok_or_else(|| DagError::UnknownDependency {
                    vertex: step.clone(),
                    dep: dep.clone(),
                })
            })
            .collect::<Result<Vec<&Vertex>, DagError>>()?;
        vertex.with_deps(deps)?;
    }

    if let Some(pause) = task.pause.as_deref() {
        graph.pause(pause)?;
    }

    debug!(task = %name, steps = vertices.len(), "task graph built");
    Ok(graph)
}
