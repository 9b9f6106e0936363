// src/lib.rs

pub mod cli;
pub mod config;
pub mod dag;
pub mod duration;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod logging;

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cli::CliArgs;
use crate::config::loader::load_and_validate;
use crate::config::model::ConfigFile;
use crate::dag::{with_timeout, DagError};
use crate::engine::{Engine, EngineOptions, WorkerPool};
use crate::errors::TaskdagError;
use crate::exec::build_task_graph;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - task file loading
/// - one graph per selected task, built from shell steps
/// - the worker pool that bounds how many tasks run at once
/// - the optional event printer
/// - Ctrl-C handling (kills every running task)
pub async fn run(args: CliArgs) -> Result<()> {
    let config_path = PathBuf::from(&args.config);
    let cfg = load_and_validate(&config_path)?;
    let tasks = selected_tasks(&cfg, &args.tasks)?;

    let engine = Engine::new(EngineOptions {
        event_buffer: cfg.config.event_buffer,
        subscriber_buffer: cfg.config.subscriber_buffer,
    });

    if args.dry_run {
        print_dry_run(&engine, &cfg, &tasks)?;
        engine.shutdown();
        return Ok(());
    }

    let printer = if args.events {
        Some(spawn_event_printer(&engine)?)
    } else {
        None
    };

    // Ctrl-C → kill every registered graph.
    {
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            info!("interrupt received, killing running tasks");
            for graph in engine.registry().graphs() {
                if let Err(err) = graph.kill() {
                    debug!(task = %graph.name(), error = %err, "kill failed");
                }
            }
        });
    }

    let pool = WorkerPool::new(cfg.pool_size());
    info!(tasks = tasks.len(), pool = pool.stats().size, "running tasks");

    let root = CancellationToken::new();
    let mut handles: Vec<(String, JoinHandle<std::result::Result<(), DagError>>)> = Vec::new();
    for name in &tasks {
        let graph = build_task_graph(&engine, &cfg, name)?;
        let token = match cfg.task_timeout(name) {
            Some(timeout) => with_timeout(&root, timeout),
            None => root.child_token(),
        };
        handles.push((name.clone(), pool.submit(async move { graph.run(token).await })));
    }

    let mut failed = 0usize;
    for (name, handle) in handles {
        match handle.await {
            Ok(Ok(())) => info!(task = %name, "task succeeded"),
            Ok(Err(err)) => {
                failed += 1;
                error!(task = %name, failed_steps = ?err.failed_vertices(), "task failed:\n{err}");
            }
            Err(join) => {
                failed += 1;
                error!(task = %name, error = %join, "task runner aborted");
            }
        }
    }

    engine.shutdown();
    if let Some(printer) = printer {
        if let Err(e) = printer.await {
            warn!(error = %e, "event printer ended abnormally");
        }
    }

    if failed > 0 {
        return Err(anyhow!("{failed} of {} task(s) failed", tasks.len()));
    }
    Ok(())
}

/// Tasks named with `--task`, or every task in file order.
fn selected_tasks(cfg: &ConfigFile, requested: &[String]) -> crate::errors::Result<Vec<String>> {
    if requested.is_empty() {
        return Ok(cfg.task.keys().cloned().collect());
    }
    for name in requested {
        if !cfg.task.contains_key(name) {
            return Err(TaskdagError::ConfigError(format!("unknown task '{name}'")));
        }
    }
    Ok(requested.to_vec())
}

/// Print events to stdout until the bus closes.
fn spawn_event_printer(engine: &Engine) -> Result<JoinHandle<()>> {
    let (mut events, id) = engine.subscribe_event()?;
    debug!(subscriber = id, "event printer subscribed");
    Ok(tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("{event}");
        }
    }))
}

/// Print each selected task's steps grouped by execution level.
fn print_dry_run(engine: &Engine, cfg: &ConfigFile, tasks: &[String]) -> crate::errors::Result<()> {
    println!("taskdag dry-run");
    println!("  config.pool_size = {}", cfg.pool_size());
    println!("  config.event_buffer = {}", cfg.config.event_buffer);
    println!("  config.subscriber_buffer = {}", cfg.config.subscriber_buffer);
    println!();

    for name in tasks {
        let graph = build_task_graph(engine, cfg, name)?;
        let task = &cfg.task[name];
        println!("task {name}:");
        if let Some(timeout) = cfg.task_timeout(name) {
            println!("  timeout: {timeout:?}");
        }
        if let Some(ref pause) = task.pause {
            println!("  pause: {pause}");
        }
        for (level, steps) in graph.plan()?.iter().enumerate() {
            println!("  level {level}:");
            for step in steps {
                println!("    - {step}: {}", task.step[step].cmd);
            }
        }
    }

    debug!("dry-run complete (no execution)");
    Ok(())
}
