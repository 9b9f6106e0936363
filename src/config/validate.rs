// src/config/validate.rs

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::model::{ConfigFile, RawConfigFile, TaskConfig};
use crate::duration::parse_optional;
use crate::errors::{Result, TaskdagError};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = TaskdagError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw.config, raw.task))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    ensure_has_tasks(cfg)?;
    validate_global_config(cfg)?;
    for (name, task) in cfg.task.iter() {
        validate_task_settings(name, task)?;
        validate_step_dependencies(name, task)?;
        validate_step_dag(name, task)?;
    }
    Ok(())
}

fn ensure_has_tasks(cfg: &RawConfigFile) -> Result<()> {
    if cfg.task.is_empty() {
        return Err(TaskdagError::ConfigError(
            "task file must contain at least one [task.<name>] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_global_config(cfg: &RawConfigFile) -> Result<()> {
    let section = &cfg.config;

    if section.pool_size == Some(0) {
        return Err(TaskdagError::ConfigError(
            "[config].pool_size must be >= 1 (got 0)".to_string(),
        ));
    }
    if section.event_buffer == 0 {
        return Err(TaskdagError::ConfigError(
            "[config].event_buffer must be >= 1 (got 0)".to_string(),
        ));
    }
    if section.subscriber_buffer == 0 {
        return Err(TaskdagError::ConfigError(
            "[config].subscriber_buffer must be >= 1 (got 0)".to_string(),
        ));
    }
    parse_optional(section.timeout.as_deref())
        .map_err(|e| TaskdagError::ConfigError(format!("[config].timeout: {e}")))?;

    Ok(())
}

fn validate_task_settings(name: &str, task: &TaskConfig) -> Result<()> {
    if task.step.is_empty() {
        return Err(TaskdagError::ConfigError(format!(
            "task '{name}' must contain at least one [task.{name}.step.<name>] section"
        )));
    }
    parse_optional(task.timeout.as_deref())
        .map_err(|e| TaskdagError::ConfigError(format!("[task.{name}].timeout: {e}")))?;
    parse_optional(task.pause.as_deref())
        .map_err(|e| TaskdagError::ConfigError(format!("[task.{name}].pause: {e}")))?;

    for (step, cfg) in task.step.iter() {
        if cfg.cmd.trim().is_empty() {
            return Err(TaskdagError::ConfigError(format!(
                "step '{step}' in task '{name}' has an empty `cmd`"
            )));
        }
    }
    Ok(())
}

fn validate_step_dependencies(name: &str, task: &TaskConfig) -> Result<()> {
    for (step, cfg) in task.step.iter() {
        for dep in cfg.after.iter() {
            if dep == step {
                return Err(TaskdagError::ConfigError(format!(
                    "step '{step}' in task '{name}' cannot depend on itself in `after`"
                )));
            }
            if !task.step.contains_key(dep) {
                return Err(TaskdagError::ConfigError(format!(
                    "step '{step}' in task '{name}' has unknown dependency '{dep}' in `after`"
                )));
            }
        }
    }
    Ok(())
}

fn validate_step_dag(name: &str, task: &TaskConfig) -> Result<()> {
    // Edge direction: dep -> step.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for step in task.step.keys() {
        graph.add_node(step.as_str());
    }
    for (step, cfg) in task.step.iter() {
        for dep in cfg.after.iter() {
            graph.add_edge(dep.as_str(), step.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(TaskdagError::StepCycle {
            task: name.to_string(),
            detail: format!("cycle involving step '{}'", cycle.node_id()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use crate::config::loader::parse_and_validate;
    use crate::errors::TaskdagError;

    #[test]
    fn accepts_minimal_task_file() {
        let cfg = parse_and_validate(
            r#"
            [task.build.step.compile]
            cmd = "make"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.task.len(), 1);
        assert_eq!(cfg.config.event_buffer, 15);
        assert_eq!(cfg.config.subscriber_buffer, 200);
    }

    #[test]
    fn rejects_empty_file() {
        assert!(matches!(
            parse_and_validate(""),
            Err(TaskdagError::ConfigError(_))
        ));
    }

    #[test]
    fn rejects_task_without_steps() {
        let err = parse_and_validate("[task.empty]\n").unwrap_err();
        assert!(err.to_string().contains("at least one"));
    }

    #[test]
    fn rejects_unknown_and_self_dependencies() {
        let unknown = parse_and_validate(
            r#"
            [task.t.step.a]
            cmd = "true"
            after = ["ghost"]
            "#,
        )
        .unwrap_err();
        assert!(unknown.to_string().contains("unknown dependency 'ghost'"));

        let itself = parse_and_validate(
            r#"
            [task.t.step.a]
            cmd = "true"
            after = ["a"]
            "#,
        )
        .unwrap_err();
        assert!(itself.to_string().contains("cannot depend on itself"));
    }

    #[test]
    fn rejects_step_cycle() {
        let err = parse_and_validate(
            r#"
            [task.t.step.a]
            cmd = "true"
            after = ["b"]

            [task.t.step.b]
            cmd = "true"
            after = ["a"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, TaskdagError::StepCycle { ref task, .. } if task == "t"));
    }

    #[test]
    fn rejects_bad_durations_and_sizes() {
        let bad_timeout = parse_and_validate(
            r#"
            [config]
            timeout = "soon"

            [task.t.step.a]
            cmd = "true"
            "#,
        );
        assert!(bad_timeout.is_err());

        let zero_pool = parse_and_validate(
            r#"
            [config]
            pool_size = 0

            [task.t.step.a]
            cmd = "true"
            "#,
        );
        assert!(zero_pool.is_err());
    }

    #[test]
    fn task_timeout_overrides_global() {
        let cfg = parse_and_validate(
            r#"
            [config]
            timeout = "10m"

            [task.fast]
            timeout = "5s"

            [task.fast.step.a]
            cmd = "true"

            [task.slow.step.a]
            cmd = "true"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.task_timeout("fast"), Some(std::time::Duration::from_secs(5)));
        assert_eq!(cfg.task_timeout("slow"), Some(std::time::Duration::from_secs(600)));
    }
}
