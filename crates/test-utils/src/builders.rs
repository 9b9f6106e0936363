#![allow(dead_code)]

use std::collections::BTreeMap;

use taskdag::config::{ConfigFile, ConfigSection, RawConfigFile, StepConfig, TaskConfig};

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile {
                config: ConfigSection::default(),
                task: BTreeMap::new(),
            },
        }
    }

    pub fn with_task(mut self, name: &str, task: TaskConfig) -> Self {
        self.config.task.insert(name.to_string(), task);
        self
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.config.config.pool_size = Some(size);
        self
    }

    pub fn timeout(mut self, duration: &str) -> Self {
        self.config.config.timeout = Some(duration.to_string());
        self
    }

    /// The raw, unvalidated file.
    pub fn raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `TaskConfig`.
#[derive(Default)]
pub struct TaskConfigBuilder {
    task: TaskConfig,
}

impl TaskConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a step running `cmd` after the listed steps.
    pub fn step(mut self, name: &str, cmd: &str, after: &[&str]) -> Self {
        self.task.step.insert(
            name.to_string(),
            StepConfig {
                cmd: cmd.to_string(),
                after: after.iter().map(|s| s.to_string()).collect(),
                env: BTreeMap::new(),
            },
        );
        self
    }

    pub fn env(mut self, step: &str, key: &str, value: &str) -> Self {
        if let Some(cfg) = self.task.step.get_mut(step) {
            cfg.env.insert(key.to_string(), value.to_string());
        }
        self
    }

    pub fn timeout(mut self, duration: &str) -> Self {
        self.task.timeout = Some(duration.to_string());
        self
    }

    pub fn pause(mut self, duration: &str) -> Self {
        self.task.pause = Some(duration.to_string());
        self
    }

    pub fn build(self) -> TaskConfig {
        self.task
    }
}
