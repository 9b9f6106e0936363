// src/config/model.rs

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::duration::parse_optional;
use crate::engine::{DEFAULT_EVENT_BUFFER, DEFAULT_SUBSCRIBER_BUFFER};

/// Task file as read from TOML, before validation.
///
/// ```toml
/// [config]
/// pool_size = 4
/// timeout = "10m"
///
/// [task.build]
/// timeout = "5m"
///
/// [task.build.step.fetch]
/// cmd = "git fetch"
///
/// [task.build.step.compile]
/// cmd = "make"
/// after = ["fetch"]
/// ```
///
/// Use [`ConfigFile::try_from`] (or [`crate::config::load_and_validate`]) to
/// obtain a validated [`ConfigFile`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfigFile {
    #[serde(default)]
    pub config: ConfigSection,

    /// All tasks from `[task.<name>]`, keyed by task name.
    #[serde(default)]
    pub task: BTreeMap<String, TaskConfig>,
}

/// `[config]` section: engine sizing and defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigSection {
    /// Maximum number of tasks running at once. Defaults to twice the
    /// available parallelism.
    #[serde(default)]
    pub pool_size: Option<usize>,

    /// Capacity of the engine's event channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Capacity of each event subscriber's buffer.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,

    /// Default run timeout for every task, e.g. `"10m"`.
    #[serde(default)]
    pub timeout: Option<String>,
}

fn default_event_buffer() -> usize {
    DEFAULT_EVENT_BUFFER
}

fn default_subscriber_buffer() -> usize {
    DEFAULT_SUBSCRIBER_BUFFER
}

impl Default for ConfigSection {
    fn default() -> Self {
        Self {
            pool_size: None,
            event_buffer: default_event_buffer(),
            subscriber_buffer: default_subscriber_buffer(),
            timeout: None,
        }
    }
}

/// `[task.<name>]` section.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    /// Run timeout for this task; overrides `[config].timeout`.
    #[serde(default)]
    pub timeout: Option<String>,

    /// Start the task paused. A positive duration resumes it automatically;
    /// `"0"` waits for an explicit resume.
    #[serde(default)]
    pub pause: Option<String>,

    /// Steps from `[task.<name>.step.<step>]`, keyed by step name.
    #[serde(default)]
    pub step: BTreeMap<String, StepConfig>,
}

/// `[task.<name>.step.<step>]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepConfig {
    /// Shell command to run.
    pub cmd: String,

    /// Steps of the same task that must finish first.
    #[serde(default)]
    pub after: Vec<String>,

    /// Extra environment variables for the command.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Validated task file.
///
/// Only constructed through validation, so every `after` reference resolves,
/// every step graph is acyclic and every duration parses.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub config: ConfigSection,
    pub task: BTreeMap<String, TaskConfig>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(config: ConfigSection, task: BTreeMap<String, TaskConfig>) -> Self {
        Self { config, task }
    }

    /// Effective timeout of a task: its own, else the global one.
    pub fn task_timeout(&self, name: &str) -> Option<Duration> {
        let own = self.task.get(name).and_then(|t| t.timeout.as_deref());
        let raw = own.or(self.config.timeout.as_deref());
        // Durations were checked during validation.
        parse_optional(raw).ok().flatten()
    }

    /// Worker pool size, falling back to the engine default.
    pub fn pool_size(&self) -> usize {
        self.config
            .pool_size
            .unwrap_or_else(crate::engine::WorkerPool::default_size)
    }
}
