// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `taskdag`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "taskdag",
    version,
    about = "Run task files as concurrent DAGs of shell steps.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the task file (TOML).
    #[arg(long, value_name = "PATH", default_value = "Taskdag.toml")]
    pub config: String,

    /// Run only the named task. May be given more than once; all tasks run
    /// when omitted.
    #[arg(long = "task", value_name = "NAME")]
    pub tasks: Vec<String>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `TASKDAG_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print each task's execution plan, run nothing.
    #[arg(long)]
    pub dry_run: bool,

    /// Print engine events to stdout while tasks run.
    #[arg(long)]
    pub events: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_task_flags_accumulate() {
        let args = CliArgs::parse_from([
            "taskdag", "--config", "x.toml", "--task", "a", "--task", "b", "--dry-run",
        ]);
        assert_eq!(args.config, "x.toml");
        assert_eq!(args.tasks, vec!["a".to_string(), "b".to_string()]);
        assert!(args.dry_run);
        assert!(!args.events);
    }

    #[test]
    fn defaults() {
        let args = CliArgs::parse_from(["taskdag"]);
        assert_eq!(args.config, "Taskdag.toml");
        assert!(args.tasks.is_empty());
        assert!(args.log_level.is_none());
    }
}
