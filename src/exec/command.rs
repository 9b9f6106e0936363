// src/exec/command.rs

//! Shell command step.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dag::{VertexFn, VertexFuture};

/// A command line plus the environment it runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub cmd: String,
    pub env: BTreeMap<String, String>,
}

impl ShellCommand {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Run the command to completion, or until `token` is cancelled.
    ///
    /// A non-zero exit is an error; so is cancellation, after the child has
    /// been killed.
    pub async fn run(&self, token: CancellationToken, task: &str, step: &str) -> Result<()> {
        info!(task, step, cmd = %self.cmd, "starting step process");

        // Build a shell command appropriate for the platform.
        let mut cmd = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(&self.cmd);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(&self.cmd);
            c
        };

        cmd.envs(&self.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning process for step '{step}' in task '{task}'"))?;

        if let Some(stdout) = child.stdout.take() {
            let (task, step) = (task.to_string(), step.to_string());
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(task = %task, step = %step, "stdout: {}", line);
                }
            });
        }

        // Always consume stderr so buffers don't fill.
        if let Some(stderr) = child.stderr.take() {
            let (task, step) = (task.to_string(), step.to_string());
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(task = %task, step = %step, "stderr: {}", line);
                }
            });
        }

        tokio::select! {
            status = child.wait() => {
                let status = status
                    .with_context(|| format!("waiting for process of step '{step}' in task '{task}'"))?;
                let code = status.code().unwrap_or(-1);
                info!(task, step, exit_code = code, success = status.success(), "step process exited");
                if !status.success() {
                    bail!("command `{}` exited with status {}", self.cmd, code);
                }
                Ok(())
            }
            _ = token.cancelled() => {
                info!(task, step, "step cancelled; killing process");
                if let Err(e) = child.kill().await {
                    warn!(task, step, error = %e, "failed to kill child process on cancellation");
                }
                bail!("command `{}` was cancelled", self.cmd)
            }
        }
    }
}

/// Step function that runs `command` through the platform shell.
pub fn shell_step(command: ShellCommand) -> VertexFn {
    let command = Arc::new(command);
    Arc::new(move |token: CancellationToken, task: String, step: String| -> VertexFuture {
        let command = Arc::clone(&command);
        Box::pin(async move { command.run(token, &task, &step).await })
    })
}
