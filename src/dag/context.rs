// src/dag/context.rs

//! Per-node execution context: lifecycle state plus the three cancellation
//! scopes every graph and vertex carries.
//!
//! - *lifecycle*: cancelled only by an explicit kill; never recovers. A
//!   vertex's lifecycle token is a child of its graph's, so killing a graph
//!   kills every vertex.
//! - *execution*: bounds one run. Cancelled when the lifecycle token or the
//!   caller's token fires, whichever comes first.
//! - *control*: exists only while paused. Cancelled by `resume`, or expires
//!   on its own when the pause was given a positive duration.

use std::fmt;
use std::sync::{Mutex, MutexGuard};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::dag::error::DagError;
use crate::duration::parse_duration;

/// Lifecycle state of a graph or vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Unknown,
    Running,
    Stopped,
    Paused,
    Resume,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Unknown => "unknown",
            State::Running => "running",
            State::Stopped => "stopped",
            State::Paused => "paused",
            State::Resume => "resume",
        };
        f.write_str(s)
    }
}

/// The transient scope that exists while a node is paused.
#[derive(Debug, Clone)]
pub struct ControlScope {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl ControlScope {
    fn expired(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Wait until the pause ends, by explicit resume or by its deadline.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }
}

#[derive(Debug, Default)]
struct ContextState {
    visited: bool,
    state: State,
    old_state: State,
    lifecycle: Option<CancellationToken>,
    execution: Option<CancellationToken>,
    control: Option<ControlScope>,
    /// Number of pause cycles started; identifies the current control scope.
    pauses: u64,
}

impl ContextState {
    fn transition(&mut self, next: State) {
        self.old_state = self.state;
        self.state = next;
    }

    /// A timed pause whose deadline has passed becomes `Resume`.
    fn settle(&mut self) {
        if self.state == State::Paused && self.control.as_ref().is_some_and(|c| c.expired()) {
            self.transition(State::Resume);
            self.control = None;
        }
    }
}

/// Shared state + cancellation scopes for one graph or vertex.
#[derive(Debug)]
pub struct ExecutionContext {
    name: String,
    inner: Mutex<ContextState>,
}

impl ExecutionContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(ContextState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, ContextState> {
        // State stays consistent across a poisoning panic: every mutation is
        // a plain field assignment.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create the lifecycle token, either fresh or as a child of `parent`.
    pub fn init_lifecycle(&self, parent: Option<&CancellationToken>) {
        let token = match parent {
            Some(p) => p.child_token(),
            None => CancellationToken::new(),
        };
        self.lock().lifecycle = Some(token);
    }

    /// Derive a fresh execution token that fires when either the node's
    /// lifecycle token or `outer` is cancelled.
    pub fn init_execution(&self, outer: &CancellationToken) -> Result<CancellationToken, DagError> {
        let mut st = self.lock();
        let lifecycle = st.lifecycle.as_ref().ok_or(DagError::Context)?;
        let execution = link(lifecycle, outer);
        st.execution = Some(execution.clone());
        Ok(execution)
    }

    /// Cancel the execution token (end of a run).
    pub fn finish_execution(&self) {
        if let Some(execution) = self.lock().execution.as_ref() {
            execution.cancel();
        }
    }

    pub fn lifecycle(&self) -> Option<CancellationToken> {
        self.lock().lifecycle.clone()
    }

    pub fn execution(&self) -> Option<CancellationToken> {
        self.lock().execution.clone()
    }

    /// Control scope of the current pause, if paused.
    pub fn control(&self) -> Option<ControlScope> {
        let mut st = self.lock();
        st.settle();
        st.control.clone()
    }

    /// Whether an explicit kill has been issued.
    pub fn is_killed(&self) -> bool {
        self.lock()
            .lifecycle
            .as_ref()
            .is_some_and(|t| t.is_cancelled())
    }

    /// Error describing why the execution token ended.
    pub fn interruption(&self) -> DagError {
        if self.is_killed() {
            DagError::ForceKill
        } else {
            DagError::Canceled
        }
    }

    /// Forced kill. Fails with [`DagError::Context`] before the node started.
    pub fn kill(&self) -> Result<(), DagError> {
        let st = self.lock();
        let lifecycle = st.lifecycle.as_ref().ok_or(DagError::Context)?;
        lifecycle.cancel();
        debug!(node = %self.name, "lifecycle cancelled");
        Ok(())
    }

    /// Pause this node. Returns `false` if it was already paused.
    ///
    /// A positive `duration` makes the pause expire by itself; anything else
    /// (empty, zero, unparsable) requires an explicit [`resume`](Self::resume).
    pub fn pause(&self, duration: &str) -> bool {
        let mut st = self.lock();
        st.settle();
        if st.state == State::Paused {
            return false;
        }

        let deadline = match parse_duration(duration) {
            Ok(d) if !d.is_zero() => Some(Instant::now() + d),
            _ => None,
        };
        st.transition(State::Paused);
        st.control = Some(ControlScope {
            token: CancellationToken::new(),
            deadline,
        });
        st.pauses += 1;
        debug!(node = %self.name, timed = deadline.is_some(), "paused");
        true
    }

    /// Resume a paused node. Returns `false` if it was not paused.
    pub fn resume(&self) -> bool {
        let mut st = self.lock();
        st.settle();
        if st.state != State::Paused {
            return false;
        }
        if let Some(control) = st.control.take() {
            control.token.cancel();
        }
        st.transition(State::Resume);
        debug!(node = %self.name, "resumed");
        true
    }

    /// Block until the current pause ends. Returns immediately if not paused.
    pub async fn wait_resume(&self) {
        // Clone the scope out so the lock is not held while waiting.
        let Some(control) = self.control() else {
            return;
        };
        control.done().await;
        self.lock().settle();
    }

    pub fn state(&self) -> State {
        let mut st = self.lock();
        st.settle();
        st.state
    }

    pub fn old_state(&self) -> State {
        self.lock().old_state
    }

    pub fn set_state(&self, next: State) {
        self.lock().transition(next);
    }

    /// Move a node left `Stopped` by a previous run back to `Unknown`,
    /// preserving a pause requested before the run.
    pub fn rearm(&self) {
        let mut st = self.lock();
        if st.state == State::Stopped {
            st.transition(State::Unknown);
        }
    }

    pub fn visited(&self) -> bool {
        self.lock().visited
    }

    pub fn set_visited(&self, visited: bool) {
        self.lock().visited = visited;
    }

    /// Number of pause cycles this node has gone through.
    pub fn pause_count(&self) -> u64 {
        self.lock().pauses
    }
}

/// Child of `primary` that is also cancelled when `extra` fires.
///
/// The watcher task ends as soon as either token is cancelled.
pub(crate) fn link(primary: &CancellationToken, extra: &CancellationToken) -> CancellationToken {
    let child = primary.child_token();
    if extra.is_cancelled() {
        child.cancel();
        return child;
    }

    let watched = child.clone();
    let extra = extra.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = extra.cancelled() => watched.cancel(),
            _ = watched.cancelled() => {}
        }
    });
    child
}

/// Token cancelled after `timeout` or when `parent` is cancelled.
///
/// Equivalent of a deadline-carrying child context; must be called from
/// within a Tokio runtime.
pub fn with_timeout(parent: &CancellationToken, timeout: std::time::Duration) -> CancellationToken {
    let child = parent.child_token();
    let timed = child.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => timed.cancel(),
            _ = timed.cancelled() => {}
        }
    });
    child
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn started(name: &str) -> ExecutionContext {
        let ctx = ExecutionContext::new(name);
        ctx.init_lifecycle(None);
        ctx
    }

    #[test]
    fn kill_before_start_is_a_context_error() {
        let ctx = ExecutionContext::new("n");
        assert!(matches!(ctx.kill(), Err(DagError::Context)));
        assert!(!ctx.is_killed());
    }

    #[tokio::test]
    async fn kill_cancels_lifecycle_and_execution() {
        let ctx = started("n");
        let caller = CancellationToken::new();
        let exec = ctx.init_execution(&caller).unwrap();
        ctx.kill().unwrap();
        assert!(ctx.is_killed());
        assert!(exec.is_cancelled());
        assert!(matches!(ctx.interruption(), DagError::ForceKill));
    }

    #[tokio::test]
    async fn caller_cancel_is_not_a_kill() {
        let ctx = started("n");
        let caller = CancellationToken::new();
        let exec = ctx.init_execution(&caller).unwrap();
        caller.cancel();
        tokio::time::timeout(Duration::from_secs(1), exec.cancelled())
            .await
            .expect("execution token follows the caller token");
        assert!(!ctx.is_killed());
        assert!(matches!(ctx.interruption(), DagError::Canceled));
    }

    #[test]
    fn pause_is_idempotent() {
        let ctx = ExecutionContext::new("n");
        ctx.set_state(State::Running);
        assert!(ctx.pause(""));
        let first = ctx.pause_count();
        assert!(!ctx.pause("5s"));
        assert_eq!(ctx.state(), State::Paused);
        assert_eq!(ctx.pause_count(), first);
        assert_eq!(ctx.old_state(), State::Running);
    }

    #[test]
    fn resume_without_pause_is_a_noop() {
        let ctx = ExecutionContext::new("n");
        assert!(!ctx.resume());
        assert_eq!(ctx.state(), State::Unknown);
    }

    #[tokio::test]
    async fn resume_releases_every_waiter() {
        let ctx = Arc::new(ExecutionContext::new("n"));
        ctx.pause("0");

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let ctx = Arc::clone(&ctx);
            waiters.push(tokio::spawn(async move { ctx.wait_resume().await }));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(waiters.iter().all(|w| !w.is_finished()));

        assert!(ctx.resume());
        for w in waiters {
            tokio::time::timeout(Duration::from_secs(1), w)
                .await
                .expect("waiter released")
                .unwrap();
        }
        assert_eq!(ctx.state(), State::Resume);
        assert!(ctx.control().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn timed_pause_expires_and_can_pause_again() {
        let ctx = ExecutionContext::new("n");
        assert!(ctx.pause("100ms"));
        assert_eq!(ctx.state(), State::Paused);

        ctx.wait_resume().await;
        assert_eq!(ctx.state(), State::Resume);

        assert!(ctx.pause("1s"));
        assert_eq!(ctx.pause_count(), 2);
    }

    #[tokio::test]
    async fn wait_resume_without_pause_returns_immediately() {
        let ctx = ExecutionContext::new("n");
        tokio::time::timeout(Duration::from_millis(100), ctx.wait_resume())
            .await
            .expect("not paused, nothing to wait for");
    }

    #[tokio::test(start_paused = true)]
    async fn with_timeout_fires() {
        let parent = CancellationToken::new();
        let token = with_timeout(&parent, Duration::from_secs(3));
        assert!(!token.is_cancelled());
        tokio::time::timeout(Duration::from_secs(4), token.cancelled())
            .await
            .expect("deadline reached");
        assert!(!parent.is_cancelled());
    }
}
