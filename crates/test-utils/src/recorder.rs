//! Step functions that record what the engine did with them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use taskdag::dag::Vertex;
use tokio_util::sync::CancellationToken;

/// What a recording step does when invoked.
#[derive(Debug, Clone)]
pub enum Behaviour {
    /// Return `Ok(())` immediately.
    Succeed,
    /// Return an error with this message.
    Fail(String),
    /// Sleep, then succeed, ignoring cancellation.
    Sleep(Duration),
    /// Wait until the step's token is cancelled, then fail.
    BlockUntilCancelled,
    /// Panic with this message.
    Panic(String),
}

#[derive(Default)]
struct Log {
    started: Vec<String>,
    timeline: Vec<String>,
    finished: Vec<String>,
    cancelled: Vec<String>,
}

/// Shared record of step invocations. Clones share the same record.
#[derive(Clone, Default)]
pub struct Recorder {
    log: Arc<Mutex<Log>>,
    live: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Vertex named `name` that records its invocation and then behaves as
    /// `behaviour` says.
    pub fn vertex(&self, name: &str, behaviour: Behaviour) -> Vertex {
        let recorder = self.clone();
        Vertex::new(name, move |token: CancellationToken, _task: String, step: String| {
            let recorder = recorder.clone();
            let behaviour = behaviour.clone();
            async move { recorder.invoke(token, step, behaviour).await }
        })
    }

    async fn invoke(
        &self,
        token: CancellationToken,
        step: String,
        behaviour: Behaviour,
    ) -> anyhow::Result<()> {
        {
            let mut log = self.lock();
            log.started.push(step.clone());
            log.timeline.push(format!("start:{step}"));
        }
        let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let result = match behaviour {
            Behaviour::Succeed => Ok(()),
            Behaviour::Fail(msg) => Err(anyhow::anyhow!(msg)),
            Behaviour::Sleep(d) => {
                tokio::time::sleep(d).await;
                Ok(())
            }
            Behaviour::BlockUntilCancelled => {
                token.cancelled().await;
                self.lock().cancelled.push(step.clone());
                Err(anyhow::anyhow!("{step} cancelled"))
            }
            Behaviour::Panic(msg) => {
                self.live.fetch_sub(1, Ordering::SeqCst);
                panic!("{msg}");
            }
        };

        self.live.fetch_sub(1, Ordering::SeqCst);
        let mut log = self.lock();
        log.timeline.push(format!("end:{step}"));
        log.finished.push(step);
        drop(log);
        result
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Log> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Steps in the order they were invoked.
    pub fn started(&self) -> Vec<String> {
        self.lock().started.clone()
    }

    /// `start:<step>` and `end:<step>` entries in the order they happened.
    pub fn timeline(&self) -> Vec<String> {
        self.lock().timeline.clone()
    }

    /// Whether step `before` returned before step `after` was invoked.
    pub fn ended_before_start(&self, before: &str, after: &str) -> bool {
        let timeline = self.timeline();
        let end = timeline.iter().position(|e| *e == format!("end:{before}"));
        let start = timeline.iter().position(|e| *e == format!("start:{after}"));
        matches!((end, start), (Some(end), Some(start)) if end < start)
    }

    /// Steps in the order their function returned.
    pub fn finished(&self) -> Vec<String> {
        self.lock().finished.clone()
    }

    /// Steps that observed their token being cancelled.
    pub fn cancelled(&self) -> Vec<String> {
        self.lock().cancelled.clone()
    }

    pub fn was_started(&self, step: &str) -> bool {
        self.lock().started.iter().any(|s| s == step)
    }

    /// Position of `step` in [`Recorder::started`].
    pub fn start_index(&self, step: &str) -> Option<usize> {
        self.lock().started.iter().position(|s| s == step)
    }

    /// Position of `step` in [`Recorder::finished`].
    pub fn finish_index(&self, step: &str) -> Option<usize> {
        self.lock().finished.iter().position(|s| s == step)
    }

    /// Highest number of steps that were executing at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}
