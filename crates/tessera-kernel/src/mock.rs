//! Scripted backend for tests.
//!
//! Scripts are keyed by prompt, so one backend can drive several nodes at
//! once with different streams. A script is a list of [`Step`]s; `Gate`
//! parks the stream until the test opens it, `Hang` parks it forever.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::backend::{
    BackendError, EventStream, FinalizedTask, GenerationBackend, GenerationEvent,
    GenerationRequest, TaskHandle, UpstreamStatus,
};
use crate::checkpoint::Checkpoint;

#[derive(Debug, Clone)]
pub enum Step {
    Event(GenerationEvent),
    Fail(BackendError),
    /// Wait for [`Gate::open`].
    Gate(Gate),
    /// Never yield again.
    Hang,
}

impl Step {
    pub fn delta(text: impl Into<String>) -> Self {
        Step::Event(GenerationEvent::delta(text))
    }

    pub fn done() -> Self {
        Step::Event(GenerationEvent::done())
    }
}

/// One-shot latch a script can wait on.
#[derive(Debug, Clone, Default)]
pub struct Gate(Arc<Notify>);

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        self.0.notify_one();
    }
}

#[derive(Debug, Clone)]
struct Script {
    steps: Vec<Step>,
    durable: bool,
}

#[derive(Debug, Default)]
struct ScriptState {
    on_start: HashMap<String, Script>,
    on_resume: HashMap<String, Script>,
    /// Steps waiting for `stream(handle)`.
    pending: HashMap<String, Vec<Step>>,
    statuses: HashMap<String, Result<UpstreamStatus, BackendError>>,
    finals: HashMap<String, FinalizedTask>,
    next_task: usize,
}

#[derive(Debug, Default)]
pub struct ScriptedBackend {
    state: Mutex<ScriptState>,
    starts: AtomicUsize,
    resumes: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the stream for `start` calls with this prompt. Process-local handle.
    pub fn on_start(&self, prompt: &str, steps: Vec<Step>) -> &Self {
        self.script(prompt, steps, false, true)
    }

    /// Like [`on_start`](Self::on_start) but the handle is durable.
    pub fn on_start_durable(&self, prompt: &str, steps: Vec<Step>) -> &Self {
        self.script(prompt, steps, true, true)
    }

    /// Script the stream for `resume` calls on a checkpoint with this prompt.
    pub fn on_resume(&self, prompt: &str, steps: Vec<Step>) -> &Self {
        self.script(prompt, steps, false, false)
    }

    fn script(&self, prompt: &str, steps: Vec<Step>, durable: bool, start: bool) -> &Self {
        let mut state = self.state.lock();
        let table = if start {
            &mut state.on_start
        } else {
            &mut state.on_resume
        };
        table.insert(prompt.to_string(), Script { steps, durable });
        self
    }

    /// Set what `status(task_id)` reports.
    pub fn set_status(&self, task_id: &str, status: UpstreamStatus) -> &Self {
        self.state
            .lock()
            .statuses
            .insert(task_id.to_string(), Ok(status));
        self
    }

    /// Make `status(task_id)` fail with a transport error.
    pub fn fail_status(&self, task_id: &str, error: BackendError) -> &Self {
        self.state
            .lock()
            .statuses
            .insert(task_id.to_string(), Err(error));
        self
    }

    pub fn set_final(&self, task_id: &str, content: impl Into<String>) -> &Self {
        self.state.lock().finals.insert(
            task_id.to_string(),
            FinalizedTask {
                content: content.into(),
                sources: Vec::new(),
            },
        );
        self
    }

    pub fn start_calls(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn resume_calls(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }

    fn issue(&self, state: &mut ScriptState, script: Script, reuse: Option<&str>) -> TaskHandle {
        let handle = match reuse {
            Some(id) => TaskHandle::durable(id),
            None => {
                state.next_task += 1;
                let id = format!("task-{}", state.next_task);
                if script.durable {
                    TaskHandle::durable(id)
                } else {
                    TaskHandle::local(id)
                }
            }
        };
        state.pending.insert(handle.id.clone(), script.steps);
        handle
    }
}

fn play(steps: Vec<Step>) -> EventStream {
    futures::stream::unfold(steps.into_iter(), |mut steps| async move {
        loop {
            match steps.next()? {
                Step::Event(event) => return Some((Ok(event), steps)),
                Step::Fail(error) => return Some((Err(error), steps)),
                Step::Gate(gate) => gate.0.notified().await,
                Step::Hang => futures::future::pending::<()>().await,
            }
        }
    })
    .boxed()
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn start(&self, request: &GenerationRequest) -> Result<TaskHandle, BackendError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        let script = state
            .on_start
            .get(&request.prompt)
            .cloned()
            .ok_or_else(|| BackendError::Upstream(format!("no script for {:?}", request.prompt)))?;
        Ok(self.issue(&mut state, script, None))
    }

    async fn resume(&self, checkpoint: &Checkpoint) -> Result<TaskHandle, BackendError> {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        let script = state
            .on_resume
            .get(&checkpoint.request.prompt)
            .cloned()
            .ok_or_else(|| {
                BackendError::Upstream(format!("no resume script for {:?}", checkpoint.request.prompt))
            })?;
        let reuse = checkpoint.upstream_task_id.clone();
        Ok(self.issue(&mut state, script, reuse.as_deref()))
    }

    async fn stream(&self, handle: &TaskHandle) -> Result<EventStream, BackendError> {
        let steps = self
            .state
            .lock()
            .pending
            .remove(&handle.id)
            .ok_or_else(|| BackendError::NotFound(handle.id.clone()))?;
        Ok(play(steps))
    }

    async fn status(&self, handle: &TaskHandle) -> Result<UpstreamStatus, BackendError> {
        self.state
            .lock()
            .statuses
            .get(&handle.id)
            .cloned()
            .unwrap_or(Ok(UpstreamStatus::NotFound))
    }

    async fn finalize(&self, handle: &TaskHandle) -> Result<FinalizedTask, BackendError> {
        self.state
            .lock()
            .finals
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(handle.id.clone()))
    }
}
