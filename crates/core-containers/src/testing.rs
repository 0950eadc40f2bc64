//! Scripted process manager for tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use core_proto::{Command, JobResult};

use crate::error::{ContainerError, Result};
use crate::process::{ContainerProcess, ProcessManager, Runner, RunnerEvent, SystemCommand};

#[derive(Debug)]
#[allow(dead_code)]
pub(crate) enum MockCall {
    RunSystem(SystemCommand),
    SpawnSystem(SystemCommand),
    RunCommand(Command),
    SpawnContainer(ContainerProcess),
    Kill(String),
}

/// Records every call and answers success; container spawns hand the
/// event sender back to the test through `events`.
pub(crate) struct MockProcessManager {
    pub calls: Mutex<Vec<MockCall>>,
    pub fail_spawn: AtomicBool,
    #[allow(dead_code)]
    pub events: Mutex<Option<tokio::sync::mpsc::Sender<RunnerEvent>>>,
}

impl MockProcessManager {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            fail_spawn: AtomicBool::new(false),
            events: Mutex::new(None),
        })
    }

    pub(crate) fn kills(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|call| match call {
                MockCall::Kill(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ProcessManager for MockProcessManager {
    async fn run_system(&self, cmd: SystemCommand) -> Result<JobResult> {
        let id = cmd.id.clone();
        self.calls.lock().unwrap().push(MockCall::RunSystem(cmd));
        Ok(JobResult::success(id, String::new()))
    }

    async fn spawn_system(&self, cmd: SystemCommand) -> Result<()> {
        self.calls.lock().unwrap().push(MockCall::SpawnSystem(cmd));
        Ok(())
    }

    async fn run_command(&self, cmd: Command) -> Result<()> {
        self.calls.lock().unwrap().push(MockCall::RunCommand(cmd));
        Ok(())
    }

    async fn spawn_container(
        &self,
        spec: ContainerProcess,
    ) -> Result<(Box<dyn Runner>, tokio::sync::mpsc::Receiver<RunnerEvent>)> {
        self.calls
            .lock()
            .unwrap()
            .push(MockCall::SpawnContainer(spec));
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(ContainerError::Launch("refused by test".into()));
        }

        let (sender, receiver) = tokio::sync::mpsc::channel(8);
        *self.events.lock().unwrap() = Some(sender.clone());
        Ok((Box::new(MockRunner { events: sender }), receiver))
    }

    async fn kill(&self, id: &str) -> Result<()> {
        self.calls.lock().unwrap().push(MockCall::Kill(id.into()));
        Ok(())
    }
}

struct MockRunner {
    events: tokio::sync::mpsc::Sender<RunnerEvent>,
}

#[async_trait]
impl Runner for MockRunner {
    fn id(&self) -> &str {
        "mock"
    }

    async fn terminate(&self) {
        let _ = self.events.send(RunnerEvent::Exited { ok: true }).await;
    }
}
