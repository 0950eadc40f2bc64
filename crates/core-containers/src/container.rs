//! The per-container record and its lifecycle.
//!
//! A container moves `Creating → Sandboxed → Launched → Running →
//! Terminating → Gone`. Any failure before `Running` unwinds back to
//! `Gone` through the same cleanup path the exit event uses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

use core_proto::{Command, JobResult, Route};

use crate::args::{ContainerCreateArguments, Nic};
use crate::channel::Channel;
use crate::error::{ContainerError, Result};
use crate::manager::ContainerManager;
use crate::process::{ContainerProcess, ProcessManager, Runner, RunnerEvent};
use crate::sandbox::{Sandbox, AGENT_GUEST_PATH};
use crate::settings::ContainerSettings;

const CHILD_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Lifecycle state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Creating,
    Sandboxed,
    Launched,
    Running,
    Terminating,
    Gone,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Sandboxed => write!(f, "sandboxed"),
            Self::Launched => write!(f, "launched"),
            Self::Running => write!(f, "running"),
            Self::Terminating => write!(f, "terminating"),
            Self::Gone => write!(f, "gone"),
        }
    }
}

/// Snapshot row returned by `container.list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub spec: ContainerCreateArguments,
    pub pid: u32,
    pub state: ContainerState,
}

pub(crate) struct NicSlot {
    pub nic: Nic,
    pub active: bool,
}

/// One live container.
pub struct Container {
    id: u16,
    args: ContainerCreateArguments,
    route: Option<Route>,
    pub(crate) nics: Mutex<Vec<NicSlot>>,
    pid: AtomicU32,
    state: watch::Sender<ContainerState>,
    sandbox: Sandbox,
    channel: Mutex<Option<Arc<Channel>>>,
    runner: Mutex<Option<Arc<dyn Runner>>>,
    pub(crate) zerotier_started: AtomicBool,
    cleaned: AtomicBool,
    mgr: Weak<ContainerManager>,
    pm: Arc<dyn ProcessManager>,
    settings: Arc<ContainerSettings>,
}

impl Container {
    pub(crate) fn new(
        id: u16,
        args: ContainerCreateArguments,
        route: Option<Route>,
        mgr: Weak<ContainerManager>,
        pm: Arc<dyn ProcessManager>,
        settings: Arc<ContainerSettings>,
    ) -> Self {
        let nics = args
            .nics
            .iter()
            .cloned()
            .map(|nic| NicSlot { nic, active: true })
            .collect();
        let (state, _) = watch::channel(ContainerState::Creating);
        Self {
            id,
            sandbox: Sandbox::new(id, settings.clone()),
            args,
            route,
            nics: Mutex::new(nics),
            pid: AtomicU32::new(0),
            state,
            channel: Mutex::new(None),
            runner: Mutex::new(None),
            zerotier_started: AtomicBool::new(false),
            cleaned: AtomicBool::new(false),
            mgr,
            pm,
            settings,
        }
    }

    #[must_use]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Host pid of the inner agent; 0 until the started event fires.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn state(&self) -> ContainerState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn tags(&self) -> &[String] {
        &self.args.tags
    }

    pub(crate) fn arguments(&self) -> &ContainerCreateArguments {
        &self.args
    }

    /// The routing tag results for this container's owner travel under.
    #[must_use]
    pub fn route(&self) -> Option<&Route> {
        self.route.as_ref()
    }

    pub(crate) fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub(crate) fn settings(&self) -> &ContainerSettings {
        &self.settings
    }

    pub(crate) fn pm(&self) -> &dyn ProcessManager {
        self.pm.as_ref()
    }

    pub(crate) fn manager(&self) -> Result<Arc<ContainerManager>> {
        self.mgr
            .upgrade()
            .ok_or_else(|| ContainerError::Internal("container manager is gone".into()))
    }

    #[must_use]
    pub fn summary(&self) -> ContainerSummary {
        ContainerSummary {
            spec: self.args.clone(),
            pid: self.pid(),
            state: self.state(),
        }
    }

    fn set_state(&self, state: ContainerState) {
        self.state.send_replace(state);
    }

    /// Runs the create pipeline: sandbox, host-side network wiring,
    /// launch. A failure anywhere unwinds everything built so far.
    pub(crate) async fn start(self: &Arc<Self>) -> Result<()> {
        if let Err(e) = self.try_start().await {
            error!("container {}: start failed: {e}", self.id);
            self.cleanup().await;
            return Err(e);
        }
        Ok(())
    }

    async fn try_start(self: &Arc<Self>) -> Result<()> {
        self.sandbox.prepare(self.pm.as_ref(), &self.args).await?;
        self.set_state(ContainerState::Sandboxed);

        self.pre_start().await?;

        let mut args = vec!["-hostname".to_string(), self.args.hostname.clone()];
        if !self.args.privileged {
            args.push("-unprivileged".to_string());
        }

        let mut env = HashMap::new();
        env.insert("PATH".to_string(), CHILD_PATH.to_string());
        env.insert("HOME".to_string(), "/".to_string());

        let spec = ContainerProcess {
            id: format!("core-{}", self.id),
            binary: format!("/{AGENT_GUEST_PATH}"),
            chroot: self.sandbox.root(),
            dir: "/".into(),
            host_network: self.args.host_network,
            args,
            env,
        };

        let (runner, events) = self.pm.spawn_container(spec).await?;
        *self.runner.lock().unwrap() = Some(Arc::from(runner));
        self.set_state(ContainerState::Launched);

        let container = Arc::clone(self);
        tokio::spawn(container.run_events(events));
        Ok(())
    }

    /// Drives the runner's lifecycle events. `Started` always precedes
    /// `Exited`; both fire at most once.
    async fn run_events(self: Arc<Self>, mut events: mpsc::Receiver<RunnerEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                RunnerEvent::Started { pid, channel } => self.on_started(pid, channel).await,
                RunnerEvent::Exited { ok } => {
                    debug!("container {} exited with state {ok}", self.id);
                    self.cleanup().await;
                    return;
                }
            }
        }
        // The runner dropped its event channel without reporting an
        // exit; treat it like a failed child.
        warn!("container {}: runner went away", self.id);
        self.cleanup().await;
    }

    async fn on_started(self: &Arc<Self>, pid: u32, stream: UnixStream) {
        self.pid.store(pid, Ordering::SeqCst);

        let channel = Arc::new(Channel::new(stream));
        *self.channel.lock().unwrap() = Some(Arc::clone(&channel));

        if let Err(e) = self.post_start().await {
            error!("container {}: post start error: {e}", self.id);
        }

        // Replies may only be consumed once post-start wiring is done.
        let container = Arc::clone(self);
        channel.serve(move || {
            if container.state() == ContainerState::Running {
                warn!("container {}: channel closed, terminating", container.id);
                container.set_state(ContainerState::Terminating);
                let container = Arc::clone(&container);
                tokio::spawn(async move {
                    let runner = container.runner.lock().unwrap().clone();
                    if let Some(runner) = runner {
                        runner.terminate().await;
                    }
                });
            }
        });

        self.set_state(ContainerState::Running);
    }

    /// Sends SIGTERM and waits for the container to reach `Gone`.
    ///
    /// Idempotent: terminating a container that is already unwinding,
    /// or already gone, succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error only if the state channel breaks mid-wait.
    pub async fn terminate(&self) -> Result<()> {
        let runner = self.runner.lock().unwrap().clone();
        let Some(runner) = runner else {
            return Ok(());
        };

        if self.state() == ContainerState::Gone {
            return Ok(());
        }
        self.set_state(ContainerState::Terminating);
        runner.terminate().await;

        let mut state = self.state.subscribe();
        while *state.borrow() != ContainerState::Gone {
            state
                .changed()
                .await
                .map_err(|_| ContainerError::Internal("state channel closed".into()))?;
        }
        Ok(())
    }

    /// Writes a command to the inner agent without waiting.
    ///
    /// # Errors
    ///
    /// Returns a channel error when the container has no live channel.
    pub async fn dispatch(&self, cmd: &Command) -> Result<()> {
        let channel = self.channel()?;
        channel.dispatch(cmd).await
    }

    /// Writes a command to the inner agent and awaits its result.
    ///
    /// # Errors
    ///
    /// Returns a channel error when the container has no live channel.
    pub async fn dispatch_sync(&self, cmd: &Command) -> Result<JobResult> {
        let channel = self.channel()?;
        channel.dispatch_sync(cmd).await
    }

    fn channel(&self) -> Result<Arc<Channel>> {
        self.channel
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ContainerError::Channel(format!("container {} has no channel", self.id)))
    }

    /// Unwinds the container: channel, network, sandbox, manager row.
    /// Best-effort throughout; every step runs.
    pub(crate) async fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("cleaning up container-{}", self.id);
        self.set_state(ContainerState::Terminating);

        let channel = self.channel.lock().unwrap().take();
        if let Some(channel) = channel {
            channel.close().await;
        }

        self.destroy_network().await;
        self.sandbox.teardown(self.pm.as_ref()).await;

        if let Some(mgr) = self.mgr.upgrade() {
            mgr.forget(self.id);
        }
        self.set_state(ContainerState::Gone);
    }

    pub(crate) fn nic_snapshot(&self) -> Vec<(usize, Nic)> {
        self.nics
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.active)
            .map(|(idx, slot)| (idx, slot.nic.clone()))
            .collect()
    }
}
