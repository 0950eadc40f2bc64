//! The process-manager seam.
//!
//! The generic process/job manager that actually spawns subprocesses is an
//! external collaborator; the orchestrator only depends on this trait. One
//! tokio-based implementation ships with the host binary, a scripted one
//! backs the tests.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::net::UnixStream;
use tokio::sync::mpsc;

use core_proto::{Command, JobResult};

use crate::error::Result;

/// A host utility invocation (`ip`, `btrfs`, `socat`, ...).
#[derive(Debug, Clone)]
pub struct SystemCommand {
    /// Stable id; supervised processes are killed by it later.
    pub id: String,
    pub name: String,
    pub args: Vec<String>,
    /// Discard output instead of capturing it (long-lived proxies).
    pub no_output: bool,
}

impl SystemCommand {
    /// Builds a one-shot command under a fresh id.
    pub fn new(name: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), name, args)
    }

    /// Builds a command under a caller-chosen id.
    pub fn with_id(
        id: impl Into<String>,
        name: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
            no_output: false,
        }
    }

    #[must_use]
    pub fn no_output(mut self) -> Self {
        self.no_output = true;
        self
    }
}

/// The launch strategy contract for the inner agent.
#[derive(Debug, Clone)]
pub struct ContainerProcess {
    /// Command id the child is supervised under.
    pub id: String,
    /// Path of the agent binary inside the chroot.
    pub binary: String,
    /// The prepared container root.
    pub chroot: PathBuf,
    /// Working directory inside the chroot.
    pub dir: PathBuf,
    /// Skip the fresh network namespace.
    pub host_network: bool,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

/// Lifecycle notifications for a spawned container process.
///
/// Single-fire each, delivered in order: `Started` first, `Exited` last.
#[derive(Debug)]
pub enum RunnerEvent {
    /// The child exists. `channel` is the host end of the socketpair the
    /// child sees as fd 3.
    Started { pid: u32, channel: UnixStream },
    /// The child is gone; `ok` reflects its exit status.
    Exited { ok: bool },
}

/// Handle over a spawned container process.
#[async_trait]
pub trait Runner: Send + Sync {
    /// The command id the process was spawned under.
    fn id(&self) -> &str;

    /// Delivers SIGTERM. The exit is observed through [`RunnerEvent`].
    async fn terminate(&self);
}

/// External process/job manager contract.
#[async_trait]
pub trait ProcessManager: Send + Sync {
    /// Spawns a host utility and awaits its result.
    async fn run_system(&self, cmd: SystemCommand) -> Result<JobResult>;

    /// Spawns a supervised host utility without waiting; addressable by
    /// its id through [`ProcessManager::kill`].
    async fn spawn_system(&self, cmd: SystemCommand) -> Result<()>;

    /// Dispatches a named command into the process manager's own
    /// registry (network joins and similar host-side extensions).
    async fn run_command(&self, cmd: Command) -> Result<()>;

    /// Spawns the inner agent per the [`ContainerProcess`] contract.
    async fn spawn_container(
        &self,
        spec: ContainerProcess,
    ) -> Result<(Box<dyn Runner>, mpsc::Receiver<RunnerEvent>)>;

    /// Terminates a supervised process by id.
    async fn kill(&self, id: &str) -> Result<()>;
}
