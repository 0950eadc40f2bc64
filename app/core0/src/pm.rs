//! The host process manager.
//!
//! A tokio-based implementation of the [`ProcessManager`] seam: one-shot
//! host utilities are awaited, long-lived ones (proxies, network joins)
//! are supervised by id, container spawns delegate to the launch
//! strategy in `core-containers`.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use core_containers::{
    launch, ContainerError, ContainerProcess, ProcessManager, Result, Runner, RunnerEvent,
    SystemCommand,
};
use core_proto::{Command, JobResult, State, Streams};

#[derive(Default)]
pub struct SystemProcessManager {
    supervised: Arc<Mutex<HashMap<String, i32>>>,
}

impl SystemProcessManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn supervise(&self, id: String, mut child: tokio::process::Child) -> Result<()> {
        let pid = child
            .id()
            .ok_or_else(|| ContainerError::Internal(format!("'{id}' has no pid")))?;
        self.supervised
            .lock()
            .unwrap()
            .insert(id.clone(), pid as i32);

        let supervised = Arc::clone(&self.supervised);
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => debug!("'{id}' exited cleanly"),
                Ok(status) => info!("'{id}' exited with {status}"),
                Err(e) => warn!("waiting for '{id}': {e}"),
            }
            supervised.lock().unwrap().remove(&id);
        });
        Ok(())
    }
}

#[async_trait]
impl ProcessManager for SystemProcessManager {
    async fn run_system(&self, cmd: SystemCommand) -> Result<JobResult> {
        let output = tokio::process::Command::new(&cmd.name)
            .args(&cmd.args)
            .stdin(Stdio::null())
            .output()
            .await?;

        let state = if output.status.success() {
            State::Success
        } else {
            State::Error
        };
        Ok(JobResult {
            id: cmd.id,
            command: cmd.name,
            state,
            data: String::new(),
            streams: Streams(
                String::from_utf8_lossy(&output.stdout).into_owned(),
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ),
        })
    }

    async fn spawn_system(&self, cmd: SystemCommand) -> Result<()> {
        let mut command = tokio::process::Command::new(&cmd.name);
        command.args(&cmd.args).stdin(Stdio::null());
        if cmd.no_output {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
        let child = command
            .spawn()
            .map_err(|e| ContainerError::Launch(format!("spawn {}: {e}", cmd.name)))?;
        self.supervise(cmd.id, child)
    }

    async fn run_command(&self, cmd: Command) -> Result<()> {
        // Host-side extension commands run the binary named by the
        // command, with the JSON argument map flattened to flags.
        let mut args = Vec::new();
        if let Some(map) = cmd.arguments.as_object() {
            for (key, value) in map {
                args.push(format!("-{key}"));
                match value.as_str() {
                    Some(text) => args.push(text.to_string()),
                    None => args.push(value.to_string()),
                }
            }
        }

        let child = tokio::process::Command::new(&cmd.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ContainerError::Launch(format!("spawn {}: {e}", cmd.command)))?;
        self.supervise(cmd.id, child)
    }

    async fn spawn_container(
        &self,
        spec: ContainerProcess,
    ) -> Result<(Box<dyn Runner>, mpsc::Receiver<RunnerEvent>)> {
        launch::spawn(spec).await
    }

    async fn kill(&self, id: &str) -> Result<()> {
        let pid = self.supervised.lock().unwrap().get(id).copied();
        match pid {
            Some(pid) => {
                kill(Pid::from_raw(pid), Signal::SIGTERM)
                    .map_err(|e| ContainerError::Internal(format!("kill '{id}': {e}")))?;
                Ok(())
            }
            None => Err(ContainerError::Internal(format!(
                "no supervised command '{id}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_system_captures_streams_and_state() {
        let pm = SystemProcessManager::new();
        let result = pm
            .run_system(SystemCommand::new("sh", ["-c", "echo out; echo err >&2"]))
            .await
            .unwrap();
        assert_eq!(result.state, State::Success);
        assert_eq!(result.streams.stdout(), "out\n");
        assert_eq!(result.streams.stderr(), "err\n");

        let result = pm
            .run_system(SystemCommand::new("sh", ["-c", "exit 3"]))
            .await
            .unwrap();
        assert_eq!(result.state, State::Error);
    }

    #[tokio::test]
    async fn supervised_commands_are_killable_by_id() {
        let pm = SystemProcessManager::new();
        pm.spawn_system(SystemCommand::with_id("sleeper", "sleep", ["30"]))
            .await
            .unwrap();
        assert!(pm.kill("sleeper").await.is_ok());

        // The waiter task reaps it and forgets the id.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(pm.kill("sleeper").await.is_err());
    }

    #[tokio::test]
    async fn killing_an_unknown_id_is_an_error() {
        let pm = SystemProcessManager::new();
        assert!(pm.kill("socat-9-1-1").await.is_err());
    }
}
