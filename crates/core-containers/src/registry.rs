//! Command routing.
//!
//! A registry object built at startup maps command prefixes to
//! subsystems; there is no process-wide command table. Unknown commands
//! come back as `unknown-cmd`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use core_proto::{Command, JobResult};

use crate::args::{
    ContainerCreateArguments, ContainerDispatchArguments, ContainerTerminateArguments,
    NicAddArguments, NicRemoveArguments,
};
use crate::manager::ContainerManager;

/// One command namespace (`container.*`, `ovs.*`, ...).
#[async_trait]
pub trait Subsystem: Send + Sync {
    async fn dispatch(&self, cmd: Command) -> JobResult;
}

/// Explicit command registry, constructed at startup and handed to
/// whoever feeds commands in.
#[derive(Default)]
pub struct Registry {
    subsystems: HashMap<String, Arc<dyn Subsystem>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subsystem under a command prefix.
    pub fn register(&mut self, prefix: impl Into<String>, subsystem: Arc<dyn Subsystem>) {
        self.subsystems.insert(prefix.into(), subsystem);
    }

    /// Routes a command to its subsystem by the part before the first
    /// dot.
    pub async fn dispatch(&self, cmd: Command) -> JobResult {
        let prefix = cmd.command.split('.').next().unwrap_or_default();
        match self.subsystems.get(prefix) {
            Some(subsystem) => subsystem.dispatch(cmd).await,
            None => JobResult::unknown(cmd.id, cmd.command),
        }
    }
}

/// The `container.*` command surface.
pub struct ContainersSubsystem {
    manager: Arc<ContainerManager>,
}

impl ContainersSubsystem {
    #[must_use]
    pub fn new(manager: Arc<ContainerManager>) -> Arc<Self> {
        Arc::new(Self { manager })
    }
}

fn reply<T: Serialize>(id: &str, outcome: crate::error::Result<T>) -> JobResult {
    match outcome {
        Ok(value) => JobResult::success(id, String::new())
            .with_data(&value)
            .unwrap_or_else(|e| JobResult::error(id, e.to_string())),
        Err(e) => JobResult::error(id, e.to_string()),
    }
}

#[async_trait]
impl Subsystem for ContainersSubsystem {
    async fn dispatch(&self, cmd: Command) -> JobResult {
        match cmd.command.as_str() {
            "container.create" => match cmd.args::<ContainerCreateArguments>() {
                Ok(args) => reply(
                    &cmd.id,
                    self.manager.create(args, cmd.route.clone()).await,
                ),
                Err(e) => JobResult::error(cmd.id, e.to_string()),
            },
            "container.terminate" => match cmd.args::<ContainerTerminateArguments>() {
                Ok(args) => reply(&cmd.id, self.manager.terminate(args.container).await),
                Err(e) => JobResult::error(cmd.id, e.to_string()),
            },
            "container.list" => reply(&cmd.id, Ok(self.manager.list())),
            "container.dispatch" => match cmd.args::<ContainerDispatchArguments>() {
                Ok(args) => match self
                    .manager
                    .dispatch_sync(args.container, args.command)
                    .await
                {
                    // The forwarded result keeps the inner command's id.
                    Ok(result) => result,
                    Err(e) => JobResult::error(cmd.id, e.to_string()),
                },
                Err(e) => JobResult::error(cmd.id, e.to_string()),
            },
            "container.nic-add" => match cmd.args::<NicAddArguments>() {
                Ok(args) => reply(&cmd.id, self.manager.nic_add(args.container, args.nic).await),
                Err(e) => JobResult::error(cmd.id, e.to_string()),
            },
            "container.nic-remove" => match cmd.args::<NicRemoveArguments>() {
                Ok(args) => reply(
                    &cmd.id,
                    self.manager.nic_remove(args.container, args.index).await,
                ),
                Err(e) => JobResult::error(cmd.id, e.to_string()),
            },
            _ => JobResult::unknown(cmd.id, cmd.command),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ContainerSettings;
    use crate::testing::MockProcessManager;
    use core_proto::State;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn registry() -> Registry {
        let pm = MockProcessManager::new();
        let manager = ContainerManager::new(pm, ContainerSettings::default());
        let mut registry = Registry::new();
        registry.register("container", ContainersSubsystem::new(manager));
        registry
    }

    #[tokio::test]
    async fn unknown_prefix_is_unknown_cmd() {
        let registry = registry();
        let cmd = Command::new("disk.list", &json!({})).unwrap();
        let result = registry.dispatch(cmd.clone()).await;
        assert_eq!(result.state, State::UnknownCmd);
        assert_eq!(result.id, cmd.id);
    }

    #[tokio::test]
    async fn unknown_container_command_is_unknown_cmd() {
        let registry = registry();
        let cmd = Command::new("container.pause", &json!({})).unwrap();
        let result = registry.dispatch(cmd).await;
        assert_eq!(result.state, State::UnknownCmd);
    }

    #[tokio::test]
    async fn list_starts_empty() {
        let registry = registry();
        let cmd = Command::new("container.list", &json!({})).unwrap();
        let result = registry.dispatch(cmd).await;
        assert!(result.is_success());

        let listed: BTreeMap<u16, serde_json::Value> =
            serde_json::from_str(&result.data).unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn create_with_bad_arguments_is_an_error_result() {
        let registry = registry();
        // Missing root.
        let cmd = Command::new("container.create", &json!({"hostname": "t1"})).unwrap();
        let result = registry.dispatch(cmd).await;
        assert_eq!(result.state, State::Error);
        assert!(result.data.contains("root"));
    }

    #[tokio::test]
    async fn terminate_of_dead_id_succeeds_over_the_wire() {
        let registry = registry();
        let cmd = Command::new("container.terminate", &json!({"container": 11})).unwrap();
        let result = registry.dispatch(cmd).await;
        assert!(result.is_success());
    }
}
