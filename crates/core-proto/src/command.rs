//! Command envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ProtoError, Result};

/// Opaque routing tag.
///
/// Attached to a command so the result can find its way back to the
/// original requester; the host never interprets the content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Route(pub String);

impl Route {
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }
}

/// A single operation dispatched to a subsystem or into a container.
///
/// `arguments` is an opaque JSON payload whose shape is chosen by
/// `command`; use [`Command::args`] to interpret it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<Route>,
}

impl Command {
    /// Builds a command with a fresh v4 UUID as its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the arguments cannot be serialized.
    pub fn new(command: impl Into<String>, arguments: &impl Serialize) -> Result<Self> {
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            command: command.into(),
            arguments: serde_json::to_value(arguments)?,
            route: None,
        })
    }

    /// Builds a command under a caller-chosen id.
    ///
    /// Stable ids are how supervised processes (port forwarders, network
    /// joins) are addressed for a later kill.
    ///
    /// # Errors
    ///
    /// Returns an error if the arguments cannot be serialized.
    pub fn with_id(
        id: impl Into<String>,
        command: impl Into<String>,
        arguments: &impl Serialize,
    ) -> Result<Self> {
        Ok(Self {
            id: id.into(),
            command: command.into(),
            arguments: serde_json::to_value(arguments)?,
            route: None,
        })
    }

    /// Attaches a routing tag.
    #[must_use]
    pub fn routed(mut self, route: Route) -> Self {
        self.route = Some(route);
        self
    }

    /// Interprets the arguments as `T`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::BadArguments`] when the payload does not
    /// match the shape `command` calls for.
    pub fn args<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.arguments.clone()).map_err(|e| ProtoError::BadArguments {
            command: self.command.clone(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize, Deserialize)]
    struct Payload {
        port: u16,
    }

    #[test]
    fn typed_arguments_round_trip() {
        let cmd = Command::new("ovs.port-add", &Payload { port: 80 }).unwrap();
        let payload: Payload = cmd.args().unwrap();
        assert_eq!(payload.port, 80);
    }

    #[test]
    fn mismatched_arguments_are_rejected() {
        let cmd = Command::new("ovs.port-add", &json!({"port": "not-a-number"})).unwrap();
        assert!(cmd.args::<Payload>().is_err());
    }

    #[test]
    fn route_survives_serialization() {
        let cmd = Command::new("container.list", &json!({}))
            .unwrap()
            .routed(Route::new("return-queue-7"));
        let parsed: Command = serde_json::from_str(&serde_json::to_string(&cmd).unwrap()).unwrap();
        assert_eq!(parsed.route, Some(Route::new("return-queue-7")));
    }
}
