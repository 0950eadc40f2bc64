//! Error types for the containers subsystem.

use thiserror::Error;

/// Result type alias for container operations.
pub type Result<T> = std::result::Result<T, ContainerError>;

/// Errors that can occur while managing containers.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire protocol error.
    #[error(transparent)]
    Proto(#[from] core_proto::ProtoError),

    /// Invalid NIC specification or other bad creation arguments.
    #[error("config error: {0}")]
    Config(String),

    /// Backend creation, overlay mount, or bind mount failed.
    #[error("sandbox error: {0}")]
    Sandbox(String),

    /// The process manager refused to spawn the inner agent.
    #[error("launch error: {0}")]
    Launch(String),

    /// A netlink, `ip`, or OVS dispatch step failed.
    #[error("network error: {0}")]
    Network(String),

    /// The inner agent disappeared or the channel framing broke.
    #[error("channel error: {0}")]
    Channel(String),

    /// No live container with this id.
    #[error("no container with id {0}")]
    NotFound(u16),

    /// Invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<core_net::NetError> for ContainerError {
    fn from(err: core_net::NetError) -> Self {
        Self::Network(err.to_string())
    }
}
