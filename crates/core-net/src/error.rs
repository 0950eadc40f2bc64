//! Error types for host networking.

use thiserror::Error;

/// Result type alias for networking operations.
pub type Result<T> = std::result::Result<T, NetError>;

/// Errors that can occur while wiring container networking.
#[derive(Debug, Error)]
pub enum NetError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Netlink request failed.
    #[error("netlink error: {0}")]
    Netlink(String),

    /// Named network namespace error.
    #[error("netns error: {0}")]
    Netns(String),

    /// A hardware address that does not parse.
    #[error("invalid MAC address '{0}'")]
    InvalidMac(String),
}
