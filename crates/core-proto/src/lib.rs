//! # core-proto
//!
//! Wire protocol shared by the host agent (core0) and the agents running
//! inside containers (coreX).
//!
//! Every operation is a [`Command`] and yields a [`JobResult`]. Both travel
//! as newline-terminated JSON objects, FIFO per direction, over whatever
//! byte stream connects the two sides (an `AF_UNIX` socketpair for
//! containers).

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod command;
pub mod frame;
pub mod result;

pub use command::{Command, Route};
pub use frame::{from_line, to_line};
pub use result::{JobResult, State, Streams};

/// Result type alias for protocol encoding and decoding.
pub type Result<T> = std::result::Result<T, ProtoError>;

/// Errors produced while encoding or decoding protocol messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// Malformed JSON, or a payload that does not match the expected shape.
    #[error("protocol framing error: {0}")]
    Frame(#[from] serde_json::Error),

    /// A command whose `arguments` cannot be interpreted for its name.
    #[error("bad arguments for '{command}': {reason}")]
    BadArguments { command: String, reason: String },
}
