//! Job results.

use serde::{Deserialize, Serialize};

/// Terminal state of a dispatched command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum State {
    Success,
    Error,
    Killed,
    Timeout,
    UnknownCmd,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
            Self::Killed => write!(f, "killed"),
            Self::Timeout => write!(f, "timeout"),
            Self::UnknownCmd => write!(f, "unknown-cmd"),
        }
    }
}

/// Captured stdout and stderr of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Streams(pub String, pub String);

impl Streams {
    #[must_use]
    pub fn stdout(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn stderr(&self) -> &str {
        &self.1
    }
}

/// The reply to a [`Command`](crate::Command), keyed by the same id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub id: String,
    #[serde(default)]
    pub command: String,
    pub state: State,
    /// Payload: JSON-encoded result data on success, a message on error.
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub streams: Streams,
}

impl JobResult {
    #[must_use]
    pub fn success(id: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: String::new(),
            state: State::Success,
            data: data.into(),
            streams: Streams::default(),
        }
    }

    #[must_use]
    pub fn error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: String::new(),
            state: State::Error,
            data: message.into(),
            streams: Streams::default(),
        }
    }

    #[must_use]
    pub fn unknown(id: impl Into<String>, command: impl Into<String>) -> Self {
        let command = command.into();
        Self {
            id: id.into(),
            command: command.clone(),
            state: State::UnknownCmd,
            data: format!("unknown command '{command}'"),
            streams: Streams::default(),
        }
    }

    /// Serializes `data` into the result payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn with_data(mut self, data: &impl Serialize) -> crate::Result<Self> {
        self.data = serde_json::to_string(data)?;
        Ok(self)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.state == State::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_use_kebab_case_on_the_wire() {
        assert_eq!(
            serde_json::to_string(&State::UnknownCmd).unwrap(),
            "\"unknown-cmd\""
        );
        let state: State = serde_json::from_str("\"success\"").unwrap();
        assert_eq!(state, State::Success);
    }

    #[test]
    fn result_id_matches_request_id() {
        let result = JobResult::success("cmd-1", "\"done\"");
        assert_eq!(result.id, "cmd-1");
        assert!(result.is_success());
    }
}
