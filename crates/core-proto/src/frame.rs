//! Line framing.
//!
//! One JSON object per line, terminated by `\n`. The host writes
//! [`Command`](crate::Command) lines, the guest writes
//! [`JobResult`](crate::JobResult) lines; neither side embeds raw
//! newlines because JSON string escapes cover them.

use serde::{de::DeserializeOwned, Serialize};

use crate::Result;

/// Encodes a message as one newline-terminated JSON line.
///
/// # Errors
///
/// Returns an error if the message cannot be serialized.
pub fn to_line<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

/// Decodes one line into a message, tolerating the trailing newline.
///
/// # Errors
///
/// Returns an error if the line is not valid JSON of the expected shape.
pub fn from_line<T: DeserializeOwned>(line: &str) -> Result<T> {
    Ok(serde_json::from_str(line.trim_end())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Command, JobResult};
    use serde_json::json;

    #[test]
    fn command_line_round_trip() {
        let cmd = Command::new("container.list", &json!({})).unwrap();
        let line = to_line(&cmd).unwrap();
        assert_eq!(*line.last().unwrap(), b'\n');

        let parsed: Command = from_line(std::str::from_utf8(&line).unwrap()).unwrap();
        assert_eq!(parsed.id, cmd.id);
        assert_eq!(parsed.command, "container.list");
    }

    #[test]
    fn result_line_round_trip() {
        let line = to_line(&JobResult::error("x", "boom")).unwrap();
        let parsed: JobResult = from_line(std::str::from_utf8(&line).unwrap()).unwrap();
        assert_eq!(parsed.data, "boom");
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(from_line::<JobResult>("{not json").is_err());
    }
}
