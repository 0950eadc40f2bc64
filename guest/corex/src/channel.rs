//! Guest side of the host command channel.
//!
//! Commands arrive as newline-terminated JSON; every one is answered
//! with a result carrying the same id, FIFO. Unknown commands come back
//! as `unknown-cmd` rather than killing the agent.

use std::process::Stdio;

use anyhow::Result;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::warn;

use core_proto::{frame, Command, JobResult, State, Streams};

/// Arguments of `core.system`.
#[derive(Debug, Deserialize)]
struct SystemArguments {
    name: String,
    #[serde(default)]
    args: Vec<String>,
}

/// Serves the channel until the host closes it.
///
/// # Errors
///
/// Returns an error if the stream breaks mid-write.
pub async fn serve(stream: UnixStream) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let result = match frame::from_line::<Command>(&line) {
            Ok(cmd) => handle(cmd).await,
            Err(e) => {
                warn!("dropping malformed command: {e}");
                continue;
            }
        };
        write.write_all(&frame::to_line(&result)?).await?;
    }
    Ok(())
}

async fn handle(cmd: Command) -> JobResult {
    match cmd.command.as_str() {
        "core.ping" => JobResult::success(cmd.id, "\"pong\""),
        "core.system" => match cmd.args::<SystemArguments>() {
            Ok(args) => run_system(&cmd.id, &args).await,
            Err(e) => JobResult::error(cmd.id, e.to_string()),
        },
        _ => JobResult::unknown(cmd.id, cmd.command),
    }
}

async fn run_system(id: &str, args: &SystemArguments) -> JobResult {
    let output = tokio::process::Command::new(&args.name)
        .args(&args.args)
        .stdin(Stdio::null())
        .output()
        .await;

    match output {
        Ok(output) => JobResult {
            id: id.to_string(),
            command: args.name.clone(),
            state: if output.status.success() {
                State::Success
            } else {
                State::Error
            },
            data: String::new(),
            streams: Streams(
                String::from_utf8_lossy(&output.stdout).into_owned(),
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ),
        },
        Err(e) => JobResult::error(id, format!("spawn {}: {e}", args.name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn ping_pongs_with_the_same_id() {
        let cmd = Command::new("core.ping", &json!({})).unwrap();
        let result = handle(cmd.clone()).await;
        assert_eq!(result.id, cmd.id);
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn unknown_commands_do_not_kill_the_agent() {
        let cmd = Command::new("core.reboot", &json!({})).unwrap();
        let result = handle(cmd).await;
        assert_eq!(result.state, State::UnknownCmd);
    }

    #[tokio::test]
    async fn system_commands_capture_output() {
        let cmd = Command::new(
            "core.system",
            &json!({"name": "sh", "args": ["-c", "echo hello"]}),
        )
        .unwrap();
        let result = handle(cmd).await;
        assert!(result.is_success());
        assert_eq!(result.streams.stdout(), "hello\n");
    }

    #[tokio::test]
    async fn serve_answers_over_the_stream() {
        let (host, guest) = UnixStream::pair().unwrap();
        tokio::spawn(async move {
            let _ = serve(guest).await;
        });

        let (read, mut write) = host.into_split();
        let cmd = Command::new("core.ping", &json!({})).unwrap();
        write
            .write_all(&frame::to_line(&cmd).unwrap())
            .await
            .unwrap();

        let mut lines = BufReader::new(read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let result: JobResult = frame::from_line(&line).unwrap();
        assert_eq!(result.id, cmd.id);
        assert!(result.is_success());
    }
}
