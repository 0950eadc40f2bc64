//! Host side of the host/guest command channel.
//!
//! Commands go down as newline-terminated JSON, results come back the
//! same way, FIFO per direction. A pending table keyed by command id
//! pairs replies with synchronous dispatches; closing the channel fails
//! every outstanding wait with an `error` result.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use core_proto::{frame, Command, JobResult};

use crate::error::{ContainerError, Result};

#[derive(Default)]
struct Pending {
    waiters: HashMap<String, oneshot::Sender<JobResult>>,
    closed: bool,
}

impl Pending {
    fn drain(&mut self) {
        self.closed = true;
        for (id, sender) in self.waiters.drain() {
            let _ = sender.send(JobResult::error(id, "channel closed"));
        }
    }
}

/// Bidirectional command stream to one inner agent.
pub struct Channel {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Arc<Mutex<Pending>>,
    reader: Mutex<Option<OwnedReadHalf>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    /// Wraps the host end of the agent socketpair.
    ///
    /// The channel does not consume replies until [`Channel::serve`]
    /// runs; post-start must finish first.
    #[must_use]
    pub fn new(stream: UnixStream) -> Self {
        let (read, write) = stream.into_split();
        Self {
            writer: tokio::sync::Mutex::new(write),
            pending: Arc::new(Mutex::new(Pending::default())),
            reader: Mutex::new(Some(read)),
            task: Mutex::new(None),
        }
    }

    /// Starts the reply reader. `on_closed` fires once when the stream
    /// ends or breaks.
    pub fn serve(&self, on_closed: impl FnOnce() + Send + 'static) {
        let Some(read) = self.reader.lock().unwrap().take() else {
            return;
        };
        let pending = Arc::clone(&self.pending);

        let task = tokio::spawn(async move {
            let mut lines = BufReader::new(read).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match frame::from_line::<JobResult>(&line) {
                        Ok(result) => {
                            let waiter = pending.lock().unwrap().waiters.remove(&result.id);
                            match waiter {
                                Some(sender) => {
                                    let _ = sender.send(result);
                                }
                                None => debug!("unsolicited result for '{}'", result.id),
                            }
                        }
                        Err(e) => {
                            warn!("channel framing error: {e}");
                            break;
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!("channel read error: {e}");
                        break;
                    }
                }
            }
            pending.lock().unwrap().drain();
            on_closed();
        });

        *self.task.lock().unwrap() = Some(task);
    }

    /// Writes a command without waiting for its result.
    ///
    /// # Errors
    ///
    /// Returns a channel error if the channel is closed or the write
    /// fails.
    pub async fn dispatch(&self, cmd: &Command) -> Result<()> {
        if self.pending.lock().unwrap().closed {
            return Err(ContainerError::Channel("channel closed".into()));
        }
        let line = frame::to_line(cmd)?;
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&line)
            .await
            .map_err(|e| ContainerError::Channel(e.to_string()))
    }

    /// Writes a command and awaits the result carrying the same id.
    ///
    /// A channel that closes mid-wait resolves the call with an `error`
    /// result rather than hanging it.
    ///
    /// # Errors
    ///
    /// Returns a channel error if the command cannot be written.
    pub async fn dispatch_sync(&self, cmd: &Command) -> Result<JobResult> {
        let receiver = {
            let mut pending = self.pending.lock().unwrap();
            if pending.closed {
                return Ok(JobResult::error(cmd.id.clone(), "channel closed"));
            }
            let (sender, receiver) = oneshot::channel();
            pending.waiters.insert(cmd.id.clone(), sender);
            receiver
        };

        if let Err(e) = self.dispatch(cmd).await {
            self.pending.lock().unwrap().waiters.remove(&cmd.id);
            return Err(e);
        }

        match receiver.await {
            Ok(result) => Ok(result),
            Err(_) => Ok(JobResult::error(cmd.id.clone(), "channel closed")),
        }
    }

    /// Closes the channel: stops the reader, fails outstanding waits,
    /// shuts the stream down.
    pub async fn close(&self) {
        self.pending.lock().unwrap().drain();
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn echo_agent(guest: UnixStream) {
        let (read, mut write) = guest.into_split();
        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let cmd: Command = frame::from_line(&line).unwrap();
            let reply = JobResult::success(cmd.id, "\"pong\"");
            write.write_all(&frame::to_line(&reply).unwrap()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn dispatch_sync_pairs_result_with_command_id() {
        let (host, guest) = UnixStream::pair().unwrap();
        tokio::spawn(echo_agent(guest));

        let channel = Channel::new(host);
        channel.serve(|| {});

        let cmd = Command::new("core.ping", &json!({})).unwrap();
        let result = channel.dispatch_sync(&cmd).await.unwrap();
        assert_eq!(result.id, cmd.id);
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn closing_guest_end_fails_outstanding_waits() {
        let (host, guest) = UnixStream::pair().unwrap();
        let channel = Channel::new(host);
        channel.serve(|| {});

        let cmd = Command::new("core.ping", &json!({})).unwrap();
        let wait = channel.dispatch_sync(&cmd);
        drop(guest);

        let result = wait.await.unwrap();
        assert_eq!(result.state, core_proto::State::Error);
        assert_eq!(result.id, cmd.id);
    }

    #[tokio::test]
    async fn close_cancels_waits_and_rejects_new_dispatches() {
        let (host, _guest) = UnixStream::pair().unwrap();
        let channel = Arc::new(Channel::new(host));
        channel.serve(|| {});

        let cmd = Command::new("core.ping", &json!({})).unwrap();
        let pending = {
            let channel = Arc::clone(&channel);
            let cmd = cmd.clone();
            tokio::spawn(async move { channel.dispatch_sync(&cmd).await })
        };
        tokio::task::yield_now().await;

        channel.close().await;
        let result = pending.await.unwrap().unwrap();
        assert_eq!(result.state, core_proto::State::Error);

        assert!(channel.dispatch(&cmd).await.is_err());
    }

    #[tokio::test]
    async fn on_closed_fires_when_the_agent_goes_away() {
        let (host, guest) = UnixStream::pair().unwrap();
        let channel = Channel::new(host);
        let (tx, rx) = oneshot::channel();
        channel.serve(move || {
            let _ = tx.send(());
        });

        drop(guest);
        rx.await.unwrap();
    }
}
