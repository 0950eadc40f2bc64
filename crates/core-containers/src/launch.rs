//! The container launch strategy.
//!
//! Spawns the inner agent with fresh mount/UTS/IPC/PID namespaces (plus
//! a network namespace unless the container shares the host's), chrooted
//! into the prepared root, with one end of an `AF_UNIX` socketpair left
//! open as fd 3 for the command channel.

use std::io;
use std::os::fd::AsRawFd;
use std::process::Stdio;

use async_trait::async_trait;
use nix::sched::CloneFlags;
use nix::sys::signal::{kill, Signal};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd::Pid;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{ContainerError, Result};
use crate::process::{ContainerProcess, Runner, RunnerEvent};

/// The fd number the child finds its channel on.
pub const CHANNEL_FD: i32 = 3;

/// Spawns the inner agent per the [`ContainerProcess`] contract.
///
/// The returned receiver yields `Started` once the child exists and
/// `Exited` once it is gone, in that order, each at most once.
///
/// # Errors
///
/// Returns a launch error when the socketpair or the spawn itself
/// fails.
pub async fn spawn(
    spec: ContainerProcess,
) -> Result<(Box<dyn Runner>, mpsc::Receiver<RunnerEvent>)> {
    let (host_fd, child_fd) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .map_err(|e| ContainerError::Launch(format!("socketpair: {e}")))?;

    let mut command = tokio::process::Command::new(&spec.binary);
    command
        .args(&spec.args)
        .env_clear()
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let chroot = spec.chroot.clone();
    let dir = spec.dir.clone();
    let child_raw = child_fd.as_raw_fd();
    let mut flags = CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWPID;
    if !spec.host_network {
        flags |= CloneFlags::CLONE_NEWNET;
    }

    unsafe {
        command.pre_exec(move || {
            // dup2 clears close-on-exec on the duplicate.
            if libc::dup2(child_raw, CHANNEL_FD) < 0 {
                return Err(io::Error::last_os_error());
            }
            nix::sched::unshare(flags).map_err(errno_to_io)?;
            nix::unistd::chroot(&chroot).map_err(errno_to_io)?;
            nix::unistd::chdir(&dir).map_err(errno_to_io)?;
            Ok(())
        });
    }

    let mut child = command
        .spawn()
        .map_err(|e| ContainerError::Launch(format!("spawn {}: {e}", spec.binary)))?;
    drop(child_fd);

    let pid = child
        .id()
        .ok_or_else(|| ContainerError::Launch("child has no pid".into()))?;

    let host: std::os::unix::net::UnixStream = host_fd.into();
    host.set_nonblocking(true)
        .map_err(|e| ContainerError::Launch(format!("channel: {e}")))?;
    let channel = tokio::net::UnixStream::from_std(host)
        .map_err(|e| ContainerError::Launch(format!("channel: {e}")))?;

    let (events, receiver) = mpsc::channel(2);
    tokio::spawn(async move {
        if events
            .send(RunnerEvent::Started { pid, channel })
            .await
            .is_err()
        {
            return;
        }
        let ok = match child.wait().await {
            Ok(status) => status.success(),
            Err(e) => {
                warn!("waiting for container child {pid}: {e}");
                false
            }
        };
        let _ = events.send(RunnerEvent::Exited { ok }).await;
    });

    Ok((
        Box::new(ProcessRunner {
            id: spec.id,
            pid: pid as i32,
        }),
        receiver,
    ))
}

fn errno_to_io(errno: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

struct ProcessRunner {
    id: String,
    pid: i32,
}

#[async_trait]
impl Runner for ProcessRunner {
    fn id(&self) -> &str {
        &self.id
    }

    async fn terminate(&self) {
        if let Err(e) = kill(Pid::from_raw(self.pid), Signal::SIGTERM) {
            // Already gone is fine.
            if e != nix::errno::Errno::ESRCH {
                warn!("terminating pid {}: {e}", self.pid);
            }
        }
    }
}
