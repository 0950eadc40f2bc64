//! coreX — the inner container agent.
//!
//! Spawned by the host as the first process of a fresh set of
//! namespaces, with the command channel on fd 3. Bootstraps the rootfs,
//! then answers line-delimited commands until the channel closes.

use std::os::unix::io::FromRawFd;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod bootstrap;
mod channel;

/// The fd the host leaves the channel socketpair on.
const CHANNEL_FD: i32 = 3;

struct AgentArgs {
    hostname: String,
    unprivileged: bool,
}

/// The launch contract uses single-dash flags.
fn parse_args() -> AgentArgs {
    let mut args = AgentArgs {
        hostname: String::new(),
        unprivileged: false,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-hostname" => args.hostname = iter.next().unwrap_or_default(),
            "-unprivileged" => args.unprivileged = true,
            other => eprintln!("ignoring unknown argument '{other}'"),
        }
    }
    args
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "corex=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = parse_args();
    info!(hostname = %args.hostname, "coreX starting");

    bootstrap::bootstrap(&args.hostname)?;

    if args.unprivileged {
        drop_privileges()?;
    }

    // The channel socketpair is inherited on a fixed fd.
    let stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(CHANNEL_FD) };
    stream
        .set_nonblocking(true)
        .context("channel fd is not usable")?;
    let stream =
        tokio::net::UnixStream::from_std(stream).context("registering channel with the runtime")?;

    if let Err(e) = channel::serve(stream).await {
        error!("channel: {e}");
        return Err(e);
    }

    info!("host channel closed, shutting down");
    Ok(())
}

fn drop_privileges() -> Result<()> {
    // Lock the process out of regaining privileges through exec.
    let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error()).context("PR_SET_NO_NEW_PRIVS");
    }
    Ok(())
}
