//! First-boot setup inside the fresh namespaces.
//!
//! Loopback first (warnings only — host-network containers have a
//! configured `lo` already), then the pseudo-filesystems, then the
//! hostname. Filesystem and hostname failures abort the boot and reach
//! the host through the exit status.

use std::fs;

use anyhow::{Context, Result};
use nix::mount::{mount, MsFlags};
use tracing::{debug, warn};

use core_net::NetlinkHandle;

/// Runs the whole bootstrap sequence.
///
/// # Errors
///
/// Returns an error when a mount or the hostname update fails.
pub fn bootstrap(hostname: &str) -> Result<()> {
    debug!("setting up lo device");
    setup_lo();

    debug!("setting up mounts");
    setup_fs()?;

    debug!("setting up hostname");
    update_hostname(hostname)
}

fn setup_lo() {
    let mut nl = match NetlinkHandle::new() {
        Ok(nl) => nl,
        Err(e) => {
            warn!("failed to open netlink for lo setup: {e}");
            return;
        }
    };

    for addr in ["127.0.0.1/8", "::1/128"] {
        let network = addr.parse().expect("static address");
        if let Err(e) = nl.add_address("lo", network) {
            warn!("failed to set up lo address {addr}: {e}");
        }
    }
    if let Err(e) = nl.set_link_up("lo") {
        warn!("failed to bring lo interface up: {e}");
    }
}

fn setup_fs() -> Result<()> {
    fs::create_dir_all("/etc")?;
    fs::create_dir_all("/var/run")?;

    fs::create_dir_all("/proc")?;
    mount_fs("none", "/proc", "proc")?;

    fs::create_dir_all("/dev")?;
    mount_fs("none", "/dev", "devtmpfs")?;

    fs::create_dir_all("/dev/pts")?;
    mount_fs("none", "/dev/pts", "devpts")?;

    Ok(())
}

fn mount_fs(source: &str, target: &str, fstype: &str) -> Result<()> {
    mount(
        Some(source),
        target,
        Some(fstype),
        MsFlags::empty(),
        None::<&str>,
    )
    .with_context(|| format!("mounting {fstype} at {target}"))
}

fn update_hostname(hostname: &str) -> Result<()> {
    fs::write("/etc/hostname", hostname).context("writing /etc/hostname")?;
    fs::write("/etc/hosts", hosts_content(hostname)).context("writing /etc/hosts")?;
    nix::unistd::sethostname(hostname).context("sethostname")?;
    Ok(())
}

fn hosts_content(hostname: &str) -> String {
    format!(
        "127.0.0.1    {hostname}.local {hostname}\n\
         127.0.0.1    localhost.localdomain localhost\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosts_file_maps_local_names_to_loopback() {
        let content = hosts_content("t1");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("127.0.0.1"));
        assert!(lines[0].contains("t1.local t1"));
        assert!(lines[1].contains("localhost"));
    }
}
