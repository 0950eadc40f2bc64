//! Filesystem sandbox.
//!
//! Assembles a container root: a read-only base rootfs overlaid with a
//! writable backend, plus the bind mounts the inner agent needs. Every
//! mount is recorded so teardown can unwind in reverse order.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use tracing::{debug, error, warn};

use crate::args::ContainerCreateArguments;
use crate::error::{ContainerError, Result};
use crate::process::{ProcessManager, SystemCommand};
use crate::settings::ContainerSettings;

/// Guest path of the host IPC socket.
pub const IPC_SOCKET_GUEST_PATH: &str = "redis.socket";

/// Guest path of the inner-agent binary.
pub const AGENT_GUEST_PATH: &str = "coreX";

/// Devices bound from the host `/dev` into the container.
const DEVICES_TO_BIND: &[&str] = &["random", "urandom", "null"];

/// The writable-over-readonly root of one container.
pub struct Sandbox {
    id: u16,
    settings: Arc<ContainerSettings>,
    /// Mounted targets, in mount order.
    mounts: Mutex<Vec<PathBuf>>,
}

impl Sandbox {
    pub(crate) fn new(id: u16, settings: Arc<ContainerSettings>) -> Self {
        Self {
            id,
            settings,
            mounts: Mutex::new(Vec::new()),
        }
    }

    /// The overlay target used as the container's chroot.
    #[must_use]
    pub fn root(&self) -> PathBuf {
        self.settings.root(self.id)
    }

    fn name(&self) -> String {
        format!("container-{}", self.id)
    }

    fn backend(&self) -> PathBuf {
        self.settings.backend_dir.join(self.name())
    }

    fn workdir(&self) -> PathBuf {
        self.settings.backend_dir.join(format!("{}-work", self.name()))
    }

    /// Builds the container root.
    ///
    /// Any error tears down whatever was already prepared before
    /// returning.
    ///
    /// # Errors
    ///
    /// Returns a sandbox error when the backend, the overlay, or any
    /// bind mount cannot be created.
    pub async fn prepare(
        &self,
        pm: &dyn ProcessManager,
        args: &ContainerCreateArguments,
    ) -> Result<()> {
        if let Err(e) = self.try_prepare(pm, args).await {
            self.teardown(pm).await;
            return Err(e);
        }
        Ok(())
    }

    async fn try_prepare(
        &self,
        pm: &dyn ProcessManager,
        args: &ContainerCreateArguments,
    ) -> Result<()> {
        let root = self.root();
        let backend = self.backend();

        if fs_type(&self.settings.backend_dir) == Some("btrfs".into()) {
            let backend_path = backend.display().to_string();
            let result = pm
                .run_system(SystemCommand::new(
                    "btrfs",
                    ["subvolume", "create", backend_path.as_str()],
                ))
                .await?;
            if !result.is_success() {
                return Err(ContainerError::Sandbox(format!(
                    "btrfs subvolume create: {}",
                    result.streams.stderr()
                )));
            }
        } else {
            fs::create_dir_all(&backend)?;
        }
        fs::create_dir_all(self.workdir())?;
        fs::create_dir_all(&root)?;

        let options = format!(
            "lowerdir={},upperdir={},workdir={}",
            args.root.display(),
            backend.display(),
            self.workdir().display()
        );
        mount(
            Some("overlay"),
            &root,
            Some("overlay"),
            MsFlags::empty(),
            Some(options.as_str()),
        )
        .map_err(|e| ContainerError::Sandbox(format!("overlay mount on {}: {e}", root.display())))?;
        self.record(&root);

        // The inner agent and the DNS steps both expect /etc to exist.
        fs::create_dir_all(root.join("etc"))?;
        touch(&root.join("etc/resolv.conf"))?;

        for (source, guest) in &args.mount {
            let target = self.guest_path(guest);
            let source = Path::new(source);
            if source.is_dir() {
                fs::create_dir_all(&target)?;
            } else {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                touch(&target)?;
            }
            self.bind(source, &target)?;
        }

        fs::create_dir_all(root.join("dev"))?;
        for device in DEVICES_TO_BIND {
            let target = root.join("dev").join(device);
            touch(&target)?;
            self.bind(&Path::new("/dev").join(device), &target)?;
        }

        let socket_target = root.join(IPC_SOCKET_GUEST_PATH);
        touch(&socket_target)?;
        self.bind(&self.settings.socket_path, &socket_target)?;

        let agent_source = lookup(&self.settings.agent_binary).ok_or_else(|| {
            ContainerError::Sandbox(format!(
                "agent binary '{}' not found",
                self.settings.agent_binary
            ))
        })?;
        let agent_target = root.join(AGENT_GUEST_PATH);
        touch(&agent_target)?;
        self.bind(&agent_source, &agent_target)?;

        Ok(())
    }

    /// Unwinds every mount in reverse order, then removes the backend
    /// and the root. Always attempts every step.
    pub async fn teardown(&self, pm: &dyn ProcessManager) {
        let mounts: Vec<PathBuf> = {
            let mut guard = self.mounts.lock().unwrap();
            guard.drain(..).rev().collect()
        };
        for target in mounts {
            if let Err(e) = umount2(&target, MntFlags::MNT_DETACH) {
                error!("failed to unmount {}: {e}", target.display());
            }
        }

        let backend = self.backend();
        if fs_type(&self.settings.backend_dir) == Some("btrfs".into()) {
            let backend_path = backend.display().to_string();
            match pm
                .run_system(SystemCommand::new(
                    "btrfs",
                    ["subvolume", "delete", backend_path.as_str()],
                ))
                .await
            {
                Ok(result) if !result.is_success() => {
                    error!("btrfs subvolume delete: {}", result.streams.stderr());
                }
                Err(e) => error!("btrfs subvolume delete: {e}"),
                Ok(_) => {}
            }
        } else if let Err(e) = fs::remove_dir_all(&backend) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove backend {}: {e}", backend.display());
            }
        }

        for dir in [self.workdir(), self.root()] {
            if let Err(e) = fs::remove_dir_all(&dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove {}: {e}", dir.display());
                }
            }
        }
    }

    /// Read-only bind of the host `/etc/resolv.conf` into the root.
    ///
    /// The only filesystem wiring a host-network container needs.
    ///
    /// # Errors
    ///
    /// Returns a sandbox error if the bind mount fails.
    pub fn bind_resolv_conf(&self) -> Result<()> {
        let target = self.root().join("etc/resolv.conf");
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let _ = fs::remove_file(&target);
        touch(&target)?;
        self.bind(Path::new("/etc/resolv.conf"), &target)
    }

    /// Appends one `nameserver` line to the container's resolv.conf.
    ///
    /// Only the creating task writes here before the container runs.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or written.
    pub fn append_dns(&self, dns: &str) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root().join("etc/resolv.conf"))?;
        writeln!(file, "nameserver {dns}")?;
        Ok(())
    }

    fn guest_path(&self, guest: &str) -> PathBuf {
        self.root().join(guest.trim_start_matches('/'))
    }

    fn bind(&self, source: &Path, target: &Path) -> Result<()> {
        mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| {
            ContainerError::Sandbox(format!(
                "bind {} -> {}: {e}",
                source.display(),
                target.display()
            ))
        })?;
        self.record(target);
        Ok(())
    }

    fn record(&self, target: &Path) {
        debug!("sandbox {}: mounted {}", self.id, target.display());
        self.mounts.lock().unwrap().push(target.to_path_buf());
    }
}

fn touch(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::File::create(path)?;
    }
    Ok(())
}

/// Resolves a binary name against `PATH`; absolute paths pass through.
fn lookup(binary: &str) -> Option<PathBuf> {
    let candidate = Path::new(binary);
    if candidate.is_absolute() {
        return candidate.exists().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|p| p.exists())
}

/// Filesystem type of the mount holding `path`, per `/proc/mounts`.
fn fs_type(path: &Path) -> Option<String> {
    let mounts = fs::read_to_string("/proc/mounts").ok()?;
    fs_type_in(&mounts, path)
}

fn fs_type_in(mounts: &str, path: &Path) -> Option<String> {
    let mut best: Option<(usize, &str)> = None;
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let (Some(_), Some(point), Some(fstype)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if path.starts_with(point) {
            let depth = point.len();
            if best.map_or(true, |(d, _)| depth >= d) {
                best = Some((depth, fstype));
            }
        }
    }
    best.map(|(_, fstype)| fstype.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTS: &str = "\
/dev/sda1 / ext4 rw,relatime 0 0
/dev/sdb1 /var/cache btrfs rw,noatime 0 0
proc /proc proc rw 0 0
";

    #[test]
    fn fs_type_picks_the_longest_mount_point() {
        assert_eq!(
            fs_type_in(MOUNTS, Path::new("/var/cache/containers/backend")),
            Some("btrfs".into())
        );
        assert_eq!(fs_type_in(MOUNTS, Path::new("/home")), Some("ext4".into()));
    }

    #[test]
    fn guest_paths_stay_inside_the_root() {
        let settings = Arc::new(ContainerSettings {
            root_dir: PathBuf::from("/var/cache/containers"),
            ..Default::default()
        });
        let sandbox = Sandbox::new(4, settings);
        assert_eq!(
            sandbox.guest_path("/opt/data"),
            PathBuf::from("/var/cache/containers/4/opt/data")
        );
        assert_eq!(sandbox.root(), PathBuf::from("/var/cache/containers/4"));
    }

    #[test]
    fn backends_of_distinct_ids_are_distinct() {
        let settings = Arc::new(ContainerSettings::default());
        let a = Sandbox::new(1, settings.clone());
        let b = Sandbox::new(2, settings);
        assert_ne!(a.backend(), b.backend());
        assert_ne!(a.root(), b.root());
    }

    #[test]
    fn lookup_resolves_absolute_paths_directly() {
        assert_eq!(lookup("/bin/sh"), Some(PathBuf::from("/bin/sh")));
        assert_eq!(lookup("/no/such/binary"), None);
    }
}
