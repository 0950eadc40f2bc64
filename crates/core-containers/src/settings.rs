//! Host-level settings for the containers subsystem.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Where container roots live and how the default network is addressed.
///
/// Loaded from the host configuration; every value has a usable default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    /// Parent of every container root; `root(id)` is `<root_dir>/<id>`.
    pub root_dir: PathBuf,
    /// Parent of the writable per-container backends.
    pub backend_dir: PathBuf,
    /// Host IPC socket bound into each container at `/redis.socket`.
    pub socket_path: PathBuf,
    /// Inner-agent binary, resolved against `PATH` when not absolute.
    pub agent_binary: String,
    /// Name of the default bridge.
    pub bridge: String,
    /// Address of the default bridge; the first two octets are the
    /// prefix of every derived container address.
    pub bridge_ip: Ipv4Addr,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/var/cache/containers"),
            backend_dir: PathBuf::from("/var/cache/containers/backend"),
            socket_path: PathBuf::from("/var/run/core0.sock"),
            agent_binary: "coreX".into(),
            bridge: "core0".into(),
            bridge_ip: Ipv4Addr::new(172, 18, 0, 1),
        }
    }
}

impl ContainerSettings {
    /// `root(id)`: the overlay target used as the container's chroot.
    #[must_use]
    pub fn root(&self, id: u16) -> PathBuf {
        self.root_dir.join(id.to_string())
    }
}
