//! Creation and dispatch arguments.

use std::collections::BTreeMap;
use std::path::PathBuf;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use core_proto::Command;

use crate::error::{ContainerError, Result};

/// Highest valid VLAN tag.
pub const VLAN_ID_MAX: i64 = 4094;

/// Network interface kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NicKind {
    /// The host-managed default bridge with a derived address.
    Default,
    /// A named Linux bridge.
    Bridge,
    /// An OVS VLAN bridge, ensured through the OVS helper container.
    Vlan,
    /// An OVS VXLAN bridge, ensured through the OVS helper container.
    Vxlan,
    /// A mesh overlay network joined from the host side.
    Zerotier,
    /// No isolation; only `/etc/resolv.conf` is shared.
    Host,
}

impl std::fmt::Display for NicKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Bridge => write!(f, "bridge"),
            Self::Vlan => write!(f, "vlan"),
            Self::Vxlan => write!(f, "vxlan"),
            Self::Zerotier => write!(f, "zerotier"),
            Self::Host => write!(f, "host"),
        }
    }
}

/// Address configuration for one NIC.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NicConfig {
    #[serde(default)]
    pub dhcp: bool,
    #[serde(default)]
    pub cidr: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub dns: Vec<String>,
}

/// One network interface of a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nic {
    #[serde(rename = "type")]
    pub kind: NicKind,
    /// Type-dependent payload: bridge name, VLAN tag, VXLAN id, or
    /// network identifier.
    #[serde(default)]
    pub id: String,
    /// Applied to the container-side peer before the namespace move.
    #[serde(default)]
    pub hwaddress: Option<String>,
    #[serde(default)]
    pub config: NicConfig,
}

impl Nic {
    /// Checks the parts of a NIC spec that are static.
    ///
    /// # Errors
    ///
    /// Returns a config error for VLAN tags outside `0..=4094`,
    /// unparseable VXLAN ids, missing bridge names, and CIDRs that do
    /// not parse.
    pub fn validate(&self) -> Result<()> {
        match self.kind {
            NicKind::Vlan => {
                let tag: i64 = self
                    .id
                    .parse()
                    .map_err(|_| ContainerError::Config(format!("invalid vlan id '{}'", self.id)))?;
                if !(0..=VLAN_ID_MAX).contains(&tag) {
                    return Err(ContainerError::Config("invalid vlan id (0-4094)".into()));
                }
            }
            NicKind::Vxlan => {
                self.id.parse::<i64>().map_err(|_| {
                    ContainerError::Config(format!("invalid vxlan id '{}'", self.id))
                })?;
            }
            NicKind::Bridge => {
                if self.id.is_empty() {
                    return Err(ContainerError::Config("bridge name is required".into()));
                }
            }
            NicKind::Default | NicKind::Zerotier | NicKind::Host => {}
        }

        if let Some(cidr) = &self.config.cidr {
            cidr.parse::<IpNetwork>()
                .map_err(|e| ContainerError::Config(format!("invalid cidr '{cidr}': {e}")))?;
        }

        Ok(())
    }
}

/// Immutable creation arguments of a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerCreateArguments {
    /// Read-only base rootfs: a directory or a btrfs snapshot source.
    pub root: PathBuf,
    /// Extra bind mounts, host path to guest path.
    #[serde(default)]
    pub mount: BTreeMap<String, String>,
    /// Share the host network namespace instead of isolating one.
    #[serde(default)]
    pub host_network: bool,
    #[serde(default)]
    pub nics: Vec<Nic>,
    /// TCP forwards, host port to container port on the default bridge IP.
    #[serde(default)]
    pub port: BTreeMap<u16, u16>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ContainerCreateArguments {
    /// Validates everything that can be rejected before touching the
    /// system.
    ///
    /// # Errors
    ///
    /// Returns a config error describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(ContainerError::Config("root is required".into()));
        }
        for nic in &self.nics {
            nic.validate()?;
        }
        Ok(())
    }
}

/// Arguments of `container.terminate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerTerminateArguments {
    pub container: u16,
}

/// Arguments of `container.dispatch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerDispatchArguments {
    pub container: u16,
    pub command: Command,
}

/// Arguments of `container.nic-add`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicAddArguments {
    pub container: u16,
    pub nic: Nic,
}

/// Arguments of `container.nic-remove`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicRemoveArguments {
    pub container: u16,
    pub index: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vlan(id: &str) -> Nic {
        Nic {
            kind: NicKind::Vlan,
            id: id.into(),
            hwaddress: None,
            config: NicConfig::default(),
        }
    }

    #[test]
    fn vlan_bounds() {
        assert!(vlan("0").validate().is_ok());
        assert!(vlan("4094").validate().is_ok());
        assert!(vlan("4095").validate().is_err());
        assert!(vlan("-1").validate().is_err());
        assert!(vlan("backbone").validate().is_err());
    }

    #[test]
    fn bad_cidr_is_a_config_error() {
        let mut nic = vlan("100");
        nic.config.cidr = Some("10.0.0.300/24".into());
        match nic.validate() {
            Err(ContainerError::Config(_)) => {}
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn nic_kind_uses_lowercase_on_the_wire() {
        let nic: Nic = serde_json::from_str(r#"{"type": "vxlan", "id": "42"}"#).unwrap();
        assert_eq!(nic.kind, NicKind::Vxlan);
        assert!(serde_json::from_str::<Nic>(r#"{"type": "wireless"}"#).is_err());
    }

    #[test]
    fn create_arguments_require_a_root() {
        let args = ContainerCreateArguments::default();
        assert!(args.validate().is_err());

        let args = ContainerCreateArguments {
            root: PathBuf::from("/var/images/base"),
            ..Default::default()
        };
        assert!(args.validate().is_ok());
    }
}
