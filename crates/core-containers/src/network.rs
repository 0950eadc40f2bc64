//! Network orchestration.
//!
//! Host-side plumbing happens before the child exists (`pre_start`),
//! in-namespace plumbing after its pid is known (`post_start`). A NIC
//! that fails during pre-start aborts the create and unwinds every NIC
//! wired before it; a NIC that fails during post-start is logged and
//! skipped so a partially-networked container still comes up.

use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, error, warn};

use core_net::{netns, NetlinkHandle, VethConfig};
use core_proto::{Command, JobResult};

use crate::args::{Nic, NicConfig, NicKind};
use crate::container::Container;
use crate::error::{ContainerError, Result};
use crate::process::SystemCommand;

/// Tag of the container owning Open vSwitch state for the host.
pub const OVS_TAG: &str = "ovs";
/// OVS master bridge for VLAN networks.
pub const OVS_BACKPLANE: &str = "backplane";
/// OVS master bridge for VXLAN networks.
pub const OVS_VX_BACKEND: &str = "vxbackend";

const DHCP_SCRIPT: &str = "/usr/share/udhcp/simple.script";

/// Host-side name of the veth for NIC `index` of container `id`.
pub(crate) fn link_name(id: u16, index: usize) -> String {
    format!("cont{id}-{index}")
}

/// Container-side peer of a veth, before its in-namespace rename.
pub(crate) fn peer_name(link: &str) -> String {
    format!("{link}p")
}

/// Stable id of one port-forwarding proxy.
pub(crate) fn forward_id(id: u16, host: u16, container: u16) -> String {
    format!("socat-{id}-{host}-{container}")
}

/// Stable id of the zerotier join command of container `id`.
pub(crate) fn zerotier_id(id: u16) -> String {
    format!("net-{id}")
}

/// The derived default-bridge address of container `id`.
///
/// The id is offset by one so no container ever computes the address of
/// the bridge itself.
#[must_use]
pub fn default_ip(bridge_ip: Ipv4Addr, id: u16) -> Ipv4Addr {
    let prefix = bridge_ip.octets();
    let base = u32::from(id) + 1;
    Ipv4Addr::new(
        prefix[0],
        prefix[1],
        ((base >> 8) & 0xff) as u8,
        (base & 0xff) as u8,
    )
}

impl Container {
    /// Host-side wiring for every NIC, before the child exists.
    ///
    /// # Errors
    ///
    /// Returns the first NIC error after unwinding all previously wired
    /// NICs of this container.
    pub(crate) async fn pre_start(&self) -> Result<()> {
        if self.arguments().host_network {
            // NICs are ignored; the container shares the host stack.
            return self.sandbox().bind_resolv_conf();
        }

        let nics = self.nic_snapshot();
        for (position, (index, nic)) in nics.iter().enumerate() {
            if let Err(e) = self.pre_nic(*index, nic).await {
                for (index, nic) in nics.iter().take(position).map(|(i, n)| (*i, n)) {
                    self.un_nic(index, nic).await;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    async fn pre_nic(&self, index: usize, nic: &Nic) -> Result<()> {
        match nic.kind {
            NicKind::Default => {
                let bridge = self.settings().bridge.clone();
                self.pre_bridge(index, &bridge, None).await
            }
            NicKind::Bridge => self.pre_bridge(index, &nic.id, None).await,
            NicKind::Vlan => self.pre_vlan(index, nic).await,
            NicKind::Vxlan => self.pre_vxlan(index, nic).await,
            NicKind::Zerotier => Ok(()),
            NicKind::Host => self.sandbox().bind_resolv_conf(),
        }
    }

    /// Creates the veth pair for one NIC and attaches its host side to
    /// `bridge` — directly for a Linux bridge, through the OVS helper
    /// otherwise.
    async fn pre_bridge(
        &self,
        index: usize,
        bridge: &str,
        ovs: Option<&Arc<Container>>,
    ) -> Result<()> {
        if !core_net::link_exists(bridge) {
            return Err(ContainerError::Network(format!(
                "bridge '{bridge}' not found"
            )));
        }
        if ovs.is_none() && !core_net::is_bridge(bridge) {
            return Err(ContainerError::Config(format!("'{bridge}' is not a bridge")));
        }

        let name = link_name(self.id(), index);
        let peer = peer_name(&name);

        let mut nl = NetlinkHandle::new().map_err(ContainerError::from)?;
        nl.create_veth(&VethConfig::new(&name, &peer))
            .map_err(|e| ContainerError::Network(format!("create veth pair: {e}")))?;

        match ovs {
            None => nl
                .set_link_master(&name, bridge)
                .map_err(|e| ContainerError::Network(format!("attach {name} to {bridge}: {e}"))),
            Some(ovs) => {
                let cmd = Command::new(
                    "ovs.port-add",
                    &json!({ "bridge": bridge, "port": name }),
                )?;
                let result = ovs.dispatch_sync(&cmd).await?;
                if !result.is_success() {
                    return Err(ContainerError::Network(format!(
                        "failed to attach veth to bridge: {}",
                        result.data
                    )));
                }
                Ok(())
            }
        }
    }

    async fn pre_vlan(&self, index: usize, nic: &Nic) -> Result<()> {
        let tag: i64 = nic
            .id
            .parse()
            .map_err(|_| ContainerError::Config(format!("invalid vlan id '{}'", nic.id)))?;

        let ovs = self.ovs_helper()?;
        let bridge = self
            .ensure_ovs_bridge(&ovs, "ovs.vlan-ensure", &json!({ "master": OVS_BACKPLANE, "vlan": tag }))
            .await?;
        debug!("vlan bridge name: {bridge}");
        self.pre_bridge(index, &bridge, Some(&ovs)).await
    }

    async fn pre_vxlan(&self, index: usize, nic: &Nic) -> Result<()> {
        let vxlan: i64 = nic
            .id
            .parse()
            .map_err(|_| ContainerError::Config(format!("invalid vxlan id '{}'", nic.id)))?;

        let ovs = self.ovs_helper()?;
        let bridge = self
            .ensure_ovs_bridge(
                &ovs,
                "ovs.vxlan-ensure",
                &json!({ "master": OVS_VX_BACKEND, "vxlan": vxlan }),
            )
            .await?;
        debug!("vxlan bridge name: {bridge}");
        self.pre_bridge(index, &bridge, Some(&ovs)).await
    }

    fn ovs_helper(&self) -> Result<Arc<Container>> {
        self.manager()?
            .get_one_with_tags(OVS_TAG)
            .ok_or_else(|| ContainerError::Config("ovs is needed for VLAN network type".into()))
    }

    /// Asks the OVS helper for the bridge backing a vlan/vxlan tag; the
    /// result payload is the bridge name as a JSON string.
    async fn ensure_ovs_bridge(
        &self,
        ovs: &Arc<Container>,
        command: &str,
        arguments: &serde_json::Value,
    ) -> Result<String> {
        let cmd = Command::new(command, arguments)?;
        let result = ovs.dispatch_sync(&cmd).await?;
        if !result.is_success() {
            return Err(ContainerError::Network(format!(
                "failed to ensure vlan bridge: {}",
                result.data
            )));
        }
        serde_json::from_str(&result.data).map_err(|e| {
            ContainerError::Network(format!("failed to load {command} result: {e}"))
        })
    }

    /// In-namespace wiring once the pid is known. Per-NIC failures are
    /// logged and do not abort.
    ///
    /// # Errors
    ///
    /// Returns an error only when the namespace itself cannot be
    /// published.
    pub(crate) async fn post_start(&self) -> Result<()> {
        if self.arguments().host_network {
            return Ok(());
        }

        netns::bind(&self.id().to_string(), self.pid()).map_err(ContainerError::from)?;

        for (index, nic) in self.nic_snapshot() {
            if let Err(e) = self.post_nic(index, &nic).await {
                error!(
                    "container {}: failed to initialize {} network {index}: {e}",
                    self.id(),
                    nic.kind
                );
            }
        }

        if let Err(e) = self.set_port_forwards().await {
            error!("container {}: port forwards: {e}", self.id());
        }
        Ok(())
    }

    async fn post_nic(&self, index: usize, nic: &Nic) -> Result<()> {
        match nic.kind {
            NicKind::Default => self.post_default(index, nic).await,
            NicKind::Bridge | NicKind::Vlan | NicKind::Vxlan => self.post_bridge(index, nic).await,
            NicKind::Zerotier => self.post_zerotier(&nic.id).await,
            NicKind::Host => Ok(()),
        }
    }

    fn default_nic(&self) -> Nic {
        let bridge_ip = self.settings().bridge_ip;
        Nic {
            kind: NicKind::Default,
            id: String::new(),
            hwaddress: None,
            config: NicConfig {
                dhcp: false,
                cidr: Some(format!("{}/16", default_ip(bridge_ip, self.id()))),
                gateway: Some(bridge_ip.to_string()),
                dns: vec![bridge_ip.to_string()],
            },
        }
    }

    async fn post_default(&self, index: usize, _nic: &Nic) -> Result<()> {
        let defnet = self.default_nic();
        self.post_bridge(index, &defnet).await
    }

    /// Joins the peer to the container and configures it: MAC, move,
    /// rename to `eth<index>`, then dhcp or a static address, the
    /// default route, and DNS.
    async fn post_bridge(&self, index: usize, nic: &Nic) -> Result<()> {
        let name = link_name(self.id(), index);
        let peer = peer_name(&name);

        {
            let mut nl = NetlinkHandle::new().map_err(ContainerError::from)?;
            if let Some(hwaddress) = &nic.hwaddress {
                match core_net::parse_mac(hwaddress) {
                    Ok(mac) => nl
                        .set_link_mac(&peer, mac)
                        .map_err(|e| ContainerError::Network(format!("set hw address: {e}")))?,
                    Err(e) => error!("parse hwaddr error: {e}"),
                }
            }
            nl.set_link_up(&peer)
                .map_err(|e| ContainerError::Network(format!("set peer up: {e}")))?;
            // The rename has to wait until after the move; renaming on
            // the host could collide with another container's peer.
            nl.set_link_netns_pid(&peer, self.pid())
                .map_err(|e| ContainerError::Network(format!("set ns pid: {e}")))?;
        }

        let dev = format!("eth{index}");
        self.ns_exec(["ip", "link", "set", peer.as_str(), "name", dev.as_str()])
            .await?;

        if nic.config.dhcp {
            let ns = self.id().to_string();
            self.pm()
                .spawn_system(SystemCommand::new(
                    "ip",
                    [
                        "netns",
                        "exec",
                        ns.as_str(),
                        "udhcpc",
                        "-q",
                        "-i",
                        dev.as_str(),
                        "-s",
                        DHCP_SCRIPT,
                    ],
                ))
                .await?;
        } else if let Some(cidr) = &nic.config.cidr {
            cidr.parse::<ipnetwork::IpNetwork>()
                .map_err(|e| ContainerError::Config(format!("invalid cidr '{cidr}': {e}")))?;
            self.ns_exec(["ip", "link", "set", "dev", dev.as_str(), "up"])
                .await?;
            self.ns_exec(["ip", "address", "add", cidr.as_str(), "dev", dev.as_str()])
                .await?;
        }

        if let Some(gateway) = &nic.config.gateway {
            self.ns_exec([
                "ip",
                "route",
                "add",
                "metric",
                "1000",
                "default",
                "via",
                gateway.as_str(),
                "dev",
                dev.as_str(),
            ])
            .await?;
        }

        for dns in &nic.config.dns {
            self.sandbox().append_dns(dns)?;
        }

        Ok(())
    }

    /// Joins the mesh overlay, once per container no matter how often
    /// post-start wiring runs.
    async fn post_zerotier(&self, network: &str) -> Result<()> {
        if self.zerotier_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let cmd = Command::with_id(
            zerotier_id(self.id()),
            "zerotier",
            &json!({ "netns": self.id(), "zerotier": network }),
        )?;
        self.pm()
            .run_command(cmd)
            .await
            .map_err(|e| ContainerError::Network(format!("zerotier join: {e}")))
    }

    /// Runs `ip netns exec <id> ip …` and demands success.
    async fn ns_exec<I>(&self, args: I) -> Result<JobResult>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let mut full = vec!["netns".to_string(), "exec".to_string(), self.id().to_string()];
        full.extend(args.into_iter().map(Into::into));

        let result = self.pm().run_system(SystemCommand::new("ip", full)).await?;
        if !result.is_success() {
            return Err(ContainerError::Network(format!(
                "ip exited with {}: {}",
                result.state,
                result.streams.stderr()
            )));
        }
        Ok(result)
    }

    pub(crate) async fn set_port_forwards(&self) -> Result<()> {
        let ip = default_ip(self.settings().bridge_ip, self.id());
        for (&host, &container) in &self.arguments().port {
            let cmd = SystemCommand::with_id(
                forward_id(self.id(), host, container),
                "socat",
                [
                    format!("tcp-listen:{host},reuseaddr,fork"),
                    format!("tcp-connect:{ip}:{container}"),
                ],
            )
            .no_output();
            self.pm().spawn_system(cmd).await?;
        }
        Ok(())
    }

    async fn un_port_forward(&self) {
        for (&host, &container) in &self.arguments().port {
            let id = forward_id(self.id(), host, container);
            if let Err(e) = self.pm().kill(&id).await {
                debug!("stopping forward {id}: {e}");
            }
        }
    }

    /// Removes one NIC's plumbing. Best-effort.
    pub(crate) async fn un_nic(&self, index: usize, nic: &Nic) {
        match nic.kind {
            NicKind::Vlan | NicKind::Vxlan => {
                let ovs = self
                    .manager()
                    .ok()
                    .and_then(|mgr| mgr.get_one_with_tags(OVS_TAG));
                self.un_bridge(index, ovs).await;
            }
            NicKind::Zerotier => {
                let id = zerotier_id(self.id());
                if let Err(e) = self.pm().kill(&id).await {
                    debug!("stopping {id}: {e}");
                }
            }
            NicKind::Default => {
                self.un_bridge(index, None).await;
                self.un_port_forward().await;
            }
            NicKind::Bridge => self.un_bridge(index, None).await,
            NicKind::Host => {}
        }
    }

    async fn un_bridge(&self, index: usize, ovs: Option<Arc<Container>>) {
        let name = link_name(self.id(), index);
        match ovs {
            Some(ovs) => {
                let cmd = match Command::new("ovs.port-del", &json!({ "port": name })) {
                    Ok(cmd) => cmd,
                    Err(e) => {
                        error!("failed to build port-del for {name}: {e}");
                        return;
                    }
                };
                if let Err(e) = ovs.dispatch_sync(&cmd).await {
                    error!("failed to delete port {name}: {e}");
                }
            }
            None => match NetlinkHandle::new() {
                Ok(mut nl) => {
                    if let Err(e) = nl.delete_link(&name) {
                        debug!("delete link {name}: {e}");
                    }
                }
                Err(e) => error!("netlink: {e}"),
            },
        }
    }

    /// Tears down every NIC and the namespace file. Idempotent and
    /// best-effort: each step runs regardless of earlier failures.
    pub(crate) async fn destroy_network(&self) {
        debug!("destroying networking for container {}", self.id());
        if self.arguments().host_network {
            return;
        }

        for (index, nic) in self.nic_snapshot() {
            self.un_nic(index, &nic).await;
        }

        if self.pid() > 0 {
            if let Err(e) = netns::unbind(&self.id().to_string()) {
                error!("failed to remove netns of container {}: {e}", self.id());
            }
        }
    }

    /// Wires one additional NIC into a running container.
    ///
    /// # Errors
    ///
    /// Propagates wiring errors so the operator can see what to repair.
    pub(crate) async fn add_nic(&self, nic: Nic) -> Result<usize> {
        nic.validate()?;
        if self.arguments().host_network {
            return Err(ContainerError::Config(
                "cannot add a nic to a host-network container".into(),
            ));
        }
        if self.state() != crate::container::ContainerState::Running {
            return Err(ContainerError::Config("container is not running".into()));
        }

        let index = {
            let mut nics = self.nics.lock().unwrap();
            nics.push(crate::container::NicSlot {
                nic: nic.clone(),
                active: true,
            });
            nics.len() - 1
        };

        if let Err(e) = self.pre_nic(index, &nic).await {
            self.nics.lock().unwrap()[index].active = false;
            return Err(e);
        }
        if let Err(e) = self.post_nic(index, &nic).await {
            warn!(
                "container {}: nic {index} wired on the host but not configured: {e}",
                self.id()
            );
            return Err(e);
        }
        Ok(index)
    }

    /// Unwires one NIC of a running container.
    ///
    /// # Errors
    ///
    /// Returns a config error for unknown or already-removed indices.
    pub(crate) async fn remove_nic(&self, index: usize) -> Result<()> {
        let nic = {
            let nics = self.nics.lock().unwrap();
            match nics.get(index) {
                Some(slot) if slot.active => slot.nic.clone(),
                _ => {
                    return Err(ContainerError::Config(format!(
                        "container {} has no nic {index}",
                        self.id()
                    )))
                }
            }
        };

        self.un_nic(index, &nic).await;
        self.nics.lock().unwrap()[index].active = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_embed_the_container_id() {
        assert_eq!(link_name(1, 0), "cont1-0");
        assert_eq!(peer_name(&link_name(1, 0)), "cont1-0p");
        assert_eq!(forward_id(1, 8080, 80), "socat-1-8080-80");
        assert_eq!(zerotier_id(7), "net-7");
    }

    #[test]
    fn names_of_distinct_containers_never_collide() {
        for id in [1u16, 2, 3, 10, 300] {
            for other in [4u16, 5, 600] {
                assert_ne!(link_name(id, 0), link_name(other, 0));
            }
        }
    }

    #[test]
    fn default_ip_law() {
        let bridge = Ipv4Addr::new(172, 18, 0, 1);
        assert_eq!(default_ip(bridge, 1), Ipv4Addr::new(172, 18, 0, 2));
        assert_eq!(default_ip(bridge, 254), Ipv4Addr::new(172, 18, 0, 255));
        assert_eq!(default_ip(bridge, 255), Ipv4Addr::new(172, 18, 1, 0));
        assert_eq!(default_ip(bridge, 1000), Ipv4Addr::new(172, 18, 3, 233));
    }

    #[test]
    fn default_ip_is_never_the_bridge_address() {
        let bridge = Ipv4Addr::new(172, 18, 0, 1);
        for id in 1..=2048u16 {
            assert_ne!(default_ip(bridge, id), bridge);
        }
    }

    #[test]
    fn consecutive_ids_get_consecutive_addresses() {
        let bridge = Ipv4Addr::new(172, 18, 0, 1);
        let a = u32::from_be_bytes(default_ip(bridge, 1).octets());
        let b = u32::from_be_bytes(default_ip(bridge, 2).octets());
        let c = u32::from_be_bytes(default_ip(bridge, 3).octets());
        assert_eq!(b - a, 1);
        assert_eq!(c - b, 1);
    }
}
