//! The container table.
//!
//! Owns every live container, allocates ids, and synchronizes lookups.
//! The table lock is only ever held for allocation, insertion, lookup
//! and removal — never across mounts, netlink calls, or subprocess
//! waits.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use core_net::{netns, NetlinkHandle};
use core_proto::{Command, JobResult, Route};

use crate::args::{ContainerCreateArguments, Nic};
use crate::container::{Container, ContainerSummary};
use crate::error::{ContainerError, Result};
use crate::process::ProcessManager;
use crate::settings::ContainerSettings;

/// Allocator for container ids: the lowest free value ≥ 1.
struct IdPool {
    words: Vec<u64>,
}

impl IdPool {
    fn new() -> Self {
        let mut words = vec![0u64; 1024];
        // Id 0 is never handed out.
        words[0] = 1;
        Self { words }
    }

    fn acquire(&mut self) -> Option<u16> {
        for (index, word) in self.words.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = word.trailing_ones();
                *word |= 1 << bit;
                return Some((index as u32 * 64 + bit) as u16);
            }
        }
        None
    }

    fn release(&mut self, id: u16) {
        self.words[usize::from(id) / 64] &= !(1 << (u32::from(id) % 64));
    }
}

/// The live container table of this host.
pub struct ContainerManager {
    pm: Arc<dyn ProcessManager>,
    settings: Arc<ContainerSettings>,
    containers: Mutex<HashMap<u16, Arc<Container>>>,
    ids: Mutex<IdPool>,
}

impl ContainerManager {
    #[must_use]
    pub fn new(pm: Arc<dyn ProcessManager>, settings: ContainerSettings) -> Arc<Self> {
        Arc::new(Self {
            pm,
            settings: Arc::new(settings),
            containers: Mutex::new(HashMap::new()),
            ids: Mutex::new(IdPool::new()),
        })
    }

    /// Creates and starts a container, returning its id.
    ///
    /// The call returns once the inner agent is launched; in-namespace
    /// network configuration continues asynchronously. Any failure up
    /// to the launch unwinds completely and frees the id.
    ///
    /// # Errors
    ///
    /// Returns config errors for invalid arguments and sandbox, network
    /// or launch errors from the pipeline.
    pub async fn create(
        self: &Arc<Self>,
        args: ContainerCreateArguments,
        route: Option<Route>,
    ) -> Result<u16> {
        args.validate()?;

        let id = {
            let mut ids = self.ids.lock().unwrap();
            ids.acquire()
                .ok_or_else(|| ContainerError::Internal("out of container ids".into()))?
        };

        let container = Arc::new(Container::new(
            id,
            args,
            route,
            Arc::downgrade(self),
            Arc::clone(&self.pm),
            Arc::clone(&self.settings),
        ));
        self.containers
            .lock()
            .unwrap()
            .insert(id, Arc::clone(&container));

        match container.start().await {
            Ok(()) => {
                info!("container {id} started");
                Ok(id)
            }
            Err(e) => {
                self.forget(id);
                Err(e)
            }
        }
    }

    /// Terminates a container and waits for it to be fully unwound.
    ///
    /// Idempotent: terminating an id that is not live succeeds.
    ///
    /// # Errors
    ///
    /// Propagates state-tracking failures from the container.
    pub async fn terminate(&self, id: u16) -> Result<()> {
        let container = self.get(id);
        match container {
            Some(container) => container.terminate().await,
            None => Ok(()),
        }
    }

    /// Snapshot of the live containers.
    #[must_use]
    pub fn list(&self) -> BTreeMap<u16, ContainerSummary> {
        self.containers
            .lock()
            .unwrap()
            .iter()
            .map(|(&id, container)| (id, container.summary()))
            .collect()
    }

    #[must_use]
    pub fn get(&self, id: u16) -> Option<Arc<Container>> {
        self.containers.lock().unwrap().get(&id).cloned()
    }

    /// First live container carrying `tag`; used to locate the OVS
    /// helper.
    #[must_use]
    pub fn get_one_with_tags(&self, tag: &str) -> Option<Arc<Container>> {
        self.containers
            .lock()
            .unwrap()
            .values()
            .find(|container| container.tags().iter().any(|t| t == tag))
            .cloned()
    }

    /// Serializes a command over the target container's channel and
    /// awaits the reply with the same id.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for dead ids and channel errors from the
    /// dispatch itself.
    pub async fn dispatch_sync(&self, id: u16, cmd: Command) -> Result<JobResult> {
        let container = self.get(id).ok_or(ContainerError::NotFound(id))?;
        container.dispatch_sync(&cmd).await
    }

    /// Wires an additional NIC into a running container, returning its
    /// index.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for dead ids and wiring errors from the
    /// orchestrator.
    pub async fn nic_add(&self, id: u16, nic: Nic) -> Result<usize> {
        let container = self.get(id).ok_or(ContainerError::NotFound(id))?;
        container.add_nic(nic).await
    }

    /// Unwires one NIC of a running container.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for dead ids and a config error for unknown
    /// indices.
    pub async fn nic_remove(&self, id: u16, index: usize) -> Result<()> {
        let container = self.get(id).ok_or(ContainerError::NotFound(id))?;
        container.remove_nic(index).await
    }

    /// Drops a container's row and frees its id. Safe to call more
    /// than once.
    pub(crate) fn forget(&self, id: u16) {
        let removed = self.containers.lock().unwrap().remove(&id);
        if removed.is_some() {
            self.ids.lock().unwrap().release(id);
        }
    }

    /// Removes netns files and veths left behind by a previous run.
    ///
    /// Container state is in-memory only, so after a restart anything
    /// matching our name patterns that is not live is garbage.
    pub async fn prune_leftovers(&self) {
        for name in netns::list() {
            let live = name
                .parse::<u16>()
                .map(|id| self.containers.lock().unwrap().contains_key(&id))
                .unwrap_or(false);
            if !live {
                if let Err(e) = netns::unbind(&name) {
                    warn!("pruning netns {name}: {e}");
                } else {
                    info!("pruned leftover netns {name}");
                }
            }
        }

        let Ok(entries) = std::fs::read_dir("/sys/class/net") else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(id) = leftover_link_id(&name) else {
                continue;
            };
            if self.containers.lock().unwrap().contains_key(&id) {
                continue;
            }
            match NetlinkHandle::new() {
                Ok(mut nl) => {
                    if nl.delete_link(&name).is_ok() {
                        info!("pruned leftover link {name}");
                    }
                }
                Err(e) => {
                    warn!("netlink: {e}");
                    return;
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn insert_stub(self: &Arc<Self>, args: ContainerCreateArguments) -> Arc<Container> {
        let id = self.ids.lock().unwrap().acquire().unwrap();
        let container = Arc::new(Container::new(
            id,
            args,
            None,
            Arc::downgrade(self),
            Arc::clone(&self.pm),
            Arc::clone(&self.settings),
        ));
        self.containers
            .lock()
            .unwrap()
            .insert(id, Arc::clone(&container));
        container
    }
}

/// Extracts the container id out of a `cont<id>-<idx>[p]` link name.
fn leftover_link_id(name: &str) -> Option<u16> {
    let rest = name.strip_prefix("cont")?;
    let (id, suffix) = rest.split_once('-')?;
    let suffix = suffix.strip_suffix('p').unwrap_or(suffix);
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    id.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::{Nic, NicConfig, NicKind};
    use crate::testing::MockProcessManager;

    fn test_settings(base: &std::path::Path) -> ContainerSettings {
        ContainerSettings {
            root_dir: base.join("roots"),
            backend_dir: base.join("backend"),
            socket_path: base.join("core0.sock"),
            agent_binary: "/bin/sh".into(),
            ..Default::default()
        }
    }

    fn nic(kind: NicKind, id: &str) -> Nic {
        Nic {
            kind,
            id: id.into(),
            hwaddress: None,
            config: NicConfig::default(),
        }
    }

    #[test]
    fn id_pool_hands_out_lowest_free_from_one() {
        let mut pool = IdPool::new();
        assert_eq!(pool.acquire(), Some(1));
        assert_eq!(pool.acquire(), Some(2));
        assert_eq!(pool.acquire(), Some(3));

        pool.release(2);
        assert_eq!(pool.acquire(), Some(2));
        assert_eq!(pool.acquire(), Some(4));
    }

    #[test]
    fn id_pool_never_hands_out_zero() {
        let mut pool = IdPool::new();
        for _ in 0..200 {
            let id = pool.acquire().unwrap();
            assert_ne!(id, 0);
            pool.release(id);
            // Released immediately, so the lowest free is stable.
            assert_eq!(pool.acquire(), Some(id));
        }
    }

    #[test]
    fn leftover_link_names() {
        assert_eq!(leftover_link_id("cont7-0"), Some(7));
        assert_eq!(leftover_link_id("cont7-0p"), Some(7));
        assert_eq!(leftover_link_id("cont300-12"), Some(300));
        assert_eq!(leftover_link_id("eth0"), None);
        assert_eq!(leftover_link_id("container-1"), None);
        assert_eq!(leftover_link_id("cont7"), None);
        assert_eq!(leftover_link_id("cont7-"), None);
        assert_eq!(leftover_link_id("cont7-x"), None);
    }

    #[tokio::test]
    async fn concurrent_ids_are_distinct_and_sequential() {
        let pm = MockProcessManager::new();
        let mgr = ContainerManager::new(pm, ContainerSettings::default());

        let mut handles = Vec::new();
        for _ in 0..3 {
            let mgr = Arc::clone(&mgr);
            handles.push(tokio::spawn(async move {
                mgr.insert_stub(ContainerCreateArguments::default()).id()
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn failed_create_frees_the_id_and_the_row() {
        let dir = tempfile::tempdir().unwrap();
        let pm = MockProcessManager::new();
        let mgr = ContainerManager::new(pm, test_settings(dir.path()));

        // The overlay mount cannot succeed here, so the pipeline fails
        // in the sandbox and must unwind.
        let args = ContainerCreateArguments {
            root: dir.path().join("base"),
            hostname: "t1".into(),
            ..Default::default()
        };
        let err = mgr.create(args.clone(), None).await.unwrap_err();
        assert!(matches!(err, ContainerError::Sandbox(_)), "{err:?}");
        assert!(mgr.list().is_empty());

        // The id is reusable afterwards.
        let stub = mgr.insert_stub(args);
        assert_eq!(stub.id(), 1);
    }

    #[tokio::test]
    async fn vlan_without_ovs_helper_is_rejected() {
        let pm = MockProcessManager::new();
        let mgr = ContainerManager::new(pm, ContainerSettings::default());

        let args = ContainerCreateArguments {
            root: "/var/images/base".into(),
            nics: vec![nic(NicKind::Vlan, "100")],
            ..Default::default()
        };
        let container = mgr.insert_stub(args);
        let err = container.pre_start().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "config error: ovs is needed for VLAN network type"
        );
    }

    #[tokio::test]
    async fn get_one_with_tags_finds_the_ovs_helper() {
        let pm = MockProcessManager::new();
        let mgr = ContainerManager::new(pm, ContainerSettings::default());

        mgr.insert_stub(ContainerCreateArguments::default());
        assert!(mgr.get_one_with_tags("ovs").is_none());

        let ovs = mgr.insert_stub(ContainerCreateArguments {
            tags: vec!["ovs".into()],
            ..Default::default()
        });
        let found = mgr.get_one_with_tags("ovs").unwrap();
        assert_eq!(found.id(), ovs.id());

        mgr.forget(ovs.id());
        assert!(mgr.get_one_with_tags("ovs").is_none());
    }

    #[tokio::test]
    async fn terminate_is_idempotent_for_dead_ids() {
        let pm = MockProcessManager::new();
        let mgr = ContainerManager::new(pm, ContainerSettings::default());
        assert!(mgr.terminate(42).await.is_ok());
        assert!(mgr.terminate(42).await.is_ok());
    }

    #[tokio::test]
    async fn dispatch_to_dead_id_is_not_found() {
        let pm = MockProcessManager::new();
        let mgr = ContainerManager::new(pm, ContainerSettings::default());
        let cmd = Command::new("core.ping", &serde_json::json!({})).unwrap();
        assert!(matches!(
            mgr.dispatch_sync(9, cmd).await,
            Err(ContainerError::NotFound(9))
        ));
    }

    #[tokio::test]
    async fn destroy_network_stops_port_forwarders() {
        let pm = MockProcessManager::new();
        let mgr = ContainerManager::new(Arc::clone(&pm) as _, ContainerSettings::default());

        let args = ContainerCreateArguments {
            root: "/var/images/base".into(),
            nics: vec![nic(NicKind::Default, "")],
            port: [(8080, 80), (9090, 90)].into_iter().collect(),
            ..Default::default()
        };
        let container = mgr.insert_stub(args);
        container.destroy_network().await;

        let kills = pm.kills();
        let id = container.id();
        assert!(kills.contains(&format!("socat-{id}-8080-80")));
        assert!(kills.contains(&format!("socat-{id}-9090-90")));
    }

    #[tokio::test]
    async fn destroy_network_twice_is_idempotent() {
        let pm = MockProcessManager::new();
        let mgr = ContainerManager::new(Arc::clone(&pm) as _, ContainerSettings::default());

        let args = ContainerCreateArguments {
            root: "/var/images/base".into(),
            nics: vec![nic(NicKind::Zerotier, "8056c2e21c000001")],
            ..Default::default()
        };
        let container = mgr.insert_stub(args);
        container.destroy_network().await;
        container.destroy_network().await;

        let id = container.id();
        let kills = pm.kills();
        assert_eq!(
            kills.iter().filter(|k| **k == format!("net-{id}")).count(),
            2
        );
    }

    #[tokio::test]
    async fn nic_remove_rejects_unknown_indices() {
        let pm = MockProcessManager::new();
        let mgr = ContainerManager::new(pm, ContainerSettings::default());

        let args = ContainerCreateArguments {
            root: "/var/images/base".into(),
            nics: vec![nic(NicKind::Bridge, "br0")],
            ..Default::default()
        };
        let container = mgr.insert_stub(args);
        let id = container.id();

        assert!(mgr.nic_remove(id, 0).await.is_ok());
        // Already detached.
        assert!(mgr.nic_remove(id, 0).await.is_err());
        assert!(mgr.nic_remove(id, 5).await.is_err());
        assert!(matches!(
            mgr.nic_remove(999, 0).await,
            Err(ContainerError::NotFound(999))
        ));
    }

    #[tokio::test]
    async fn host_network_pre_start_ignores_nics() {
        let dir = tempfile::tempdir().unwrap();
        let pm = MockProcessManager::new();
        let mgr = ContainerManager::new(Arc::clone(&pm) as _, test_settings(dir.path()));

        // A vlan NIC that would normally fail fast without an OVS
        // helper; with host networking it must never be looked at.
        let args = ContainerCreateArguments {
            root: "/var/images/base".into(),
            host_network: true,
            nics: vec![nic(NicKind::Vlan, "100")],
            ..Default::default()
        };
        let container = mgr.insert_stub(args);
        let result = container.pre_start().await;

        // The resolv.conf bind itself needs privileges; what matters is
        // that the failure, if any, is a sandbox error and not the vlan
        // config error.
        match result {
            Ok(()) => {
                let target = container.sandbox().root().join("etc/resolv.conf");
                let _ = nix::mount::umount2(&target, nix::mount::MntFlags::MNT_DETACH);
            }
            Err(e) => {
                assert!(
                    matches!(e, ContainerError::Sandbox(_) | ContainerError::Io(_)),
                    "{e:?}"
                );
            }
        }
    }
}
