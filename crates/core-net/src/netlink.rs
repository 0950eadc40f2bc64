//! Raw rtnetlink socket operations.
//!
//! Link creation, deletion and namespace moves must be atomic and free of
//! shell quoting, so they speak rtnetlink directly. Each request is a
//! single message followed by a kernel acknowledgement.

use std::ffi::CString;
use std::io;
use std::mem;
use std::net::IpAddr;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};

use ipnetwork::IpNetwork;

use crate::error::{NetError, Result};

const NETLINK_ROUTE: i32 = 0;

const RTM_NEWLINK: u16 = 16;
const RTM_DELLINK: u16 = 17;
const RTM_NEWADDR: u16 = 20;

const NLM_F_REQUEST: u16 = 0x0001;
const NLM_F_ACK: u16 = 0x0004;
const NLM_F_EXCL: u16 = 0x0200;
const NLM_F_CREATE: u16 = 0x0400;

const IFF_UP: u32 = 0x1;

const IFLA_ADDRESS: u16 = 1;
const IFLA_IFNAME: u16 = 3;
const IFLA_MTU: u16 = 4;
const IFLA_MASTER: u16 = 10;
const IFLA_TXQLEN: u16 = 13;
const IFLA_LINKINFO: u16 = 18;
const IFLA_NET_NS_PID: u16 = 19;

const IFLA_INFO_KIND: u16 = 1;
const IFLA_INFO_DATA: u16 = 2;
const VETH_INFO_PEER: u16 = 1;

const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;

const NLA_F_NESTED: u16 = 1 << 15;

/// Netlink message header.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct NlMsgHdr {
    nlmsg_len: u32,
    nlmsg_type: u16,
    nlmsg_flags: u16,
    nlmsg_seq: u32,
    nlmsg_pid: u32,
}

/// Interface info message.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct IfInfoMsg {
    ifi_family: u8,
    _pad: u8,
    ifi_type: u16,
    ifi_index: i32,
    ifi_flags: u32,
    ifi_change: u32,
}

/// Interface address message.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct IfAddrMsg {
    ifa_family: u8,
    ifa_prefixlen: u8,
    ifa_flags: u8,
    ifa_scope: u8,
    ifa_index: u32,
}

/// Netlink attribute header.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct NlAttr {
    nla_len: u16,
    nla_type: u16,
}

fn as_bytes<T>(value: &T) -> &[u8] {
    // repr(C) plain-data structs only.
    unsafe { std::slice::from_raw_parts((value as *const T).cast::<u8>(), mem::size_of::<T>()) }
}

/// A veth pair to be created in one rtnetlink request.
///
/// The primary side comes up immediately; the peer stays down until the
/// orchestrator moves it into the container's namespace.
#[derive(Debug, Clone)]
pub struct VethConfig {
    pub name: String,
    pub peer: String,
    pub mtu: u32,
    pub txqueue: u32,
}

impl VethConfig {
    #[must_use]
    pub fn new(name: impl Into<String>, peer: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            peer: peer.into(),
            mtu: 1500,
            txqueue: 1000,
        }
    }
}

/// Rtnetlink socket handle.
pub struct NetlinkHandle {
    fd: OwnedFd,
    seq: u32,
}

impl NetlinkHandle {
    /// Opens and binds an rtnetlink socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be created or bound.
    pub fn new() -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                NETLINK_ROUTE,
            )
        };
        if fd < 0 {
            return Err(NetError::Netlink(format!(
                "failed to create netlink socket: {}",
                io::Error::last_os_error()
            )));
        }

        let addr = unsafe {
            let mut addr: libc::sockaddr_nl = mem::zeroed();
            addr.nl_family = libc::AF_NETLINK as u16;
            addr.nl_pid = 0;
            addr.nl_groups = 0;
            addr
        };
        let ret = unsafe {
            libc::bind(
                fd,
                std::ptr::addr_of!(addr).cast::<libc::sockaddr>(),
                mem::size_of::<libc::sockaddr_nl>() as u32,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(NetError::Netlink(format!(
                "failed to bind netlink socket: {err}"
            )));
        }

        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            seq: 0,
        })
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn send_and_ack(&mut self, msg: &[u8]) -> Result<()> {
        let sent = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                msg.as_ptr().cast::<libc::c_void>(),
                msg.len(),
                0,
            )
        };
        if sent < 0 {
            return Err(NetError::Netlink(format!(
                "failed to send netlink message: {}",
                io::Error::last_os_error()
            )));
        }

        let mut buf = [0u8; 4096];
        let len = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr().cast::<libc::c_void>(),
                buf.len(),
                0,
            )
        };
        if len < 0 {
            return Err(NetError::Netlink(format!(
                "failed to receive netlink response: {}",
                io::Error::last_os_error()
            )));
        }

        // The only expected reply is NLMSG_ERROR; error code 0 is the ack.
        if len >= mem::size_of::<NlMsgHdr>() as isize {
            let hdr = unsafe { &*buf.as_ptr().cast::<NlMsgHdr>() };
            if hdr.nlmsg_type == libc::NLMSG_ERROR as u16
                && len >= (mem::size_of::<NlMsgHdr>() + 4) as isize
            {
                let code =
                    unsafe { *buf.as_ptr().add(mem::size_of::<NlMsgHdr>()).cast::<i32>() };
                if code != 0 {
                    return Err(NetError::Netlink(format!(
                        "netlink error: {}",
                        io::Error::from_raw_os_error(-code)
                    )));
                }
            }
        }

        Ok(())
    }

    /// Creates a veth pair in one request.
    ///
    /// # Errors
    ///
    /// Returns an error if either name exists already or the kernel
    /// rejects the request.
    pub fn create_veth(&mut self, config: &VethConfig) -> Result<()> {
        let seq = self.next_seq();
        let mut msg = Vec::with_capacity(256);

        msg.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);
        let ifinfo = IfInfoMsg {
            ifi_family: libc::AF_UNSPEC as u8,
            ifi_flags: IFF_UP,
            ifi_change: IFF_UP,
            ..IfInfoMsg::default()
        };
        msg.extend_from_slice(as_bytes(&ifinfo));

        add_attr_string(&mut msg, IFLA_IFNAME, &config.name);
        add_attr_u32(&mut msg, IFLA_MTU, config.mtu);
        add_attr_u32(&mut msg, IFLA_TXQLEN, config.txqueue);

        let linkinfo = begin_nested(&mut msg, IFLA_LINKINFO);
        add_attr_string(&mut msg, IFLA_INFO_KIND, "veth");
        let data = begin_nested(&mut msg, IFLA_INFO_DATA);
        {
            // VETH_INFO_PEER payload is a full ifinfomsg plus attributes
            // describing the peer.
            let peer = begin_nested(&mut msg, VETH_INFO_PEER);
            msg.extend_from_slice(as_bytes(&IfInfoMsg {
                ifi_family: libc::AF_UNSPEC as u8,
                ..IfInfoMsg::default()
            }));
            add_attr_string(&mut msg, IFLA_IFNAME, &config.peer);
            add_attr_u32(&mut msg, IFLA_MTU, config.mtu);
            add_attr_u32(&mut msg, IFLA_TXQLEN, config.txqueue);
            end_nested(&mut msg, peer);
        }
        end_nested(&mut msg, data);
        end_nested(&mut msg, linkinfo);

        finish_link_msg(
            &mut msg,
            RTM_NEWLINK,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            seq,
        );
        self.send_and_ack(&msg)
    }

    /// Deletes a link by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the link does not exist or deletion fails.
    pub fn delete_link(&mut self, name: &str) -> Result<()> {
        let ifindex = self.ifindex(name)?;
        let seq = self.next_seq();
        let mut msg = Vec::with_capacity(64);

        msg.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);
        msg.extend_from_slice(as_bytes(&IfInfoMsg {
            ifi_family: libc::AF_UNSPEC as u8,
            ifi_index: ifindex as i32,
            ..IfInfoMsg::default()
        }));

        finish_link_msg(&mut msg, RTM_DELLINK, NLM_F_REQUEST | NLM_F_ACK, seq);
        self.send_and_ack(&msg)
    }

    /// Brings a link up.
    ///
    /// # Errors
    ///
    /// Returns an error if the link does not exist or the change fails.
    pub fn set_link_up(&mut self, name: &str) -> Result<()> {
        let ifindex = self.ifindex(name)?;
        self.change_link(ifindex, true, |_| {})
    }

    /// Attaches a link to a bridge (its master).
    ///
    /// # Errors
    ///
    /// Returns an error if either link is missing or the change fails.
    pub fn set_link_master(&mut self, name: &str, master: &str) -> Result<()> {
        let ifindex = self.ifindex(name)?;
        let master_index = self.ifindex(master)?;
        self.change_link(ifindex, false, |msg| {
            add_attr_u32(msg, IFLA_MASTER, master_index);
        })
    }

    /// Sets a link's hardware address.
    ///
    /// # Errors
    ///
    /// Returns an error if the link does not exist or the change fails.
    pub fn set_link_mac(&mut self, name: &str, mac: [u8; 6]) -> Result<()> {
        let ifindex = self.ifindex(name)?;
        self.change_link(ifindex, false, |msg| {
            add_attr_bytes(msg, IFLA_ADDRESS, &mac);
        })
    }

    /// Moves a link into the network namespace of `pid`.
    ///
    /// # Errors
    ///
    /// Returns an error if the link or the process does not exist.
    pub fn set_link_netns_pid(&mut self, name: &str, pid: u32) -> Result<()> {
        let ifindex = self.ifindex(name)?;
        self.change_link(ifindex, false, |msg| {
            add_attr_u32(msg, IFLA_NET_NS_PID, pid);
        })
    }

    /// Adds an address to a link.
    ///
    /// Used for loopback bring-up inside a fresh namespace; container
    /// addresses are configured through `ip netns exec`.
    ///
    /// # Errors
    ///
    /// Returns an error if the link is missing or the kernel rejects the
    /// address.
    pub fn add_address(&mut self, name: &str, addr: IpNetwork) -> Result<()> {
        let ifindex = self.ifindex(name)?;
        let seq = self.next_seq();
        let mut msg = Vec::with_capacity(64);

        msg.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);
        let family = match addr {
            IpNetwork::V4(_) => libc::AF_INET as u8,
            IpNetwork::V6(_) => libc::AF_INET6 as u8,
        };
        msg.extend_from_slice(as_bytes(&IfAddrMsg {
            ifa_family: family,
            ifa_prefixlen: addr.prefix(),
            ifa_flags: 0,
            ifa_scope: 0,
            ifa_index: ifindex,
        }));

        match addr.ip() {
            IpAddr::V4(ip) => {
                add_attr_bytes(&mut msg, IFA_LOCAL, &ip.octets());
                add_attr_bytes(&mut msg, IFA_ADDRESS, &ip.octets());
            }
            IpAddr::V6(ip) => {
                add_attr_bytes(&mut msg, IFA_LOCAL, &ip.octets());
                add_attr_bytes(&mut msg, IFA_ADDRESS, &ip.octets());
            }
        }

        finish_link_msg(
            &mut msg,
            RTM_NEWADDR,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            seq,
        );
        self.send_and_ack(&msg)
    }

    /// Resolves a link name to its interface index.
    ///
    /// # Errors
    ///
    /// Returns an error if no such link exists.
    pub fn ifindex(&self, name: &str) -> Result<u32> {
        let c_name = CString::new(name).map_err(|e| NetError::Netlink(e.to_string()))?;
        let ifindex = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
        if ifindex == 0 {
            return Err(NetError::Netlink(format!("interface not found: {name}")));
        }
        Ok(ifindex)
    }

    /// RTM_NEWLINK against an existing link; `up` additionally flips
    /// IFF_UP.
    fn change_link(
        &mut self,
        ifindex: u32,
        up: bool,
        fill: impl FnOnce(&mut Vec<u8>),
    ) -> Result<()> {
        let seq = self.next_seq();
        let mut msg = Vec::with_capacity(64);

        let flags = if up { IFF_UP } else { 0 };
        msg.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);
        msg.extend_from_slice(as_bytes(&IfInfoMsg {
            ifi_family: libc::AF_UNSPEC as u8,
            ifi_index: ifindex as i32,
            ifi_flags: flags,
            ifi_change: flags,
            ..IfInfoMsg::default()
        }));
        fill(&mut msg);

        finish_link_msg(&mut msg, RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK, seq);
        self.send_and_ack(&msg)
    }
}

fn finish_link_msg(msg: &mut [u8], nlmsg_type: u16, flags: u16, seq: u32) {
    let hdr = NlMsgHdr {
        nlmsg_len: msg.len() as u32,
        nlmsg_type,
        nlmsg_flags: flags,
        nlmsg_seq: seq,
        nlmsg_pid: 0,
    };
    msg[..mem::size_of::<NlMsgHdr>()].copy_from_slice(as_bytes(&hdr));
}

fn add_attr_string(msg: &mut Vec<u8>, attr_type: u16, value: &str) {
    let attr_len = mem::size_of::<NlAttr>() + value.len() + 1;
    msg.extend_from_slice(as_bytes(&NlAttr {
        nla_len: attr_len as u16,
        nla_type: attr_type,
    }));
    msg.extend_from_slice(value.as_bytes());
    msg.push(0);
    pad(msg, attr_len);
}

fn add_attr_u32(msg: &mut Vec<u8>, attr_type: u16, value: u32) {
    let attr_len = mem::size_of::<NlAttr>() + mem::size_of::<u32>();
    msg.extend_from_slice(as_bytes(&NlAttr {
        nla_len: attr_len as u16,
        nla_type: attr_type,
    }));
    msg.extend_from_slice(&value.to_ne_bytes());
}

fn add_attr_bytes(msg: &mut Vec<u8>, attr_type: u16, value: &[u8]) {
    let attr_len = mem::size_of::<NlAttr>() + value.len();
    msg.extend_from_slice(as_bytes(&NlAttr {
        nla_len: attr_len as u16,
        nla_type: attr_type,
    }));
    msg.extend_from_slice(value);
    pad(msg, attr_len);
}

/// Reserves a nested attribute header, returning its offset for
/// [`end_nested`].
fn begin_nested(msg: &mut Vec<u8>, attr_type: u16) -> usize {
    let start = msg.len();
    msg.extend_from_slice(as_bytes(&NlAttr {
        nla_len: 0,
        nla_type: attr_type | NLA_F_NESTED,
    }));
    start
}

/// Patches the length of a nested attribute started at `start`.
fn end_nested(msg: &mut Vec<u8>, start: usize) {
    let len = (msg.len() - start) as u16;
    msg[start..start + 2].copy_from_slice(&len.to_ne_bytes());
}

fn pad(msg: &mut Vec<u8>, attr_len: usize) {
    let padded = (attr_len + 3) & !3;
    msg.extend(std::iter::repeat(0).take(padded - attr_len));
}

/// Parses a textual MAC address (`aa:bb:cc:dd:ee:ff`).
///
/// # Errors
///
/// Returns [`NetError::InvalidMac`] on anything but six colon-separated
/// hex octets.
pub fn parse_mac(text: &str) -> Result<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = text.split(':');
    for byte in &mut mac {
        let part = parts
            .next()
            .ok_or_else(|| NetError::InvalidMac(text.to_string()))?;
        *byte =
            u8::from_str_radix(part, 16).map_err(|_| NetError::InvalidMac(text.to_string()))?;
    }
    if parts.next().is_some() {
        return Err(NetError::InvalidMac(text.to_string()));
    }
    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_parsing() {
        assert_eq!(
            parse_mac("52:54:00:12:34:56").unwrap(),
            [0x52, 0x54, 0x00, 0x12, 0x34, 0x56]
        );
        assert!(parse_mac("52:54:00:12:34").is_err());
        assert!(parse_mac("52:54:00:12:34:56:78").is_err());
        assert!(parse_mac("not-a-mac").is_err());
    }

    #[test]
    fn nested_attribute_length_is_patched() {
        let mut msg = Vec::new();
        let start = begin_nested(&mut msg, IFLA_LINKINFO);
        add_attr_string(&mut msg, IFLA_INFO_KIND, "veth");
        end_nested(&mut msg, start);

        let len = u16::from_ne_bytes([msg[0], msg[1]]);
        assert_eq!(len as usize, msg.len());
        let attr_type = u16::from_ne_bytes([msg[2], msg[3]]);
        assert_eq!(attr_type, IFLA_LINKINFO | NLA_F_NESTED);
    }

    #[test]
    fn veth_round_trip_requires_root() {
        if unsafe { libc::geteuid() } != 0 {
            eprintln!("Skipping test: requires root privileges");
            return;
        }

        let mut handle = NetlinkHandle::new().unwrap();
        let config = VethConfig::new("cont65500-0", "cont65500-0p");
        if handle.create_veth(&config).is_err() {
            // Kernel without veth support or sandboxed netlink; nothing to
            // verify here.
            return;
        }
        assert!(crate::link_exists("cont65500-0"));
        assert!(crate::link_exists("cont65500-0p"));
        handle.delete_link("cont65500-0").unwrap();
        assert!(!crate::link_exists("cont65500-0"));
    }
}
