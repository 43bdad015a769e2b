//! Minimal `AF_NETLINK`/`NETLINK_ROUTE` client for creating a network
//! interface directly inside a (possibly not-yet-entered) network namespace.
//!
//! ioctls (as used by [`super::net`]) cannot create interfaces or move them
//! between namespaces; only `RTM_NEWLINK` over a route netlink socket can.
//! This is deliberately small: one request type (create-and-move a veth-style
//! link), not a general rtnetlink client.

use std::mem;

use libc::pid_t;
use log::debug;

use super::err::{Error, Result};

/// Description of one interface the outer helper should create inside the
/// target's network namespace, once that namespace exists.
#[derive(Debug, Clone)]
pub struct NicOptions {
    pub name: String,
    pub kind: String,
    /// Filled in by the outer helper immediately before creation.
    pub netns_pid: pid_t,
}

impl NicOptions {
    pub fn new<S: Into<String>, K: Into<String>>(name: S, kind: K) -> NicOptions {
        NicOptions {
            name: name.into(),
            kind: kind.into(),
            netns_pid: 0,
        }
    }
}

const NLMSG_ALIGNTO: usize = 4;

fn nlmsg_align(len: usize) -> usize {
    (len + NLMSG_ALIGNTO - 1) & !(NLMSG_ALIGNTO - 1)
}

/// Append a `rtattr` (type, payload) to `buf`, netlink-aligned.
fn push_attr(buf: &mut Vec<u8>, ty: u16, payload: &[u8]) {
    let rta_len = (mem::size_of::<libc::rtattr>() + payload.len()) as u16;
    buf.extend_from_slice(&rta_len.to_ne_bytes());
    buf.extend_from_slice(&ty.to_ne_bytes());
    buf.extend_from_slice(payload);
    let padded = nlmsg_align(buf.len());
    buf.resize(padded, 0);
}

/// Append a nested `rtattr` whose payload is itself a sequence of attributes,
/// returning control to the caller to fill it in via `push_attr`, then
/// patching the length in afterwards.
fn push_nested<F: FnOnce(&mut Vec<u8>)>(buf: &mut Vec<u8>, ty: u16, body: F) {
    let start = buf.len();
    buf.extend_from_slice(&0u16.to_ne_bytes()); // length placeholder
    buf.extend_from_slice(&ty.to_ne_bytes());
    body(buf);
    let len = (buf.len() - start) as u16;
    buf[start..start + 2].copy_from_slice(&len.to_ne_bytes());
    let padded = nlmsg_align(buf.len());
    buf.resize(padded, 0);
}

const IFLA_INFO_KIND: u16 = 1;
const IFLA_NET_NS_PID: u16 = 19;
const IFLA_LINKINFO: u16 = 18;
const IFLA_IFNAME: u16 = 3;

/// Open a `NETLINK_ROUTE` socket. Requires `CAP_NET_ADMIN`.
fn open_rtnetlink() -> Result<i32> {
    let fd = unsafe {
        libc::socket(
            libc::AF_NETLINK,
            libc::SOCK_RAW | libc::SOCK_CLOEXEC,
            libc::NETLINK_ROUTE,
        )
    };
    if fd < 0 {
        return Err(Error::last_os_error("socket(AF_NETLINK)"));
    }

    let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as u16;
    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_nl>() as u32,
        )
    };
    if rc != 0 {
        unsafe { libc::close(fd) };
        return Err(Error::last_os_error("bind(AF_NETLINK)"));
    }
    Ok(fd)
}

/// Build and send one `RTM_NEWLINK` request creating `nic.name` of kind
/// `nic.kind` (e.g. `"veth"`, `"dummy"`) directly inside `nic.netns_pid`'s
/// network namespace, then reads back the kernel's ack.
fn send_newlink(fd: i32, nic: &NicOptions) -> Result<()> {
    let mut body = Vec::new();

    // struct ifinfomsg
    body.extend_from_slice(&(libc::AF_UNSPEC as u8).to_ne_bytes());
    body.push(0); // pad
    body.extend_from_slice(&0u16.to_ne_bytes()); // ifi_type
    body.extend_from_slice(&0i32.to_ne_bytes()); // ifi_index
    body.extend_from_slice(&0u32.to_ne_bytes()); // ifi_flags
    body.extend_from_slice(&0u32.to_ne_bytes()); // ifi_change

    let mut name_bytes = nic.name.clone().into_bytes();
    name_bytes.push(0);
    push_attr(&mut body, IFLA_IFNAME, &name_bytes);

    push_attr(&mut body, IFLA_NET_NS_PID, &(nic.netns_pid as u32).to_ne_bytes());

    push_nested(&mut body, IFLA_LINKINFO, |buf| {
        let mut kind_bytes = nic.kind.clone().into_bytes();
        kind_bytes.push(0);
        push_attr(buf, IFLA_INFO_KIND, &kind_bytes);
    });

    let nlmsg_len = (mem::size_of::<libc::nlmsghdr>() + body.len()) as u32;
    let mut msg = Vec::with_capacity(nlmsg_len as usize);
    msg.extend_from_slice(&nlmsg_len.to_ne_bytes());
    msg.extend_from_slice(&(libc::RTM_NEWLINK as u16).to_ne_bytes());
    let flags: u16 = (libc::NLM_F_REQUEST | libc::NLM_F_CREATE | libc::NLM_F_EXCL | libc::NLM_F_ACK) as u16;
    msg.extend_from_slice(&flags.to_ne_bytes());
    msg.extend_from_slice(&0u32.to_ne_bytes()); // sequence
    msg.extend_from_slice(&0u32.to_ne_bytes()); // pid
    msg.extend_from_slice(&body);

    debug!("netlink: creating {} (kind={}) in netns of pid {}", nic.name, nic.kind, nic.netns_pid);

    let n = unsafe { libc::send(fd, msg.as_ptr() as *const _, msg.len(), 0) };
    if n < 0 || n as usize != msg.len() {
        return Err(Error::last_os_error("send(netlink)"));
    }

    recv_ack(fd)
}

/// Read one `nlmsghdr`; treat `NLMSG_ERROR` with a non-zero error code as a
/// failure, anything else as success.
fn recv_ack(fd: i32) -> Result<()> {
    let mut buf = vec![0u8; 4096];
    let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut _, buf.len(), 0) };
    if n < 0 {
        return Err(Error::last_os_error("recv(netlink)"));
    }
    let hdr_len = mem::size_of::<libc::nlmsghdr>();
    if (n as usize) < hdr_len {
        return Err(Error::os("recv(netlink)", std::io::Error::from(std::io::ErrorKind::UnexpectedEof)));
    }
    let msg_type = u16::from_ne_bytes([buf[4], buf[5]]);
    if msg_type == libc::NLMSG_ERROR as u16 {
        let errno_off = hdr_len;
        if (n as usize) >= errno_off + 4 {
            let errno = i32::from_ne_bytes([
                buf[errno_off],
                buf[errno_off + 1],
                buf[errno_off + 2],
                buf[errno_off + 3],
            ]);
            if errno != 0 {
                return Err(Error::os(
                    "netlink RTM_NEWLINK",
                    std::io::Error::from_raw_os_error(-errno),
                ));
            }
        }
    }
    Ok(())
}

/// Create every nic in `nics`, each already stamped with the target pid's
/// network namespace. Requires `CAP_NET_ADMIN`.
pub fn create_nics(child_pid: pid_t, nics: &[NicOptions]) -> Result<()> {
    if nics.is_empty() {
        return Ok(());
    }
    let fd = open_rtnetlink()?;
    let result = (|| -> Result<()> {
        for nic in nics {
            let mut nic = nic.clone();
            nic.netns_pid = child_pid;
            send_newlink(fd, &nic)?;
        }
        Ok(())
    })();
    unsafe { libc::close(fd) };
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nlmsg_align_rounds_up() {
        assert_eq!(nlmsg_align(0), 0);
        assert_eq!(nlmsg_align(1), 4);
        assert_eq!(nlmsg_align(4), 4);
        assert_eq!(nlmsg_align(5), 8);
    }

    #[test]
    fn push_attr_is_aligned() {
        let mut buf = Vec::new();
        push_attr(&mut buf, IFLA_IFNAME, b"eth0\0");
        assert_eq!(buf.len() % NLMSG_ALIGNTO, 0);
    }
}
