//! The outer helper: a privileged sibling of the target process that writes
//! its uid/gid maps, persists namespace files, and creates network
//! interfaces on its behalf.
//!
//! Once the target process has entered its own user namespace it has lost
//! `CAP_SET[UG]ID` in the host namespace, so it cannot write its own
//! `uid_map`/`gid_map`. A sibling that still holds host capabilities does it
//! instead, synchronized over a small control socket.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use caps::Capability;
use libc::pid_t;
use log::{debug, warn};

use super::capability::CapGuard;
use super::cgroup;
use super::err::{Error, Result};
use super::fdpass;
use super::idmap::{self, IdMap};
use super::nic::NicOptions;
use super::proc::fork;
use super::user;

/// Linux namespace kinds that can be persisted by bind-mounting
/// `/proc/<pid>/ns/<kind>` onto a regular file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NsKind {
    Cgroup,
    Ipc,
    Mnt,
    Net,
    Pid,
    Time,
    User,
    Uts,
}

impl NsKind {
    fn name(&self) -> &'static str {
        match self {
            NsKind::Cgroup => "cgroup",
            NsKind::Ipc => "ipc",
            NsKind::Mnt => "mnt",
            NsKind::Net => "net",
            NsKind::Pid => "pid",
            NsKind::Time => "time",
            NsKind::User => "user",
            NsKind::Uts => "uts",
        }
    }
}

/// Immutable configuration handed to the outer helper at spawn time.
pub struct OuterHelperConfig {
    pub unshare_user: bool,
    pub unshare_net: bool,
    pub uid_desired: IdMap,
    pub gid_desired: IdMap,
    pub nics: Vec<NicOptions>,
    pub persist: HashMap<NsKind, PathBuf>,
    pub cgroup_enabled: bool,
}

impl Default for OuterHelperConfig {
    fn default() -> Self {
        OuterHelperConfig {
            unshare_user: false,
            unshare_net: false,
            uid_desired: IdMap::new(),
            gid_desired: IdMap::new(),
            nics: Vec::new(),
            persist: HashMap::new(),
            cgroup_enabled: false,
        }
    }
}

/// Stages the helper passes through; used only for logging, the helper never
/// branches back to an earlier stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Started,
    WaitingForPid,
    MappingIds,
    PersistingNs,
    CreatingNics,
    Ack,
}

/// A handle to the running outer helper, held by the parent.
pub struct OuterHelper {
    pid: pid_t,
    sock: UnixStream,
}

/// Fork the outer helper and return a handle to it. The helper itself runs
/// the privileged setup sequence and exits once acknowledged; this call
/// returns immediately in the parent.
///
/// `cgroup_dir_fd`, when `config.cgroup_enabled`, is a directory fd for the
/// cgroup-v2 hierarchy root. It is handed to the helper over the control
/// socket (via [`fdpass`]) rather than relied on to survive fork, so the
/// helper's view of it doesn't depend on fd-table inheritance.
pub fn outer_helper_spawn(
    config: &OuterHelperConfig,
    cgroup_dir_fd: Option<RawFd>,
) -> Result<OuterHelper> {
    let (parent_sock, child_sock) = UnixStream::pair().map_err(|e| Error::os("socketpair", e))?;

    let rootpid = unsafe { libc::getpid() };

    match fork()? {
        super::proc::Fork::Parent(proc) => {
            drop(child_sock);
            let pid = proc.id();
            // We manage this process's lifecycle ourselves via the sync
            // protocol below, not via Proc::park(); forget the guard so its
            // Drop doesn't send SIGKILL once we've synced with it.
            std::mem::forget(proc);
            if let Some(fd) = cgroup_dir_fd {
                fdpass::send_fd(&parent_sock, fd)?;
            }
            Ok(OuterHelper {
                pid,
                sock: parent_sock,
            })
        }
        super::proc::Fork::Child => {
            drop(parent_sock);
            helper_main(config, child_sock, rootpid);
            unreachable!("helper_main always exits the process");
        }
    }
}

impl OuterHelper {
    pub fn pid(&self) -> pid_t {
        self.pid
    }

    /// Unblock the helper to act on `child_pid`.
    pub fn sendpid(&mut self, child_pid: pid_t) -> Result<()> {
        debug!("outer helper: send child pid {}", child_pid);
        self.sock
            .write_all(&child_pid.to_ne_bytes())
            .map_err(|e| Error::os("outer_helper_sendpid", e))
    }

    /// Block until the helper acknowledges completion. A short read means
    /// the helper died before finishing; this is treated the same way a
    /// dead peer is treated anywhere else in this crate: the caller aborts.
    pub fn sync(&mut self) -> Result<()> {
        let mut buf = [0u8; 1];
        match self.sock.read(&mut buf) {
            Ok(1) => {
                debug!("outer helper: ack");
                Ok(())
            }
            Ok(_) => Err(Error::HelperDied),
            Err(e) => Err(Error::os("outer_helper_sync", e)),
        }
    }

    pub fn close(self) {
        drop(self.sock);
    }
}

fn helper_main(config: &OuterHelperConfig, sock: UnixStream, rootpid: pid_t) -> ! {
    let mut stage = Stage::Started;
    debug!("outer helper[{:?}] started", stage);

    if config.cgroup_enabled {
        match fdpass::recv_fd(&sock) {
            Ok(fd) => {
                let fd = fd.into_raw_fd();
                match fork() {
                    Ok(super::proc::Fork::Child) => {
                        // Intentionally orphaned: it must outlive this helper,
                        // which will itself exit once the target process is set up.
                        cgroup::watch(fd, rootpid);
                        std::process::exit(0);
                    }
                    Ok(super::proc::Fork::Parent(p)) => {
                        std::mem::forget(p);
                    }
                    Err(e) => {
                        warn!("outer helper: cgroup watcher fork failed: {}", e);
                    }
                }
            }
            Err(e) => {
                warn!("outer helper: recv cgroup dir fd: {}", e);
            }
        }
    }

    unsafe {
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0);
        let mut mask: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut mask);
        libc::sigprocmask(libc::SIG_SETMASK, &mask, std::ptr::null_mut());
    }

    stage = Stage::WaitingForPid;
    debug!("outer helper[{:?}]", stage);
    let mut sock = sock;
    let mut pid_buf = [0u8; std::mem::size_of::<pid_t>()];
    let child_pid = match sock.read(&mut pid_buf) {
        Ok(n) if n == pid_buf.len() => pid_t::from_ne_bytes(pid_buf),
        Ok(_) => {
            // Parent died before sending a pid. Not worth warning about.
            std::process::exit(1);
        }
        Err(e) => {
            warn!("outer helper: read child pid: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run_privileged_setup(config, child_pid, &mut stage) {
        warn!("outer helper: {}", e);
        std::process::exit(1);
    }

    stage = Stage::Ack;
    debug!("outer helper[{:?}]", stage);
    if sock.write_all(&[1u8]).is_err() {
        std::process::exit(1);
    }

    std::process::exit(0);
}

fn run_privileged_setup(config: &OuterHelperConfig, child_pid: pid_t, stage: &mut Stage) -> Result<()> {
    if config.unshare_user {
        *stage = Stage::MappingIds;
        debug!("outer helper[{:?}]", stage);
        burn_uidmap_gidmap(child_pid, &config.uid_desired, &config.gid_desired)?;
    }

    *stage = Stage::PersistingNs;
    debug!("outer helper[{:?}]", stage);
    persist_ns_files(child_pid, &config.persist)?;

    if config.unshare_net {
        *stage = Stage::CreatingNics;
        debug!("outer helper[{:?}]", stage);
        let _guard = CapGuard::acquire(&[Capability::CAP_NET_ADMIN])?;
        super::nic::create_nics(child_pid, &config.nics)?;
    }

    Ok(())
}

/// Write `data` to `name` (relative to `dirfd`) with exactly one `write()`
/// syscall, then close. Used for files like `uid_map`/`gid_map` that may
/// only be written to once.
fn burn(dirfd: RawFd, name: &str, data: &str) -> Result<()> {
    let cname = std::ffi::CString::new(name)?;
    let fd = unsafe { libc::openat(dirfd, cname.as_ptr(), libc::O_WRONLY, 0) };
    if fd < 0 {
        return Err(Error::last_os_error(format!("burn {}: open", name)));
    }
    let bytes = data.as_bytes();
    let n = unsafe { libc::write(fd, bytes.as_ptr() as *const _, bytes.len()) };
    let write_result = if n < 0 || n as usize != bytes.len() {
        Err(Error::last_os_error(format!("burn {}: write", name)))
    } else {
        Ok(())
    };
    unsafe { libc::close(fd) };
    write_result
}

fn burn_uidmap_gidmap(child_pid: pid_t, uid_desired: &IdMap, gid_desired: &IdMap) -> Result<()> {
    let procpath = format!("/proc/{}", child_pid);
    let cprocpath = std::ffi::CString::new(procpath.clone())?;
    let procfd = unsafe { libc::open(cprocpath.as_ptr(), libc::O_DIRECTORY | libc::O_PATH) };
    if procfd < 0 {
        return Err(Error::last_os_error(format!("open {}", procpath)));
    }

    let uid = user::getuid();
    let gid = user::getgid();

    let cur_uid_map = idmap::parse_kernel_map("/proc/self/uid_map")?;
    let cur_gid_map = idmap::parse_kernel_map("/proc/self/gid_map")?;

    let subuids = idmap::load_subids("/etc/subuid", &whoami(), uid)?;
    let subgids = idmap::load_subids("/etc/subgid", &whoami(), gid)?;

    let uid_map = make_idmap(uid, &subuids, uid_desired, &cur_uid_map)?;
    let gid_map = make_idmap(gid, &subgids, gid_desired, &cur_gid_map)?;

    let result = (|| -> Result<()> {
        let _guard = CapGuard::acquire(&[
            Capability::CAP_SETUID,
            Capability::CAP_SETGID,
            Capability::CAP_DAC_OVERRIDE,
        ])?;
        burn(procfd, "uid_map", &uid_map)?;
        burn(procfd, "gid_map", &gid_map)?;
        Ok(())
    })();

    unsafe { libc::close(procfd) };
    result
}

fn make_idmap(self_id: u32, subids: &IdMap, desired: &IdMap, cur_map: &IdMap) -> Result<String> {
    let out = if !desired.is_empty() {
        idmap::project_desired(desired, subids, cur_map)?
    } else {
        idmap::generate(self_id, subids, cur_map)?
    };
    out.emit()
}

fn whoami() -> String {
    // Best-effort reverse lookup of the invoking uid's login name; subuid
    // files most commonly key on name, but `load_subids` also matches by
    // numeric id, so failure here is not fatal.
    unsafe {
        let pw = libc::getpwuid(libc::getuid());
        if pw.is_null() {
            return String::new();
        }
        std::ffi::CStr::from_ptr((*pw).pw_name)
            .to_string_lossy()
            .into_owned()
    }
}

fn persist_ns_files(pid: pid_t, persist: &HashMap<NsKind, PathBuf>) -> Result<()> {
    for (kind, target) in persist {
        let name = kind.name();
        let ctarget = std::ffi::CString::new(target.to_string_lossy().into_owned())?;

        let rc = unsafe { libc::mknod(ctarget.as_ptr(), libc::S_IFREG, 0) };
        if rc == -1 {
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() != Some(libc::EEXIST) {
                return Err(Error::last_file_error("create", target));
            }
        }

        let procpath = format!("/proc/{}/ns/{}", pid, name);

        let mount_result = {
            let _guard = CapGuard::acquire(&[Capability::CAP_SYS_ADMIN, Capability::CAP_SYS_PTRACE])?;
            super::util::mount(&procpath, target, "", libc::MS_BIND)
        };

        if let Err(e) = mount_result {
            let _ = std::fs::remove_file(target);
            match e {
                Error::OS { io, .. } if io.raw_os_error() == Some(libc::ENOENT) => {
                    debug!("kernel does not support namespace kind {}", name);
                }
                Error::OS { io, .. } if io.raw_os_error() == Some(libc::EINVAL) => {
                    return Err(Error::os(
                        format!(
                            "bind-mount {} to {} (is the destination on a private mount?)",
                            procpath,
                            target.display()
                        ),
                        io,
                    ));
                }
                other => return Err(other),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ns_kind_names() {
        assert_eq!(NsKind::Net.name(), "net");
        assert_eq!(NsKind::Time.name(), "time");
    }
}
