//! cgroup-v2 lifetime watcher.
//!
//! Runs as a detached grandchild of the outer helper. Watches the `bst.<pid>`
//! sub-cgroup's `cgroup.events` file for `populated 0` and removes the
//! sub-cgroup once the last process has left it. A detached process is
//! required because the directory can't be removed while the root process
//! (its own parent) is still inside it.

use std::ffi::CString;
use std::io::Read;
use std::os::unix::io::{FromRawFd, RawFd};

use libc::pid_t;
use log::{debug, warn};

/// Blocks until `bst.<rootpid>`'s `cgroup.events` reports `populated 0`, then
/// removes the sub-cgroup. Never returns an error to its caller: any failure
/// here is logged and the watcher simply exits, since by construction
/// nothing else is waiting on it.
pub fn watch(cgroup_dir_fd: RawFd, rootpid: pid_t) {
    if unsafe { libc::setsid() } == -1 {
        warn!("cgroup watcher: setsid failed: {}", std::io::Error::last_os_error());
        return;
    }

    let subcgroup = format!("bst.{}", rootpid);
    let csub = match CString::new(subcgroup.clone()) {
        Ok(c) => c,
        Err(_) => return,
    };

    let subfd = unsafe { libc::openat(cgroup_dir_fd, csub.as_ptr(), libc::O_DIRECTORY) };
    if subfd == -1 {
        warn!("cgroup watcher: open {}: {}", subcgroup, std::io::Error::last_os_error());
        return;
    }

    let cevents = CString::new("cgroup.events").unwrap();
    let cevent_fd = unsafe { libc::openat(subfd, cevents.as_ptr(), 0) };
    if cevent_fd == -1 {
        warn!("cgroup watcher: open cgroup.events: {}", std::io::Error::last_os_error());
        unsafe { libc::close(subfd) };
        return;
    }

    let epollfd = unsafe { libc::epoll_create1(0) };
    if epollfd == -1 {
        warn!("cgroup watcher: epoll_create1: {}", std::io::Error::last_os_error());
        unsafe {
            libc::close(cevent_fd);
            libc::close(subfd);
        }
        return;
    }

    let mut event = libc::epoll_event {
        events: libc::EPOLLET as u32,
        u64: 0,
    };
    if unsafe { libc::epoll_ctl(epollfd, libc::EPOLL_CTL_ADD, cevent_fd, &mut event) } == -1 {
        warn!("cgroup watcher: epoll_ctl: {}", std::io::Error::last_os_error());
        unsafe {
            libc::close(epollfd);
            libc::close(cevent_fd);
            libc::close(subfd);
        }
        return;
    }

    loop {
        let mut revents = libc::epoll_event { events: 0, u64: 0 };
        let ready = unsafe { libc::epoll_wait(epollfd, &mut revents, 1, -1) };
        if ready == -1 {
            warn!("cgroup watcher: epoll_wait: {}", std::io::Error::last_os_error());
            break;
        }

        // The kernel interface doesn't support seeking; reopen each time.
        let eventsfd = unsafe { libc::openat(subfd, cevents.as_ptr(), libc::O_RDONLY) };
        if eventsfd == -1 {
            warn!("cgroup watcher: reopen cgroup.events: {}", std::io::Error::last_os_error());
            break;
        }
        let mut f = unsafe { std::fs::File::from_raw_fd(eventsfd) };
        let mut contents = String::new();
        if f.read_to_string(&mut contents).is_err() {
            warn!("cgroup watcher: read cgroup.events failed");
            break;
        }

        if contents.lines().any(|l| l.trim() == "populated 0") {
            debug!("cgroup watcher: {} depopulated, removing", subcgroup);
            if unsafe { libc::close(subfd) } != 0 {
                warn!("cgroup watcher: close subfd: {}", std::io::Error::last_os_error());
            }
            remove_subcgroup(cgroup_dir_fd, &subcgroup);
            unsafe { libc::close(cevent_fd) };
            unsafe { libc::close(epollfd) };
            return;
        }
    }

    unsafe {
        libc::close(epollfd);
        libc::close(cevent_fd);
        libc::close(subfd);
    }
}

fn remove_subcgroup(cgroup_dir_fd: RawFd, subcgroup: &str) {
    let csub = match CString::new(subcgroup) {
        Ok(c) => c,
        Err(_) => return,
    };
    if unsafe { libc::unlinkat(cgroup_dir_fd, csub.as_ptr(), libc::AT_REMOVEDIR) } != 0 {
        warn!(
            "cgroup watcher: rmdir {}: {}",
            subcgroup,
            std::io::Error::last_os_error()
        );
    }
}
