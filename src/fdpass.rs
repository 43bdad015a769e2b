//! Passing a single file descriptor across a connected `AF_UNIX` stream
//! socket via `SCM_RIGHTS` ancillary data.
//!
//! Grounded on the `recv_fd()`/`send_fd()` pair used by the PTY broker to
//! hand the PTY master across the parent/child control socket.

use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use super::err::{Error, Result};

/// Send `fd` to the peer of `sock`, along with a single marker byte.
///
/// The caller retains ownership of `fd` (it is not closed here); the caller
/// should close its own copy once the send succeeds if it no longer needs it.
pub fn send_fd(sock: &UnixStream, fd: RawFd) -> Result<()> {
    let iov_base = [0u8];
    let iov = libc::iovec {
        iov_base: iov_base.as_ptr() as *mut libc::c_void,
        iov_len: 1,
    };

    let mut cmsg_buf = vec![0u8; unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) } as usize];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &iov as *const _ as *mut _;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len() as _;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
        let data = libc::CMSG_DATA(cmsg) as *mut RawFd;
        data.write_unaligned(fd);
    }

    let ret = unsafe { libc::sendmsg(sock.as_raw_fd(), &msg, 0) };
    if ret < 0 {
        return Err(Error::last_os_error("sendmsg"));
    }
    Ok(())
}

/// Receive a single file descriptor sent by [`send_fd`], taking ownership of it.
pub fn recv_fd(sock: &UnixStream) -> Result<OwnedFd> {
    let mut iov_base = [0u8; 1];
    let iov = libc::iovec {
        iov_base: iov_base.as_mut_ptr() as *mut libc::c_void,
        iov_len: 1,
    };

    let mut cmsg_buf = vec![0u8; unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) } as usize];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &iov as *const _ as *mut _;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len() as _;

    let ret = unsafe { libc::recvmsg(sock.as_raw_fd(), &mut msg, 0) };
    if ret < 0 {
        return Err(Error::last_os_error("recvmsg"));
    }
    if ret == 0 {
        return Err(Error::os("recvmsg", io::Error::from(io::ErrorKind::UnexpectedEof)));
    }

    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    if cmsg.is_null() {
        return Err(Error::NoFdReceived);
    }
    let (level, ty) = unsafe { ((*cmsg).cmsg_level, (*cmsg).cmsg_type) };
    if level != libc::SOL_SOCKET || ty != libc::SCM_RIGHTS {
        return Err(Error::NoFdReceived);
    }

    let fd = unsafe {
        let data = libc::CMSG_DATA(cmsg) as *const RawFd;
        data.read_unaligned()
    };
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::IntoRawFd;

    #[test]
    fn round_trip() {
        let (a, b) = UnixStream::pair().expect("socketpair");

        // Pass a dup of stdin (fd 0) so we don't disturb anything real.
        let dupfd = unsafe { libc::dup(0) };
        assert!(dupfd >= 0);

        send_fd(&a, dupfd).expect("send_fd");
        unsafe { libc::close(dupfd) };

        let received = recv_fd(&b).expect("recv_fd");
        assert!(received.as_raw_fd() >= 0);
        drop(received.into_raw_fd());
    }

    #[test]
    fn recv_without_send_fails() {
        let (a, b) = UnixStream::pair().expect("socketpair");
        drop(a);
        assert!(recv_fd(&b).is_err());
    }
}
