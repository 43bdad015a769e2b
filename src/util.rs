use std::ffi::CString;
use std::fs;
use std::io::Write;
use std::os::unix::prelude::*;
use std::path::Path;

use libc;

use log::debug;

pub use super::capability::*;
use super::err::{Error, Result};
pub use super::proc::*;
pub use super::user::*;

/// Allocate a `CString` from the given path.
fn str2cstr<S: AsRef<str>>(s: S) -> Result<CString> {
    let ret = CString::new(s.as_ref())?;
    Ok(ret)
}

/// Allocate a `CString` from the given path.
fn path2cstr<P: AsRef<Path>>(path: P) -> Result<CString> {
    str2cstr(path.as_ref().to_string_lossy())
}

/// Create a file, and write the provided bytes
pub fn write_file<P: AsRef<Path>, S: AsRef<[u8]>>(name: P, buf: S) -> Result<()> {
    debug!("write_file({:?}, ...)", name.as_ref().display());
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .open(name.as_ref())
        .map_err(|e| Error::file("open", name.as_ref(), e))?
        .write_all(buf.as_ref())
        .map_err(|e| Error::file("write", name.as_ref(), e))
}

/// Wraps `unshare()`
pub fn unshare(flags: libc::c_int) -> Result<()> {
    debug!("unshare(0x{:x})", flags);
    if unsafe { libc::unshare(flags) } != 0 {
        return Err(Error::last_os_error("unshare"));
    }
    Ok(())
}

/// Wraps `mount()`
pub fn mount<A, B, C>(src: A, target: B, fstype: C, flags: libc::c_ulong) -> Result<()>
where
    A: AsRef<Path>,
    B: AsRef<Path>,
    C: AsRef<str>,
{
    mount_with_data(src, target, fstype, flags, "")
}

/// Wraps `mount()`
pub fn mount_with_data<A, B, C, D>(
    src: A,
    target: B,
    fstype: C,
    flags: libc::c_ulong,
    data: D,
) -> Result<()>
where
    A: AsRef<Path>,
    B: AsRef<Path>,
    C: AsRef<str>,
    D: AsRef<str>,
{
    debug!(
        "mount({:?},{:?},{:?},0x{:x},{:?})",
        src.as_ref().display(),
        target.as_ref().display(),
        fstype.as_ref(),
        flags,
        data.as_ref()
    );
    if 0 != unsafe {
        libc::mount(
            path2cstr(&src)?.as_ptr(),
            path2cstr(&target)?.as_ptr(),
            str2cstr(&fstype)?.as_ptr() as *const _,
            flags,
            str2cstr(&data)?.as_ptr() as *const _,
        )
    } {
        Err(Error::last_os_error(format!(
            "mount src={:?} target={:?} fs={:?} flags=0x{:x} data=",
            src.as_ref(),
            target.as_ref(),
            fstype.as_ref(),
            flags
        )))?;
    }
    Ok(())
}

/// Maniplate the `O_CLOEXEC` bit on the provided file descriptor.
pub fn set_cloexec<F: AsRawFd>(fd: F, v: bool) -> Result<()> {
    let fdn = fd.as_raw_fd();
    let mut cur = unsafe { libc::fcntl(fdn, libc::F_GETFD) };
    if cur < 0 {
        return Err(Error::last_os_error("F_GETFD"));
    }
    if v {
        cur |= libc::O_CLOEXEC;
    } else {
        cur &= !libc::O_CLOEXEC;
    }
    let err = unsafe { libc::fcntl(fdn, libc::F_SETFD, cur) };
    if err < 0 {
        return Err(Error::last_os_error("F_SETFD"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_cloexec() {
        let (a, _b) = UnixStream::pair().unwrap();
        set_cloexec(a.as_raw_fd(), true).unwrap();
        set_cloexec(a.as_raw_fd(), false).unwrap();
    }

    #[test]
    fn test_cstr() {
        let cstr = path2cstr("/some/path").unwrap();
        assert_eq!(cstr.to_str().unwrap(), "/some/path");
    }
}
