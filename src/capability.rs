//! Scoped acquisition of Linux capabilities.
//!
//! The outer helper and the container grandchild both need brief, narrow
//! windows of elevated privilege (to write `uid_map`, bind-mount namespace
//! files, or open a netlink socket) and nothing more. `CapGuard` raises a
//! capability into the effective set on construction and drops it
//! unconditionally when it goes out of scope, including on the error path
//! of a `?`.

use caps::{CapSet, Capability};
use log::{debug, warn};

use super::err::{Error, Result};

fn raise(cap: Capability) -> Result<()> {
    caps::raise(None, CapSet::Effective, cap)
        .map_err(|e| Error::os(format!("raise capability {:?}", cap), to_io(e)))
}

fn drop_cap(cap: Capability) -> Result<()> {
    caps::drop(None, CapSet::Effective, cap)
        .map_err(|e| Error::os(format!("drop capability {:?}", cap), to_io(e)))
}

fn to_io(e: caps::errors::CapsError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
}

/// Holds one or more capabilities in the effective set for as long as it lives.
///
/// Construct with [`CapGuard::acquire`]; the capabilities are dropped from
/// the effective set when the guard is dropped, regardless of how the scope
/// was exited.
pub struct CapGuard {
    held: Vec<Capability>,
}

impl CapGuard {
    /// Raise each capability into the effective set. On partial failure,
    /// whatever was already raised is dropped again before returning the error.
    pub fn acquire(caps: &[Capability]) -> Result<CapGuard> {
        let mut held = Vec::with_capacity(caps.len());
        for &cap in caps {
            if let Err(e) = raise(cap) {
                for &c in &held {
                    let _ = drop_cap(c);
                }
                return Err(e);
            }
            debug!("raised capability {:?}", cap);
            held.push(cap);
        }
        Ok(CapGuard { held })
    }
}

impl Drop for CapGuard {
    fn drop(&mut self) {
        for &cap in &self.held {
            if let Err(e) = drop_cap(cap) {
                warn!("failed to drop capability {:?}: {}", cap, e);
            } else {
                debug!("dropped capability {:?}", cap);
            }
        }
    }
}

/// True if the current process holds `cap` in its effective set.
pub fn has_effective(cap: Capability) -> Result<bool> {
    caps::has_cap(None, CapSet::Effective, cap)
        .map_err(|e| Error::os(format!("check capability {:?}", cap), to_io(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_releases_on_drop() {
        // CAP_CHOWN is virtually never held by the test runner; acquire()
        // should fail cleanly rather than panic, and hold nothing.
        let before = has_effective(Capability::CAP_CHOWN).unwrap_or(false);
        if !before {
            assert!(CapGuard::acquire(&[Capability::CAP_CHOWN]).is_err());
        }
    }
}
