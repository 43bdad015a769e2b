//! bst - bootstrap a process into a fresh set of Linux namespaces
//!
//! Installs one executable:
//! - bst - unshare namespaces, map uids/gids via an outer-helper sibling,
//!   optionally broker a pty, then exec a target command.

// like vec!() for a PathBuf
#[macro_export]
macro_rules! path {
    ($root:expr, $( $piece:expr ),*) => {
        {
            let mut temp = std::path::PathBuf::from($root);
            $(
                temp.push($piece);
            )*
            temp
        }
    }
}

mod err;

mod capability;

mod cgroup;
mod fdpass;
mod idmap;
mod logging;
mod nic;
mod outer;
mod proc;
mod tty;
mod user;

pub mod bootstrap;
pub mod seccomp;
pub mod tempdir;
pub mod util;

pub use bootstrap::{run, BootstrapConfig, BootstrapHooks, Error, ExecHooks, Result};
pub use idmap::{IdMap, IdRange};
pub use logging::setup as setup_logging;
pub use nic::NicOptions;
pub use outer::NsKind;
