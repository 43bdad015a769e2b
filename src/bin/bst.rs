use std::collections::HashMap;
use std::path::PathBuf;
use std::{env, process};

use log;

use bst::{
    run, BootstrapConfig, ExecHooks, IdRange, NicOptions, NsKind,
};

fn usage() {
    let execname = env::args().next().unwrap();
    eprint!(
        "Usage: {execname} [options] -- <cmd> [args ...]

Bootstrap a process into a fresh set of Linux namespaces.

Options:
    -h --help             - Show this message
    -u --user             - Unshare the user namespace
    -n --net              - Unshare the network namespace
    -p --pid              - Unshare the pid namespace
    -m --mount            - Unshare the mount namespace
    -i --ipc              - Unshare the ipc namespace
    -U --uts              - Unshare the uts namespace
    -g --cgroup           - Unshare the cgroup namespace
    -T --time             - Unshare the time namespace
    --uid <in:out:len>    - Add a uid mapping range (repeatable)
    --gid <in:out:len>    - Add a gid mapping range (repeatable)
    --nic <name:kind>     - Create a NIC of the given kind in the new netns (repeatable)
    --persist <kind:path> - Bind-mount the persisted namespace file of <kind> at <path> (repeatable)
    --cgroup-dir <path>   - cgroup v2 directory to create a sub-cgroup under, watched for lifetime
    --tty                 - Broker a pty for the target's stdio

eg. enter a fresh user+mount+pid namespace as an unprivileged user.
  $ bst -u -p -m -- /bin/sh

"
    );
}

fn parse_ns_kind(s: &str) -> Option<NsKind> {
    Some(match s {
        "cgroup" => NsKind::Cgroup,
        "ipc" => NsKind::Ipc,
        "mnt" | "mount" => NsKind::Mnt,
        "net" => NsKind::Net,
        "pid" => NsKind::Pid,
        "time" => NsKind::Time,
        "user" => NsKind::User,
        "uts" => NsKind::Uts,
        _ => return None,
    })
}

fn parse_range(arg: &str, s: &str) -> IdRange {
    let parts: Vec<&str> = s.splitn(3, ':').collect();
    if parts.len() != 3 {
        usage();
        eprintln!("{arg} expects <inner:outer:length>, got {s:?}");
        process::exit(1);
    }
    let parse_one = |p: &str| {
        p.parse::<u32>().unwrap_or_else(|_| {
            usage();
            eprintln!("{arg}: not a number: {p:?}");
            process::exit(1);
        })
    };
    IdRange::new(parse_one(parts[0]), parse_one(parts[1]), parse_one(parts[2]))
}

fn main() {
    bst::setup_logging().unwrap();

    let mut unshare_flags: libc::c_int = 0;
    let mut uid_desired = bst::IdMap::new();
    let mut gid_desired = bst::IdMap::new();
    let mut nics = vec![];
    let mut persist: HashMap<NsKind, PathBuf> = HashMap::new();
    let mut cgroup_dir = None;
    let mut pty = false;

    let mut iargs = env::args().skip(1).peekable();

    while let Some(arg) = iargs.peek() {
        if arg == "--" {
            iargs.next();
            break;
        }
        if !arg.starts_with('-') {
            break;
        }
        let arg = iargs.next().unwrap();
        let mut argval = || {
            iargs.next().unwrap_or_else(|| {
                usage();
                eprintln!("{arg} expects an argument");
                process::exit(1);
            })
        };

        if arg == "-u" || arg == "--user" {
            unshare_flags |= libc::CLONE_NEWUSER;
        } else if arg == "-n" || arg == "--net" {
            unshare_flags |= libc::CLONE_NEWNET;
        } else if arg == "-p" || arg == "--pid" {
            unshare_flags |= libc::CLONE_NEWPID;
        } else if arg == "-m" || arg == "--mount" {
            unshare_flags |= libc::CLONE_NEWNS;
        } else if arg == "-i" || arg == "--ipc" {
            unshare_flags |= libc::CLONE_NEWIPC;
        } else if arg == "-U" || arg == "--uts" {
            unshare_flags |= libc::CLONE_NEWUTS;
        } else if arg == "-g" || arg == "--cgroup" {
            unshare_flags |= libc::CLONE_NEWCGROUP;
        } else if arg == "-T" || arg == "--time" {
            unshare_flags |= libc::CLONE_NEWTIME;
        } else if arg == "--uid" {
            uid_desired.push(parse_range(&arg, &argval()));
        } else if arg == "--gid" {
            gid_desired.push(parse_range(&arg, &argval()));
        } else if arg == "--nic" {
            let s = argval();
            let parts: Vec<&str> = s.splitn(2, ':').collect();
            if parts.len() != 2 {
                usage();
                eprintln!("--nic expects <name:kind>, got {s:?}");
                process::exit(1);
            }
            nics.push(NicOptions::new(parts[0], parts[1]));
        } else if arg == "--persist" {
            let s = argval();
            let parts: Vec<&str> = s.splitn(2, ':').collect();
            let kind = parts.first().and_then(|k| parse_ns_kind(k));
            let kind = kind.unwrap_or_else(|| {
                usage();
                eprintln!("--persist: unknown namespace kind in {s:?}");
                process::exit(1);
            });
            if parts.len() != 2 {
                usage();
                eprintln!("--persist expects <kind:path>, got {s:?}");
                process::exit(1);
            }
            persist.insert(kind, PathBuf::from(parts[1]));
        } else if arg == "--cgroup-dir" {
            cgroup_dir = Some(PathBuf::from(argval()));
        } else if arg == "--tty" {
            pty = true;
        } else if arg == "-h" || arg == "--help" {
            usage();
            return;
        } else {
            usage();
            eprintln!("Unknown argument: {arg}");
            process::exit(1);
        }
    }

    let argv: Vec<String> = iargs.collect();
    if argv.is_empty() {
        usage();
        eprintln!("No command given");
        process::exit(1);
    }

    log::debug!("unshare flags: 0x{:x}", unshare_flags);

    let config = BootstrapConfig {
        unshare_flags,
        uid_desired,
        gid_desired,
        nics,
        persist,
        cgroup_dir,
        pty,
        argv,
    };

    match run(&config, &ExecHooks) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}
