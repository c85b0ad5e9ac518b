/// Namespace plan for the sandbox child and user-namespace ID mapping.
///
/// PID, mount, UTS, IPC and user namespaces are always fresh; the network
/// namespace is optional so hosts without CLONE_NEWNET support (WSL-style
/// kernels) can share the host network instead.
use crate::types::LaunchError;
use nix::sched::CloneFlags;
use nix::unistd::{getegid, geteuid, Pid};
use std::fs;
use std::path::PathBuf;

pub const SANDBOX_HOSTNAME: &str = "safebox";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NamespacePlan {
    new_net: bool,
}

impl NamespacePlan {
    pub fn new(new_net: bool) -> Self {
        Self { new_net }
    }

    /// Flag set for clone(2). Everything but the network namespace is
    /// mandatory.
    pub fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWUTS
            | CloneFlags::CLONE_NEWIPC
            | CloneFlags::CLONE_NEWUSER;
        if self.new_net {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        flags
    }

    pub fn isolates_network(&self) -> bool {
        self.new_net
    }
}

/// Write `setgroups`, `uid_map` and `gid_map` for a freshly cloned child.
///
/// Must run in the parent before the child is released past its start
/// barrier: until the maps exist the child runs with overflow ids and the
/// later in-namespace privilege handling would misbehave.
///
/// The single mapped id is 0 inside the namespace. A root supervisor pins
/// it to the configured unprivileged host ids so the child never acts as
/// host root; an unprivileged supervisor may only map its own ids.
pub fn write_id_maps(child: Pid, unpriv_uid: u32, unpriv_gid: u32) -> Result<(), LaunchError> {
    let proc_dir = PathBuf::from(format!("/proc/{}", child.as_raw()));

    let (host_uid, host_gid) = if geteuid().is_root() {
        (unpriv_uid, unpriv_gid)
    } else {
        (geteuid().as_raw(), getegid().as_raw())
    };

    // setgroups must be denied before gid_map is writable by unprivileged
    // supervisors.
    write_map_file(proc_dir.join("setgroups"), "deny")?;
    write_map_file(proc_dir.join("uid_map"), &format!("0 {} 1", host_uid))?;
    write_map_file(proc_dir.join("gid_map"), &format!("0 {} 1", host_gid))?;

    log::debug!(
        "wrote id maps for pid {}: uid 0->{}, gid 0->{}",
        child,
        host_uid,
        host_gid
    );
    Ok(())
}

fn write_map_file(path: PathBuf, content: &str) -> Result<(), LaunchError> {
    fs::write(&path, content).map_err(|source| LaunchError::IdMapFailed { path, source })
}
