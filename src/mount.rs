/// Child-side mount plan: private propagation, a fresh /proc, and read-only
/// binds of the system directories the target's dynamic linker needs.
///
/// Everything here runs inside the child's fresh mount + user namespaces,
/// where the child holds CAP_SYS_ADMIN over its own mounts. Nothing escapes
/// to the host because / is made recursively private first.
use nix::mount::{mount, MsFlags};
use std::path::PathBuf;

/// Minimal set required by a dynamically linked target. Entries missing on
/// the host (e.g. /lib64 on some distributions) are skipped.
pub const DEFAULT_RO_BINDS: &[&str] = &["/bin", "/usr/bin", "/lib", "/lib64", "/usr/lib"];

pub fn default_ro_binds() -> Vec<PathBuf> {
    DEFAULT_RO_BINDS.iter().map(PathBuf::from).collect()
}

/// mount(NULL, "/", NULL, MS_REC|MS_PRIVATE, NULL): mount events inside the
/// sandbox must not propagate back to the host.
pub fn make_root_private() -> nix::Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
}

/// Remount /proc for the fresh PID namespace so the child only sees itself.
pub fn mount_proc() -> nix::Result<()> {
    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
        None::<&str>,
    )
}

/// Recursive self-binds, then a read-only remount for each. The first bind
/// call ignores MS_RDONLY; only the MS_REMOUNT pass applies it.
pub fn bind_system_dirs_ro(dirs: &[PathBuf]) -> nix::Result<()> {
    for dir in dirs {
        if !dir.is_dir() {
            log::debug!("skipping missing bind source {}", dir.display());
            continue;
        }
        mount(
            Some(dir),
            dir,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )?;
        mount(
            None::<&str>,
            dir,
            None::<&str>,
            MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY | MsFlags::MS_NOSUID,
            None::<&str>,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_binds_cover_linker_paths() {
        let binds = default_ro_binds();
        assert_eq!(binds.len(), 5);
        assert!(binds.contains(&PathBuf::from("/lib")));
        assert!(binds.contains(&PathBuf::from("/usr/bin")));
    }
}
