/// Coordinator configuration, sourced from defaults plus `SAFEBOX_*`
/// environment variables.
use crate::cgroup::DEFAULT_CGROUP_ROOT;
use crate::mount;
use crate::types::{Result, SafeboxError};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_CGROUP_ROOT: &str = "SAFEBOX_CGROUP_ROOT";
pub const ENV_UNPRIV_UID: &str = "SAFEBOX_UNPRIV_UID";
pub const ENV_UNPRIV_GID: &str = "SAFEBOX_UNPRIV_GID";
pub const ENV_ALLOW_NEWNET: &str = "SAFEBOX_ALLOW_NEWNET";
pub const ENV_AUDIT_LOG: &str = "SAFEBOX_AUDIT_LOG";

// nobody/nogroup on common distributions.
const DEFAULT_UNPRIV_ID: u32 = 65_534;

const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Unified-hierarchy mount point the manager owns a subtree of.
    pub cgroup_root: PathBuf,
    /// Host ids the sandbox user namespace maps onto when the supervisor
    /// runs as root.
    pub unpriv_uid: u32,
    pub unpriv_gid: u32,
    /// Whether CLONE_NEWNET may be used at all on this host.
    pub allow_newnet: bool,
    /// Admission totals; arity is fixed for the process lifetime.
    pub totals: Vec<u64>,
    pub resource_names: Vec<String>,
    /// Read-only binds offered to every sandbox child.
    pub ro_binds: Vec<PathBuf>,
    /// Pause between SIGTERM and SIGKILL on timeout.
    pub kill_grace: Duration,
    /// JSON-lines audit log of completed jobs; disabled when unset.
    pub audit_log: Option<PathBuf>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
            unpriv_uid: DEFAULT_UNPRIV_ID,
            unpriv_gid: DEFAULT_UNPRIV_ID,
            allow_newnet: true,
            totals: vec![100, 1024],
            resource_names: vec!["cpu_pct".to_string(), "mem_mib".to_string()],
            ro_binds: mount::default_ro_binds(),
            kill_grace: DEFAULT_KILL_GRACE,
            audit_log: None,
        }
    }
}

impl CoordinatorConfig {
    /// Defaults overridden by whatever `SAFEBOX_*` variables are present.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(root) = env::var(ENV_CGROUP_ROOT) {
            config.cgroup_root = PathBuf::from(root);
        }
        if let Ok(uid) = env::var(ENV_UNPRIV_UID) {
            config.unpriv_uid = parse_id(ENV_UNPRIV_UID, &uid)?;
        }
        if let Ok(gid) = env::var(ENV_UNPRIV_GID) {
            config.unpriv_gid = parse_id(ENV_UNPRIV_GID, &gid)?;
        }
        if let Ok(flag) = env::var(ENV_ALLOW_NEWNET) {
            config.allow_newnet = match flag.as_str() {
                "0" => false,
                "1" => true,
                other => {
                    return Err(SafeboxError::Config(format!(
                        "{} must be 0 or 1, got {:?}",
                        ENV_ALLOW_NEWNET, other
                    )))
                }
            };
        }
        if let Ok(path) = env::var(ENV_AUDIT_LOG) {
            if !path.is_empty() {
                config.audit_log = Some(PathBuf::from(path));
            }
        }

        Ok(config)
    }

    /// The sandbox depends on Linux namespaces, cgroup v2 and seccomp; on
    /// anything else the coordinator refuses to start.
    pub fn ensure_supported_platform() -> Result<()> {
        if cfg!(target_os = "linux") {
            Ok(())
        } else {
            Err(SafeboxError::Unsupported(
                "safebox requires Linux (namespaces, cgroup v2, seccomp)".to_string(),
            ))
        }
    }
}

fn parse_id(var: &str, value: &str) -> Result<u32> {
    value
        .parse::<u32>()
        .map_err(|e| SafeboxError::Config(format!("{} invalid: {}", var, e)))
}
