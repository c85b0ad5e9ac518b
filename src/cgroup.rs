/// Cgroup v2 management: per-job subgroups under a configured root.
///
/// The manager only ever touches files inside its root subtree. Per group it
/// writes `memory.max`, `cpu.max` and `cgroup.procs`, and reads
/// `memory.current`, `memory.peak`, `cpu.stat` and `memory.events`.
use crate::types::CgroupError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

type Result<T> = std::result::Result<T, CgroupError>;

pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

const REQUIRED_CONTROLLERS: &[&str] = &["cpu", "memory"];
const MAX_GROUP_NAME_LEN: usize = 255;

/// Memory limit written to `memory.max`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryLimit {
    Max,
    Bytes(u64),
}

impl MemoryLimit {
    fn control_value(self) -> String {
        match self {
            MemoryLimit::Max => "max".to_string(),
            MemoryLimit::Bytes(bytes) => bytes.to_string(),
        }
    }
}

/// CPU quota written to `cpu.max` together with the period.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuQuota {
    Max,
    Micros(u64),
}

impl CpuQuota {
    fn control_value(self) -> String {
        match self {
            CpuQuota::Max => "max".to_string(),
            CpuQuota::Micros(quota) => quota.to_string(),
        }
    }
}

/// Usage counters read back from a group's control files.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgroupStats {
    pub memory_current: u64,
    pub memory_peak: u64,
    pub cpu_usage_us: u64,
    pub throttled_us: u64,
}

/// An owned per-job control group. Dropping a handle without destroying it
/// leaks the kernel directory; the Drop impl flags that at error level so
/// tests and operators can catch it.
#[derive(Debug)]
pub struct CgroupHandle {
    group: String,
    path: PathBuf,
    released: bool,
}

impl CgroupHandle {
    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for CgroupHandle {
    fn drop(&mut self) {
        if !self.released {
            log::error!(
                "cgroup handle for {} dropped without destroy; directory may leak",
                self.path.display()
            );
        }
    }
}

/// Manager for the unified hierarchy under one root.
#[derive(Clone, Debug)]
pub struct CgroupManager {
    root: PathBuf,
}

impl CgroupManager {
    /// Open a manager rooted at `root`, verifying that the unified hierarchy
    /// is mounted there and the cpu and memory controllers are present.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let controllers_path = root.join("cgroup.controllers");
        let content =
            fs::read_to_string(&controllers_path).map_err(|e| CgroupError::ControllersUnavailable {
                root: root.clone(),
                detail: format!("cgroup.controllers unreadable: {}", e),
            })?;
        let present: HashSet<&str> = content.split_whitespace().collect();
        let missing: Vec<&str> = REQUIRED_CONTROLLERS
            .iter()
            .copied()
            .filter(|controller| !present.contains(controller))
            .collect();
        if !missing.is_empty() {
            return Err(CgroupError::ControllersUnavailable {
                root,
                detail: format!("missing controllers: {}", missing.join(", ")),
            });
        }
        Ok(Self { root })
    }

    /// Open a manager without probing controllers. Used by tests that point
    /// the manager at a plain directory.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Group names become single path components under the root; anything
    /// that could escape the subtree is refused outright.
    fn validate_group_name(name: &str) -> Result<()> {
        if name.is_empty() || name.len() > MAX_GROUP_NAME_LEN {
            return Err(CgroupError::PathTraversal(name.to_string()));
        }
        if name.contains('/') || name.contains('\\') || name.contains("..") || name.contains('\0') {
            return Err(CgroupError::PathTraversal(name.to_string()));
        }
        Ok(())
    }

    /// Ensure `root/name/` exists. Idempotent on a pre-existing empty group;
    /// a populated group is refused.
    pub fn create(&self, name: &str) -> Result<CgroupHandle> {
        Self::validate_group_name(name)?;
        let path = self.root.join(name);

        if path.is_dir() {
            if !self.read_procs(&path)?.is_empty() {
                return Err(CgroupError::AlreadyExists(name.to_string()));
            }
        } else {
            fs::create_dir(&path).map_err(|source| CgroupError::WriteFailed {
                path: path.clone(),
                source,
            })?;
        }

        // Group-kill on OOM keeps multi-process jobs from limping along
        // after the kernel reclaims one member. Best effort; older kernels
        // lack the file.
        let oom_group = path.join("memory.oom.group");
        if oom_group.exists() {
            if let Err(e) = fs::write(&oom_group, "1") {
                log::warn!("failed to set memory.oom.group on {}: {}", path.display(), e);
            }
        }

        Ok(CgroupHandle {
            group: name.to_string(),
            path,
            released: false,
        })
    }

    /// Re-open a handle for a group directory that already exists.
    pub fn open(&self, name: &str) -> Result<Option<CgroupHandle>> {
        Self::validate_group_name(name)?;
        let path = self.root.join(name);
        if !path.is_dir() {
            return Ok(None);
        }
        Ok(Some(CgroupHandle {
            group: name.to_string(),
            path,
            released: false,
        }))
    }

    pub fn set_memory_max(&self, handle: &CgroupHandle, limit: MemoryLimit) -> Result<()> {
        self.write_control(handle, "memory.max", &limit.control_value())
    }

    pub fn set_cpu_max(&self, handle: &CgroupHandle, quota: CpuQuota, period_us: u64) -> Result<()> {
        let value = format!("{} {}", quota.control_value(), period_us);
        self.write_control(handle, "cpu.max", &value)
    }

    /// Move `pid` into the group.
    pub fn attach(&self, handle: &CgroupHandle, pid: u32) -> Result<()> {
        self.write_control(handle, "cgroup.procs", &format!("{}\n", pid))
    }

    /// PIDs currently attached to the group. A missing `cgroup.procs` reads
    /// as empty so destroy stays usable on partially created groups.
    pub fn procs(&self, handle: &CgroupHandle) -> Result<Vec<u32>> {
        self.read_procs(&handle.path)
    }

    /// Usage snapshot. `memory.peak` needs kernel 5.19+; older kernels fall
    /// back to `memory.current`.
    pub fn stats(&self, handle: &CgroupHandle) -> Result<CgroupStats> {
        let memory_current = self.read_u64(&handle.path.join("memory.current"))?;
        let peak_path = handle.path.join("memory.peak");
        let memory_peak = if peak_path.exists() {
            self.read_u64(&peak_path)?
        } else {
            memory_current
        };
        let (cpu_usage_us, throttled_us) = self.read_cpu_stat(&handle.path.join("cpu.stat"))?;
        Ok(CgroupStats {
            memory_current,
            memory_peak,
            cpu_usage_us,
            throttled_us,
        })
    }

    /// oom_kill counter from `memory.events`; zero when the file is absent.
    pub fn oom_kill_count(&self, handle: &CgroupHandle) -> Result<u64> {
        let path = handle.path.join("memory.events");
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(source) => return Err(CgroupError::ReadFailed { path, source }),
        };
        for line in content.lines() {
            let mut parts = line.split_whitespace();
            if let (Some("oom_kill"), Some(value)) = (parts.next(), parts.next()) {
                return value.parse::<u64>().map_err(|e| CgroupError::Parse {
                    path,
                    detail: format!("oom_kill: {}", e),
                });
            }
        }
        Ok(0)
    }

    /// Remove the group directory. Fails with `NotEmpty` while processes are
    /// still attached; succeeds (and marks the handle released) once the
    /// directory is gone.
    pub fn destroy(&self, handle: &mut CgroupHandle) -> Result<()> {
        if handle.released {
            return Ok(());
        }
        if !self.read_procs(&handle.path)?.is_empty() {
            return Err(CgroupError::NotEmpty(handle.path.clone()));
        }
        match fs::remove_dir(&handle.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(source) => {
                return Err(CgroupError::WriteFailed {
                    path: handle.path.clone(),
                    source,
                })
            }
        }
        handle.released = true;
        Ok(())
    }

    fn write_control(&self, handle: &CgroupHandle, file: &str, value: &str) -> Result<()> {
        let path = handle.path.join(file);
        fs::write(&path, value).map_err(|source| CgroupError::WriteFailed { path, source })
    }

    fn read_procs(&self, group_path: &Path) -> Result<Vec<u32>> {
        let path = group_path.join("cgroup.procs");
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(CgroupError::ReadFailed { path, source }),
        };
        let mut pids = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let pid = line.parse::<u32>().map_err(|e| CgroupError::Parse {
                path: path.clone(),
                detail: format!("pid entry '{}': {}", line, e),
            })?;
            pids.push(pid);
        }
        Ok(pids)
    }

    fn read_u64(&self, path: &Path) -> Result<u64> {
        let content = fs::read_to_string(path).map_err(|source| CgroupError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        content.trim().parse::<u64>().map_err(|e| CgroupError::Parse {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
    }

    fn read_cpu_stat(&self, path: &Path) -> Result<(u64, u64)> {
        let content = fs::read_to_string(path).map_err(|source| CgroupError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let mut usage_usec = None;
        let mut throttled_usec = 0;
        for line in content.lines() {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("usage_usec"), Some(value)) => {
                    usage_usec = Some(value.parse::<u64>().map_err(|e| CgroupError::Parse {
                        path: path.to_path_buf(),
                        detail: format!("usage_usec: {}", e),
                    })?);
                }
                (Some("throttled_usec"), Some(value)) => {
                    throttled_usec = value.parse::<u64>().map_err(|e| CgroupError::Parse {
                        path: path.to_path_buf(),
                        detail: format!("throttled_usec: {}", e),
                    })?;
                }
                _ => {}
            }
        }
        match usage_usec {
            Some(usage) => Ok((usage, throttled_usec)),
            None => Err(CgroupError::Parse {
                path: path.to_path_buf(),
                detail: "cpu.stat missing usage_usec".to_string(),
            }),
        }
    }
}
