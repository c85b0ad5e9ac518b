/// Core types and error taxonomy for the safebox runtime
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Job identifier. Monotonically assigned; the safety scan and the reported
/// safe sequence order jobs by ascending id, so ordering is load-bearing.
pub type JobId = u32;

/// Why an admission request was turned down.
///
/// These are values, not errors: admission never throws across the
/// coordinator boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionReason {
    /// Engine has no totals (zero arity or unconfigured).
    Uninitialized,
    /// Job id was never declared.
    UnknownJob,
    /// Job id is already declared.
    DuplicateJob,
    /// Vector arity does not match the arity fixed at initialization.
    ArityMismatch,
    /// allocated + request would exceed the job's declared maximum.
    ExceedsMax,
    /// Request exceeds currently available resources.
    InsufficientAvailable,
    /// Granting would leave no safe sequence over the live set.
    UnsafeState,
    /// Release exceeds the job's current allocation.
    NegativeRelease,
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            RejectionReason::Uninitialized => "engine not initialized",
            RejectionReason::UnknownJob => "unknown job",
            RejectionReason::DuplicateJob => "job already declared",
            RejectionReason::ArityMismatch => "resource vector arity mismatch",
            RejectionReason::ExceedsMax => "request exceeds declared maximum",
            RejectionReason::InsufficientAvailable => "request exceeds available resources",
            RejectionReason::UnsafeState => "request would leave an unsafe state",
            RejectionReason::NegativeRelease => "release exceeds current allocation",
        };
        f.write_str(text)
    }
}

/// Outcome of a single admission request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Request committed; the safe sequence witnesses the resulting state.
    Granted { safe_sequence: Vec<JobId> },
    /// Request rolled back; engine state is unchanged.
    Rejected(RejectionReason),
}

/// Errors from the cgroup-v2 manager. All operations are filesystem writes
/// under the configured root; errors carry the offending path.
#[derive(Error, Debug)]
pub enum CgroupError {
    #[error("cgroup v2 controllers unavailable under {root}: {detail}")]
    ControllersUnavailable { root: PathBuf, detail: String },

    #[error("cgroup name rejected: {0}")]
    PathTraversal(String),

    #[error("cgroup {0} already exists and is populated")]
    AlreadyExists(String),

    #[error("failed to write {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {detail}")]
    Parse { path: PathBuf, detail: String },

    #[error("cgroup {} still has attached processes", .0.display())]
    NotEmpty(PathBuf),
}

/// Supervisor-side launch failures. Child-side setup failures (mounts,
/// privilege drop, seccomp, exec) never surface here; they are reported
/// through the child's distinguished exit code as a `SetupFailure` outcome.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("invalid spawn spec: {0}")]
    InvalidSpec(String),

    #[error("clone failed: {0}")]
    CloneFailed(nix::errno::Errno),

    #[error("failed to write id map {path}: {source}")]
    IdMapFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to attach child to cgroup: {0}")]
    AttachFailed(#[source] CgroupError),

    #[error("failed to signal child to proceed: {0}")]
    StartSignalFailed(#[source] io::Error),

    #[error("waitpid failed: {0}")]
    WaitFailed(nix::errno::Errno),

    #[error("failed to signal pid {pid}: {errno}")]
    KillFailed { pid: i32, errno: nix::errno::Errno },
}

/// Top-level error type for coordinator and CLI paths.
#[derive(Error, Debug)]
pub enum SafeboxError {
    #[error("admission rejected: {0}")]
    Admission(RejectionReason),

    #[error("cgroup error: {0}")]
    Cgroup(#[from] CgroupError),

    #[error("launch error: {0}")]
    Launch(#[from] LaunchError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unsupported platform: {0}")]
    Unsupported(String),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for safebox operations.
pub type Result<T> = std::result::Result<T, SafeboxError>;

/// Job lifecycle states tracked by the coordinator's job table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Created by a submission, admission not yet decided.
    Pending,
    /// Admission granted, resources allocated.
    Admitted,
    /// Child attached to its cgroup and released past the start barrier.
    Running,
    /// Child reaped.
    Exited,
    /// Cgroup destroyed and allocation returned. Kept for history only.
    Released,
}

/// How the sandboxed child ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "code", rename_all = "snake_case")]
pub enum ExitStatus {
    /// Normal exit with the given code.
    Exited(i32),
    /// Terminated by the given signal.
    Signaled(i32),
    /// Child failed during sandbox setup; code is the distinguished
    /// 127+step exit code.
    SetupFailed(i32),
}

/// Resource usage observed from the job's cgroup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub memory_peak: u64,
    pub cpu_usage_us: u64,
}

/// Collaborator-facing result of a single submission.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub admitted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safe_sequence: Option<Vec<JobId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit: Option<ExitStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<JobStats>,
    /// True when the cgroup recorded an oom_kill event for this job.
    #[serde(default)]
    pub oom_killed: bool,
}

impl JobResult {
    /// Result for a submission turned down at the admission boundary.
    pub fn rejected(job_id: JobId, reason: RejectionReason) -> Self {
        Self {
            job_id,
            admitted: false,
            rejection_reason: Some(reason.to_string()),
            safe_sequence: None,
            exit: None,
            stats: None,
            oom_killed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_status_json_shape() {
        let exited = serde_json::to_value(ExitStatus::Exited(0)).unwrap();
        assert_eq!(exited["kind"], "exited");
        assert_eq!(exited["code"], 0);

        let signaled = serde_json::to_value(ExitStatus::Signaled(9)).unwrap();
        assert_eq!(signaled["kind"], "signaled");
        assert_eq!(signaled["code"], 9);

        let setup = serde_json::to_value(ExitStatus::SetupFailed(130)).unwrap();
        assert_eq!(setup["kind"], "setup_failed");
    }

    #[test]
    fn rejected_result_carries_reason() {
        let result = JobResult::rejected(7, RejectionReason::UnsafeState);
        assert!(!result.admitted);
        assert_eq!(
            result.rejection_reason.as_deref(),
            Some("request would leave an unsafe state")
        );
        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("exit").is_none());
        assert!(json.get("safe_sequence").is_none());
    }
}
