/// Sandbox launcher: clones the target into fresh namespaces, holds it at a
/// start barrier while the supervisor writes ID maps and attaches the PID to
/// its cgroup, then lets it harden itself and exec.
///
/// Child setup order is fixed: barrier read, private root, /proc remount,
/// read-only binds, hostname, no_new_privs, in-namespace privilege pinning,
/// seccomp, execve. Each failed step exits with the distinguished 127+step
/// code so the supervisor can tell setup failures from target behavior.
use crate::mount;
use crate::namespace::{self, NamespacePlan};
use crate::seccomp;
use crate::types::LaunchError;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{Gid, Pid, Uid};
use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;

const CHILD_STACK_SIZE: usize = 1024 * 1024;

/// Where child setup failed, encoded into the exit code as 127 + step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetupStep {
    StartBarrier = 1,
    PrivateRoot = 2,
    ProcMount = 3,
    BindMounts = 4,
    Hostname = 5,
    NoNewPrivs = 6,
    DropIds = 7,
    Seccomp = 8,
    Exec = 9,
}

impl SetupStep {
    pub const fn exit_code(self) -> i32 {
        127 + self as i32
    }

    pub fn from_exit_code(code: i32) -> Option<Self> {
        match code - 127 {
            1 => Some(SetupStep::StartBarrier),
            2 => Some(SetupStep::PrivateRoot),
            3 => Some(SetupStep::ProcMount),
            4 => Some(SetupStep::BindMounts),
            5 => Some(SetupStep::Hostname),
            6 => Some(SetupStep::NoNewPrivs),
            7 => Some(SetupStep::DropIds),
            8 => Some(SetupStep::Seccomp),
            9 => Some(SetupStep::Exec),
            _ => None,
        }
    }
}

impl std::fmt::Display for SetupStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SetupStep::StartBarrier => "start barrier",
            SetupStep::PrivateRoot => "private root mount",
            SetupStep::ProcMount => "/proc remount",
            SetupStep::BindMounts => "read-only bind mounts",
            SetupStep::Hostname => "hostname",
            SetupStep::NoNewPrivs => "no_new_privs",
            SetupStep::DropIds => "privilege drop",
            SetupStep::Seccomp => "seccomp install",
            SetupStep::Exec => "execve",
        };
        f.write_str(name)
    }
}

/// Everything the launcher needs to start one sandboxed target.
#[derive(Clone, Debug)]
pub struct SpawnSpec {
    pub exec_path: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub namespaces: NamespacePlan,
    /// Unprivileged host ids a root supervisor maps the namespace onto.
    pub sandbox_uid: u32,
    pub sandbox_gid: u32,
    pub ro_binds: Vec<PathBuf>,
}

/// Terminal observation of the child.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited(i32),
    Signaled(i32),
    SetupFailure(SetupStep),
}

/// Owned handle to a spawned child. The handle is the single owner of the
/// PID; dropping it without reaping kills and reaps the child.
pub struct ChildHandle {
    pid: Pid,
    start_pipe: Option<OwnedFd>,
    reaped: bool,
}

impl ChildHandle {
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Release the child past its start barrier. Call only after the PID is
    /// attached to its cgroup.
    pub fn start(&mut self) -> Result<(), LaunchError> {
        let fd = self
            .start_pipe
            .take()
            .ok_or_else(|| LaunchError::StartSignalFailed(already_started_error()))?;
        let written =
            unsafe { libc::write(fd.as_raw_fd(), [1u8].as_ptr() as *const libc::c_void, 1) };
        if written != 1 {
            return Err(LaunchError::StartSignalFailed(
                std::io::Error::last_os_error(),
            ));
        }
        // Dropping the write end afterwards lets the child observe EOF if it
        // ever re-reads.
        drop(fd);
        Ok(())
    }

    /// Blocking reap.
    pub fn wait(&mut self) -> Result<WaitOutcome, LaunchError> {
        loop {
            match waitpid(self.pid, None) {
                Ok(status) => {
                    if let Some(outcome) = outcome_from_status(status) {
                        self.reaped = true;
                        return Ok(outcome);
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(LaunchError::WaitFailed(errno)),
            }
        }
    }

    /// Non-blocking reap for the supervisor's poll loop.
    pub fn try_wait(&mut self) -> Result<Option<WaitOutcome>, LaunchError> {
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                if let Some(outcome) = outcome_from_status(status) {
                    self.reaped = true;
                    Ok(Some(outcome))
                } else {
                    Ok(None)
                }
            }
            Err(Errno::EINTR) => Ok(None),
            Err(errno) => Err(LaunchError::WaitFailed(errno)),
        }
    }

    pub fn kill(&self, signal: Signal) -> Result<(), LaunchError> {
        match kill(self.pid, signal) {
            Ok(()) => Ok(()),
            // Already gone is success for our purposes.
            Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(LaunchError::KillFailed {
                pid: self.pid.as_raw(),
                errno,
            }),
        }
    }
}

impl Drop for ChildHandle {
    fn drop(&mut self) {
        if !self.reaped {
            log::warn!("child {} dropped before reaping; killing", self.pid);
            let _ = kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
        }
    }
}

fn already_started_error() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        "child already released past its start barrier",
    )
}

fn outcome_from_status(status: WaitStatus) -> Option<WaitOutcome> {
    match status {
        WaitStatus::Exited(_, code) => Some(match SetupStep::from_exit_code(code) {
            Some(step) => WaitOutcome::SetupFailure(step),
            None => WaitOutcome::Exited(code),
        }),
        WaitStatus::Signaled(_, signal, _) => Some(WaitOutcome::Signaled(signal as i32)),
        _ => None,
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SandboxLauncher;

impl SandboxLauncher {
    pub fn new() -> Self {
        Self
    }

    /// Clone the child into its namespaces and write its ID maps. The child
    /// blocks on the start barrier until `ChildHandle::start`.
    pub fn spawn(&self, spec: &SpawnSpec) -> Result<ChildHandle, LaunchError> {
        let exec = cstring(spec.exec_path.to_string_lossy().as_ref())?;
        let mut argv = vec![exec.clone()];
        for arg in &spec.args {
            argv.push(cstring(arg)?);
        }
        let mut envp = Vec::with_capacity(spec.env.len());
        for (key, value) in &spec.env {
            envp.push(cstring(&format!("{}={}", key, value))?);
        }

        let (barrier_read, barrier_write) =
            nix::unistd::pipe().map_err(LaunchError::CloneFailed)?;
        let read_fd = barrier_read.as_raw_fd();
        let write_fd = barrier_write.as_raw_fd();

        let allow_network = !spec.namespaces.isolates_network();
        let ro_binds = spec.ro_binds.clone();

        let mut stack = vec![0u8; CHILD_STACK_SIZE];
        let child_body = Box::new(move || {
            child_main(
                read_fd,
                write_fd,
                &exec,
                &argv,
                &envp,
                &ro_binds,
                allow_network,
            )
        });

        let pid = unsafe {
            nix::sched::clone(
                child_body,
                &mut stack,
                spec.namespaces.clone_flags(),
                Some(libc::SIGCHLD),
            )
        }
        .map_err(LaunchError::CloneFailed)?;

        log::info!("cloned sandbox child pid {}", pid);

        // Parent keeps only the write end; the child's read must see EOF if
        // this process dies before releasing it.
        drop(barrier_read);

        let handle = ChildHandle {
            pid,
            start_pipe: Some(barrier_write),
            reaped: false,
        };

        // Maps must exist before the child can be released past its barrier.
        if let Err(e) = namespace::write_id_maps(pid, spec.sandbox_uid, spec.sandbox_gid) {
            let _ = handle.kill(Signal::SIGKILL);
            // Drop reaps.
            return Err(e);
        }

        Ok(handle)
    }
}

fn cstring(s: &str) -> Result<CString, LaunchError> {
    CString::new(s).map_err(|_| LaunchError::InvalidSpec(format!("string contains NUL byte: {:?}", s)))
}

/// Body of the cloned child. Runs with a borrowed stack; only returns a
/// setup-failure exit code, since success ends in execve.
fn child_main(
    barrier_read: libc::c_int,
    barrier_write: libc::c_int,
    exec: &CString,
    argv: &[CString],
    envp: &[CString],
    ro_binds: &[PathBuf],
    allow_network: bool,
) -> isize {
    // Close our copy of the write end so a dead supervisor reads as EOF.
    unsafe { libc::close(barrier_write) };

    let mut byte = [0u8; 1];
    let read = unsafe { libc::read(barrier_read, byte.as_mut_ptr() as *mut libc::c_void, 1) };
    if read != 1 {
        return SetupStep::StartBarrier.exit_code() as isize;
    }
    unsafe { libc::close(barrier_read) };

    if mount::make_root_private().is_err() {
        return SetupStep::PrivateRoot.exit_code() as isize;
    }
    if mount::mount_proc().is_err() {
        return SetupStep::ProcMount.exit_code() as isize;
    }
    if mount::bind_system_dirs_ro(ro_binds).is_err() {
        return SetupStep::BindMounts.exit_code() as isize;
    }
    if nix::unistd::sethostname(namespace::SANDBOX_HOSTNAME).is_err() {
        return SetupStep::Hostname.exit_code() as isize;
    }
    if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
        return SetupStep::NoNewPrivs.exit_code() as isize;
    }
    // The id map exposes exactly one id: 0 inside the namespace, the
    // unprivileged id outside. Pinning gid then uid clears any inherited
    // saved ids; host-side the process is already unprivileged.
    if nix::unistd::setgid(Gid::from_raw(0)).is_err()
        || nix::unistd::setuid(Uid::from_raw(0)).is_err()
    {
        return SetupStep::DropIds.exit_code() as isize;
    }
    if seccomp::install(allow_network).is_err() {
        return SetupStep::Seccomp.exit_code() as isize;
    }

    let _ = nix::unistd::execve(exec, argv, envp);
    SetupStep::Exec.exit_code() as isize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_codes_round_trip() {
        for step in [
            SetupStep::StartBarrier,
            SetupStep::PrivateRoot,
            SetupStep::ProcMount,
            SetupStep::BindMounts,
            SetupStep::Hostname,
            SetupStep::NoNewPrivs,
            SetupStep::DropIds,
            SetupStep::Seccomp,
            SetupStep::Exec,
        ] {
            assert_eq!(SetupStep::from_exit_code(step.exit_code()), Some(step));
        }
        assert_eq!(SetupStep::from_exit_code(0), None);
        assert_eq!(SetupStep::from_exit_code(1), None);
        assert_eq!(SetupStep::from_exit_code(127), None);
        assert_eq!(SetupStep::from_exit_code(137), None);
    }

    #[test]
    fn setup_failure_is_distinguished_from_plain_exit() {
        let failure = outcome_from_status(WaitStatus::Exited(
            Pid::from_raw(1),
            SetupStep::Seccomp.exit_code(),
        ));
        assert_eq!(
            failure,
            Some(WaitOutcome::SetupFailure(SetupStep::Seccomp))
        );

        let plain = outcome_from_status(WaitStatus::Exited(Pid::from_raw(1), 3));
        assert_eq!(plain, Some(WaitOutcome::Exited(3)));
    }

    #[test]
    fn signal_status_maps_to_signaled() {
        let outcome =
            outcome_from_status(WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGKILL, false));
        assert_eq!(outcome, Some(WaitOutcome::Signaled(libc::SIGKILL)));
    }
}
