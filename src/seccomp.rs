/// Seccomp-BPF syscall policy: a fixed, audited allow-list with default
/// KILL_PROCESS, plus distinguishable deny actions for testability.
///
/// Filter layout:
///
/// ```text
/// [0-2]      architecture guard (x86_64, kill otherwise)
/// [3]        load syscall number
/// [4]        reboot           -> RET ERRNO(EPERM)
/// [5-8]      mount family     -> RET TRAP
/// [9]        uname            -> RET LOG (logged, then allowed)
/// [10..10+n] allow-list       -> RET ALLOW
/// [10+n]     RET KILL_PROCESS (default)
/// [11+n]     RET ALLOW
/// [12+n]     RET ERRNO(EPERM)
/// [13+n]     RET TRAP
/// [14+n]     RET LOG
/// ```
///
/// Widening the allow-list requires an audit note; the table below is the
/// normative policy, not a convenience default.
use std::io;

const SECCOMP_SET_MODE_FILTER: libc::c_long = 1;

const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
const SECCOMP_RET_TRAP: u32 = 0x0003_0000;
const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
const SECCOMP_RET_LOG: u32 = 0x7ffc_0000;
const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;

const AUDIT_ARCH_X86_64: u32 = 0xc000_003e;

// Classic BPF opcode fields.
const BPF_LD: u16 = 0x00;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JMP: u16 = 0x05;
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;
const BPF_RET: u16 = 0x06;

// seccomp_data field offsets.
const OFFSET_SYSCALL_NR: u32 = 0;
const OFFSET_ARCH: u32 = 4;

// BPF jump offsets are u8; the table must leave headroom for the dispatch
// preamble and the return slots.
const MAX_ALLOWLIST_LEN: usize = 200;

const fn stmt(code: u16, k: u32) -> libc::sock_filter {
    libc::sock_filter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

const fn jeq(k: u32, jt: u8) -> libc::sock_filter {
    libc::sock_filter {
        code: BPF_JMP | BPF_JEQ | BPF_K,
        jt,
        jf: 0,
        k,
    }
}

#[cfg(target_arch = "x86_64")]
mod table {
    /// Syscalls the sandboxed target may always use.
    pub const BASE_ALLOWED: &[libc::c_long] = &[
        // I/O
        libc::SYS_read,
        libc::SYS_write,
        libc::SYS_readv,
        libc::SYS_writev,
        libc::SYS_pread64,
        libc::SYS_pwrite64,
        libc::SYS_lseek,
        libc::SYS_close,
        libc::SYS_readlink,
        libc::SYS_readlinkat,
        libc::SYS_fstat,
        libc::SYS_newfstatat,
        libc::SYS_stat,
        libc::SYS_lstat,
        libc::SYS_statx,
        libc::SYS_ioctl,
        // file ops
        libc::SYS_open,
        libc::SYS_openat,
        libc::SYS_access,
        libc::SYS_faccessat,
        libc::SYS_faccessat2,
        libc::SYS_getdents,
        libc::SYS_getdents64,
        libc::SYS_getcwd,
        libc::SYS_fcntl,
        libc::SYS_chdir,
        libc::SYS_fchdir,
        libc::SYS_mkdir,
        libc::SYS_mkdirat,
        libc::SYS_rmdir,
        libc::SYS_unlink,
        libc::SYS_unlinkat,
        libc::SYS_rename,
        libc::SYS_renameat,
        libc::SYS_renameat2,
        libc::SYS_link,
        libc::SYS_linkat,
        libc::SYS_symlink,
        libc::SYS_symlinkat,
        libc::SYS_chmod,
        libc::SYS_fchmod,
        libc::SYS_fchmodat,
        libc::SYS_truncate,
        libc::SYS_ftruncate,
        // pipes and fd duplication (needed by shells regardless of the
        // network policy)
        libc::SYS_pipe,
        libc::SYS_pipe2,
        libc::SYS_dup,
        libc::SYS_dup2,
        libc::SYS_dup3,
        // memory
        libc::SYS_brk,
        libc::SYS_mmap,
        libc::SYS_munmap,
        libc::SYS_mremap,
        libc::SYS_mprotect,
        libc::SYS_madvise,
        libc::SYS_msync,
        libc::SYS_mincore,
        // process / threads
        libc::SYS_clone,
        libc::SYS_clone3,
        libc::SYS_fork,
        libc::SYS_vfork,
        libc::SYS_execve,
        libc::SYS_execveat,
        libc::SYS_wait4,
        libc::SYS_waitid,
        libc::SYS_exit,
        libc::SYS_exit_group,
        libc::SYS_getpid,
        libc::SYS_getppid,
        libc::SYS_gettid,
        libc::SYS_set_tid_address,
        libc::SYS_set_robust_list,
        libc::SYS_get_robust_list,
        libc::SYS_rseq,
        libc::SYS_futex,
        libc::SYS_futex_waitv,
        libc::SYS_arch_prctl,
        libc::SYS_prctl,
        libc::SYS_sched_yield,
        libc::SYS_sched_getaffinity,
        libc::SYS_sched_setaffinity,
        libc::SYS_sched_getparam,
        libc::SYS_sched_setparam,
        libc::SYS_sched_getscheduler,
        libc::SYS_sched_setscheduler,
        libc::SYS_sched_get_priority_max,
        libc::SYS_sched_get_priority_min,
        libc::SYS_getrusage,
        libc::SYS_prlimit64,
        libc::SYS_getrlimit,
        libc::SYS_setrlimit,
        // signals
        libc::SYS_rt_sigaction,
        libc::SYS_rt_sigprocmask,
        libc::SYS_rt_sigreturn,
        libc::SYS_sigaltstack,
        libc::SYS_kill,
        libc::SYS_tkill,
        libc::SYS_tgkill,
        // time / random
        libc::SYS_clock_gettime,
        libc::SYS_clock_nanosleep,
        libc::SYS_nanosleep,
        libc::SYS_gettimeofday,
        libc::SYS_getrandom,
        libc::SYS_time,
        // polling
        libc::SYS_poll,
        libc::SYS_ppoll,
        libc::SYS_select,
        libc::SYS_pselect6,
        libc::SYS_epoll_create,
        libc::SYS_epoll_create1,
        libc::SYS_epoll_ctl,
        libc::SYS_epoll_wait,
        libc::SYS_epoll_pwait,
        libc::SYS_eventfd,
        libc::SYS_eventfd2,
        libc::SYS_signalfd,
        libc::SYS_signalfd4,
        libc::SYS_timerfd_create,
        libc::SYS_timerfd_settime,
        libc::SYS_timerfd_gettime,
        // identity
        libc::SYS_getuid,
        libc::SYS_geteuid,
        libc::SYS_getgid,
        libc::SYS_getegid,
        libc::SYS_getgroups,
        libc::SYS_setuid,
        libc::SYS_setgid,
        libc::SYS_setreuid,
        libc::SYS_setregid,
        libc::SYS_setresuid,
        libc::SYS_setresgid,
        libc::SYS_setgroups,
        libc::SYS_capget,
        libc::SYS_capset,
    ];

    /// Socket-family syscalls, appended only when the child shares the host
    /// network namespace.
    pub const NETWORK_ALLOWED: &[libc::c_long] = &[
        libc::SYS_socket,
        libc::SYS_socketpair,
        libc::SYS_connect,
        libc::SYS_bind,
        libc::SYS_listen,
        libc::SYS_accept,
        libc::SYS_accept4,
        libc::SYS_sendto,
        libc::SYS_sendmsg,
        libc::SYS_sendmmsg,
        libc::SYS_recvfrom,
        libc::SYS_recvmsg,
        libc::SYS_recvmmsg,
        libc::SYS_getsockname,
        libc::SYS_getpeername,
        libc::SYS_getsockopt,
        libc::SYS_setsockopt,
        libc::SYS_shutdown,
    ];

    /// Denied with EPERM so the target observes a failure, not a kill.
    pub const EPERM_SYSCALL: libc::c_long = libc::SYS_reboot;

    /// Denied with SIGSYS traps, observable in tests.
    pub const TRAP_SYSCALLS: &[libc::c_long] = &[
        libc::SYS_mount,
        libc::SYS_umount2,
        libc::SYS_pivot_root,
        libc::SYS_chroot,
    ];

    /// Benign but monitored: logged, then allowed.
    pub const LOG_SYSCALL: libc::c_long = libc::SYS_uname;
}

/// Assemble the BPF program for the current policy.
#[cfg(target_arch = "x86_64")]
pub fn build_filter(allow_network: bool) -> Vec<libc::sock_filter> {
    let mut allowed: Vec<libc::c_long> = table::BASE_ALLOWED.to_vec();
    if allow_network {
        allowed.extend_from_slice(table::NETWORK_ALLOWED);
    }
    let n = allowed.len();
    let t = table::TRAP_SYSCALLS.len();
    assert!(
        n <= MAX_ALLOWLIST_LEN,
        "allow-list too large for u8 jump offsets: {}",
        n
    );

    let mut filter = Vec::with_capacity(n + t + 11);

    // Architecture guard.
    filter.push(stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_ARCH));
    filter.push(jeq(AUDIT_ARCH_X86_64, 1));
    filter.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS));

    // Syscall number dispatch.
    filter.push(stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_SYSCALL_NR));

    // Return slots sit after the allow-list: KILL at 10+n, ALLOW at 11+n,
    // ERRNO at 12+n, TRAP at 13+n, LOG at 14+n. jt = target - index - 1.
    filter.push(jeq(table::EPERM_SYSCALL as u32, (3 + t + n) as u8));
    for (i, &nr) in table::TRAP_SYSCALLS.iter().enumerate() {
        filter.push(jeq(nr as u32, (3 + t + n - i) as u8));
    }
    filter.push(jeq(table::LOG_SYSCALL as u32, (4 + n) as u8));

    for (i, &nr) in allowed.iter().enumerate() {
        filter.push(jeq(nr as u32, (n - i) as u8));
    }

    filter.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS));
    filter.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));
    filter.push(stmt(
        BPF_RET | BPF_K,
        SECCOMP_RET_ERRNO | libc::EPERM as u32,
    ));
    filter.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_TRAP));
    filter.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_LOG));

    filter
}

/// Install the policy on the calling thread via seccomp(2). Requires
/// no_new_privs to already be set; this is the last privileged operation
/// before execve.
pub fn install(allow_network: bool) -> io::Result<()> {
    #[cfg(target_arch = "x86_64")]
    {
        let filter = build_filter(allow_network);
        let prog = libc::sock_fprog {
            len: filter.len() as libc::c_ushort,
            filter: filter.as_ptr() as *mut libc::sock_filter,
        };
        let rc = unsafe {
            libc::syscall(
                libc::SYS_seccomp,
                SECCOMP_SET_MODE_FILTER,
                0 as libc::c_long,
                &prog as *const libc::sock_fprog,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = allow_network;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "seccomp policy is only assembled for x86_64",
        ))
    }
}

/// Whether the kernel exposes seccomp at all.
pub fn is_supported() -> bool {
    unsafe { libc::prctl(libc::PR_GET_SECCOMP, 0, 0, 0, 0) >= 0 }
}
