/// Command-line surface of the coordinator: submit, state, release.
///
/// Exit codes: 0 success, 2 admission rejected, 3 cgroup setup failed,
/// 4 spawn failed, 5 child setup failure, 6 child killed by seccomp,
/// 128+signo for a signaled child; a nonzero child exit code is propagated
/// as-is.
use crate::banker::ResourceVector;
use crate::config::CoordinatorConfig;
use crate::coordinator::{JobCoordinator, JobSpec};
use crate::types::{ExitStatus, JobResult, SafeboxError};
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

const EXIT_REJECTED: i32 = 2;
const EXIT_CGROUP_FAILED: i32 = 3;
const EXIT_SPAWN_FAILED: i32 = 4;
const EXIT_SETUP_FAILED: i32 = 5;
const EXIT_SECCOMP_KILLED: i32 = 6;

#[derive(Parser)]
#[command(
    name = "safebox",
    author,
    version,
    about = "Deadlock-aware secure execution runtime"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a job: admission check, cgroup limits, sandboxed execution
    Submit {
        /// Target executable path
        #[arg(long)]
        exec: PathBuf,
        /// Whitespace-separated arguments for the target
        #[arg(long, default_value = "")]
        args: String,
        /// Declared maximum resource vector, e.g. "50,256"
        #[arg(long)]
        max: String,
        /// Requested allocation vector, e.g. "20,128"
        #[arg(long)]
        alloc: String,
        /// CPU limit as percent of one CPU (0 = unlimited)
        #[arg(long = "limit-cpu")]
        limit_cpu: u64,
        /// Memory limit in bytes (0 = unlimited)
        #[arg(long = "limit-mem")]
        limit_mem: u64,
        /// Wall-clock timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Human-readable job name
        #[arg(long)]
        name: Option<String>,
        /// Share the host network namespace instead of unsharing it
        #[arg(long = "no-net")]
        no_net: bool,
    },
    /// Print the admission-controller state snapshot as JSON
    State,
    /// Release a job's allocation and tear down its cgroup
    Release {
        /// Job id to release
        job_id: u32,
    },
}

pub fn run() -> Result<()> {
    env_logger::init();
    CoordinatorConfig::ensure_supported_platform()?;

    let cli = Cli::parse();
    let config = CoordinatorConfig::from_env()?;
    let coordinator = match JobCoordinator::new(config) {
        Ok(coordinator) => coordinator,
        Err(e @ SafeboxError::Cgroup(_)) => {
            eprintln!("Error: {}", e);
            std::process::exit(EXIT_CGROUP_FAILED);
        }
        Err(e) => return Err(e.into()),
    };

    match cli.command {
        Commands::Submit {
            exec,
            args,
            max,
            alloc,
            limit_cpu,
            limit_mem,
            timeout,
            name,
            no_net,
        } => {
            let max: ResourceVector = max
                .parse()
                .map_err(|e| anyhow::anyhow!("--max: {}", e))?;
            let alloc: ResourceVector = alloc
                .parse()
                .map_err(|e| anyhow::anyhow!("--alloc: {}", e))?;
            let name = name.unwrap_or_else(|| {
                exec.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "job".to_string())
            });

            let spec = JobSpec {
                name,
                exec_path: exec,
                args: args.split_whitespace().map(str::to_string).collect(),
                env: Vec::new(),
                max,
                alloc,
                limit_cpu_pct: limit_cpu,
                limit_mem_bytes: limit_mem,
                timeout: timeout.map(Duration::from_secs),
                isolate_network: !no_net,
            };

            match coordinator.submit(spec) {
                Ok(result) => {
                    println!("{}", serde_json::to_string_pretty(&result)?);
                    std::process::exit(exit_code_for(&result));
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(exit_code_for_error(&e));
                }
            }
        }
        Commands::State => {
            let snapshot = coordinator.state();
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
        Commands::Release { job_id } => {
            coordinator.release(job_id)?;
            eprintln!("Released job {}", job_id);
            Ok(())
        }
    }
}

fn exit_code_for(result: &JobResult) -> i32 {
    if !result.admitted {
        return EXIT_REJECTED;
    }
    match result.exit {
        Some(ExitStatus::SetupFailed(_)) => EXIT_SETUP_FAILED,
        Some(ExitStatus::Signaled(signo)) if signo == libc::SIGSYS => EXIT_SECCOMP_KILLED,
        Some(ExitStatus::Signaled(signo)) => 128 + signo,
        Some(ExitStatus::Exited(code)) => code,
        None => 0,
    }
}

fn exit_code_for_error(error: &SafeboxError) -> i32 {
    match error {
        SafeboxError::Admission(_) => EXIT_REJECTED,
        SafeboxError::Cgroup(_) => EXIT_CGROUP_FAILED,
        SafeboxError::Launch(_) => EXIT_SPAWN_FAILED,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobStats, RejectionReason};

    fn admitted_result(exit: ExitStatus) -> JobResult {
        JobResult {
            job_id: 1,
            admitted: true,
            rejection_reason: None,
            safe_sequence: Some(vec![1]),
            exit: Some(exit),
            stats: Some(JobStats::default()),
            oom_killed: false,
        }
    }

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(
            exit_code_for(&JobResult::rejected(1, RejectionReason::UnsafeState)),
            EXIT_REJECTED
        );
        assert_eq!(exit_code_for(&admitted_result(ExitStatus::Exited(0))), 0);
        assert_eq!(exit_code_for(&admitted_result(ExitStatus::Exited(7))), 7);
        assert_eq!(
            exit_code_for(&admitted_result(ExitStatus::Signaled(libc::SIGKILL))),
            128 + libc::SIGKILL
        );
        assert_eq!(
            exit_code_for(&admitted_result(ExitStatus::Signaled(libc::SIGSYS))),
            EXIT_SECCOMP_KILLED
        );
        assert_eq!(
            exit_code_for(&admitted_result(ExitStatus::SetupFailed(135))),
            EXIT_SETUP_FAILED
        );
    }

    #[test]
    fn error_codes_match_contract() {
        assert_eq!(
            exit_code_for_error(&SafeboxError::Admission(RejectionReason::UnknownJob)),
            EXIT_REJECTED
        );
        assert_eq!(
            exit_code_for_error(&SafeboxError::Config("x".to_string())),
            1
        );
    }
}
