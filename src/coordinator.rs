/// Job coordination: admission, cgroup limits, sandbox launch, wait and
/// release, in a fixed sequence with reverse-order rollback on failure.
///
/// One submit runs at a time. The safety engine is only entered under its
/// lock and never while a side effect is in flight: take lock, decide,
/// release lock, then perform filesystem and process work.
use crate::audit::{AuditLog, AuditRecord};
use crate::banker::{EngineSnapshot, ResourceVector, SafetyEngine};
use crate::cgroup::{CgroupHandle, CgroupManager, CpuQuota, MemoryLimit};
use crate::config::CoordinatorConfig;
use crate::launcher::{ChildHandle, SandboxLauncher, SpawnSpec, WaitOutcome};
use crate::namespace::NamespacePlan;
use crate::types::{
    ExitStatus, JobId, JobResult, JobState, JobStats, LaunchError, RejectionReason, Result,
    SafeboxError,
};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

pub const CGROUP_PREFIX: &str = "safebox_";

const CPU_PERIOD_US: u64 = 100_000;
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(5);
const DESTROY_RETRIES: u32 = 10;
const DESTROY_RETRY_PAUSE: Duration = Duration::from_millis(20);

/// One submission request.
#[derive(Clone, Debug)]
pub struct JobSpec {
    pub name: String,
    pub exec_path: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Declared maximum resource vector for admission.
    pub max: ResourceVector,
    /// Allocation requested up front.
    pub alloc: ResourceVector,
    /// CPU share written to cpu.max, in percent of one CPU; 0 means "max".
    pub limit_cpu_pct: u64,
    /// Memory limit written to memory.max, in bytes; 0 means "max".
    pub limit_mem_bytes: u64,
    pub timeout: Option<Duration>,
    /// Unshare the network namespace for this job.
    pub isolate_network: bool,
}

/// Job table entry; retained after release for audit/history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub name: String,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cgroup_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<ExitStatus>,
}

#[derive(Debug, Default)]
struct JobTable {
    next_id: JobId,
    records: BTreeMap<JobId, JobRecord>,
}

impl JobTable {
    fn allocate(&mut self, name: &str) -> JobId {
        let job_id = self.next_id;
        self.next_id += 1;
        self.records.insert(
            job_id,
            JobRecord {
                job_id,
                name: name.to_string(),
                state: JobState::Pending,
                cgroup_path: None,
                child_pid: None,
                exit_status: None,
            },
        );
        job_id
    }
}

/// Full state view for the `state` command.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoordinatorSnapshot {
    pub engine: EngineSnapshot,
    pub jobs: Vec<JobRecord>,
}

/// Owns the safety engine, the cgroup manager, the launcher and the job
/// table. Passed explicitly to every entry point; there are no globals.
pub struct JobCoordinator {
    config: CoordinatorConfig,
    engine: Mutex<SafetyEngine>,
    cgroups: CgroupManager,
    launcher: SandboxLauncher,
    jobs: Mutex<JobTable>,
    submit_gate: Mutex<()>,
    audit: Option<AuditLog>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl JobCoordinator {
    /// Build a coordinator against the real cgroup hierarchy.
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        CoordinatorConfig::ensure_supported_platform()?;
        let cgroups = CgroupManager::new(&config.cgroup_root)?;
        Self::assemble(config, cgroups)
    }

    /// Build a coordinator around an existing manager. Used by tests that
    /// point the manager at a scratch directory.
    pub fn with_cgroup_manager(config: CoordinatorConfig, cgroups: CgroupManager) -> Result<Self> {
        CoordinatorConfig::ensure_supported_platform()?;
        Self::assemble(config, cgroups)
    }

    fn assemble(config: CoordinatorConfig, cgroups: CgroupManager) -> Result<Self> {
        let engine = SafetyEngine::new(
            ResourceVector::new(config.totals.clone()),
            config.resource_names.clone(),
        )
        .map_err(SafeboxError::Admission)?;
        let audit = match &config.audit_log {
            Some(path) => Some(AuditLog::open(path)?),
            None => None,
        };
        Ok(Self {
            config,
            engine: Mutex::new(engine),
            cgroups,
            launcher: SandboxLauncher::new(),
            jobs: Mutex::new(JobTable::default()),
            submit_gate: Mutex::new(()),
            audit,
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Run one job end to end. Serialized with any concurrent submits.
    pub fn submit(&self, spec: JobSpec) -> Result<JobResult> {
        let _serialized = lock(&self.submit_gate);

        let job_id = lock(&self.jobs).allocate(&spec.name);
        log::info!("job {} ({}): submitted", job_id, spec.name);

        // Admission decision under the engine lock; no side effects yet.
        let safe_sequence = {
            let mut engine = lock(&self.engine);
            let arity = engine.arity();
            if let Err(reason) =
                engine.declare(job_id, &spec.name, spec.max.clone(), ResourceVector::zero(arity))
            {
                drop(engine);
                return Ok(self.finish_rejected(job_id, &spec, reason));
            }
            match engine.request(job_id, &spec.alloc) {
                crate::types::Decision::Granted { safe_sequence } => safe_sequence,
                crate::types::Decision::Rejected(reason) => {
                    let _ = engine.release_all(job_id);
                    drop(engine);
                    return Ok(self.finish_rejected(job_id, &spec, reason));
                }
            }
        };
        self.set_state(job_id, JobState::Admitted);
        log::info!(
            "job {}: admitted, safe sequence {:?}",
            job_id,
            safe_sequence
        );

        // Cgroup create + limits.
        let group = format!("{}{}", CGROUP_PREFIX, job_id);
        let mut handle = match self.setup_cgroup(&group, &spec) {
            Ok(handle) => handle,
            Err(e) => {
                self.release_allocation(job_id);
                self.set_state(job_id, JobState::Released);
                return Err(e.into());
            }
        };
        self.set_cgroup_path(job_id, handle.path().to_path_buf());

        // Spawn, attach, release the start barrier.
        let mut child = match self.spawn_child(&spec, &handle) {
            Ok(child) => child,
            Err(e) => {
                self.rollback_cgroup(&mut handle);
                self.release_allocation(job_id);
                self.set_state(job_id, JobState::Released);
                return Err(e.into());
            }
        };
        self.set_child_pid(job_id, child.pid());
        self.set_state(job_id, JobState::Running);
        log::info!("job {}: running as pid {}", job_id, child.pid());

        // Wait (with optional timeout escalation), then collect evidence.
        let outcome = match self.wait_with_timeout(&mut child, spec.timeout) {
            Ok(outcome) => outcome,
            Err(e) => {
                let _ = child.kill(Signal::SIGKILL);
                let _ = child.wait();
                self.rollback_cgroup(&mut handle);
                self.release_allocation(job_id);
                self.set_state(job_id, JobState::Released);
                return Err(e.into());
            }
        };

        let stats = self.cgroups.stats(&handle).unwrap_or_else(|e| {
            log::warn!("job {}: stats unavailable: {}", job_id, e);
            Default::default()
        });
        let oom_killed = self.cgroups.oom_kill_count(&handle).unwrap_or(0) > 0;

        let exit = match outcome {
            WaitOutcome::Exited(code) => ExitStatus::Exited(code),
            WaitOutcome::Signaled(signo) => ExitStatus::Signaled(signo),
            WaitOutcome::SetupFailure(step) => {
                log::warn!("job {}: child setup failed at {}", job_id, step);
                ExitStatus::SetupFailed(step.exit_code())
            }
        };
        self.set_exit(job_id, exit);
        self.set_state(job_id, JobState::Exited);
        log::info!("job {}: {:?}", job_id, exit);

        // Teardown in reverse order: cgroup first, then the allocation. The
        // allocation is returned even when cgroup removal fails, so no error
        // path strands resources in the engine.
        let teardown = self.teardown_cgroup(&mut handle);
        self.release_allocation(job_id);
        self.set_state(job_id, JobState::Released);
        teardown?;

        let result = JobResult {
            job_id,
            admitted: true,
            rejection_reason: None,
            safe_sequence: Some(safe_sequence),
            exit: Some(exit),
            stats: Some(JobStats {
                memory_peak: stats.memory_peak,
                cpu_usage_us: stats.cpu_usage_us,
            }),
            oom_killed,
        };
        self.append_audit(&spec, &result);
        Ok(result)
    }

    /// Release a held allocation and tear down the job's cgroup if one is
    /// still present.
    pub fn release(&self, job_id: JobId) -> Result<()> {
        let _serialized = lock(&self.submit_gate);

        {
            let mut engine = lock(&self.engine);
            match engine.release_all(job_id) {
                Ok(_) | Err(RejectionReason::UnknownJob) => {}
                Err(reason) => return Err(SafeboxError::Admission(reason)),
            }
        }

        let group = format!("{}{}", CGROUP_PREFIX, job_id);
        if let Some(mut handle) = self.cgroups.open(&group)? {
            self.teardown_cgroup(&mut handle)?;
        }
        self.set_state(job_id, JobState::Released);
        Ok(())
    }

    /// Read-only snapshot of the engine and the job table.
    pub fn state(&self) -> CoordinatorSnapshot {
        let engine = lock(&self.engine).snapshot();
        let jobs = lock(&self.jobs).records.values().cloned().collect();
        CoordinatorSnapshot { engine, jobs }
    }

    /// Deadlock detection over current allocations.
    pub fn detect_deadlock(&self) -> (bool, Vec<JobId>) {
        lock(&self.engine).detect_deadlock()
    }

    fn finish_rejected(&self, job_id: JobId, spec: &JobSpec, reason: RejectionReason) -> JobResult {
        log::warn!("job {}: rejected ({})", job_id, reason);
        self.set_state(job_id, JobState::Released);
        let result = JobResult::rejected(job_id, reason);
        self.append_audit(spec, &result);
        result
    }

    fn setup_cgroup(
        &self,
        group: &str,
        spec: &JobSpec,
    ) -> std::result::Result<CgroupHandle, crate::types::CgroupError> {
        let mut handle = self.cgroups.create(group)?;

        let memory = if spec.limit_mem_bytes == 0 {
            MemoryLimit::Max
        } else {
            MemoryLimit::Bytes(spec.limit_mem_bytes)
        };
        let cpu = if spec.limit_cpu_pct == 0 {
            CpuQuota::Max
        } else {
            CpuQuota::Micros(spec.limit_cpu_pct * CPU_PERIOD_US / 100)
        };

        if let Err(e) = self
            .cgroups
            .set_memory_max(&handle, memory)
            .and_then(|_| self.cgroups.set_cpu_max(&handle, cpu, CPU_PERIOD_US))
        {
            self.rollback_cgroup(&mut handle);
            return Err(e);
        }
        Ok(handle)
    }

    fn spawn_child(
        &self,
        spec: &JobSpec,
        handle: &CgroupHandle,
    ) -> std::result::Result<ChildHandle, LaunchError> {
        let namespaces = NamespacePlan::new(spec.isolate_network && self.config.allow_newnet);

        let mut env = vec![(
            "PATH".to_string(),
            "/usr/local/bin:/usr/bin:/bin".to_string(),
        )];
        env.extend(spec.env.iter().cloned());

        let spawn_spec = SpawnSpec {
            exec_path: spec.exec_path.clone(),
            args: spec.args.clone(),
            env,
            namespaces,
            sandbox_uid: self.config.unpriv_uid,
            sandbox_gid: self.config.unpriv_gid,
            ro_binds: self.config.ro_binds.clone(),
        };

        let mut child = self.launcher.spawn(&spawn_spec)?;

        // The child must land in its cgroup before its first instruction
        // after exec; attach happens while it is parked at the barrier.
        if let Err(e) = self.cgroups.attach(handle, child.pid()) {
            let _ = child.kill(Signal::SIGKILL);
            let _ = child.wait();
            return Err(LaunchError::AttachFailed(e));
        }

        if let Err(e) = child.start() {
            let _ = child.kill(Signal::SIGKILL);
            let _ = child.wait();
            return Err(e);
        }

        Ok(child)
    }

    fn wait_with_timeout(
        &self,
        child: &mut ChildHandle,
        timeout: Option<Duration>,
    ) -> std::result::Result<WaitOutcome, LaunchError> {
        let started = Instant::now();
        let mut term_sent_at: Option<Instant> = None;

        loop {
            if let Some(outcome) = child.try_wait()? {
                return Ok(outcome);
            }

            match term_sent_at {
                None => {
                    if let Some(limit) = timeout {
                        if started.elapsed() >= limit {
                            log::warn!(
                                "child {} exceeded wall-clock timeout, sending SIGTERM",
                                child.pid()
                            );
                            child.kill(Signal::SIGTERM)?;
                            term_sent_at = Some(Instant::now());
                        }
                    }
                }
                Some(at) => {
                    if at.elapsed() >= self.config.kill_grace {
                        log::warn!("child {} ignored SIGTERM, sending SIGKILL", child.pid());
                        child.kill(Signal::SIGKILL)?;
                        return child.wait();
                    }
                }
            }

            thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    /// Destroy with retries: descendants of a dead pid-namespace init may
    /// need a moment to be reaped before cgroup.procs empties.
    fn teardown_cgroup(&self, handle: &mut CgroupHandle) -> Result<()> {
        let mut last_err = None;
        for attempt in 0..DESTROY_RETRIES {
            match self.cgroups.destroy(handle) {
                Ok(()) => return Ok(()),
                Err(e @ crate::types::CgroupError::NotEmpty(_)) => {
                    log::debug!("cgroup not yet empty (attempt {}): {}", attempt + 1, e);
                    last_err = Some(e);
                    thread::sleep(DESTROY_RETRY_PAUSE);
                }
                Err(e) => return Err(e.into()),
            }
        }
        match last_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Best-effort cgroup removal on error paths; the original error stays
    /// the primary failure.
    fn rollback_cgroup(&self, handle: &mut CgroupHandle) {
        if let Err(e) = self.teardown_cgroup(handle) {
            log::error!("rollback failed to remove cgroup {}: {}", handle.path().display(), e);
        }
    }

    fn release_allocation(&self, job_id: JobId) {
        let mut engine = lock(&self.engine);
        if let Err(reason) = engine.release_all(job_id) {
            log::error!("job {}: release failed: {}", job_id, reason);
        }
    }

    fn set_state(&self, job_id: JobId, state: JobState) {
        if let Some(record) = lock(&self.jobs).records.get_mut(&job_id) {
            record.state = state;
        }
    }

    fn set_cgroup_path(&self, job_id: JobId, path: PathBuf) {
        if let Some(record) = lock(&self.jobs).records.get_mut(&job_id) {
            record.cgroup_path = Some(path);
        }
    }

    fn set_child_pid(&self, job_id: JobId, pid: u32) {
        if let Some(record) = lock(&self.jobs).records.get_mut(&job_id) {
            record.child_pid = Some(pid);
        }
    }

    fn set_exit(&self, job_id: JobId, exit: ExitStatus) {
        if let Some(record) = lock(&self.jobs).records.get_mut(&job_id) {
            record.exit_status = Some(exit);
        }
    }

    fn append_audit(&self, spec: &JobSpec, result: &JobResult) {
        let Some(audit) = &self.audit else {
            return;
        };
        let mut record = AuditRecord::new(result.job_id, &spec.name);
        record.admitted = result.admitted;
        record.rejection_reason = result.rejection_reason.clone();
        record.exit = result.exit;
        record.stats = result.stats.unwrap_or_default();
        record.oom_killed = result.oom_killed;
        if let Err(e) = audit.append(&record) {
            log::error!("failed to append audit record for job {}: {}", result.job_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Decision;
    use tempfile::TempDir;

    fn test_coordinator(totals: Vec<u64>) -> (TempDir, JobCoordinator) {
        let dir = TempDir::new().unwrap();
        let names = (0..totals.len()).map(|i| format!("R{}", i)).collect();
        let config = CoordinatorConfig {
            cgroup_root: dir.path().to_path_buf(),
            totals,
            resource_names: names,
            ..CoordinatorConfig::default()
        };
        let cgroups = CgroupManager::with_root(dir.path());
        let coordinator = JobCoordinator::with_cgroup_manager(config, cgroups).unwrap();
        (dir, coordinator)
    }

    fn job_spec(max: &[u64], alloc: &[u64]) -> JobSpec {
        JobSpec {
            name: "test-job".to_string(),
            exec_path: PathBuf::from("/bin/true"),
            args: Vec::new(),
            env: Vec::new(),
            max: ResourceVector::new(max.to_vec()),
            alloc: ResourceVector::new(alloc.to_vec()),
            limit_cpu_pct: 10,
            limit_mem_bytes: 32 * 1024 * 1024,
            timeout: None,
            isolate_network: true,
        }
    }

    #[test]
    fn rejected_submission_has_no_side_effects() {
        let (dir, coordinator) = test_coordinator(vec![10, 5]);

        // max exceeds totals: rejected at declare.
        let result = coordinator.submit(job_spec(&[20, 5], &[1, 1])).unwrap();
        assert!(!result.admitted);
        assert!(result.rejection_reason.is_some());

        // No cgroup directory was created.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(CGROUP_PREFIX))
            .collect();
        assert!(leftovers.is_empty());

        // Allocation fully returned.
        let snapshot = coordinator.state();
        assert_eq!(snapshot.engine.available, vec![10, 5]);
        assert_eq!(snapshot.engine.jobs.len(), 0);
        assert_eq!(snapshot.jobs[0].state, JobState::Released);
    }

    #[test]
    fn unsafe_request_is_rejected_with_reason() {
        let (_dir, coordinator) = test_coordinator(vec![10, 5]);

        // Pre-load the engine so a further grab fits in available but
        // leaves no safe sequence.
        {
            let mut engine = lock(&coordinator.engine);
            engine
                .declare(
                    100,
                    "holder",
                    ResourceVector::new(vec![10, 5]),
                    ResourceVector::new(vec![6, 3]),
                )
                .unwrap();
        }

        let result = coordinator.submit(job_spec(&[5, 3], &[3, 1])).unwrap();
        assert!(!result.admitted);
        assert_eq!(
            result.rejection_reason.as_deref(),
            Some("request would leave an unsafe state")
        );

        // The holder's allocation is untouched and the submitter is gone.
        let snapshot = coordinator.state();
        assert_eq!(snapshot.engine.jobs.len(), 1);
        assert_eq!(snapshot.engine.available, vec![4, 2]);
    }

    #[test]
    fn cgroup_failure_rolls_back_allocation() {
        let (dir, coordinator) = test_coordinator(vec![10, 5]);

        // A file squatting on the group path makes create fail.
        let first_group = format!("{}0", CGROUP_PREFIX);
        std::fs::write(dir.path().join(&first_group), b"squatter").unwrap();

        let err = coordinator.submit(job_spec(&[5, 3], &[1, 1])).unwrap_err();
        match err {
            SafeboxError::Cgroup(_) => {}
            other => panic!("expected cgroup error, got {:?}", other),
        }

        let snapshot = coordinator.state();
        assert_eq!(snapshot.engine.available, vec![10, 5]);
        assert_eq!(snapshot.engine.jobs.len(), 0);
        assert_eq!(snapshot.jobs[0].state, JobState::Released);
    }

    #[test]
    fn release_returns_allocation_and_removes_group() {
        let (dir, coordinator) = test_coordinator(vec![10, 5]);

        {
            let mut engine = lock(&coordinator.engine);
            engine
                .declare(
                    3,
                    "held",
                    ResourceVector::new(vec![4, 2]),
                    ResourceVector::new(vec![4, 2]),
                )
                .unwrap();
        }
        let group_dir = dir.path().join(format!("{}3", CGROUP_PREFIX));
        std::fs::create_dir(&group_dir).unwrap();

        coordinator.release(3).unwrap();
        assert!(!group_dir.exists());
        assert_eq!(coordinator.state().engine.available, vec![10, 5]);
    }

    #[test]
    fn job_ids_ascend() {
        let (_dir, coordinator) = test_coordinator(vec![10, 5]);
        let a = coordinator.submit(job_spec(&[20, 9], &[1, 1])).unwrap();
        let b = coordinator.submit(job_spec(&[20, 9], &[1, 1])).unwrap();
        assert!(b.job_id > a.job_id);
    }

    #[test]
    fn zero_limits_write_max() {
        let (dir, coordinator) = test_coordinator(vec![10, 5]);
        let mut spec = job_spec(&[5, 3], &[1, 1]);
        spec.limit_cpu_pct = 0;
        spec.limit_mem_bytes = 0;

        let handle = coordinator
            .setup_cgroup(&format!("{}9", CGROUP_PREFIX), &spec)
            .map(|mut handle| {
                let group = dir.path().join(format!("{}9", CGROUP_PREFIX));
                assert_eq!(std::fs::read_to_string(group.join("memory.max")).unwrap(), "max");
                assert_eq!(
                    std::fs::read_to_string(group.join("cpu.max")).unwrap(),
                    format!("max {}", CPU_PERIOD_US)
                );
                for file in ["memory.max", "cpu.max"] {
                    std::fs::remove_file(group.join(file)).unwrap();
                }
                coordinator.teardown_cgroup(&mut handle).unwrap();
            });
        handle.unwrap();
    }

    #[test]
    fn engine_decisions_are_visible_across_submits() {
        let (_dir, coordinator) = test_coordinator(vec![10, 5]);
        {
            let mut engine = lock(&coordinator.engine);
            engine
                .declare(
                    50,
                    "first",
                    ResourceVector::new(vec![6, 3]),
                    ResourceVector::new(vec![0, 0]),
                )
                .unwrap();
            match engine.request(50, &ResourceVector::new(vec![6, 3])) {
                Decision::Granted { .. } => {}
                other => panic!("expected grant, got {:?}", other),
            }
        }
        // The second submission observes the first's allocation.
        let snapshot = coordinator.state();
        assert_eq!(snapshot.engine.available, vec![4, 2]);
    }
}
