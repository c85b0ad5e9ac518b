/// Banker-style admission control over a fixed-arity resource vector.
///
/// The engine keeps declared totals, per-job maxima and allocations, and
/// answers "is this request grantable?" by checking that a safe sequence
/// still exists after tentatively applying the request. Jobs are scanned
/// in ascending id order, which makes the reported sequence deterministic.
use crate::types::{Decision, JobId, RejectionReason};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Fixed-arity vector of non-negative resource quantities. Arity is fixed
/// when the engine is initialized; every later vector is validated against
/// it at the boundary rather than silently truncated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceVector(Vec<u64>);

impl ResourceVector {
    pub fn new(slots: Vec<u64>) -> Self {
        Self(slots)
    }

    pub fn zero(arity: usize) -> Self {
        Self(vec![0; arity])
    }

    pub fn arity(&self) -> usize {
        self.0.len()
    }

    pub fn slots(&self) -> &[u64] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&v| v == 0)
    }

    /// Componentwise `self <= other`. Callers guarantee equal arity.
    pub fn le(&self, other: &Self) -> bool {
        self.0.iter().zip(&other.0).all(|(a, b)| a <= b)
    }

    fn add_assign(&mut self, other: &Self) {
        for (slot, add) in self.0.iter_mut().zip(&other.0) {
            *slot += add;
        }
    }

    /// Componentwise subtraction. Callers guarantee `other <= self`.
    fn sub_assign(&mut self, other: &Self) {
        for (slot, sub) in self.0.iter_mut().zip(&other.0) {
            *slot -= sub;
        }
    }
}

impl FromStr for ResourceVector {
    type Err = String;

    /// Parse a comma-separated vector such as "20,128".
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut slots = Vec::new();
        for part in s.split(',') {
            let value = part
                .trim()
                .parse::<u64>()
                .map_err(|e| format!("invalid resource component '{}': {}", part.trim(), e))?;
            slots.push(value);
        }
        if slots.is_empty() {
            return Err("empty resource vector".to_string());
        }
        Ok(Self(slots))
    }
}

impl std::fmt::Display for ResourceVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|v| v.to_string()).collect();
        write!(f, "[{}]", parts.join(","))
    }
}

/// Per-job resource bookkeeping.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobAccount {
    pub name: String,
    pub max: ResourceVector,
    pub allocated: ResourceVector,
}

impl JobAccount {
    /// Residual demand: `max - allocated`.
    pub fn need(&self) -> ResourceVector {
        let slots = self
            .max
            .slots()
            .iter()
            .zip(self.allocated.slots())
            .map(|(m, a)| m - a)
            .collect();
        ResourceVector::new(slots)
    }
}

/// Read-only view of one job for snapshots.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: JobId,
    pub name: String,
    pub max: Vec<u64>,
    pub allocated: Vec<u64>,
    pub need: Vec<u64>,
}

/// Read-only view of the whole engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub resource_names: Vec<String>,
    pub totals: Vec<u64>,
    pub available: Vec<u64>,
    pub jobs: Vec<JobView>,
    pub is_safe: bool,
    pub safe_sequence: Vec<JobId>,
}

/// The admission controller. Pure and in-memory; callers provide mutual
/// exclusion (the coordinator enters it under a lock).
#[derive(Clone, Debug)]
pub struct SafetyEngine {
    totals: ResourceVector,
    names: Vec<String>,
    available: ResourceVector,
    jobs: BTreeMap<JobId, JobAccount>,
}

impl SafetyEngine {
    /// Establish arity and totals. Refuses arity zero and a name list that
    /// does not match the totals.
    pub fn new(
        totals: ResourceVector,
        names: Vec<String>,
    ) -> std::result::Result<Self, RejectionReason> {
        if totals.arity() == 0 {
            return Err(RejectionReason::Uninitialized);
        }
        if names.len() != totals.arity() {
            return Err(RejectionReason::ArityMismatch);
        }
        Ok(Self {
            available: totals.clone(),
            totals,
            names,
            jobs: BTreeMap::new(),
        })
    }

    pub fn arity(&self) -> usize {
        self.totals.arity()
    }

    pub fn totals(&self) -> &ResourceVector {
        &self.totals
    }

    pub fn available(&self) -> &ResourceVector {
        &self.available
    }

    pub fn live_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Record a new job with its declared maximum and an optional starting
    /// allocation. The starting allocation is subtracted from available
    /// without a safety check; feasibility only.
    pub fn declare(
        &mut self,
        job_id: JobId,
        name: &str,
        max: ResourceVector,
        initial_alloc: ResourceVector,
    ) -> std::result::Result<(), RejectionReason> {
        if max.arity() != self.arity() || initial_alloc.arity() != self.arity() {
            return Err(RejectionReason::ArityMismatch);
        }
        if self.jobs.contains_key(&job_id) {
            return Err(RejectionReason::DuplicateJob);
        }
        if !max.le(&self.totals) {
            return Err(RejectionReason::ExceedsMax);
        }
        if !initial_alloc.le(&max) {
            return Err(RejectionReason::ExceedsMax);
        }
        if !initial_alloc.le(&self.available) {
            return Err(RejectionReason::InsufficientAvailable);
        }

        self.available.sub_assign(&initial_alloc);
        self.jobs.insert(
            job_id,
            JobAccount {
                name: name.to_string(),
                max,
                allocated: initial_alloc,
            },
        );
        Ok(())
    }

    /// Decide a resource request. Grants commit atomically; rejections leave
    /// the engine untouched.
    pub fn request(&mut self, job_id: JobId, req: &ResourceVector) -> Decision {
        if req.arity() != self.arity() {
            return Decision::Rejected(RejectionReason::ArityMismatch);
        }
        let need = match self.jobs.get(&job_id) {
            Some(account) => account.need(),
            None => return Decision::Rejected(RejectionReason::UnknownJob),
        };

        // Zero requests never alter state and are always grantable.
        if req.is_zero() {
            let safe_sequence = Self::scan(&self.available, &self.jobs).unwrap_or_default();
            return Decision::Granted { safe_sequence };
        }

        if !req.le(&need) {
            return Decision::Rejected(RejectionReason::ExceedsMax);
        }
        if !req.le(&self.available) {
            return Decision::Rejected(RejectionReason::InsufficientAvailable);
        }

        // Tentatively apply, then check for a safe sequence.
        self.available.sub_assign(req);
        if let Some(account) = self.jobs.get_mut(&job_id) {
            account.allocated.add_assign(req);
        }

        match Self::scan(&self.available, &self.jobs) {
            Some(safe_sequence) => Decision::Granted { safe_sequence },
            None => {
                if let Some(account) = self.jobs.get_mut(&job_id) {
                    account.allocated.sub_assign(req);
                }
                self.available.add_assign(req);
                Decision::Rejected(RejectionReason::UnsafeState)
            }
        }
    }

    /// Return part of a job's allocation to the available pool.
    pub fn release(
        &mut self,
        job_id: JobId,
        rel: &ResourceVector,
    ) -> std::result::Result<(), RejectionReason> {
        if rel.arity() != self.arity() {
            return Err(RejectionReason::ArityMismatch);
        }
        let account = self
            .jobs
            .get_mut(&job_id)
            .ok_or(RejectionReason::UnknownJob)?;
        if !rel.le(&account.allocated) {
            return Err(RejectionReason::NegativeRelease);
        }
        account.allocated.sub_assign(rel);
        self.available.add_assign(rel);
        Ok(())
    }

    /// Release the job's full allocation and remove it from the live set.
    /// Returns the released vector.
    pub fn release_all(
        &mut self,
        job_id: JobId,
    ) -> std::result::Result<ResourceVector, RejectionReason> {
        let account = self.jobs.remove(&job_id).ok_or(RejectionReason::UnknownJob)?;
        self.available.add_assign(&account.allocated);
        Ok(account.allocated)
    }

    /// Read-only state view, including the current safety verdict.
    pub fn snapshot(&self) -> EngineSnapshot {
        let sequence = Self::scan(&self.available, &self.jobs);
        EngineSnapshot {
            resource_names: self.names.clone(),
            totals: self.totals.slots().to_vec(),
            available: self.available.slots().to_vec(),
            jobs: self
                .jobs
                .iter()
                .map(|(&job_id, account)| JobView {
                    job_id,
                    name: account.name.clone(),
                    max: account.max.slots().to_vec(),
                    allocated: account.allocated.slots().to_vec(),
                    need: account.need().slots().to_vec(),
                })
                .collect(),
            is_safe: sequence.is_some(),
            safe_sequence: sequence.unwrap_or_default(),
        }
    }

    /// Deadlock detection over current allocations. A safe state has no
    /// deadlock; otherwise every live job whose residual need cannot be
    /// covered by available is reported, in ascending id order.
    pub fn detect_deadlock(&self) -> (bool, Vec<JobId>) {
        if Self::scan(&self.available, &self.jobs).is_some() {
            return (false, Vec::new());
        }
        let stuck: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|(_, account)| {
                let need = account.need();
                !need.is_zero() && !need.le(&self.available)
            })
            .map(|(&job_id, _)| job_id)
            .collect();
        (!stuck.is_empty(), stuck)
    }

    /// The safety algorithm: sweep jobs in ascending id order, finishing
    /// every job whose need fits in `work` and folding its allocation back
    /// in as the pass proceeds; repeat passes until one makes no progress.
    /// Returns the full finish sequence when every job can finish.
    fn scan(
        available: &ResourceVector,
        jobs: &BTreeMap<JobId, JobAccount>,
    ) -> Option<Vec<JobId>> {
        let mut work = available.clone();
        let mut finished: BTreeMap<JobId, bool> =
            jobs.keys().map(|&job_id| (job_id, false)).collect();
        let mut sequence = Vec::with_capacity(jobs.len());

        loop {
            let mut advanced = false;
            for (&job_id, account) in jobs {
                if finished.get(&job_id).copied().unwrap_or(true) {
                    continue;
                }
                if account.need().le(&work) {
                    work.add_assign(&account.allocated);
                    finished.insert(job_id, true);
                    sequence.push(job_id);
                    advanced = true;
                }
            }
            if !advanced {
                break;
            }
        }

        if sequence.len() == jobs.len() {
            Some(sequence)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(slots: &[u64]) -> ResourceVector {
        ResourceVector::new(slots.to_vec())
    }

    fn engine_with_totals(totals: &[u64]) -> SafetyEngine {
        let names = (0..totals.len()).map(|i| format!("R{}", i)).collect();
        SafetyEngine::new(vector(totals), names).unwrap()
    }

    #[test]
    fn refuses_zero_arity() {
        let result = SafetyEngine::new(ResourceVector::new(Vec::new()), Vec::new());
        assert_eq!(result.err(), Some(RejectionReason::Uninitialized));
    }

    #[test]
    fn refuses_name_count_mismatch() {
        let result = SafetyEngine::new(vector(&[10, 5]), vec!["cpu".to_string()]);
        assert_eq!(result.err(), Some(RejectionReason::ArityMismatch));
    }

    #[test]
    fn declare_validates_bounds() {
        let mut engine = engine_with_totals(&[10, 5, 7]);

        assert_eq!(
            engine.declare(0, "too-big", vector(&[15, 5, 3]), ResourceVector::zero(3)),
            Err(RejectionReason::ExceedsMax)
        );
        assert_eq!(
            engine.declare(0, "wrong-arity", vector(&[7, 5]), ResourceVector::zero(2)),
            Err(RejectionReason::ArityMismatch)
        );
        assert!(engine
            .declare(0, "ok", vector(&[7, 5, 3]), vector(&[0, 1, 0]))
            .is_ok());
        assert_eq!(engine.available().slots(), &[10, 4, 7]);
        assert_eq!(
            engine.declare(0, "dup", vector(&[1, 1, 1]), ResourceVector::zero(3)),
            Err(RejectionReason::DuplicateJob)
        );
    }

    #[test]
    fn grant_updates_allocation_and_need() {
        let mut engine = engine_with_totals(&[10, 5, 7]);
        engine
            .declare(0, "p0", vector(&[7, 5, 3]), ResourceVector::zero(3))
            .unwrap();

        match engine.request(0, &vector(&[0, 1, 0])) {
            Decision::Granted { .. } => {}
            other => panic!("expected grant, got {:?}", other),
        }
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.available, vec![10, 4, 7]);
        assert_eq!(snapshot.jobs[0].allocated, vec![0, 1, 0]);
        assert_eq!(snapshot.jobs[0].need, vec![7, 4, 3]);
    }

    #[test]
    fn request_beyond_need_is_exceeds_max() {
        let mut engine = engine_with_totals(&[10, 5, 7]);
        engine
            .declare(0, "p0", vector(&[7, 5, 3]), ResourceVector::zero(3))
            .unwrap();
        assert_eq!(
            engine.request(0, &vector(&[8, 0, 0])),
            Decision::Rejected(RejectionReason::ExceedsMax)
        );
    }

    #[test]
    fn request_beyond_available_is_insufficient() {
        let mut engine = engine_with_totals(&[10, 5, 7]);
        engine
            .declare(0, "p0", vector(&[10, 5, 7]), ResourceVector::zero(3))
            .unwrap();
        engine
            .declare(1, "p1", vector(&[10, 5, 7]), vector(&[4, 0, 0]))
            .unwrap();
        assert_eq!(
            engine.request(0, &vector(&[7, 0, 0])),
            Decision::Rejected(RejectionReason::InsufficientAvailable)
        );
    }

    #[test]
    fn unknown_job_is_rejected() {
        let mut engine = engine_with_totals(&[10, 5, 7]);
        assert_eq!(
            engine.request(99, &vector(&[1, 1, 1])),
            Decision::Rejected(RejectionReason::UnknownJob)
        );
    }

    #[test]
    fn unsafe_request_rolls_back() {
        let mut engine = engine_with_totals(&[4, 4, 4]);
        engine
            .declare(0, "p0", vector(&[4, 4, 4]), ResourceVector::zero(3))
            .unwrap();
        engine
            .declare(1, "p1", vector(&[2, 2, 2]), vector(&[1, 1, 1]))
            .unwrap();

        // Fits in available, but would leave both jobs unable to finish.
        let before = engine.snapshot();
        assert_eq!(
            engine.request(0, &vector(&[3, 3, 3])),
            Decision::Rejected(RejectionReason::UnsafeState)
        );
        let after = engine.snapshot();
        assert_eq!(before.available, after.available);
        assert_eq!(before.jobs[0].allocated, after.jobs[0].allocated);
        assert!(after.is_safe);
    }

    #[test]
    fn zero_request_is_always_granted() {
        let mut engine = engine_with_totals(&[10, 5, 7]);
        engine
            .declare(0, "p0", vector(&[7, 5, 3]), ResourceVector::zero(3))
            .unwrap();
        let before = engine.snapshot();
        match engine.request(0, &ResourceVector::zero(3)) {
            Decision::Granted { .. } => {}
            other => panic!("expected grant, got {:?}", other),
        }
        assert_eq!(engine.snapshot().available, before.available);
    }

    #[test]
    fn release_round_trip_restores_allocation() {
        let mut engine = engine_with_totals(&[10, 5, 7]);
        engine
            .declare(0, "p0", vector(&[7, 5, 3]), ResourceVector::zero(3))
            .unwrap();
        match engine.request(0, &vector(&[2, 2, 2])) {
            Decision::Granted { .. } => {}
            other => panic!("expected grant, got {:?}", other),
        }
        engine.release(0, &vector(&[2, 2, 2])).unwrap();
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.available, vec![10, 5, 7]);
        assert_eq!(snapshot.jobs[0].allocated, vec![0, 0, 0]);
    }

    #[test]
    fn over_release_is_negative_release() {
        let mut engine = engine_with_totals(&[10, 5, 7]);
        engine
            .declare(0, "p0", vector(&[7, 5, 3]), vector(&[2, 2, 2]))
            .unwrap();
        assert_eq!(
            engine.release(0, &vector(&[3, 0, 0])),
            Err(RejectionReason::NegativeRelease)
        );
    }

    #[test]
    fn release_all_restores_totals_and_empties_live_set() {
        let mut engine = engine_with_totals(&[10, 5, 7]);
        engine
            .declare(0, "p0", vector(&[7, 5, 3]), vector(&[2, 2, 2]))
            .unwrap();
        let released = engine.release_all(0).unwrap();
        assert_eq!(released.slots(), &[2, 2, 2]);
        assert_eq!(engine.available().slots(), &[10, 5, 7]);
        assert_eq!(engine.live_jobs(), 0);
    }

    #[test]
    fn empty_live_set_is_vacuously_safe() {
        let engine = engine_with_totals(&[10, 5, 7]);
        let snapshot = engine.snapshot();
        assert!(snapshot.is_safe);
        assert!(snapshot.safe_sequence.is_empty());
    }

    #[test]
    fn safe_sequence_is_deterministic_ascending() {
        let mut engine = engine_with_totals(&[10, 5, 7]);
        engine
            .declare(0, "p0", vector(&[7, 5, 3]), vector(&[0, 1, 0]))
            .unwrap();
        engine
            .declare(1, "p1", vector(&[3, 2, 2]), vector(&[2, 0, 0]))
            .unwrap();
        engine
            .declare(2, "p2", vector(&[9, 0, 2]), vector(&[3, 0, 2]))
            .unwrap();

        let snapshot = engine.snapshot();
        assert!(snapshot.is_safe);
        assert_eq!(snapshot.safe_sequence, vec![1, 2, 0]);
    }

    #[test]
    fn deadlock_detected_when_no_job_can_finish() {
        let mut engine = engine_with_totals(&[3, 3, 3]);
        engine
            .declare(0, "p0", vector(&[3, 3, 3]), vector(&[2, 2, 2]))
            .unwrap();
        engine
            .declare(1, "p1", vector(&[3, 3, 3]), vector(&[1, 1, 1]))
            .unwrap();

        let (deadlocked, stuck) = engine.detect_deadlock();
        assert!(deadlocked);
        assert_eq!(stuck, vec![0, 1]);
    }

    #[test]
    fn safe_state_reports_no_deadlock() {
        let mut engine = engine_with_totals(&[10, 5, 7]);
        engine
            .declare(0, "p0", vector(&[7, 5, 3]), vector(&[0, 1, 0]))
            .unwrap();
        let (deadlocked, stuck) = engine.detect_deadlock();
        assert!(!deadlocked);
        assert!(stuck.is_empty());
    }

    #[test]
    fn parse_vector_from_csv() {
        let parsed: ResourceVector = "20, 128".parse().unwrap();
        assert_eq!(parsed.slots(), &[20, 128]);
        assert!("".parse::<ResourceVector>().is_err());
        assert!("1,x".parse::<ResourceVector>().is_err());
    }
}
