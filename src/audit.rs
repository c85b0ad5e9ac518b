/// JSON-lines audit trail for completed jobs.
///
/// One record per finished submission, appended on the release transition.
/// The log is owned by the coordinator; nothing else writes to it.
use crate::types::{ExitStatus, JobId, JobStats, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditRecord {
    pub ts: DateTime<Utc>,
    /// Correlation id for this submission attempt.
    pub run_id: String,
    pub job_id: JobId,
    pub name: String,
    pub admitted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit: Option<ExitStatus>,
    pub stats: JobStats,
    pub oom_killed: bool,
}

impl AuditRecord {
    pub fn new(job_id: JobId, name: &str) -> Self {
        Self {
            ts: Utc::now(),
            run_id: Uuid::new_v4().to_string(),
            job_id,
            name: name.to_string(),
            admitted: false,
            rejection_reason: None,
            exit: None,
            stats: JobStats::default(),
            oom_killed: false,
        }
    }
}

pub struct AuditLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl AuditLog {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &AuditRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let mut file = match self.file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        writeln!(file, "{}", line)?;
        file.flush()?;
        Ok(())
    }
}
