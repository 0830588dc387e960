//! Import job registry.
//!
//! The registry is the single admission point for imports: at most one job may
//! be `Running` at any time. Every mutation goes through one lock and is
//! written to disk before the lock is released, so the registry survives a
//! restart. A stale-job sweep reclaims the running slot from crashed workers.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::ingest::orchestrator::DataStatus;

pub type JobId = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::TimedOut
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: u8,
    pub total_records: Option<u64>,
    pub new_records: Option<u64>,
    pub duplicate_records: Option<u64>,
    #[serde(default)]
    pub failed_records: Option<u64>,
    #[serde(default)]
    pub data_status: Option<DataStatus>,
    pub error: Option<String>,
    pub last_updated_at: DateTime<Utc>,
}

impl Job {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            id: format!("import_{}", Uuid::new_v4().simple()),
            status: JobStatus::Pending,
            created_at: now,
            started_at: None,
            completed_at: None,
            progress: 0,
            total_records: None,
            new_records: None,
            duplicate_records: None,
            failed_records: None,
            data_status: None,
            error: None,
            last_updated_at: now,
        }
    }

    /// Whether a running job has gone quiet or run for too long.
    fn is_stale(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        if self.status != JobStatus::Running {
            return false;
        }
        let idle = now - self.last_updated_at;
        let running = self.started_at.map(|started| now - started);
        idle > timeout || running.is_some_and(|elapsed| elapsed > timeout)
    }
}

/// Partial update merged into a job. Unset fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub total_records: Option<u64>,
    pub new_records: Option<u64>,
    pub duplicate_records: Option<u64>,
    pub failed_records: Option<u64>,
    pub data_status: Option<DataStatus>,
    pub error: Option<String>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn progress(progress: u8) -> Self {
        Self {
            progress: Some(progress.min(100)),
            ..Self::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    pub fn with_total_records(mut self, total: u64) -> Self {
        self.total_records = Some(total);
        self
    }
}

#[derive(Debug, Error)]
pub enum JobRegistryError {
    #[error("job {running} is already running")]
    Conflict { running: JobId },
    #[error("failed to persist job registry to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize job registry: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub struct JobRegistry {
    path: PathBuf,
    timeout: Duration,
    jobs: Mutex<BTreeMap<JobId, Job>>,
}

impl JobRegistry {
    /// Open the registry backed by `path`, loading any persisted jobs.
    ///
    /// A missing file starts empty. So does an unreadable or unparsable one,
    /// with a warning, so a corrupt file never blocks startup.
    pub fn open(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        let path = path.into();
        let jobs = load_jobs(&path);
        log::info!(
            "job registry loaded {} job(s) from {}",
            jobs.len(),
            path.display()
        );
        Self {
            path,
            timeout,
            jobs: Mutex::new(jobs),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create a pending job unless another job is running.
    ///
    /// Runs the stale-job sweep first so a crashed worker cannot hold the
    /// running slot past the timeout.
    pub fn create_job(&self) -> Result<Option<JobId>, JobRegistryError> {
        let mut jobs = self.jobs.lock();
        let mut staged = jobs.clone();
        let now = Utc::now();
        let mut dirty = !sweep_locked(&mut staged, now, self.timeout).is_empty();

        let created = if let Some(running) = find_running(&staged) {
            log::info!("job {}: still running, refusing new import", running.id);
            None
        } else {
            let job = Job::new(now);
            let id = job.id.clone();
            staged.insert(id.clone(), job);
            dirty = true;
            Some(id)
        };

        if dirty {
            self.commit(&mut jobs, staged)?;
        }
        if let Some(id) = &created {
            log::info!("job {}: created", id);
        }
        Ok(created)
    }

    /// Merge `update` into the job. Returns the new snapshot, or `None` when
    /// the job does not exist.
    ///
    /// Updates to a job already in a terminal state are ignored and the
    /// current snapshot is returned unchanged.
    pub fn update_job(
        &self,
        id: &str,
        update: JobUpdate,
    ) -> Result<Option<Job>, JobRegistryError> {
        let mut jobs = self.jobs.lock();

        if update.status == Some(JobStatus::Running) {
            if let Some(running) = find_running(&jobs).filter(|job| job.id != id) {
                return Err(JobRegistryError::Conflict {
                    running: running.id.clone(),
                });
            }
        }

        let Some(job) = jobs.get(id) else {
            log::warn!("job {}: update for unknown job ignored", id);
            return Ok(None);
        };

        if job.status.is_terminal() {
            log::warn!(
                "job {}: already {:?}, ignoring late update",
                id,
                job.status
            );
            return Ok(Some(job.clone()));
        }

        let mut snapshot = job.clone();
        apply_update(&mut snapshot, update, Utc::now());

        let mut staged = jobs.clone();
        staged.insert(snapshot.id.clone(), snapshot.clone());
        self.commit(&mut jobs, staged)?;
        Ok(Some(snapshot))
    }

    pub fn get_job(&self, id: &str) -> Option<Job> {
        self.jobs.lock().get(id).cloned()
    }

    pub fn running_job(&self) -> Option<Job> {
        find_running(&self.jobs.lock()).cloned()
    }

    /// All jobs, newest first.
    pub fn list_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.lock().values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Mark running jobs past the timeout as `TimedOut`. Returns their ids.
    pub fn sweep_stale(&self) -> Result<Vec<JobId>, JobRegistryError> {
        let mut jobs = self.jobs.lock();
        let mut staged = jobs.clone();
        let swept = sweep_locked(&mut staged, Utc::now(), self.timeout);
        if !swept.is_empty() {
            self.commit(&mut jobs, staged)?;
        }
        Ok(swept)
    }

    /// Drop finished jobs completed before `before`. Returns how many were removed.
    pub fn prune_finished(&self, before: DateTime<Utc>) -> Result<usize, JobRegistryError> {
        let mut jobs = self.jobs.lock();
        let mut staged = jobs.clone();
        staged.retain(|_, job| {
            !(job.status.is_terminal() && job.completed_at.is_some_and(|done| done < before))
        });
        let removed = jobs.len() - staged.len();
        if removed > 0 {
            self.commit(&mut jobs, staged)?;
            log::info!("job registry pruned {} finished job(s)", removed);
        }
        Ok(removed)
    }

    /// Write `staged` to disk, then make it the in-memory state. On a failed
    /// write both keep the previous state.
    fn commit(
        &self,
        jobs: &mut BTreeMap<JobId, Job>,
        staged: BTreeMap<JobId, Job>,
    ) -> Result<(), JobRegistryError> {
        persist(&self.path, &staged)?;
        *jobs = staged;
        Ok(())
    }

    /// Run the stale sweep every `interval` until `shutdown` is cancelled.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        log::info!("stale job sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_stale() {
                            log::error!("stale job sweep failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}

fn find_running(jobs: &BTreeMap<JobId, Job>) -> Option<&Job> {
    jobs.values().find(|job| job.status == JobStatus::Running)
}

fn apply_update(job: &mut Job, update: JobUpdate, now: DateTime<Utc>) {
    if let Some(progress) = update.progress {
        job.progress = progress;
    }
    if let Some(total) = update.total_records {
        job.total_records = Some(total);
    }
    if let Some(new_records) = update.new_records {
        job.new_records = Some(new_records);
    }
    if let Some(duplicates) = update.duplicate_records {
        job.duplicate_records = Some(duplicates);
    }
    if let Some(failed) = update.failed_records {
        job.failed_records = Some(failed);
    }
    if let Some(data_status) = update.data_status {
        job.data_status = Some(data_status);
    }
    if let Some(error) = update.error {
        job.error = Some(error);
    }
    if let Some(status) = update.status {
        if status != job.status {
            log::info!("job {}: {:?} -> {:?}", job.id, job.status, status);
        }
        job.status = status;
        if status == JobStatus::Running {
            job.started_at = Some(now);
        } else if status.is_terminal() {
            job.completed_at = Some(now);
        }
    }
    job.last_updated_at = now;
}

fn sweep_locked(
    jobs: &mut BTreeMap<JobId, Job>,
    now: DateTime<Utc>,
    timeout: Duration,
) -> Vec<JobId> {
    let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
    let mut swept = Vec::new();

    for job in jobs.values_mut().filter(|job| job.is_stale(now, timeout)) {
        log::warn!(
            "job {}: no progress since {}, marking timed out",
            job.id,
            job.last_updated_at
        );
        job.status = JobStatus::TimedOut;
        job.error = Some(format!(
            "job exceeded timeout of {}s without completing",
            timeout.num_seconds()
        ));
        job.completed_at = Some(now);
        job.last_updated_at = now;
        swept.push(job.id.clone());
    }

    swept
}

fn load_jobs(path: &Path) -> BTreeMap<JobId, Job> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
        Err(e) => {
            log::error!("failed to read job registry {}: {}", path.display(), e);
            return BTreeMap::new();
        }
    };

    match serde_json::from_str(&contents) {
        Ok(jobs) => jobs,
        Err(e) => {
            log::warn!(
                "invalid job registry {}, starting empty: {}",
                path.display(),
                e
            );
            BTreeMap::new()
        }
    }
}

/// Write the registry through a temp file in the same directory and rename it
/// over the target, so readers never see a half-written file.
fn persist(path: &Path, jobs: &BTreeMap<JobId, Job>) -> Result<(), JobRegistryError> {
    let payload = serde_json::to_vec_pretty(jobs)?;
    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let io_err = |source| JobRegistryError::Persist {
        path: path.to_path_buf(),
        source,
    };

    std::fs::create_dir_all(dir).map_err(io_err)?;
    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    file.write_all(&payload).map_err(io_err)?;
    file.as_file().sync_all().map_err(io_err)?;
    file.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}
