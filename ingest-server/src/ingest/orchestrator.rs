//! Import pipeline: fetch, validate, de-duplicate and insert, driven through
//! the job registry.
//!
//! A job moves `Pending → Running → {Completed, Failed, TimedOut}`. The
//! orchestrator records exactly one terminal update per job; the registry
//! ignores anything that arrives after it.

use crate::ingest::batch::{BatchFailure, BatchScheduler};
use crate::ingest::jobs::{JobId, JobRegistry, JobRegistryError, JobStatus, JobUpdate};
use crate::ingest::source::{RecordSource, SourceError, SourceFilters};
use crate::ingest::store::{InsertOutcome, ProductionStore, dedupe_candidates};
use crate::ingest::validate::{ValidationError, Validator, ValidatorError};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

const PROGRESS_FETCHED: u8 = 30;
const PROGRESS_VALIDATED: u8 = 60;
const MAX_REPORTED_ERRORS: usize = 100;

/// What an import changed, from the caller's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DataStatus {
    Updated,
    AllFailedValidation,
    NoNewDataAllDuplicates,
    NoDataFromSource,
    NoNewData,
}

impl DataStatus {
    /// First matching rule wins.
    pub fn classify(total: usize, new: usize, duplicates: usize, failed_validation: usize) -> Self {
        if new > 0 {
            DataStatus::Updated
        } else if total > 0 && failed_validation == total {
            DataStatus::AllFailedValidation
        } else if duplicates > 0 {
            DataStatus::NoNewDataAllDuplicates
        } else if total == 0 {
            DataStatus::NoDataFromSource
        } else {
            DataStatus::NoNewData
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("an import is already running")]
    JobConflict { running: Option<JobId> },
    #[error("job {0} not found")]
    JobNotFound(JobId),
    #[error("fetch failed: {0}")]
    Source(#[from] SourceError),
    #[error(transparent)]
    Validator(#[from] ValidatorError),
    #[error(transparent)]
    Registry(#[from] JobRegistryError),
    #[error("all {batches} insert batch(es) failed: {message}")]
    InsertFailed { batches: usize, message: String },
}

/// Final counts of one import run.
#[derive(Debug, Clone, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub job_id: JobId,
    pub total_records: usize,
    pub valid_records: usize,
    pub new_records: usize,
    pub duplicate_records: usize,
    /// Records rejected by validation plus records in failed insert batches.
    pub failed_records: usize,
    pub data_status: DataStatus,
    pub validation_errors: Vec<ValidationError>,
    pub batch_errors: Vec<BatchFailure>,
    pub elapsed_ms: u64,
}

pub struct ImportOrchestrator {
    registry: Arc<JobRegistry>,
    source: Arc<dyn RecordSource>,
    validator: Validator,
    store: Arc<dyn ProductionStore>,
    scheduler: BatchScheduler,
}

impl ImportOrchestrator {
    pub fn new(
        registry: Arc<JobRegistry>,
        source: Arc<dyn RecordSource>,
        validator: Validator,
        store: Arc<dyn ProductionStore>,
        scheduler: BatchScheduler,
    ) -> Self {
        Self {
            registry,
            source,
            validator,
            store,
            scheduler,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Start an import in the background and return its job id.
    pub fn trigger(self: &Arc<Self>, filters: SourceFilters) -> Result<JobId, IngestError> {
        let job_id = self.start_job()?;

        let orchestrator = Arc::clone(self);
        let id = job_id.clone();
        tokio::spawn(async move {
            // Failures are already recorded on the job.
            let _ = orchestrator.run_job(&id, filters).await;
        });

        Ok(job_id)
    }

    /// Create a job and move it to `Running`, or report the conflicting job.
    pub fn start_job(&self) -> Result<JobId, IngestError> {
        let Some(job_id) = self.registry.create_job()? else {
            let running = self.registry.running_job().map(|job| job.id);
            return Err(IngestError::JobConflict { running });
        };

        match self
            .registry
            .update_job(&job_id, JobUpdate::status(JobStatus::Running))
        {
            Ok(_) => {
                log::info!("job {}: running", job_id);
                Ok(job_id)
            }
            Err(JobRegistryError::Conflict { running }) => {
                self.registry.update_job(
                    &job_id,
                    JobUpdate::failed(format!("job {} is already running", running)),
                )?;
                Err(IngestError::JobConflict {
                    running: Some(running),
                })
            }
            Err(e) => {
                if let Err(update_err) = self
                    .registry
                    .update_job(&job_id, JobUpdate::failed(e.to_string()))
                {
                    log::error!("job {}: failed to record failure: {}", job_id, update_err);
                }
                Err(e.into())
            }
        }
    }

    /// Run the pipeline for a job that is already running and record its
    /// terminal state.
    pub async fn run_job(
        &self,
        job_id: &str,
        filters: SourceFilters,
    ) -> Result<ImportSummary, IngestError> {
        if self.registry.get_job(job_id).is_none() {
            return Err(IngestError::JobNotFound(job_id.to_string()));
        }

        let started = Instant::now();
        match self.execute(job_id, &filters, started).await {
            Ok(summary) => {
                self.registry.update_job(
                    job_id,
                    JobUpdate {
                        status: Some(JobStatus::Completed),
                        progress: Some(100),
                        total_records: Some(summary.total_records as u64),
                        new_records: Some(summary.new_records as u64),
                        duplicate_records: Some(summary.duplicate_records as u64),
                        failed_records: Some(summary.failed_records as u64),
                        data_status: Some(summary.data_status),
                        error: None,
                    },
                )?;
                log::info!(
                    "job {}: completed ({:?}) with {} new, {} duplicate, {} failed in {}ms",
                    job_id,
                    summary.data_status,
                    summary.new_records,
                    summary.duplicate_records,
                    summary.failed_records,
                    summary.elapsed_ms
                );
                Ok(summary)
            }
            Err(err) => {
                log::error!("job {}: import failed: {}", job_id, err);
                if let Err(update_err) = self
                    .registry
                    .update_job(job_id, JobUpdate::failed(err.to_string()))
                {
                    log::error!("job {}: failed to record failure: {}", job_id, update_err);
                }
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        job_id: &str,
        filters: &SourceFilters,
        started: Instant,
    ) -> Result<ImportSummary, IngestError> {
        let raw = self.source.fetch(filters).await?;
        let total_records = raw.len();
        log::info!(
            "job {}: fetched {} records in {:?}",
            job_id,
            total_records,
            started.elapsed()
        );
        self.registry.update_job(
            job_id,
            JobUpdate::progress(PROGRESS_FETCHED).with_total_records(total_records as u64),
        )?;

        let validated = self.validator.validate_blocking(raw).await?;
        let valid_records = validated.accepted.len();
        let failed_validation = validated.errors.len();
        for error in validated.errors.iter().take(5) {
            log::debug!("job {}: rejected record: {}", job_id, error.message);
        }
        log::info!(
            "job {}: {} valid, {} rejected",
            job_id,
            valid_records,
            failed_validation
        );
        self.registry
            .update_job(job_id, JobUpdate::progress(PROGRESS_VALIDATED))?;

        let (candidates, in_set_duplicates) = dedupe_candidates(validated.accepted);
        if in_set_duplicates > 0 {
            log::info!(
                "job {}: {} repeated keys within the fetched set",
                job_id,
                in_set_duplicates
            );
        }

        let batches = self
            .scheduler
            .process(candidates, |batch| self.store.bulk_insert(batch))
            .await;
        let memory = self.scheduler.memory_status();
        log::debug!(
            "job {}: {} batch(es), peak {:.1}MB, now {:.1}MB ({:.0}% of limit)",
            job_id,
            batches.batch_count,
            batches.peak_memory_mb,
            memory.current_mb,
            memory.usage_percentage
        );

        if batches.all_failed() {
            let message = batches
                .errors
                .first()
                .map(|failure| failure.message.clone())
                .unwrap_or_default();
            return Err(IngestError::InsertFailed {
                batches: batches.batch_count,
                message,
            });
        }

        let failed_insert_records = batches.failed_items;
        let batch_errors = batches.errors;
        let inserted = batches
            .outputs
            .into_iter()
            .fold(InsertOutcome::default(), InsertOutcome::merge);

        let duplicate_records = in_set_duplicates + inserted.duplicate_count;
        let data_status = DataStatus::classify(
            total_records,
            inserted.new_count,
            duplicate_records,
            failed_validation,
        );

        let mut validation_errors = validated.errors;
        validation_errors.truncate(MAX_REPORTED_ERRORS);

        Ok(ImportSummary {
            job_id: job_id.to_string(),
            total_records,
            valid_records,
            new_records: inserted.new_count,
            duplicate_records,
            failed_records: failed_validation + failed_insert_records,
            data_status,
            validation_errors,
            batch_errors,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidationConfig;
    use crate::ingest::batch::BatchConfig;
    use crate::ingest::record::{CompositeKey, ProductionRecord, RawRecord, WELL_PRODUCTION};
    use crate::ingest::store::{MemoryStore, ProductionStats, StoreError};
    use crate::ingest::store::fixtures::record;
    use serde_json::{Value, json};
    use std::collections::HashSet;
    use std::time::Duration;
    use tempfile::TempDir;

    struct StaticSource(Vec<RawRecord>);

    #[async_trait::async_trait]
    impl RecordSource for StaticSource {
        async fn fetch(&self, _filters: &SourceFilters) -> Result<Vec<RawRecord>, SourceError> {
            Ok(self.0.clone())
        }
    }

    struct FailingSource;

    #[async_trait::async_trait]
    impl RecordSource for FailingSource {
        async fn fetch(&self, _filters: &SourceFilters) -> Result<Vec<RawRecord>, SourceError> {
            Err(SourceError::Unauthorized {
                status: reqwest::StatusCode::UNAUTHORIZED,
            })
        }
    }

    struct BrokenStore;

    #[async_trait::async_trait]
    impl ProductionStore for BrokenStore {
        async fn existing_keys(
            &self,
            _keys: &[CompositeKey],
        ) -> Result<HashSet<CompositeKey>, StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolTimedOut))
        }

        async fn bulk_insert(
            &self,
            _records: Vec<ProductionRecord>,
        ) -> Result<InsertOutcome, StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolTimedOut))
        }

        async fn count(&self) -> Result<i64, StoreError> {
            Ok(0)
        }

        async fn records_by_well(
            &self,
            _well_code: i64,
        ) -> Result<Vec<ProductionRecord>, StoreError> {
            Ok(Vec::new())
        }

        async fn records_by_field(
            &self,
            _field_code: i64,
            _limit: Option<usize>,
        ) -> Result<Vec<ProductionRecord>, StoreError> {
            Ok(Vec::new())
        }

        async fn statistics(&self) -> Result<ProductionStats, StoreError> {
            Ok(ProductionStats::default())
        }
    }

    struct Harness {
        _dir: TempDir,
        registry: Arc<JobRegistry>,
        orchestrator: Arc<ImportOrchestrator>,
    }

    fn harness(source: Arc<dyn RecordSource>, store: Arc<dyn ProductionStore>) -> Harness {
        let dir = TempDir::new().expect("temp dir");
        let registry = Arc::new(JobRegistry::open(
            dir.path().join("jobs.json"),
            Duration::from_secs(60),
        ));
        let validator = Validator::new(
            &WELL_PRODUCTION,
            &ValidationConfig {
                min_days_on_production: 0,
                worker_threads: 2,
            },
        )
        .expect("validator builds");
        let scheduler = BatchScheduler::new(BatchConfig {
            batch_size: 4,
            retry_attempts: 2,
            retry_delay: Duration::from_millis(1),
            enable_memory_monitoring: false,
            ..BatchConfig::default()
        });
        let orchestrator = Arc::new(ImportOrchestrator::new(
            Arc::clone(&registry),
            source,
            validator,
            store,
            scheduler,
        ));
        Harness {
            _dir: dir,
            registry,
            orchestrator,
        }
    }

    fn raw(value: Value) -> RawRecord {
        value.as_object().cloned().unwrap_or_default()
    }

    fn valid_raw(well_code: i64) -> RawRecord {
        raw(json!({
            "well_code": well_code,
            "field_code": 1,
            "production_period": "2024-01",
            "days_on_production": 30,
        }))
    }

    async fn run(harness: &Harness) -> (Result<ImportSummary, IngestError>, JobId) {
        let job_id = harness.orchestrator.start_job().expect("job starts");
        let result = harness
            .orchestrator
            .run_job(&job_id, SourceFilters::default())
            .await;
        (result, job_id)
    }

    #[test]
    fn classification_order() {
        assert_eq!(DataStatus::classify(10, 1, 5, 4), DataStatus::Updated);
        assert_eq!(DataStatus::classify(10, 0, 0, 10), DataStatus::AllFailedValidation);
        assert_eq!(DataStatus::classify(10, 0, 10, 0), DataStatus::NoNewDataAllDuplicates);
        assert_eq!(DataStatus::classify(0, 0, 0, 0), DataStatus::NoDataFromSource);
        assert_eq!(DataStatus::classify(10, 0, 0, 3), DataStatus::NoNewData);
    }

    #[test]
    fn data_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(DataStatus::NoNewDataAllDuplicates).expect("serializes"),
            json!("no_new_data_all_duplicates")
        );
    }

    #[tokio::test]
    async fn empty_source_completes_with_no_data() {
        let h = harness(Arc::new(StaticSource(Vec::new())), Arc::new(MemoryStore::new()));
        let (result, job_id) = run(&h).await;

        let summary = result.expect("import succeeds");
        assert_eq!(summary.data_status, DataStatus::NoDataFromSource);

        let job = h.registry.get_job(&job_id).expect("job exists");
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.total_records, Some(0));
        assert_eq!(job.data_status, Some(DataStatus::NoDataFromSource));
    }

    #[tokio::test]
    async fn records_missing_well_code_all_fail_validation() {
        let records: Vec<RawRecord> = (0..10)
            .map(|_| {
                raw(json!({
                    "field_code": 1,
                    "production_period": "2024-01",
                    "days_on_production": 30,
                }))
            })
            .collect();
        let store = Arc::new(MemoryStore::new());
        let h = harness(Arc::new(StaticSource(records)), store.clone());
        let (result, job_id) = run(&h).await;

        let summary = result.expect("import succeeds");
        assert_eq!(summary.data_status, DataStatus::AllFailedValidation);
        assert_eq!(summary.failed_records, 10);
        assert_eq!(summary.validation_errors.len(), 10);
        assert!(store.is_empty());

        let job = h.registry.get_job(&job_id).expect("job exists");
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.failed_records, Some(10));
        assert_eq!(job.new_records, Some(0));
    }

    #[tokio::test]
    async fn existing_keys_count_as_duplicates() {
        let records: Vec<RawRecord> = (1..=10).map(valid_raw).collect();
        let store = Arc::new(MemoryStore::with_records(
            (1..=4).map(|code| record(code, 1, "2024-01")),
        ));
        let h = harness(Arc::new(StaticSource(records)), store.clone());
        let (result, job_id) = run(&h).await;

        let summary = result.expect("import succeeds");
        assert_eq!(summary.new_records, 6);
        assert_eq!(summary.duplicate_records, 4);
        assert_eq!(summary.data_status, DataStatus::Updated);
        assert_eq!(store.len(), 10);

        let job = h.registry.get_job(&job_id).expect("job exists");
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.new_records, Some(6));
        assert_eq!(job.duplicate_records, Some(4));
        assert_eq!(job.data_status, Some(DataStatus::Updated));
    }

    #[tokio::test]
    async fn reimport_reports_all_duplicates() {
        let records: Vec<RawRecord> = (1..=5).map(valid_raw).collect();
        let store = Arc::new(MemoryStore::new());
        let h = harness(Arc::new(StaticSource(records)), store.clone());

        let (first, _) = run(&h).await;
        assert_eq!(first.expect("first import").new_records, 5);

        let (second, _) = run(&h).await;
        let summary = second.expect("second import");
        assert_eq!(summary.new_records, 0);
        assert_eq!(summary.duplicate_records, 5);
        assert_eq!(summary.data_status, DataStatus::NoNewDataAllDuplicates);
        assert_eq!(store.len(), 5);
    }

    #[tokio::test]
    async fn repeated_keys_in_one_fetch_are_inserted_once() {
        let records = vec![valid_raw(1), valid_raw(1), valid_raw(2)];
        let store = Arc::new(MemoryStore::new());
        let h = harness(Arc::new(StaticSource(records)), store.clone());
        let (result, _) = run(&h).await;

        let summary = result.expect("import succeeds");
        assert_eq!(summary.new_records, 2);
        assert_eq!(summary.duplicate_records, 1);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn fetch_error_fails_the_job() {
        let h = harness(Arc::new(FailingSource), Arc::new(MemoryStore::new()));
        let (result, job_id) = run(&h).await;

        assert!(matches!(result, Err(IngestError::Source(_))));
        let job = h.registry.get_job(&job_id).expect("job exists");
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap_or_default().contains("rejected credentials"));
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn failing_every_insert_batch_fails_the_job() {
        let records: Vec<RawRecord> = (1..=10).map(valid_raw).collect();
        let h = harness(Arc::new(StaticSource(records)), Arc::new(BrokenStore));
        let (result, job_id) = run(&h).await;

        assert!(matches!(result, Err(IngestError::InsertFailed { batches: 3, .. })));
        let job = h.registry.get_job(&job_id).expect("job exists");
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn second_start_while_running_conflicts() {
        let h = harness(Arc::new(StaticSource(Vec::new())), Arc::new(MemoryStore::new()));

        let first = h.orchestrator.start_job().expect("first job starts");
        let second = h.orchestrator.start_job();

        match second {
            Err(IngestError::JobConflict { running }) => assert_eq!(running, Some(first.clone())),
            other => panic!("expected conflict, got {:?}", other.map(|_| ())),
        }
        let job = h.registry.get_job(&first).expect("job exists");
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(h.registry.list_jobs().len(), 1);
    }

    #[tokio::test]
    async fn trigger_runs_job_in_background() {
        let records: Vec<RawRecord> = (1..=3).map(valid_raw).collect();
        let h = harness(Arc::new(StaticSource(records)), Arc::new(MemoryStore::new()));

        let job_id = h
            .orchestrator
            .trigger(SourceFilters::default())
            .expect("trigger succeeds");

        let mut status = JobStatus::Running;
        for _ in 0..200 {
            status = h.registry.get_job(&job_id).expect("job exists").status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn run_job_for_unknown_id_is_not_found() {
        let h = harness(Arc::new(StaticSource(Vec::new())), Arc::new(MemoryStore::new()));
        let result = h
            .orchestrator
            .run_job("import_missing", SourceFilters::default())
            .await;
        assert!(matches!(result, Err(IngestError::JobNotFound(_))));
    }
}
