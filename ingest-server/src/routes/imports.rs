//! Import job endpoints: trigger an import and inspect job state.

use crate::context::IngestContext;
use crate::error::{ApiError, ApiErrorResponse};
use crate::ingest::jobs::{Job, JobStatus};
use crate::ingest::orchestrator::DataStatus;
use crate::ingest::source::SourceFilters;
use crate::models::{ApiResponse, ResponseMeta};
use chrono::{DateTime, Utc};
use rocket::State;
use rocket::serde::json::Json;
use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::openapi;
use serde::{Deserialize, Serialize};

/// Returned when an import has been accepted.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImportStarted {
    pub job_id: String,
}

/// Public view of an import job.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: String,
    pub status: JobStatus,
    /// Completion percentage, 0 to 100.
    pub progress: u8,
    pub total_records: Option<u64>,
    pub new_records: Option<u64>,
    pub duplicate_records: Option<u64>,
    pub failed_records: Option<u64>,
    pub data_status: Option<DataStatus>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            status: job.status,
            progress: job.progress,
            total_records: job.total_records,
            new_records: job.new_records,
            duplicate_records: job.duplicate_records,
            failed_records: job.failed_records,
            data_status: job.data_status,
            error: job.error,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

/// Start a full import in the background. Responds 409 while another import
/// is running.
#[openapi(tag = "Imports")]
#[post("/imports")]
pub async fn trigger_import(
    context: &State<IngestContext>,
) -> Result<Json<ApiResponse<ImportStarted>>, ApiErrorResponse> {
    let job_id = context
        .orchestrator()
        .trigger(SourceFilters::default())
        .map_err(ApiError::from)?;

    Ok(Json(ApiResponse::new(ImportStarted { job_id })))
}

/// Current state of one import job.
#[openapi(tag = "Imports")]
#[get("/imports/<job_id>")]
pub async fn get_import(
    job_id: String,
    context: &State<IngestContext>,
) -> Result<Json<ApiResponse<JobView>>, ApiErrorResponse> {
    let job = context
        .registry()
        .get_job(&job_id)
        .ok_or_else(|| ApiError::NotFound(format!("job {} not found", job_id)))?;

    Ok(Json(ApiResponse::new(job.into())))
}

/// All known import jobs, newest first.
#[openapi(tag = "Imports")]
#[get("/imports")]
pub async fn list_imports(context: &State<IngestContext>) -> Json<ApiResponse<Vec<JobView>>> {
    let jobs: Vec<JobView> = context
        .registry()
        .list_jobs()
        .into_iter()
        .map(JobView::from)
        .collect();
    let total = jobs.len();

    Json(ApiResponse::with_meta(
        jobs,
        ResponseMeta { total: Some(total) },
    ))
}
