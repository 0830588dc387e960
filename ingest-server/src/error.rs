use crate::ingest::jobs::JobRegistryError;
use crate::ingest::orchestrator::IngestError;
use crate::ingest::query::QueryError;
use crate::ingest::store::StoreError;
use rocket::http::Status;
use rocket::response::status;
use rocket::serde::json::Json;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub enum ApiError {
    DatabaseError(StoreError),
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    InternalError(String),
}

/// Error body returned with every non-2xx response.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Error responder used by every route.
pub type ApiErrorResponse = status::Custom<Json<ErrorResponse>>;

impl ApiError {
    fn parts(self) -> (Status, &'static str, String) {
        match self {
            ApiError::DatabaseError(e) => {
                log::error!("database error: {}", e);
                (Status::InternalServerError, "DatabaseError", e.to_string())
            }
            ApiError::BadRequest(msg) => {
                log::debug!("bad request: {}", msg);
                (Status::BadRequest, "BadRequest", msg)
            }
            ApiError::NotFound(msg) => {
                log::debug!("not found: {}", msg);
                (Status::NotFound, "NotFound", msg)
            }
            ApiError::Conflict(msg) => {
                log::info!("conflict: {}", msg);
                (Status::Conflict, "Conflict", msg)
            }
            ApiError::InternalError(msg) => {
                log::error!("internal error: {}", msg);
                (Status::InternalServerError, "InternalError", msg)
            }
        }
    }
}

impl From<ApiError> for ApiErrorResponse {
    fn from(err: ApiError) -> Self {
        let (status, error_type, message) = err.parts();
        status::Custom(
            status,
            Json(ErrorResponse {
                error: error_type.to_string(),
                message,
            }),
        )
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::DatabaseError(err)
    }
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::InvalidArgument(msg) => ApiError::BadRequest(msg),
            QueryError::Store(e) => ApiError::DatabaseError(e),
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::JobConflict { running: Some(running) } => {
                ApiError::Conflict(format!("import {} is already running", running))
            }
            IngestError::JobConflict { running: None } => {
                ApiError::Conflict("an import is already running".to_string())
            }
            IngestError::JobNotFound(id) => ApiError::NotFound(format!("job {} not found", id)),
            IngestError::Registry(JobRegistryError::Conflict { running }) => {
                ApiError::Conflict(format!("import {} is already running", running))
            }
            other => ApiError::InternalError(other.to_string()),
        }
    }
}
