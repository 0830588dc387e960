//! Read endpoints over stored production records.

use crate::context::IngestContext;
use crate::error::{ApiError, ApiErrorResponse};
use crate::ingest::query::{FieldProduction, WellProduction};
use crate::ingest::source::SourceHealth;
use crate::ingest::store::ProductionStats;
use crate::models::ApiResponse;
use crate::routes::params::{LimitParams, PeriodParams};
use chrono::{DateTime, Utc};
use rocket::State;
use rocket::serde::json::Json;
use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::openapi;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct RecordCount {
    pub total: i64,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProductionStatistics {
    pub records: ProductionStats,
    pub source: SourceHealth,
    pub generated_at: DateTime<Utc>,
}

/// Number of production records currently stored.
#[openapi(tag = "Records")]
#[get("/records/count")]
pub async fn record_count(
    context: &State<IngestContext>,
) -> Result<Json<ApiResponse<RecordCount>>, ApiErrorResponse> {
    let total = context.store().count().await.map_err(ApiError::from)?;
    Ok(Json(ApiResponse::new(RecordCount { total })))
}

/// Aggregates over stored records together with the source's reachability.
#[openapi(tag = "Records")]
#[get("/records/stats")]
pub async fn record_statistics(
    context: &State<IngestContext>,
) -> Result<Json<ApiResponse<ProductionStatistics>>, ApiErrorResponse> {
    let (records, source) =
        tokio::join!(context.query().statistics(), context.fetch_client().health());
    let records = records.map_err(ApiError::from)?;

    Ok(Json(ApiResponse::new(ProductionStatistics {
        records,
        source,
        generated_at: Utc::now(),
    })))
}

/// Production history of one well, optionally bounded by
/// `period_start`/`period_end`. Responds 404 when nothing matches.
#[openapi(tag = "Records")]
#[get("/records/well/<well_code>?<params..>")]
pub async fn well_production(
    well_code: i64,
    params: Option<PeriodParams>,
    context: &State<IngestContext>,
) -> Result<Json<ApiResponse<WellProduction>>, ApiErrorResponse> {
    let range = params.unwrap_or_default().range();
    let production = context
        .query()
        .by_well(well_code, range)
        .await
        .map_err(ApiError::from)?;

    if production.records.is_empty() {
        return Err(ApiError::NotFound(format!("no records for well {}", well_code)).into());
    }
    Ok(Json(ApiResponse::new(production)))
}

/// Records of one field with a summary. Responds 404 when the field has none.
#[openapi(tag = "Records")]
#[get("/records/field/<field_code>?<params..>")]
pub async fn field_production(
    field_code: i64,
    params: Option<LimitParams>,
    context: &State<IngestContext>,
) -> Result<Json<ApiResponse<FieldProduction>>, ApiErrorResponse> {
    let limit = params.unwrap_or_default().limit();
    let production = context
        .query()
        .by_field(field_code, limit)
        .await
        .map_err(ApiError::from)?;

    if production.records.is_empty() {
        return Err(ApiError::NotFound(format!("no records for field {}", field_code)).into());
    }
    Ok(Json(ApiResponse::new(production)))
}
