use crate::context::IngestContext;
use crate::ingest::source::SourceHealth;
use crate::models::ApiResponse;
use rocket::State;
use rocket::serde::json::Json;
use rocket_okapi::openapi;

/// Check the external source and report whether it is reachable.
#[openapi(tag = "Source")]
#[get("/source/health")]
pub async fn source_health(context: &State<IngestContext>) -> Json<ApiResponse<SourceHealth>> {
    Json(ApiResponse::new(context.fetch_client().health().await))
}
