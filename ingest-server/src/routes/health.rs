//! Liveness endpoint. Does not touch the database or the source.

use crate::models::ApiResponse;
use rocket::serde::json::Json;
use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::openapi;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct HealthResponse {
    /// Always `"ok"` when the process can serve requests.
    pub status: String,
    pub service: String,
    pub version: String,
}

#[openapi(tag = "Health")]
#[get("/health")]
pub fn health_check() -> Json<ApiResponse<HealthResponse>> {
    Json(ApiResponse::new(HealthResponse {
        status: "ok".to_string(),
        service: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}
