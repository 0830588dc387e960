//! HTTP route handlers grouped by resource.
//!
//! Handlers are thin adapters over the ingestion core, annotated with
//! `#[openapi]` so `rocket_okapi` can derive the OpenAPI document.

pub mod health;
pub mod imports;
pub mod params;
pub mod records;
pub mod source;
