//! Record validation: typing, primary key checks and domain thresholds.
//!
//! Validation is set based. Every input record ends up either accepted or
//! described by exactly one [`ValidationError`]; nothing here aborts an
//! import. Mapping is CPU bound and runs on a dedicated rayon pool.

use crate::config::ValidationConfig;
use crate::ingest::record::{DatasetSpec, ProductionRecord, RawRecord, TypedRow};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ValidationErrorType {
    NullPrimaryKeyComponent,
    InvalidDaysOnProduction,
}

/// Why a single record was rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValidationError {
    pub error_type: ValidationErrorType,
    pub message: String,
    pub offending_key_fields: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<i64>,
}

#[derive(Debug, Default)]
pub struct ValidationOutcome {
    pub accepted: Vec<ProductionRecord>,
    pub errors: Vec<ValidationError>,
}

impl ValidationOutcome {
    pub fn total(&self) -> usize {
        self.accepted.len() + self.errors.len()
    }
}

#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error("failed to build validation thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("validation task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Clone)]
pub struct Validator {
    spec: &'static DatasetSpec,
    min_days_on_production: i64,
    pool: Arc<rayon::ThreadPool>,
}

impl Validator {
    pub fn new(spec: &'static DatasetSpec, config: &ValidationConfig) -> Result<Self, ValidatorError> {
        let threads = match config.worker_threads {
            0 => num_cpus::get(),
            n => n,
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("validate-{}", index))
            .build()?;

        Ok(Self {
            spec,
            min_days_on_production: config.min_days_on_production,
            pool: Arc::new(pool),
        })
    }

    /// Split `records` into accepted records and per-record errors, keeping
    /// input order in both lists.
    pub fn validate(&self, records: &[RawRecord]) -> ValidationOutcome {
        let started = Instant::now();
        let now = Utc::now();

        let checked: Vec<Result<ProductionRecord, ValidationError>> = self.pool.install(|| {
            records
                .par_iter()
                .map(|raw| check_record(self.spec, raw, self.min_days_on_production, now))
                .collect()
        });

        let mut outcome = ValidationOutcome::default();
        for result in checked {
            match result {
                Ok(record) => outcome.accepted.push(record),
                Err(error) => outcome.errors.push(error),
            }
        }

        log::info!(
            "validated {} records: {} accepted, {} rejected in {:?}",
            records.len(),
            outcome.accepted.len(),
            outcome.errors.len(),
            started.elapsed()
        );

        outcome
    }

    /// Run [`validate`](Self::validate) off the async runtime.
    pub async fn validate_blocking(
        &self,
        records: Vec<RawRecord>,
    ) -> Result<ValidationOutcome, ValidatorError> {
        let validator = self.clone();
        let outcome = tokio::task::spawn_blocking(move || validator.validate(&records)).await?;
        Ok(outcome)
    }
}

fn check_record(
    spec: &DatasetSpec,
    raw: &RawRecord,
    min_days: i64,
    now: DateTime<Utc>,
) -> Result<ProductionRecord, ValidationError> {
    let row = TypedRow::from_raw(spec, raw);

    let key_fields = row.key_fields();
    let missing: Vec<&str> = spec
        .primary_key
        .iter()
        .copied()
        .filter(|column| key_fields.get(*column).is_none_or(Value::is_null))
        .collect();
    if !missing.is_empty() {
        return Err(ValidationError {
            error_type: ValidationErrorType::NullPrimaryKeyComponent,
            message: format!("primary key component(s) missing: {}", missing.join(", ")),
            offending_key_fields: key_fields,
            threshold: None,
        });
    }

    let days_rejected = match row.days_on_production {
        Some(days) if days >= min_days => None,
        Some(days) => Some(days.to_string()),
        None => Some("missing".to_string()),
    };
    if let Some(days) = days_rejected {
        let mut fields = key_fields;
        fields.insert(
            "days_on_production".into(),
            row.days_on_production.into(),
        );
        return Err(ValidationError {
            error_type: ValidationErrorType::InvalidDaysOnProduction,
            message: format!(
                "days_on_production ({}) is below minimum threshold ({})",
                days, min_days
            ),
            offending_key_fields: fields,
            threshold: Some(min_days),
        });
    }

    row.into_record(now).ok_or_else(|| ValidationError {
        error_type: ValidationErrorType::NullPrimaryKeyComponent,
        message: "record could not be typed".to_string(),
        offending_key_fields: Map::new(),
        threshold: None,
    })
}
