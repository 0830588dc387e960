//! Query string types for the record lookup endpoints.

use crate::ingest::query::PeriodRange;
use chrono::NaiveDate;
use rocket::form::{self, FromFormField, ValueField};
use rocket_okapi::okapi::schemars::{self, JsonSchema};
use serde::{Deserialize, Serialize};

/// `YYYY-MM-DD` date from a query parameter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct DateParam(pub NaiveDate);

impl<'r> FromFormField<'r> for DateParam {
    fn from_value(field: ValueField<'r>) -> form::Result<'r, Self> {
        let trimmed = field.value.trim();
        match NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
            Ok(date) => Ok(DateParam(date)),
            Err(_) => Err(form::Error::validation(format!(
                "invalid date '{}', expected YYYY-MM-DD",
                field.value
            )))?,
        }
    }
}

/// Optional inclusive period bounds for a well lookup.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, rocket::form::FromForm)]
pub struct PeriodParams {
    pub period_start: Option<DateParam>,
    pub period_end: Option<DateParam>,
}

impl PeriodParams {
    pub fn range(&self) -> PeriodRange {
        PeriodRange {
            start: self.period_start.map(|DateParam(date)| date),
            end: self.period_end.map(|DateParam(date)| date),
        }
    }
}

/// Row cap for a field lookup; absent or zero returns every record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, rocket::form::FromForm)]
pub struct LimitParams {
    pub limit: Option<u32>,
}

impl LimitParams {
    pub fn limit(&self) -> Option<usize> {
        self.limit.map(|limit| limit as usize)
    }
}
