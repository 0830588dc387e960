//! Read-only lookups over stored production records.

use crate::ingest::record::ProductionRecord;
use crate::ingest::store::{ProductionStats, ProductionStore, StoreError};
use chrono::NaiveDate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Inclusive date bounds applied to production periods.
///
/// Periods are `YYYY-MM` (read as the first of the month) or `YYYY-MM-DD`.
/// A period in any other shape is always kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeriodRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl PeriodRange {
    pub fn contains(&self, period: &str) -> bool {
        let Some(date) = parse_period(period) else {
            return true;
        };
        self.start.is_none_or(|start| date >= start) && self.end.is_none_or(|end| date <= end)
    }

    fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }
}

fn parse_period(period: &str) -> Option<NaiveDate> {
    let period = period.trim();
    NaiveDate::parse_from_str(period, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(&format!("{}-01", period), "%Y-%m-%d"))
        .ok()
}

/// A stored record with its derived production figures.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProductionEntry {
    #[serde(flatten)]
    pub record: ProductionRecord,
    pub total_production_kbd: f64,
    pub is_producing: bool,
}

impl From<ProductionRecord> for ProductionEntry {
    fn from(record: ProductionRecord) -> Self {
        Self {
            total_production_kbd: record.total_production_kbd(),
            is_producing: record.is_producing(),
            record,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WellProduction {
    pub well_code: i64,
    pub records_found: usize,
    pub records: Vec<ProductionEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FieldProduction {
    pub field_code: i64,
    pub field_name: Option<String>,
    pub records_found: usize,
    /// Distinct wells among the returned records.
    pub well_count: usize,
    /// Distinct wells with at least one producing record.
    pub active_wells: usize,
    pub total_production_kbd: f64,
    pub records: Vec<ProductionEntry>,
}

impl FieldProduction {
    fn summarize(field_code: i64, records: Vec<ProductionRecord>) -> Self {
        let mut wells = HashSet::new();
        let mut active = HashSet::new();
        let mut total_production_kbd = 0.0;
        for record in &records {
            wells.insert(record.well_code);
            if record.is_producing() {
                active.insert(record.well_code);
            }
            total_production_kbd += record.total_production_kbd();
        }

        Self {
            field_code,
            field_name: records.iter().find_map(|record| record.field_name.clone()),
            records_found: records.len(),
            well_count: wells.len(),
            active_wells: active.len(),
            total_production_kbd,
            records: records.into_iter().map(ProductionEntry::from).collect(),
        }
    }
}

#[derive(Clone)]
pub struct ProductionQuery {
    store: Arc<dyn ProductionStore>,
}

impl ProductionQuery {
    pub fn new(store: Arc<dyn ProductionStore>) -> Self {
        Self { store }
    }

    /// Records of one well within `range`, oldest period first.
    pub async fn by_well(
        &self,
        well_code: i64,
        range: PeriodRange,
    ) -> Result<WellProduction, QueryError> {
        if well_code <= 0 {
            return Err(QueryError::InvalidArgument(format!(
                "well code must be positive, got {}",
                well_code
            )));
        }
        if let (Some(start), Some(end)) = (range.start, range.end) {
            if start > end {
                return Err(QueryError::InvalidArgument(format!(
                    "period start {} is after period end {}",
                    start, end
                )));
            }
        }

        let mut records = self.store.records_by_well(well_code).await?;
        if !range.is_unbounded() {
            records.retain(|record| range.contains(&record.production_period));
        }
        log::debug!("well {}: {} record(s)", well_code, records.len());

        Ok(WellProduction {
            well_code,
            records_found: records.len(),
            records: records.into_iter().map(ProductionEntry::from).collect(),
        })
    }

    /// Records of one field with a per-field summary. A zero limit means no
    /// limit.
    pub async fn by_field(
        &self,
        field_code: i64,
        limit: Option<usize>,
    ) -> Result<FieldProduction, QueryError> {
        if field_code <= 0 {
            return Err(QueryError::InvalidArgument(format!(
                "field code must be positive, got {}",
                field_code
            )));
        }

        let limit = limit.filter(|limit| *limit > 0);
        let records = self.store.records_by_field(field_code, limit).await?;
        log::debug!("field {}: {} record(s)", field_code, records.len());
        Ok(FieldProduction::summarize(field_code, records))
    }

    pub async fn statistics(&self) -> Result<ProductionStats, QueryError> {
        Ok(self.store.statistics().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::store::MemoryStore;
    use crate::ingest::store::fixtures::record;

    fn date(value: &str) -> NaiveDate {
        NaiveDate::parse_from_str(value, "%Y-%m-%d").expect("valid date")
    }

    fn query(records: Vec<ProductionRecord>) -> ProductionQuery {
        ProductionQuery::new(Arc::new(MemoryStore::with_records(records)))
    }

    #[test]
    fn month_periods_compare_as_first_of_month() {
        let range = PeriodRange {
            start: Some(date("2024-02-01")),
            end: Some(date("2024-03-15")),
        };
        assert!(!range.contains("2024-01"));
        assert!(range.contains("2024-02"));
        assert!(range.contains("2024-03"));
        assert!(range.contains("2024-03-15"));
        assert!(!range.contains("2024-03-16"));
        assert!(range.contains("Q1 2024"));
        assert!(PeriodRange::default().contains("2024-01"));
    }

    #[tokio::test]
    async fn well_lookup_applies_period_range() {
        let query = query(vec![
            record(4, 1, "2024-01"),
            record(4, 1, "2024-02"),
            record(4, 1, "2024-03"),
            record(5, 1, "2024-02"),
        ]);

        let production = query
            .by_well(
                4,
                PeriodRange {
                    start: Some(date("2024-02-01")),
                    end: None,
                },
            )
            .await
            .expect("lookup");

        assert_eq!(production.records_found, 2);
        assert_eq!(production.records[0].record.production_period, "2024-02");
        assert_eq!(production.records[0].total_production_kbd, 1.5);
        assert!(production.records[0].is_producing);
    }

    #[tokio::test]
    async fn non_positive_codes_are_rejected() {
        let query = query(Vec::new());
        assert!(matches!(
            query.by_well(0, PeriodRange::default()).await,
            Err(QueryError::InvalidArgument(_))
        ));
        assert!(matches!(
            query.by_field(-3, None).await,
            Err(QueryError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn inverted_range_is_rejected() {
        let query = query(vec![record(1, 1, "2024-01")]);
        let range = PeriodRange {
            start: Some(date("2024-05-01")),
            end: Some(date("2024-01-01")),
        };
        assert!(matches!(
            query.by_well(1, range).await,
            Err(QueryError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn field_summary_counts_distinct_and_active_wells() {
        let mut idle = record(3, 9, "2024-01");
        idle.days_on_production = 0;
        let query = query(vec![
            record(1, 9, "2024-01"),
            record(1, 9, "2024-02"),
            record(2, 9, "2024-01"),
            idle,
            record(7, 10, "2024-01"),
        ]);

        let field = query.by_field(9, Some(0)).await.expect("lookup");
        assert_eq!(field.records_found, 4);
        assert_eq!(field.well_count, 3);
        assert_eq!(field.active_wells, 2);
        assert_eq!(field.total_production_kbd, 6.0);
        assert_eq!(field.field_name.as_deref(), Some("North"));

        let limited = query.by_field(9, Some(2)).await.expect("lookup");
        assert_eq!(limited.records_found, 2);
    }
}
