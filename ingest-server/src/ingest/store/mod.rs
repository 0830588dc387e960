//! Persistence of production records with insert-if-absent semantics.
//!
//! A store never holds two records with the same [`CompositeKey`]. A key that
//! is already stored, or that appears earlier in the same candidate set, is a
//! duplicate and is skipped; existing rows are never overwritten.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::ingest::record::{CompositeKey, ProductionRecord};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result of one `bulk_insert` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InsertOutcome {
    /// Keys of the rows actually written, in candidate order.
    pub inserted: Vec<CompositeKey>,
    pub new_count: usize,
    pub duplicate_count: usize,
}

impl InsertOutcome {
    pub fn merge(mut self, other: InsertOutcome) -> Self {
        self.inserted.extend(other.inserted);
        self.new_count += other.new_count;
        self.duplicate_count += other.duplicate_count;
        self
    }
}

/// Aggregates over every stored record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ProductionStats {
    pub total_records: i64,
    pub well_count: i64,
    pub field_count: i64,
    /// Records with at least one day on production.
    pub producing_records: i64,
    pub first_period: Option<String>,
    pub last_period: Option<String>,
    pub oil_production_kbd: f64,
    pub gas_production_mmcfd: f64,
    pub liquids_production_kbd: f64,
    pub water_production_kbd: f64,
}

#[async_trait::async_trait]
pub trait ProductionStore: Send + Sync {
    /// Which of `keys` are already stored.
    async fn existing_keys(&self, keys: &[CompositeKey]) -> Result<HashSet<CompositeKey>, StoreError>;

    /// Insert the records whose keys are not stored yet.
    async fn bulk_insert(&self, records: Vec<ProductionRecord>) -> Result<InsertOutcome, StoreError>;

    async fn count(&self) -> Result<i64, StoreError>;

    /// Every record of one well, ordered by period then field.
    async fn records_by_well(&self, well_code: i64) -> Result<Vec<ProductionRecord>, StoreError>;

    /// Records of one field ordered by period then well, at most `limit`.
    async fn records_by_field(
        &self,
        field_code: i64,
        limit: Option<usize>,
    ) -> Result<Vec<ProductionRecord>, StoreError>;

    async fn statistics(&self) -> Result<ProductionStats, StoreError>;
}

/// Drop repeated keys, keeping the first occurrence. Returns the unique
/// records and how many were dropped.
pub fn dedupe_candidates(records: Vec<ProductionRecord>) -> (Vec<ProductionRecord>, usize) {
    partition_new(records, &HashSet::new())
}

/// Split candidates into records to insert and a duplicate count. A record is
/// a duplicate when its key is in `existing` or was already seen earlier in
/// `candidates`.
pub fn partition_new(
    candidates: Vec<ProductionRecord>,
    existing: &HashSet<CompositeKey>,
) -> (Vec<ProductionRecord>, usize) {
    let mut seen: HashSet<CompositeKey> = HashSet::with_capacity(candidates.len());
    let mut fresh = Vec::with_capacity(candidates.len());
    let mut duplicates = 0usize;

    for record in candidates {
        let key = record.key();
        if existing.contains(&key) || !seen.insert(key) {
            duplicates += 1;
        } else {
            fresh.push(record);
        }
    }

    (fresh, duplicates)
}
