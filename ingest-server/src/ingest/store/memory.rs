use super::{InsertOutcome, ProductionStats, ProductionStore, StoreError, partition_new};
use crate::ingest::record::{CompositeKey, ProductionRecord};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// Process-local store, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<CompositeKey, ProductionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = ProductionRecord>) -> Self {
        let rows = records
            .into_iter()
            .map(|record| (record.key(), record))
            .collect();
        Self {
            rows: Mutex::new(rows),
        }
    }

    pub fn get(&self, key: &CompositeKey) -> Option<ProductionRecord> {
        self.rows.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

#[async_trait::async_trait]
impl ProductionStore for MemoryStore {
    async fn existing_keys(&self, keys: &[CompositeKey]) -> Result<HashSet<CompositeKey>, StoreError> {
        let rows = self.rows.lock();
        Ok(keys
            .iter()
            .filter(|key| rows.contains_key(*key))
            .cloned()
            .collect())
    }

    async fn bulk_insert(&self, records: Vec<ProductionRecord>) -> Result<InsertOutcome, StoreError> {
        let candidates = records.len();
        let mut rows = self.rows.lock();

        let existing: HashSet<CompositeKey> = records
            .iter()
            .map(ProductionRecord::key)
            .filter(|key| rows.contains_key(key))
            .collect();
        let (fresh, _) = partition_new(records, &existing);

        let mut inserted = Vec::with_capacity(fresh.len());
        for record in fresh {
            let key = record.key();
            rows.insert(key.clone(), record);
            inserted.push(key);
        }

        let new_count = inserted.len();
        Ok(InsertOutcome {
            inserted,
            new_count,
            duplicate_count: candidates - new_count,
        })
    }

    async fn count(&self) -> Result<i64, StoreError> {
        Ok(self.rows.lock().len() as i64)
    }

    async fn records_by_well(&self, well_code: i64) -> Result<Vec<ProductionRecord>, StoreError> {
        let mut records: Vec<ProductionRecord> = self
            .rows
            .lock()
            .values()
            .filter(|record| record.well_code == well_code)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            (&a.production_period, a.field_code).cmp(&(&b.production_period, b.field_code))
        });
        Ok(records)
    }

    async fn records_by_field(
        &self,
        field_code: i64,
        limit: Option<usize>,
    ) -> Result<Vec<ProductionRecord>, StoreError> {
        let mut records: Vec<ProductionRecord> = self
            .rows
            .lock()
            .values()
            .filter(|record| record.field_code == field_code)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            (&a.production_period, a.well_code).cmp(&(&b.production_period, b.well_code))
        });
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn statistics(&self) -> Result<ProductionStats, StoreError> {
        let rows = self.rows.lock();
        let mut wells = HashSet::new();
        let mut fields = HashSet::new();
        let mut stats = ProductionStats::default();

        for record in rows.values() {
            wells.insert(record.well_code);
            fields.insert(record.field_code);
            stats.total_records += 1;
            if record.is_producing() {
                stats.producing_records += 1;
            }
            let period = &record.production_period;
            if stats.first_period.as_ref().is_none_or(|first| period < first) {
                stats.first_period = Some(period.clone());
            }
            if stats.last_period.as_ref().is_none_or(|last| period > last) {
                stats.last_period = Some(period.clone());
            }
            stats.oil_production_kbd += record.oil_production_kbd.unwrap_or(0.0);
            stats.gas_production_mmcfd += record.gas_production_mmcfd.unwrap_or(0.0);
            stats.liquids_production_kbd += record.liquids_production_kbd.unwrap_or(0.0);
            stats.water_production_kbd += record.water_production_kbd.unwrap_or(0.0);
        }

        stats.well_count = wells.len() as i64;
        stats.field_count = fields.len() as i64;
        Ok(stats)
    }
}
