//! PostgreSQL store using UNNEST for set-oriented lookups and inserts.

use super::{InsertOutcome, ProductionStats, ProductionStore, StoreError, partition_new};
use crate::ingest::record::{CompositeKey, ProductionRecord};
use chrono::{DateTime, Utc};
use rocket_db_pools::sqlx::{self, PgConnection, PgPool};
use std::collections::HashSet;
use std::time::Instant;

/// Key columns in the layout UNNEST expects.
#[derive(Default)]
struct KeyColumns {
    well_codes: Vec<i64>,
    field_codes: Vec<i64>,
    periods: Vec<String>,
}

impl KeyColumns {
    fn from_keys<'a>(keys: impl IntoIterator<Item = &'a CompositeKey>) -> Self {
        let mut columns = KeyColumns::default();
        for key in keys {
            columns.well_codes.push(key.well_code);
            columns.field_codes.push(key.field_code);
            columns.periods.push(key.production_period.clone());
        }
        columns
    }
}

/// Record values in columnar form for a single UNNEST insert.
#[derive(Default)]
struct RecordColumns {
    keys: KeyColumns,
    field_names: Vec<Option<String>>,
    well_references: Vec<Option<String>>,
    well_names: Vec<Option<String>>,
    days_on_production: Vec<i64>,
    oil: Vec<Option<f64>>,
    gas: Vec<Option<f64>>,
    liquids: Vec<Option<f64>>,
    water: Vec<Option<f64>>,
    data_sources: Vec<Option<String>>,
    source_data: Vec<Option<String>>,
    partitions: Vec<Option<String>>,
    created_at: Vec<DateTime<Utc>>,
    updated_at: Vec<DateTime<Utc>>,
}

impl RecordColumns {
    fn from_records(records: Vec<ProductionRecord>) -> Self {
        let mut columns = RecordColumns::default();
        for record in records {
            columns.keys.well_codes.push(record.well_code);
            columns.keys.field_codes.push(record.field_code);
            columns.keys.periods.push(record.production_period);
            columns.field_names.push(record.field_name);
            columns.well_references.push(record.well_reference);
            columns.well_names.push(record.well_name);
            columns.days_on_production.push(record.days_on_production);
            columns.oil.push(record.oil_production_kbd);
            columns.gas.push(record.gas_production_mmcfd);
            columns.liquids.push(record.liquids_production_kbd);
            columns.water.push(record.water_production_kbd);
            columns.data_sources.push(record.data_source);
            columns.source_data.push(record.source_data);
            columns.partitions.push(record.partition_0);
            columns.created_at.push(record.created_at);
            columns.updated_at.push(record.updated_at);
        }
        columns
    }
}

const RECORD_COLUMNS: &str = "well_code, field_code, production_period, \
     field_name, well_reference, well_name, days_on_production, \
     oil_production_kbd, gas_production_mmcfd, liquids_production_kbd, water_production_kbd, \
     data_source, source_data, partition_0, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn select_existing(
    conn: &mut PgConnection,
    keys: &KeyColumns,
) -> Result<HashSet<CompositeKey>, sqlx::Error> {
    let rows: Vec<(i64, i64, String)> = sqlx::query_as(
        r#"SELECT p.well_code, p.field_code, p.production_period
           FROM production_records p
           JOIN UNNEST($1::bigint[], $2::bigint[], $3::text[])
               AS k(well_code, field_code, production_period)
             ON p.well_code = k.well_code
            AND p.field_code = k.field_code
            AND p.production_period = k.production_period"#,
    )
    .bind(&keys.well_codes)
    .bind(&keys.field_codes)
    .bind(&keys.periods)
    .fetch_all(conn)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(well_code, field_code, production_period)| CompositeKey {
            well_code,
            field_code,
            production_period,
        })
        .collect())
}

async fn insert_rows(
    conn: &mut PgConnection,
    columns: &RecordColumns,
) -> Result<Vec<CompositeKey>, sqlx::Error> {
    let rows: Vec<(i64, i64, String)> = sqlx::query_as(
        r#"INSERT INTO production_records (
               well_code, field_code, production_period,
               field_name, well_reference, well_name, days_on_production,
               oil_production_kbd, gas_production_mmcfd,
               liquids_production_kbd, water_production_kbd,
               data_source, source_data, partition_0,
               created_at, updated_at
           )
           SELECT * FROM UNNEST(
               $1::bigint[],
               $2::bigint[],
               $3::text[],
               $4::text[],
               $5::text[],
               $6::text[],
               $7::bigint[],
               $8::float8[],
               $9::float8[],
               $10::float8[],
               $11::float8[],
               $12::text[],
               $13::text[],
               $14::text[],
               $15::timestamptz[],
               $16::timestamptz[]
           )
           ON CONFLICT (well_code, field_code, production_period) DO NOTHING
           RETURNING well_code, field_code, production_period"#,
    )
    .bind(&columns.keys.well_codes)
    .bind(&columns.keys.field_codes)
    .bind(&columns.keys.periods)
    .bind(&columns.field_names)
    .bind(&columns.well_references)
    .bind(&columns.well_names)
    .bind(&columns.days_on_production)
    .bind(&columns.oil)
    .bind(&columns.gas)
    .bind(&columns.liquids)
    .bind(&columns.water)
    .bind(&columns.data_sources)
    .bind(&columns.source_data)
    .bind(&columns.partitions)
    .bind(&columns.created_at)
    .bind(&columns.updated_at)
    .fetch_all(conn)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(well_code, field_code, production_period)| CompositeKey {
            well_code,
            field_code,
            production_period,
        })
        .collect())
}

#[async_trait::async_trait]
impl ProductionStore for PgStore {
    async fn existing_keys(&self, keys: &[CompositeKey]) -> Result<HashSet<CompositeKey>, StoreError> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }
        let mut conn = self.pool.acquire().await?;
        let existing = select_existing(&mut conn, &KeyColumns::from_keys(keys)).await?;
        Ok(existing)
    }

    async fn bulk_insert(&self, records: Vec<ProductionRecord>) -> Result<InsertOutcome, StoreError> {
        if records.is_empty() {
            return Ok(InsertOutcome::default());
        }

        let started = Instant::now();
        let candidates = records.len();
        let mut tx = self.pool.begin().await?;

        let keys: Vec<CompositeKey> = records.iter().map(ProductionRecord::key).collect();
        let existing = select_existing(&mut tx, &KeyColumns::from_keys(&keys)).await?;
        let (fresh, _) = partition_new(records, &existing);

        let inserted = if fresh.is_empty() {
            Vec::new()
        } else {
            insert_rows(&mut tx, &RecordColumns::from_records(fresh)).await?
        };
        tx.commit().await?;

        let new_count = inserted.len();
        log::debug!(
            "bulk insert: {} candidates, {} new, {} duplicates in {:?}",
            candidates,
            new_count,
            candidates - new_count,
            started.elapsed()
        );

        Ok(InsertOutcome {
            inserted,
            new_count,
            duplicate_count: candidates - new_count,
        })
    }

    async fn count(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM production_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn records_by_well(&self, well_code: i64) -> Result<Vec<ProductionRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM production_records WHERE well_code = $1 \
             ORDER BY production_period, field_code",
            RECORD_COLUMNS
        );
        let records = sqlx::query_as::<_, ProductionRecord>(&sql)
            .bind(well_code)
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    async fn records_by_field(
        &self,
        field_code: i64,
        limit: Option<usize>,
    ) -> Result<Vec<ProductionRecord>, StoreError> {
        // LIMIT NULL returns every row.
        let sql = format!(
            "SELECT {} FROM production_records WHERE field_code = $1 \
             ORDER BY production_period, well_code LIMIT $2",
            RECORD_COLUMNS
        );
        let records = sqlx::query_as::<_, ProductionRecord>(&sql)
            .bind(field_code)
            .bind(limit.map(|limit| limit as i64))
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    async fn statistics(&self) -> Result<ProductionStats, StoreError> {
        let stats = sqlx::query_as::<_, ProductionStats>(
            r#"SELECT COUNT(*) AS total_records,
                      COUNT(DISTINCT well_code) AS well_count,
                      COUNT(DISTINCT field_code) AS field_count,
                      COUNT(*) FILTER (WHERE days_on_production > 0) AS producing_records,
                      MIN(production_period) AS first_period,
                      MAX(production_period) AS last_period,
                      COALESCE(SUM(oil_production_kbd), 0)::float8 AS oil_production_kbd,
                      COALESCE(SUM(gas_production_mmcfd), 0)::float8 AS gas_production_mmcfd,
                      COALESCE(SUM(liquids_production_kbd), 0)::float8 AS liquids_production_kbd,
                      COALESCE(SUM(water_production_kbd), 0)::float8 AS water_production_kbd
               FROM production_records"#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(stats)
    }
}
