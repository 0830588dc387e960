use chrono::Utc;
use ingest_server::ingest::record::{CompositeKey, ProductionRecord};
use ingest_server::ingest::{PgStore, ProductionStats, ProductionStore};
use ingest_server::test_support::{TestDatabase, TestDatabaseError};

fn record(well_code: i64, field_code: i64, period: &str) -> ProductionRecord {
    let now = Utc::now();
    ProductionRecord {
        well_code,
        field_code,
        production_period: period.to_string(),
        field_name: Some("North".to_string()),
        well_reference: None,
        well_name: Some(format!("W-{}", well_code)),
        days_on_production: 30,
        oil_production_kbd: Some(1.5),
        gas_production_mmcfd: None,
        liquids_production_kbd: Some(0.25),
        water_production_kbd: None,
        data_source: Some("odata".to_string()),
        source_data: None,
        partition_0: None,
        created_at: now,
        updated_at: now,
    }
}

async fn provision() -> Option<TestDatabase> {
    match TestDatabase::new().await {
        Ok(db) => Some(db),
        Err(TestDatabaseError::Container(err)) => {
            eprintln!("skipping postgres store test: container unavailable: {err}");
            None
        }
        Err(err) => panic!("failed to provision test database: {err:?}"),
    }
}

#[tokio::test]
async fn insert_is_idempotent_across_runs() {
    let Some(test_db) = provision().await else {
        return;
    };
    let store = PgStore::new(test_db.pool_clone());

    let batch = vec![
        record(1, 10, "2024-01"),
        record(2, 10, "2024-01"),
        record(3, 10, "2024-02"),
    ];

    let first = store.bulk_insert(batch.clone()).await.expect("first insert");
    assert_eq!(first.new_count, 3);
    assert_eq!(first.duplicate_count, 0);
    assert_eq!(store.count().await.expect("count"), 3);

    let second = store.bulk_insert(batch).await.expect("second insert");
    assert_eq!(second.new_count, 0);
    assert_eq!(second.duplicate_count, 3);
    assert!(second.inserted.is_empty());
    assert_eq!(store.count().await.expect("count"), 3);

    test_db.close().await.expect("failed to drop test database");
}

#[tokio::test]
async fn mixed_batch_inserts_only_new_keys() {
    let Some(test_db) = provision().await else {
        return;
    };
    let store = PgStore::new(test_db.pool_clone());

    store
        .bulk_insert(vec![record(1, 10, "2024-01")])
        .await
        .expect("seed insert");

    let outcome = store
        .bulk_insert(vec![record(1, 10, "2024-01"), record(1, 10, "2024-02")])
        .await
        .expect("mixed insert");

    assert_eq!(outcome.new_count, 1);
    assert_eq!(outcome.duplicate_count, 1);
    assert_eq!(
        outcome.inserted,
        vec![CompositeKey {
            well_code: 1,
            field_code: 10,
            production_period: "2024-02".to_string(),
        }]
    );

    test_db.close().await.expect("failed to drop test database");
}

#[tokio::test]
async fn existing_keys_returns_only_stored_keys() {
    let Some(test_db) = provision().await else {
        return;
    };
    let store = PgStore::new(test_db.pool_clone());

    store
        .bulk_insert(vec![record(5, 20, "2023-12"), record(6, 20, "2023-12")])
        .await
        .expect("seed insert");

    let lookup = vec![
        record(5, 20, "2023-12").key(),
        record(6, 20, "2024-01").key(),
        record(7, 20, "2023-12").key(),
    ];
    let existing = store.existing_keys(&lookup).await.expect("lookup");

    assert_eq!(existing.len(), 1);
    assert!(existing.contains(&lookup[0]));
    assert!(store.existing_keys(&[]).await.expect("empty lookup").is_empty());

    test_db.close().await.expect("failed to drop test database");
}

#[tokio::test]
async fn lookups_and_statistics_read_stored_rows() {
    let Some(test_db) = provision().await else {
        return;
    };
    let store = PgStore::new(test_db.pool_clone());

    let mut idle = record(2, 10, "2023-12");
    idle.days_on_production = 0;
    store
        .bulk_insert(vec![
            record(1, 10, "2024-02"),
            record(1, 10, "2024-01"),
            idle,
            record(3, 20, "2024-01"),
        ])
        .await
        .expect("seed insert");

    let by_well = store.records_by_well(1).await.expect("well lookup");
    let periods: Vec<&str> = by_well
        .iter()
        .map(|record| record.production_period.as_str())
        .collect();
    assert_eq!(periods, vec!["2024-01", "2024-02"]);
    assert_eq!(by_well[0].well_name.as_deref(), Some("W-1"));

    let by_field = store.records_by_field(10, None).await.expect("field lookup");
    assert_eq!(by_field.len(), 3);
    assert_eq!(by_field[0].production_period, "2023-12");
    let limited = store.records_by_field(10, Some(1)).await.expect("field lookup");
    assert_eq!(limited.len(), 1);

    let stats = store.statistics().await.expect("statistics");
    assert_eq!(stats.total_records, 4);
    assert_eq!(stats.well_count, 3);
    assert_eq!(stats.field_count, 2);
    assert_eq!(stats.producing_records, 3);
    assert_eq!(stats.first_period.as_deref(), Some("2023-12"));
    assert_eq!(stats.last_period.as_deref(), Some("2024-02"));
    assert_eq!(stats.oil_production_kbd, 6.0);
    assert_eq!(stats.gas_production_mmcfd, 0.0);

    test_db.close().await.expect("failed to drop test database");
}

#[tokio::test]
async fn statistics_on_empty_table_are_zero() {
    let Some(test_db) = provision().await else {
        return;
    };
    let store = PgStore::new(test_db.pool_clone());

    assert_eq!(
        store.statistics().await.expect("statistics"),
        ProductionStats::default()
    );

    test_db.close().await.expect("failed to drop test database");
}
