use rocket_db_pools::{Database, sqlx};

#[derive(Database)]
#[database("ingest_db")]
pub struct IngestDb(sqlx::PgPool);
