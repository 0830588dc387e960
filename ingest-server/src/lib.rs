#[macro_use]
extern crate rocket;

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod ingest;
pub mod models;
pub mod request_logger;
pub mod routes;

use crate::config::IngestConfig;
use crate::context::IngestContext;
use crate::db::IngestDb;
use crate::ingest::store::PgStore;
use crate::request_logger::RequestLogger;
use env_logger::Env;
use rocket::fairing::AdHoc;
use rocket::http::Method;
use rocket::{Build, Rocket};
use rocket_cors::{AllowedOrigins, CorsOptions};
use rocket_db_pools::Database;
use rocket_okapi::{
    openapi_get_routes,
    rapidoc::{GeneralConfig, HideShowConfig, RapiDocConfig, make_rapidoc},
    settings::UrlObject,
    swagger_ui::{SwaggerUIConfig, make_swagger_ui},
};
use std::sync::{Arc, Once};

static LOGGER: Once = Once::new();

pub fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(
            Env::default().default_filter_or("info,rocket::server=warn,rocket::request=warn"),
        )
        .init();
    });
}

pub fn rocket() -> Rocket<Build> {
    init_logger();

    let cors = CorsOptions::default()
        .allowed_origins(AllowedOrigins::all())
        .allowed_methods(
            vec![Method::Get, Method::Post]
                .into_iter()
                .map(From::from)
                .collect(),
        )
        .allow_credentials(true)
        .to_cors()
        .expect("Error creating CORS");

    rocket::build()
        .attach(RequestLogger)
        .attach(IngestDb::init())
        .attach(cors)
        .attach(AdHoc::try_on_ignite("Migrations", |rocket| async move {
            let Some(db) = IngestDb::fetch(&rocket) else {
                log::error!("database pool not available for migrations");
                return Err(rocket);
            };
            if let Err(e) = ingest::run_migrations(db).await {
                log::error!("refusing to start, migrations failed: {}", e);
                return Err(rocket);
            }
            Ok(rocket)
        }))
        .attach(AdHoc::try_on_ignite(
            "Ingest Context",
            |rocket| async move {
                let Some(db) = IngestDb::fetch(&rocket) else {
                    log::error!("database pool not available for ingest context");
                    return Err(rocket);
                };
                let store = Arc::new(PgStore::new((**db).clone()));

                match IngestContext::build(IngestConfig::from_env(), store) {
                    Ok(context) => Ok(rocket.manage(context)),
                    Err(e) => {
                        log::error!("failed to initialize ingest context: {}", e);
                        Err(rocket)
                    }
                }
            },
        ))
        .attach(AdHoc::on_liftoff("Start Job Sweeper", |rocket| {
            Box::pin(async move {
                match rocket.state::<IngestContext>() {
                    Some(context) => {
                        context.start_background_tasks();
                    }
                    None => log::error!("failed to start job sweeper: ingest context not found"),
                }
            })
        }))
        .attach(AdHoc::on_shutdown("Stop Job Sweeper", |rocket| {
            Box::pin(async move {
                if let Some(context) = rocket.state::<IngestContext>() {
                    context.shutdown();
                }
            })
        }))
        .mount(
            "/api/v1",
            openapi_get_routes![
                routes::health::health_check,
                routes::imports::trigger_import,
                routes::imports::get_import,
                routes::imports::list_imports,
                routes::source::source_health,
                routes::records::record_count,
                routes::records::record_statistics,
                routes::records::well_production,
                routes::records::field_production,
            ],
        )
        .mount(
            "/api/docs/swagger/",
            make_swagger_ui(&SwaggerUIConfig {
                url: "../../v1/openapi.json".to_owned(),
                ..Default::default()
            }),
        )
        .mount(
            "/api/docs/rapidoc/",
            make_rapidoc(&RapiDocConfig {
                general: GeneralConfig {
                    spec_urls: vec![UrlObject::new("Ingest API", "../../v1/openapi.json")],
                    ..Default::default()
                },
                hide_show: HideShowConfig {
                    allow_spec_url_load: false,
                    allow_spec_file_load: false,
                    ..Default::default()
                },
                ..Default::default()
            }),
        )
}

#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support {
    use crate::config::{IngestConfig, JobConfig, SourceConfig, ValidationConfig};
    use crate::context::{ContextError, IngestContext};
    use crate::ingest::batch::BatchConfig;
    use crate::ingest::record::WELL_PRODUCTION;
    use crate::ingest::source::RecordSource;
    use crate::ingest::store::ProductionStore;
    use rocket::config::LogLevel;
    use rocket::local::asynchronous::Client as AsyncClient;
    use rocket::local::blocking::Client;
    use rocket::{Build, Rocket, Route};
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    pub use database::{TestDatabase, TestDatabaseError};

    /// Configuration suited to tests: small batches, short delays, no
    /// background sweeper, job file under `dir`.
    pub fn test_config(dir: &Path, source_url: &str) -> IngestConfig {
        IngestConfig {
            batch: BatchConfig {
                batch_size: 50,
                max_concurrent_batches: 2,
                retry_attempts: 2,
                retry_delay: Duration::from_millis(5),
                enable_memory_monitoring: false,
                ..BatchConfig::default()
            },
            source: SourceConfig {
                base_url: source_url.to_string(),
                entity_set: WELL_PRODUCTION.entity_set.to_string(),
                credentials: None,
                page_size: 100,
                request_timeout: Duration::from_secs(5),
                max_retries: 3,
                retry_delay: Duration::from_millis(5),
                check_timeout: Duration::from_secs(1),
            },
            jobs: JobConfig {
                store_path: dir.join("import_jobs.json"),
                timeout: Duration::from_secs(60),
                sweep_interval: Duration::from_secs(60),
                enable_sweeper: false,
            },
            validation: ValidationConfig {
                min_days_on_production: 0,
                worker_threads: 2,
            },
        }
    }

    /// Build a context over `source` and `store` with [`test_config`].
    pub fn test_context(
        dir: &Path,
        source_url: &str,
        source: Arc<dyn RecordSource>,
        store: Arc<dyn ProductionStore>,
    ) -> Result<IngestContext, ContextError> {
        IngestContext::with_source(test_config(dir, source_url), source, store)
    }

    pub mod database {
        use crate::ingest::migration::MIGRATOR;
        use log::LevelFilter;
        use rocket_db_pools::sqlx::postgres::{PgConnectOptions, PgPoolOptions};
        use rocket_db_pools::sqlx::{self, ConnectOptions, PgPool};
        use std::time::Duration;
        use testcontainers::{GenericImage, ImageExt, core::WaitFor};
        use testcontainers_modules::testcontainers::{
            ContainerAsync, core::error::TestcontainersError, runners::AsyncRunner,
        };
        use thiserror::Error;

        const READY: &str = "database system is ready to accept connections";
        const CONNECT_ATTEMPTS: u32 = 10;

        #[derive(Debug, Error)]
        pub enum TestDatabaseError {
            #[error("database error: {0}")]
            Sqlx(#[from] sqlx::Error),
            #[error("migration error: {0}")]
            Migration(#[from] sqlx::migrate::MigrateError),
            #[error("container error: {0}")]
            Container(#[from] TestcontainersError),
        }

        /// A migrated database in its own throwaway Postgres container.
        ///
        /// The container is removed when the value is dropped.
        pub struct TestDatabase {
            pool: PgPool,
            _container: ContainerAsync<GenericImage>,
        }

        impl TestDatabase {
            pub async fn new() -> Result<Self, TestDatabaseError> {
                let container = GenericImage::new("postgres", "16-alpine")
                    .with_wait_for(WaitFor::message_on_stdout(READY))
                    .with_wait_for(WaitFor::message_on_stderr(READY))
                    .with_env_var("POSTGRES_PASSWORD", "ingest")
                    .start()
                    .await?;

                let options = PgConnectOptions::new()
                    .host(&container.get_host().await?.to_string())
                    .port(container.get_host_port_ipv4(5432).await?)
                    .username("postgres")
                    .password("ingest")
                    .database("postgres")
                    .log_statements(LevelFilter::Off);

                let pool = connect(options).await?;
                MIGRATOR.run(&pool).await?;

                Ok(Self {
                    pool,
                    _container: container,
                })
            }

            pub fn pool_clone(&self) -> PgPool {
                self.pool.clone()
            }

            /// Close the pool before the container goes away.
            pub async fn close(self) -> Result<(), TestDatabaseError> {
                self.pool.close().await;
                Ok(())
            }
        }

        // The server can still be restarting right after the ready line.
        async fn connect(options: PgConnectOptions) -> Result<PgPool, sqlx::Error> {
            let mut attempt = 1;
            loop {
                match PgPoolOptions::new()
                    .max_connections(5)
                    .connect_with(options.clone())
                    .await
                {
                    Ok(pool) => return Ok(pool),
                    Err(_) if attempt < CONNECT_ATTEMPTS => {
                        attempt += 1;
                        tokio::time::sleep(Duration::from_millis(250)).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    /// Rocket instance for integration tests: random port, quiet logs, only
    /// the routes and state a test asks for.
    pub struct TestRocketBuilder {
        rocket: Rocket<Build>,
    }

    impl Default for TestRocketBuilder {
        fn default() -> Self {
            Self::new()
        }
    }

    impl TestRocketBuilder {
        pub fn new() -> Self {
            let figment = rocket::Config::figment()
                .merge(("port", 0))
                .merge(("log_level", LogLevel::Off))
                .merge(("cli_colors", false));

            Self {
                rocket: rocket::custom(figment),
            }
        }

        /// Mount routes under `/api/v1`.
        pub fn mount_api_routes(mut self, routes: Vec<Route>) -> Self {
            self.rocket = self.rocket.mount("/api/v1", routes);
            self
        }

        pub fn manage_context(mut self, context: IngestContext) -> Self {
            self.rocket = self.rocket.manage(context);
            self
        }

        pub fn build(self) -> Rocket<Build> {
            self.rocket
        }

        pub fn blocking_client(self) -> Client {
            Client::tracked(self.build()).expect("valid Rocket instance")
        }

        pub async fn async_client(self) -> AsyncClient {
            AsyncClient::tracked(self.build())
                .await
                .expect("valid Rocket instance")
        }
    }
}
