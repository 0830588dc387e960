use crate::ingest::batch::BatchConfig;
use crate::ingest::record::WELL_PRODUCTION;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(raw) => parse_bool_or_warn(key, &raw, default),
        Err(_) => default,
    }
}

fn parse_bool_or_warn(key: &str, raw: &str, default: bool) -> bool {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => {
            log::warn!("ignoring {}={:?}: expected a boolean, using {}", key, raw, default);
            default
        }
    }
}

/// Parse `key` as `T`; a set but unparsable value is logged and replaced by
/// `default`.
fn env_parse<T: FromStr + fmt::Display>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => parse_or_warn(key, &raw, default),
        Err(_) => default,
    }
}

fn parse_or_warn<T: FromStr + fmt::Display>(key: &str, raw: &str, default: T) -> T {
    match raw.trim().parse::<T>() {
        Ok(value) => value,
        Err(_) => {
            log::warn!("ignoring {}={:?}: not a valid value, using {}", key, raw, default);
            default
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    env_parse(key, default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env_parse(key, default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    env_parse(key, default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    non_negative(key, env_parse(key, default), default)
}

fn non_negative(key: &str, value: f64, default: f64) -> f64 {
    if value >= 0.0 {
        value
    } else {
        log::warn!("ignoring {}={}: must not be negative, using {}", key, value, default);
        default
    }
}

fn env_duration_millis(key: &str, default_millis: u64) -> Duration {
    Duration::from_millis(env_parse(key, default_millis))
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

impl BatchConfig {
    pub fn from_env() -> Self {
        let defaults = BatchConfig::default();
        Self {
            batch_size: env_usize("INGEST_BATCH_SIZE", defaults.batch_size).max(1),
            max_concurrent_batches: env_usize(
                "INGEST_MAX_CONCURRENT_BATCHES",
                defaults.max_concurrent_batches,
            )
            .max(1),
            max_memory_mb: env_f64("INGEST_MAX_MEMORY_MB", defaults.max_memory_mb),
            gc_threshold_mb: env_f64("INGEST_GC_THRESHOLD_MB", defaults.gc_threshold_mb),
            retry_attempts: env_u32("INGEST_RETRY_ATTEMPTS", defaults.retry_attempts).max(1),
            retry_delay: env_duration_millis("INGEST_RETRY_DELAY_MS", 1_000),
            enable_memory_monitoring: env_bool(
                "INGEST_MEMORY_MONITORING",
                defaults.enable_memory_monitoring,
            ),
        }
    }
}

/// Basic auth credentials for the external source.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Connection settings for the paginated OData source.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub base_url: String,
    pub entity_set: String,
    pub credentials: Option<Credentials>,
    pub page_size: usize,
    pub request_timeout: Duration,
    /// Retries after the initial attempt for transient failures.
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub check_timeout: Duration,
}

impl SourceConfig {
    pub fn from_env() -> Self {
        let credentials = match (env_optional("SOURCE_USERNAME"), env_optional("SOURCE_PASSWORD")) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            _ => None,
        };

        Self {
            base_url: env_string("SOURCE_BASE_URL", "http://localhost:8080/odata"),
            entity_set: env_string("SOURCE_ENTITY_SET", WELL_PRODUCTION.entity_set),
            credentials,
            page_size: env_usize("SOURCE_PAGE_SIZE", 1_000).max(1),
            request_timeout: env_duration_millis("SOURCE_TIMEOUT_MS", 30_000),
            max_retries: env_u32("SOURCE_MAX_RETRIES", 3),
            retry_delay: env_duration_millis("SOURCE_RETRY_DELAY_MS", 1_000),
            check_timeout: env_duration_millis("SOURCE_CHECK_TIMEOUT_MS", 5_000),
        }
    }

    /// URL of the entity set the first page is requested from.
    pub fn endpoint(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let entity_set = self.entity_set.trim_matches('/');
        if entity_set.is_empty() {
            base.to_string()
        } else {
            format!("{}/{}", base, entity_set)
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub store_path: PathBuf,
    /// A running job with no update for this long is marked timed out.
    pub timeout: Duration,
    pub sweep_interval: Duration,
    pub enable_sweeper: bool,
}

impl JobConfig {
    pub fn from_env() -> Self {
        Self {
            store_path: PathBuf::from(env_string("JOB_STORE_PATH", "./data/import_jobs.json")),
            timeout: env_duration_millis("JOB_TIMEOUT_MS", 30 * 60 * 1_000),
            sweep_interval: env_duration_millis("JOB_SWEEP_INTERVAL_MS", 60_000),
            enable_sweeper: env_bool("JOB_SWEEPER_ENABLED", true),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidationConfig {
    pub min_days_on_production: i64,
    /// Worker threads for record mapping; `0` means one per CPU.
    pub worker_threads: usize,
}

impl ValidationConfig {
    pub fn from_env() -> Self {
        Self {
            min_days_on_production: env_i64("VALIDATION_MIN_DAYS_ON_PRODUCTION", 0),
            worker_threads: env_usize("VALIDATION_WORKER_THREADS", 0),
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_days_on_production: 0,
            worker_threads: 0,
        }
    }
}

/// Everything the ingestion pipeline reads from the environment.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub batch: BatchConfig,
    pub source: SourceConfig,
    pub jobs: JobConfig,
    pub validation: ValidationConfig,
}

impl IngestConfig {
    pub fn from_env() -> Self {
        Self {
            batch: BatchConfig::from_env(),
            source: SourceConfig::from_env(),
            jobs: JobConfig::from_env(),
            validation: ValidationConfig::from_env(),
        }
    }
}
