//! Well production ingestion core.
//!
//! Records flow from a [`source::RecordSource`] through the
//! [`validate::Validator`] into a [`store::ProductionStore`], batched by the
//! [`batch::BatchScheduler`]. The [`orchestrator::ImportOrchestrator`] drives
//! that pipeline and reports progress through the [`jobs::JobRegistry`].
//! [`query::ProductionQuery`] serves reads over what has been stored.

pub mod batch;
pub mod jobs;
pub mod migration;
pub mod orchestrator;
pub mod query;
pub mod record;
pub mod source;
pub mod store;
pub mod validate;

pub use batch::{BatchConfig, BatchResult, BatchScheduler};
pub use jobs::{Job, JobId, JobRegistry, JobStatus};
pub use migration::run_migrations;
pub use orchestrator::{DataStatus, ImportOrchestrator, ImportSummary, IngestError};
pub use query::{PeriodRange, ProductionQuery, QueryError};
pub use source::{FetchClient, RecordSource, SourceError, SourceFilters};
pub use store::{InsertOutcome, MemoryStore, PgStore, ProductionStats, ProductionStore};
pub use validate::Validator;
