//! Shared collaborators, built once at startup.

use crate::config::IngestConfig;
use crate::ingest::batch::BatchScheduler;
use crate::ingest::jobs::JobRegistry;
use crate::ingest::orchestrator::ImportOrchestrator;
use crate::ingest::query::ProductionQuery;
use crate::ingest::record::WELL_PRODUCTION;
use crate::ingest::source::{FetchClient, RecordSource, SourceError};
use crate::ingest::store::ProductionStore;
use crate::ingest::validate::{Validator, ValidatorError};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Validator(#[from] ValidatorError),
    #[error("failed to create job store directory {path}: {source}")]
    JobStoreDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub struct IngestContext {
    config: IngestConfig,
    fetch_client: FetchClient,
    registry: Arc<JobRegistry>,
    store: Arc<dyn ProductionStore>,
    orchestrator: Arc<ImportOrchestrator>,
    query: ProductionQuery,
    shutdown: CancellationToken,
}

impl IngestContext {
    /// Wire the pipeline against the configured OData source.
    pub fn build(
        config: IngestConfig,
        store: Arc<dyn ProductionStore>,
    ) -> Result<Self, ContextError> {
        let fetch_client = FetchClient::new(config.source.clone())?;
        let source: Arc<dyn RecordSource> = Arc::new(fetch_client.clone());
        Self::assemble(config, fetch_client, source, store)
    }

    /// Wire the pipeline against an arbitrary record source.
    pub fn with_source(
        config: IngestConfig,
        source: Arc<dyn RecordSource>,
        store: Arc<dyn ProductionStore>,
    ) -> Result<Self, ContextError> {
        let fetch_client = FetchClient::new(config.source.clone())?;
        Self::assemble(config, fetch_client, source, store)
    }

    fn assemble(
        config: IngestConfig,
        fetch_client: FetchClient,
        source: Arc<dyn RecordSource>,
        store: Arc<dyn ProductionStore>,
    ) -> Result<Self, ContextError> {
        if let Some(dir) = config
            .jobs
            .store_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
        {
            std::fs::create_dir_all(dir).map_err(|source| ContextError::JobStoreDir {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let registry = Arc::new(JobRegistry::open(
            config.jobs.store_path.clone(),
            config.jobs.timeout,
        ));
        let validator = Validator::new(&WELL_PRODUCTION, &config.validation)?;
        let scheduler = BatchScheduler::new(config.batch.clone());
        let orchestrator = Arc::new(ImportOrchestrator::new(
            Arc::clone(&registry),
            source,
            validator,
            Arc::clone(&store),
            scheduler,
        ));

        log::info!(
            "ingest context ready: source {}, batch size {}, job store {}",
            config.source.endpoint(),
            config.batch.batch_size,
            config.jobs.store_path.display()
        );

        Ok(Self {
            config,
            fetch_client,
            registry,
            query: ProductionQuery::new(Arc::clone(&store)),
            store,
            orchestrator,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn fetch_client(&self) -> &FetchClient {
        &self.fetch_client
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn ProductionStore> {
        &self.store
    }

    pub fn orchestrator(&self) -> &Arc<ImportOrchestrator> {
        &self.orchestrator
    }

    pub fn query(&self) -> &ProductionQuery {
        &self.query
    }

    /// Start the periodic stale-job sweep if enabled.
    pub fn start_background_tasks(&self) -> Option<JoinHandle<()>> {
        if !self.config.jobs.enable_sweeper {
            return None;
        }
        log::info!(
            "starting stale job sweeper every {:?}",
            self.config.jobs.sweep_interval
        );
        Some(
            Arc::clone(&self.registry)
                .spawn_sweeper(self.config.jobs.sweep_interval, self.shutdown.clone()),
        )
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
