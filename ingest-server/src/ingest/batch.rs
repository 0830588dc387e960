//! Batched execution with bounded concurrency, retries and memory limits.
//!
//! [`BatchScheduler::process`] splits a list into fixed-size batches and runs
//! them through a caller supplied async function, at most
//! `max_concurrent_batches` at a time. Each batch is retried on its own; a
//! failed batch never affects the batches running next to it. Process memory
//! is sampled before every attempt: above `max_memory_mb` the batch is
//! abandoned without retry, above `gc_threshold_mb` after a success the
//! monitor is asked to reclaim.
//!
//! [`BatchScheduler::process_stream`] applies the same engine to an unbounded
//! stream, holding only one rolling batch in memory at a time.

use futures::future::join_all;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use thiserror::Error;
use tokio::sync::Semaphore;
use uuid::Uuid;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub max_concurrent_batches: usize,
    /// Hard limit: a batch is abandoned when memory is above this.
    pub max_memory_mb: f64,
    /// Soft limit: a reclaim pass is requested when memory is above this.
    pub gc_threshold_mb: f64,
    /// Total invocations of the batch function before giving up.
    pub retry_attempts: u32,
    /// Base delay; attempt `n` waits `retry_delay * n` before the next try.
    pub retry_delay: Duration,
    pub enable_memory_monitoring: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            max_concurrent_batches: 3,
            max_memory_mb: 512.0,
            gc_threshold_mb: 256.0,
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            enable_memory_monitoring: true,
        }
    }
}

/// Source of memory readings for the scheduler.
pub trait MemoryMonitor: Send + Sync {
    /// Current memory usage of the process in MB.
    fn current_mb(&self) -> f64;

    /// Called when usage crossed the soft threshold after a batch.
    fn reclaim(&self) {}
}

/// Samples the resident set size of the current process.
pub struct ProcessMemoryMonitor {
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl ProcessMemoryMonitor {
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| log::warn!("memory monitoring unavailable: {}", e))
            .ok();
        Self {
            pid,
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for ProcessMemoryMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMonitor for ProcessMemoryMonitor {
    fn current_mb(&self) -> f64 {
        let Some(pid) = self.pid else {
            return 0.0;
        };
        let mut system = self.system.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );
        system
            .process(pid)
            .map(|process| process.memory() as f64 / BYTES_PER_MB)
            .unwrap_or(0.0)
    }

    fn reclaim(&self) {
        // Batch buffers are dropped as soon as a batch finishes; all that is
        // left to release is the sampler's own process table.
        let mut system = self.system.lock();
        *system = System::new();
        log::debug!("memory above soft threshold, released sampler state");
    }
}

#[derive(Debug, Clone, Error)]
pub enum BatchError {
    #[error("batch {batch_index}: memory usage {usage_mb:.2}MB exceeds limit {limit_mb:.2}MB")]
    ResourceExhausted {
        batch_index: usize,
        usage_mb: f64,
        limit_mb: f64,
    },
    #[error("batch {batch_index} failed after {attempts} attempt(s): {message}")]
    Processing {
        batch_index: usize,
        attempts: u32,
        message: String,
    },
}

impl BatchError {
    pub fn code(&self) -> &'static str {
        match self {
            BatchError::ResourceExhausted { .. } => "RESOURCE_EXHAUSTED",
            BatchError::Processing { .. } => "BATCH_PROCESSING_ERROR",
        }
    }
}

/// One aggregated error per failed batch.
#[derive(Debug, Clone, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchFailure {
    pub error_code: String,
    pub message: String,
    pub batch_index: usize,
    pub batch_size: usize,
}

impl BatchFailure {
    fn new(error: &BatchError, batch_size: usize) -> Self {
        let batch_index = match error {
            BatchError::ResourceExhausted { batch_index, .. }
            | BatchError::Processing { batch_index, .. } => *batch_index,
        };
        Self {
            error_code: error.code().to_string(),
            message: error.to_string(),
            batch_index,
            batch_size,
        }
    }
}

/// Aggregate outcome of one scheduler run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult<R = ()> {
    pub batch_id: String,
    pub batch_count: usize,
    pub total_items: usize,
    pub processed_items: usize,
    pub failed_items: usize,
    /// Percentage of items processed successfully.
    pub success_rate: f64,
    pub errors: Vec<BatchFailure>,
    pub elapsed_ms: u64,
    pub peak_memory_mb: f64,
    pub reclaim_passes: usize,
    /// Outputs of successful batches, in batch order.
    #[serde(skip)]
    pub outputs: Vec<R>,
}

impl<R> BatchResult<R> {
    pub fn all_failed(&self) -> bool {
        self.total_items > 0 && self.processed_items == 0
    }
}

#[derive(Debug, Clone, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStatus {
    pub current_mb: f64,
    pub threshold_mb: f64,
    pub gc_threshold_mb: f64,
    pub usage_percentage: f64,
}

struct BatchOutcome<R> {
    size: usize,
    peak_memory_mb: f64,
    reclaimed: bool,
    result: Result<R, BatchError>,
}

#[derive(Clone)]
pub struct BatchScheduler {
    config: BatchConfig,
    monitor: Arc<dyn MemoryMonitor>,
}

impl fmt::Debug for BatchScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchScheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BatchScheduler {
    pub fn new(config: BatchConfig) -> Self {
        Self::with_monitor(config, Arc::new(ProcessMemoryMonitor::new()))
    }

    pub fn with_monitor(config: BatchConfig, monitor: Arc<dyn MemoryMonitor>) -> Self {
        Self { config, monitor }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn memory_status(&self) -> MemoryStatus {
        let current_mb = self.monitor.current_mb();
        let usage_percentage = if self.config.max_memory_mb > 0.0 {
            current_mb / self.config.max_memory_mb * 100.0
        } else {
            0.0
        };
        MemoryStatus {
            current_mb,
            threshold_mb: self.config.max_memory_mb,
            gc_threshold_mb: self.config.gc_threshold_mb,
            usage_percentage,
        }
    }

    /// Run `batch_fn` over `items` in batches of `batch_size`.
    pub async fn process<T, R, E, F, Fut>(&self, items: Vec<T>, batch_fn: F) -> BatchResult<R>
    where
        T: Clone,
        E: fmt::Display,
        F: Fn(Vec<T>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        let started = Instant::now();
        let batch_id = Uuid::new_v4().simple().to_string();
        let total_items = items.len();
        let batches = split_batches(items, self.config.batch_size);
        let batch_count = batches.len();
        let concurrency = self.config.max_concurrent_batches.max(1);

        log::info!(
            "batch run {}: {} items in {} batch(es), concurrency {}",
            batch_id,
            total_items,
            batch_count,
            concurrency
        );

        let semaphore = Semaphore::new(concurrency);
        let outcomes = join_all(batches.into_iter().enumerate().map(|(index, batch)| {
            let semaphore = &semaphore;
            let batch_fn = &batch_fn;
            async move {
                // The semaphore is never closed while the run is alive.
                let _permit = semaphore.acquire().await.ok();
                self.run_batch(index, batch, batch_fn).await
            }
        }))
        .await;

        let mut result = BatchResult {
            batch_id,
            batch_count,
            total_items,
            processed_items: 0,
            failed_items: 0,
            success_rate: 0.0,
            errors: Vec::new(),
            elapsed_ms: 0,
            peak_memory_mb: 0.0,
            reclaim_passes: 0,
            outputs: Vec::with_capacity(batch_count),
        };

        for outcome in outcomes {
            result.peak_memory_mb = result.peak_memory_mb.max(outcome.peak_memory_mb);
            if outcome.reclaimed {
                result.reclaim_passes += 1;
            }
            match outcome.result {
                Ok(output) => {
                    result.processed_items += outcome.size;
                    result.outputs.push(output);
                }
                Err(error) => {
                    result.failed_items += outcome.size;
                    result.errors.push(BatchFailure::new(&error, outcome.size));
                }
            }
        }

        if total_items > 0 {
            result.success_rate = result.processed_items as f64 / total_items as f64 * 100.0;
        }
        result.elapsed_ms = started.elapsed().as_millis() as u64;

        log::info!(
            "batch run {}: {} processed, {} failed in {}ms (peak {:.1}MB)",
            result.batch_id,
            result.processed_items,
            result.failed_items,
            result.elapsed_ms,
            result.peak_memory_mb
        );

        result
    }

    /// Run `batch_fn` over an unbounded stream, yielding one result per batch.
    ///
    /// Items are buffered until `batch_size` is reached (or the stream ends)
    /// and each buffer is handed to [`process`](Self::process).
    pub fn process_stream<S, T, R, E, F, Fut>(
        &self,
        items: S,
        batch_fn: F,
    ) -> impl Stream<Item = BatchResult<R>>
    where
        S: Stream<Item = T>,
        T: Clone,
        E: fmt::Display,
        F: Fn(Vec<T>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        let batch_size = self.config.batch_size.max(1);
        let state = (Box::pin(items), self.clone(), batch_fn, false);

        futures::stream::unfold(
            state,
            move |(mut items, scheduler, batch_fn, exhausted)| async move {
                if exhausted {
                    return None;
                }

                let mut buffer = Vec::with_capacity(batch_size);
                let mut ended = false;
                while buffer.len() < batch_size {
                    match items.next().await {
                        Some(item) => buffer.push(item),
                        None => {
                            ended = true;
                            break;
                        }
                    }
                }

                if buffer.is_empty() {
                    return None;
                }

                let result = scheduler.process(buffer, &batch_fn).await;
                Some((result, (items, scheduler, batch_fn, ended)))
            },
        )
    }

    async fn run_batch<T, R, E, F, Fut>(
        &self,
        index: usize,
        batch: Vec<T>,
        batch_fn: &F,
    ) -> BatchOutcome<R>
    where
        T: Clone,
        E: fmt::Display,
        F: Fn(Vec<T>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        let size = batch.len();
        let attempts = self.config.retry_attempts.max(1);
        let mut peak_memory_mb: f64 = 0.0;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            if self.config.enable_memory_monitoring {
                let usage_mb = self.monitor.current_mb();
                peak_memory_mb = peak_memory_mb.max(usage_mb);
                if usage_mb > self.config.max_memory_mb {
                    let error = BatchError::ResourceExhausted {
                        batch_index: index,
                        usage_mb,
                        limit_mb: self.config.max_memory_mb,
                    };
                    log::error!("{}", error);
                    return BatchOutcome {
                        size,
                        peak_memory_mb,
                        reclaimed: false,
                        result: Err(error),
                    };
                }
            }

            match batch_fn(batch.clone()).await {
                Ok(output) => {
                    let mut reclaimed = false;
                    if self.config.enable_memory_monitoring {
                        let usage_mb = self.monitor.current_mb();
                        peak_memory_mb = peak_memory_mb.max(usage_mb);
                        if usage_mb > self.config.gc_threshold_mb {
                            self.monitor.reclaim();
                            reclaimed = true;
                        }
                    }
                    log::debug!("batch {}: processed {} items", index, size);
                    return BatchOutcome {
                        size,
                        peak_memory_mb,
                        reclaimed,
                        result: Ok(output),
                    };
                }
                Err(e) => {
                    log::warn!(
                        "batch {} attempt {}/{} failed: {}",
                        index,
                        attempt,
                        attempts,
                        e
                    );
                    if attempt >= attempts {
                        return BatchOutcome {
                            size,
                            peak_memory_mb,
                            reclaimed: false,
                            result: Err(BatchError::Processing {
                                batch_index: index,
                                attempts,
                                message: e.to_string(),
                            }),
                        };
                    }
                    tokio::time::sleep(self.config.retry_delay * attempt).await;
                }
            }
        }
    }
}

fn split_batches<T>(items: Vec<T>, batch_size: usize) -> Vec<Vec<T>> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::with_capacity(items.len().div_ceil(batch_size));
    let mut iter = items.into_iter().peekable();
    while iter.peek().is_some() {
        batches.push(iter.by_ref().take(batch_size).collect());
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedMemory {
        mb: f64,
        reclaims: AtomicUsize,
    }

    impl FixedMemory {
        fn new(mb: f64) -> Arc<Self> {
            Arc::new(Self {
                mb,
                reclaims: AtomicUsize::new(0),
            })
        }
    }

    impl MemoryMonitor for FixedMemory {
        fn current_mb(&self) -> f64 {
            self.mb
        }

        fn reclaim(&self) {
            self.reclaims.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn scheduler(batch_size: usize, memory_mb: f64) -> (BatchScheduler, Arc<FixedMemory>) {
        let monitor = FixedMemory::new(memory_mb);
        let config = BatchConfig {
            batch_size,
            max_concurrent_batches: 2,
            max_memory_mb: 512.0,
            gc_threshold_mb: 256.0,
            retry_attempts: 3,
            retry_delay: Duration::from_millis(1),
            enable_memory_monitoring: true,
        };
        (BatchScheduler::with_monitor(config, monitor.clone()), monitor)
    }

    #[test]
    fn split_batches_rounds_up() {
        let batches = split_batches((0..25).collect::<Vec<_>>(), 10);
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        assert!(split_batches(Vec::<u8>::new(), 10).is_empty());
    }

    #[tokio::test]
    async fn processes_every_item_in_ceil_n_over_b_batches() {
        let (scheduler, _) = scheduler(10, 100.0);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let result = scheduler
            .process((0..25).collect(), |batch: Vec<u32>| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().push(batch.len());
                    Ok::<_, String>(batch.len())
                }
            })
            .await;

        assert_eq!(result.batch_count, 3);
        assert_eq!(result.total_items, 25);
        assert_eq!(result.processed_items, 25);
        assert_eq!(result.failed_items, 0);
        assert_eq!(result.outputs, vec![10, 10, 5]);
        assert_eq!(result.success_rate, 100.0);
        assert_eq!(seen.lock().len(), 3);
    }

    #[tokio::test]
    async fn always_failing_batch_is_attempted_retry_attempts_times() {
        let (scheduler, _) = scheduler(4, 100.0);
        let calls = Arc::new(AtomicUsize::new(0));

        let result = scheduler
            .process((0..4).collect(), |_batch: Vec<u32>| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("store unavailable")
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.failed_items, 4);
        assert_eq!(result.processed_items, 0);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].error_code, "BATCH_PROCESSING_ERROR");
        assert_eq!(result.errors[0].batch_size, 4);
        assert!(result.errors[0].message.contains("store unavailable"));
        assert!(result.all_failed());
    }

    #[tokio::test]
    async fn failed_batch_does_not_affect_others() {
        let (scheduler, _) = scheduler(5, 100.0);

        let result = scheduler
            .process((0..15).collect(), |batch: Vec<u32>| async move {
                if batch.contains(&7) {
                    Err("bad batch".to_string())
                } else {
                    Ok(batch.len())
                }
            })
            .await;

        assert_eq!(result.processed_items, 10);
        assert_eq!(result.failed_items, 5);
        assert_eq!(result.processed_items + result.failed_items, result.total_items);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].batch_index, 1);
        assert_eq!(result.outputs, vec![5, 5]);
    }

    #[tokio::test]
    async fn transient_failure_recovers_with_linear_backoff() {
        let monitor = FixedMemory::new(10.0);
        let config = BatchConfig {
            batch_size: 10,
            retry_attempts: 3,
            retry_delay: Duration::from_millis(20),
            ..BatchConfig::default()
        };
        let scheduler = BatchScheduler::with_monitor(config, monitor);
        let calls = Arc::new(AtomicUsize::new(0));
        let started = Instant::now();

        let result = scheduler
            .process(vec![1, 2, 3], |batch: Vec<u32>| {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("timeout")
                    } else {
                        Ok(batch.len())
                    }
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.processed_items, 3);
        assert!(result.errors.is_empty());
        // 20ms after the first failure, 40ms after the second.
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn memory_above_limit_aborts_without_calling_processor() {
        let (scheduler, _) = scheduler(5, 1024.0);
        let calls = Arc::new(AtomicUsize::new(0));

        let result = scheduler
            .process((0..10).collect(), |_batch: Vec<u32>| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(())
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(result.failed_items, 10);
        assert_eq!(result.errors.len(), 2);
        assert!(result
            .errors
            .iter()
            .all(|e| e.error_code == "RESOURCE_EXHAUSTED"));
        assert_eq!(result.peak_memory_mb, 1024.0);
    }

    #[tokio::test]
    async fn memory_above_soft_threshold_requests_reclaim() {
        let (scheduler, monitor) = scheduler(5, 300.0);

        let result = scheduler
            .process((0..10).collect(), |batch: Vec<u32>| async move {
                Ok::<_, String>(batch.len())
            })
            .await;

        assert_eq!(result.processed_items, 10);
        assert_eq!(result.reclaim_passes, 2);
        assert_eq!(monitor.reclaims.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn memory_status_reports_share_of_limit() {
        let (scheduler, _) = scheduler(5, 128.0);
        let status = scheduler.memory_status();
        assert_eq!(status.current_mb, 128.0);
        assert_eq!(status.threshold_mb, 512.0);
        assert_eq!(status.gc_threshold_mb, 256.0);
        assert_eq!(status.usage_percentage, 25.0);
    }

    #[tokio::test]
    async fn monitoring_disabled_ignores_memory() {
        let monitor = FixedMemory::new(4096.0);
        let config = BatchConfig {
            batch_size: 5,
            enable_memory_monitoring: false,
            ..BatchConfig::default()
        };
        let scheduler = BatchScheduler::with_monitor(config, monitor);

        let result = scheduler
            .process((0..5).collect(), |_batch: Vec<u32>| async move {
                Ok::<_, String>(())
            })
            .await;

        assert_eq!(result.processed_items, 5);
        assert_eq!(result.peak_memory_mb, 0.0);
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_semaphore() {
        let (scheduler, _) = scheduler(1, 10.0);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let result = scheduler
            .process((0..8).collect(), |_batch: Vec<u32>| {
                let in_flight = Arc::clone(&in_flight);
                let max_seen = Arc::clone(&max_seen);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(())
                }
            })
            .await;

        assert_eq!(result.processed_items, 8);
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
        assert!(max_seen.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn empty_input_produces_no_batches() {
        let (scheduler, _) = scheduler(10, 10.0);
        let result = scheduler
            .process(Vec::<u32>::new(), |_batch: Vec<u32>| async move {
                Ok::<_, String>(())
            })
            .await;
        assert_eq!(result.batch_count, 0);
        assert_eq!(result.total_items, 0);
        assert_eq!(result.success_rate, 0.0);
    }

    #[tokio::test]
    async fn stream_yields_one_result_per_batch() {
        let (scheduler, _) = scheduler(10, 10.0);
        let source = futures::stream::iter(0..25u32);

        let results: Vec<BatchResult<usize>> = scheduler
            .process_stream(source, |batch: Vec<u32>| async move {
                Ok::<_, String>(batch.len())
            })
            .collect()
            .await;

        let totals: Vec<usize> = results.iter().map(|r| r.total_items).collect();
        assert_eq!(totals, vec![10, 10, 5]);
        assert!(results.iter().all(|r| r.failed_items == 0));
    }

    #[tokio::test]
    async fn stream_of_exact_multiple_has_no_empty_tail() {
        let (scheduler, _) = scheduler(5, 10.0);
        let source = futures::stream::iter(0..10u32);

        let results: Vec<BatchResult<()>> = scheduler
            .process_stream(source, |_batch: Vec<u32>| async move { Ok::<_, String>(()) })
            .collect()
            .await;

        assert_eq!(results.len(), 2);
    }
}
