//! # Delivery Engine
//!
//! Drains the event queue, shapes each record through the
//! [`TransformChain`] and hands it to the consumer.
//!
//! ## Modes
//!
//! | Mode | Transforms | Consumer calls |
//! |------|------------|----------------|
//! | `Sequential` | in queue order | in queue order, one at a time |
//! | `SerialConsumer` | up to N concurrent workers | in queue order, one at a time |
//! | `PerPartition` | up to N concurrent workers | in queue order within each partition; partitions run concurrently |
//!
//! Sequential processing is used when configured, and always for stateful
//! record consumers. A batch consumer receives each batch in queue order
//! after its transforms completed.
//!
//! ## Acknowledgement
//!
//! Offsets are persisted only once the records they belong to are
//! acknowledged through the [`RecordCommitter`]. Per-record consumers are
//! acknowledged by the engine after each successful call; batch consumers
//! acknowledge explicitly.
//!
//! ## Shutdown
//!
//! On shutdown the engine stops polling, gives in-flight records the
//! configured grace period, then cancels what is left. Every record of a
//! batch ends up in exactly one bucket of the [`DeliveryReport`].

use crate::config::EngineConfig;
use crate::error::{CaptureError, Result};
use crate::event::{ChangeEvent, Partition};
use crate::metrics::CaptureMetrics;
use crate::offset::PartitionState;
use crate::offset_store::OffsetStore;
use crate::queue::EventQueue;
use crate::transform::TransformChain;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Consumer receiving one record at a time.
#[async_trait]
pub trait RecordConsumer: Send + Sync {
    async fn handle(&self, record: ChangeEvent) -> Result<()>;

    /// A stateful consumer keeps its own position bookkeeping and must see
    /// records strictly in queue order.
    fn is_stateful(&self) -> bool {
        false
    }
}

/// Consumer receiving whole batches and acknowledging records itself.
#[async_trait]
pub trait BatchConsumer: Send + Sync {
    async fn handle_batch(&self, records: Vec<ChangeEvent>, committer: &RecordCommitter)
        -> Result<()>;
}

/// The downstream collaborator.
#[derive(Clone)]
pub enum Consumer {
    Record(Arc<dyn RecordConsumer>),
    Batch(Arc<dyn BatchConsumer>),
}

impl Consumer {
    pub fn record(consumer: impl RecordConsumer + 'static) -> Self {
        Consumer::Record(Arc::new(consumer))
    }

    pub fn batch(consumer: impl BatchConsumer + 'static) -> Self {
        Consumer::Batch(Arc::new(consumer))
    }
}

#[derive(Debug, Default)]
struct Acks {
    /// Latest acknowledged state per partition
    marked: HashMap<Partition, PartitionState>,
    /// Acknowledged states released for commit
    ready: HashMap<Partition, PartitionState>,
}

/// Tracks acknowledged records until their offsets are committed.
#[derive(Debug, Default)]
pub struct RecordCommitter {
    acks: Mutex<Acks>,
}

impl RecordCommitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acknowledge a record.
    pub fn mark_processed(&self, record: &ChangeEvent) {
        self.mark(
            &record.partition,
            PartitionState::new(record.offset.clone()).with_incremental(record.incremental.clone()),
        );
    }

    fn mark(&self, partition: &Partition, state: PartitionState) {
        let mut acks = self.acks.lock();
        if let Some(current) = acks.marked.get(partition) {
            if matches!(
                state.offset.partial_cmp(&current.offset),
                Some(CmpOrdering::Less) | None
            ) {
                debug!(partition = %partition, offset = %state.offset, "Ignoring acknowledgement behind the latest one");
                return;
            }
        }
        acks.marked.insert(partition.clone(), state);
    }

    /// Release everything acknowledged so far for commit.
    pub fn mark_batch_finished(&self) {
        let mut acks = self.acks.lock();
        let marked = acks.marked.clone();
        acks.ready.extend(marked);
    }

    fn take_ready(&self) -> HashMap<Partition, PartitionState> {
        std::mem::take(&mut self.acks.lock().ready)
    }
}

/// What to do with a failed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    Retry,
    Skip,
    Fail,
}

/// Caller-supplied policy for transform and consumer failures.
pub trait DeliveryErrorHandler: Send + Sync {
    /// Decide after `attempt` failed attempts. `record` is the failed
    /// record, or the last record of a failed batch.
    fn on_error(&self, error: &CaptureError, record: Option<&ChangeEvent>, attempt: u32)
        -> ErrorAction;
}

/// Built-in error policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Stop delivery on the first failure
    #[default]
    FailFast,
    /// Drop the failed record and continue
    Skip,
    /// Retry up to `max_attempts` attempts in total, then fail
    Retry { max_attempts: u32 },
}

impl DeliveryErrorHandler for ErrorPolicy {
    fn on_error(&self, _error: &CaptureError, _record: Option<&ChangeEvent>, attempt: u32) -> ErrorAction {
        match self {
            ErrorPolicy::FailFast => ErrorAction::Fail,
            ErrorPolicy::Skip => ErrorAction::Skip,
            ErrorPolicy::Retry { max_attempts } if attempt < *max_attempts => ErrorAction::Retry,
            ErrorPolicy::Retry { .. } => ErrorAction::Fail,
        }
    }
}

/// How consumer calls are ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Sequential,
    SerialConsumer,
    PerPartition,
}

impl DeliveryMode {
    fn resolve(config: &EngineConfig, consumer: &Consumer) -> Self {
        match consumer {
            Consumer::Record(c) if config.record_processing_sequentially || c.is_stateful() => {
                DeliveryMode::Sequential
            }
            Consumer::Record(_) if config.record_processing_with_serial_consumer => {
                DeliveryMode::SerialConsumer
            }
            Consumer::Record(_) => DeliveryMode::PerPartition,
            Consumer::Batch(_) if config.record_processing_sequentially => DeliveryMode::Sequential,
            Consumer::Batch(_) => DeliveryMode::SerialConsumer,
        }
    }
}

/// Where the records of a batch (or a whole run) ended up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    /// Accepted by the consumer
    pub delivered: u64,
    /// Dropped by a transformation
    pub filtered: u64,
    /// Dropped by the error policy
    pub skipped: u64,
    /// Not finished before the shutdown grace period ran out
    pub cancelled: u64,
}

impl DeliveryReport {
    pub fn total(&self) -> u64 {
        self.delivered + self.filtered + self.skipped + self.cancelled
    }
}

#[derive(Debug, Default)]
struct Progress {
    delivered: AtomicU64,
    filtered: AtomicU64,
    skipped: AtomicU64,
    cancelled: AtomicU64,
}

impl Progress {
    fn settled(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
            + self.filtered.load(Ordering::Relaxed)
            + self.skipped.load(Ordering::Relaxed)
    }

    /// Report for a batch of `total` records; unsettled ones count as cancelled.
    fn report(&self, total: u64) -> DeliveryReport {
        let delivered = self.delivered.load(Ordering::Relaxed);
        let filtered = self.filtered.load(Ordering::Relaxed);
        let skipped = self.skipped.load(Ordering::Relaxed);
        DeliveryReport {
            delivered,
            filtered,
            skipped,
            cancelled: total.saturating_sub(delivered + filtered + skipped),
        }
    }

    fn add(&self, report: &DeliveryReport) {
        self.delivered.fetch_add(report.delivered, Ordering::Relaxed);
        self.filtered.fetch_add(report.filtered, Ordering::Relaxed);
        self.skipped.fetch_add(report.skipped, Ordering::Relaxed);
        self.cancelled.fetch_add(report.cancelled, Ordering::Relaxed);
    }

    fn total(&self) -> DeliveryReport {
        DeliveryReport {
            delivered: self.delivered.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

/// Result of the transform step.
enum Shaped {
    Record(ChangeEvent),
    Filtered,
    Skipped,
}

/// Final state of one record.
enum Outcome {
    Delivered,
    Filtered,
    Skipped,
    Cancelled,
}

type Ack = (Partition, PartitionState);

fn ack_of(event: &ChangeEvent) -> Ack {
    (
        event.partition.clone(),
        PartitionState::new(event.offset.clone()).with_incremental(event.incremental.clone()),
    )
}

type PendingShape = (Ack, oneshot::Receiver<Result<Shaped>>);

/// Wait for a spawned transform; `None` if it was cancelled.
async fn receive(rx: oneshot::Receiver<Result<Shaped>>, cancel: &CancellationToken) -> Result<Option<Shaped>> {
    match rx.await {
        Ok(shaped) => shaped.map(Some),
        Err(_) if cancel.is_cancelled() => Ok(None),
        Err(_) => Err(CaptureError::invalid_state("transform worker stopped")),
    }
}

struct Pipeline {
    consumer: Consumer,
    transforms: TransformChain,
    handler: Arc<dyn DeliveryErrorHandler>,
    committer: Arc<RecordCommitter>,
    metrics: Arc<CaptureMetrics>,
    workers: Arc<Semaphore>,
    mode: DeliveryMode,
}

impl Pipeline {
    fn handle_error(
        &self,
        error: CaptureError,
        record: Option<&ChangeEvent>,
        attempt: u32,
    ) -> Result<ErrorAction> {
        self.metrics.record_delivery_error(error.error_code());
        let action = self.handler.on_error(&error, record, attempt);
        warn!(
            error = %error,
            attempt,
            action = ?action,
            destination = record.map(|r| r.destination.as_str()).unwrap_or_default(),
            "Record processing failed"
        );
        match action {
            ErrorAction::Fail => Err(error),
            action => Ok(action),
        }
    }

    async fn transform(&self, event: ChangeEvent) -> Result<Shaped> {
        if self.transforms.is_empty() {
            return Ok(Shaped::Record(event));
        }
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.transforms.apply(event.clone()) {
                Ok(Some(shaped)) => return Ok(Shaped::Record(shaped)),
                Ok(None) => return Ok(Shaped::Filtered),
                Err(e) => {
                    if self.handle_error(e, Some(&event), attempt)? == ErrorAction::Skip {
                        return Ok(Shaped::Skipped);
                    }
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    async fn deliver(
        &self,
        consumer: &dyn RecordConsumer,
        record: ChangeEvent,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Outcome::Cancelled),
                result = consumer.handle(record.clone()) => result,
            };
            match result {
                Ok(()) => return Ok(Outcome::Delivered),
                Err(e) => {
                    if self.handle_error(e, Some(&record), attempt)? == ErrorAction::Skip {
                        return Ok(Outcome::Skipped);
                    }
                }
            }
        }
    }

    /// Count and acknowledge a finished record. Returns false once cancelled.
    fn settle(&self, ack: Ack, outcome: Outcome, progress: &Progress) -> bool {
        let counter = match outcome {
            Outcome::Delivered => &progress.delivered,
            Outcome::Filtered => &progress.filtered,
            Outcome::Skipped => &progress.skipped,
            Outcome::Cancelled => return false,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.committer.mark(&ack.0, ack.1);
        true
    }

    fn spawn_transforms(
        self: &Arc<Self>,
        batch: Vec<ChangeEvent>,
        cancel: &CancellationToken,
        tasks: &mut JoinSet<()>,
    ) -> Vec<PendingShape> {
        batch
            .into_iter()
            .map(|event| {
                let ack = ack_of(&event);
                let (tx, rx) = oneshot::channel();
                let pipeline = self.clone();
                let cancel = cancel.clone();
                tasks.spawn(async move {
                    let permit = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        permit = pipeline.workers.clone().acquire_owned() => permit,
                    };
                    let Ok(_permit) = permit else {
                        return;
                    };
                    let _ = tx.send(pipeline.transform(event).await);
                });
                (ack, rx)
            })
            .collect()
    }

    async fn run_sequential(
        &self,
        consumer: &Arc<dyn RecordConsumer>,
        batch: Vec<ChangeEvent>,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for event in batch {
            if cancel.is_cancelled() {
                break;
            }
            let ack = ack_of(&event);
            let outcome = match self.transform(event).await? {
                Shaped::Record(record) => self.deliver(consumer.as_ref(), record, cancel).await?,
                Shaped::Filtered => Outcome::Filtered,
                Shaped::Skipped => Outcome::Skipped,
            };
            if !self.settle(ack, outcome, progress) {
                break;
            }
        }
        Ok(())
    }

    /// Concurrent transforms feeding ordered delivery lanes: one lane per
    /// partition, or a single lane for the whole batch.
    async fn run_lanes(
        self: &Arc<Self>,
        consumer: &Arc<dyn RecordConsumer>,
        batch: Vec<ChangeEvent>,
        progress: &Arc<Progress>,
        cancel: &CancellationToken,
        per_partition: bool,
    ) -> Result<()> {
        let mut transforms = JoinSet::new();
        let pending = self.spawn_transforms(batch, cancel, &mut transforms);

        let mut lanes: Vec<Vec<PendingShape>> = Vec::new();
        let mut lane_of: HashMap<Partition, usize> = HashMap::new();
        for item in pending {
            let lane = if per_partition {
                *lane_of.entry(item.0 .0.clone()).or_insert_with(|| {
                    lanes.push(Vec::new());
                    lanes.len() - 1
                })
            } else {
                if lanes.is_empty() {
                    lanes.push(Vec::new());
                }
                0
            };
            lanes[lane].push(item);
        }

        let mut deliveries = JoinSet::new();
        for lane in lanes {
            let pipeline = self.clone();
            let consumer = consumer.clone();
            let progress = progress.clone();
            let cancel = cancel.clone();
            deliveries.spawn(async move {
                for (ack, rx) in lane {
                    let outcome = match receive(rx, &cancel).await? {
                        None => Outcome::Cancelled,
                        Some(Shaped::Record(record)) => {
                            pipeline.deliver(consumer.as_ref(), record, &cancel).await?
                        }
                        Some(Shaped::Filtered) => Outcome::Filtered,
                        Some(Shaped::Skipped) => Outcome::Skipped,
                    };
                    if !pipeline.settle(ack, outcome, &progress) {
                        break;
                    }
                }
                Ok::<(), CaptureError>(())
            });
        }

        let mut failure = None;
        while let Some(joined) = deliveries.join_next().await {
            let result = joined
                .map_err(|e| CaptureError::invalid_state(format!("delivery worker failed: {}", e)))
                .and_then(|r| r);
            if let Err(e) = result {
                if failure.is_none() {
                    // Stop the other lanes; what they finished stays counted.
                    cancel.cancel();
                    failure = Some(e);
                }
            }
        }
        transforms.abort_all();
        failure.map_or(Ok(()), Err)
    }

    async fn run_batch(
        self: &Arc<Self>,
        consumer: &Arc<dyn BatchConsumer>,
        batch: Vec<ChangeEvent>,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut shaped = Vec::with_capacity(batch.len());
        if self.mode == DeliveryMode::Sequential {
            for event in batch {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                shaped.push(self.transform(event).await?);
            }
        } else {
            let mut tasks = JoinSet::new();
            for (_, rx) in self.spawn_transforms(batch, cancel, &mut tasks) {
                match receive(rx, cancel).await? {
                    Some(s) => shaped.push(s),
                    None => return Ok(()),
                }
            }
        }

        let mut records = Vec::with_capacity(shaped.len());
        for s in shaped {
            match s {
                Shaped::Record(record) => records.push(record),
                Shaped::Filtered => {
                    progress.filtered.fetch_add(1, Ordering::Relaxed);
                }
                Shaped::Skipped => {
                    progress.skipped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        if records.is_empty() {
            return Ok(());
        }

        let count = records.len() as u64;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                result = consumer.handle_batch(records.clone(), &self.committer) => result,
            };
            match result {
                Ok(()) => {
                    progress.delivered.fetch_add(count, Ordering::Relaxed);
                    return Ok(());
                }
                Err(e) => {
                    if self.handle_error(e, records.last(), attempt)? == ErrorAction::Skip {
                        progress.skipped.fetch_add(count, Ordering::Relaxed);
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn process(
        self: Arc<Self>,
        batch: Vec<ChangeEvent>,
        progress: Arc<Progress>,
        cancel: CancellationToken,
    ) -> Result<()> {
        match (&self.consumer, self.mode) {
            (Consumer::Record(c), DeliveryMode::Sequential) => {
                self.run_sequential(c, batch, &progress, &cancel).await
            }
            (Consumer::Record(c), mode) => {
                let per_partition = mode == DeliveryMode::PerPartition;
                self.run_lanes(c, batch, &progress, &cancel, per_partition)
                    .await
            }
            (Consumer::Batch(c), _) => self.run_batch(c, batch, &progress, &cancel).await,
        }
    }
}

/// Drains the event queue into the consumer.
pub struct DeliveryEngine {
    queue: Arc<EventQueue>,
    pipeline: Arc<Pipeline>,
    offset_store: Option<Arc<dyn OffsetStore>>,
    config: EngineConfig,
    shutdown: CancellationToken,
    totals: Progress,
}

impl DeliveryEngine {
    pub fn builder(queue: Arc<EventQueue>, consumer: Consumer) -> DeliveryEngineBuilder {
        DeliveryEngineBuilder::new(queue, consumer)
    }

    pub fn mode(&self) -> DeliveryMode {
        self.pipeline.mode
    }

    pub fn committer(&self) -> &Arc<RecordCommitter> {
        &self.pipeline.committer
    }

    /// Token that stops the engine when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop polling; in-flight records get the configured grace period.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Totals over every processed batch.
    pub fn report(&self) -> DeliveryReport {
        self.totals.total()
    }

    /// Poll and process batches until the queue is closed and drained, or
    /// shutdown is requested.
    pub async fn run(&self) -> Result<DeliveryReport> {
        info!(
            mode = ?self.pipeline.mode,
            workers = self.config.record_processing_threads,
            "Delivery engine started"
        );
        loop {
            let batch = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                polled = self.queue.poll() => match polled {
                    Ok(batch) => batch,
                    Err(e) if e.is_shutdown() => {
                        debug!("Event queue closed and drained");
                        break;
                    }
                    Err(e) => return Err(e),
                },
            };
            if !batch.is_empty() {
                self.process(batch).await?;
            }
        }

        let report = self.report();
        info!(
            delivered = report.delivered,
            filtered = report.filtered,
            skipped = report.skipped,
            cancelled = report.cancelled,
            "Delivery engine stopped"
        );
        Ok(report)
    }

    /// Process one batch.
    ///
    /// Acknowledged offsets are committed even when the batch fails or is
    /// cut short by shutdown.
    pub async fn process(&self, batch: Vec<ChangeEvent>) -> Result<DeliveryReport> {
        if batch.is_empty() {
            return Ok(DeliveryReport::default());
        }
        let total = batch.len() as u64;
        let started = Instant::now();
        let progress = Arc::new(Progress::default());
        let abort = CancellationToken::new();

        let mut work = Box::pin(
            self.pipeline
                .clone()
                .process(batch, progress.clone(), abort.clone()),
        );
        let result = tokio::select! {
            biased;
            result = &mut work => result,
            _ = self.shutdown.cancelled() => {
                let grace = self.config.shutdown_timeout();
                info!(
                    in_flight = total - progress.settled(),
                    grace_ms = grace.as_millis() as u64,
                    "Waiting for in-flight records"
                );
                match tokio::time::timeout(grace, &mut work).await {
                    Ok(result) => result,
                    Err(_) => {
                        abort.cancel();
                        work.await
                    }
                }
            }
        };

        let report = progress.report(total);
        self.totals.add(&report);
        self.metrics().record_delivered(report.delivered);
        self.metrics().record_skipped(report.skipped + report.filtered);
        self.metrics().record_cancelled(report.cancelled);
        self.metrics().record_batch_duration(started.elapsed());
        if report.cancelled > 0 {
            warn!(
                delivered = report.delivered,
                cancelled = report.cancelled,
                "Batch cut short"
            );
        }

        if let Consumer::Record(_) = self.pipeline.consumer {
            self.pipeline.committer.mark_batch_finished();
        }
        let committed = self.commit().await;
        result?;
        committed?;
        Ok(report)
    }

    fn metrics(&self) -> &CaptureMetrics {
        &self.pipeline.metrics
    }

    async fn commit(&self) -> Result<()> {
        let ready = self.pipeline.committer.take_ready();
        let Some(store) = &self.offset_store else {
            return Ok(());
        };
        for (partition, state) in ready {
            store.commit(&partition, &state).await?;
        }
        Ok(())
    }
}

/// Builder for [`DeliveryEngine`].
pub struct DeliveryEngineBuilder {
    queue: Arc<EventQueue>,
    consumer: Consumer,
    transforms: TransformChain,
    handler: Arc<dyn DeliveryErrorHandler>,
    offset_store: Option<Arc<dyn OffsetStore>>,
    config: EngineConfig,
    metrics: Option<Arc<CaptureMetrics>>,
}

impl DeliveryEngineBuilder {
    pub fn new(queue: Arc<EventQueue>, consumer: Consumer) -> Self {
        Self {
            queue,
            consumer,
            transforms: TransformChain::new(),
            handler: Arc::new(ErrorPolicy::FailFast),
            offset_store: None,
            config: EngineConfig::default(),
            metrics: None,
        }
    }

    pub fn with_transforms(mut self, transforms: TransformChain) -> Self {
        self.transforms = transforms;
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.handler = Arc::new(policy);
        self
    }

    pub fn with_error_handler(mut self, handler: Arc<dyn DeliveryErrorHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn with_offset_store(mut self, store: Arc<dyn OffsetStore>) -> Self {
        self.offset_store = Some(store);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<CaptureMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<DeliveryEngine> {
        if self.config.record_processing_threads == 0 {
            return Err(CaptureError::config(
                "engine.record_processing_threads must be positive",
            ));
        }
        let mode = DeliveryMode::resolve(&self.config, &self.consumer);
        let pipeline = Pipeline {
            consumer: self.consumer,
            transforms: self.transforms,
            handler: self.handler,
            committer: Arc::new(RecordCommitter::new()),
            metrics: self
                .metrics
                .unwrap_or_else(|| Arc::new(CaptureMetrics::new("default"))),
            workers: Arc::new(Semaphore::new(self.config.record_processing_threads)),
            mode,
        };
        Ok(DeliveryEngine {
            queue: self.queue,
            pipeline: Arc::new(pipeline),
            offset_store: self.offset_store,
            config: self.config,
            shutdown: CancellationToken::new(),
            totals: Progress::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::event::{EventOp, TableId};
    use crate::offset::{LogPosition, Offset};
    use crate::offset_store::MemoryOffsetStore;
    use crate::transform::FnTransform;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn event(server: &str, n: u64) -> ChangeEvent {
        ChangeEvent::change(
            Partition::new(server, "db"),
            TableId::new("db", "t"),
            EventOp::Insert,
            json!(n),
            None,
            Some(json!({"id": n})),
            Offset::Log(LogPosition::new("mysql-bin.000001", 4 + n * 100)),
            0,
        )
    }

    #[derive(Default)]
    struct Collect {
        seen: Mutex<Vec<ChangeEvent>>,
        delay: Duration,
        failures: AtomicU32,
    }

    impl Collect {
        fn keys(&self) -> Vec<serde_json::Value> {
            self.seen.lock().iter().map(|e| e.key.clone()).collect()
        }
    }

    #[async_trait]
    impl RecordConsumer for Collect {
        async fn handle(&self, record: ChangeEvent) -> Result<()> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(CaptureError::consumer("downstream unavailable"));
            }
            self.seen.lock().push(record);
            Ok(())
        }
    }

    #[async_trait]
    impl RecordConsumer for Arc<Collect> {
        async fn handle(&self, record: ChangeEvent) -> Result<()> {
            self.as_ref().handle(record).await
        }
    }

    fn queue() -> Arc<EventQueue> {
        Arc::new(EventQueue::new(QueueConfig::default()))
    }

    #[test]
    fn test_mode_resolution() {
        struct Stateful;
        #[async_trait]
        impl RecordConsumer for Stateful {
            async fn handle(&self, _: ChangeEvent) -> Result<()> {
                Ok(())
            }
            fn is_stateful(&self) -> bool {
                true
            }
        }

        let parallel = EngineConfig::parallel(4);
        let mode = |config: &EngineConfig, consumer: Consumer| DeliveryMode::resolve(config, &consumer);
        assert_eq!(mode(&EngineConfig::default(), Consumer::record(Collect::default())), DeliveryMode::Sequential);
        assert_eq!(mode(&parallel, Consumer::record(Collect::default())), DeliveryMode::PerPartition);
        assert_eq!(mode(&parallel, Consumer::record(Stateful)), DeliveryMode::Sequential);
        assert_eq!(
            mode(&parallel.clone().with_serial_consumer(true), Consumer::record(Collect::default())),
            DeliveryMode::SerialConsumer
        );
    }

    #[tokio::test]
    async fn test_sequential_delivery_commits_offsets() {
        let consumer = Arc::new(Collect::default());
        let store = Arc::new(MemoryOffsetStore::new());
        let engine = DeliveryEngine::builder(queue(), Consumer::record(consumer.clone()))
            .with_offset_store(store.clone())
            .build()
            .unwrap();

        let report = engine
            .process((1..=5).map(|n| event("s1", n)).collect())
            .await
            .unwrap();
        assert_eq!(report.delivered, 5);
        assert_eq!(consumer.keys(), (1..=5).map(|n| json!(n)).collect::<Vec<_>>());

        let committed = store.get(&Partition::new("s1", "db")).await.unwrap();
        assert_eq!(committed.offset, event("s1", 5).offset);
    }

    #[tokio::test]
    async fn test_filtered_records_are_acknowledged() {
        let consumer = Arc::new(Collect::default());
        let engine = DeliveryEngine::builder(queue(), Consumer::record(consumer.clone()))
            .with_transforms(TransformChain::new().add(FnTransform::new("DropEven", |e: ChangeEvent| {
                Ok((e.key.as_u64().unwrap_or(0) % 2 == 1).then_some(e))
            })))
            .build()
            .unwrap();

        let report = engine
            .process((1..=4).map(|n| event("s1", n)).collect())
            .await
            .unwrap();
        assert_eq!((report.delivered, report.filtered), (2, 2));
        assert_eq!(consumer.keys(), vec![json!(1), json!(3)]);
    }

    #[tokio::test]
    async fn test_error_policies() {
        let retrying = Arc::new(Collect {
            failures: AtomicU32::new(2),
            ..Default::default()
        });
        let engine = DeliveryEngine::builder(queue(), Consumer::record(retrying.clone()))
            .with_error_policy(ErrorPolicy::Retry { max_attempts: 3 })
            .build()
            .unwrap();
        assert_eq!(engine.process(vec![event("s1", 1)]).await.unwrap().delivered, 1);

        let skipping = Arc::new(Collect {
            failures: AtomicU32::new(1),
            ..Default::default()
        });
        let engine = DeliveryEngine::builder(queue(), Consumer::record(skipping.clone()))
            .with_error_policy(ErrorPolicy::Skip)
            .build()
            .unwrap();
        let report = engine
            .process(vec![event("s1", 1), event("s1", 2)])
            .await
            .unwrap();
        assert_eq!((report.delivered, report.skipped), (1, 1));
        assert_eq!(skipping.keys(), vec![json!(2)]);

        let failing = Arc::new(Collect {
            failures: AtomicU32::new(1),
            ..Default::default()
        });
        let store = Arc::new(MemoryOffsetStore::new());
        let engine = DeliveryEngine::builder(queue(), Consumer::record(failing))
            .with_offset_store(store.clone())
            .build()
            .unwrap();
        let err = engine.process(vec![event("s1", 1)]).await.unwrap_err();
        assert!(matches!(err, CaptureError::Consumer(_)));
        assert!(store.get(&Partition::new("s1", "db")).await.is_none());
    }

    #[tokio::test]
    async fn test_parallel_keeps_partition_order() {
        let consumer = Arc::new(Collect {
            delay: Duration::from_millis(1),
            ..Default::default()
        });
        let engine = DeliveryEngine::builder(queue(), Consumer::record(consumer.clone()))
            .with_config(EngineConfig::parallel(4))
            .build()
            .unwrap();

        let batch: Vec<_> = (1..=20)
            .map(|n| event(if n % 2 == 0 { "s1" } else { "s2" }, n))
            .collect();
        assert_eq!(engine.process(batch).await.unwrap().delivered, 20);

        let seen = consumer.seen.lock().clone();
        for server in ["s1", "s2"] {
            let keys: Vec<u64> = seen
                .iter()
                .filter(|e| e.partition.server_name == server)
                .filter_map(|e| e.key.as_u64())
                .collect();
            let mut sorted = keys.clone();
            sorted.sort_unstable();
            assert_eq!(keys, sorted);
        }
    }

    #[tokio::test]
    async fn test_batch_consumer_commits_only_acknowledged() {
        struct AckFirst;
        #[async_trait]
        impl BatchConsumer for AckFirst {
            async fn handle_batch(&self, records: Vec<ChangeEvent>, committer: &RecordCommitter) -> Result<()> {
                committer.mark_processed(&records[0]);
                committer.mark_batch_finished();
                Ok(())
            }
        }

        let store = Arc::new(MemoryOffsetStore::new());
        let engine = DeliveryEngine::builder(queue(), Consumer::batch(AckFirst))
            .with_offset_store(store.clone())
            .build()
            .unwrap();
        let report = engine
            .process(vec![event("s1", 1), event("s1", 2)])
            .await
            .unwrap();
        assert_eq!(report.delivered, 2);
        let committed = store.get(&Partition::new("s1", "db")).await.unwrap();
        assert_eq!(committed.offset, event("s1", 1).offset);
    }

    #[tokio::test]
    async fn test_shutdown_reports_cancelled_records() {
        let consumer = Arc::new(Collect {
            delay: Duration::from_millis(50),
            ..Default::default()
        });
        let engine = Arc::new(
            DeliveryEngine::builder(queue(), Consumer::record(consumer.clone()))
                .with_config(EngineConfig::default().with_shutdown_timeout(Duration::from_millis(120)))
                .build()
                .unwrap(),
        );

        let stopper = engine.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            stopper.shutdown();
        });

        let report = engine
            .process((1..=10).map(|n| event("s1", n)).collect())
            .await
            .unwrap();
        assert_eq!(report.total(), 10);
        assert!(report.cancelled > 0);
        assert_eq!(report.delivered, consumer.seen.lock().len() as u64);
    }
}
