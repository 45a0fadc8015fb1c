//! # Capture Orchestrator
//!
//! Owns the phase sources and sequences them:
//!
//! ```text
//! Initializing ──► Snapshotting ──► Streaming ──► Stopped
//!       │               │               │  ▲
//!       │               │               │  └── incremental snapshot overlay
//!       └───────────────┴───────────────┴────► Failed
//! ```
//!
//! - The first phase follows from the
//!   [`SnapshotMode`](crate::snapshot::SnapshotMode) and the persisted
//!   partition state.
//! - Streaming starts only after the snapshot completed and the event
//!   queue released its buffered final snapshot record, so every snapshot
//!   event precedes every streaming event.
//! - Incremental snapshots run next to streaming, started by an
//!   `execute-snapshot` signal, by `incremental.auto_start_tables`, or by a
//!   persisted cursor, and paused, resumed or stopped by signals.
//! - On failure no new events are produced; what is already queued still
//!   drains, and the caller receives the offset capture stopped at.
//!
//! # Example
//!
//! ```rust,ignore
//! let orchestrator = CaptureOrchestrator::builder(config, connector)
//!     .with_offset_store(store.clone())
//!     .build()
//!     .await?;
//! let engine = orchestrator.delivery_engine(Consumer::record(sink)).build()?;
//! let handle = orchestrator.handle();
//!
//! let capture = tokio::spawn(orchestrator.run());
//! let delivery = tokio::spawn(async move { engine.run().await });
//! // ...
//! handle.stop().await?;
//! ```

use crate::config::CaptureConfig;
use crate::delivery::{Consumer, DeliveryEngineBuilder};
use crate::dispatcher::EventDispatcher;
use crate::error::{CaptureError, CaptureFailure, Result};
use crate::event::Partition;
use crate::incremental_snapshot::{IncrementalCursor, WatermarkStrategy};
use crate::metrics::CaptureMetrics;
use crate::offset::{Offset, OffsetState, PartitionState, SnapshotOffset};
use crate::offset_store::OffsetStore;
use crate::queue::EventQueue;
use crate::signal::{Signal, SignalAction, SignalChannel, SignalSource};
use crate::snapshot::StartupAction;
use crate::source::{PhaseContext, PhaseKind, PhaseRegistry, PhaseResult, PhaseSetup, PhaseSource, ResolvedPhases};
use crate::upstream::{connect_within, SourceConnector};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Buffer of the control signal channel.
const CONTROL_CHANNEL_SIZE: usize = 64;

/// Main phase of the capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    /// Built, not yet running
    Initializing,
    Snapshotting,
    Streaming,
    /// Clean shutdown
    Stopped,
    /// Unrecoverable error
    Failed,
}

impl CaptureState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CaptureState::Stopped | CaptureState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureState::Initializing => "initializing",
            CaptureState::Snapshotting => "snapshotting",
            CaptureState::Streaming => "streaming",
            CaptureState::Stopped => "stopped",
            CaptureState::Failed => "failed",
        }
    }
}

/// Published capture status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureStatus {
    pub state: CaptureState,
    /// Whether an incremental snapshot is running alongside streaming
    pub incremental_snapshot: bool,
}

/// Control handle for a running capture.
#[derive(Clone)]
pub struct CaptureHandle {
    status: watch::Receiver<CaptureStatus>,
    control: SignalChannel,
    cancel: CancellationToken,
    stop_timeout: std::time::Duration,
}

impl CaptureHandle {
    pub fn status(&self) -> CaptureStatus {
        *self.status.borrow()
    }

    pub fn state(&self) -> CaptureState {
        self.status.borrow().state
    }

    /// Wait until the status satisfies `predicate`.
    ///
    /// Returns the last published status if the capture finished first.
    pub async fn wait_until(&self, predicate: impl Fn(&CaptureStatus) -> bool) -> CaptureStatus {
        let mut status = self.status.clone();
        let reached = status.wait_for(|s| predicate(s)).await.map(|s| *s);
        match reached {
            Ok(s) => s,
            Err(_) => *status.borrow(),
        }
    }

    /// Send a control signal (`execute-snapshot`, `pause-snapshot`, ...).
    ///
    /// This is the only signal path for read-only connections.
    pub async fn send_signal(&self, signal: Signal) -> Result<()> {
        self.control.send(signal.with_source(SignalSource::Api)).await
    }

    /// Request shutdown and wait for the capture to stop.
    ///
    /// Fails with [`CaptureError::Timeout`] if it does not stop within the
    /// task management timeout.
    pub async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        let mut status = self.status.clone();
        let stopped = tokio::time::timeout(self.stop_timeout, status.wait_for(|s| s.state.is_terminal()))
            .await
            .is_ok();
        if stopped {
            Ok(())
        } else {
            Err(CaptureError::timeout(format!(
                "capture did not stop within {}ms",
                self.stop_timeout.as_millis()
            )))
        }
    }
}

/// Builder for [`CaptureOrchestrator`].
pub struct CaptureOrchestratorBuilder {
    config: CaptureConfig,
    connector: Arc<dyn SourceConnector>,
    registry: PhaseRegistry,
    offset_store: Option<Arc<dyn OffsetStore>>,
    metrics: Option<Arc<CaptureMetrics>>,
}

impl CaptureOrchestratorBuilder {
    pub fn with_registry(mut self, registry: PhaseRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Store the persisted partition state is loaded from.
    pub fn with_offset_store(mut self, store: Arc<dyn OffsetStore>) -> Self {
        self.offset_store = Some(store);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<CaptureMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate the configuration, connect, load the persisted state and
    /// resolve the phase sources.
    ///
    /// Configuration problems (including read-only incremental snapshots
    /// without GTIDs) fail here, before any phase starts.
    pub async fn build(self) -> Result<CaptureOrchestrator> {
        self.config.validate()?;
        let config = Arc::new(self.config);
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(CaptureMetrics::new(config.server_name.clone())));
        let partition = Partition::new(config.server_name.clone(), config.database.clone());

        let connection =
            connect_within(self.connector.as_ref(), config.engine.task_management_timeout()).await?;
        let watermark = WatermarkStrategy::resolve(&config, connection.gtid_enabled())?;

        let persisted = match &self.offset_store {
            Some(store) => store.load(&partition).await?,
            None => None,
        };

        let setup = PhaseSetup {
            config: config.clone(),
            connection,
            watermark: watermark.clone(),
            metrics: metrics.clone(),
        };
        let phases = ResolvedPhases::resolve(&self.registry, &setup)?;

        let queue = Arc::new(EventQueue::new(config.queue.clone()).with_metrics(metrics.clone()));
        let offsets = Arc::new(OffsetState::new());
        let (control, control_rx) = SignalChannel::new(CONTROL_CHANNEL_SIZE);
        let dispatcher = Arc::new(EventDispatcher::new(
            partition.clone(),
            queue,
            offsets.clone(),
            control.clone(),
            metrics.clone(),
        ));
        let (status, _) = watch::channel(CaptureStatus {
            state: CaptureState::Initializing,
            incremental_snapshot: false,
        });

        info!(
            partition = %partition,
            snapshot_mode = config.snapshot_mode.as_str(),
            watermark = watermark.as_ref().map(WatermarkStrategy::as_str).unwrap_or("disabled"),
            persisted = ?persisted.as_ref().map(|s| s.offset.to_string()),
            "Capture orchestrator ready"
        );

        Ok(CaptureOrchestrator {
            config,
            partition,
            phases,
            dispatcher,
            offsets,
            metrics,
            offset_store: self.offset_store,
            persisted,
            control,
            control_rx: Some(control_rx),
            status,
            cancel: CancellationToken::new(),
        })
    }
}

enum Step {
    Streaming(std::result::Result<PhaseResult, JoinError>),
    Incremental(std::result::Result<PhaseResult, JoinError>),
    Signal(Option<Signal>),
    Stop,
}

async fn join_opt(handle: &mut Option<JoinHandle<PhaseResult>>) -> std::result::Result<PhaseResult, JoinError> {
    match handle {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

/// Sequences the capture phases of one partition.
pub struct CaptureOrchestrator {
    config: Arc<CaptureConfig>,
    partition: Partition,
    phases: ResolvedPhases,
    dispatcher: Arc<EventDispatcher>,
    offsets: Arc<OffsetState>,
    metrics: Arc<CaptureMetrics>,
    offset_store: Option<Arc<dyn OffsetStore>>,
    persisted: Option<PartitionState>,
    control: SignalChannel,
    control_rx: Option<mpsc::Receiver<Signal>>,
    status: watch::Sender<CaptureStatus>,
    cancel: CancellationToken,
}

impl CaptureOrchestrator {
    pub fn builder(config: CaptureConfig, connector: Arc<dyn SourceConnector>) -> CaptureOrchestratorBuilder {
        CaptureOrchestratorBuilder {
            config,
            connector,
            registry: PhaseRegistry::with_defaults(),
            offset_store: None,
            metrics: None,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Queue the delivery engine drains.
    pub fn queue(&self) -> Arc<EventQueue> {
        self.dispatcher.queue().clone()
    }

    pub fn offsets(&self) -> &Arc<OffsetState> {
        &self.offsets
    }

    pub fn metrics(&self) -> &Arc<CaptureMetrics> {
        &self.metrics
    }

    /// Partition state loaded at build time.
    pub fn persisted_state(&self) -> Option<&PartitionState> {
        self.persisted.as_ref()
    }

    pub fn handle(&self) -> CaptureHandle {
        CaptureHandle {
            status: self.status.subscribe(),
            control: self.control.clone(),
            cancel: self.cancel.clone(),
            stop_timeout: self.config.engine.task_management_timeout(),
        }
    }

    /// Delivery engine builder wired to this capture's queue, engine
    /// settings, metrics and offset store.
    pub fn delivery_engine(&self, consumer: Consumer) -> DeliveryEngineBuilder {
        let builder = DeliveryEngineBuilder::new(self.queue(), consumer)
            .with_config(self.config.engine.clone())
            .with_metrics(self.metrics.clone());
        match &self.offset_store {
            Some(store) => builder.with_offset_store(store.clone()),
            None => builder,
        }
    }

    fn set_state(&self, state: CaptureState) {
        self.status.send_modify(|s| {
            s.state = state;
            if state.is_terminal() {
                s.incremental_snapshot = false;
            }
        });
        if !state.is_terminal() {
            self.metrics.record_phase(state.as_str());
        }
    }

    fn set_incremental(&self, running: bool) {
        self.status.send_modify(|s| s.incremental_snapshot = running);
    }

    /// Run until stopped or failed.
    ///
    /// Returns the last admitted offset on a clean stop. The event queue is
    /// closed on return, so a delivery engine drains what was admitted and
    /// then stops.
    pub async fn run(mut self) -> std::result::Result<Option<Offset>, CaptureFailure> {
        let control_rx = match self.control_rx.take() {
            Some(rx) => rx,
            None => {
                return Err(CaptureFailure::new(
                    CaptureError::invalid_state("capture already started"),
                    None,
                ))
            }
        };

        let result = self.execute(control_rx).await;
        self.dispatcher.queue().close();

        match result {
            Ok(offset) => {
                self.set_state(CaptureState::Stopped);
                info!(
                    partition = %self.partition,
                    offset = ?offset.as_ref().map(ToString::to_string),
                    "Capture stopped"
                );
                Ok(offset)
            }
            Err(cause) => {
                let offset = self.dispatcher.last_offset();
                self.set_state(CaptureState::Failed);
                error!(
                    partition = %self.partition,
                    error = %cause,
                    code = cause.error_code(),
                    offset = ?offset.as_ref().map(ToString::to_string),
                    "Capture failed"
                );
                Err(CaptureFailure::new(cause, offset))
            }
        }
    }

    async fn execute(&self, control_rx: mpsc::Receiver<Signal>) -> Result<Option<Offset>> {
        let persisted_offset = self.persisted.as_ref().map(|s| &s.offset);
        let action = self.config.snapshot_mode.startup(persisted_offset);
        debug!(partition = %self.partition, action = ?action, "Startup decided");

        let (from, cursor) = match action {
            StartupAction::Snapshot { resume } => {
                if let Some(Offset::Snapshot(s)) = &resume {
                    // The interrupted table is read again from its first row.
                    let restart = Offset::Snapshot(SnapshotOffset { row: 0, ..s.clone() });
                    self.offsets
                        .restore(self.partition.clone(), PartitionState::new(restart));
                }
                match self.snapshot(resume).await? {
                    Some(completed) if self.config.snapshot_mode.should_stream() => {
                        (Some(completed), None)
                    }
                    Some(completed) => {
                        info!(partition = %self.partition, "Snapshot-only mode, not streaming");
                        return Ok(Some(completed));
                    }
                    None => return Ok(self.dispatcher.last_offset()),
                }
            }
            StartupAction::Stop { at } => {
                info!(
                    partition = %self.partition,
                    offset = %at,
                    "Snapshot-only mode, snapshot already completed"
                );
                self.offsets
                    .restore(self.partition.clone(), PartitionState::new(at.clone()));
                return Ok(Some(at));
            }
            StartupAction::Stream { from } => {
                let cursor = self.persisted.as_ref().and_then(|s| s.incremental.clone());
                if let Some(from) = &from {
                    self.offsets.restore(
                        self.partition.clone(),
                        PartitionState::new(from.clone()).with_incremental(cursor.clone()),
                    );
                }
                (from, cursor)
            }
        };

        self.stream(from, cursor, control_rx).await
    }

    /// Run the snapshot phase. Returns the completed offset, or `None` if
    /// it was interrupted.
    async fn snapshot(&self, resume: Option<Offset>) -> Result<Option<Offset>> {
        self.set_state(CaptureState::Snapshotting);
        let ctx = PhaseContext::new(self.partition.clone(), resume, self.cancel.child_token());
        let result = self.phases.snapshot.execute(ctx, self.dispatcher.clone()).await;

        // Releases a final snapshot record still held by an interrupted run.
        self.dispatcher.queue().disable_buffering();

        match result {
            PhaseResult::Completed(offset) => Ok(Some(offset)),
            PhaseResult::Interrupted(offset) => {
                info!(
                    partition = %self.partition,
                    offset = ?offset.as_ref().map(ToString::to_string),
                    "Snapshot interrupted"
                );
                Ok(None)
            }
            PhaseResult::Failed(e) => Err(e),
        }
    }

    async fn stream(
        &self,
        from: Option<Offset>,
        cursor: Option<IncrementalCursor>,
        mut control_rx: mpsc::Receiver<Signal>,
    ) -> Result<Option<Offset>> {
        self.set_state(CaptureState::Streaming);
        let cancel = self.cancel.child_token();
        let ctx = PhaseContext::new(self.partition.clone(), from, cancel.clone());
        let mut streaming = {
            let phase = self.phases.streaming.clone();
            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move { phase.execute(ctx, dispatcher).await })
        };

        let mut incremental = None;
        if let Err(e) = self.start_configured_incremental(cursor, &mut incremental, &cancel).await {
            cancel.cancel();
            self.join_phase(PhaseKind::Streaming, streaming).await?;
            return Err(e);
        }

        let mut streaming_result = None;
        let mut failure = None;
        loop {
            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Step::Stop,
                joined = &mut streaming => Step::Streaming(joined),
                joined = join_opt(&mut incremental) => Step::Incremental(joined),
                signal = control_rx.recv() => Step::Signal(signal),
            };
            match step {
                Step::Stop | Step::Signal(None) => break,
                Step::Streaming(joined) => {
                    streaming_result = Some(flatten(PhaseKind::Streaming, joined));
                    break;
                }
                Step::Incremental(joined) => {
                    incremental = None;
                    self.set_incremental(false);
                    match flatten(PhaseKind::IncrementalSnapshot, joined) {
                        PhaseResult::Completed(_) => {}
                        PhaseResult::Interrupted(_) => {
                            debug!(partition = %self.partition, "Incremental snapshot interrupted")
                        }
                        PhaseResult::Failed(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
                Step::Signal(Some(signal)) => {
                    self.apply_signal(signal, &mut incremental, &cancel).await
                }
            }
        }

        cancel.cancel();
        if let Some(handle) = incremental.take() {
            if let PhaseResult::Failed(e) = self.join_phase(PhaseKind::IncrementalSnapshot, handle).await? {
                warn!(partition = %self.partition, error = %e, "Incremental snapshot failed while stopping");
            }
        }
        let streaming_result = match streaming_result {
            Some(result) => result,
            None => self.join_phase(PhaseKind::Streaming, streaming).await?,
        };

        if let Some(e) = failure {
            return Err(e);
        }
        match streaming_result {
            PhaseResult::Failed(e) => Err(e),
            PhaseResult::Completed(_) | PhaseResult::Interrupted(_) => Ok(self.dispatcher.last_offset()),
        }
    }

    /// Resume a persisted incremental snapshot and queue the auto-start
    /// tables of a fresh capture.
    async fn start_configured_incremental(
        &self,
        cursor: Option<IncrementalCursor>,
        incremental: &mut Option<JoinHandle<PhaseResult>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(phase) = self.phases.incremental.clone() else {
            if cursor.is_some() {
                warn!(partition = %self.partition, "Dropping persisted incremental snapshot: incremental snapshots are disabled");
            }
            return Ok(());
        };

        if let Some(cursor) = cursor {
            info!(
                partition = %self.partition,
                tables = cursor.tables.len(),
                chunks = cursor.chunks,
                paused = cursor.paused,
                "Resuming incremental snapshot"
            );
            self.dispatcher.restore_incremental(cursor).await;
            *incremental = Some(self.spawn_incremental(phase.clone(), cancel));
        }

        let fresh = self.persisted.as_ref().map_or(true, |s| s.offset.is_snapshot());
        let auto = self.config.auto_start_tables()?;
        if fresh && !auto.is_empty() {
            info!(partition = %self.partition, tables = auto.len(), "Auto-starting incremental snapshot");
            self.dispatcher.start_incremental(auto).await;
            if incremental.is_none() {
                *incremental = Some(self.spawn_incremental(phase, cancel));
            }
        }
        Ok(())
    }

    fn spawn_incremental(
        &self,
        phase: Arc<dyn PhaseSource>,
        cancel: &CancellationToken,
    ) -> JoinHandle<PhaseResult> {
        self.set_incremental(true);
        self.metrics.record_phase(PhaseKind::IncrementalSnapshot.as_str());
        let ctx = PhaseContext::new(self.partition.clone(), self.dispatcher.last_offset(), cancel.clone());
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move { phase.execute(ctx, dispatcher).await })
    }

    async fn apply_signal(
        &self,
        signal: Signal,
        incremental: &mut Option<JoinHandle<PhaseResult>>,
        cancel: &CancellationToken,
    ) {
        match &signal.action {
            SignalAction::ExecuteSnapshot => {
                let Some(phase) = self.phases.incremental.clone() else {
                    warn!(signal = %signal.id, "Incremental snapshots are disabled, ignoring signal");
                    return;
                };
                let tables = match signal.tables() {
                    Ok(tables) if !tables.is_empty() => tables,
                    Ok(_) => {
                        warn!(signal = %signal.id, "Ignoring execute-snapshot without tables");
                        return;
                    }
                    Err(e) => {
                        warn!(signal = %signal.id, error = %e, "Ignoring malformed execute-snapshot");
                        return;
                    }
                };
                let cursor = self.dispatcher.start_incremental(tables).await;
                info!(signal = %signal.id, tables = cursor.tables.len(), "Incremental snapshot requested");
                if incremental.is_none() {
                    *incremental = Some(self.spawn_incremental(phase, cancel));
                }
            }
            SignalAction::PauseSnapshot | SignalAction::ResumeSnapshot => {
                let pause = signal.action == SignalAction::PauseSnapshot;
                if self.dispatcher.set_incremental_paused(pause).await {
                    info!(signal = %signal.id, paused = pause, "Incremental snapshot pause state changed");
                } else {
                    debug!(signal = %signal.id, "No incremental snapshot to pause or resume");
                }
            }
            SignalAction::StopSnapshot => match signal.tables() {
                Ok(tables) => {
                    self.dispatcher.stop_incremental(&tables).await;
                    info!(signal = %signal.id, tables = tables.len(), "Incremental snapshot stop requested");
                }
                Err(e) => warn!(signal = %signal.id, error = %e, "Ignoring malformed stop-snapshot"),
            },
            SignalAction::Log => info!(
                signal = %signal.id,
                message = signal.data.log_message().unwrap_or_default(),
                "Signal log message"
            ),
            SignalAction::SnapshotWindowOpen | SignalAction::SnapshotWindowClose => {
                debug!(signal = %signal.id, "Ignoring watermark sent through the control channel")
            }
            SignalAction::Custom(name) => debug!(signal = %signal.id, action = %name, "Ignoring unknown signal"),
        }
    }

    /// Wait for a cancelled phase, bounded by the task management timeout.
    async fn join_phase(&self, kind: PhaseKind, mut handle: JoinHandle<PhaseResult>) -> Result<PhaseResult> {
        let wait = self.config.engine.task_management_timeout();
        match tokio::time::timeout(wait, &mut handle).await {
            Ok(joined) => Ok(flatten(kind, joined)),
            Err(_) => {
                handle.abort();
                Err(CaptureError::timeout(format!(
                    "{} phase did not stop within {}ms",
                    kind,
                    wait.as_millis()
                )))
            }
        }
    }
}

fn flatten(kind: PhaseKind, joined: std::result::Result<PhaseResult, JoinError>) -> PhaseResult {
    joined.unwrap_or_else(|e| {
        PhaseResult::Failed(CaptureError::invalid_state(format!("{} phase task failed: {}", kind, e)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TableId;
    use crate::snapshot::SnapshotMode;
    use crate::upstream::memory::MemoryUpstream;
    use crate::upstream::Row;
    use serde_json::json;
    use std::time::Duration;

    fn t(name: &str) -> TableId {
        TableId::new("db", name)
    }

    fn config() -> CaptureConfig {
        CaptureConfig::new("s1", "db").with_tables(["db.a"])
    }

    #[tokio::test]
    async fn test_read_only_without_gtids_fails_before_start() {
        let upstream = MemoryUpstream::new().with_read_only(true);
        let err = CaptureOrchestrator::builder(config().with_read_only(true), Arc::new(upstream))
            .build()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CaptureError::Config(_)));
    }

    #[tokio::test]
    async fn test_connect_failure_surfaces_at_build() {
        let upstream = MemoryUpstream::new();
        upstream.fail_connect("access denied");
        let result = CaptureOrchestrator::builder(config(), Arc::new(upstream)).build().await;
        assert!(matches!(result, Err(CaptureError::Source(_))));
    }

    #[tokio::test]
    async fn test_initial_only_stops_after_snapshot() {
        let upstream = MemoryUpstream::new().with_table(t("a"), vec![Row::new(json!(1), json!({"id": 1}))]);
        let orchestrator = CaptureOrchestrator::builder(
            config().with_snapshot_mode(SnapshotMode::InitialOnly),
            Arc::new(upstream),
        )
        .build()
        .await
        .unwrap();
        let handle = orchestrator.handle();
        let queue = orchestrator.queue();

        let offset = orchestrator.run().await.unwrap().unwrap();
        assert!(offset.is_snapshot());
        assert!(!offset.snapshot_in_progress());
        assert_eq!(handle.state(), CaptureState::Stopped);
        assert!(queue.is_closed());
        assert_eq!(queue.poll().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_handle_stop_reaches_stopped() {
        let upstream = MemoryUpstream::new().with_table(t("a"), vec![]);
        let orchestrator = CaptureOrchestrator::builder(config(), Arc::new(upstream))
            .build()
            .await
            .unwrap();
        let handle = orchestrator.handle();
        let task = tokio::spawn(orchestrator.run());

        let status = handle.wait_until(|s| s.state == CaptureState::Streaming).await;
        assert_eq!(status.state, CaptureState::Streaming);
        handle.stop().await.unwrap();
        assert!(task.await.unwrap().is_ok());
        assert_eq!(handle.state(), CaptureState::Stopped);
    }

    #[tokio::test]
    async fn test_streaming_failure_reports_offset() {
        let upstream = MemoryUpstream::new().with_table(t("a"), vec![]);
        let orchestrator = CaptureOrchestrator::builder(config(), Arc::new(upstream.clone()))
            .build()
            .await
            .unwrap();
        let handle = orchestrator.handle();
        let task = tokio::spawn(orchestrator.run());

        handle.wait_until(|s| s.state == CaptureState::Streaming).await;
        upstream.insert(&t("a"), json!(1), json!({"id": 1}));
        tokio::time::sleep(Duration::from_millis(50)).await;
        upstream.end_log();

        let failure = task.await.unwrap().unwrap_err();
        assert!(matches!(failure.cause, CaptureError::Source(_)));
        assert!(failure.offset.is_some());
        assert_eq!(handle.state(), CaptureState::Failed);
    }
}
