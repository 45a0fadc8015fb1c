//! Event dispatcher
//!
//! The single path from phase sources into the event queue. Admission is
//! serialized through one async mutex, so the snapshot, streaming and
//! incremental producers never interleave their enqueue + offset-advance
//! steps. The dispatcher also:
//!
//! - turns [`PhaseTransitionSignal`]s into event-queue buffering operations
//! - stamps the incremental snapshot cursor on admitted events
//! - maintains the open incremental-snapshot window (eviction and close)
//! - forwards control signals to the orchestrator

use crate::error::{CaptureError, Result};
use crate::event::{ChangeEvent, Partition, PhaseTransitionSignal, SnapshotMarker, SourceEvent, TableId};
use crate::incremental_snapshot::{ChunkWindow, IncrementalCursor};
use crate::metrics::CaptureMetrics;
use crate::offset::{GtidSet, Offset, OffsetState};
use crate::queue::EventQueue;
use crate::signal::{Signal, SignalAction, SignalChannel};
use crate::upstream::Row;
use std::sync::Arc;
use tokio::sync::futures::Notified;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct Admission {
    cursor: Option<IncrementalCursor>,
    window: Option<ChunkWindow>,
    /// GTIDs seen by streaming so far
    stream_gtids: Option<GtidSet>,
    /// Offset of the last change-log entry seen by streaming
    stream_offset: Option<Offset>,
}

/// Routes produced events into the queue and advances offsets.
pub struct EventDispatcher {
    partition: Partition,
    queue: Arc<EventQueue>,
    offsets: Arc<OffsetState>,
    control: SignalChannel,
    metrics: Arc<CaptureMetrics>,
    admission: Mutex<Admission>,
    incremental_changed: Notify,
}

impl EventDispatcher {
    pub fn new(
        partition: Partition,
        queue: Arc<EventQueue>,
        offsets: Arc<OffsetState>,
        control: SignalChannel,
        metrics: Arc<CaptureMetrics>,
    ) -> Self {
        Self {
            partition,
            queue,
            offsets,
            control,
            metrics,
            admission: Mutex::new(Admission::default()),
            incremental_changed: Notify::new(),
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn metrics(&self) -> &Arc<CaptureMetrics> {
        &self.metrics
    }

    /// Last offset admitted to the queue.
    pub fn last_offset(&self) -> Option<Offset> {
        self.offsets.current_offset(&self.partition)
    }

    /// Hand over an event produced by the snapshot (or any non-streaming)
    /// phase.
    pub async fn dispatch(&self, event: SourceEvent) -> Result<()> {
        match event {
            SourceEvent::Transition(signal) => self.transition(signal).await,
            SourceEvent::Change(event) => {
                let admission = self.admission.lock().await;
                let event = event.with_incremental(admission.cursor.clone());
                self.admit(event).await
            }
        }
    }

    async fn transition(&self, signal: PhaseTransitionSignal) -> Result<()> {
        let _admission = self.admission.lock().await;
        match signal {
            PhaseTransitionSignal::SnapshotStarted => {
                self.queue.enable_buffering()?;
                info!(partition = %self.partition, "Snapshot started");
                Ok(())
            }
            PhaseTransitionSignal::SnapshotTableCompleted { table, rows } => {
                self.metrics.record_snapshot_rows(&table.to_string(), rows);
                info!(partition = %self.partition, table = %table, rows, "Snapshot of table completed");
                Ok(())
            }
            PhaseTransitionSignal::SnapshotCompleted { offset } => {
                // The last buffered record becomes the final snapshot record.
                self.queue.flush_buffer(ChangeEvent::into_last_snapshot_record);
                self.queue.disable_buffering();
                self.offsets.advance_to(&self.partition, offset.clone(), None)?;
                info!(partition = %self.partition, offset = %offset, "Snapshot completed");
                Ok(())
            }
        }
    }

    /// Enqueue and advance. Callers hold the admission lock.
    async fn admit(&self, event: ChangeEvent) -> Result<()> {
        self.offsets.check_forward(&self.partition, &event.offset)?;
        let offset = event.offset.clone();
        let cursor = event.incremental.clone();
        self.queue.enqueue(event).await?;
        self.offsets.advance_to(&self.partition, offset, cursor)
    }

    /// Note where streaming starts.
    ///
    /// A GTID-bounded window filled before streaming began closes here if
    /// the starting set already covers its high mark.
    pub async fn begin_streaming(&self, offset: &Offset, gtids: Option<GtidSet>) -> Result<()> {
        let mut admission = self.admission.lock().await;
        admission.stream_offset = Some(offset.clone());
        admission.stream_gtids = gtids;

        let reached = admission
            .window
            .as_ref()
            .is_some_and(|w| w.reached_high(admission.stream_gtids.as_ref()));
        if reached {
            self.close_window(&mut admission, offset.clone()).await?;
        }
        Ok(())
    }

    /// Hand over a streamed change event.
    ///
    /// Evicts the row from an open incremental window if the event falls
    /// inside it, and closes a GTID-bounded window once the stream has
    /// passed its high mark.
    pub async fn dispatch_streaming(&self, event: ChangeEvent) -> Result<()> {
        let mut admission = self.admission.lock().await;
        if let Some(window) = admission.window.as_mut() {
            if window.table == event.table && window.covers(event.gtid.as_deref()) {
                window.evict(&event.key);
            }
        }

        let offset = event.offset.clone();
        let event = event.with_incremental(admission.cursor.clone());
        self.admit(event).await?;
        self.observe(&mut admission, offset).await
    }

    /// Record a change-log position that produced no event of its own.
    pub async fn observe_position(&self, offset: Offset) -> Result<()> {
        let mut admission = self.admission.lock().await;
        self.observe(&mut admission, offset).await
    }

    async fn observe(&self, admission: &mut Admission, offset: Offset) -> Result<()> {
        if let Some(gtids) = offset.gtids() {
            admission.stream_gtids = Some(gtids.clone());
        }
        admission.stream_offset = Some(offset.clone());

        let reached = admission
            .window
            .as_ref()
            .is_some_and(|w| w.reached_high(admission.stream_gtids.as_ref()));
        if reached {
            self.close_window(admission, offset).await?;
        }
        Ok(())
    }

    /// Handle a signal read from the signal collection at `offset`.
    pub async fn handle_signal(&self, signal: Signal, offset: Offset) -> Result<()> {
        match signal.action {
            SignalAction::SnapshotWindowOpen | SignalAction::SnapshotWindowClose => {
                let mut admission = self.admission.lock().await;
                let chunk_matches = admission
                    .window
                    .as_ref()
                    .is_some_and(|w| Some(w.chunk_id.as_str()) == signal.chunk_id());
                if !chunk_matches {
                    debug!(signal = %signal.id, "Ignoring watermark of an unknown chunk");
                } else if signal.action == SignalAction::SnapshotWindowOpen {
                    if let Some(window) = admission.window.as_mut() {
                        window.opened = true;
                        debug!(chunk_id = %window.chunk_id, "Incremental snapshot window opened");
                    }
                } else {
                    self.close_window(&mut admission, offset.clone()).await?;
                }
                self.observe(&mut admission, offset).await
            }
            _ => {
                self.observe_position(offset).await?;
                self.route_signal(signal).await
            }
        }
    }

    /// Deliver a control signal to the orchestrator.
    pub async fn route_signal(&self, signal: Signal) -> Result<()> {
        if signal.action == SignalAction::Log {
            info!(
                signal = %signal.id,
                message = signal.data.log_message().unwrap_or_default(),
                "Signal log message"
            );
            return Ok(());
        }
        self.control.send(signal).await
    }

    async fn close_window(&self, admission: &mut Admission, offset: Offset) -> Result<()> {
        let Some(mut window) = admission.window.take() else {
            return Ok(());
        };
        if !window.is_filled() {
            // Close observed before the chunk was read; nothing to reconcile.
            warn!(chunk_id = %window.chunk_id, "Incremental snapshot window closed before it was filled");
            window.complete();
            return Ok(());
        }

        let rows = window.close();
        let finished = admission.cursor.clone().map(|mut cursor| {
            cursor.apply_chunk(&window.table, window.last_key.clone(), window.exhausted);
            cursor
        });

        let count = rows.len();
        for (i, Row { key, data }) in rows.into_iter().enumerate() {
            // Only the last row of the chunk carries the advanced cursor.
            let cursor = if i + 1 == count {
                finished.clone()
            } else {
                admission.cursor.clone()
            };
            let event = ChangeEvent::read(
                self.partition.clone(),
                window.table.clone(),
                key,
                data,
                offset.clone(),
                SnapshotMarker::Incremental,
            )
            .with_incremental(cursor);
            self.admit(event).await?;
        }

        if admission.cursor.is_some() {
            admission.cursor = finished;
            if let Some(cursor) = &admission.cursor {
                self.offsets.set_incremental(&self.partition, Some(cursor.clone()));
            }
        }
        window.complete();
        self.incremental_changed.notify_waiters();
        Ok(())
    }

    pub(crate) async fn open_window(&self, window: ChunkWindow) {
        let mut admission = self.admission.lock().await;
        if let Some(previous) = admission.window.replace(window) {
            warn!(chunk_id = %previous.chunk_id, "Replacing an unfinished incremental snapshot window");
        }
    }

    /// Buffer a chunk query result; a GTID-bounded window may close at once.
    pub(crate) async fn fill_window(
        &self,
        chunk_id: &str,
        rows: Vec<Row>,
        chunk_size: usize,
        high: Option<GtidSet>,
    ) -> Result<()> {
        let mut guard = self.admission.lock().await;
        let admission = &mut *guard;
        let Some(window) = admission.window.as_mut().filter(|w| w.chunk_id == chunk_id) else {
            return Ok(());
        };
        window.fill(rows, chunk_size);
        if high.is_some() {
            window.high = high;
            let reached = window.reached_high(admission.stream_gtids.as_ref());
            if reached {
                let offset = admission
                    .stream_offset
                    .clone()
                    .or_else(|| self.last_offset())
                    .ok_or_else(|| {
                        CaptureError::invalid_state("incremental window closed before streaming started")
                    })?;
                self.close_window(admission, offset).await?;
            }
        }
        Ok(())
    }

    pub(crate) async fn discard_window(&self, chunk_id: &str) {
        let mut admission = self.admission.lock().await;
        if admission.window.as_ref().is_some_and(|w| w.chunk_id == chunk_id) {
            admission.window = None;
        }
    }

    pub(crate) async fn discard_any_window(&self) {
        self.admission.lock().await.window = None;
    }

    /// Future resolving on the next cursor change.
    pub fn incremental_changed(&self) -> Notified<'_> {
        self.incremental_changed.notified()
    }

    pub async fn incremental_cursor(&self) -> Option<IncrementalCursor> {
        self.admission.lock().await.cursor.clone()
    }

    /// Queue tables for incremental snapshotting. Returns the resulting
    /// cursor.
    pub async fn start_incremental(&self, tables: Vec<TableId>) -> IncrementalCursor {
        let mut admission = self.admission.lock().await;
        let cursor = match admission.cursor.as_mut() {
            Some(cursor) => {
                cursor.add_tables(tables);
                cursor.clone()
            }
            None => {
                let cursor = IncrementalCursor::new(tables);
                admission.cursor = Some(cursor.clone());
                cursor
            }
        };
        self.publish_cursor(&admission);
        cursor
    }

    /// Restore a persisted cursor.
    pub async fn restore_incremental(&self, cursor: IncrementalCursor) {
        let mut admission = self.admission.lock().await;
        admission.cursor = Some(cursor);
        self.publish_cursor(&admission);
    }

    /// Set the paused flag. Returns false without an active snapshot.
    pub async fn set_incremental_paused(&self, paused: bool) -> bool {
        let mut admission = self.admission.lock().await;
        let Some(cursor) = admission.cursor.as_mut() else {
            return false;
        };
        cursor.paused = paused;
        self.publish_cursor(&admission);
        true
    }

    /// Stop snapshotting `tables` (all tables when empty).
    pub async fn stop_incremental(&self, tables: &[TableId]) {
        let mut admission = self.admission.lock().await;
        let Some(cursor) = admission.cursor.as_mut() else {
            return;
        };
        let current = cursor.current_table().cloned();
        cursor.remove_tables(tables);
        if cursor.current_table() != current.as_ref() {
            // The in-flight chunk belongs to a stopped table.
            if let Some(window) = admission.window.take() {
                debug!(chunk_id = %window.chunk_id, "Discarding window of stopped table");
            }
        }
        self.publish_cursor(&admission);
    }

    /// Clear a finished cursor.
    pub async fn finish_incremental(&self) {
        let mut admission = self.admission.lock().await;
        if admission.cursor.as_ref().is_some_and(IncrementalCursor::is_finished) {
            admission.cursor = None;
            self.offsets.set_incremental(&self.partition, None);
        }
    }

    fn publish_cursor(&self, admission: &Admission) {
        self.offsets
            .set_incremental(&self.partition, admission.cursor.clone());
        self.incremental_changed.notify_waiters();
    }
}
