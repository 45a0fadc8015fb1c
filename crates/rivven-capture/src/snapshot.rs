//! Initial snapshot phase
//!
//! Reads every configured table in primary-key order from one consistent
//! snapshot point and emits a read event per row. The phase brackets its
//! output with [`PhaseTransitionSignal`]s so the dispatcher can hold back the
//! most recent record and rewrite it as the last snapshot record once the
//! phase is known to be over, even when the final table turns out empty.
//!
//! A persisted snapshot offset that is not completed resumes at the table it
//! was reading; tables before it are not read again.

use crate::dispatcher::EventDispatcher;
use crate::error::Result;
use crate::event::{ChangeEvent, PhaseTransitionSignal, SnapshotMarker, SourceEvent, TableId};
use crate::offset::{GtidSet, LogPosition, Offset, SnapshotOffset};
use crate::source::{PhaseContext, PhaseFactory, PhaseKind, PhaseResult, PhaseSetup, PhaseSource};
use crate::upstream::{SnapshotPoint, SourceConnection};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// When the initial snapshot runs.
///
/// ```rust
/// use rivven_capture::snapshot::SnapshotMode;
///
/// let mode: SnapshotMode = serde_yaml::from_str("when_needed").unwrap();
/// assert_eq!(mode, SnapshotMode::WhenNeeded);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotMode {
    /// Snapshot when no offset is stored (or the stored snapshot did not
    /// finish), then stream.
    #[default]
    Initial,

    /// Snapshot on every start, then stream.
    Always,

    /// Like `Initial`, but stop once the snapshot completes.
    InitialOnly,

    /// Snapshot only if no usable offset is stored.
    WhenNeeded,

    /// Never snapshot; stream from the stored offset or the current position.
    Never,
}

/// What the capture does at startup.
#[derive(Debug, Clone, PartialEq)]
pub enum StartupAction {
    /// Run the snapshot phase, resuming from `resume` if set.
    Snapshot { resume: Option<Offset> },
    /// Go straight to streaming from `from` (the current position if unset).
    Stream { from: Option<Offset> },
    /// Nothing left to do: a snapshot-only capture already finished at `at`.
    Stop { at: Offset },
}

impl SnapshotMode {
    /// Whether streaming follows a completed snapshot.
    pub fn should_stream(&self) -> bool {
        !matches!(self, SnapshotMode::InitialOnly)
    }

    /// Decide the first phase from the persisted offset.
    pub fn startup(&self, persisted: Option<&Offset>) -> StartupAction {
        match (self, persisted) {
            (SnapshotMode::Always, _) => StartupAction::Snapshot { resume: None },
            (SnapshotMode::Never, persisted) => StartupAction::Stream {
                from: persisted.map(Offset::streaming_start),
            },
            (_, None) => StartupAction::Snapshot { resume: None },
            (_, Some(offset)) if offset.snapshot_in_progress() => StartupAction::Snapshot {
                resume: Some(offset.clone()),
            },
            (SnapshotMode::InitialOnly, Some(offset)) => StartupAction::Stop { at: offset.clone() },
            (_, Some(offset)) => StartupAction::Stream {
                from: Some(offset.clone()),
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotMode::Initial => "initial",
            SnapshotMode::Always => "always",
            SnapshotMode::InitialOnly => "initial_only",
            SnapshotMode::WhenNeeded => "when_needed",
            SnapshotMode::Never => "never",
        }
    }
}

/// Where a snapshot run starts.
struct SnapshotStart {
    resume: LogPosition,
    gtids: Option<GtidSet>,
    table: u32,
    resumed: bool,
}

impl SnapshotStart {
    fn offset(&self, table: u32, row: u64) -> Offset {
        Offset::Snapshot(SnapshotOffset {
            resume: self.resume.clone(),
            gtids: self.gtids.clone(),
            table,
            row,
            completed: false,
        })
    }
}

/// Initial snapshot phase source.
pub struct SnapshotSource {
    connection: Arc<dyn SourceConnection>,
    tables: Vec<TableId>,
}

impl SnapshotSource {
    pub fn new(connection: Arc<dyn SourceConnection>, tables: Vec<TableId>) -> Self {
        Self { connection, tables }
    }

    async fn start(&self, offset: Option<&Offset>) -> Result<SnapshotStart> {
        if let Some(Offset::Snapshot(s)) = offset {
            if !s.completed {
                return Ok(SnapshotStart {
                    resume: s.resume.clone(),
                    gtids: s.gtids.clone(),
                    table: s.table,
                    resumed: true,
                });
            }
        }
        let SnapshotPoint { position, gtids } = self.connection.snapshot_point().await?;
        Ok(SnapshotStart {
            resume: position,
            gtids,
            table: 0,
            resumed: false,
        })
    }

    /// Emit the rows of one table; returns the row count or the phase result
    /// to stop with.
    async fn read_table(
        &self,
        index: u32,
        table: &TableId,
        start: &SnapshotStart,
        first: &mut bool,
        ctx: &PhaseContext,
        dispatcher: &EventDispatcher,
    ) -> std::result::Result<u64, PhaseResult> {
        let mut rows = self
            .connection
            .read_snapshot_rows(table)
            .await
            .map_err(PhaseResult::Failed)?;

        let mut count = 0u64;
        while let Some(row) = rows.next().await {
            if ctx.cancel.is_cancelled() {
                info!(partition = %ctx.partition, table = %table, rows = count, "Snapshot interrupted");
                return Err(PhaseResult::Interrupted(dispatcher.last_offset()));
            }
            let row = row.map_err(PhaseResult::Failed)?;
            count += 1;

            let marker = if std::mem::take(first) {
                SnapshotMarker::First
            } else {
                SnapshotMarker::InProgress
            };
            let event = ChangeEvent::read(
                ctx.partition.clone(),
                table.clone(),
                row.key,
                row.data,
                start.offset(index, count),
                marker,
            );
            dispatcher
                .dispatch(SourceEvent::Change(event))
                .await
                .map_err(|e| PhaseResult::from_dispatch_error(e, dispatcher.last_offset()))?;
        }
        Ok(count)
    }
}

#[async_trait]
impl PhaseSource for SnapshotSource {
    fn kind(&self) -> PhaseKind {
        PhaseKind::Snapshot
    }

    async fn execute(&self, ctx: PhaseContext, dispatcher: Arc<EventDispatcher>) -> PhaseResult {
        let start = match self.start(ctx.offset.as_ref()).await {
            Ok(start) => start,
            Err(e) => return PhaseResult::Failed(e),
        };
        info!(
            partition = %ctx.partition,
            tables = self.tables.len(),
            resume = %start.resume,
            from_table = start.table,
            resumed = start.resumed,
            "Snapshot starting"
        );

        if let Err(e) = dispatcher
            .dispatch(SourceEvent::Transition(PhaseTransitionSignal::SnapshotStarted))
            .await
        {
            return PhaseResult::from_dispatch_error(e, dispatcher.last_offset());
        }

        let mut first = !start.resumed;
        let mut last = (start.table, 0u64);
        for (index, table) in self.tables.iter().enumerate().skip(start.table as usize) {
            let index = index as u32;
            if ctx.cancel.is_cancelled() {
                return PhaseResult::Interrupted(dispatcher.last_offset());
            }
            debug!(partition = %ctx.partition, table = %table, index, "Snapshotting table");

            let rows = match self
                .read_table(index, table, &start, &mut first, &ctx, &dispatcher)
                .await
            {
                Ok(rows) => rows,
                Err(result) => return result,
            };
            last = (index, rows);

            let completed = PhaseTransitionSignal::SnapshotTableCompleted {
                table: table.clone(),
                rows,
            };
            if let Err(e) = dispatcher.dispatch(SourceEvent::Transition(completed)).await {
                return PhaseResult::from_dispatch_error(e, dispatcher.last_offset());
            }
        }

        let offset = start.offset(last.0, last.1).mark_snapshot_completed();
        let signal = PhaseTransitionSignal::SnapshotCompleted {
            offset: offset.clone(),
        };
        if let Err(e) = dispatcher.dispatch(SourceEvent::Transition(signal)).await {
            return PhaseResult::from_dispatch_error(e, dispatcher.last_offset());
        }
        PhaseResult::Completed(offset)
    }
}

/// Builds the snapshot source over the configured tables.
pub struct SnapshotFactory;

impl PhaseFactory for SnapshotFactory {
    fn create(&self, setup: &PhaseSetup) -> Result<Arc<dyn PhaseSource>> {
        Ok(Arc::new(SnapshotSource::new(
            setup.connection.clone(),
            setup.config.table_ids()?,
        )))
    }
}
