//! Change-log streaming phase
//!
//! Tails the upstream change log from the resume offset and emits insert,
//! update and delete events in log order. Rows of the signal collection are
//! not emitted; they are parsed as [`Signal`]s and handed to the dispatcher.
//! The phase never completes on its own.

use crate::dispatcher::EventDispatcher;
use crate::error::{CaptureError, Result};
use crate::event::{ChangeEvent, EventOp, TableId};
use crate::offset::{GtidOffset, GtidSet, Offset};
use crate::signal::Signal;
use crate::source::{PhaseContext, PhaseFactory, PhaseKind, PhaseResult, PhaseSetup, PhaseSource};
use crate::upstream::{RawChangeEvent, SourceConnection};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Streaming phase source.
pub struct StreamingSource {
    connection: Arc<dyn SourceConnection>,
    /// Captured tables; empty captures every table
    tables: Vec<TableId>,
    signal_collection: Option<TableId>,
}

impl StreamingSource {
    pub fn new(
        connection: Arc<dyn SourceConnection>,
        tables: Vec<TableId>,
        signal_collection: Option<TableId>,
    ) -> Self {
        Self {
            connection,
            tables,
            signal_collection,
        }
    }

    fn captures(&self, table: &TableId) -> bool {
        self.tables.is_empty() || self.tables.contains(table)
    }

    /// Offset to tail from, and whether an entry exactly at it is new.
    async fn start(&self, offset: Option<&Offset>) -> Result<(Offset, bool)> {
        match offset {
            Some(offset) if !offset.is_snapshot() => Ok((offset.clone(), false)),
            Some(offset) => Ok((offset.streaming_start(), true)),
            None => {
                let point = self.connection.snapshot_point().await?;
                let start = match point.gtids {
                    Some(gtids) => Offset::Gtid(GtidOffset {
                        gtids,
                        position: point.position,
                    }),
                    None => Offset::Log(point.position),
                };
                Ok((start, true))
            }
        }
    }

    async fn handle(
        &self,
        raw: RawChangeEvent,
        gtids: &mut Option<GtidSet>,
        ctx: &PhaseContext,
        dispatcher: &EventDispatcher,
    ) -> Result<()> {
        let offset = match (gtids.as_mut(), raw.gtid.as_deref()) {
            (Some(set), Some(gtid)) => {
                set.add_gtid(gtid)?;
                Offset::Gtid(GtidOffset {
                    gtids: set.clone(),
                    position: raw.position.clone(),
                })
            }
            _ => Offset::Log(raw.position.clone()),
        };

        if self.signal_collection.as_ref() == Some(&raw.table) {
            return match (raw.op, raw.after.as_ref()) {
                (EventOp::Insert, Some(row)) => match Signal::from_row(row) {
                    Ok(signal) => {
                        debug!(signal = %signal.id, action = signal.action.as_str(), "Signal received");
                        dispatcher.handle_signal(signal, offset).await
                    }
                    Err(e) => {
                        warn!(partition = %ctx.partition, error = %e, "Ignoring malformed signal row");
                        dispatcher.observe_position(offset).await
                    }
                },
                _ => dispatcher.observe_position(offset).await,
            };
        }

        if !self.captures(&raw.table) {
            return dispatcher.observe_position(offset).await;
        }

        let event = ChangeEvent::change(
            ctx.partition.clone(),
            raw.table,
            raw.op,
            raw.key,
            raw.before,
            raw.after,
            offset,
            raw.timestamp,
        )
        .with_gtid(raw.gtid);
        dispatcher.dispatch_streaming(event).await
    }
}

#[async_trait]
impl PhaseSource for StreamingSource {
    fn kind(&self) -> PhaseKind {
        PhaseKind::Streaming
    }

    async fn execute(&self, ctx: PhaseContext, dispatcher: Arc<EventDispatcher>) -> PhaseResult {
        let (start, inclusive) = match self.start(ctx.offset.as_ref()).await {
            Ok(start) => start,
            Err(e) => return PhaseResult::Failed(e),
        };
        let mut gtids = match start.gtids() {
            Some(set) => Some(set.clone()),
            None if self.connection.gtid_enabled() => Some(GtidSet::new()),
            None => None,
        };
        if let Err(e) = dispatcher.begin_streaming(&start, gtids.clone()).await {
            return PhaseResult::from_dispatch_error(e, dispatcher.last_offset());
        }

        let mut stream = match self
            .connection
            .tail_change_log(&start, ctx.cancel.clone())
            .await
        {
            Ok(stream) => stream,
            Err(e) => return PhaseResult::Failed(e),
        };
        info!(partition = %ctx.partition, from = %start, "Streaming started");

        let from = start.log_position().clone();
        loop {
            let next = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => None,
                next = stream.next() => Some(next),
            };
            let raw = match next {
                None => {
                    info!(partition = %ctx.partition, "Streaming stopped");
                    return PhaseResult::Interrupted(dispatcher.last_offset());
                }
                Some(None) if ctx.cancel.is_cancelled() => {
                    return PhaseResult::Interrupted(dispatcher.last_offset());
                }
                Some(None) => {
                    return PhaseResult::Failed(CaptureError::source("change log ended"));
                }
                Some(Some(Err(e))) => {
                    return PhaseResult::from_dispatch_error(e, dispatcher.last_offset());
                }
                Some(Some(Ok(raw))) => raw,
            };

            if raw.position < from || (!inclusive && raw.position == from) {
                continue;
            }
            if let Err(e) = self.handle(raw, &mut gtids, &ctx, &dispatcher).await {
                return PhaseResult::from_dispatch_error(e, dispatcher.last_offset());
            }
        }
    }
}

/// Builds the streaming source.
pub struct StreamingFactory;

impl PhaseFactory for StreamingFactory {
    fn create(&self, setup: &PhaseSetup) -> Result<Arc<dyn PhaseSource>> {
        Ok(Arc::new(StreamingSource::new(
            setup.connection.clone(),
            setup.config.table_ids()?,
            setup.config.signal_collection()?,
        )))
    }
}
