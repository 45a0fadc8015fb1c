//! # Incremental Snapshots
//!
//! Chunked re-read of selected tables while streaming continues, using
//! watermark-based deduplication (DBLog).
//!
//! ## How It Works
//!
//! ```text
//! Timeline (change log):
//! ────────────────────────────────────────────────────────────────►
//!     │  LOW    │  chunk query        │  HIGH   │
//!     │  mark   │  (rows buffered)    │  mark   │
//!
//! Inside the window:
//! - Chunk rows wait in a buffer keyed by primary key
//! - Streaming events for the same table evict matching keys (streaming wins)
//! - When the high mark is reached, the remaining rows are emitted as reads
//! ```
//!
//! ## Watermark Strategies
//!
//! | Strategy | Low mark | High mark |
//! |----------|----------|-----------|
//! | `SignalTable` | `snapshot-window-open` row written to the signal collection | `snapshot-window-close` row |
//! | `ReadOnlyGtid` | executed GTID set before the chunk query | executed GTID set after it |
//!
//! A read-only connection cannot write watermark rows, so it needs GTIDs.
//!
//! ## Resume
//!
//! The [`IncrementalCursor`] (remaining tables, last emitted key, paused
//! flag) is stamped on every event admitted while an incremental snapshot is
//! active and persisted with the offset once delivered. A restart re-reads at
//! most the chunk that was in flight.

use crate::config::CaptureConfig;
use crate::dispatcher::EventDispatcher;
use crate::error::{CaptureError, Result};
use crate::event::TableId;
use crate::metrics::CaptureMetrics;
use crate::offset::GtidSet;
use crate::signal::Signal;
use crate::source::{PhaseContext, PhaseFactory, PhaseKind, PhaseResult, PhaseSetup, PhaseSource};
use crate::upstream::{Row, SourceConnection};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How chunk windows are delimited in the change stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatermarkStrategy {
    /// Open/close rows written to the signal collection
    SignalTable { collection: TableId },
    /// Executed GTID sets read before and after each chunk
    ReadOnlyGtid,
}

impl WatermarkStrategy {
    /// Pick the strategy for a connection.
    ///
    /// A read-only connection without GTIDs is a configuration error. A
    /// writable connection without a signal collection has no incremental
    /// snapshots at all.
    pub fn resolve(config: &CaptureConfig, gtid_enabled: bool) -> Result<Option<Self>> {
        if config.read_only {
            if !gtid_enabled {
                return Err(CaptureError::config(
                    "read-only incremental snapshots require GTIDs to be enabled",
                ));
            }
            return Ok(Some(WatermarkStrategy::ReadOnlyGtid));
        }
        Ok(config
            .signal_collection()?
            .map(|collection| WatermarkStrategy::SignalTable { collection }))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WatermarkStrategy::SignalTable { .. } => "signal_table",
            WatermarkStrategy::ReadOnlyGtid => "read_only_gtid",
        }
    }
}

/// Persisted progress of an incremental snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncrementalCursor {
    /// Tables still to read; the first is in progress
    pub tables: Vec<TableId>,
    /// Key of the last row of the last completed chunk of the current table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_key: Option<serde_json::Value>,
    /// Completed chunks
    #[serde(default)]
    pub chunks: u64,
    #[serde(default)]
    pub paused: bool,
}

impl IncrementalCursor {
    pub fn new(tables: Vec<TableId>) -> Self {
        let mut cursor = Self {
            tables: Vec::new(),
            last_key: None,
            chunks: 0,
            paused: false,
        };
        cursor.add_tables(tables);
        cursor
    }

    pub fn current_table(&self) -> Option<&TableId> {
        self.tables.first()
    }

    pub fn is_finished(&self) -> bool {
        self.tables.is_empty()
    }

    /// Queue tables not already queued.
    pub fn add_tables(&mut self, tables: Vec<TableId>) {
        for table in tables {
            if !self.tables.contains(&table) {
                self.tables.push(table);
            }
        }
    }

    /// Drop tables from the snapshot; an empty list drops all of them.
    pub fn remove_tables(&mut self, tables: &[TableId]) {
        let current = self.current_table().cloned();
        if tables.is_empty() {
            self.tables.clear();
        } else {
            self.tables.retain(|t| !tables.contains(t));
        }
        if self.current_table() != current.as_ref() {
            self.last_key = None;
        }
    }

    /// Record a finished chunk of `table`.
    ///
    /// Ignored if `table` is no longer the current table (it was stopped
    /// while the chunk was in flight).
    pub fn apply_chunk(&mut self, table: &TableId, last_key: Option<serde_json::Value>, exhausted: bool) {
        if self.current_table() != Some(table) {
            return;
        }
        self.chunks += 1;
        if exhausted {
            self.tables.remove(0);
            self.last_key = None;
        } else if last_key.is_some() {
            self.last_key = last_key;
        }
    }
}

/// Rows of one chunk waiting for the high watermark.
#[derive(Debug)]
pub(crate) struct ChunkWindow {
    pub chunk_id: String,
    pub table: TableId,
    /// Whether streaming events currently evict buffered keys
    pub opened: bool,
    /// Executed set before the chunk query (read-only strategy)
    pub low: Option<GtidSet>,
    /// Executed set after the chunk query (read-only strategy)
    pub high: Option<GtidSet>,
    rows: Option<Vec<Row>>,
    touched: HashSet<String>,
    /// Key of the last row read, before eviction
    pub last_key: Option<serde_json::Value>,
    /// The chunk came back shorter than the chunk size
    pub exhausted: bool,
    dropped: u64,
    started: Instant,
    done: Option<oneshot::Sender<()>>,
}

fn key_id(key: &serde_json::Value) -> String {
    key.to_string()
}

impl ChunkWindow {
    pub fn new(chunk_id: String, table: TableId, done: oneshot::Sender<()>) -> Self {
        Self {
            chunk_id,
            table,
            opened: false,
            low: None,
            high: None,
            rows: None,
            touched: HashSet::new(),
            last_key: None,
            exhausted: false,
            dropped: 0,
            started: Instant::now(),
            done: Some(done),
        }
    }

    /// Window that is open from the start, bounded below by `low`.
    pub fn with_low(mut self, low: GtidSet) -> Self {
        self.opened = true;
        self.low = Some(low);
        self
    }

    /// Whether a streaming event with `gtid` happened inside the window.
    pub fn covers(&self, gtid: Option<&str>) -> bool {
        if !self.opened {
            return false;
        }
        match (&self.low, gtid) {
            (Some(low), Some(gtid)) => !low.contains_gtid(gtid),
            _ => true,
        }
    }

    /// A streaming event touched `key`: streaming wins.
    pub fn evict(&mut self, key: &serde_json::Value) {
        let id = key_id(key);
        match self.rows.as_mut() {
            Some(rows) => {
                let before = rows.len();
                rows.retain(|r| key_id(&r.key) != id);
                if rows.len() < before {
                    self.dropped += 1;
                    debug!(chunk_id = %self.chunk_id, key = %id, "Dropped buffered chunk row due to streaming conflict");
                }
            }
            None => {
                self.touched.insert(id);
            }
        }
    }

    /// Buffer the chunk query result, minus keys already touched.
    pub fn fill(&mut self, rows: Vec<Row>, chunk_size: usize) {
        self.exhausted = rows.len() < chunk_size;
        self.last_key = rows.last().map(|r| r.key.clone());
        let before = rows.len();
        let rows: Vec<Row> = rows
            .into_iter()
            .filter(|r| !self.touched.contains(&key_id(&r.key)))
            .collect();
        self.dropped += (before - rows.len()) as u64;
        self.touched.clear();
        self.rows = Some(rows);
    }

    pub fn is_filled(&self) -> bool {
        self.rows.is_some()
    }

    /// Whether the stream has passed the high mark.
    pub fn reached_high(&self, stream: Option<&GtidSet>) -> bool {
        match (&self.high, stream) {
            (Some(high), Some(stream)) => self.is_filled() && stream.is_superset_of(high),
            _ => false,
        }
    }

    /// Close the window, returning the rows to emit.
    pub fn close(&mut self) -> Vec<Row> {
        let rows = self.rows.take().unwrap_or_default();
        info!(
            chunk_id = %self.chunk_id,
            table = %self.table,
            emitted = rows.len(),
            dropped = self.dropped,
            duration_ms = self.started.elapsed().as_millis() as u64,
            "Incremental snapshot window closed"
        );
        rows
    }

    /// Wake the chunk reader waiting on this window.
    pub fn complete(mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

/// Incremental snapshot phase source.
pub struct IncrementalSnapshotSource {
    connection: Arc<dyn SourceConnection>,
    strategy: WatermarkStrategy,
    chunk_size: usize,
    metrics: Arc<CaptureMetrics>,
}

impl IncrementalSnapshotSource {
    pub fn new(
        connection: Arc<dyn SourceConnection>,
        strategy: WatermarkStrategy,
        chunk_size: usize,
        metrics: Arc<CaptureMetrics>,
    ) -> Self {
        Self {
            connection,
            strategy,
            chunk_size: chunk_size.max(1),
            metrics,
        }
    }

    /// Read one chunk through a watermark window and wait until it closes.
    async fn run_chunk(
        &self,
        cursor: &IncrementalCursor,
        table: &TableId,
        dispatcher: &EventDispatcher,
        ctx: &PhaseContext,
    ) -> Result<()> {
        let chunk_id = format!("{}-{}", Uuid::new_v4(), cursor.chunks);
        let (done_tx, done_rx) = oneshot::channel();
        let window = ChunkWindow::new(chunk_id.clone(), table.clone(), done_tx);

        debug!(
            chunk_id = %chunk_id,
            table = %table,
            after = ?cursor.last_key,
            strategy = self.strategy.as_str(),
            "Reading incremental snapshot chunk"
        );

        match &self.strategy {
            WatermarkStrategy::SignalTable { collection } => {
                dispatcher.open_window(window).await;
                self.connection
                    .write_signal(collection, &Signal::window_open(&chunk_id))
                    .await?;
                let rows = self
                    .connection
                    .read_chunk(table, cursor.last_key.as_ref(), self.chunk_size)
                    .await?;
                dispatcher.fill_window(&chunk_id, rows, self.chunk_size, None).await?;
                self.connection
                    .write_signal(collection, &Signal::window_close(&chunk_id))
                    .await?;
            }
            WatermarkStrategy::ReadOnlyGtid => {
                let low = self.connection.executed_gtid_set().await?;
                dispatcher.open_window(window.with_low(low)).await;
                let rows = self
                    .connection
                    .read_chunk(table, cursor.last_key.as_ref(), self.chunk_size)
                    .await?;
                let high = self.connection.executed_gtid_set().await?;
                dispatcher
                    .fill_window(&chunk_id, rows, self.chunk_size, Some(high))
                    .await?;
            }
        }

        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                dispatcher.discard_window(&chunk_id).await;
            }
            // A dropped sender means the window was discarded by a stop signal.
            closed = done_rx => {
                if closed.is_ok() {
                    self.metrics.record_incremental_window();
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PhaseSource for IncrementalSnapshotSource {
    fn kind(&self) -> PhaseKind {
        PhaseKind::IncrementalSnapshot
    }

    async fn execute(&self, ctx: PhaseContext, dispatcher: Arc<EventDispatcher>) -> PhaseResult {
        info!(partition = %ctx.partition, strategy = self.strategy.as_str(), "Incremental snapshot running");

        loop {
            if ctx.cancel.is_cancelled() {
                return PhaseResult::Interrupted(dispatcher.last_offset());
            }

            let changed = dispatcher.incremental_changed();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let cursor = match dispatcher.incremental_cursor().await {
                Some(cursor) if !cursor.is_finished() => cursor,
                _ => {
                    dispatcher.finish_incremental().await;
                    info!(partition = %ctx.partition, "Incremental snapshot completed");
                    return match dispatcher.last_offset() {
                        Some(offset) => PhaseResult::Completed(offset),
                        None => PhaseResult::Interrupted(None),
                    };
                }
            };

            if cursor.paused {
                debug!(partition = %ctx.partition, "Incremental snapshot paused");
                tokio::select! {
                    _ = ctx.cancel.cancelled() => {}
                    _ = changed => {}
                }
                continue;
            }

            let Some(table) = cursor.current_table().cloned() else {
                continue;
            };
            if let Err(e) = self.run_chunk(&cursor, &table, &dispatcher, &ctx).await {
                if e.is_shutdown() {
                    return PhaseResult::Interrupted(dispatcher.last_offset());
                }
                warn!(partition = %ctx.partition, table = %table, error = %e, "Incremental snapshot chunk failed");
                dispatcher.discard_any_window().await;
                return PhaseResult::Failed(e);
            }
        }
    }
}

/// Builds the incremental snapshot source from the resolved watermark strategy.
pub struct IncrementalSnapshotFactory;

impl PhaseFactory for IncrementalSnapshotFactory {
    fn create(&self, setup: &PhaseSetup) -> Result<Arc<dyn PhaseSource>> {
        let strategy = setup.watermark.clone().ok_or_else(|| {
            CaptureError::config("incremental snapshots are disabled for this connection")
        })?;
        Ok(Arc::new(IncrementalSnapshotSource::new(
            setup.connection.clone(),
            strategy,
            setup.config.incremental.chunk_size,
            setup.metrics.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn t(name: &str) -> TableId {
        TableId::new("db", name)
    }

    fn rows(keys: &[i64]) -> Vec<Row> {
        keys.iter().map(|k| Row::new(json!(k), json!({"id": k}))).collect()
    }

    #[test]
    fn test_resolve_strategy() {
        let config = CaptureConfig::new("s1", "db");
        assert_eq!(WatermarkStrategy::resolve(&config, false).unwrap(), None);

        let config = config.with_signal_data_collection("db.signals");
        assert_eq!(
            WatermarkStrategy::resolve(&config, false).unwrap(),
            Some(WatermarkStrategy::SignalTable { collection: t("signals") })
        );

        let config = config.with_read_only(true);
        assert!(matches!(
            WatermarkStrategy::resolve(&config, false),
            Err(CaptureError::Config(_))
        ));
        assert_eq!(
            WatermarkStrategy::resolve(&config, true).unwrap(),
            Some(WatermarkStrategy::ReadOnlyGtid)
        );
    }

    #[test]
    fn test_cursor_tables() {
        let mut cursor = IncrementalCursor::new(vec![t("a"), t("b"), t("a")]);
        assert_eq!(cursor.tables, vec![t("a"), t("b")]);

        cursor.apply_chunk(&t("a"), Some(json!(10)), false);
        assert_eq!(cursor.last_key, Some(json!(10)));
        cursor.apply_chunk(&t("b"), Some(json!(99)), false);
        assert_eq!(cursor.last_key, Some(json!(10)));

        cursor.remove_tables(&[t("a")]);
        assert_eq!(cursor.current_table(), Some(&t("b")));
        assert_eq!(cursor.last_key, None);

        cursor.apply_chunk(&t("b"), None, true);
        assert!(cursor.is_finished());
        assert_eq!(cursor.chunks, 2);
    }

    #[test]
    fn test_cursor_serde() {
        let mut cursor = IncrementalCursor::new(vec![t("a")]);
        cursor.apply_chunk(&t("a"), Some(json!({"id": 7})), false);
        cursor.paused = true;
        let json = serde_json::to_string(&cursor).unwrap();
        assert_eq!(serde_json::from_str::<IncrementalCursor>(&json).unwrap(), cursor);
    }

    #[test]
    fn test_window_evicts_touched_keys() {
        let (tx, _rx) = oneshot::channel();
        let mut window = ChunkWindow::new("c1".into(), t("a"), tx);
        assert!(!window.covers(None));
        window.opened = true;

        // Touched before the chunk query returned.
        window.evict(&json!(2));
        window.fill(rows(&[1, 2, 3]), 3);
        assert!(!window.exhausted);
        assert_eq!(window.last_key, Some(json!(3)));

        // Touched after.
        window.evict(&json!(3));
        let remaining: Vec<_> = window.close().into_iter().map(|r| r.key).collect();
        assert_eq!(remaining, vec![json!(1)]);
    }

    #[test]
    fn test_window_gtid_bounds() {
        let (tx, _rx) = oneshot::channel();
        let low: GtidSet = "u:1-5".parse().unwrap();
        let mut window = ChunkWindow::new("c1".into(), t("a"), tx).with_low(low);
        assert!(!window.covers(Some("u:3")));
        assert!(window.covers(Some("u:6")));

        window.high = Some("u:1-7".parse().unwrap());
        assert!(!window.reached_high(Some(&"u:1-7".parse().unwrap())));
        window.fill(rows(&[1]), 10);
        assert!(window.exhausted);
        assert!(!window.reached_high(Some(&"u:1-6".parse().unwrap())));
        assert!(window.reached_high(Some(&"u:1-8".parse().unwrap())));
    }
}
