//! Upstream collaborator interfaces
//!
//! The capture core does not speak any database wire protocol. It consumes
//! an upstream through [`SourceConnector`] / [`SourceConnection`]: snapshot
//! reads, change-log tailing, chunked key-range reads for incremental
//! snapshots and, when the connection is writable, watermark writes to the
//! signal collection. Transient I/O is retried by the upstream's own policy;
//! errors surfacing here are treated as exhausted.
//!
//! [`memory::MemoryUpstream`] is a scriptable in-process implementation.

use crate::error::{CaptureError, Result};
use crate::event::{EventOp, TableId};
use crate::offset::{GtidSet, LogPosition, Offset};
use crate::signal::Signal;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A table row as read by a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Primary key
    pub key: serde_json::Value,
    /// Full row image
    pub data: serde_json::Value,
}

impl Row {
    pub fn new(key: serde_json::Value, data: serde_json::Value) -> Self {
        Self { key, data }
    }
}

/// A change-log entry before it is shaped into a [`ChangeEvent`](crate::event::ChangeEvent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChangeEvent {
    pub table: TableId,
    pub op: EventOp,
    pub key: serde_json::Value,
    #[serde(default)]
    pub before: Option<serde_json::Value>,
    #[serde(default)]
    pub after: Option<serde_json::Value>,
    /// Log position of this entry
    pub position: LogPosition,
    /// `uuid:txn` of the enclosing transaction, with GTIDs enabled
    #[serde(default)]
    pub gtid: Option<String>,
    /// Commit timestamp (Unix epoch millis)
    pub timestamp: i64,
}

/// Consistent starting point of a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotPoint {
    /// Log position streaming resumes from once the snapshot completes
    pub position: LogPosition,
    /// Executed GTID set at that position, with GTIDs enabled
    pub gtids: Option<GtidSet>,
}

/// Factory for upstream connections.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn SourceConnection>>;
}

/// An open upstream connection.
#[async_trait]
pub trait SourceConnection: Send + Sync {
    /// Whether global transaction identifiers are enabled upstream.
    fn gtid_enabled(&self) -> bool;

    /// Log position and GTID set a transaction-consistent snapshot starts at.
    async fn snapshot_point(&self) -> Result<SnapshotPoint>;

    /// Executed GTID set right now.
    async fn executed_gtid_set(&self) -> Result<GtidSet>;

    /// Rows of `table` in primary-key order, as of the snapshot point.
    async fn read_snapshot_rows(&self, table: &TableId)
        -> Result<BoxStream<'static, Result<Row>>>;

    /// Tail the change log starting at `from` (inclusive) until cancelled.
    async fn tail_change_log(
        &self,
        from: &Offset,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, Result<RawChangeEvent>>>;

    /// Up to `limit` rows of `table` with key greater than `after_key`, in
    /// primary-key order.
    async fn read_chunk(
        &self,
        table: &TableId,
        after_key: Option<&serde_json::Value>,
        limit: usize,
    ) -> Result<Vec<Row>>;

    /// Insert a signal row into the signal collection.
    async fn write_signal(&self, collection: &TableId, signal: &Signal) -> Result<()>;
}

/// Total order over primary-key values.
///
/// Numbers compare numerically, strings lexicographically, arrays and
/// objects element-wise (objects by their values in key order).
pub fn compare_keys(a: &serde_json::Value, b: &serde_json::Value) -> Ordering {
    use serde_json::Value;

    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .unwrap_or(Ordering::Equal),
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y.iter())
            .map(|(x, y)| compare_keys(x, y))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (Value::Object(x), Value::Object(y)) => x
            .values()
            .zip(y.values())
            .map(|(x, y)| compare_keys(x, y))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        _ => rank(a).cmp(&rank(b)),
    }
}

async fn within<T>(limit: Duration, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(limit, fut).await.map_err(|_| {
        CaptureError::timeout(format!("{} did not complete within {}ms", what, limit.as_millis()))
    })?
}

/// Connect, failing with [`CaptureError::Timeout`] after `limit`.
pub async fn connect_within(
    connector: &dyn SourceConnector,
    limit: Duration,
) -> Result<Arc<dyn SourceConnection>> {
    let connection = within(limit, "upstream connect", connector.connect()).await?;
    Ok(Arc::new(BoundedConnection::new(connection, limit)))
}

/// Connection whose setup calls fail with [`CaptureError::Timeout`] after
/// `limit`.
///
/// Snapshot point lookups, GTID queries and opening snapshot or change-log
/// streams are bounded. Items of an open stream, chunk reads and signal
/// writes are not.
pub struct BoundedConnection {
    inner: Arc<dyn SourceConnection>,
    limit: Duration,
}

impl BoundedConnection {
    pub fn new(inner: Arc<dyn SourceConnection>, limit: Duration) -> Self {
        Self { inner, limit }
    }
}

#[async_trait]
impl SourceConnection for BoundedConnection {
    fn gtid_enabled(&self) -> bool {
        self.inner.gtid_enabled()
    }

    async fn snapshot_point(&self) -> Result<SnapshotPoint> {
        within(self.limit, "snapshot point lookup", self.inner.snapshot_point()).await
    }

    async fn executed_gtid_set(&self) -> Result<GtidSet> {
        within(self.limit, "GTID set lookup", self.inner.executed_gtid_set()).await
    }

    async fn read_snapshot_rows(&self, table: &TableId) -> Result<BoxStream<'static, Result<Row>>> {
        within(self.limit, "snapshot read", self.inner.read_snapshot_rows(table)).await
    }

    async fn tail_change_log(
        &self,
        from: &Offset,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, Result<RawChangeEvent>>> {
        within(self.limit, "change log open", self.inner.tail_change_log(from, cancel)).await
    }

    async fn read_chunk(
        &self,
        table: &TableId,
        after_key: Option<&serde_json::Value>,
        limit: usize,
    ) -> Result<Vec<Row>> {
        self.inner.read_chunk(table, after_key, limit).await
    }

    async fn write_signal(&self, collection: &TableId, signal: &Signal) -> Result<()> {
        self.inner.write_signal(collection, signal).await
    }
}

pub mod memory {
    //! Scriptable in-memory upstream.
    //!
    //! Holds tables, a change log and GTID state; mutations through
    //! [`MemoryUpstream::insert`] and friends update the table and append
    //! to the log like a real database would. Failures can be injected.

    use super::*;
    use crate::error::CaptureError;
    use futures::StreamExt;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use tokio::sync::watch;

    /// Source UUID used for generated GTIDs.
    pub const SERVER_UUID: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";

    #[derive(Debug, Default)]
    struct State {
        gtid_enabled: bool,
        read_only: bool,
        tables: BTreeMap<TableId, Vec<Row>>,
        log: Vec<RawChangeEvent>,
        log_file: u32,
        next_position: u64,
        next_txn: u64,
        executed: GtidSet,
        log_ended: bool,
        log_error_at: Option<(usize, String)>,
        connect_error: Option<String>,
        stalled_connect: bool,
        stalled_log: bool,
        failing_tables: BTreeMap<TableId, String>,
        chunk_reads: u64,
    }

    struct Shared {
        state: Mutex<State>,
        appended: watch::Sender<u64>,
    }

    /// In-memory upstream database.
    #[derive(Clone)]
    pub struct MemoryUpstream {
        shared: Arc<Shared>,
    }

    impl Default for MemoryUpstream {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MemoryUpstream {
        pub fn new() -> Self {
            let (appended, _) = watch::channel(0);
            Self {
                shared: Arc::new(Shared {
                    state: Mutex::new(State {
                        log_file: 1,
                        next_position: 4,
                        next_txn: 1,
                        ..Default::default()
                    }),
                    appended,
                }),
            }
        }

        pub fn with_gtids(self, enabled: bool) -> Self {
            self.shared.state.lock().gtid_enabled = enabled;
            self
        }

        pub fn with_read_only(self, read_only: bool) -> Self {
            self.shared.state.lock().read_only = read_only;
            self
        }

        /// Create (or replace) a table with rows, without logging them.
        pub fn with_table(self, table: TableId, rows: Vec<Row>) -> Self {
            let mut rows = rows;
            rows.sort_by(|a, b| compare_keys(&a.key, &b.key));
            self.shared.state.lock().tables.insert(table, rows);
            self
        }

        fn log_file_name(n: u32) -> String {
            format!("mysql-bin.{:06}", n)
        }

        fn append(&self, table: TableId, op: EventOp, key: serde_json::Value, after: Option<serde_json::Value>) {
            {
                let mut st = self.shared.state.lock();
                let rows = st.tables.entry(table.clone()).or_default();
                let idx = rows.binary_search_by(|r| compare_keys(&r.key, &key));
                let before = match (idx, &after) {
                    (Ok(i), Some(after)) => {
                        Some(std::mem::replace(&mut rows[i].data, after.clone()))
                    }
                    (Ok(i), None) => Some(rows.remove(i).data),
                    (Err(i), Some(after)) => {
                        rows.insert(i, Row::new(key.clone(), after.clone()));
                        None
                    }
                    (Err(_), None) => None,
                };

                let position = LogPosition::new(Self::log_file_name(st.log_file), st.next_position);
                st.next_position += 100;
                let gtid = if st.gtid_enabled {
                    let txn = st.next_txn;
                    st.next_txn += 1;
                    st.executed.add(SERVER_UUID, txn);
                    Some(format!("{}:{}", SERVER_UUID, txn))
                } else {
                    None
                };

                let op = match (op, &before) {
                    (EventOp::Insert, Some(_)) => EventOp::Update,
                    (op, _) => op,
                };
                st.log.push(RawChangeEvent {
                    table,
                    op,
                    key,
                    before,
                    after,
                    position,
                    gtid,
                    timestamp: chrono::Utc::now().timestamp_millis(),
                });
            }
            self.shared.appended.send_modify(|n| *n += 1);
        }

        /// Insert a row (becomes an update if the key exists).
        pub fn insert(&self, table: &TableId, key: serde_json::Value, row: serde_json::Value) {
            self.append(table.clone(), EventOp::Insert, key, Some(row));
        }

        pub fn update(&self, table: &TableId, key: serde_json::Value, row: serde_json::Value) {
            self.append(table.clone(), EventOp::Update, key, Some(row));
        }

        pub fn delete(&self, table: &TableId, key: serde_json::Value) {
            self.append(table.clone(), EventOp::Delete, key, None);
        }

        /// Switch to the next binlog file.
        pub fn rotate_log(&self) {
            let mut st = self.shared.state.lock();
            st.log_file += 1;
            st.next_position = 4;
        }

        /// Make every tail stream end after the current log contents.
        pub fn end_log(&self) {
            self.shared.state.lock().log_ended = true;
            self.shared.appended.send_modify(|n| *n += 1);
        }

        /// Make tail streams fail once they reach log index `index`.
        pub fn fail_log_at(&self, index: usize, message: impl Into<String>) {
            self.shared.state.lock().log_error_at = Some((index, message.into()));
            self.shared.appended.send_modify(|n| *n += 1);
        }

        pub fn fail_connect(&self, message: impl Into<String>) {
            self.shared.state.lock().connect_error = Some(message.into());
        }

        /// Make `connect` hang until the caller gives up.
        pub fn stall_connect(&self) {
            self.shared.state.lock().stalled_connect = true;
        }

        /// Make opening the change log hang until the caller gives up.
        pub fn stall_log(&self) {
            self.shared.state.lock().stalled_log = true;
        }

        pub fn fail_table(&self, table: &TableId, message: impl Into<String>) {
            self.shared
                .state
                .lock()
                .failing_tables
                .insert(table.clone(), message.into());
        }

        /// Current rows of a table.
        pub fn rows(&self, table: &TableId) -> Vec<Row> {
            self.shared
                .state
                .lock()
                .tables
                .get(table)
                .cloned()
                .unwrap_or_default()
        }

        pub fn log_len(&self) -> usize {
            self.shared.state.lock().log.len()
        }

        pub fn chunk_reads(&self) -> u64 {
            self.shared.state.lock().chunk_reads
        }

        fn current_position(st: &State) -> LogPosition {
            LogPosition::new(Self::log_file_name(st.log_file), st.next_position)
        }
    }

    #[async_trait]
    impl SourceConnector for MemoryUpstream {
        async fn connect(&self) -> Result<Arc<dyn SourceConnection>> {
            let (error, stalled) = {
                let st = self.shared.state.lock();
                (st.connect_error.clone(), st.stalled_connect)
            };
            if let Some(message) = error {
                return Err(CaptureError::source(message));
            }
            if stalled {
                std::future::pending::<()>().await;
            }
            Ok(Arc::new(self.clone()))
        }
    }

    #[async_trait]
    impl SourceConnection for MemoryUpstream {
        fn gtid_enabled(&self) -> bool {
            self.shared.state.lock().gtid_enabled
        }

        async fn snapshot_point(&self) -> Result<SnapshotPoint> {
            let st = self.shared.state.lock();
            Ok(SnapshotPoint {
                position: Self::current_position(&st),
                gtids: st.gtid_enabled.then(|| st.executed.clone()),
            })
        }

        async fn executed_gtid_set(&self) -> Result<GtidSet> {
            Ok(self.shared.state.lock().executed.clone())
        }

        async fn read_snapshot_rows(
            &self,
            table: &TableId,
        ) -> Result<BoxStream<'static, Result<Row>>> {
            let st = self.shared.state.lock();
            if let Some(message) = st.failing_tables.get(table) {
                return Err(CaptureError::source(message.clone()));
            }
            let rows = st.tables.get(table).cloned().ok_or_else(|| {
                CaptureError::source(format!("table {} does not exist", table))
            })?;
            Ok(futures::stream::iter(rows.into_iter().map(Ok)).boxed())
        }

        async fn tail_change_log(
            &self,
            from: &Offset,
            cancel: CancellationToken,
        ) -> Result<BoxStream<'static, Result<RawChangeEvent>>> {
            let stalled = self.shared.state.lock().stalled_log;
            if stalled {
                std::future::pending::<()>().await;
            }
            let start = {
                let st = self.shared.state.lock();
                let from = from.log_position();
                st.log
                    .iter()
                    .position(|e| &e.position >= from)
                    .unwrap_or(st.log.len())
            };
            let shared = self.shared.clone();
            let changes = self.shared.appended.subscribe();

            let stream = futures::stream::unfold(
                (shared, changes, start, cancel),
                |(shared, mut changes, index, cancel)| async move {
                    if index == usize::MAX {
                        return None;
                    }
                    loop {
                        let _ = changes.borrow_and_update();
                        let next = {
                            let st = shared.state.lock();
                            match &st.log_error_at {
                                Some((at, message)) if *at <= index => {
                                    Some(Err(CaptureError::source(message.clone())))
                                }
                                _ if index < st.log.len() => Some(Ok(st.log[index].clone())),
                                _ if st.log_ended => return None,
                                _ => None,
                            }
                        };
                        match next {
                            Some(Err(e)) => return Some((Err(e), (shared, changes, usize::MAX, cancel))),
                            Some(Ok(event)) => {
                                return Some((Ok(event), (shared, changes, index + 1, cancel)))
                            }
                            None => {}
                        }
                        tokio::select! {
                            _ = cancel.cancelled() => return None,
                            changed = changes.changed() => {
                                if changed.is_err() {
                                    return None;
                                }
                            }
                        }
                    }
                },
            );
            Ok(stream.boxed())
        }

        async fn read_chunk(
            &self,
            table: &TableId,
            after_key: Option<&serde_json::Value>,
            limit: usize,
        ) -> Result<Vec<Row>> {
            let mut st = self.shared.state.lock();
            st.chunk_reads += 1;
            if let Some(message) = st.failing_tables.get(table) {
                return Err(CaptureError::source(message.clone()));
            }
            let rows = st.tables.get(table).ok_or_else(|| {
                CaptureError::source(format!("table {} does not exist", table))
            })?;
            Ok(rows
                .iter()
                .filter(|r| after_key.map_or(true, |k| compare_keys(&r.key, k).is_gt()))
                .take(limit)
                .cloned()
                .collect())
        }

        async fn write_signal(&self, collection: &TableId, signal: &Signal) -> Result<()> {
            if self.shared.state.lock().read_only {
                return Err(CaptureError::source(
                    "cannot write signal: connection is read-only",
                ));
            }
            let row = signal.to_row()?;
            self.insert(collection, serde_json::json!(signal.id), row);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::{self, MemoryUpstream};
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn table() -> TableId {
        TableId::new("db", "t")
    }

    #[test]
    fn test_compare_keys() {
        assert!(compare_keys(&json!(2), &json!(10)).is_lt());
        assert!(compare_keys(&json!("b"), &json!("a")).is_gt());
        assert!(compare_keys(&json!({"a": 1, "b": 2}), &json!({"a": 1, "b": 3})).is_lt());
        assert!(compare_keys(&json!(1), &json!(1)).is_eq());
    }

    #[tokio::test]
    async fn test_memory_mutations_are_logged() {
        let upstream = MemoryUpstream::new().with_gtids(true);
        upstream.insert(&table(), json!(1), json!({"id": 1, "v": "a"}));
        upstream.insert(&table(), json!(1), json!({"id": 1, "v": "b"}));
        upstream.delete(&table(), json!(1));

        let conn = upstream.connect().await.unwrap();
        let from = Offset::Log(LogPosition::new("mysql-bin.000001", 0));
        let cancel = CancellationToken::new();
        upstream.end_log();
        let events: Vec<_> = conn
            .tail_change_log(&from, cancel)
            .await
            .unwrap()
            .collect()
            .await;
        let ops: Vec<_> = events.iter().map(|e| e.as_ref().unwrap().op).collect();
        assert_eq!(ops, vec![EventOp::Insert, EventOp::Update, EventOp::Delete]);
        let executed = conn.executed_gtid_set().await.unwrap();
        assert!(executed.contains(memory::SERVER_UUID, 3));
        assert!(events[0].as_ref().unwrap().gtid.is_some());
        assert!(upstream.rows(&table()).is_empty());
    }

    #[tokio::test]
    async fn test_tail_stops_on_cancel() {
        let upstream = MemoryUpstream::new();
        let conn = upstream.connect().await.unwrap();
        let cancel = CancellationToken::new();
        let mut stream = conn
            .tail_change_log(&Offset::Log(LogPosition::new("mysql-bin.000001", 4)), cancel.clone())
            .await
            .unwrap();
        cancel.cancel();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_read_chunk_after_key() {
        let rows = (1..=5).map(|i| Row::new(json!(i), json!({"id": i}))).collect();
        let upstream = MemoryUpstream::new().with_table(table(), rows);
        let conn = upstream.connect().await.unwrap();
        let chunk = conn.read_chunk(&table(), Some(&json!(2)), 2).await.unwrap();
        let keys: Vec<_> = chunk.iter().map(|r| r.key.clone()).collect();
        assert_eq!(keys, vec![json!(3), json!(4)]);
    }

    #[tokio::test]
    async fn test_read_only_rejects_signal_writes() {
        let upstream = MemoryUpstream::new().with_read_only(true);
        let conn = upstream.connect().await.unwrap();
        let err = conn
            .write_signal(&TableId::new("db", "signals"), &Signal::pause())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::CaptureError::Source(_)));
    }

    #[tokio::test]
    async fn test_stalled_connect_times_out() {
        let upstream = MemoryUpstream::new();
        upstream.stall_connect();
        let result = connect_within(&upstream, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(CaptureError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_stalled_change_log_open_times_out() {
        let upstream = MemoryUpstream::new();
        let conn = connect_within(&upstream, Duration::from_millis(50)).await.unwrap();
        upstream.stall_log();

        let from = Offset::Log(LogPosition::new("mysql-bin.000001", 4));
        let err = conn
            .tail_change_log(&from, CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("change log open"), "{}", err);
        assert!(conn.snapshot_point().await.is_ok());
    }
}
