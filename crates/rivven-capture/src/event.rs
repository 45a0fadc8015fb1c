//! Change event envelope
//!
//! Every record travelling from a phase source to the consumer is a
//! [`ChangeEvent`]: the row image, its destination identity and the source
//! position it was read at. Phase sources additionally emit
//! [`PhaseTransitionSignal`]s, which the dispatcher consumes to drive the
//! event queue's buffering mode; they are never delivered downstream.
//!
//! ## Snapshot markers
//!
//! Snapshot reads carry a [`SnapshotMarker`]. The marker on the final
//! snapshot record is rewritten to `Last` after the fact, once the snapshot
//! knows it has ended:
//!
//! ```ignore
//! queue.flush_buffer(|event| event.into_last_snapshot_record())?;
//! ```

use crate::incremental_snapshot::IncrementalCursor;
use crate::offset::Offset;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// One logical capture stream.
///
/// Identity is the server name alone; the database name is descriptive and
/// does not participate in equality or hashing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partition {
    pub server_name: String,
    #[serde(default)]
    pub database: String,
}

impl Partition {
    pub fn new(server_name: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            database: database.into(),
        }
    }

    /// Key/value identity as persisted next to the offset.
    pub fn source_partition(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        map.insert(
            "server".to_string(),
            serde_json::Value::String(self.server_name.clone()),
        );
        map
    }
}

impl PartialEq for Partition {
    fn eq(&self, other: &Self) -> bool {
        self.server_name == other.server_name
    }
}

impl Eq for Partition {}

impl Hash for Partition {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.server_name.hash(state);
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.server_name)
    }
}

/// Fully-qualified table identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId {
    pub database: String,
    pub table: String,
}

impl TableId {
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
        }
    }

    /// Parse `db.table`.
    pub fn parse(s: &str) -> Option<Self> {
        let (db, table) = s.split_once('.')?;
        if db.is_empty() || table.is_empty() {
            return None;
        }
        Some(Self::new(db, table))
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

/// Change operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOp {
    /// Snapshot read
    Read,
    Insert,
    Update,
    Delete,
}

impl EventOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOp::Read => "r",
            EventOp::Insert => "c",
            EventOp::Update => "u",
            EventOp::Delete => "d",
        }
    }
}

/// Position of a record within the snapshot that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotMarker {
    /// First record of the initial snapshot
    First,
    /// Any other initial snapshot record
    InProgress,
    /// Final record of the initial snapshot
    Last,
    /// Read produced by an incremental snapshot chunk
    Incremental,
    /// Streaming record
    #[default]
    Off,
}

/// A captured row change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub partition: Partition,
    pub offset: Offset,
    /// Destination identity (`server.db.table`)
    pub destination: String,
    pub op: EventOp,
    pub table: TableId,
    /// Primary key of the row
    pub key: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<serde_json::Value>,
    #[serde(default)]
    pub snapshot: SnapshotMarker,
    /// Incremental snapshot cursor at the time the event was admitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incremental: Option<IncrementalCursor>,
    /// Transaction identifier, when the source runs with GTIDs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gtid: Option<String>,
    /// Source timestamp (Unix epoch millis)
    pub timestamp: i64,
}

impl ChangeEvent {
    /// Create a read event for a snapshot row.
    pub fn read(
        partition: Partition,
        table: TableId,
        key: serde_json::Value,
        row: serde_json::Value,
        offset: Offset,
        snapshot: SnapshotMarker,
    ) -> Self {
        Self {
            destination: destination(&partition, &table),
            partition,
            offset,
            op: EventOp::Read,
            table,
            key,
            before: None,
            after: Some(row),
            snapshot,
            incremental: None,
            gtid: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Create a change event from a streamed log entry.
    #[allow(clippy::too_many_arguments)]
    pub fn change(
        partition: Partition,
        table: TableId,
        op: EventOp,
        key: serde_json::Value,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
        offset: Offset,
        timestamp: i64,
    ) -> Self {
        Self {
            destination: destination(&partition, &table),
            partition,
            offset,
            op,
            table,
            key,
            before,
            after,
            snapshot: SnapshotMarker::Off,
            incremental: None,
            gtid: None,
            timestamp,
        }
    }

    pub fn with_gtid(mut self, gtid: Option<String>) -> Self {
        self.gtid = gtid;
        self
    }

    pub fn with_incremental(mut self, cursor: Option<IncrementalCursor>) -> Self {
        self.incremental = cursor;
        self
    }

    pub fn is_snapshot_read(&self) -> bool {
        matches!(
            self.snapshot,
            SnapshotMarker::First | SnapshotMarker::InProgress | SnapshotMarker::Last
        )
    }

    /// Rewrite applied to the final buffered snapshot record: flag it as the
    /// last snapshot record and mark the snapshot as completed in its offset.
    pub fn into_last_snapshot_record(mut self) -> Self {
        self.snapshot = SnapshotMarker::Last;
        self.offset = self.offset.mark_snapshot_completed();
        self
    }
}

fn destination(partition: &Partition, table: &TableId) -> String {
    format!("{}.{}.{}", partition.server_name, table.database, table.table)
}

/// Lifecycle marker emitted by phase sources between units of work.
///
/// Consumed by the dispatcher to drive the event queue's buffering mode.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseTransitionSignal {
    /// Initial snapshot is about to emit its first record
    SnapshotStarted,
    /// All rows of a table have been emitted
    SnapshotTableCompleted { table: TableId, rows: u64 },
    /// Initial snapshot finished; `offset` is the completed snapshot offset
    SnapshotCompleted { offset: Offset },
}

/// Anything a phase source hands to the dispatcher.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    Change(ChangeEvent),
    Transition(PhaseTransitionSignal),
}
