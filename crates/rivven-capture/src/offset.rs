//! # Offsets and Partition State
//!
//! Positional state threaded through every capture phase so a restart
//! resumes at the right place.
//!
//! ## Offset Formats
//!
//! | Variant | Meaning | Display |
//! |---------|---------|---------|
//! | `Snapshot` | progress through the initial snapshot | `snapshot[table=1,row=42]@mysql-bin.000003:154` |
//! | `Log` | binlog file + position (+ row inside a multi-row event) | `mysql-bin.000003:154` |
//! | `Gtid` | executed GTID set + binlog position | `3E11FA47-...:1-5@mysql-bin.000003:154` |
//!
//! ## Ordering
//!
//! Offsets are only partially ordered: a snapshot offset precedes every
//! streaming offset at or after its resume position, binlog positions are
//! totally ordered, and GTID sets are ordered by containment. Two GTID sets
//! where neither contains the other are incomparable, and [`OffsetState`]
//! treats advancing between incomparable offsets as an ordering violation.

use crate::error::{CaptureError, Result};
use crate::event::{ChangeEvent, Partition};
use crate::incremental_snapshot::IncrementalCursor;
use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, error};

/// Position in the binary log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogPosition {
    /// Binlog file name (e.g. `mysql-bin.000003`)
    pub file: String,
    /// Byte position within the file
    pub position: u64,
    /// Row index inside a multi-row event
    #[serde(default)]
    pub row: u32,
}

impl LogPosition {
    pub fn new(file: impl Into<String>, position: u64) -> Self {
        Self {
            file: file.into(),
            position,
            row: 0,
        }
    }

    /// Set the row index inside a multi-row event.
    pub fn with_row(mut self, row: u32) -> Self {
        self.row = row;
        self
    }

    /// Numeric suffix of the file name, used to order rotated files.
    pub fn file_sequence(&self) -> Option<u64> {
        self.file
            .rsplit_once('.')
            .and_then(|(_, suffix)| suffix.parse().ok())
    }
}

impl Ord for LogPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        let files = match (self.file_sequence(), other.file_sequence()) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.file.cmp(&other.file)),
            _ => self.file.cmp(&other.file),
        };
        files
            .then(self.position.cmp(&other.position))
            .then(self.row.cmp(&other.row))
    }
}

impl PartialOrd for LogPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.row > 0 {
            write!(f, "{}:{}#{}", self.file, self.position, self.row)
        } else {
            write!(f, "{}:{}", self.file, self.position)
        }
    }
}

/// Set of executed global transaction identifiers.
///
/// Stored as merged, sorted, inclusive intervals per source UUID. The text
/// form is MySQL's (`uuid:1-5:7,uuid2:1-3`) and round-trips exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct GtidSet {
    sources: BTreeMap<String, Vec<(u64, u64)>>,
}

impl GtidSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Add a single transaction `uuid:txn`.
    pub fn add(&mut self, uuid: &str, txn: u64) {
        self.add_interval(uuid, txn, txn);
    }

    /// Add a single GTID given in `uuid:txn` form.
    pub fn add_gtid(&mut self, gtid: &str) -> Result<()> {
        let (uuid, txn) = gtid
            .rsplit_once(':')
            .ok_or_else(|| CaptureError::source(format!("malformed GTID '{}'", gtid)))?;
        let txn = txn
            .parse()
            .map_err(|_| CaptureError::source(format!("malformed GTID '{}'", gtid)))?;
        self.add(uuid, txn);
        Ok(())
    }

    fn add_interval(&mut self, uuid: &str, start: u64, end: u64) {
        let intervals = self.sources.entry(uuid.to_lowercase()).or_default();
        intervals.push((start, end));
        intervals.sort_unstable();

        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(intervals.len());
        for &(s, e) in intervals.iter() {
            match merged.last_mut() {
                Some(last) if s <= last.1.saturating_add(1) => last.1 = last.1.max(e),
                _ => merged.push((s, e)),
            }
        }
        *intervals = merged;
    }

    /// Check whether `uuid:txn` is part of this set.
    pub fn contains(&self, uuid: &str, txn: u64) -> bool {
        self.sources
            .get(&uuid.to_lowercase())
            .is_some_and(|intervals| intervals.iter().any(|&(s, e)| s <= txn && txn <= e))
    }

    /// Check whether a `uuid:txn` GTID string is part of this set.
    pub fn contains_gtid(&self, gtid: &str) -> bool {
        gtid.rsplit_once(':')
            .and_then(|(uuid, txn)| txn.parse().ok().map(|txn| self.contains(uuid, txn)))
            .unwrap_or(false)
    }

    /// Check whether every transaction of `other` is contained in this set.
    pub fn is_superset_of(&self, other: &GtidSet) -> bool {
        other.sources.iter().all(|(uuid, intervals)| {
            let Some(mine) = self.sources.get(uuid) else {
                return false;
            };
            intervals
                .iter()
                .all(|&(s, e)| mine.iter().any(|&(ms, me)| ms <= s && e <= me))
        })
    }
}

impl PartialOrd for GtidSet {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self.is_superset_of(other), other.is_superset_of(self)) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Greater),
            (false, true) => Some(Ordering::Less),
            (false, false) => None,
        }
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (uuid, intervals) in &self.sources {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            f.write_str(uuid)?;
            for &(s, e) in intervals {
                if s == e {
                    write!(f, ":{}", s)?;
                } else {
                    write!(f, ":{}-{}", s, e)?;
                }
            }
        }
        Ok(())
    }
}

impl FromStr for GtidSet {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self> {
        let mut set = GtidSet::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let mut pieces = part.split(':');
            let uuid = pieces
                .next()
                .filter(|u| !u.is_empty())
                .ok_or_else(|| CaptureError::config(format!("malformed GTID set '{}'", s)))?;
            for range in pieces {
                let (start, end) = match range.split_once('-') {
                    Some((a, b)) => (a.parse(), b.parse()),
                    None => (range.parse(), range.parse()),
                };
                match (start, end) {
                    (Ok(start), Ok(end)) if start <= end => set.add_interval(uuid, start, end),
                    _ => {
                        return Err(CaptureError::config(format!(
                            "malformed GTID interval '{}' in '{}'",
                            range, s
                        )))
                    }
                }
            }
        }
        Ok(set)
    }
}

impl Serialize for GtidSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for GtidSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Progress through the initial snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotOffset {
    /// Where streaming resumes once the snapshot has completed
    pub resume: LogPosition,
    /// Executed GTID set captured with the resume position
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gtids: Option<GtidSet>,
    /// Index of the table being read
    pub table: u32,
    /// Rows emitted for that table so far
    pub row: u64,
    /// Whether the snapshot has completed
    #[serde(default)]
    pub completed: bool,
}

/// GTID-based streaming position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidOffset {
    pub gtids: GtidSet,
    pub position: LogPosition,
}

/// Position within a partition's change stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Offset {
    /// Snapshot in progress (or just completed)
    Snapshot(SnapshotOffset),
    /// Binlog file + position
    Log(LogPosition),
    /// Executed GTID set + binlog position
    Gtid(GtidOffset),
}

impl Offset {
    /// Position streaming reads from when resuming at this offset.
    pub fn log_position(&self) -> &LogPosition {
        match self {
            Offset::Snapshot(s) => &s.resume,
            Offset::Log(p) => p,
            Offset::Gtid(g) => &g.position,
        }
    }

    /// Executed GTID set, if tracked.
    pub fn gtids(&self) -> Option<&GtidSet> {
        match self {
            Offset::Snapshot(s) => s.gtids.as_ref(),
            Offset::Log(_) => None,
            Offset::Gtid(g) => Some(&g.gtids),
        }
    }

    /// Whether this offset was produced during the initial snapshot.
    pub fn is_snapshot(&self) -> bool {
        matches!(self, Offset::Snapshot(_))
    }

    /// Whether a snapshot recorded in this offset still has to be finished.
    pub fn snapshot_in_progress(&self) -> bool {
        matches!(self, Offset::Snapshot(s) if !s.completed)
    }

    /// Copy of this offset with the snapshot marked as completed.
    pub fn mark_snapshot_completed(&self) -> Offset {
        match self {
            Offset::Snapshot(s) => Offset::Snapshot(SnapshotOffset {
                completed: true,
                ..s.clone()
            }),
            other => other.clone(),
        }
    }

    /// Streaming offset at which a completed snapshot hands over.
    pub fn streaming_start(&self) -> Offset {
        match self {
            Offset::Snapshot(s) => match &s.gtids {
                Some(gtids) => Offset::Gtid(GtidOffset {
                    gtids: gtids.clone(),
                    position: s.resume.clone(),
                }),
                None => Offset::Log(s.resume.clone()),
            },
            other => other.clone(),
        }
    }
}

impl PartialOrd for Offset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        use Offset::*;
        match (self, other) {
            (Snapshot(a), Snapshot(b)) => {
                if a.resume != b.resume || a.gtids != b.gtids {
                    return None;
                }
                Some(
                    (a.table, a.row, a.completed).cmp(&(b.table, b.row, b.completed)),
                )
            }
            // A snapshot precedes every streaming position at or after its resume point.
            (Snapshot(s), streaming) => Some(if streaming.log_position() >= &s.resume {
                Ordering::Less
            } else {
                Ordering::Greater
            }),
            (streaming, Snapshot(s)) => Some(if streaming.log_position() >= &s.resume {
                Ordering::Greater
            } else {
                Ordering::Less
            }),
            (Log(a), Log(b)) => Some(a.cmp(b)),
            (Gtid(a), Gtid(b)) => match a.gtids.partial_cmp(&b.gtids)? {
                Ordering::Equal => Some(a.position.cmp(&b.position)),
                ord => Some(ord),
            },
            (Log(a), Gtid(b)) => Some(a.cmp(&b.position).then(Ordering::Less)),
            (Gtid(a), Log(b)) => Some(a.position.cmp(b).then(Ordering::Greater)),
        }
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Offset::Snapshot(s) => write!(
                f,
                "snapshot[table={},row={}{}]@{}",
                s.table,
                s.row,
                if s.completed { ",completed" } else { "" },
                s.resume
            ),
            Offset::Log(p) => write!(f, "{}", p),
            Offset::Gtid(g) => write!(f, "{}@{}", g.gtids, g.position),
        }
    }
}

/// Everything persisted for one partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionState {
    pub offset: Offset,
    /// Chunk cursor of an active incremental snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incremental: Option<IncrementalCursor>,
}

impl PartitionState {
    pub fn new(offset: Offset) -> Self {
        Self {
            offset,
            incremental: None,
        }
    }

    pub fn with_incremental(mut self, cursor: Option<IncrementalCursor>) -> Self {
        self.incremental = cursor;
        self
    }
}

/// Process-wide offset tracking.
///
/// Mutated only by the capture orchestrator as events are admitted to the
/// event queue; readers take a consistent copy via [`OffsetState::snapshot`].
#[derive(Debug, Default)]
pub struct OffsetState {
    partitions: RwLock<HashMap<Partition, PartitionState>>,
}

impl OffsetState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a partition with state loaded at startup.
    pub fn restore(&self, partition: Partition, state: PartitionState) {
        debug!(partition = %partition, offset = %state.offset, "Restored partition offset");
        self.partitions.write().insert(partition, state);
    }

    /// Current offset of a partition.
    pub fn current_offset(&self, partition: &Partition) -> Option<Offset> {
        self.partitions
            .read()
            .get(partition)
            .map(|s| s.offset.clone())
    }

    /// Advance a partition past an admitted event.
    pub fn advance(&self, partition: &Partition, event: &ChangeEvent) -> Result<()> {
        self.advance_to(partition, event.offset.clone(), event.incremental.clone())
    }

    /// Fail with [`CaptureError::OrderingViolation`] if `offset` would move
    /// `partition` backwards.
    pub fn check_forward(&self, partition: &Partition, offset: &Offset) -> Result<()> {
        let partitions = self.partitions.read();
        ensure_forward(partition, partitions.get(partition).map(|s| &s.offset), offset)
    }

    /// Advance a partition to `offset`.
    ///
    /// Fails with [`CaptureError::OrderingViolation`] if `offset` is behind
    /// (or incomparable with) the current offset; the state is left untouched.
    pub fn advance_to(
        &self,
        partition: &Partition,
        offset: Offset,
        incremental: Option<IncrementalCursor>,
    ) -> Result<()> {
        let mut partitions = self.partitions.write();
        ensure_forward(partition, partitions.get(partition).map(|s| &s.offset), &offset)?;
        partitions.insert(
            partition.clone(),
            PartitionState {
                offset,
                incremental,
            },
        );
        Ok(())
    }

    /// Replace the incremental cursor without moving the offset.
    pub fn set_incremental(&self, partition: &Partition, cursor: Option<IncrementalCursor>) {
        if let Some(state) = self.partitions.write().get_mut(partition) {
            state.incremental = cursor;
        }
    }

    /// Consistent copy of all partitions.
    pub fn snapshot(&self) -> HashMap<Partition, PartitionState> {
        self.partitions.read().clone()
    }
}

fn ensure_forward(partition: &Partition, current: Option<&Offset>, offset: &Offset) -> Result<()> {
    let Some(current) = current else {
        return Ok(());
    };
    match offset.partial_cmp(current) {
        Some(Ordering::Less) | None => {
            error!(
                partition = %partition,
                current = %current,
                attempted = %offset,
                "Offset regression rejected"
            );
            Err(CaptureError::ordering_violation(format!(
                "offset for {} would move from {} to {}",
                partition, current, offset
            )))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TableId;

    fn partition() -> Partition {
        Partition::new("server1", "inventory")
    }

    fn snapshot_offset(table: u32, row: u64) -> Offset {
        Offset::Snapshot(SnapshotOffset {
            resume: LogPosition::new("mysql-bin.000003", 154),
            gtids: None,
            table,
            row,
            completed: false,
        })
    }

    #[test]
    fn test_log_position_ordering_across_rotation() {
        let a = LogPosition::new("mysql-bin.000009", 90_000);
        let b = LogPosition::new("mysql-bin.000010", 4);
        assert!(a < b);
        assert!(LogPosition::new("f.1", 10).with_row(1) > LogPosition::new("f.1", 10));
        assert_eq!(b.to_string(), "mysql-bin.000010:4");
    }

    #[test]
    fn test_gtid_set_round_trip() {
        let text = "3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5:7,a1b2c3d4-0000-0000-0000-000000000001:3";
        let set: GtidSet = text.parse().unwrap();
        assert_eq!(set.to_string(), text);
        assert!(set.contains("3E11FA47-71CA-11E1-9E33-C80AA9429562", 4));
        assert!(!set.contains("3e11fa47-71ca-11e1-9e33-c80aa9429562", 6));

        let json = serde_json::to_string(&set).unwrap();
        let back: GtidSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }

    #[test]
    fn test_gtid_set_merges_adjacent() {
        let mut set = GtidSet::new();
        set.add("u", 1);
        set.add("u", 3);
        set.add("u", 2);
        assert_eq!(set.to_string(), "u:1-3");
        assert!("u:x".parse::<GtidSet>().is_err());
    }

    #[test]
    fn test_gtid_set_partial_order() {
        let small: GtidSet = "u:1-3".parse().unwrap();
        let big: GtidSet = "u:1-5".parse().unwrap();
        let other: GtidSet = "v:1".parse().unwrap();
        assert_eq!(small.partial_cmp(&big), Some(Ordering::Less));
        assert_eq!(big.partial_cmp(&small), Some(Ordering::Greater));
        assert_eq!(small.partial_cmp(&other), None);
    }

    #[test]
    fn test_snapshot_precedes_streaming() {
        let snap = snapshot_offset(3, 100);
        let stream = Offset::Log(LogPosition::new("mysql-bin.000003", 154));
        assert!(snap < stream);
        let before = Offset::Log(LogPosition::new("mysql-bin.000002", 10));
        assert!(snap > before);
    }

    #[test]
    fn test_streaming_start_from_snapshot() {
        let snap = snapshot_offset(0, 0);
        assert_eq!(
            snap.streaming_start(),
            Offset::Log(LogPosition::new("mysql-bin.000003", 154))
        );
        assert!(snap.snapshot_in_progress());
        assert!(!snap.mark_snapshot_completed().snapshot_in_progress());
    }

    #[test]
    fn test_advance_is_monotonic() {
        let state = OffsetState::new();
        let p = partition();
        state.advance_to(&p, snapshot_offset(0, 1), None).unwrap();
        state.advance_to(&p, snapshot_offset(0, 2), None).unwrap();
        state.advance_to(&p, snapshot_offset(0, 2), None).unwrap();
        state.advance_to(&p, snapshot_offset(1, 1), None).unwrap();

        let err = state.advance_to(&p, snapshot_offset(0, 5), None).unwrap_err();
        assert!(matches!(err, CaptureError::OrderingViolation(_)));
        assert_eq!(state.current_offset(&p), Some(snapshot_offset(1, 1)));
    }

    #[test]
    fn test_advance_follows_admitted_events() {
        let state = OffsetState::new();
        let p = partition();
        let event = |table, row| {
            ChangeEvent::read(
                p.clone(),
                TableId::new("inventory", "orders"),
                serde_json::json!(row),
                serde_json::json!({"id": row}),
                snapshot_offset(table, row),
                crate::event::SnapshotMarker::InProgress,
            )
        };

        state.advance(&p, &event(0, 3)).unwrap();
        assert!(state.check_forward(&p, &snapshot_offset(0, 3)).is_ok());
        assert!(matches!(
            state.check_forward(&p, &snapshot_offset(0, 1)),
            Err(CaptureError::OrderingViolation(_))
        ));
        assert!(state.advance(&p, &event(0, 2)).is_err());
        assert_eq!(state.current_offset(&p), Some(snapshot_offset(0, 3)));

        state.advance(&p, &event(1, 1)).unwrap();
        assert_eq!(state.snapshot()[&p].offset, snapshot_offset(1, 1));
    }

    #[test]
    fn test_advance_rejects_incomparable_gtids() {
        let state = OffsetState::new();
        let p = partition();
        let pos = LogPosition::new("mysql-bin.000001", 4);
        let a = Offset::Gtid(GtidOffset {
            gtids: "u:1".parse().unwrap(),
            position: pos.clone(),
        });
        let b = Offset::Gtid(GtidOffset {
            gtids: "v:1".parse().unwrap(),
            position: pos,
        });
        state.advance_to(&p, a, None).unwrap();
        assert!(state.advance_to(&p, b, None).is_err());
    }

    #[test]
    fn test_offset_serde_round_trip() {
        let offsets = vec![
            snapshot_offset(2, u64::MAX),
            Offset::Log(LogPosition::new("mysql-bin.000042", u64::MAX - 1).with_row(7)),
            Offset::Gtid(GtidOffset {
                gtids: "u:1-100".parse().unwrap(),
                position: LogPosition::new("mysql-bin.000001", 4),
            }),
        ];
        for offset in offsets {
            let json = serde_json::to_string(&offset).unwrap();
            let back: Offset = serde_json::from_str(&json).unwrap();
            assert_eq!(back, offset);
        }
    }

    #[test]
    fn test_snapshot_read_is_consistent_copy() {
        let state = OffsetState::new();
        let p = partition();
        state.restore(p.clone(), PartitionState::new(snapshot_offset(0, 0)));
        let copy = state.snapshot();
        state.advance_to(&p, snapshot_offset(0, 9), None).unwrap();
        assert_eq!(copy[&p].offset, snapshot_offset(0, 0));
    }
}
