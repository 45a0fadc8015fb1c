//! # Capture Signals
//!
//! Control records for incremental snapshots, compatible with the Debezium
//! signaling table layout:
//!
//! ```sql
//! CREATE TABLE debezium_signal (
//!     id VARCHAR(42) PRIMARY KEY,
//!     type VARCHAR(32) NOT NULL,
//!     data VARCHAR(2048) NULL
//! );
//! ```
//!
//! Signals arrive either as change-log rows of the configured signal
//! collection or through the in-process [`SignalChannel`] on the capture
//! handle. A read-only connection cannot write to the signal collection, so
//! there the channel is the only way in.
//!
//! Watermark records (`snapshot-window-open` / `snapshot-window-close`) are
//! written by the incremental snapshot itself and bracket one chunk read.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let handle = orchestrator.handle();
//! handle
//!     .send_signal(Signal::execute_snapshot(vec!["inventory.orders".into()]))
//!     .await?;
//! ```

use crate::error::{CaptureError, Result};
use crate::event::TableId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Signal action types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalAction {
    /// Start an incremental snapshot of the listed tables
    ExecuteSnapshot,
    /// Stop the incremental snapshot (optionally only some tables)
    StopSnapshot,
    /// Pause the incremental snapshot
    PauseSnapshot,
    /// Resume a paused incremental snapshot
    ResumeSnapshot,
    /// Log a message (diagnostic)
    Log,
    /// Low watermark of a chunk
    SnapshotWindowOpen,
    /// High watermark of a chunk
    SnapshotWindowClose,
    /// Unknown action, ignored
    Custom(String),
}

impl SignalAction {
    pub fn as_str(&self) -> &str {
        match self {
            SignalAction::ExecuteSnapshot => "execute-snapshot",
            SignalAction::StopSnapshot => "stop-snapshot",
            SignalAction::PauseSnapshot => "pause-snapshot",
            SignalAction::ResumeSnapshot => "resume-snapshot",
            SignalAction::Log => "log",
            SignalAction::SnapshotWindowOpen => "snapshot-window-open",
            SignalAction::SnapshotWindowClose => "snapshot-window-close",
            SignalAction::Custom(name) => name,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "execute-snapshot" => SignalAction::ExecuteSnapshot,
            "stop-snapshot" => SignalAction::StopSnapshot,
            "pause-snapshot" => SignalAction::PauseSnapshot,
            "resume-snapshot" => SignalAction::ResumeSnapshot,
            "log" => SignalAction::Log,
            "snapshot-window-open" => SignalAction::SnapshotWindowOpen,
            "snapshot-window-close" => SignalAction::SnapshotWindowClose,
            other => SignalAction::Custom(other.to_string()),
        }
    }
}

/// Signal data payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalData {
    /// Tables to snapshot or stop (`db.table`)
    #[serde(default, rename = "data-collections", skip_serializing_if = "Vec::is_empty")]
    pub data_collections: Vec<String>,
    /// Snapshot type (only `incremental` is supported)
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub snapshot_type: Option<String>,
    /// Additional properties
    #[serde(default, flatten)]
    pub properties: HashMap<String, serde_json::Value>,
}

impl SignalData {
    pub fn for_snapshot(tables: Vec<String>) -> Self {
        Self {
            data_collections: tables,
            snapshot_type: Some("incremental".to_string()),
            properties: HashMap::new(),
        }
    }

    pub fn for_log(message: &str) -> Self {
        let mut data = Self::default();
        data.properties.insert(
            "message".to_string(),
            serde_json::Value::String(message.to_string()),
        );
        data
    }

    pub fn log_message(&self) -> Option<&str> {
        self.properties.get("message")?.as_str()
    }
}

/// Where a signal came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalSource {
    /// In-process channel
    #[default]
    Api,
    /// Row of the signal collection observed in the change log
    Source,
}

/// A capture signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    #[serde(rename = "type")]
    pub action: SignalAction,
    #[serde(default)]
    pub data: SignalData,
    #[serde(default)]
    pub source: SignalSource,
}

impl Signal {
    pub fn new(id: impl Into<String>, action: SignalAction, data: SignalData) -> Self {
        Self {
            id: id.into(),
            action,
            data,
            source: SignalSource::Api,
        }
    }

    pub fn execute_snapshot(tables: Vec<String>) -> Self {
        Self::new(
            Uuid::new_v4().to_string(),
            SignalAction::ExecuteSnapshot,
            SignalData::for_snapshot(tables),
        )
    }

    /// Stop the incremental snapshot; an empty list stops all tables.
    pub fn stop_snapshot(tables: Vec<String>) -> Self {
        Self::new(
            Uuid::new_v4().to_string(),
            SignalAction::StopSnapshot,
            SignalData::for_snapshot(tables),
        )
    }

    pub fn pause() -> Self {
        Self::new(
            Uuid::new_v4().to_string(),
            SignalAction::PauseSnapshot,
            SignalData::default(),
        )
    }

    pub fn resume() -> Self {
        Self::new(
            Uuid::new_v4().to_string(),
            SignalAction::ResumeSnapshot,
            SignalData::default(),
        )
    }

    pub fn log(message: &str) -> Self {
        Self::new(
            Uuid::new_v4().to_string(),
            SignalAction::Log,
            SignalData::for_log(message),
        )
    }

    /// Low watermark for chunk `chunk_id`.
    pub fn window_open(chunk_id: &str) -> Self {
        Self::new(
            format!("{}-open", chunk_id),
            SignalAction::SnapshotWindowOpen,
            SignalData::default(),
        )
    }

    /// High watermark for chunk `chunk_id`.
    pub fn window_close(chunk_id: &str) -> Self {
        Self::new(
            format!("{}-close", chunk_id),
            SignalAction::SnapshotWindowClose,
            SignalData::default(),
        )
    }

    pub fn with_source(mut self, source: SignalSource) -> Self {
        self.source = source;
        self
    }

    /// Chunk id of a watermark signal.
    pub fn chunk_id(&self) -> Option<&str> {
        match self.action {
            SignalAction::SnapshotWindowOpen => self.id.strip_suffix("-open"),
            SignalAction::SnapshotWindowClose => self.id.strip_suffix("-close"),
            _ => None,
        }
    }

    pub fn is_watermark(&self) -> bool {
        matches!(
            self.action,
            SignalAction::SnapshotWindowOpen | SignalAction::SnapshotWindowClose
        )
    }

    /// Tables named by a snapshot signal.
    pub fn tables(&self) -> Result<Vec<TableId>> {
        self.data
            .data_collections
            .iter()
            .map(|t| {
                TableId::parse(t).ok_or_else(|| {
                    CaptureError::invalid_state(format!(
                        "signal {}: data collection '{}' is not db.table",
                        self.id, t
                    ))
                })
            })
            .collect()
    }

    /// Parse a signal from a signal-collection row.
    pub fn parse_from_row(id: &str, signal_type: &str, data: Option<&str>) -> Result<Signal> {
        let data = match data.map(str::trim) {
            Some(s) if !s.is_empty() => serde_json::from_str(s)?,
            _ => SignalData::default(),
        };
        Ok(Signal::new(id, SignalAction::parse(signal_type), data).with_source(SignalSource::Source))
    }

    /// Parse a signal from a row image (`{"id", "type", "data"}`).
    pub fn from_row(row: &serde_json::Value) -> Result<Signal> {
        let field = |name: &str| row.get(name).and_then(serde_json::Value::as_str);
        let id = field("id")
            .ok_or_else(|| CaptureError::invalid_state("signal row without 'id'"))?;
        let signal_type = field("type")
            .ok_or_else(|| CaptureError::invalid_state("signal row without 'type'"))?;
        Self::parse_from_row(id, signal_type, field("data"))
    }

    /// Row image written to the signal collection.
    pub fn to_row(&self) -> Result<serde_json::Value> {
        let data = if self.data == SignalData::default() {
            serde_json::Value::Null
        } else {
            serde_json::Value::String(serde_json::to_string(&self.data)?)
        };
        Ok(serde_json::json!({
            "id": self.id,
            "type": self.action.as_str(),
            "data": data,
        }))
    }
}

/// In-process signal channel.
#[derive(Debug, Clone)]
pub struct SignalChannel {
    sender: mpsc::Sender<Signal>,
}

impl SignalChannel {
    pub fn new(buffer_size: usize) -> (Self, mpsc::Receiver<Signal>) {
        let (sender, receiver) = mpsc::channel(buffer_size);
        (Self { sender }, receiver)
    }

    pub async fn send(&self, signal: Signal) -> Result<()> {
        self.sender
            .send(signal)
            .await
            .map_err(|_| CaptureError::Shutdown)
    }

    pub fn try_send(&self, signal: Signal) -> Result<()> {
        self.sender.try_send(signal).map_err(|e| match e {
            mpsc::error::TrySendError::Closed(_) => CaptureError::Shutdown,
            mpsc::error::TrySendError::Full(_) => {
                CaptureError::invalid_state("signal channel is full")
            }
        })
    }
}
