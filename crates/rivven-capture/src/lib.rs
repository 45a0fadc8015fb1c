//! # rivven-capture - Snapshot + streaming change capture
//!
//! Captures an initial consistent snapshot of a database and its ongoing
//! row-level changes, merges them into one ordered event stream, and
//! delivers that stream to a consumer with configurable ordering and
//! concurrency.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  ┌───────────┐  ┌──────────────────────┐
//! │ Snapshot │  │ Streaming │  │ Incremental Snapshot │   phase sources
//! └────┬─────┘  └─────┬─────┘  └──────────┬───────────┘
//!      │              │                   │
//!      ▼              ▼                   ▼
//! ┌──────────────────────────────────────────────────┐
//! │  CaptureOrchestrator ─► EventDispatcher          │   offsets advance on admission
//! └─────────────────────────┬────────────────────────┘
//!                           ▼
//! ┌──────────────────────────────────────────────────┐
//! │  EventQueue (bounded, buffers last snapshot rec) │
//! └─────────────────────────┬────────────────────────┘
//!                           ▼
//! ┌──────────────────────────────────────────────────┐
//! │  DeliveryEngine ─► TransformChain ─► Consumer    │   offsets persist on ack
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! The database itself is reached through the [`SourceConnector`] /
//! [`SourceConnection`] traits; the crate ships no wire protocol.
//! [`upstream::memory::MemoryUpstream`] is an in-process implementation
//! for tests and demos.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rivven_capture::upstream::memory::MemoryUpstream;
//! use rivven_capture::{CaptureConfig, CaptureOrchestrator, ChangeEvent, Consumer, RecordConsumer};
//! use std::sync::Arc;
//!
//! struct Print;
//!
//! #[async_trait::async_trait]
//! impl RecordConsumer for Print {
//!     async fn handle(&self, record: ChangeEvent) -> rivven_capture::Result<()> {
//!         println!("{} {} {}", record.op.as_str(), record.table, record.key);
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = CaptureConfig::new("server1", "inventory").with_tables(["inventory.orders"]);
//! let orchestrator = CaptureOrchestrator::builder(config, Arc::new(MemoryUpstream::new()))
//!     .build()
//!     .await?;
//! let engine = orchestrator.delivery_engine(Consumer::record(Print)).build()?;
//!
//! let delivery = tokio::spawn(async move { engine.run().await });
//! orchestrator.run().await?;
//! delivery.await??;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod delivery;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod incremental_snapshot;
pub mod metrics;
pub mod offset;
pub mod offset_store;
pub mod orchestrator;
pub mod queue;
pub mod signal;
pub mod snapshot;
pub mod source;
pub mod streaming;
pub mod transform;
pub mod upstream;

// Core types
pub use config::{CaptureConfig, EngineConfig, IncrementalConfig, QueueConfig};
pub use error::{CaptureError, CaptureFailure, ErrorCategory, Result};
pub use event::{ChangeEvent, EventOp, Partition, SnapshotMarker, TableId};
pub use offset::{GtidSet, LogPosition, Offset, OffsetState, PartitionState};

// Orchestration
pub use orchestrator::{CaptureHandle, CaptureOrchestrator, CaptureState, CaptureStatus};
pub use queue::EventQueue;
pub use snapshot::SnapshotMode;
pub use source::{PhaseKind, PhaseRegistry, PhaseResult, PhaseSource};

// Delivery
pub use delivery::{
    BatchConsumer, Consumer, DeliveryEngine, DeliveryErrorHandler, DeliveryReport, ErrorAction,
    ErrorPolicy, RecordCommitter, RecordConsumer,
};
pub use offset_store::{FileOffsetStore, MemoryOffsetStore, OffsetStore};
pub use transform::{MaskField, RegexRouter, TransformChain, Transformation};

// Incremental snapshots and signals
pub use incremental_snapshot::{IncrementalCursor, WatermarkStrategy};
pub use signal::{Signal, SignalAction};
pub use upstream::{SourceConnection, SourceConnector};
