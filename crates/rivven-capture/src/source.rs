//! Phase sources and their registry
//!
//! A phase source produces the events of one capture phase. Three variants
//! exist ([`PhaseKind`]); the orchestrator resolves one instance of each
//! through a [`PhaseRegistry`] once at startup and never looks them up again.
//!
//! ```rust,ignore
//! let mut registry = PhaseRegistry::with_defaults();
//! registry.register(PhaseKind::Snapshot, Arc::new(|setup: &PhaseSetup| {
//!     Ok(Arc::new(MySnapshot::new(setup.connection.clone())) as Arc<dyn PhaseSource>)
//! }));
//! ```

use crate::config::CaptureConfig;
use crate::dispatcher::EventDispatcher;
use crate::error::{CaptureError, Result};
use crate::event::Partition;
use crate::incremental_snapshot::{IncrementalSnapshotFactory, WatermarkStrategy};
use crate::metrics::CaptureMetrics;
use crate::offset::Offset;
use crate::snapshot::SnapshotFactory;
use crate::streaming::StreamingFactory;
use crate::upstream::SourceConnection;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Phase variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseKind {
    Snapshot,
    Streaming,
    IncrementalSnapshot,
}

impl PhaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseKind::Snapshot => "snapshot",
            PhaseKind::Streaming => "streaming",
            PhaseKind::IncrementalSnapshot => "incremental_snapshot",
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a phase source runs against.
#[derive(Debug, Clone)]
pub struct PhaseContext {
    pub partition: Partition,
    /// Offset to resume from, if any
    pub offset: Option<Offset>,
    /// Checked between units of work (row, log entry, chunk)
    pub cancel: CancellationToken,
}

impl PhaseContext {
    pub fn new(partition: Partition, offset: Option<Offset>, cancel: CancellationToken) -> Self {
        Self {
            partition,
            offset,
            cancel,
        }
    }
}

/// Outcome of running a phase.
#[derive(Debug)]
pub enum PhaseResult {
    /// Phase finished; the next phase resumes at this offset
    Completed(Offset),
    /// Cancellation observed; restartable from the persisted offset
    Interrupted(Option<Offset>),
    /// Unrecoverable error
    Failed(CaptureError),
}

impl PhaseResult {
    /// Map a dispatch error: a closed queue means the run is stopping.
    pub(crate) fn from_dispatch_error(error: CaptureError, offset: Option<Offset>) -> Self {
        if error.is_shutdown() {
            PhaseResult::Interrupted(offset)
        } else {
            PhaseResult::Failed(error)
        }
    }
}

/// One capture phase.
#[async_trait]
pub trait PhaseSource: Send + Sync {
    fn kind(&self) -> PhaseKind;

    /// Run the phase, handing every produced event to `dispatcher`.
    async fn execute(&self, ctx: PhaseContext, dispatcher: Arc<EventDispatcher>) -> PhaseResult;
}

/// Everything a factory may need to build a phase source.
#[derive(Clone)]
pub struct PhaseSetup {
    pub config: Arc<CaptureConfig>,
    pub connection: Arc<dyn SourceConnection>,
    /// Watermark strategy for incremental snapshots; `None` disables them
    pub watermark: Option<WatermarkStrategy>,
    pub metrics: Arc<CaptureMetrics>,
}

/// Factory for phase sources.
pub trait PhaseFactory: Send + Sync {
    fn create(&self, setup: &PhaseSetup) -> Result<Arc<dyn PhaseSource>>;
}

impl<F> PhaseFactory for F
where
    F: Fn(&PhaseSetup) -> Result<Arc<dyn PhaseSource>> + Send + Sync,
{
    fn create(&self, setup: &PhaseSetup) -> Result<Arc<dyn PhaseSource>> {
        self(setup)
    }
}

/// Maps each phase variant to its constructor.
pub struct PhaseRegistry {
    factories: HashMap<PhaseKind, Arc<dyn PhaseFactory>>,
}

impl PhaseRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in snapshot, streaming and incremental sources.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(PhaseKind::Snapshot, Arc::new(SnapshotFactory));
        registry.register(PhaseKind::Streaming, Arc::new(StreamingFactory));
        registry.register(
            PhaseKind::IncrementalSnapshot,
            Arc::new(IncrementalSnapshotFactory),
        );
        registry
    }

    /// Register (or replace) the factory for a phase variant
    pub fn register(&mut self, kind: PhaseKind, factory: Arc<dyn PhaseFactory>) {
        self.factories.insert(kind, factory);
    }

    pub fn contains(&self, kind: PhaseKind) -> bool {
        self.factories.contains_key(&kind)
    }

    /// Build the phase source for `kind`.
    pub fn resolve(&self, kind: PhaseKind, setup: &PhaseSetup) -> Result<Arc<dyn PhaseSource>> {
        let factory = self.factories.get(&kind).ok_or_else(|| {
            CaptureError::config(format!("no phase source registered for {}", kind))
        })?;
        factory.create(setup)
    }
}

impl Default for PhaseRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Phase sources resolved at startup.
#[derive(Clone)]
pub struct ResolvedPhases {
    pub snapshot: Arc<dyn PhaseSource>,
    pub streaming: Arc<dyn PhaseSource>,
    /// Absent when incremental snapshots are disabled
    pub incremental: Option<Arc<dyn PhaseSource>>,
}

impl ResolvedPhases {
    pub fn resolve(registry: &PhaseRegistry, setup: &PhaseSetup) -> Result<Self> {
        let incremental = match setup.watermark {
            Some(_) => Some(registry.resolve(PhaseKind::IncrementalSnapshot, setup)?),
            None => None,
        };
        Ok(Self {
            snapshot: registry.resolve(PhaseKind::Snapshot, setup)?,
            streaming: registry.resolve(PhaseKind::Streaming, setup)?,
            incremental,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::memory::MemoryUpstream;

    struct Noop(PhaseKind);

    #[async_trait]
    impl PhaseSource for Noop {
        fn kind(&self) -> PhaseKind {
            self.0
        }

        async fn execute(&self, ctx: PhaseContext, _: Arc<EventDispatcher>) -> PhaseResult {
            PhaseResult::Interrupted(ctx.offset)
        }
    }

    fn setup(watermark: Option<WatermarkStrategy>) -> PhaseSetup {
        PhaseSetup {
            config: Arc::new(CaptureConfig::new("s1", "db")),
            connection: Arc::new(MemoryUpstream::new()),
            watermark,
            metrics: Arc::new(CaptureMetrics::new("s1")),
        }
    }

    #[test]
    fn test_defaults_resolve_all_variants() {
        let registry = PhaseRegistry::with_defaults();
        let phases = ResolvedPhases::resolve(&registry, &setup(Some(WatermarkStrategy::ReadOnlyGtid)))
            .unwrap();
        assert_eq!(phases.snapshot.kind(), PhaseKind::Snapshot);
        assert_eq!(phases.streaming.kind(), PhaseKind::Streaming);
        assert_eq!(
            phases.incremental.map(|p| p.kind()),
            Some(PhaseKind::IncrementalSnapshot)
        );
    }

    #[test]
    fn test_incremental_absent_without_watermark() {
        let phases = ResolvedPhases::resolve(&PhaseRegistry::with_defaults(), &setup(None)).unwrap();
        assert!(phases.incremental.is_none());
    }

    #[test]
    fn test_missing_factory_is_configuration_error() {
        let mut registry = PhaseRegistry::new();
        registry.register(
            PhaseKind::Snapshot,
            Arc::new(|_: &PhaseSetup| Ok(Arc::new(Noop(PhaseKind::Snapshot)) as Arc<dyn PhaseSource>)),
        );
        assert!(registry.contains(PhaseKind::Snapshot));
        let err = ResolvedPhases::resolve(&registry, &setup(None)).err().unwrap();
        assert!(matches!(err, CaptureError::Config(_)));
        assert!(err.to_string().contains("streaming"));
    }
}
