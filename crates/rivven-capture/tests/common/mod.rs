//! Shared helpers for capture integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rivven_capture::upstream::memory::MemoryUpstream;
use rivven_capture::upstream::Row;
use rivven_capture::{
    CaptureConfig, CaptureHandle, CaptureOrchestrator, CaptureState, ChangeEvent, Consumer,
    DeliveryEngine, DeliveryReport, RecordConsumer, TableId,
};
use serde_json::json;
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::task::JoinHandle;

static INIT: Once = Once::new();

/// Install a test subscriber once per test binary (`RUST_LOG` overrides).
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("rivven_capture=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub const SERVER: &str = "server1";
pub const DATABASE: &str = "inventory";

pub fn table(name: &str) -> TableId {
    TableId::new(DATABASE, name)
}

/// Rows `1..=n` keyed by `id`.
pub fn rows(n: u64) -> Vec<Row> {
    (1..=n)
        .map(|id| Row::new(json!(id), json!({"id": id, "name": format!("row-{}", id)})))
        .collect()
}

pub fn config(tables: &[&str]) -> CaptureConfig {
    CaptureConfig::new(SERVER, DATABASE)
        .with_tables(tables.iter().map(|t| format!("{}.{}", DATABASE, t)))
}

/// Consumer recording every delivered record.
#[derive(Default)]
pub struct Collector {
    records: Mutex<Vec<ChangeEvent>>,
    delay: Option<Duration>,
}

impl Collector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(Vec::new()),
            delay: Some(delay),
        })
    }

    pub fn records(&self) -> Vec<ChangeEvent> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Poll until at least `n` records were delivered.
    pub async fn wait_for(&self, n: usize) -> Vec<ChangeEvent> {
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.len() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("expected {} records, got {}", n, self.len()));
        self.records()
    }
}

/// Lets tests keep an `Arc<Collector>` while the engine owns a consumer.
pub struct Shared(pub Arc<Collector>);

#[async_trait]
impl RecordConsumer for Shared {
    async fn handle(&self, record: ChangeEvent) -> rivven_capture::Result<()> {
        if let Some(delay) = self.0.delay {
            tokio::time::sleep(delay).await;
        }
        self.0.records.lock().push(record);
        Ok(())
    }
}

/// A running capture and delivery pipeline.
pub struct Pipeline {
    pub handle: CaptureHandle,
    pub capture: JoinHandle<Result<Option<rivven_capture::Offset>, rivven_capture::CaptureFailure>>,
    pub delivery: JoinHandle<rivven_capture::Result<DeliveryReport>>,
}

impl Pipeline {
    /// Spawn the orchestrator and a delivery engine feeding `collector`.
    pub fn spawn(orchestrator: CaptureOrchestrator, collector: &Arc<Collector>) -> Self {
        let engine: DeliveryEngine = orchestrator
            .delivery_engine(Consumer::record(Shared(collector.clone())))
            .build()
            .unwrap();
        let handle = orchestrator.handle();
        let capture = tokio::spawn(orchestrator.run());
        let delivery = tokio::spawn(async move { engine.run().await });
        Self {
            handle,
            capture,
            delivery,
        }
    }

    pub async fn wait_streaming(&self) {
        let status = tokio::time::timeout(
            Duration::from_secs(10),
            self.handle.wait_until(|s| s.state == CaptureState::Streaming),
        )
        .await
        .expect("capture never reached streaming");
        assert_eq!(status.state, CaptureState::Streaming);
    }

    /// Stop capture and wait for delivery to drain.
    pub async fn stop(self) -> DeliveryReport {
        self.handle.stop().await.unwrap();
        self.capture.await.unwrap().unwrap();
        self.delivery.await.unwrap().unwrap()
    }
}

pub fn upstream_with(tables: &[(&str, u64)]) -> MemoryUpstream {
    tables
        .iter()
        .fold(MemoryUpstream::new(), |upstream, (name, n)| {
            upstream.with_table(table(name), rows(*n))
        })
}
