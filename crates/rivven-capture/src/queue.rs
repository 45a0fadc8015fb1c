//! # Event Queue
//!
//! Bounded, blocking mediator between the capture side (phase sources via the
//! dispatcher) and the delivery engine.
//!
//! ## Buffering
//!
//! A phase source cannot always tell that a record is the last one of its
//! phase until the phase ends (the final snapshot table may be empty). While
//! buffering is armed the most recently enqueued event is held back in a
//! single slot, so it can be rewritten once the end is known:
//!
//! ```text
//!          enable_buffering            enqueue(e)
//!   Off ───────────────────▶ Armed ─────────────────▶ Holding(e)
//!                              ▲  ◀── flush_buffer ──┘   │ enqueue(e2):
//!                              │                          │ release e, hold e2
//!   disable_buffering / close  ▼                          ▼
//!   ────────────────────────▶ Retired (held event released unchanged)
//! ```
//!
//! All state lives behind one mutex, so buffering operations are linearizable
//! with concurrent `enqueue`/`poll`: a poll never observes the held event, and
//! a flush never races with a second event being held.
//!
//! ## Accounting
//!
//! At every quiescent point `polled + buffered + queued == enqueued`
//! (see [`QueueStats`]).

use crate::config::QueueConfig;
use crate::error::{CaptureError, Result};
use crate::event::ChangeEvent;
use crate::metrics::CaptureMetrics;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Buffering state machine.
#[derive(Debug)]
enum BufferState {
    /// Buffering never enabled
    Off,
    /// Buffering enabled, nothing held
    Armed,
    /// Most recent event held back
    Holding(Box<ChangeEvent>),
    /// Buffering disabled for the rest of the run
    Retired,
}

#[derive(Debug)]
struct Inner {
    items: VecDeque<ChangeEvent>,
    buffer: BufferState,
    closed: bool,
    enqueued: u64,
    polled: u64,
}

impl Inner {
    fn buffered(&self) -> u64 {
        matches!(self.buffer, BufferState::Holding(_)) as u64
    }

    fn release_held(&mut self, next: BufferState) -> bool {
        match std::mem::replace(&mut self.buffer, next) {
            BufferState::Holding(held) => {
                self.items.push_back(*held);
                true
            }
            _ => false,
        }
    }
}

/// Quiescent-point accounting of the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Events accepted by `enqueue`
    pub enqueued: u64,
    /// Events returned by `poll`
    pub polled: u64,
    /// Events waiting to be polled
    pub queued: u64,
    /// Events held in the buffer slot (0 or 1)
    pub buffered: u64,
}

/// Bounded event queue with a single-slot rewrite buffer.
pub struct EventQueue {
    config: QueueConfig,
    inner: Mutex<Inner>,
    not_empty: Notify,
    not_full: Notify,
    metrics: Option<Arc<CaptureMetrics>>,
}

impl EventQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(config.max_queue_size.min(16 * 1024)),
                buffer: BufferState::Off,
                closed: false,
                enqueued: 0,
                polled: 0,
            }),
            config,
            not_empty: Notify::new(),
            not_full: Notify::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<CaptureMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Add an event, waiting while the queue is full.
    ///
    /// Fails with [`CaptureError::Shutdown`] once the queue is closed, and with
    /// [`CaptureError::Timeout`] if the configured enqueue timeout elapses
    /// while waiting for space. Never drops the event silently.
    pub async fn enqueue(&self, event: ChangeEvent) -> Result<()> {
        let deadline = self.config.enqueue_timeout().map(|t| Instant::now() + t);

        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut guard = self.inner.lock();
                let inner = &mut *guard;
                if inner.closed {
                    return Err(CaptureError::Shutdown);
                }

                // Holding the first event while armed does not add to the visible items.
                let adds_item = !matches!(inner.buffer, BufferState::Armed);
                if !adds_item || inner.items.len() < self.config.max_queue_size {
                    let released = match inner.buffer {
                        BufferState::Armed | BufferState::Holding(_) => {
                            inner.release_held(BufferState::Holding(Box::new(event)))
                        }
                        BufferState::Off | BufferState::Retired => {
                            inner.items.push_back(event);
                            true
                        }
                    };
                    inner.enqueued += 1;
                    let depth = inner.items.len();
                    drop(guard);

                    if let Some(metrics) = &self.metrics {
                        metrics.record_enqueued(1);
                        metrics.set_queue_depth(depth);
                    }
                    if released {
                        self.not_empty.notify_waiters();
                    }
                    return Ok(());
                }
            }

            trace!("Event queue full, producer waiting");
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(CaptureError::timeout(format!(
                            "event queue full for {:?}",
                            self.config.enqueue_timeout().unwrap_or_default()
                        )));
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Poll a batch, waiting up to the configured poll interval.
    pub async fn poll(&self) -> Result<Vec<ChangeEvent>> {
        self.poll_timeout(self.config.poll_interval()).await
    }

    /// Poll up to `max_batch_size` events in enqueue order.
    ///
    /// Returns an empty batch if nothing became available within `wait`, and
    /// [`CaptureError::Shutdown`] once the queue is closed and fully drained.
    pub async fn poll_timeout(&self, wait: Duration) -> Result<Vec<ChangeEvent>> {
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if !inner.items.is_empty() {
                    let n = inner.items.len().min(self.config.max_batch_size);
                    let batch: Vec<ChangeEvent> = inner.items.drain(..n).collect();
                    inner.polled += batch.len() as u64;
                    let depth = inner.items.len();
                    drop(inner);

                    if let Some(metrics) = &self.metrics {
                        metrics.record_polled(batch.len() as u64);
                        metrics.set_queue_depth(depth);
                    }
                    self.not_full.notify_waiters();
                    return Ok(batch);
                }
                if inner.closed {
                    return Err(CaptureError::Shutdown);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    /// Arm buffering mode.
    ///
    /// Idempotent while nothing is held. Arming while an event is held, or
    /// after buffering has been disabled, is an ordering violation.
    pub fn enable_buffering(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(CaptureError::Shutdown);
        }
        match inner.buffer {
            BufferState::Off => {
                inner.buffer = BufferState::Armed;
                debug!("Event queue buffering enabled");
                Ok(())
            }
            BufferState::Armed => Ok(()),
            BufferState::Holding(_) => Err(CaptureError::ordering_violation(
                "buffering enabled while an event is already buffered",
            )),
            BufferState::Retired => Err(CaptureError::ordering_violation(
                "buffering enabled after it was disabled",
            )),
        }
    }

    /// Apply `rewrite` to the held event (if any) and release it.
    ///
    /// The released event may take the queue one over its capacity; it
    /// already counted as enqueued when it was held.
    pub fn flush_buffer<F>(&self, rewrite: F)
    where
        F: FnOnce(ChangeEvent) -> ChangeEvent,
    {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let BufferState::Holding(_) = inner.buffer {
            if let BufferState::Holding(held) =
                std::mem::replace(&mut inner.buffer, BufferState::Armed)
            {
                inner.items.push_back(rewrite(*held));
            }
            drop(guard);
            debug!("Flushed buffered event");
            self.not_empty.notify_waiters();
        }
    }

    /// Release any held event unchanged and disable buffering for the rest
    /// of the run. Idempotent.
    pub fn disable_buffering(&self) {
        let mut inner = self.inner.lock();
        let was_buffering = !matches!(inner.buffer, BufferState::Off | BufferState::Retired);
        let released = inner.release_held(BufferState::Retired);
        drop(inner);

        if was_buffering {
            debug!(released, "Event queue buffering disabled");
        }
        if released {
            self.not_empty.notify_waiters();
        }
    }

    /// Close the queue.
    ///
    /// Any held event is released so it still drains; subsequent enqueues fail
    /// with [`CaptureError::Shutdown`] and pollers see it once drained.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.release_held(BufferState::Retired);
        let remaining = inner.items.len();
        drop(inner);

        debug!(remaining, "Event queue closed");
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of pollable events.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_buffering(&self) -> bool {
        matches!(
            self.inner.lock().buffer,
            BufferState::Armed | BufferState::Holding(_)
        )
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        QueueStats {
            enqueued: inner.enqueued,
            polled: inner.polled,
            queued: inner.items.len() as u64,
            buffered: inner.buffered(),
        }
    }
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}
