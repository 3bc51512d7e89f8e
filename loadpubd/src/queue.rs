//! Inbound queue between connection readers and the dispatcher.
//!
//! Producers never block. A single consumer task receives events in arrival
//! order, in batches of at most `max_batch`, and also gets a periodic tick so
//! it can do housekeeping while no traffic arrives.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use loadpub_common::protocol::Event;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue already has a consumer")]
    ConsumerTaken,
}

/// Receiver side of the queue.
pub trait BatchConsumer: Send + 'static {
    /// Events in arrival order; never empty.
    fn on_batch(&mut self, batch: Vec<Event>);

    /// Periodic tick, fired even while the queue is quiet.
    fn on_tick(&mut self) {}

    /// The queue is closed and fully drained. Runs on the blocking pool, so
    /// it may wait for threads or I/O.
    fn on_close(&mut self) {}
}

impl<F> BatchConsumer for F
where
    F: FnMut(Vec<Event>) + Send + 'static,
{
    fn on_batch(&mut self, batch: Vec<Event>) {
        self(batch)
    }
}

struct Inner {
    tx: mpsc::UnboundedSender<Event>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    close_tx: watch::Sender<bool>,
    enqueued: AtomicU64,
    rejected: AtomicU64,
}

/// Cloneable handle to the inbound queue.
#[derive(Clone)]
pub struct InboundQueue {
    inner: Arc<Inner>,
}

impl Default for InboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InboundQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (close_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                tx,
                rx: Mutex::new(Some(rx)),
                close_tx,
                enqueued: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
            }),
        }
    }

    /// Append an event. Never blocks; after the consumer stopped it is a
    /// logged no-op.
    pub fn enqueue(&self, event: Event) {
        match self.inner.tx.send(event) {
            Ok(()) => {
                self.inner.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::SendError(event)) => {
                self.inner.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(kind = event.type_name(), "Queue closed, event discarded");
            }
        }
    }

    /// Total events accepted so far.
    pub fn enqueued(&self) -> u64 {
        self.inner.enqueued.load(Ordering::Relaxed)
    }

    /// Events discarded because the queue was closed.
    pub fn rejected(&self) -> u64 {
        self.inner.rejected.load(Ordering::Relaxed)
    }

    /// Stop accepting events. The consumer drains what is buffered, calls
    /// [`BatchConsumer::on_close`] and exits.
    pub fn close(&self) {
        self.inner.close_tx.send_replace(true);
    }

    /// Start the single consumer task.
    pub fn spawn_consumer<C>(
        &self,
        max_batch: usize,
        tick_every: Duration,
        mut consumer: C,
    ) -> Result<JoinHandle<()>, QueueError>
    where
        C: BatchConsumer,
    {
        let mut rx = self
            .inner
            .rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
            .ok_or(QueueError::ConsumerTaken)?;
        let mut closed = self.inner.close_tx.subscribe();
        let max_batch = max_batch.max(1);

        Ok(tokio::spawn(async move {
            let mut ticker = interval(tick_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            let mut closing = *closed.borrow();
            if closing {
                rx.close();
            }
            let mut buffer = Vec::with_capacity(max_batch);

            info!(max_batch, "Dispatcher started");
            loop {
                tokio::select! {
                    biased;
                    received = rx.recv_many(&mut buffer, max_batch) => {
                        if received == 0 {
                            break;
                        }
                        consumer.on_batch(std::mem::take(&mut buffer));
                    }
                    changed = closed.changed(), if !closing => {
                        closing = true;
                        if changed.is_ok() {
                            debug!("Queue closing, draining buffered events");
                        }
                        rx.close();
                    }
                    _ = ticker.tick() => consumer.on_tick(),
                }
            }

            let closed = tokio::task::spawn_blocking(move || consumer.on_close()).await;
            if let Err(e) = closed {
                error!(error = %e, "Consumer failed to close");
            }
            info!("Dispatcher stopped");
        }))
    }
}
