//! Background drain from [`CredentialBuffer`] into a [`CredentialSink`].
//!
//! One task owns the sink. Each cycle swaps the buffer out and writes the
//! batch on the blocking pool, waiting for it before the next cycle so
//! batches reach the store in the order they were taken. Records of a batch
//! the sink did not accept go back to the front of the buffer and are
//! retried; the ones it did accept are never written twice.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::capture::CredentialBuffer;
use crate::constants::DRAIN_INTERVAL;
use crate::sink::CredentialSink;

pub struct DrainLoop<S> {
    buffer: CredentialBuffer,
    sink: Arc<Mutex<S>>,
    interval: Duration,
}

impl<S: CredentialSink> DrainLoop<S> {
    pub fn new(buffer: CredentialBuffer, sink: S) -> Self {
        Self {
            buffer,
            sink: Arc::new(Mutex::new(sink)),
            interval: DRAIN_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Shared handle to the sink, mostly for inspection.
    pub fn sink(&self) -> Arc<Mutex<S>> {
        Arc::clone(&self.sink)
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Drain on every tick (or early when the buffer fills) until `shutdown`
    /// fires, then drain once more and flush the sink.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.buffer.filled() => {
                    tracing::debug!("CSV writer buffer above limit, draining early");
                }
            }
            self.drain_once().await;
        }

        self.drain_once().await;
        let stranded = self.buffer.len();
        if stranded > 0 {
            tracing::error!("CSV writer: {} records could not be persisted before shutdown", stranded);
        }
        self.flush().await;
        tracing::debug!("CSV writer stopped");
    }

    /// Run a single cycle. Returns the number of records persisted.
    pub async fn drain_once(&self) -> usize {
        let batch = self.buffer.take();
        if batch.is_empty() {
            return 0;
        }

        let taken = batch.len();
        let sink = Arc::clone(&self.sink);
        let written = tokio::task::spawn_blocking(move || {
            let result = sink.lock().write_batch(&batch);
            (batch, result)
        })
        .await;

        match written {
            Ok((_, Ok(count))) => {
                tracing::info!("CSV writer: written {}", count);
                count
            }
            Ok((mut batch, Err(e))) => {
                let stored = e.written.min(batch.len());
                batch.drain(..stored);
                tracing::warn!(
                    "CSV writer: {} of {} records not persisted, retrying next cycle: {}",
                    batch.len(),
                    taken,
                    e
                );
                self.buffer.restore(batch);
                stored
            }
            Err(e) => {
                tracing::error!("CSV writer task failed, {} records lost: {}", taken, e);
                0
            }
        }
    }

    async fn flush(&self) {
        let sink = Arc::clone(&self.sink);
        match tokio::task::spawn_blocking(move || sink.lock().flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("CSV writer: flush failed: {}", e),
            Err(e) => tracing::error!("CSV writer flush task failed: {}", e),
        }
    }
}
