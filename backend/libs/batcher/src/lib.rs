//! # Write Batcher
//!
//! Coalesces many small write requests into few large storage operations.
//!
//! Producers call [`Batcher::enqueue`], which never blocks and never fails. A single background
//! loop, spawned by [`Batcher::start`], groups queued items and hands each group to a
//! [`BatchProcessor`] in one call.
//!
//! ## Flush rules
//!
//! - A batch is flushed as soon as it holds `max_batch_size` items.
//! - Otherwise it is flushed once `flush_interval` has elapsed since its first item was enqueued,
//!   provided it holds at least `min_batch_size` items. A smaller batch keeps waiting for more.
//! - Empty batches are never produced.
//! - [`Batcher::stop`] ends the loop after the current cycle. A partially filled batch is dropped,
//!   not flushed.
//! - [`Batcher::shutdown`] ends the loop too, but first flushes the partial batch and everything
//!   still queued, in chunks of at most `max_batch_size` and regardless of `min_batch_size`.
//!
//! ## Failure handling
//!
//! When the processor returns an error the batch is logged. With `retry` enabled every item of the
//! failed batch is re-enqueued individually and replayed on a later cycle, so delivery is
//! at-least-once. Retries are unbounded and carry no backoff beyond the flush interval.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use batcher::{BatchProcessor, Batcher, BatcherConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct PrintLines;
//!
//! #[async_trait::async_trait]
//! impl BatchProcessor<String> for PrintLines {
//!     async fn process_batch(&self, batch: &[String]) -> anyhow::Result<()> {
//!         println!("{}", batch.join("\n"));
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() {
//! let batcher = Batcher::new(
//!     BatcherConfig::new("print-lines")
//!         .flush_interval(Duration::from_millis(500))
//!         .max_batch_size(1000),
//!     Arc::new(PrintLines),
//! );
//! batcher.start();
//! batcher.enqueue("hello".to_string());
//! batcher.shutdown().await;
//! # }
//! ```

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Persists one group of queued items.
#[async_trait]
pub trait BatchProcessor<T>: Send + Sync + 'static {
    async fn process_batch(&self, batch: &[T]) -> anyhow::Result<()>;
}

/// Batcher tuning.
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Label used in log lines
    pub name: String,
    pub flush_interval: Duration,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    /// Re-enqueue the items of a failed batch
    pub retry: bool,
}

impl BatcherConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flush_interval: Duration::from_secs(1),
            min_batch_size: 1,
            max_batch_size: 100,
            retry: false,
        }
    }

    pub fn flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    pub fn min_batch_size(mut self, min_batch_size: usize) -> Self {
        self.min_batch_size = min_batch_size;
        self
    }

    pub fn max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }
}

struct Job<T> {
    item: T,
    enqueued_at: Instant,
    ack: Option<oneshot::Sender<()>>,
}

struct Shared<T> {
    name: String,
    tx: mpsc::UnboundedSender<Job<T>>,
    processor: Arc<dyn BatchProcessor<T>>,
    flush_interval_us: AtomicU64,
    min_batch_size: usize,
    max_batch_size: usize,
    retry: bool,
    signal: watch::Sender<Signal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Run,
    /// Exit, dropping whatever is queued
    Stop,
    /// Flush whatever is queued, then exit
    Drain,
}

enum Cycle<T> {
    Flush(Vec<Job<T>>),
    Exit(Vec<Job<T>>),
}

/// Bounded work queue with a single background flush loop.
pub struct Batcher<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Job<T>>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn duration_to_micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

impl<T: Send + 'static> Batcher<T> {
    pub fn new(config: BatcherConfig, processor: Arc<dyn BatchProcessor<T>>) -> Self {
        let max_batch_size = config.max_batch_size.max(1);
        let min_batch_size = config.min_batch_size.clamp(1, max_batch_size);
        let (tx, rx) = mpsc::unbounded_channel();
        let (signal, _) = watch::channel(Signal::Run);

        Self {
            shared: Arc::new(Shared {
                name: config.name,
                tx,
                processor,
                flush_interval_us: AtomicU64::new(duration_to_micros(config.flush_interval)),
                min_batch_size,
                max_batch_size,
                retry: config.retry,
                signal,
            }),
            rx: Mutex::new(Some(rx)),
            handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Queue an item for the next flush. Never blocks.
    pub fn enqueue(&self, item: T) {
        self.shared.push(Job {
            item,
            enqueued_at: Instant::now(),
            ack: None,
        });
    }

    /// Queue an item and get notified once the batch holding it has been processed successfully.
    ///
    /// The receiver errors if the item is dropped (failed batch without retry, or batcher stopped).
    pub fn enqueue_with_ack(&self, item: T) -> oneshot::Receiver<()> {
        let (ack, done) = oneshot::channel();
        self.shared.push(Job {
            item,
            enqueued_at: Instant::now(),
            ack: Some(ack),
        });
        done
    }

    pub fn flush_interval(&self) -> Duration {
        self.shared.flush_interval()
    }

    /// Takes effect from the next batch onwards.
    pub fn set_flush_interval(&self, flush_interval: Duration) {
        self.shared
            .flush_interval_us
            .store(duration_to_micros(flush_interval), Ordering::Relaxed);
    }

    /// Spawn the flush loop. Calling this more than once has no effect.
    pub fn start(&self) {
        let Some(rx) = lock(&self.rx).take() else {
            warn!(batcher = %self.shared.name, "batcher already started");
            return;
        };

        let shared = self.shared.clone();
        let signal = self.shared.signal.subscribe();
        let handle = tokio::spawn(async move { shared.run(rx, signal).await });
        *lock(&self.handle) = Some(handle);
    }

    /// Signal the flush loop to exit after the current cycle. Queued items are dropped.
    pub fn stop(&self) {
        self.shared.signal.send_replace(Signal::Stop);
    }

    /// Flush everything queued so far, then wait for the flush loop to exit.
    pub async fn shutdown(&self) {
        self.shared.signal.send_replace(Signal::Drain);
        let handle = lock(&self.handle).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(batcher = %self.shared.name, error = %e, "batcher task ended abnormally");
            }
        }
    }
}

impl<T: Send + 'static> Drop for Batcher<T> {
    fn drop(&mut self) {
        self.shared.signal.send_replace(Signal::Stop);
    }
}

impl<T: Send + 'static> Shared<T> {
    fn flush_interval(&self) -> Duration {
        Duration::from_micros(self.flush_interval_us.load(Ordering::Relaxed))
    }

    fn push(&self, job: Job<T>) {
        if self.tx.send(job).is_err() {
            warn!(batcher = %self.name, "batcher loop has exited, dropping item");
        }
    }

    async fn run(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<Job<T>>,
        mut signal: watch::Receiver<Signal>,
    ) {
        info!(
            batcher = %self.name,
            min_batch_size = self.min_batch_size,
            max_batch_size = self.max_batch_size,
            retry = self.retry,
            "batcher started"
        );

        loop {
            let cycle = if *signal.borrow() == Signal::Run {
                self.next_batch(&mut rx, &mut signal).await
            } else {
                Cycle::Exit(Vec::new())
            };
            match cycle {
                Cycle::Flush(batch) => self.flush(batch).await,
                Cycle::Exit(pending) => {
                    if *signal.borrow() == Signal::Drain {
                        self.drain(pending, &mut rx).await;
                    }
                    break;
                }
            }
        }

        info!(batcher = %self.name, "batcher stopped");
    }

    /// Collect the next batch. On exit the items collected so far are handed back.
    async fn next_batch(
        &self,
        rx: &mut mpsc::UnboundedReceiver<Job<T>>,
        signal: &mut watch::Receiver<Signal>,
    ) -> Cycle<T> {
        let mut batch: Vec<Job<T>> = Vec::new();
        let mut deadline: Option<Instant> = None;

        while batch.len() < self.max_batch_size {
            let received = match deadline {
                Some(deadline) if Instant::now() < deadline => {
                    tokio::select! {
                        _ = signal.changed() => return Cycle::Exit(batch),
                        res = tokio::time::timeout_at(deadline, rx.recv()) => match res {
                            Ok(job) => job,
                            Err(_) => continue,
                        },
                    }
                }
                Some(_) if batch.len() >= self.min_batch_size => break,
                _ => {
                    tokio::select! {
                        _ = signal.changed() => return Cycle::Exit(batch),
                        job = rx.recv() => job,
                    }
                }
            };

            let Some(job) = received else {
                return Cycle::Exit(batch);
            };
            if deadline.is_none() {
                deadline = Some(job.enqueued_at + self.flush_interval());
            }
            batch.push(job);
        }

        Cycle::Flush(batch)
    }

    /// Flush `pending` plus everything left in the queue. Items a failed flush re-enqueues are
    /// not replayed.
    async fn drain(&self, mut pending: Vec<Job<T>>, rx: &mut mpsc::UnboundedReceiver<Job<T>>) {
        while let Ok(job) = rx.try_recv() {
            pending.push(job);
        }
        if pending.is_empty() {
            return;
        }

        info!(batcher = %self.name, size = pending.len(), "flushing queued items before exit");
        while !pending.is_empty() {
            let rest = pending.split_off(pending.len().min(self.max_batch_size));
            self.flush(pending).await;
            pending = rest;
        }
    }

    async fn flush(&self, batch: Vec<Job<T>>) {
        let size = batch.len();
        let oldest_ms = batch
            .iter()
            .map(|job| job.enqueued_at.elapsed())
            .max()
            .unwrap_or_default()
            .as_millis() as u64;

        let (items, acks): (Vec<T>, Vec<Option<oneshot::Sender<()>>>) =
            batch.into_iter().map(|job| (job.item, job.ack)).unzip();

        debug!(batcher = %self.name, size, oldest_ms, "flushing batch");

        match self.processor.process_batch(&items).await {
            Ok(()) => {
                for ack in acks.into_iter().flatten() {
                    let _ = ack.send(());
                }
            }
            Err(e) => {
                error!(
                    batcher = %self.name,
                    size,
                    retry = self.retry,
                    error = ?e,
                    "batch processing failed"
                );

                if self.retry {
                    for (item, ack) in items.into_iter().zip(acks) {
                        self.push(Job {
                            item,
                            enqueued_at: Instant::now(),
                            ack,
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::timeout;

    struct Recorder {
        attempts: mpsc::UnboundedSender<Vec<u32>>,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl BatchProcessor<u32> for Recorder {
        async fn process_batch(&self, batch: &[u32]) -> anyhow::Result<()> {
            let _ = self.attempts.send(batch.to_vec());
            let should_fail = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if should_fail {
                anyhow::bail!("injected failure");
            }
            Ok(())
        }
    }

    fn recorder(failures: usize) -> (Arc<Recorder>, mpsc::UnboundedReceiver<Vec<u32>>) {
        let (attempts, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Recorder {
                attempts,
                failures_left: AtomicUsize::new(failures),
            }),
            rx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_flushes_before_interval() {
        let (processor, mut attempts) = recorder(0);
        let batcher = Batcher::new(
            BatcherConfig::new("full-batch")
                .flush_interval(Duration::from_secs(60))
                .max_batch_size(3),
            processor,
        );
        batcher.start();

        batcher.enqueue(1);
        batcher.enqueue(2);
        batcher.enqueue(3);

        let batch = timeout(Duration::from_secs(1), attempts.recv())
            .await
            .expect("full batch should flush immediately")
            .unwrap();
        assert_eq!(batch, vec![1, 2, 3]);

        assert!(timeout(Duration::from_secs(1), attempts.recv())
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_never_exceed_max_size() {
        let (processor, mut attempts) = recorder(0);
        let batcher = Batcher::new(
            BatcherConfig::new("max-size")
                .flush_interval(Duration::from_millis(10))
                .max_batch_size(3),
            processor,
        );

        for i in 0..10 {
            batcher.enqueue(i);
        }
        batcher.start();

        let mut seen = Vec::new();
        while seen.len() < 10 {
            let batch = attempts.recv().await.unwrap();
            assert!(!batch.is_empty());
            assert!(batch.len() <= 3, "batch too large: {:?}", batch);
            seen.extend(batch);
        }
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_does_not_flush_below_min_size() {
        let (processor, mut attempts) = recorder(0);
        let batcher = Batcher::new(
            BatcherConfig::new("min-size")
                .flush_interval(Duration::from_millis(50))
                .min_batch_size(2)
                .max_batch_size(10),
            processor,
        );
        batcher.start();

        batcher.enqueue(1);
        assert!(timeout(Duration::from_millis(500), attempts.recv())
            .await
            .is_err());

        batcher.enqueue(2);
        let batch = timeout(Duration::from_secs(1), attempts.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_redelivers_failed_batch() {
        let (processor, mut attempts) = recorder(1);
        let batcher = Batcher::new(
            BatcherConfig::new("retry")
                .flush_interval(Duration::from_millis(10))
                .max_batch_size(10)
                .retry(true),
            processor,
        );

        batcher.enqueue(1);
        batcher.enqueue(2);
        let done = batcher.enqueue_with_ack(3);
        batcher.start();

        let failed = attempts.recv().await.unwrap();
        assert_eq!(failed, vec![1, 2, 3]);

        let replayed = attempts.recv().await.unwrap();
        assert_eq!(replayed, vec![1, 2, 3]);

        assert!(done.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_dropped_without_retry() {
        let (processor, mut attempts) = recorder(1);
        let batcher = Batcher::new(
            BatcherConfig::new("no-retry").flush_interval(Duration::from_millis(10)),
            processor,
        );
        batcher.start();

        let dropped = batcher.enqueue_with_ack(1);
        assert_eq!(attempts.recv().await.unwrap(), vec![1]);
        assert!(dropped.await.is_err());

        batcher.enqueue(2);
        assert_eq!(attempts.recv().await.unwrap(), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_flush_interval_applies_without_restart() {
        let (processor, mut attempts) = recorder(0);
        let batcher = Batcher::new(
            BatcherConfig::new("interval")
                .flush_interval(Duration::from_secs(60))
                .max_batch_size(10),
            processor,
        );
        batcher.start();

        batcher.set_flush_interval(Duration::from_millis(10));
        assert_eq!(batcher.flush_interval(), Duration::from_millis(10));

        batcher.enqueue(7);
        batcher.enqueue(8);
        let batch = timeout(Duration::from_secs(1), attempts.recv())
            .await
            .expect("shortened interval should flush within a second")
            .unwrap();
        assert_eq!(batch, vec![7, 8]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_loop_without_flushing() {
        let (processor, mut attempts) = recorder(0);
        let batcher = Batcher::new(
            BatcherConfig::new("stop").flush_interval(Duration::from_millis(10)),
            processor,
        );
        batcher.start();
        batcher.shutdown().await;

        batcher.enqueue(1);
        assert!(timeout(Duration::from_secs(1), attempts.recv())
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_drops_partial_batch() {
        let (processor, mut attempts) = recorder(0);
        let batcher = Batcher::new(
            BatcherConfig::new("stop-partial")
                .flush_interval(Duration::from_secs(60))
                .min_batch_size(5)
                .max_batch_size(10),
            processor,
        );
        batcher.start();
        batcher.enqueue(1);
        tokio::task::yield_now().await;

        batcher.stop();
        assert!(timeout(Duration::from_secs(120), attempts.recv())
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_queued_items() {
        let (processor, mut attempts) = recorder(0);
        let batcher = Batcher::new(
            BatcherConfig::new("drain")
                .flush_interval(Duration::from_secs(60))
                .min_batch_size(3)
                .max_batch_size(3),
            processor,
        );
        batcher.start();

        batcher.enqueue(1);
        tokio::task::yield_now().await;
        batcher.enqueue(2);
        let done = batcher.enqueue_with_ack(3);
        batcher.enqueue(4);
        batcher.enqueue(5);
        batcher.shutdown().await;

        let mut seen = Vec::new();
        while let Ok(batch) = attempts.try_recv() {
            assert!(batch.len() <= 3, "batch too large: {:?}", batch);
            seen.extend(batch);
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        assert!(done.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_is_ignored() {
        let (processor, mut attempts) = recorder(0);
        let batcher = Batcher::new(
            BatcherConfig::new("double-start")
                .flush_interval(Duration::from_millis(10))
                .max_batch_size(2),
            processor,
        );
        batcher.start();
        batcher.start();

        batcher.enqueue(1);
        batcher.enqueue(2);
        assert_eq!(attempts.recv().await.unwrap(), vec![1, 2]);
        assert!(timeout(Duration::from_millis(100), attempts.recv())
            .await
            .is_err());
    }
}
