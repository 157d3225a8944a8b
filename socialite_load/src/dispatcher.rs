//! Admission-controlled dispatch of work items.
//!
//! The [`Dispatcher`] owns a fixed pool of worker tasks fed by a bounded
//! queue. Producers call [`Dispatcher::submit`] (or [`Submitter::submit`] on a
//! cloned handle); when the queue is at capacity the producer is suspended
//! until a worker frees a slot. The queue never grows past its capacity, no
//! matter how far ahead of the workers the producers are.
//!
//! Every item is run to completion by exactly one worker. An item that returns
//! an error, or panics, is logged and counted as failed. Its siblings, the
//! workers and the queue carry on unaffected.
//!
//! [`Dispatcher::shutdown_and_drain`] stops admission, lets queued and
//! in-flight items finish and returns a [`Report`] only once every accepted
//! item has completed.
//!
//! ## Metrics
//!
//! `work_items_submitted`: Items accepted into the queue
//! `work_items_rejected`: Submissions refused because of shutdown
//! `work_items_succeeded`: Items that completed without error
//! `work_items_failed`: Items that returned an error or panicked
//!
//! Completion metrics are labeled with the item `kind` reported by the
//! [`Handler`].
//!

use std::{
    any::Any,
    fmt,
    num::NonZeroUsize,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use futures::FutureExt;
use metrics::counter;
use tokio::{
    sync::{Mutex, Notify, mpsc},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Errors produced by [`Dispatcher`] and [`Submitter`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The dispatcher is shutting down and no longer admits work.
    #[error("submission rejected, dispatcher is shutting down")]
    RejectedSubmission,
}

/// Executes the items submitted to a [`Dispatcher`].
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// The unit of work
    type Item: Send + 'static;
    /// The error an item may fail with
    type Error: fmt::Display + fmt::Debug + Send;

    /// Label used in logs and metrics for `item`.
    fn kind(&self, _item: &Self::Item) -> &'static str {
        "work_item"
    }

    /// Run `item` to completion.
    async fn handle(&self, item: Self::Item) -> Result<(), Self::Error>;
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    completion: Notify,
}

/// Shared view of a [`Dispatcher`]'s counters.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    inner: Arc<Counters>,
}

impl Stats {
    /// Take a point-in-time copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> Report {
        // Completions are read before submissions so that a snapshot never
        // shows more completed than submitted items.
        let succeeded = self.inner.succeeded.load(Ordering::SeqCst);
        let failed = self.inner.failed.load(Ordering::SeqCst);
        Report {
            submitted: self.inner.submitted.load(Ordering::SeqCst),
            rejected: self.inner.rejected.load(Ordering::SeqCst),
            succeeded,
            failed,
        }
    }

    /// Wait until every item submitted so far has completed.
    pub async fn wait_idle(&self) {
        // Register for notification before checking the condition, otherwise
        // a completion landing between the check and the await is lost.
        loop {
            let notified = self.inner.completion.notified();
            if self.snapshot().in_flight() == 0 {
                break;
            }
            notified.await;
        }
    }

    fn record_completion(&self, kind: &'static str, success: bool) {
        if success {
            self.inner.succeeded.fetch_add(1, Ordering::SeqCst);
            counter!("work_items_succeeded", "kind" => kind).increment(1);
        } else {
            self.inner.failed.fetch_add(1, Ordering::SeqCst);
            counter!("work_items_failed", "kind" => kind).increment(1);
        }
        self.inner.completion.notify_waiters();
    }
}

/// Counts of work items observed by a [`Dispatcher`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Report {
    /// Items accepted into the queue
    pub submitted: u64,
    /// Submissions refused during shutdown
    pub rejected: u64,
    /// Items that completed successfully
    pub succeeded: u64,
    /// Items that failed or panicked
    pub failed: u64,
}

impl Report {
    /// Items that have finished, successfully or not
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.succeeded + self.failed
    }

    /// Items accepted but not yet finished
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.submitted.saturating_sub(self.completed())
    }
}

/// A cloneable handle for submitting work into a [`Dispatcher`].
pub struct Submitter<T> {
    sender: mpsc::Sender<T>,
    closing: CancellationToken,
    stats: Stats,
}

impl<T> Clone for Submitter<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            closing: self.closing.clone(),
            stats: self.stats.clone(),
        }
    }
}

impl<T> fmt::Debug for Submitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Submitter")
            .field("capacity", &self.sender.max_capacity())
            .field("available", &self.sender.capacity())
            .field("closing", &self.closing.is_cancelled())
            .finish()
    }
}

impl<T> Submitter<T>
where
    T: Send + 'static,
{
    /// Submit `item` for execution.
    ///
    /// Suspends while the queue is at capacity and returns once the item has
    /// been accepted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RejectedSubmission`] if the dispatcher is shutting
    /// down, including when shutdown begins while this call is suspended.
    pub async fn submit(&self, item: T) -> Result<(), Error> {
        if self.closing.is_cancelled() {
            return Err(self.reject());
        }
        let permit = tokio::select! {
            biased;
            () = self.closing.cancelled() => return Err(self.reject()),
            permit = self.sender.reserve() => permit.map_err(|_| self.reject())?,
        };
        // Count before handing the item over so that a worker can never
        // complete an item the counters have not yet seen.
        self.stats.inner.submitted.fetch_add(1, Ordering::SeqCst);
        counter!("work_items_submitted").increment(1);
        permit.send(item);
        Ok(())
    }

    fn reject(&self) -> Error {
        self.stats.inner.rejected.fetch_add(1, Ordering::SeqCst);
        counter!("work_items_rejected").increment(1);
        Error::RejectedSubmission
    }
}

struct Queue<T> {
    receiver: Mutex<mpsc::Receiver<T>>,
    closing: CancellationToken,
}

impl<T> Queue<T> {
    /// Pull the next item. Returns `None` once shutdown has begun and the
    /// queue is empty.
    async fn next(&self) -> Option<T> {
        let mut receiver = self.receiver.lock().await;
        if !self.closing.is_cancelled() {
            tokio::select! {
                item = receiver.recv() => return item,
                () = self.closing.cancelled() => {}
            }
        }
        // Closing the receiver refuses further sends but keeps everything
        // already buffered available to `recv`.
        receiver.close();
        receiver.recv().await
    }
}

/// Fixed-size worker pool fed by a bounded queue.
pub struct Dispatcher<H>
where
    H: Handler,
{
    submitter: Submitter<H::Item>,
    workers: JoinSet<()>,
    capacity: NonZeroUsize,
}

impl<H> fmt::Debug for Dispatcher<H>
where
    H: Handler,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("workers", &self.workers.len())
            .field("capacity", &self.capacity)
            .field("stats", &self.submitter.stats.snapshot())
            .finish_non_exhaustive()
    }
}

impl<H> Dispatcher<H>
where
    H: Handler,
{
    /// Create a new [`Dispatcher`] with `workers` tasks and a queue holding at
    /// most `capacity` items.
    ///
    /// Worker tasks are spawned immediately, the function must be called from
    /// within a tokio runtime.
    #[must_use]
    pub fn new(handler: H, workers: NonZeroUsize, capacity: NonZeroUsize) -> Self {
        let handler = Arc::new(handler);
        let (sender, receiver) = mpsc::channel(capacity.get());
        let closing = CancellationToken::new();
        let stats = Stats::default();
        let queue = Arc::new(Queue {
            receiver: Mutex::new(receiver),
            closing: closing.clone(),
        });

        let mut pool = JoinSet::new();
        for id in 0..workers.get() {
            let worker = Worker {
                id,
                handler: Arc::clone(&handler),
                queue: Arc::clone(&queue),
                stats: stats.clone(),
            };
            pool.spawn(worker.spin());
        }

        Self {
            submitter: Submitter {
                sender,
                closing,
                stats,
            },
            workers: pool,
            capacity,
        }
    }

    /// Submit `item` for execution. See [`Submitter::submit`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::RejectedSubmission`] if the dispatcher is shutting
    /// down.
    pub async fn submit(&self, item: H::Item) -> Result<(), Error> {
        self.submitter.submit(item).await
    }

    /// A cloneable handle for submitting from other tasks.
    #[must_use]
    pub fn submitter(&self) -> Submitter<H::Item> {
        self.submitter.clone()
    }

    /// A shared view of this dispatcher's counters.
    #[must_use]
    pub fn stats(&self) -> Stats {
        self.submitter.stats.clone()
    }

    /// Wait until every item submitted so far has completed. Admission stays
    /// open.
    pub async fn wait_idle(&self) {
        self.submitter.stats.wait_idle().await;
    }

    /// Stop admitting work, then wait for every accepted item to finish.
    ///
    /// Submitters suspended on a full queue are released with
    /// [`Error::RejectedSubmission`]. Items already queued or in flight are
    /// run to completion.
    pub async fn shutdown_and_drain(mut self) -> Report {
        let pending = self.submitter.stats.snapshot().in_flight();
        info!("Admission closed, draining {pending} outstanding work items");
        self.submitter.closing.cancel();

        while let Some(res) = self.workers.join_next().await {
            if let Err(err) = res {
                error!("Could not join dispatcher worker: {err}");
            }
        }
        self.submitter.stats.snapshot()
    }
}

struct Worker<H>
where
    H: Handler,
{
    id: usize,
    handler: Arc<H>,
    queue: Arc<Queue<H::Item>>,
    stats: Stats,
}

impl<H> Worker<H>
where
    H: Handler,
{
    async fn spin(self) {
        while let Some(item) = self.queue.next().await {
            let kind = self.handler.kind(&item);
            let outcome = AssertUnwindSafe(self.handler.handle(item))
                .catch_unwind()
                .await;
            let success = match outcome {
                Ok(Ok(())) => true,
                Ok(Err(err)) => {
                    error!("{kind} failed: {err}");
                    debug!(worker = self.id, "{kind} failure detail: {err:?}");
                    false
                }
                Err(panic) => {
                    error!("{kind} panicked: {}", panic_message(panic.as_ref()));
                    false
                }
            };
            self.stats.record_completion(kind, success);
        }
        debug!(worker = self.id, "worker drained");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic payload"
    }
}
