//! Bounded background worker pool
//!
//! A pool owns a bounded queue of boxed futures and a fixed number of worker
//! tasks draining it. Enqueueing never waits: a full queue is reported to the
//! caller as [`Error::ResourceExhausted`]. A panic inside one job is caught
//! and logged; the worker moves on to the next job.

use crate::error::{Error, Result};
use async_channel::{Receiver, Sender, TrySendError};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared, join_all};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use tracing::{debug, error, warn};

/// A queued unit of work
type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Fixed-size pool of workers draining a bounded queue
pub struct WorkerPool {
    name: String,
    queue: Sender<Job>,
    // Completes once every worker has exited; each shutdown caller awaits a clone
    drained: Shared<BoxFuture<'static, ()>>,
}

impl WorkerPool {
    /// Spawn `workers` workers sharing a queue of `capacity` pending jobs
    pub fn new(name: impl Into<String>, workers: usize, capacity: usize) -> Self {
        let name = name.into();
        let (queue, rx) = async_channel::bounded::<Job>(capacity.max(1));

        let workers: Vec<smol::Task<()>> = (0..workers.max(1))
            .map(|id| smol::spawn(run_worker(name.clone(), id, rx.clone())))
            .collect();
        let drained = join_all(workers).map(|_| ()).boxed().shared();

        debug!("Started worker pool {}", name);
        Self {
            name,
            queue,
            drained,
        }
    }

    /// Pool name, used in logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a job without waiting for it to run
    pub fn add_task<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.queue.try_send(Box::pin(job)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::ResourceExhausted(format!(
                "task queue of {} is full",
                self.name
            ))),
            Err(TrySendError::Closed(_)) => Err(Error::Validation(format!(
                "worker pool {} is shut down",
                self.name
            ))),
        }
    }

    /// Enqueue a job that must not be lost
    ///
    /// If the queue is full or closed the job runs detached on the executor
    /// instead.
    pub fn add_task_or_detach<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let job: Job = Box::pin(job);
        if let Err(e) = self.queue.try_send(job) {
            warn!("Queue of {} unavailable, running job detached", self.name);
            let job = e.into_inner();
            smol::spawn(async move {
                if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                    error!("Detached job panicked");
                }
            })
            .detach();
        }
    }

    /// Jobs waiting for a worker
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Whether the pool stopped accepting jobs
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Stop accepting jobs; queued jobs still run
    pub fn close(&self) {
        if self.queue.close() {
            debug!("Closed task queue of {}", self.name);
        }
    }

    /// Close the queue and wait until every queued job has finished
    ///
    /// Concurrent callers all wait for the same drain.
    pub async fn shutdown(&self) {
        self.close();
        self.drained.clone().await;
        debug!("Worker pool {} drained", self.name);
    }
}

async fn run_worker(pool: String, id: usize, jobs: Receiver<Job>) {
    while let Ok(job) = jobs.recv().await {
        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
            error!("Job panicked on worker {} of {}", id, pool);
        }
    }
}
