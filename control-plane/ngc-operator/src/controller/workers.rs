//! Worker pool draining the work queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::queue::WorkQueue;
use super::reconcile::{Dispatcher, Requeue};
use super::{ErrorClass, ReconcileErr, WorkKey};
use crate::metrics::Metrics;

/// What happens to a key after its pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Followup {
    /// Reset backoff and come back after the delay
    Resync(Duration),
    /// Reset backoff and wait for the next event
    Forget,
    /// Come back after the key's next backoff delay
    Backoff,
    /// Come back after a fixed delay without touching backoff
    After(Duration),
    Drop,
}

pub fn followup(result: &Result<Requeue, ReconcileErr>, unreachable_retry: Duration) -> Followup {
    match result {
        Ok(Requeue::After(d)) => Followup::Resync(*d),
        Ok(Requeue::Never) => Followup::Forget,
        Err(e) => match e.class() {
            ErrorClass::Terminal => Followup::Forget,
            ErrorClass::Backoff => Followup::Backoff,
            ErrorClass::Unreachable => Followup::After(unreachable_retry),
            ErrorClass::Shutdown => Followup::Drop,
        },
    }
}

pub struct WorkerPool {
    pub queue: Arc<WorkQueue<WorkKey>>,
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: Arc<Metrics>,
    pub workers: usize,
    /// Delay before retrying a key whose cluster is unreachable
    pub unreachable_retry: Duration,
}

impl WorkerPool {
    /// Run until the queue shuts down.
    pub async fn run(self) {
        let mut set = JoinSet::new();
        for id in 0..self.workers.max(1) {
            let queue = self.queue.clone();
            let dispatcher = self.dispatcher.clone();
            let metrics = self.metrics.clone();
            let retry = self.unreachable_retry;
            set.spawn(async move { worker(id, queue, dispatcher, metrics, retry).await });
        }
        info!(workers = self.workers.max(1), "workers started");
        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "worker task failed");
            }
        }
        info!("workers stopped");
    }
}

async fn worker(
    id: usize,
    queue: Arc<WorkQueue<WorkKey>>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<Metrics>,
    unreachable_retry: Duration,
) {
    while let Some(key) = queue.get().await {
        metrics.queue_depth.set(queue.len() as i64);
        let started = Instant::now();
        let result = dispatcher.dispatch(&key).await;
        let kind = key.kind.as_str();
        metrics
            .reconcile_duration_seconds
            .with_label_values(&[kind])
            .observe(started.elapsed().as_secs_f64());
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.outcome(),
        };
        metrics.reconcile_total.with_label_values(&[kind, outcome]).inc();

        match followup(&result, unreachable_retry) {
            Followup::Resync(d) => {
                queue.forget(&key);
                queue.add_after(key.clone(), d);
            }
            Followup::Forget => {
                if let Err(e) = &result {
                    warn!(worker = id, %key, error = %e, "not retrying until the object changes");
                }
                queue.forget(&key);
            }
            Followup::Backoff => {
                let delay = queue.add_rate_limited(key.clone());
                if let Err(e) = &result {
                    warn!(worker = id, %key, error = %e, retry_in = ?delay, "pass failed");
                }
            }
            Followup::After(d) => {
                if let Err(e) = &result {
                    warn!(worker = id, %key, error = %e, retry_in = ?d, "cluster unreachable");
                }
                queue.add_after(key.clone(), d);
            }
            Followup::Drop => debug!(worker = id, %key, "dropped on shutdown"),
        }
        queue.done(&key);
        metrics.queue_depth.set(queue.len() as i64);
    }
    debug!(worker = id, "worker exiting");
}
