//! Background loops: the load balancer draining the global queue and the
//! periodic statistics refresh.

use cobalt_types::{CobaltError, InferenceResponse, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::queue::PendingRequest;
use crate::scheduler::MultiNodeScheduler;

impl MultiNodeScheduler {
    /// Spawn the balancer and stats loops on the current tokio runtime.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| CobaltError::invalid_state("scheduler must be started inside a tokio runtime"))?;
        if *self.shutdown_tx.borrow() {
            return Err(CobaltError::invalid_state("scheduler has been shut down"));
        }
        let receiver = self
            .queue
            .take_receiver()
            .ok_or_else(|| CobaltError::invalid_state("scheduler already started"))?;
        self.set_running(true);

        let balancer = handle.spawn(balancer_loop(
            Arc::clone(self),
            receiver,
            self.shutdown_tx.subscribe(),
        ));
        let stats = handle.spawn(stats_loop(
            Arc::clone(self),
            Duration::from_millis(self.config().stats_interval_ms),
            self.shutdown_tx.subscribe(),
        ));
        self.track_task(balancer);
        self.track_task(stats);
        info!(
            "Scheduler started (queue capacity {}, stats every {} ms)",
            self.config().queue_capacity,
            self.config().stats_interval_ms
        );
        Ok(())
    }

    /// Stop the loops, wait for them to exit, fail whatever is still queued
    /// and shut every node down.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        info!("Shutting down scheduler");
        for task in self.take_tasks() {
            if let Err(e) = task.await {
                warn!("scheduler task ended abnormally: {}", e);
            }
        }
        // never started: the queue may still hold requests
        if let Some(receiver) = self.queue.take_receiver() {
            drain(self, receiver);
        }
        self.set_running(false);
        self.shutdown_nodes();
        self.refresh_stats();
        info!("Scheduler stopped");
    }
}

async fn balancer_loop(
    scheduler: Arc<MultiNodeScheduler>,
    mut receiver: mpsc::Receiver<PendingRequest>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("load balancer loop running");
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            next = receiver.recv() => match next {
                Some(pending) => scheduler.dispatch(pending),
                None => break,
            },
        }
    }
    drain(&scheduler, receiver);
    debug!("load balancer loop stopped");
}

/// Answer every request left in the queue with a failure.
fn drain(scheduler: &MultiNodeScheduler, mut receiver: mpsc::Receiver<PendingRequest>) {
    receiver.close();
    let mut failed = 0;
    while let Ok(pending) = receiver.try_recv() {
        scheduler.queue.mark_dequeued(&pending.request.id);
        let response = InferenceResponse::failure(&pending.request, "scheduler shut down");
        scheduler.record(&response);
        pending.respond(response);
        failed += 1;
    }
    if failed > 0 {
        warn!("Failed {} queued requests at shutdown", failed);
    }
}

async fn stats_loop(
    scheduler: Arc<MultiNodeScheduler>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => scheduler.refresh_stats(),
        }
    }
    debug!("stats loop stopped");
}
