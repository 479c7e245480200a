//! Global pending-request queue

use cobalt_types::{CobaltError, InferenceRequest, InferenceResponse, RequestId, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};

/// A request waiting for the load balancer, with the channel its answer goes to
#[derive(Debug)]
pub struct PendingRequest {
    pub request: InferenceRequest,
    pub enqueued_at: Instant,
    /// Queue depth observed when the request was accepted
    pub queue_position: usize,
    pub reply: oneshot::Sender<InferenceResponse>,
}

impl PendingRequest {
    /// Deliver `response`; a caller that stopped waiting is not an error.
    pub fn respond(self, mut response: InferenceResponse) {
        response.queue_position = Some(self.queue_position);
        response.wait_time_ms = self.enqueued_at.elapsed().as_secs_f64() * 1000.0;
        let _ = self.reply.send(response);
    }
}

/// Ids waiting in the channel and the subset flagged as cancelled
#[derive(Debug, Default)]
struct Membership {
    queued: HashSet<RequestId>,
    cancelled: HashSet<RequestId>,
}

/// Bounded producer side plus bookkeeping for queued ids and cancellations
#[derive(Debug)]
pub struct RequestQueue {
    sender: mpsc::Sender<PendingRequest>,
    receiver: Mutex<Option<mpsc::Receiver<PendingRequest>>>,
    depth: AtomicUsize,
    capacity: usize,
    membership: Mutex<Membership>,
}

impl RequestQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            depth: AtomicUsize::new(0),
            capacity,
            membership: Mutex::new(Membership::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Accept `request` without waiting; fails when the queue is full or closed.
    pub fn push(&self, request: InferenceRequest) -> Result<oneshot::Receiver<InferenceResponse>> {
        let (reply, rx) = oneshot::channel();
        let id = request.id.clone();
        let position = self.depth.fetch_add(1, Ordering::AcqRel);
        self.membership.lock().queued.insert(id.clone());
        let pending = PendingRequest {
            request,
            enqueued_at: Instant::now(),
            queue_position: position,
            reply,
        };
        if let Err(e) = self.sender.try_send(pending) {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            self.membership.lock().queued.remove(&id);
            return Err(match e {
                mpsc::error::TrySendError::Full(_) => CobaltError::resource_exhausted(format!(
                    "request queue is full ({} pending)",
                    self.capacity
                )),
                mpsc::error::TrySendError::Closed(_) => {
                    CobaltError::invalid_state("request queue is closed")
                }
            });
        }
        Ok(rx)
    }

    /// Hand the consumer side to the balancer loop; only the first call gets it.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<PendingRequest>> {
        self.receiver.lock().take()
    }

    /// Bookkeeping when the balancer pulls an item. Returns false if it was cancelled.
    pub fn mark_dequeued(&self, id: &RequestId) -> bool {
        self.depth.fetch_sub(1, Ordering::AcqRel);
        let mut membership = self.membership.lock();
        membership.queued.remove(id);
        !membership.cancelled.remove(id)
    }

    /// Flag a still-queued request; it is answered as cancelled when dequeued.
    ///
    /// Returns false once the balancer has taken the request.
    pub fn cancel(&self, id: &RequestId) -> bool {
        let mut membership = self.membership.lock();
        membership.queued.contains(id) && membership.cancelled.insert(id.clone())
    }
}
