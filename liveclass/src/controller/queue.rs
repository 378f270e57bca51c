//! Job start queue.
//!
//! Classification jobs are strictly serial: one job loop at a time owns the
//! stack and the cycle numbering. Start requests from any source (operator
//! command, particle listener) go through a bounded channel with a single
//! consumer, so concurrent triggers queue up instead of racing.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Pending start requests beyond the running one.
const QUEUE_CAPACITY: usize = 2;

/// Why a job start was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartReason {
    /// An operator asked for a run
    Manual,
    /// The particle listener crossed its new-particle threshold
    ParticleThreshold { new_particles: u64 },
}

/// One queued start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobRequest {
    pub reason: StartReason,
}

/// Producer side of the job queue.
///
/// Clone freely; all clones feed the same single consumer.
#[derive(Debug, Clone)]
pub struct JobQueue {
    sender: mpsc::Sender<JobRequest>,
    cancel: CancellationToken,
}

impl JobQueue {
    /// Creates the queue, returning the shared handle and the consumer end.
    pub fn new() -> (Self, mpsc::Receiver<JobRequest>) {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        let queue = Self {
            sender,
            cancel: CancellationToken::new(),
        };
        (queue, receiver)
    }

    /// Enqueues a start request without waiting.
    ///
    /// Returns `false` when the queue is full or shut down; with one job
    /// running and the queue at capacity another trigger adds nothing, the
    /// queued runs will pick up the same particles.
    pub fn try_submit(&self, request: JobRequest) -> bool {
        self.sender.try_send(request).is_ok()
    }

    /// Token the consumer loop and listener observe for shutdown.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Requests shutdown of the consumer loop and listener.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
