//! Automatic job triggering on new particles.
//!
//! While the session is in [`JobStatus::Listening`], a periodic check
//! counts the producer's export table and queues a run once enough new
//! particles have accumulated since the last completed cycle. The first run
//! of a session uses a lower threshold than subsequent ones: getting any
//! classes at all on screen early matters more than batch efficiency.

use super::queue::{JobQueue, JobRequest, StartReason};
use crate::star::count_data_rows;
use crate::state::{export_table_name, JobStatus, SharedState};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default wait between particle-count checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Watches the producer's export table and queues runs.
pub struct ParticleListener {
    state: SharedState,
    queue: JobQueue,
    poll_interval: Duration,
}

impl ParticleListener {
    pub fn new(state: SharedState, queue: JobQueue) -> Self {
        Self {
            state,
            queue,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Runs the poll loop until the queue's cancellation token fires.
    pub async fn run(self) {
        let cancel = self.queue.cancellation_token();
        let mut ticker = tokio::time::interval(self.poll_interval);
        // The first tick completes immediately; skip it so a freshly
        // started session waits a full interval before counting.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("particle listener shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    self.check_once().await;
                }
            }
        }
    }

    /// One particle-count check.
    ///
    /// Skips silently unless the session is listening and no other count is
    /// in flight; the `counting` flag keeps overlapping checks (poll loop
    /// versus operator-initiated) from double-counting.
    pub async fn check_once(&self) {
        let (export_path, baseline, threshold) = {
            let mut state = self.state.lock().await;
            if state.job_status != JobStatus::Listening || state.counting {
                return;
            }
            state.counting = true;
            let threshold = if state.cycles.is_empty() {
                state.settings.particle_count_initial
            } else {
                state.settings.particle_count_update
            };
            (
                state
                    .warp_folder
                    .join(export_table_name(&state.settings.picking_model)),
                state.latest_particle_count() as u64,
                threshold,
            )
        };

        let result = count_export_rows(export_path).await;
        {
            let mut state = self.state.lock().await;
            state.counting = false;
        }

        let available = match result {
            Ok(count) => count,
            Err(text) => {
                warn!(error = %text, "particle count check failed");
                return;
            }
        };

        let new_particles = available.saturating_sub(baseline);
        debug!(available, baseline, threshold, "checked producer export");
        if new_particles >= threshold {
            info!(new_particles, threshold, "particle threshold crossed, queueing run");
            self.queue.try_submit(JobRequest {
                reason: StartReason::ParticleThreshold { new_particles },
            });
        }
    }
}

async fn count_export_rows(path: PathBuf) -> Result<u64, String> {
    tokio::task::spawn_blocking(move || count_data_rows(&path))
        .await
        .map_err(|e| e.to_string())?
        .map(|count| count as u64)
        .map_err(|e| e.to_string())
}
