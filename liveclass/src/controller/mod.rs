//! The classification job loop.
//!
//! The [`Controller`] owns one session: it consumes start requests from the
//! [`JobQueue`], runs classification jobs strictly one at a time, and keeps
//! the persisted [`RunState`](crate::state::RunState) truthful at every
//! step that must survive a crash.
//!
//! One job is: sync producer settings, import new particles into the
//! combined stack, plan the phase (fresh ab-initio versus continuing from
//! the previous classification), then walk the cycle schedule through the
//! dispatcher. A kill request is honored at cycle boundaries only; a
//! half-finished cycle is worthless, so the running one always completes.

mod listener;
mod notify;
mod queue;

pub use listener::{ParticleListener, DEFAULT_POLL_INTERVAL};
pub use notify::{Notification, NotificationHub};
pub use queue::{JobQueue, JobRequest, StartReason};

use crate::dispatch::{CycleSpec, DispatchError, Dispatcher, SeedSpec};
use crate::planner::{
    choose_phase, compute_statistics, derive_base_table, resolution_ladder, ParticleStatistics,
};
use crate::stack::{import_new_particles, ImportError, ImportOptions};
use crate::star::{count_per_class, StarError};
use crate::state::{
    sync_from_producer, ClassificationType, Cycle, CycleBlock, JobStatus, ProducerError,
    Settings, SharedState, StateError,
};
use chrono::Utc;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Base name of the combined particle stack and its table.
pub const STACK_LABEL: &str = "combined_stack";

/// Errors from one classification job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Producer(#[from] ProducerError),

    #[error(transparent)]
    Import(#[from] ImportError),

    #[error(transparent)]
    Table(#[from] StarError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A blocking task panicked or was cancelled
    #[error("background task failed: {0}")]
    Internal(String),
}

/// Everything a job needs, snapshotted under one lock at job start.
///
/// The job loop works from this copy; the shared state is only re-locked
/// for flag checks and history appends, never held across a cycle.
struct JobInputs {
    warp_folder: PathBuf,
    work_dir: PathBuf,
    export_table: String,
    settings: Settings,
    process_count: usize,
    classification_type: ClassificationType,
    force_reimport: bool,
    cycles: Vec<Cycle>,
}

/// Drives classification jobs against the shared run state.
pub struct Controller {
    state: SharedState,
    dispatcher: Dispatcher,
    hub: NotificationHub,
    /// Install root, the second recovery location for the state document
    install_dir: PathBuf,
    import_options: ImportOptions,
}

impl Controller {
    pub fn new(
        state: SharedState,
        dispatcher: Dispatcher,
        hub: NotificationHub,
        install_dir: PathBuf,
    ) -> Self {
        Self {
            state,
            dispatcher,
            hub,
            install_dir,
            import_options: ImportOptions::default(),
        }
    }

    pub fn with_import_options(mut self, import_options: ImportOptions) -> Self {
        self.import_options = import_options;
        self
    }

    /// Consumes start requests until the cancellation token fires.
    ///
    /// Job failures are reported (log plus [`Notification::Alert`]) and the
    /// loop keeps serving; one bad run must not take the session down.
    pub async fn serve(&self, mut receiver: mpsc::Receiver<JobRequest>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("job loop shutting down");
                    return;
                }
                request = receiver.recv() => {
                    let Some(request) = request else { return };
                    info!(reason = ?request.reason, "job start request received");
                    if let Err(e) = self.run_job().await {
                        error!(error = %e, "classification job failed");
                    }
                }
            }
        }
    }

    /// Requests a kill of the running job, or stops a listening session.
    ///
    /// Returns `true` if the request changed anything. A running job drains
    /// at its next cycle boundary; a listening session simply stops firing.
    /// An in-flight particle count is allowed to settle first so the status
    /// resolution cannot race a count-triggered start.
    pub async fn request_kill(&self) -> bool {
        loop {
            if !self.state.lock().await.counting {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        let accepted = {
            let mut state = self.state.lock().await;
            match state.job_status {
                JobStatus::Running => {
                    state.kill_job = true;
                    state.job_status = JobStatus::Killed;
                    true
                }
                JobStatus::Listening => {
                    state.job_status = JobStatus::Stopped;
                    true
                }
                JobStatus::Stopped | JobStatus::Killed => false,
            }
        };
        if accepted {
            self.persist_state().await;
            self.hub.publish(Notification::KillReceived);
        }
        accepted
    }

    /// Runs one classification job to completion.
    ///
    /// Whatever happens inside, the job ends in a resolved status: `Stopped`
    /// after a kill or a refine-type run, `Listening` otherwise. A failed run
    /// also ends `Listening` so the particle listener can retry it once more
    /// particles arrive; only a kill parks the session.
    pub async fn run_job(&self) -> Result<(), JobError> {
        let Some(inputs) = self.begin_job().await? else {
            return Ok(());
        };
        self.hub.publish(Notification::JobStarted);
        let classification_type = inputs.classification_type;

        let result = self.execute(inputs).await;

        let killed = {
            let mut state = self.state.lock().await;
            let killed = state.kill_job;
            state.kill_job = false;
            state.counting = false;
            state.job_status =
                if killed || classification_type == ClassificationType::Refine {
                    JobStatus::Stopped
                } else {
                    JobStatus::Listening
                };
            if result.is_ok() && !killed && classification_type == ClassificationType::AbInitio {
                // The classes now exist; future runs continue from them.
                state.settings.classification_type = ClassificationType::Seeded;
            }
            state.persist(&self.install_dir)?;
            killed
        };

        match result {
            Ok(()) => {
                if killed {
                    info!("classification job killed at cycle boundary");
                } else {
                    info!("classification job finished");
                }
                self.hub.publish(Notification::JobFinished);
                Ok(())
            }
            Err(e) => {
                self.hub.publish(Notification::Alert {
                    text: format!("classification job failed: {e}"),
                });
                Err(e)
            }
        }
    }

    /// Claims the session for a job and snapshots its inputs.
    ///
    /// Returns `None` without side effects when a job is already running.
    /// Producer drift detected here retargets the job to ab-initio before
    /// anything is snapshotted.
    async fn begin_job(&self) -> Result<Option<JobInputs>, JobError> {
        let mut state = self.state.lock().await;
        if state.job_status == JobStatus::Running {
            warn!("job already running, ignoring start request");
            return Ok(None);
        }

        let producer = sync_from_producer(&mut state)?;
        let drifted = state.force_abinit;

        let mut classification_type = state.settings.classification_type;
        if state.force_abinit {
            classification_type = ClassificationType::AbInitio;
            state.settings.classification_type = ClassificationType::AbInitio;
            state.force_abinit = false;
        }

        state.job_status = JobStatus::Running;
        state.kill_job = false;

        let inputs = JobInputs {
            warp_folder: state.warp_folder.clone(),
            work_dir: state.working_directory.clone(),
            export_table: producer.export_table_name(),
            settings: state.settings.clone(),
            process_count: state.process_count,
            classification_type,
            force_reimport: state.next_run_new_particles,
            cycles: state.cycles.clone(),
        };
        if let Err(e) = state.persist(&self.install_dir) {
            // A session that cannot record itself as running must not claim
            // to be.
            state.job_status = JobStatus::Stopped;
            return Err(e.into());
        }
        drop(state);

        if drifted {
            self.hub.publish(Notification::SettingsChanged);
        }
        Ok(Some(inputs))
    }

    /// The job body: import, plan, seed if ab-initio, walk the schedule.
    async fn execute(&self, inputs: JobInputs) -> Result<(), JobError> {
        tokio::fs::create_dir_all(&inputs.work_dir)
            .await
            .map_err(|e| JobError::Io {
                path: inputs.work_dir.clone(),
                source: e,
            })?;

        let imported = {
            let warp = inputs.warp_folder.clone();
            let table = inputs.export_table.clone();
            let work = inputs.work_dir.clone();
            let force = inputs.force_reimport;
            let options = self.import_options.clone();
            blocking(move || {
                import_new_particles(STACK_LABEL, &warp, &table, &work, force, &options)
            })
            .await?
        };
        self.state.lock().await.next_run_new_particles = false;
        info!(new_particles = imported, "particle import complete");

        let classification_type = inputs.classification_type;
        let plan = choose_phase(&inputs.cycles, classification_type);
        let base_table = {
            let work = inputs.work_dir.clone();
            let plan = plan.clone();
            blocking(move || derive_base_table(STACK_LABEL, &work, &plan)).await?
        };

        let settings = &inputs.settings;
        let stats = {
            let table = base_table.clone();
            let class_number = settings.class_number;
            let particles_per_class = settings.particles_per_class;
            let process_count = inputs.process_count;
            blocking(move || {
                compute_statistics(
                    &table,
                    class_number,
                    particles_per_class,
                    process_count,
                    classification_type,
                )
            })
            .await?
        };
        info!(
            particles = stats.particle_count,
            per_worker = stats.particles_per_worker,
            fraction = stats.sampling_fraction,
            "planned classification run"
        );

        let stack_path = inputs.work_dir.join(format!("{STACK_LABEL}.mrcs"));
        let mut current_cycle = plan.start_cycle;
        let mut input_table = base_table;

        if plan.ab_initio {
            self.dispatcher
                .seed_classes(&SeedSpec {
                    work_dir: inputs.work_dir.clone(),
                    stack_path: stack_path.clone(),
                    input_table: input_table.clone(),
                    output_cycle: current_cycle,
                    class_count: settings.class_number,
                    high_res_limit: settings.high_res_initial,
                    pixel_size: settings.pixel_size,
                    mask_radius: settings.mask_radius,
                    automask: settings.automask,
                    autocenter: settings.autocenter,
                })
                .await?;
            // Seeding assigns no particles; the record carries an empty
            // histogram with one bucket per class plus the unclassified one.
            self.record_cycle(
                current_cycle,
                CycleBlock::RandomSeed,
                1,
                settings.high_res_initial,
                1.0,
                &stats,
                inputs.process_count,
                vec![0; settings.class_number + 1],
            )
            .await?;
        }

        for (block, cycle_in_block, high_res_limit, sampling_fraction) in
            cycle_schedule(settings, classification_type, stats.sampling_fraction)
        {
            if self.kill_requested().await {
                info!("kill observed, skipping remaining cycles");
                break;
            }
            // Producer settings may drift while a run is in flight; adopt
            // them now so the restart flags are set for the next run, but
            // never retarget the run already underway.
            {
                let mut state = self.state.lock().await;
                if let Err(e) = sync_from_producer(&mut state) {
                    warn!(error = %e, "producer re-sync failed mid-run");
                }
            }
            let output = self
                .dispatcher
                .run_cycle(&CycleSpec {
                    work_dir: inputs.work_dir.clone(),
                    stack_path: stack_path.clone(),
                    input_table: input_table.clone(),
                    input_cycle: current_cycle,
                    worker_count: inputs.process_count,
                    particle_count: stats.particle_count,
                    particles_per_worker: stats.particles_per_worker,
                    sampling_fraction,
                    high_res_limit,
                    pixel_size: settings.pixel_size,
                    mask_radius: settings.mask_radius,
                    automask: settings.automask,
                    autocenter: settings.autocenter,
                })
                .await?;
            let per_class = {
                let table = output.table.clone();
                blocking(move || count_per_class(&table)).await?
            };
            self.record_cycle(
                output.cycle,
                block,
                cycle_in_block,
                high_res_limit,
                sampling_fraction,
                &stats,
                inputs.process_count,
                per_class,
            )
            .await?;
            current_cycle = output.cycle;
            input_table = output.table;
        }
        Ok(())
    }

    /// Appends one completed cycle to the history and persists.
    #[allow(clippy::too_many_arguments)]
    async fn record_cycle(
        &self,
        number: u32,
        block: CycleBlock,
        cycle_number_in_block: u32,
        high_res_limit: f64,
        fraction_used: f64,
        stats: &ParticleStatistics,
        process_count: usize,
        per_class: Vec<u64>,
    ) -> Result<(), JobError> {
        let name = format!("cycle_{number}");
        {
            let mut state = self.state.lock().await;
            state.cycles.push(Cycle {
                name: name.clone(),
                number,
                block,
                cycle_number_in_block,
                high_res_limit,
                fraction_used,
                process_count,
                time: Utc::now(),
                particle_count: stats.particle_count,
                particle_count_per_class: per_class,
            });
            state.persist(&self.install_dir)?;
        }
        self.hub.publish(Notification::GalleryUpdated { cycle: name });
        Ok(())
    }

    async fn kill_requested(&self) -> bool {
        self.state.lock().await.kill_job
    }

    /// Best-effort persist for paths where the job outcome matters more
    /// than the write.
    async fn persist_state(&self) {
        let state = self.state.lock().await;
        if let Err(e) = state.persist(&self.install_dir) {
            warn!(error = %e, "failed to persist run state");
        }
    }
}

/// Builds the cycle schedule for one run.
///
/// Ab-initio and seeded runs walk the startup resolution ladder and then
/// refine at the final resolution; refine-type runs skip the ladder. Startup
/// cycles sample the planned fraction; refinement cycles always cover every
/// particle.
fn cycle_schedule(
    settings: &Settings,
    classification_type: ClassificationType,
    sampling_fraction: f64,
) -> Vec<(CycleBlock, u32, f64, f64)> {
    let mut schedule = Vec::new();
    if classification_type != ClassificationType::Refine {
        let ladder = resolution_ladder(
            settings.high_res_initial,
            settings.high_res_final,
            settings.run_count_startup as usize,
        );
        for (i, high_res) in ladder.into_iter().enumerate() {
            schedule.push((CycleBlock::Startup, i as u32 + 1, high_res, sampling_fraction));
        }
    }
    for i in 0..settings.run_count_refine {
        schedule.push((
            CycleBlock::Refinement,
            i + 1,
            settings.high_res_final,
            1.0,
        ));
    }
    schedule
}

async fn blocking<T, E, F>(f: F) -> Result<T, JobError>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<JobError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| JobError::Internal(e.to_string()))?
        .map_err(Into::into)
}
