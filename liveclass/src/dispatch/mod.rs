//! Classification cycle dispatch.
//!
//! One classification cycle fans a particle table out over a fixed pool of
//! `refine2d` workers, joins on all of them, merges the per-worker partial
//! tables and class-sum dumps, and renders preview images of the merged
//! class averages. The [`Dispatcher`] owns that sequence; which binaries
//! actually run behind it is the [`ClassifierBackend`]'s business.

mod backend;
mod params;
mod preview;

pub use backend::{CistemBackend, ClassifierBackend};
pub use params::{MergeRequest, RefineRequest};
pub use preview::{render_class_previews, PreviewError};

use crate::star::is_header_line;
use params::{dump_file_base, dump_file_name, partial_table_name};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Low-resolution limit for every classification run, in Angstroms.
const LOW_RES_LIMIT: f64 = 300.0;

/// In-plane angular search step for refinement workers, in degrees.
const ANGULAR_SEARCH_STEP: f64 = 15.0;

/// Maximum XY shift search range for refinement workers, in Angstroms.
const MAX_SEARCH_RANGE: f64 = 49.5;

/// Errors from running a classification cycle.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A classification binary failed to run or exited non-zero
    #[error("{program}: {message}")]
    Backend { program: String, message: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Preview(#[from] PreviewError),

    /// A worker task panicked or was cancelled
    #[error("worker task failed: {0}")]
    Internal(String),
}

impl DispatchError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Everything one classification cycle needs to run.
#[derive(Debug, Clone)]
pub struct CycleSpec {
    /// Working directory all cycle files live in
    pub work_dir: PathBuf,
    /// Combined particle stack
    pub stack_path: PathBuf,
    /// Input particle table (`cycle_<n>.star`)
    pub input_table: PathBuf,
    /// Cycle number of the input table and classes; outputs are `n + 1`
    pub input_cycle: u32,
    /// Number of parallel workers
    pub worker_count: usize,
    /// Total particles in the table
    pub particle_count: usize,
    /// Particles handed to each worker
    pub particles_per_worker: usize,
    /// Fraction of each worker's slice actually sampled
    pub sampling_fraction: f64,
    pub high_res_limit: f64,
    pub pixel_size: f64,
    pub mask_radius: f64,
    pub automask: bool,
    pub autocenter: bool,
}

/// Inputs for the ab-initio class seeding call.
#[derive(Debug, Clone)]
pub struct SeedSpec {
    pub work_dir: PathBuf,
    pub stack_path: PathBuf,
    /// Particle table the seeds are drawn from
    pub input_table: PathBuf,
    /// Cycle number the seeded classes belong to
    pub output_cycle: u32,
    pub class_count: usize,
    pub high_res_limit: f64,
    pub pixel_size: f64,
    pub mask_radius: f64,
    pub automask: bool,
    pub autocenter: bool,
}

/// Output locations of a completed cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleOutput {
    /// Cycle number of the outputs
    pub cycle: u32,
    /// Merged particle table with fresh class assignments
    pub table: PathBuf,
    /// Merged class-average stack
    pub classes: PathBuf,
    /// Directory of per-class preview images
    pub previews: PathBuf,
}

/// Runs classification cycles against a backend.
pub struct Dispatcher {
    backend: Arc<dyn ClassifierBackend>,
}

impl Dispatcher {
    pub fn new(backend: Arc<dyn ClassifierBackend>) -> Self {
        Self { backend }
    }

    /// Generates `class_count` randomly seeded class averages from the
    /// particle table, writing `cycle_<n>.mrc` and its previews.
    ///
    /// This is the degenerate cycle 0 of an ab-initio run: no particle table
    /// comes out of it, only class averages for the first real cycle to
    /// refine against.
    pub async fn seed_classes(&self, spec: &SeedSpec) -> Result<PathBuf, DispatchError> {
        let output_classes = spec
            .work_dir
            .join(format!("cycle_{}.mrc", spec.output_cycle));
        let request = RefineRequest {
            input_stack: spec.stack_path.clone(),
            input_table: spec.input_table.clone(),
            input_classes: None,
            output_table: None,
            output_classes: output_classes.clone(),
            new_class_count: spec.class_count,
            first_particle: 1,
            last_particle: 0,
            sampling_fraction: 1.0,
            pixel_size: spec.pixel_size,
            mask_radius: spec.mask_radius,
            low_res_limit: LOW_RES_LIMIT,
            high_res_limit: spec.high_res_limit,
            angular_search_step: 0.0,
            max_search_range: 0.0,
            smoothing_factor: 1.0,
            automask: spec.automask,
            autocenter: spec.autocenter,
            dump_file: None,
        };

        info!(
            cycle = spec.output_cycle,
            classes = spec.class_count,
            "seeding class averages"
        );
        let stdout = self.backend.refine(&request).await?;
        debug!(output = %stdout.trim_end(), "seed job finished");

        let work_dir = spec.work_dir.clone();
        let cycle_name = format!("cycle_{}", spec.output_cycle);
        tokio::task::spawn_blocking(move || render_class_previews(&work_dir, &cycle_name))
            .await
            .map_err(|e| DispatchError::Internal(e.to_string()))??;
        Ok(output_classes)
    }

    /// Runs one full classification cycle: worker fan-out, join, partial
    /// table merge, class-sum merge, preview rendering.
    ///
    /// All workers must succeed; the first failure aborts the cycle and the
    /// error surfaces to the job loop.
    pub async fn run_cycle(&self, spec: &CycleSpec) -> Result<CycleOutput, DispatchError> {
        let output_cycle = spec.input_cycle + 1;
        info!(
            cycle = output_cycle,
            workers = spec.worker_count,
            particles = spec.particle_count,
            fraction = spec.sampling_fraction,
            high_res = spec.high_res_limit,
            "running classification cycle"
        );

        let mut workers: JoinSet<Result<(usize, String), DispatchError>> = JoinSet::new();
        for worker in 0..spec.worker_count {
            let first = worker * spec.particles_per_worker + 1;
            let last = ((worker + 1) * spec.particles_per_worker).min(spec.particle_count);
            let request = params::worker_request(
                &spec.work_dir,
                &spec.stack_path,
                &spec.input_table,
                spec.input_cycle,
                worker,
                first,
                last,
                spec.sampling_fraction,
                spec.pixel_size,
                spec.mask_radius,
                LOW_RES_LIMIT,
                spec.high_res_limit,
                ANGULAR_SEARCH_STEP,
                MAX_SEARCH_RANGE,
                spec.automask,
                spec.autocenter,
            );
            let backend = Arc::clone(&self.backend);
            workers.spawn(async move {
                let stdout = backend.refine(&request).await?;
                Ok((worker, stdout))
            });
        }

        // Join barrier: every worker must finish before any merging.
        while let Some(joined) = workers.join_next().await {
            let (worker, stdout) = joined.map_err(|e| DispatchError::Internal(e.to_string()))??;
            if worker == 0 {
                debug!(output = %stdout.trim_end(), "worker 0 finished");
            }
        }

        let table = merge_partial_tables(&spec.work_dir, output_cycle, spec.worker_count)?;

        let classes = spec.work_dir.join(format!("cycle_{output_cycle}.mrc"));
        let merge = MergeRequest {
            output_classes: classes.clone(),
            dump_file_base: spec.work_dir.join(dump_file_base()),
            worker_count: spec.worker_count,
        };
        let stdout = self.backend.merge(&merge).await?;
        debug!(output = %stdout.trim_end(), "merge finished");

        for worker in 0..spec.worker_count {
            let dump = spec.work_dir.join(dump_file_name(worker));
            if let Err(e) = std::fs::remove_file(&dump) {
                warn!(path = %dump.display(), error = %e, "leaving stale dump file");
            }
        }

        let work_dir = spec.work_dir.clone();
        let cycle_name = format!("cycle_{output_cycle}");
        let previews =
            tokio::task::spawn_blocking(move || render_class_previews(&work_dir, &cycle_name))
                .await
                .map_err(|e| DispatchError::Internal(e.to_string()))??;

        Ok(CycleOutput {
            cycle: output_cycle,
            table,
            classes,
            previews,
        })
    }
}

/// Concatenates the per-worker partial tables into `cycle_<n>.star`.
///
/// Worker 0's file is copied whole, header included; every later worker
/// contributes only its data rows. Partials are removed afterwards on a
/// best-effort basis so a failed cleanup never fails the cycle.
fn merge_partial_tables(
    work_dir: &Path,
    output_cycle: u32,
    worker_count: usize,
) -> Result<PathBuf, DispatchError> {
    let merged_path = work_dir.join(format!("cycle_{output_cycle}.star"));
    let mut out = std::io::BufWriter::new(
        std::fs::File::create(&merged_path).map_err(|e| DispatchError::io(&merged_path, e))?,
    );

    let mut partials = Vec::with_capacity(worker_count);
    for worker in 0..worker_count {
        let partial = work_dir.join(partial_table_name(output_cycle, worker));
        let reader = BufReader::new(
            std::fs::File::open(&partial).map_err(|e| DispatchError::io(&partial, e))?,
        );
        for line in reader.lines() {
            let line = line.map_err(|e| DispatchError::io(&partial, e))?;
            if worker == 0 || !is_header_line(&line) {
                writeln!(out, "{line}").map_err(|e| DispatchError::io(&merged_path, e))?;
            }
        }
        partials.push(partial);
    }
    out.flush().map_err(|e| DispatchError::io(&merged_path, e))?;

    for partial in partials {
        if let Err(e) = std::fs::remove_file(&partial) {
            warn!(path = %partial.display(), error = %e, "leaving stale partial table");
        }
    }
    Ok(merged_path)
}
