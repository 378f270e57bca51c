//! Per-cycle classification planning.
//!
//! Pure decision logic between the stack store and the dispatcher: how many
//! particles each worker gets, what fraction of them to sample, which
//! resolution each cycle of a startup phase runs at, and whether the next
//! run continues from previous class assignments (merge) or restarts fresh.

use crate::star::{append_rows, count_data_rows, StarError};
use crate::state::{ClassificationType, Cycle};
use std::path::{Path, PathBuf};
use tracing::info;

/// Partitioning and sampling numbers for one classification cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParticleStatistics {
    /// Total data rows in the base table
    pub particle_count: usize,
    /// Ceiling split of particles across the worker pool
    pub particles_per_worker: usize,
    /// Fraction of each worker's slice actually classified (0, 1]
    pub sampling_fraction: f64,
}

/// Computes the partitioning and sampling numbers for a cycle.
///
/// `particles_per_worker` is the ceiling of `count / workers`; the sampling
/// fraction targets `particles_per_class` particles landing in each class,
/// capped at 1.0. A seeded run always samples everything: restarting from
/// prior classes without discovering new ones wants full coverage.
pub fn compute_statistics(
    table: &Path,
    class_count: usize,
    particles_per_class: usize,
    worker_count: usize,
    classification_type: ClassificationType,
) -> Result<ParticleStatistics, StarError> {
    let particle_count = count_data_rows(table)?;
    let particles_per_worker = particle_count.div_ceil(worker_count.max(1));
    let sampling_fraction = if classification_type == ClassificationType::Seeded {
        1.0
    } else {
        let fraction = (particles_per_class * class_count) as f64 / particle_count as f64;
        fraction.min(1.0)
    };
    Ok(ParticleStatistics {
        particle_count,
        particles_per_worker,
        sampling_fraction,
    })
}

/// Linear resolution schedule from `initial` down to `final_resolution`
/// over `steps` cycles, endpoints inclusive.
///
/// A single-step schedule is the degenerate case and jumps straight to the
/// final resolution.
pub fn resolution_ladder(initial: f64, final_resolution: f64, steps: usize) -> Vec<f64> {
    if steps == 0 {
        return Vec::new();
    }
    if steps == 1 {
        return vec![final_resolution];
    }
    let delta = (initial - final_resolution) / (steps - 1) as f64;
    (0..steps).map(|i| initial - delta * i as f64).collect()
}

/// The phase decision for the next run.
#[derive(Debug, Clone, PartialEq)]
pub struct PhasePlan {
    /// Start from randomly seeded classes
    pub ab_initio: bool,
    /// Carry previous class assignments forward via a table merge
    pub merge: bool,
    /// Cycle number the run's first output is written under
    pub start_cycle: u32,
    /// Name of the most recent completed cycle, if any
    pub anchor: Option<String>,
}

/// Decides the phase and anchor for the next run from the cycle history.
///
/// With no history the run is ab-initio starting at cycle 0. Otherwise the
/// highest-numbered cycle anchors the run: a seeded or refine run merges
/// new particles onto that cycle's output, while switching back to
/// ab-initio restarts past the anchor (its number plus one) so the anchor's
/// files are never overwritten.
pub fn choose_phase(cycles: &[Cycle], classification_type: ClassificationType) -> PhasePlan {
    let anchor = cycles.iter().max_by_key(|cycle| cycle.number);
    match anchor {
        None => PhasePlan {
            ab_initio: true,
            merge: false,
            start_cycle: 0,
            anchor: None,
        },
        Some(anchor) => {
            let merge = classification_type != ClassificationType::AbInitio;
            PhasePlan {
                ab_initio: classification_type == ClassificationType::AbInitio,
                merge,
                start_cycle: if merge {
                    anchor.number
                } else {
                    anchor.number + 1
                },
                anchor: Some(anchor.name.clone()),
            }
        }
    }
}

/// Produces the base table the next run's first cycle reads.
///
/// Fresh or restarting runs copy the imported table to a numbered cycle
/// table (discarding any accumulated class assignments); merging runs
/// append the newly imported rows onto the anchor cycle's output so
/// previously seen particles keep their assignments.
pub fn derive_base_table(
    stack_label: &str,
    work_dir: &Path,
    plan: &PhasePlan,
) -> Result<PathBuf, StarError> {
    let imported = work_dir.join(format!("{stack_label}.star"));
    match (&plan.anchor, plan.merge) {
        (Some(anchor), true) => {
            let anchor_table = work_dir.join(format!("{anchor}.star"));
            let out = work_dir.join(format!("{anchor}_appended.star"));
            let total = append_rows(&anchor_table, &imported, &out)?;
            info!(
                anchor = anchor.as_str(),
                total, "appended new particles onto previous classification"
            );
            Ok(out)
        }
        _ => {
            let out = work_dir.join(format!("cycle_{}.star", plan.start_cycle));
            std::fs::copy(&imported, &out).map_err(|e| StarError::io(&imported, e))?;
            info!(table = %out.display(), "starting classification from a fresh table");
            Ok(out)
        }
    }
}
