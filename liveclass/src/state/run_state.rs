//! The persisted aggregate state of one classification session.

use super::settings::Settings;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

/// Name of the persisted state document.
pub const STATE_FILE: &str = "latest_run.json";

/// Errors from loading or persisting the run state.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed state file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Run-control status of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Idle; a job may be started
    Stopped,
    /// The job loop is executing
    Running,
    /// Idle, but the particle listener may fire a job
    Listening,
    /// Kill requested; the loop drains at the next cycle boundary
    Killed,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Stopped
    }
}

/// Which phase of a run a cycle belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleBlock {
    /// The degenerate ab-initio seeding "cycle"
    RandomSeed,
    /// Resolution-ladder cycles
    Startup,
    /// Final-resolution cycles over all particles
    Refinement,
}

/// One completed classification round. Append-only history; never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cycle {
    /// Human label, also the base name of the cycle's output files
    pub name: String,
    /// Sequential cycle number
    pub number: u32,
    #[serde(rename = "block_type")]
    pub block: CycleBlock,
    /// 1-based position within the block
    pub cycle_number_in_block: u32,
    /// High-resolution limit used, in Angstroms
    pub high_res_limit: f64,
    /// Sampling fraction used
    pub fraction_used: f64,
    /// Workers that ran the cycle
    pub process_count: usize,
    /// Wall-clock completion time
    pub time: DateTime<Utc>,
    /// Total particles in the stack at that point
    pub particle_count: usize,
    /// Histogram of particles per class, bucket 0 = unclassified
    pub particle_count_per_class: Vec<u64>,
}

/// The aggregate session state, loaded at startup and persisted after every
/// state-changing step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    /// Directory the producer (Warp) exports into
    pub warp_folder: PathBuf,
    /// Directory all classification output lands in
    pub working_directory: PathBuf,
    /// Logfile name within the working directory
    #[serde(default = "default_logfile")]
    pub logfile: String,
    /// Fixed worker pool size for classification sub-jobs
    #[serde(default = "default_process_count")]
    pub process_count: usize,
    #[serde(default)]
    pub settings: Settings,
    /// Append-only job history
    #[serde(default)]
    pub cycles: Vec<Cycle>,
    #[serde(default)]
    pub job_status: JobStatus,
    /// Kill requested; observed at cycle boundaries
    #[serde(default)]
    pub kill_job: bool,
    /// An automatic particle-count check is in flight
    #[serde(default)]
    pub counting: bool,
    /// Next run must restart ab-initio (producer settings drifted)
    #[serde(default)]
    pub force_abinit: bool,
    /// Next run must reimport the full particle set
    #[serde(default)]
    pub next_run_new_particles: bool,
}

fn default_logfile() -> String {
    "logfile.txt".to_string()
}

fn default_process_count() -> usize {
    32
}

/// Shared handle to the single mutable run state.
pub type SharedState = Arc<Mutex<RunState>>;

impl RunState {
    /// Creates a fresh stopped state for a producer/working directory pair.
    pub fn new(warp_folder: PathBuf, working_directory: PathBuf, settings: Settings) -> Self {
        Self {
            warp_folder,
            working_directory,
            logfile: default_logfile(),
            process_count: default_process_count(),
            settings,
            cycles: Vec::new(),
            job_status: JobStatus::Stopped,
            kill_job: false,
            counting: false,
            force_abinit: false,
            next_run_new_particles: false,
        }
    }

    /// Loads a persisted state document.
    ///
    /// Control flags are reset to a safe stopped baseline: a state written
    /// mid-run (or by a crashed process) must not come back up "running".
    pub fn load(path: &Path) -> Result<Self, StateError> {
        let content = std::fs::read_to_string(path).map_err(|e| StateError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut state: Self = serde_json::from_str(&content).map_err(|e| StateError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        state.job_status = JobStatus::Stopped;
        state.kill_job = false;
        state.counting = false;
        Ok(state)
    }

    /// Writes the full state document to one location, creating the
    /// containing directory if needed. The first persist of a fresh session
    /// happens before any classification output exists.
    pub fn save_to(&self, path: &Path) -> Result<(), StateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StateError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| StateError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        std::fs::write(path, json).map_err(|e| StateError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Persists the state to both recovery locations: the working directory
    /// and the install root.
    pub fn persist(&self, install_dir: &Path) -> Result<(), StateError> {
        self.save_to(&self.working_directory.join(STATE_FILE))?;
        self.save_to(&install_dir.join(STATE_FILE))
    }

    /// The highest-numbered completed cycle, if any.
    pub fn latest_cycle(&self) -> Option<&Cycle> {
        self.cycles.iter().max_by_key(|cycle| cycle.number)
    }

    /// Particle count as of the latest cycle, zero before any cycle ran.
    pub fn latest_particle_count(&self) -> usize {
        self.latest_cycle().map(|c| c.particle_count).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state(dir: &Path) -> RunState {
        RunState::new(
            dir.join("warp"),
            dir.join("work"),
            Settings::default(),
        )
    }

    #[test]
    fn test_persist_writes_both_locations() {
        let dir = tempfile::TempDir::new().unwrap();
        let install = dir.path().join("install");
        let mut state = sample_state(dir.path());
        state.working_directory = dir.path().join("work");
        std::fs::create_dir_all(&state.working_directory).unwrap();
        std::fs::create_dir_all(&install).unwrap();

        state.persist(&install).unwrap();

        assert!(state.working_directory.join(STATE_FILE).exists());
        assert!(install.join(STATE_FILE).exists());
    }

    #[test]
    fn test_save_to_creates_missing_directories() {
        let dir = tempfile::TempDir::new().unwrap();
        let state = sample_state(dir.path());
        // A fresh session persists before any output directory exists.
        let path = dir.path().join("nested").join("work").join(STATE_FILE);
        state.save_to(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_load_resets_control_flags() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut state = sample_state(dir.path());
        state.job_status = JobStatus::Running;
        state.kill_job = true;
        state.counting = true;
        let path = dir.path().join(STATE_FILE);
        state.save_to(&path).unwrap();

        let loaded = RunState::load(&path).unwrap();
        assert_eq!(loaded.job_status, JobStatus::Stopped);
        assert!(!loaded.kill_job);
        assert!(!loaded.counting);
    }

    #[test]
    fn test_load_tolerates_missing_fields() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(STATE_FILE);
        // A minimal older-format document: only the directories.
        std::fs::write(
            &path,
            r#"{"warp_folder": "/data/warp", "working_directory": "/data/work"}"#,
        )
        .unwrap();

        let state = RunState::load(&path).unwrap();
        assert_eq!(state.process_count, 32);
        assert_eq!(state.logfile, "logfile.txt");
        assert!(state.cycles.is_empty());
        assert_eq!(state.settings.class_number, 50);
    }

    #[test]
    fn test_latest_cycle_orders_by_number() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut state = sample_state(dir.path());
        for number in [2u32, 5, 3] {
            state.cycles.push(Cycle {
                name: format!("cycle_{number}"),
                number,
                block: CycleBlock::Startup,
                cycle_number_in_block: 1,
                high_res_limit: 20.0,
                fraction_used: 1.0,
                process_count: 8,
                time: Utc::now(),
                particle_count: number as usize * 10,
                particle_count_per_class: vec![0],
            });
        }
        assert_eq!(state.latest_cycle().unwrap().name, "cycle_5");
        assert_eq!(state.latest_particle_count(), 50);
    }
}
