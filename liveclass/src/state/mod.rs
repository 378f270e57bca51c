//! Persisted run state and producer settings sync.
//!
//! One mutable [`RunState`] exists per running session. The controller owns
//! it through [`SharedState`] and persists it in full after every mutation
//! that must survive a crash; request handlers consult `job_status` before
//! touching it (single-writer by convention, made safe by the mutex).

mod producer;
mod run_state;
mod settings;

pub use producer::{create_run_state, export_table_name, read_producer_settings,
    sync_from_producer, ProducerError, ProducerSettings, PRODUCER_SETTINGS_FILE};
pub use run_state::{Cycle, CycleBlock, JobStatus, RunState, SharedState, StateError, STATE_FILE};
pub use settings::{ClassificationType, Settings};
