//! CLI error handling with user-friendly messages.
//!
//! Centralizes error handling for the CLI, providing consistent formatting
//! and appropriate exit codes.

use liveclass::controller::JobError;
use liveclass::stack::ImportError;
use liveclass::state::{ProducerError, StateError};
use std::fmt;
use std::process;

/// CLI-specific errors with user-friendly messages.
#[derive(Debug)]
pub enum CliError {
    /// Failed to initialize logging
    LoggingInit(String),
    /// Bad or missing command-line configuration
    Config(String),
    /// Failed to read the producer's settings
    Producer(ProducerError),
    /// Failed to load or write the run state document
    State(StateError),
    /// Particle import failed
    Import(ImportError),
    /// A classification job failed
    Job(JobError),
}

impl CliError {
    /// Exit the process with an appropriate error message and code.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);

        // Print additional help for specific errors
        match self {
            CliError::Producer(ProducerError::ExportDisabled(_)) => {
                eprintln!();
                eprintln!("Enable particle export in Warp before starting a session:");
                eprintln!("  Picking tab -> check \"Export particles\"");
            }
            CliError::Producer(ProducerError::Io { .. }) => {
                eprintln!();
                eprintln!("The Warp directory must contain a previous.settings file.");
                eprintln!("Point --warp-dir at the directory Warp processes into.");
            }
            _ => {}
        }

        process::exit(1)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::LoggingInit(msg) => write!(f, "Failed to initialize logging: {}", msg),
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::Producer(e) => write!(f, "Failed to read Warp settings: {}", e),
            CliError::State(e) => write!(f, "Failed to access run state: {}", e),
            CliError::Import(e) => write!(f, "Particle import failed: {}", e),
            CliError::Job(e) => write!(f, "Classification job failed: {}", e),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Producer(e) => Some(e),
            CliError::State(e) => Some(e),
            CliError::Import(e) => Some(e),
            CliError::Job(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProducerError> for CliError {
    fn from(e: ProducerError) -> Self {
        CliError::Producer(e)
    }
}

impl From<StateError> for CliError {
    fn from(e: StateError) -> Self {
        CliError::State(e)
    }
}

impl From<ImportError> for CliError {
    fn from(e: ImportError) -> Self {
        CliError::Import(e)
    }
}

impl From<JobError> for CliError {
    fn from(e: JobError) -> Self {
        CliError::Job(e)
    }
}
