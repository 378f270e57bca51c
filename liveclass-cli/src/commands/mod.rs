//! CLI command implementations.
//!
//! Each subcommand has its own module with argument definitions and handlers.
//!
//! # Command Modules
//!
//! - [`run`] - Start a classification session against a Warp directory
//! - [`import`] - One-shot particle import into the combined stack
//! - [`status`] - Summarize the persisted state of a session

pub mod import;
pub mod run;
pub mod status;
