//! Liveclass - live 2D classification of cryo-EM particles
//!
//! This library orchestrates iterative 2D classification of particle images
//! picked in real time by Warp, using the cisTEM `refine2d` and `merge2d`
//! command-line programs as classification workers.
//!
//! # High-Level Flow
//!
//! ```text
//! Warp export → StackStore (append) → Planner → Dispatcher (refine2d xN)
//!                                                    ↓
//!                              merge2d ← partial tables/dumps
//! ```
//!
//! The [`controller`] module drives the whole loop; everything below it is
//! usable on its own:
//!
//! - [`star`] - STAR particle table codec (parse, count, append, write)
//! - [`mrc`] - minimal MRC image-stack header codec
//! - [`stack`] - the growing monolithic particle stack
//! - [`planner`] - per-cycle partitioning and resolution schedule
//! - [`dispatch`] - worker-pool execution of one classification cycle
//! - [`state`] - persisted run state and producer settings sync

pub mod controller;
pub mod dispatch;
pub mod logging;
pub mod mrc;
pub mod planner;
pub mod stack;
pub mod star;
pub mod state;

/// Version of the liveclass library and CLI.
///
/// Synchronized across all workspace members via the workspace manifest.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
