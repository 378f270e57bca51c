//! liveclass CLI - live 2D classification of cryo-EM particles.
//!
//! This binary provides a command-line interface to the liveclass library:
//! it runs classification sessions against a Warp processing directory,
//! driving the cisTEM `refine2d`/`merge2d` programs.

mod commands;
mod error;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use commands::import::ImportArgs;
use commands::run::RunArgs;
use commands::status::StatusArgs;

#[derive(Parser)]
#[command(name = "liveclass")]
#[command(version = liveclass::VERSION)]
#[command(about = "Live 2D classification of cryo-EM particles", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a classification session against a Warp directory
    Run {
        /// Directory Warp processes into (contains previous.settings)
        #[arg(long)]
        warp_dir: PathBuf,

        /// Working directory for the combined stack and all cycle output
        #[arg(long)]
        work_dir: PathBuf,

        /// Path to the cisTEM refine2d binary
        #[arg(long, default_value = "refine2d")]
        refine2d: PathBuf,

        /// Path to the cisTEM merge2d binary
        #[arg(long, default_value = "merge2d")]
        merge2d: PathBuf,

        /// Seconds between automatic new-particle checks
        #[arg(long, default_value = "60")]
        poll_interval: u64,

        /// Disable automatic job starts on new particles
        #[arg(long)]
        no_listen: bool,

        /// Run a single classification job and exit
        #[arg(long)]
        once: bool,
    },

    /// Import new particles into the combined stack without classifying
    Import {
        /// Directory Warp processes into (contains previous.settings)
        #[arg(long)]
        warp_dir: PathBuf,

        /// Working directory for the combined stack
        #[arg(long)]
        work_dir: PathBuf,

        /// Rebuild the combined stack from scratch instead of appending
        #[arg(long)]
        full: bool,
    },

    /// Summarize the persisted state of a session
    Status {
        /// Working directory of the session
        #[arg(long)]
        work_dir: PathBuf,

        /// Emit the raw state document as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run {
            warp_dir,
            work_dir,
            refine2d,
            merge2d,
            poll_interval,
            no_listen,
            once,
        } => {
            commands::run::run(RunArgs {
                warp_dir,
                work_dir,
                refine2d,
                merge2d,
                poll_interval,
                no_listen,
                once,
            })
            .await
        }
        Command::Import {
            warp_dir,
            work_dir,
            full,
        } => {
            commands::import::run(ImportArgs {
                warp_dir,
                work_dir,
                full,
            })
            .await
        }
        Command::Status { work_dir, json } => commands::status::run(StatusArgs { work_dir, json }),
    };

    if let Err(e) = result {
        e.exit();
    }
}
