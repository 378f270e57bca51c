//! Status command - summarize a session's persisted state.

use std::path::PathBuf;

use liveclass::state::{RunState, STATE_FILE};

use crate::error::CliError;

/// Arguments for the status command.
pub struct StatusArgs {
    pub work_dir: PathBuf,
    /// Emit the raw state document as JSON instead of a summary
    pub json: bool,
}

/// Run the status command.
pub fn run(args: StatusArgs) -> Result<(), CliError> {
    let state_path = args.work_dir.join(STATE_FILE);
    if !state_path.exists() {
        return Err(CliError::Config(format!(
            "no session found in {} (missing {})",
            args.work_dir.display(),
            STATE_FILE
        )));
    }
    let state = RunState::load(&state_path)?;

    if args.json {
        let json = serde_json::to_string_pretty(&state)
            .map_err(|e| CliError::Config(format!("cannot serialize state: {e}")))?;
        println!("{json}");
        return Ok(());
    }

    print_summary(&state);
    Ok(())
}

fn print_summary(state: &RunState) {
    println!("Session: {}", state.working_directory.display());
    println!("  Warp directory:  {}", state.warp_folder.display());
    println!("  Status:          {:?}", state.job_status);
    println!("  Picking model:   {}", state.settings.picking_model);
    println!(
        "  Classification:  {:?}, {} classes",
        state.settings.classification_type, state.settings.class_number
    );
    println!("  Particles:       {}", state.latest_particle_count());
    println!("  Cycles run:      {}", state.cycles.len());

    let mut recent: Vec<_> = state.cycles.iter().collect();
    recent.sort_by_key(|c| c.number);
    for cycle in recent.iter().rev().take(5).rev() {
        println!(
            "    {}  {:?} {}  {:.1} A  {:.0}% of {} particles  {}",
            cycle.name,
            cycle.block,
            cycle.cycle_number_in_block,
            cycle.high_res_limit,
            cycle.fraction_used * 100.0,
            cycle.particle_count,
            cycle.time.format("%Y-%m-%d %H:%M:%S"),
        );
    }
}
