//! Import command - one-shot particle import.
//!
//! Pulls any new particles from the Warp export into the combined stack
//! without running classification. Useful for pre-staging a dataset or for
//! checking that the producer directory is healthy.

use std::path::PathBuf;

use liveclass::controller::STACK_LABEL;
use liveclass::stack::{import_new_particles, ImportOptions};
use liveclass::state::read_producer_settings;

use crate::error::CliError;

/// Arguments for the import command.
pub struct ImportArgs {
    pub warp_dir: PathBuf,
    pub work_dir: PathBuf,
    /// Rebuild the combined stack from scratch instead of appending
    pub full: bool,
}

/// Run the import command.
pub async fn run(args: ImportArgs) -> Result<(), CliError> {
    let producer = read_producer_settings(&args.warp_dir)?;
    println!("Importing from: {}", args.warp_dir.display());
    println!("  Picking model: {}", producer.picking_model);
    println!("  Export table:  {}", producer.export_table_name());

    std::fs::create_dir_all(&args.work_dir)
        .map_err(|e| CliError::Config(format!("cannot create working directory: {e}")))?;

    let (warp, work, table) = (
        args.warp_dir.clone(),
        args.work_dir.clone(),
        producer.export_table_name(),
    );
    let imported = tokio::task::spawn_blocking(move || {
        import_new_particles(
            STACK_LABEL,
            &warp,
            &table,
            &work,
            args.full,
            &ImportOptions::default(),
        )
    })
    .await
    .map_err(|e| CliError::Config(format!("import task failed: {e}")))??;

    println!();
    println!("✓ Imported {} new particles", imported);
    println!(
        "  Combined stack: {}",
        args.work_dir.join(format!("{STACK_LABEL}.mrcs")).display()
    );
    Ok(())
}
