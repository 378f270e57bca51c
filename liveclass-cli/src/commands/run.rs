//! Run command - start a classification session.
//!
//! Loads (or creates) the session state, starts the job loop and the
//! particle listener, queues one job immediately, and then keeps running
//! until Ctrl-C. With `--once` the session runs a single job synchronously
//! and exits, which is what batch wrappers want.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use liveclass::controller::{
    Controller, JobQueue, JobRequest, NotificationHub, ParticleListener, StartReason,
};
use liveclass::dispatch::{CistemBackend, Dispatcher};
use liveclass::logging;
use liveclass::state::{create_run_state, RunState, SharedState, STATE_FILE};
use tokio::sync::Mutex;
use tracing::info;

use crate::error::CliError;

/// Arguments for the run command.
pub struct RunArgs {
    pub warp_dir: PathBuf,
    pub work_dir: PathBuf,
    pub refine2d: PathBuf,
    pub merge2d: PathBuf,
    pub poll_interval: u64,
    pub no_listen: bool,
    pub once: bool,
}

/// Run the run command.
pub async fn run(args: RunArgs) -> Result<(), CliError> {
    let state = load_or_create_state(&args)?;
    let logfile = state.logfile.clone();
    let _guard = logging::init_logging(&args.work_dir, &logfile)
        .map_err(|e| CliError::LoggingInit(e.to_string()))?;
    info!(
        version = liveclass::VERSION,
        warp = %args.warp_dir.display(),
        work = %args.work_dir.display(),
        "starting liveclass session"
    );

    let shared: SharedState = Arc::new(Mutex::new(state));
    let hub = NotificationHub::new();
    let backend = Arc::new(CistemBackend::with_binaries(
        args.refine2d.clone(),
        args.merge2d.clone(),
    ));
    let install_dir = std::env::current_dir().unwrap_or_else(|_| args.work_dir.clone());
    let controller = Arc::new(Controller::new(
        Arc::clone(&shared),
        Dispatcher::new(backend),
        hub.clone(),
        install_dir,
    ));

    if args.once {
        controller.run_job().await?;
        return Ok(());
    }

    let (queue, receiver) = JobQueue::new();
    let cancel = queue.cancellation_token();

    let listener_handle = if args.no_listen {
        None
    } else {
        let listener = ParticleListener::new(Arc::clone(&shared), queue.clone())
            .with_poll_interval(Duration::from_secs(args.poll_interval));
        Some(tokio::spawn(listener.run()))
    };

    let serve_controller = Arc::clone(&controller);
    let serve_cancel = cancel.clone();
    let serve_handle = tokio::spawn(async move {
        serve_controller.serve(receiver, serve_cancel).await;
    });

    queue.try_submit(JobRequest {
        reason: StartReason::Manual,
    });

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| CliError::Config(format!("cannot install Ctrl-C handler: {e}")))?;
    info!("shutdown requested");
    controller.request_kill().await;
    queue.shutdown();

    let _ = serve_handle.await;
    if let Some(handle) = listener_handle {
        let _ = handle.await;
    }
    info!("session closed");
    Ok(())
}

/// Loads the session from its state document, or creates a fresh one from
/// the producer's current settings.
fn load_or_create_state(args: &RunArgs) -> Result<RunState, CliError> {
    let state_path = args.work_dir.join(STATE_FILE);
    if state_path.exists() {
        let mut state = RunState::load(&state_path)?;
        // The directories on the command line win over the persisted ones,
        // so a moved dataset keeps its history.
        state.warp_folder = args.warp_dir.clone();
        state.working_directory = args.work_dir.clone();
        Ok(state)
    } else {
        Ok(create_run_state(&args.warp_dir, &args.work_dir)?)
    }
}
