//! Process-spawning backend for the classification binaries.
//!
//! The [`ClassifierBackend`] trait is the seam between cycle orchestration
//! and the actual `refine2d`/`merge2d` executables, so tests can drive the
//! dispatcher with a fake that fabricates outputs instead of forking
//! processes.

use super::params::{MergeRequest, RefineRequest};
use super::DispatchError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Executes classification sub-jobs.
#[async_trait]
pub trait ClassifierBackend: Send + Sync {
    /// Runs one `refine2d` invocation to completion, returning its stdout.
    async fn refine(&self, request: &RefineRequest) -> Result<String, DispatchError>;

    /// Runs one `merge2d` invocation to completion, returning its stdout.
    async fn merge(&self, request: &MergeRequest) -> Result<String, DispatchError>;
}

/// Backend that shells out to the cisTEM binaries.
#[derive(Debug, Clone)]
pub struct CistemBackend {
    refine_binary: PathBuf,
    merge_binary: PathBuf,
}

impl CistemBackend {
    /// Creates a backend resolving `refine2d` and `merge2d` via `PATH`.
    pub fn new() -> Self {
        Self::with_binaries(PathBuf::from("refine2d"), PathBuf::from("merge2d"))
    }

    /// Creates a backend with explicit binary locations.
    pub fn with_binaries(refine_binary: PathBuf, merge_binary: PathBuf) -> Self {
        Self {
            refine_binary,
            merge_binary,
        }
    }

    /// Spawns a binary, feeds it a parameter block on stdin, and waits.
    ///
    /// A non-zero exit is an error carrying the tail of stderr; the caller
    /// decides what the cycle does about it.
    async fn run_program(
        &self,
        binary: &std::path::Path,
        block: String,
    ) -> Result<String, DispatchError> {
        let program = binary.display().to_string();
        debug!(%program, "spawning classification sub-job");

        let mut child = Command::new(binary)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DispatchError::Backend {
                program: program.clone(),
                message: format!("failed to spawn: {e}"),
            })?;

        // stdin is piped above, so take() cannot return None here.
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(block.as_bytes())
                .await
                .map_err(|e| DispatchError::Backend {
                    program: program.clone(),
                    message: format!("failed to write parameter block: {e}"),
                })?;
            // Closing stdin lets the program see EOF after its last prompt.
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| DispatchError::Backend {
                program: program.clone(),
                message: format!("failed to wait: {e}"),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DispatchError::Backend {
                program,
                message: format!("exited with {}: {}", output.status, stderr.trim_end()),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for CistemBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClassifierBackend for CistemBackend {
    async fn refine(&self, request: &RefineRequest) -> Result<String, DispatchError> {
        self.run_program(&self.refine_binary, request.to_parameter_block())
            .await
    }

    async fn merge(&self, request: &MergeRequest) -> Result<String, DispatchError> {
        self.run_program(&self.merge_binary, request.to_parameter_block())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[tokio::test]
    async fn test_missing_binary_is_a_backend_error() {
        let backend = CistemBackend::with_binaries(
            PathBuf::from("/nonexistent/refine2d"),
            PathBuf::from("/nonexistent/merge2d"),
        );
        let request = MergeRequest {
            output_classes: PathBuf::from("/tmp/out.mrc"),
            dump_file_base: PathBuf::from("/tmp/dump_file_.dat"),
            worker_count: 1,
        };
        let err = backend.merge(&request).await.unwrap_err();
        assert!(matches!(err, DispatchError::Backend { .. }));
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_parameter_block_reaches_stdin() {
        // `cat` echoes the block back, standing in for a cooperative binary.
        let backend = CistemBackend::with_binaries(PathBuf::from("cat"), PathBuf::from("cat"));
        let request = super::super::params::worker_request(
            Path::new("/work"),
            Path::new("/work/combined_stack.mrcs"),
            Path::new("/work/cycle_1.star"),
            1,
            0,
            1,
            100,
            1.0,
            1.0,
            150.0,
            300.0,
            40.0,
            15.0,
            49.5,
            false,
            true,
        );
        let stdout = backend.refine(&request).await.unwrap();
        assert_eq!(stdout, request.to_parameter_block());
    }
}
