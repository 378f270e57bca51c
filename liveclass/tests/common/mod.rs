//! Shared fixtures for integration tests: a fake producer directory and a
//! classification backend that fabricates plausible outputs.

// Each test binary uses a different subset of these fixtures.
#![allow(dead_code)]

use async_trait::async_trait;
use liveclass::dispatch::{ClassifierBackend, DispatchError, MergeRequest, RefineRequest};
use liveclass::state::SharedState;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Writes a minimal mode-2 (f32) MRC stack of `nz` images.
pub fn write_stack(path: &Path, nx: i32, ny: i32, nz: i32, fill: f32) {
    let mut raw = vec![0u8; 1024];
    raw[0..4].copy_from_slice(&nx.to_le_bytes());
    raw[4..8].copy_from_slice(&ny.to_le_bytes());
    raw[8..12].copy_from_slice(&nz.to_le_bytes());
    raw[12..16].copy_from_slice(&2i32.to_le_bytes());
    raw[72..76].copy_from_slice(&nz.to_le_bytes());
    for _ in 0..(nx as usize * ny as usize * nz as usize) {
        raw.extend_from_slice(&fill.to_le_bytes());
    }
    std::fs::write(path, raw).unwrap();
}

/// Writes a Warp-style particle export table referencing per-micrograph
/// stacks, with every column the cisTEM table rewrite needs.
pub fn write_export(producer_dir: &Path, picking_model: &str, entries: &[(&str, usize)]) {
    let mut content = String::from(
        "\ndata_\n\nloop_\n\
         _rlnImageName #1\n\
         _rlnDefocusU #2\n\
         _rlnDefocusV #3\n\
         _rlnDefocusAngle #4\n\
         _rlnDetectorPixelSize #5\n\
         _rlnVoltage #6\n\
         _rlnSphericalAberration #7\n\
         _rlnAmplitudeContrast #8\n",
    );
    for (source, count) in entries {
        for i in 0..*count {
            content.push_str(&format!(
                "{:06}@{} 12000 11500 45.0 1.2007 300 2.7 0.07\n",
                i + 1,
                source
            ));
        }
    }
    std::fs::write(
        producer_dir.join(format!("allparticles_{picking_model}.star")),
        content,
    )
    .unwrap();
}

/// Writes a Warp `previous.settings` document with export enabled.
pub fn write_producer_settings(producer_dir: &Path, picking_model: &str) {
    let content = format!(
        r#"<?xml version="1.0"?>
<Settings>
  <Param Name="PixelSizeX" Value="0.6" />
  <Import>
    <Param Name="BinTimes" Value="1" />
  </Import>
  <Picking>
    <Param Name="DoExport" Value="True" />
    <Param Name="BoxSize" Value="64" />
    <Param Name="ModelPath" Value="{picking_model}" />
    <Param Name="MinimumScore" Value="0.35" />
    <Param Name="Diameter" Value="200" />
  </Picking>
</Settings>
"#
    );
    std::fs::write(producer_dir.join("previous.settings"), content).unwrap();
}

/// Backend whose every invocation fails, standing in for crashed workers.
pub struct FailingBackend;

#[async_trait]
impl ClassifierBackend for FailingBackend {
    async fn refine(&self, _request: &RefineRequest) -> Result<String, DispatchError> {
        Err(DispatchError::Backend {
            program: "refine2d".to_string(),
            message: "exited with signal 9".to_string(),
        })
    }

    async fn merge(&self, _request: &MergeRequest) -> Result<String, DispatchError> {
        Err(DispatchError::Backend {
            program: "merge2d".to_string(),
            message: "exited with signal 9".to_string(),
        })
    }
}

/// Backend that writes believable partial tables, dump files, and class
/// stacks without running anything.
pub struct FakeBackend {
    pub class_count: i32,
    pub box_size: i32,
    /// Counts every refine invocation, seed calls included
    pub refine_calls: AtomicUsize,
    /// When set, the first merge flips the session's kill flag, simulating
    /// an operator kill landing mid-run
    pub kill_on_first_merge: Option<SharedState>,
    killed_once: AtomicBool,
}

impl FakeBackend {
    pub fn new(class_count: i32, box_size: i32) -> Arc<Self> {
        Arc::new(Self {
            class_count,
            box_size,
            refine_calls: AtomicUsize::new(0),
            kill_on_first_merge: None,
            killed_once: AtomicBool::new(false),
        })
    }

    pub fn killing_after_first_merge(
        class_count: i32,
        box_size: i32,
        state: SharedState,
    ) -> Arc<Self> {
        Arc::new(Self {
            class_count,
            box_size,
            refine_calls: AtomicUsize::new(0),
            kill_on_first_merge: Some(state),
            killed_once: AtomicBool::new(false),
        })
    }

    fn write_class_stack(&self, path: &Path) {
        write_stack(path, self.box_size, self.box_size, self.class_count, 0.5);
    }
}

#[async_trait]
impl ClassifierBackend for FakeBackend {
    async fn refine(&self, request: &RefineRequest) -> Result<String, DispatchError> {
        self.refine_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(table) = &request.output_table {
            let mut content = String::from(
                " \ndata_\n \nloop_\n_cisTEMPositionInStack #1\n_cisTEMBest2DClass #2\n",
            );
            for position in request.first_particle..=request.last_particle {
                content.push_str(&format!(
                    "{position}\t{}\n",
                    position % self.class_count as usize + 1
                ));
            }
            std::fs::write(table, content).unwrap();
        }
        if let Some(dump) = &request.dump_file {
            std::fs::write(dump, b"dump").unwrap();
        }
        if request.new_class_count > 0 {
            self.write_class_stack(&request.output_classes);
        }
        Ok(String::new())
    }

    async fn merge(&self, request: &MergeRequest) -> Result<String, DispatchError> {
        self.write_class_stack(&request.output_classes);
        if let Some(state) = &self.kill_on_first_merge {
            if !self.killed_once.swap(true, Ordering::SeqCst) {
                state.lock().await.kill_job = true;
            }
        }
        Ok(String::new())
    }
}
