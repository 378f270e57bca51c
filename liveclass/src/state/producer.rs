//! Producer (Warp) settings sync.
//!
//! Warp drops a `previous.settings` document next to its exports: flat,
//! machine-written XML where every value is a `<Param Name="…" Value="…"/>`
//! attribute pair. We only ever need a handful of those pairs, so they are
//! scraped with anchored regexes rather than a full XML parse.
//!
//! Drift in any of box size, picking model, or score cutoff means the
//! existing particle stack no longer matches what the producer will export;
//! that is not an error, it forces the next run ab-initio with a full
//! reimport.

use super::run_state::RunState;
use super::settings::Settings;
use regex::Regex;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Name of the producer's settings document inside its export directory.
pub const PRODUCER_SETTINGS_FILE: &str = "previous.settings";

/// Errors reading the producer's settings.
#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("cannot read producer settings {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The producer is not exporting particles at all
    #[error("particle export is disabled in {0}")]
    ExportDisabled(PathBuf),

    /// A required attribute pair is absent
    #[error("attribute {name} missing from {path}")]
    MissingAttribute { path: PathBuf, name: String },

    /// An attribute value failed to parse as a number
    #[error("attribute {name} has unparseable value {value:?}")]
    BadValue { name: String, value: String },
}

/// The producer-side values the orchestrator depends on.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerSettings {
    pub box_size: u32,
    pub picking_model: String,
    pub score_cutoff: f64,
    /// Effective pixel size after binning, in Angstroms
    pub pixel_size: f64,
    /// Mask radius derived from the picking diameter, in Angstroms
    pub mask_radius: f64,
}

impl ProducerSettings {
    /// Name of the producer's all-particles export table for this model.
    pub fn export_table_name(&self) -> String {
        export_table_name(&self.picking_model)
    }
}

/// Name of the producer's all-particles export table for a picking model.
pub fn export_table_name(picking_model: &str) -> String {
    format!("allparticles_{picking_model}.star")
}

fn attribute(content: &str, path: &Path, name: &str) -> Result<String, ProducerError> {
    // Machine-written attribute pair, always Name before Value.
    let pattern = format!(r#"Name="{}"\s+Value="([^"]*)""#, regex::escape(name));
    let re = Regex::new(&pattern).unwrap_or_else(|_| unreachable!());
    re.captures(content)
        .map(|caps| caps[1].to_string())
        .ok_or_else(|| ProducerError::MissingAttribute {
            path: path.to_path_buf(),
            name: name.to_string(),
        })
}

fn numeric_attribute(content: &str, path: &Path, name: &str) -> Result<f64, ProducerError> {
    let value = attribute(content, path, name)?;
    value.parse().map_err(|_| ProducerError::BadValue {
        name: name.to_string(),
        value,
    })
}

/// Reads and validates the producer's current settings.
///
/// Fails if the export flag is off: without particle export there is
/// nothing to classify. The effective pixel size is the raw pixel size
/// scaled by the binning factor (`2^BinTimes`); the mask radius is 75% of
/// the picking diameter (radius plus 50% head room).
pub fn read_producer_settings(producer_dir: &Path) -> Result<ProducerSettings, ProducerError> {
    let path = producer_dir.join(PRODUCER_SETTINGS_FILE);
    let content = std::fs::read_to_string(&path).map_err(|e| ProducerError::Io {
        path: path.clone(),
        source: e,
    })?;

    if attribute(&content, &path, "DoExport")? != "True" {
        return Err(ProducerError::ExportDisabled(path));
    }

    let box_size = numeric_attribute(&content, &path, "BoxSize")? as u32;
    let picking_model = attribute(&content, &path, "ModelPath")?;
    let score_cutoff = numeric_attribute(&content, &path, "MinimumScore")?;
    let raw_pixel_size = numeric_attribute(&content, &path, "PixelSizeX")?;
    let bin = numeric_attribute(&content, &path, "BinTimes")?;
    let diameter = numeric_attribute(&content, &path, "Diameter")?;

    Ok(ProducerSettings {
        box_size,
        picking_model,
        score_cutoff,
        pixel_size: raw_pixel_size * 2f64.powf(bin),
        mask_radius: (diameter * 0.75).floor(),
    })
}

/// Re-syncs the run state against the producer's latest settings.
///
/// Returns the fresh producer settings. If box size, picking model, or
/// score cutoff changed since the last run, the stale stack geometry is
/// flagged: `force_abinit` and `next_run_new_particles` are set and the
/// drifted values are adopted.
pub fn sync_from_producer(state: &mut RunState) -> Result<ProducerSettings, ProducerError> {
    let producer = read_producer_settings(&state.warp_folder)?;

    let mut drifted = false;
    if state.settings.box_size != producer.box_size {
        info!(old = state.settings.box_size, new = producer.box_size, "box size changed");
        state.settings.box_size = producer.box_size;
        drifted = true;
    }
    if state.settings.picking_model != producer.picking_model {
        info!(
            old = state.settings.picking_model,
            new = producer.picking_model,
            "picking model changed"
        );
        state.settings.picking_model = producer.picking_model.clone();
        drifted = true;
    }
    if state.settings.score_cutoff != producer.score_cutoff {
        info!(
            old = state.settings.score_cutoff,
            new = producer.score_cutoff,
            "score cutoff changed"
        );
        state.settings.score_cutoff = producer.score_cutoff;
        drifted = true;
    }
    if drifted {
        info!("producer settings drifted; forcing ab-initio and full reimport");
        state.force_abinit = true;
        state.next_run_new_particles = true;
    }
    Ok(producer)
}

/// Builds a fresh run state for a producer/working directory pair,
/// seeding the settings from the producer's current values.
pub fn create_run_state(
    producer_dir: &Path,
    working_directory: &Path,
) -> Result<RunState, ProducerError> {
    let producer = read_producer_settings(producer_dir)?;
    let settings = Settings {
        box_size: producer.box_size,
        score_cutoff: producer.score_cutoff,
        picking_model: producer.picking_model.clone(),
        pixel_size: producer.pixel_size,
        mask_radius: producer.mask_radius,
        ..Settings::default()
    };
    Ok(RunState::new(
        producer_dir.to_path_buf(),
        working_directory.to_path_buf(),
        settings,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<Settings>
  <Param Name="PixelSizeX" Value="0.6" />
  <Import>
    <Param Name="BinTimes" Value="1" />
  </Import>
  <Picking>
    <Param Name="DoExport" Value="True" />
    <Param Name="BoxSize" Value="128" />
    <Param Name="ModelPath" Value="BoxNet2Mask_20180918" />
    <Param Name="MinimumScore" Value="0.35" />
    <Param Name="Diameter" Value="200" />
  </Picking>
</Settings>
"#;

    fn producer_dir(content: &str) -> tempfile::TempDir {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join(PRODUCER_SETTINGS_FILE), content).unwrap();
        dir
    }

    #[test]
    fn test_read_producer_settings() {
        let dir = producer_dir(SAMPLE);
        let producer = read_producer_settings(dir.path()).unwrap();
        assert_eq!(producer.box_size, 128);
        assert_eq!(producer.picking_model, "BoxNet2Mask_20180918");
        assert_eq!(producer.score_cutoff, 0.35);
        assert_eq!(producer.pixel_size, 1.2); // 0.6 * 2^1
        assert_eq!(producer.mask_radius, 150.0); // 200 * 0.75
        assert_eq!(
            producer.export_table_name(),
            "allparticles_BoxNet2Mask_20180918.star"
        );
    }

    #[test]
    fn test_export_disabled() {
        let dir = producer_dir(&SAMPLE.replace(
            r#"Name="DoExport" Value="True""#,
            r#"Name="DoExport" Value="False""#,
        ));
        assert!(matches!(
            read_producer_settings(dir.path()),
            Err(ProducerError::ExportDisabled(_))
        ));
    }

    #[test]
    fn test_missing_attribute() {
        let dir = producer_dir(&SAMPLE.replace(r#"Name="BoxSize" Value="128""#, ""));
        assert!(matches!(
            read_producer_settings(dir.path()),
            Err(ProducerError::MissingAttribute { .. })
        ));
    }

    #[test]
    fn test_sync_detects_drift() {
        let dir = producer_dir(SAMPLE);
        let mut state = create_run_state(dir.path(), dir.path()).unwrap();
        assert!(!state.force_abinit);

        // No drift on a second sync against the same file.
        sync_from_producer(&mut state).unwrap();
        assert!(!state.force_abinit);
        assert!(!state.next_run_new_particles);

        // Changing the model forces ab-initio and full reimport.
        std::fs::write(
            dir.path().join(PRODUCER_SETTINGS_FILE),
            SAMPLE.replace("BoxNet2Mask_20180918", "BoxNet3"),
        )
        .unwrap();
        sync_from_producer(&mut state).unwrap();
        assert!(state.force_abinit);
        assert!(state.next_run_new_particles);
        assert_eq!(state.settings.picking_model, "BoxNet3");
    }
}
