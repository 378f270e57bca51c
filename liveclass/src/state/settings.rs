//! Typed classification settings.
//!
//! The persisted state used to be a free-form dictionary; these are the
//! explicit, typed fields with serde defaults acting as the migration step
//! when loading an older state file (missing optional fields default
//! instead of failing the load).

use serde::{Deserialize, Serialize};

/// How the next run treats previous class assignments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassificationType {
    /// Start from randomly seeded classes, no prior assignments
    #[serde(rename = "abinit")]
    AbInitio,
    /// Continue from a previous cycle's class assignments
    Seeded,
    /// One-shot refinement at the final resolution only
    Refine,
}

impl Default for ClassificationType {
    fn default() -> Self {
        Self::AbInitio
    }
}

/// User-facing classification settings, persisted inside the run state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Particle box size in pixels, taken from the producer
    #[serde(default)]
    pub box_size: u32,
    /// Picking score cutoff, taken from the producer
    #[serde(default)]
    pub score_cutoff: f64,
    /// Picking model identifier, taken from the producer
    #[serde(default)]
    pub picking_model: String,
    /// Pixel size in Angstroms
    #[serde(default = "default_pixel_size")]
    pub pixel_size: f64,
    /// Mask radius in Angstroms
    #[serde(default = "default_mask_radius")]
    pub mask_radius: f64,
    /// High-resolution limit for the first startup cycle, in Angstroms
    #[serde(default = "default_high_res_initial")]
    pub high_res_initial: f64,
    /// High-resolution limit for refinement, in Angstroms
    #[serde(default = "default_high_res_final")]
    pub high_res_final: f64,
    /// Number of startup cycles walking the resolution ladder
    #[serde(default = "default_run_count_startup")]
    pub run_count_startup: u32,
    /// Number of refinement cycles at the final resolution
    #[serde(default = "default_run_count_refine")]
    pub run_count_refine: u32,
    #[serde(default)]
    pub classification_type: ClassificationType,
    /// New-particle threshold that fires the very first job
    #[serde(default = "default_particle_count_initial")]
    pub particle_count_initial: u64,
    /// New-particle threshold that fires subsequent jobs
    #[serde(default = "default_particle_count_update")]
    pub particle_count_update: u64,
    /// Center class averages on their center of mass
    #[serde(default = "default_true")]
    pub autocenter: bool,
    /// Automatically mask class averages
    #[serde(default)]
    pub automask: bool,
    /// Number of classes
    #[serde(default = "default_class_number")]
    pub class_number: usize,
    /// Target particles per class, drives the sampling fraction
    #[serde(default = "default_particles_per_class")]
    pub particles_per_class: usize,
}

impl Default for Settings {
    fn default() -> Self {
        // Field defaults are the serde defaults so that a missing settings
        // object and a missing field behave identically.
        serde_json::from_str("{}").unwrap_or_else(|_| unreachable!())
    }
}

fn default_pixel_size() -> f64 {
    1.0
}

fn default_mask_radius() -> f64 {
    150.0
}

fn default_high_res_initial() -> f64 {
    40.0
}

fn default_high_res_final() -> f64 {
    8.0
}

fn default_run_count_startup() -> u32 {
    15
}

fn default_run_count_refine() -> u32 {
    5
}

fn default_particle_count_initial() -> u64 {
    15_000
}

fn default_particle_count_update() -> u64 {
    50_000
}

fn default_true() -> bool {
    true
}

fn default_class_number() -> usize {
    50
}

fn default_particles_per_class() -> usize {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.high_res_initial, 40.0);
        assert_eq!(settings.high_res_final, 8.0);
        assert_eq!(settings.run_count_startup, 15);
        assert_eq!(settings.run_count_refine, 5);
        assert_eq!(settings.class_number, 50);
        assert_eq!(settings.particles_per_class, 300);
        assert_eq!(settings.classification_type, ClassificationType::AbInitio);
        assert!(settings.autocenter);
        assert!(!settings.automask);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        // Older persisted states may predate newer fields; they default.
        let settings: Settings =
            serde_json::from_str(r#"{"class_number": 32, "high_res_final": 10.0}"#).unwrap();
        assert_eq!(settings.class_number, 32);
        assert_eq!(settings.high_res_final, 10.0);
        assert_eq!(settings.run_count_startup, 15);
        assert_eq!(settings.particle_count_update, 50_000);
    }

    #[test]
    fn test_classification_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&ClassificationType::AbInitio).unwrap(),
            "\"abinit\""
        );
        assert_eq!(
            serde_json::from_str::<ClassificationType>("\"seeded\"").unwrap(),
            ClassificationType::Seeded
        );
        assert_eq!(
            serde_json::from_str::<ClassificationType>("\"refine\"").unwrap(),
            ClassificationType::Refine
        );
    }
}
