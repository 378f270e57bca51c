//! Parameter blocks for the external classification binaries.
//!
//! `refine2d` and `merge2d` read their parameters as a newline-joined text
//! block over standard input, in a strictly fixed field order. The order
//! encodes the programs' interactive prompts; changing it breaks the
//! invocation silently, so it lives in exactly one place per program and is
//! pinned by tests.

use std::path::{Path, PathBuf};

/// Placeholder path for "no file" slots in the parameter block.
const NULL_PATH: &str = "/dev/null";

fn yes_no(value: bool) -> &'static str {
    if value {
        "Yes"
    } else {
        "No"
    }
}

fn path_or_null(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => path.display().to_string(),
        None => NULL_PATH.to_string(),
    }
}

/// One `refine2d` invocation: either a worker's slice of a classification
/// cycle or the ab-initio class seeding call.
#[derive(Debug, Clone)]
pub struct RefineRequest {
    pub input_stack: PathBuf,
    pub input_table: PathBuf,
    /// Class averages from the previous cycle; `None` when seeding
    pub input_classes: Option<PathBuf>,
    /// Partial output table; `None` when seeding
    pub output_table: Option<PathBuf>,
    pub output_classes: PathBuf,
    /// Number of classes to generate; nonzero only when seeding
    pub new_class_count: usize,
    /// 1-based inclusive particle range; `0` for last means "to the end"
    pub first_particle: usize,
    pub last_particle: usize,
    pub sampling_fraction: f64,
    pub pixel_size: f64,
    pub mask_radius: f64,
    pub low_res_limit: f64,
    pub high_res_limit: f64,
    pub angular_search_step: f64,
    pub max_search_range: f64,
    pub smoothing_factor: f64,
    pub automask: bool,
    pub autocenter: bool,
    /// Per-worker class-sum dump; `None` when seeding
    pub dump_file: Option<PathBuf>,
}

impl RefineRequest {
    /// Serializes the request in `refine2d`'s prompt order.
    pub fn to_parameter_block(&self) -> String {
        let lines: Vec<String> = vec![
            self.input_stack.display().to_string(),
            self.input_table.display().to_string(),
            path_or_null(&self.input_classes),
            path_or_null(&self.output_table),
            self.output_classes.display().to_string(),
            self.new_class_count.to_string(),
            self.first_particle.to_string(),
            self.last_particle.to_string(),
            format!("{:.2}", self.sampling_fraction),
            self.pixel_size.to_string(),
            self.mask_radius.to_string(),
            self.low_res_limit.to_string(),
            self.high_res_limit.to_string(),
            self.angular_search_step.to_string(),
            self.max_search_range.to_string(),
            format!("{:.2}", self.smoothing_factor),
            "2".to_string(), // padding factor
            "Yes".to_string(), // normalize
            "Yes".to_string(), // invert contrast
            "No".to_string(),  // exclude blank edges
            yes_no(self.automask).to_string(),
            yes_no(self.autocenter).to_string(),
            yes_no(self.dump_file.is_some()).to_string(),
            self.dump_file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "No.dat".to_string()),
            "1".to_string(), // max threads; parallelism is ours, not refine2d's
        ];
        lines.join("\n")
    }
}

/// One `merge2d` invocation combining per-worker dump files into a single
/// class-average stack.
#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub output_classes: PathBuf,
    /// Base dump filename; `merge2d` substitutes worker numbers before `.dat`
    pub dump_file_base: PathBuf,
    pub worker_count: usize,
}

impl MergeRequest {
    /// Serializes the request in `merge2d`'s prompt order.
    pub fn to_parameter_block(&self) -> String {
        [
            self.output_classes.display().to_string(),
            self.dump_file_base.display().to_string(),
            self.worker_count.to_string(),
        ]
        .join("\n")
    }
}

/// The dump file a given 0-based worker writes (`merge2d` numbers from 1).
pub fn dump_file_name(worker: usize) -> String {
    format!("dump_file_{}.dat", worker + 1)
}

/// The base dump filename handed to `merge2d`.
pub fn dump_file_base() -> &'static str {
    "dump_file_.dat"
}

/// The partial table a given worker writes for a given output cycle.
pub fn partial_table_name(output_cycle: u32, worker: usize) -> String {
    format!("partial_classes_{}_{}.star", output_cycle, worker)
}

#[allow(clippy::too_many_arguments)]
pub(super) fn worker_request(
    work_dir: &Path,
    input_stack: &Path,
    input_table: &Path,
    input_cycle: u32,
    worker: usize,
    first_particle: usize,
    last_particle: usize,
    sampling_fraction: f64,
    pixel_size: f64,
    mask_radius: f64,
    low_res_limit: f64,
    high_res_limit: f64,
    angular_search_step: f64,
    max_search_range: f64,
    automask: bool,
    autocenter: bool,
) -> RefineRequest {
    RefineRequest {
        input_stack: input_stack.to_path_buf(),
        input_table: input_table.to_path_buf(),
        input_classes: Some(work_dir.join(format!("cycle_{input_cycle}.mrc"))),
        output_table: Some(work_dir.join(partial_table_name(input_cycle + 1, worker))),
        output_classes: work_dir.join(format!("cycle_{}.mrc", input_cycle + 1)),
        new_class_count: 0,
        first_particle,
        last_particle,
        sampling_fraction,
        pixel_size,
        mask_radius,
        low_res_limit,
        high_res_limit,
        angular_search_step,
        max_search_range,
        smoothing_factor: 1.0,
        automask,
        autocenter,
        dump_file: Some(work_dir.join(dump_file_name(worker))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refine_parameter_block_order() {
        let request = worker_request(
            Path::new("/work"),
            Path::new("/work/combined_stack.mrcs"),
            Path::new("/work/cycle_3.star"),
            3,
            5,
            161,
            192,
            0.25,
            1.2007,
            150.0,
            300.0,
            16.5,
            15.0,
            49.5,
            false,
            true,
        );
        let block = request.to_parameter_block();
        let lines: Vec<&str> = block.lines().collect();
        assert_eq!(lines.len(), 25);
        assert_eq!(lines[0], "/work/combined_stack.mrcs");
        assert_eq!(lines[1], "/work/cycle_3.star");
        assert_eq!(lines[2], "/work/cycle_3.mrc");
        assert_eq!(lines[3], "/work/partial_classes_4_5.star");
        assert_eq!(lines[4], "/work/cycle_4.mrc");
        assert_eq!(lines[5], "0"); // no new classes during refinement
        assert_eq!(lines[6], "161");
        assert_eq!(lines[7], "192");
        assert_eq!(lines[8], "0.25");
        assert_eq!(lines[12], "16.5");
        assert_eq!(lines[17], "Yes"); // normalize
        assert_eq!(lines[20], "No"); // automask
        assert_eq!(lines[21], "Yes"); // autocenter
        assert_eq!(lines[22], "Yes"); // dump enabled for workers
        assert_eq!(lines[23], "/work/dump_file_6.dat");
        assert_eq!(lines[24], "1");
    }

    #[test]
    fn test_seed_parameter_block_uses_null_slots() {
        let request = RefineRequest {
            input_stack: PathBuf::from("/work/combined_stack.mrcs"),
            input_table: PathBuf::from("/work/cycle_0.star"),
            input_classes: None,
            output_table: None,
            output_classes: PathBuf::from("/work/cycle_0.mrc"),
            new_class_count: 50,
            first_particle: 1,
            last_particle: 0,
            sampling_fraction: 1.0,
            pixel_size: 1.2007,
            mask_radius: 150.0,
            low_res_limit: 300.0,
            high_res_limit: 40.0,
            angular_search_step: 0.0,
            max_search_range: 0.0,
            smoothing_factor: 1.0,
            automask: false,
            autocenter: true,
            dump_file: None,
        };
        let lines: Vec<String> = request
            .to_parameter_block()
            .lines()
            .map(str::to_string)
            .collect();
        assert_eq!(lines[2], "/dev/null");
        assert_eq!(lines[3], "/dev/null");
        assert_eq!(lines[5], "50");
        assert_eq!(lines[7], "0"); // last particle 0 = whole stack
        assert_eq!(lines[8], "1.00");
        assert_eq!(lines[22], "No"); // no dump when seeding
        assert_eq!(lines[23], "No.dat");
    }

    #[test]
    fn test_merge_parameter_block() {
        let request = MergeRequest {
            output_classes: PathBuf::from("/work/cycle_4.mrc"),
            dump_file_base: PathBuf::from("/work/dump_file_.dat"),
            worker_count: 32,
        };
        assert_eq!(
            request.to_parameter_block(),
            "/work/cycle_4.mrc\n/work/dump_file_.dat\n32"
        );
    }
}
