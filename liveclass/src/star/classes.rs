//! Per-class particle tallies over classification output.

use super::{is_header_line, StarError};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Builds a histogram of particles per class from a classification table.
///
/// The last column of a cisTEM classification table holds the 1-based class
/// assignment, with negative values meaning "not classified this cycle".
/// Bucket 0 of the returned vector collects everything unclassified (any
/// label < 0 folds into it); bucket `n` counts the particles assigned to
/// class `n`. The result length is the highest class label seen plus one.
pub fn count_per_class(path: &Path) -> Result<Vec<u64>, StarError> {
    let file = File::open(path).map_err(|e| StarError::io(path, e))?;
    let reader = BufReader::new(file);

    let mut counts: Vec<u64> = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|e| StarError::io(path, e))?;
        if is_header_line(&line) {
            continue;
        }
        let label = line
            .split_whitespace()
            .last()
            .ok_or_else(|| StarError::BadClassLabel {
                path: path.to_path_buf(),
                value: String::new(),
            })?;
        let class: i64 = label.parse().map_err(|_| StarError::BadClassLabel {
            path: path.to_path_buf(),
            value: label.to_string(),
        })?;
        let bucket = if class < 0 { 0 } else { class as usize };
        if bucket >= counts.len() {
            counts.resize(bucket + 1, 0);
        }
        counts[bucket] += 1;
    }

    // A table with rows always has at least the unclassified bucket.
    if counts.is_empty() {
        counts.push(0);
    }
    Ok(counts)
}
