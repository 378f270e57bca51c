//! STAR particle table codec.
//!
//! Both Warp's particle export and cisTEM's classification output use the
//! STAR text format: a header block (`data_` / `loop_` markers followed by
//! `_label` lines) and whitespace-delimited data rows. Tables routinely hold
//! hundreds of thousands of rows, so every counting operation streams the
//! file instead of loading it.
//!
//! [`is_header_line`] is the single source of truth for the header/data
//! distinction. Every scan in this crate (counting, appending, class
//! tallying) goes through it so the different views of a table can never
//! disagree about which lines are data.

mod append;
mod classes;
mod table;
mod writer;

pub use append::append_rows;
pub use classes::count_per_class;
pub use table::{count_data_rows, load_table, ParticleTable};
pub use writer::{write_cistem_table, CISTEM_FIELDS};

use std::path::PathBuf;
use thiserror::Error;

/// Errors from parsing or writing STAR tables.
#[derive(Debug, Error)]
pub enum StarError {
    /// Underlying file I/O failed
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No `loop_` marker found in the header block
    #[error("no loop_ marker in {0}")]
    MissingLoop(PathBuf),

    /// A required column is absent from the table
    #[error("column {column} missing from {path}")]
    MissingColumn { path: PathBuf, column: String },

    /// Class label column held something that is not an integer
    #[error("unparseable class label {value:?} in {path}")]
    BadClassLabel { path: PathBuf, value: String },
}

impl StarError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Classifies one line of a STAR file as header (or comment/blank) versus data.
///
/// Header lines are: label lines (leading `_`), comments (leading `#`),
/// the `data_` and `loop_` block markers, and blank/whitespace-only lines.
/// Everything else is a data row.
pub fn is_header_line(line: &str) -> bool {
    line.starts_with('_')
        || line.starts_with('#')
        || line.starts_with("data_")
        || line.starts_with("loop_")
        || line.trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_prefixes_are_headers() {
        assert!(is_header_line("_cisTEMPositionInStack #1"));
        assert!(is_header_line("# a comment"));
        assert!(is_header_line("data_"));
        assert!(is_header_line("data_particles"));
        assert!(is_header_line("loop_"));
    }

    #[test]
    fn test_blank_lines_are_headers() {
        assert!(is_header_line(""));
        assert!(is_header_line("   "));
        assert!(is_header_line("\t"));
    }

    #[test]
    fn test_data_rows_are_not_headers() {
        assert!(!is_header_line("1 0.00 -0.00 12000.0"));
        assert!(!is_header_line("000001@stack_01.mrcs 1.2007"));
        // A leading space does not make a non-empty row a header
        assert!(!is_header_line(" 1 0.00"));
    }
}
