//! Offset-based table append for incremental refinement.

use super::{is_header_line, StarError};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Appends the new rows of `new_path` after the full contents of `old_path`.
///
/// All of `old_path` (header included) is written to `out_path` verbatim,
/// followed by only those data rows of `new_path` that come after the first
/// `rowCount(old)` data rows. Returns the total data row count of the output.
///
/// This lets a classification output table (which carries class assignments
/// in its rows) absorb freshly imported, still-unclassified particles while
/// keeping every existing assignment.
///
/// The merge is positional, not keyed: `new_path` must be a superset
/// extension of `old_path` with an identical common prefix of data rows. The
/// producer's export is append-only and order-preserving, which is what makes
/// this valid; if the upstream picker ever re-scores, reorders, or drops
/// particles, the class labels would silently misalign with their particles.
pub fn append_rows(old_path: &Path, new_path: &Path, out_path: &Path) -> Result<usize, StarError> {
    let out = File::create(out_path).map_err(|e| StarError::io(out_path, e))?;
    let mut out = BufWriter::new(out);

    let old = File::open(old_path).map_err(|e| StarError::io(old_path, e))?;
    let mut old_rows = 0usize;
    for line in BufReader::new(old).lines() {
        let line = line.map_err(|e| StarError::io(old_path, e))?;
        if !is_header_line(&line) {
            old_rows += 1;
        }
        out.write_all(line.as_bytes())
            .and_then(|_| out.write_all(b"\n"))
            .map_err(|e| StarError::io(out_path, e))?;
    }

    let new = File::open(new_path).map_err(|e| StarError::io(new_path, e))?;
    let mut new_rows = 0usize;
    let mut appended = 0usize;
    for line in BufReader::new(new).lines() {
        let line = line.map_err(|e| StarError::io(new_path, e))?;
        if is_header_line(&line) {
            continue;
        }
        new_rows += 1;
        if new_rows > old_rows {
            out.write_all(line.as_bytes())
                .and_then(|_| out.write_all(b"\n"))
                .map_err(|e| StarError::io(out_path, e))?;
            appended += 1;
        }
    }
    out.flush().map_err(|e| StarError::io(out_path, e))?;

    Ok(old_rows + appended)
}
