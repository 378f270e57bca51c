//! Table loading and streaming row counting.

use super::{is_header_line, StarError};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// An in-memory STAR table: named columns plus rows of string fields.
///
/// Values stay as strings so a load/store round trip is lossless; callers
/// parse the handful of numeric fields they actually need. Row order is
/// significant: a particle's 0-based row index plus one is its position in
/// the paired image stack.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticleTable {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl ParticleTable {
    /// Number of data rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Column names, in file order, with the leading `_` stripped.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Index of a named column, if present.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// The raw field at `(row, column-name)`, if both exist.
    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx).map(String::as_str)
    }

    /// All values of one column, in row order.
    ///
    /// Returns an error naming the column if it does not exist; rows too
    /// short to reach the column contribute an empty string.
    pub fn column_values(&self, path: &Path, column: &str) -> Result<Vec<&str>, StarError> {
        let idx = self
            .column_index(column)
            .ok_or_else(|| StarError::MissingColumn {
                path: path.to_path_buf(),
                column: column.to_string(),
            })?;
        Ok(self
            .rows
            .iter()
            .map(|row| row.get(idx).map(String::as_str).unwrap_or(""))
            .collect())
    }
}

/// Counts the data rows of a STAR file in one streaming pass.
///
/// Used both for "how many particles total" and for the listener's "how
/// many particles since the last run", so it must not load the file into
/// memory.
pub fn count_data_rows(path: &Path) -> Result<usize, StarError> {
    let file = File::open(path).map_err(|e| StarError::io(path, e))?;
    let reader = BufReader::new(file);
    let mut count = 0;
    for line in reader.lines() {
        let line = line.map_err(|e| StarError::io(path, e))?;
        if !is_header_line(&line) {
            count += 1;
        }
    }
    Ok(count)
}

/// Loads a single-loop STAR file into a [`ParticleTable`].
///
/// Scans to the `loop_` marker, collects the `_label` lines that follow
/// (leading underscore stripped, trailing `#N` column index discarded),
/// then parses everything that is not a header line as a
/// whitespace-delimited data row.
pub fn load_table(path: &Path) -> Result<ParticleTable, StarError> {
    let file = File::open(path).map_err(|e| StarError::io(path, e))?;
    let reader = BufReader::new(file);
    let mut lines = reader.lines();

    // Skip to the loop_ marker.
    loop {
        match lines.next() {
            Some(line) => {
                let line = line.map_err(|e| StarError::io(path, e))?;
                if line.starts_with("loop_") {
                    break;
                }
            }
            None => return Err(StarError::MissingLoop(path.to_path_buf())),
        }
    }

    let mut columns = Vec::new();
    let mut rows = Vec::new();
    let mut in_labels = true;
    for line in lines {
        let line = line.map_err(|e| StarError::io(path, e))?;
        if in_labels && line.starts_with('_') {
            // "_rlnImageName #3" -> "rlnImageName"
            let label = line
                .split_whitespace()
                .next()
                .unwrap_or(&line)
                .trim_start_matches('_')
                .to_string();
            columns.push(label);
            continue;
        }
        in_labels = false;
        if is_header_line(&line) {
            continue;
        }
        rows.push(line.split_whitespace().map(str::to_string).collect());
    }

    Ok(ParticleTable { columns, rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_star(dir: &tempfile::TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    const SAMPLE: &str = "\n\
data_\n\
\n\
loop_\n\
_rlnImageName #1\n\
_rlnDefocusU #2\n\
_rlnDefocusV #3\n\
000001@stack_01.mrcs 12000.0 11500.0\n\
000002@stack_01.mrcs 12000.0 11500.0\n\
000001@stack_02.mrcs 13250.0 13000.0\n";

    #[test]
    fn test_load_table_columns_and_rows() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_star(&dir, "sample.star", SAMPLE);
        let table = load_table(&path).unwrap();
        assert_eq!(
            table.columns(),
            &["rlnImageName", "rlnDefocusU", "rlnDefocusV"]
        );
        assert_eq!(table.len(), 3);
        assert_eq!(table.value(2, "rlnDefocusU"), Some("13250.0"));
    }

    #[test]
    fn test_count_matches_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_star(&dir, "sample.star", SAMPLE);
        let table = load_table(&path).unwrap();
        assert_eq!(count_data_rows(&path).unwrap(), table.len());
    }

    #[test]
    fn test_missing_loop_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_star(&dir, "noloop.star", "data_\n_rlnImageName #1\n");
        assert!(matches!(
            load_table(&path),
            Err(StarError::MissingLoop(_))
        ));
    }

    #[test]
    fn test_column_values_missing_column() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_star(&dir, "sample.star", SAMPLE);
        let table = load_table(&path).unwrap();
        let err = table.column_values(&path, "rlnVoltage").unwrap_err();
        assert!(matches!(err, StarError::MissingColumn { .. }));
    }
}
