//! The growing monolithic particle stack.
//!
//! Warp exports particles as many small per-micrograph MRC stacks; cisTEM
//! wants one monolithic stack plus one table. This module owns that combined
//! stack file and its incremental-append protocol: new particles are copied
//! in at exact byte offsets, the image count is patched afterwards, and the
//! final byte length is asserted against the header formula so a partial
//! write can never go unnoticed.
//!
//! Warp writes headers before data finishes, so a source stack that fails
//! validation is treated as still-being-written and retried on a fixed
//! interval before the import fails hard.
//!
//! Everything here is blocking file I/O; the controller runs imports through
//! `spawn_blocking`.

use crate::mrc::{patch_image_count, MrcError, MrcHeader};
use crate::star::{load_table, write_cistem_table, StarError};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Default bound on validation retries per source stack.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 12;

/// Default wait between validation retries.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Errors from the incremental import.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Star(#[from] StarError),

    #[error(transparent)]
    Mrc(#[from] MrcError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Producer export has no rows to seed a stack from
    #[error("producer table {0} has no particles")]
    EmptyExport(PathBuf),

    /// Source stack header never matched the rows referencing it
    #[error("source stack {path} declares {declared} images where the table references {expected}")]
    SourceCountMismatch {
        path: PathBuf,
        declared: i64,
        expected: usize,
    },

    /// Source stack never reached its declared byte length
    #[error("source stack {path} is incomplete ({actual} of {expected} bytes)")]
    SourceIncomplete {
        path: PathBuf,
        actual: u64,
        expected: u64,
    },

    /// Combined stack byte length disagrees with the header formula
    #[error("combined stack {path} is {actual} bytes, expected {expected}")]
    SizeInvariant {
        path: PathBuf,
        actual: u64,
        expected: u64,
    },
}

impl ImportError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Tuning for the source-stack validation retry loop.
///
/// The defaults match the producer's observed writing cadence; tests shrink
/// them.
#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub retry_attempts: u32,
    pub retry_interval: Duration,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

/// Appends newly picked particles to the combined stack and rewrites the
/// paired cisTEM table.
///
/// Steps, in order: load the producer export (the authoritative row order),
/// seed the combined stack by copying the first source file if none exists
/// yet (or a full reimport is forced), work out how many rows are new from
/// the combined header's image count, copy each new source stack's images in
/// at the exact byte offset, assert the byte-length invariant, patch the
/// image count, and serialize the full table. Returns the total particle
/// count.
///
/// Importing with zero new rows leaves the stack untouched and rewrites the
/// table with identical content.
pub fn import_new_particles(
    stack_label: &str,
    producer_dir: &Path,
    producer_table: &str,
    work_dir: &Path,
    force_full_reimport: bool,
    options: &ImportOptions,
) -> Result<usize, ImportError> {
    info!(producer_table, "combining particle stacks from producer");

    let export_path = producer_dir.join(producer_table);
    let table = load_table(&export_path)?;
    let sources: Vec<&str> = table
        .column_values(&export_path, "rlnImageName")?
        .into_iter()
        .map(|name| name.rsplit('@').next().unwrap_or(name))
        .collect();
    if sources.is_empty() {
        return Err(ImportError::EmptyExport(export_path));
    }

    std::fs::create_dir_all(work_dir).map_err(|e| ImportError::io(work_dir, e))?;
    let combined = work_dir.join(format!("{stack_label}.mrcs"));

    if force_full_reimport {
        info!("full reimport forced; reseeding the combined stack");
    }
    if !combined.exists() || force_full_reimport {
        let seed = producer_dir.join(sources[0]);
        info!(seed = %seed.display(), "seeding combined stack from first source file");
        std::fs::copy(&seed, &combined).map_err(|e| ImportError::io(&seed, e))?;
    }

    let header = MrcHeader::read_from(&combined)?;
    let previous = header.nz as usize;
    let total = table.len();
    let slice_bytes = header.slice_bytes(&combined)?;
    info!(previous, total, "importing {} new particles", total.saturating_sub(previous));

    if total > previous {
        let dest = OpenOptions::new()
            .write(true)
            .open(&combined)
            .map_err(|e| ImportError::io(&combined, e))?;
        let runs = contiguous_runs(&sources[previous..]);
        let mut appended: u64 = 0;
        for (index, (source, run_len)) in runs.iter().enumerate() {
            let source_path = producer_dir.join(source);
            let src_header = validate_source(&source_path, *run_len, options)?;
            copy_images(
                &source_path,
                &src_header,
                &dest,
                &combined,
                header.data_offset() + slice_bytes * (previous as u64 + appended),
            )?;
            info!(
                source = %source_path.display(),
                "source {} of {} contributed {} particles starting at offset {}",
                index + 1,
                runs.len(),
                run_len,
                previous as u64 + appended,
            );
            appended += *run_len as u64;
        }
        dest.sync_all().map_err(|e| ImportError::io(&combined, e))?;
    }

    // The core consistency check: a partial append must never survive.
    let actual = std::fs::metadata(&combined)
        .map_err(|e| ImportError::io(&combined, e))?
        .len();
    let expected = header.expected_file_size(&combined, total as u64)?;
    if actual != expected {
        return Err(ImportError::SizeInvariant {
            path: combined,
            actual,
            expected,
        });
    }
    patch_image_count(&combined, total as u64)?;

    let table_path = work_dir.join(format!("{stack_label}.star"));
    write_cistem_table(&table, &table_path)?;
    info!(table = %table_path.display(), total, "import complete");

    Ok(total)
}

/// Collapses an ordered filename list into `(filename, run_length)` runs.
///
/// Each source stack contributes one contiguous block of rows; the producer
/// export preserves that ordering.
fn contiguous_runs<'a>(sources: &[&'a str]) -> Vec<(&'a str, usize)> {
    let mut runs: Vec<(&str, usize)> = Vec::new();
    for source in sources {
        match runs.last_mut() {
            Some((name, len)) if name == source => *len += 1,
            _ => runs.push((source, 1)),
        }
    }
    runs
}

/// Validates one source stack against the rows referencing it, retrying on
/// a fixed interval while the producer may still be writing.
///
/// Two checks: the declared image count must equal the referencing row
/// count, and the file's byte length must match the header formula exactly.
/// The header lands on disk before the data does, so either failing is
/// treated as transient until the attempt budget runs out.
fn validate_source(
    path: &Path,
    expected_images: usize,
    options: &ImportOptions,
) -> Result<MrcHeader, ImportError> {
    let mut attempt: u32 = 0;
    loop {
        let outcome = check_source(path, expected_images);
        match outcome {
            Ok(header) => return Ok(header),
            Err(error) => {
                if attempt >= options.retry_attempts {
                    return Err(error);
                }
                warn!(
                    source = %path.display(),
                    attempt,
                    %error,
                    "source stack not ready; waiting for producer"
                );
                attempt += 1;
                std::thread::sleep(options.retry_interval);
            }
        }
    }
}

fn check_source(path: &Path, expected_images: usize) -> Result<MrcHeader, ImportError> {
    let header = MrcHeader::read_from(path)?;
    if header.nz as usize != expected_images {
        return Err(ImportError::SourceCountMismatch {
            path: path.to_path_buf(),
            declared: header.nz as i64,
            expected: expected_images,
        });
    }
    let expected = header.expected_file_size(path, header.nz as u64)?;
    let actual = std::fs::metadata(path)
        .map_err(|e| ImportError::io(path, e))?
        .len();
    if actual != expected {
        return Err(ImportError::SourceIncomplete {
            path: path.to_path_buf(),
            actual,
            expected,
        });
    }
    Ok(header)
}

/// Copies all image bytes of a validated source stack into the combined
/// stack at `dest_offset`.
fn copy_images(
    source_path: &Path,
    source_header: &MrcHeader,
    mut dest: &File,
    dest_path: &Path,
    dest_offset: u64,
) -> Result<(), ImportError> {
    let bytes = source_header.slice_bytes(source_path)? * source_header.nz as u64;
    let mut src = File::open(source_path).map_err(|e| ImportError::io(source_path, e))?;
    src.seek(SeekFrom::Start(source_header.data_offset()))
        .map_err(|e| ImportError::io(source_path, e))?;
    dest.seek(SeekFrom::Start(dest_offset))
        .map_err(|e| ImportError::io(dest_path, e))?;
    let copied = std::io::copy(&mut (&mut src).take(bytes), &mut dest)
        .map_err(|e| ImportError::io(dest_path, e))?;
    if copied != bytes {
        return Err(ImportError::SourceIncomplete {
            path: source_path.to_path_buf(),
            actual: copied,
            expected: bytes,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_contiguous_runs() {
        let sources = ["a.mrcs", "a.mrcs", "b.mrcs", "b.mrcs", "b.mrcs", "c.mrcs"];
        assert_eq!(
            contiguous_runs(&sources),
            vec![("a.mrcs", 2), ("b.mrcs", 3), ("c.mrcs", 1)]
        );
        assert!(contiguous_runs(&[]).is_empty());
    }

    fn write_source_stack(path: &Path, nx: i32, ny: i32, nz: i32, fill: f32) {
        let mut raw = vec![0u8; 1024];
        raw[0..4].copy_from_slice(&nx.to_le_bytes());
        raw[4..8].copy_from_slice(&ny.to_le_bytes());
        raw[8..12].copy_from_slice(&nz.to_le_bytes());
        raw[12..16].copy_from_slice(&2i32.to_le_bytes());
        raw[72..76].copy_from_slice(&nz.to_le_bytes());
        for _ in 0..(nx * ny * nz) {
            raw.extend_from_slice(&fill.to_le_bytes());
        }
        std::fs::write(path, raw).unwrap();
    }

    fn write_export(path: &Path, entries: &[(&str, usize)]) {
        let mut f = File::create(path).unwrap();
        write!(
            f,
            "\ndata_\n\nloop_\n_rlnImageName #1\n_rlnDefocusU #2\n_rlnDefocusV #3\n\
             _rlnDefocusAngle #4\n_rlnDetectorPixelSize #5\n_rlnVoltage #6\n\
             _rlnSphericalAberration #7\n_rlnAmplitudeContrast #8\n"
        )
        .unwrap();
        for (source, count) in entries {
            for i in 0..*count {
                writeln!(
                    f,
                    "{:06}@{} 12000 11500 45.0 1.2007 300 2.7 0.07",
                    i + 1,
                    source
                )
                .unwrap();
            }
        }
    }

    fn fast_options() -> ImportOptions {
        ImportOptions {
            retry_attempts: 1,
            retry_interval: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_first_import_builds_stack_and_table() {
        let dir = tempfile::TempDir::new().unwrap();
        let producer = dir.path().join("warp");
        let work = dir.path().join("work");
        std::fs::create_dir_all(&producer).unwrap();
        write_source_stack(&producer.join("s1.mrcs"), 4, 4, 2, 1.0);
        write_source_stack(&producer.join("s2.mrcs"), 4, 4, 3, 2.0);
        write_export(
            &producer.join("allparticles.star"),
            &[("s1.mrcs", 2), ("s2.mrcs", 3)],
        );

        let total = import_new_particles(
            "combined_stack",
            &producer,
            "allparticles.star",
            &work,
            false,
            &fast_options(),
        )
        .unwrap();
        assert_eq!(total, 5);

        let combined = work.join("combined_stack.mrcs");
        let header = MrcHeader::read_from(&combined).unwrap();
        assert_eq!(header.nz, 5);
        assert_eq!(
            std::fs::metadata(&combined).unwrap().len(),
            header.expected_file_size(&combined, 5).unwrap()
        );
        assert_eq!(
            crate::star::count_data_rows(&work.join("combined_stack.star")).unwrap(),
            5
        );
    }

    #[test]
    fn test_source_count_mismatch_fails_after_retries() {
        let dir = tempfile::TempDir::new().unwrap();
        let producer = dir.path().join("warp");
        let work = dir.path().join("work");
        std::fs::create_dir_all(&producer).unwrap();
        // Table says 3 particles; the stack only ever holds 2.
        write_source_stack(&producer.join("s1.mrcs"), 4, 4, 2, 1.0);
        write_source_stack(&producer.join("s2.mrcs"), 4, 4, 2, 1.0);
        write_export(
            &producer.join("allparticles.star"),
            &[("s1.mrcs", 2), ("s2.mrcs", 3)],
        );

        let result = import_new_particles(
            "combined_stack",
            &producer,
            "allparticles.star",
            &work,
            false,
            &fast_options(),
        );
        assert!(matches!(
            result,
            Err(ImportError::SourceCountMismatch { declared: 2, expected: 3, .. })
        ));
    }

    #[test]
    fn test_truncated_source_fails_after_retries() {
        let dir = tempfile::TempDir::new().unwrap();
        let producer = dir.path().join("warp");
        let work = dir.path().join("work");
        std::fs::create_dir_all(&producer).unwrap();
        write_source_stack(&producer.join("s1.mrcs"), 4, 4, 2, 1.0);
        write_source_stack(&producer.join("s2.mrcs"), 4, 4, 2, 1.0);
        // Chop the tail off the second stack: header says 2 images but the
        // bytes for the second image are missing.
        let complete = std::fs::metadata(producer.join("s2.mrcs")).unwrap().len();
        let file = OpenOptions::new()
            .write(true)
            .open(producer.join("s2.mrcs"))
            .unwrap();
        file.set_len(complete - 4 * 4 * 4).unwrap();
        write_export(
            &producer.join("allparticles.star"),
            &[("s1.mrcs", 2), ("s2.mrcs", 2)],
        );

        let result = import_new_particles(
            "combined_stack",
            &producer,
            "allparticles.star",
            &work,
            false,
            &fast_options(),
        );
        assert!(matches!(result, Err(ImportError::SourceIncomplete { .. })));
    }
}
