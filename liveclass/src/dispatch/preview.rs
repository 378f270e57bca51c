//! Class-average preview rendering.
//!
//! After every merge the fresh class-average stack is rendered into one
//! grayscale PNG per class, under `class_images/<cycle name>/` in the
//! working directory. The gallery views serve these files directly; nothing
//! downstream reads the MRC data again.

use crate::mrc::{MrcError, MrcHeader};
use image::GrayImage;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors rendering class previews.
#[derive(Debug, Error)]
pub enum PreviewError {
    #[error(transparent)]
    Mrc(#[from] MrcError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot encode preview: {0}")]
    Image(#[from] image::ImageError),

    /// Class averages are always written as 32-bit float stacks
    #[error("class stack {path} has mode {mode}, expected 2 (f32)")]
    NotFloatStack { path: PathBuf, mode: i32 },
}

impl PreviewError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Renders every class in `<work_dir>/<cycle_name>.mrc` to
/// `<work_dir>/class_images/<cycle_name>/<class>.png` and returns that
/// directory.
///
/// Class numbering in filenames is 1-based to match the class labels in the
/// particle tables. Each image is min-max normalized independently; flat
/// (all-equal) classes render mid-gray.
pub fn render_class_previews(work_dir: &Path, cycle_name: &str) -> Result<PathBuf, PreviewError> {
    let stack_path = work_dir.join(format!("{cycle_name}.mrc"));
    let header = MrcHeader::read_from(&stack_path)?;
    if header.mode != 2 {
        return Err(PreviewError::NotFloatStack {
            path: stack_path,
            mode: header.mode,
        });
    }

    let preview_dir = work_dir.join("class_images").join(cycle_name);
    std::fs::create_dir_all(&preview_dir).map_err(|e| PreviewError::io(&preview_dir, e))?;

    let file = File::open(&stack_path).map_err(|e| PreviewError::io(&stack_path, e))?;
    let mut reader = BufReader::new(file);
    reader
        .seek(SeekFrom::Start(header.data_offset()))
        .map_err(|e| PreviewError::io(&stack_path, e))?;

    let pixels_per_slice = header.nx as usize * header.ny as usize;
    let mut raw = vec![0u8; pixels_per_slice * 4];
    for class in 0..header.nz {
        reader
            .read_exact(&mut raw)
            .map_err(|e| PreviewError::io(&stack_path, e))?;
        let slice: Vec<f32> = raw
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        let image = normalize_to_image(&slice, header.nx as u32, header.ny as u32);
        image.save(preview_dir.join(format!("{}.png", class + 1)))?;
    }

    debug!(
        classes = header.nz,
        dir = %preview_dir.display(),
        "rendered class previews"
    );
    Ok(preview_dir)
}

fn normalize_to_image(slice: &[f32], width: u32, height: u32) -> GrayImage {
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for &value in slice {
        if value.is_finite() {
            min = min.min(value);
            max = max.max(value);
        }
    }
    let range = max - min;
    let pixels: Vec<u8> = slice
        .iter()
        .map(|&value| {
            if !value.is_finite() || range <= 0.0 {
                127
            } else {
                ((value - min) / range * 255.0) as u8
            }
        })
        .collect();
    // Dimensions match the pixel count by construction.
    GrayImage::from_raw(width, height, pixels)
        .unwrap_or_else(|| GrayImage::new(width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mrc::HEADER_BYTES;

    /// Writes a mode-2 stack whose slice `i` is a gradient offset by `i`.
    fn write_class_stack(path: &Path, nx: i32, ny: i32, nz: i32) {
        let mut raw = vec![0u8; HEADER_BYTES as usize];
        raw[0..4].copy_from_slice(&nx.to_le_bytes());
        raw[4..8].copy_from_slice(&ny.to_le_bytes());
        raw[8..12].copy_from_slice(&nz.to_le_bytes());
        raw[12..16].copy_from_slice(&2i32.to_le_bytes());
        raw[72..76].copy_from_slice(&nz.to_le_bytes());
        for z in 0..nz {
            for p in 0..(nx * ny) {
                raw.extend_from_slice(&((z * 100 + p) as f32).to_le_bytes());
            }
        }
        std::fs::write(path, raw).unwrap();
    }

    #[test]
    fn test_renders_one_png_per_class() {
        let dir = tempfile::TempDir::new().unwrap();
        write_class_stack(&dir.path().join("cycle_2.mrc"), 8, 8, 3);

        let preview_dir = render_class_previews(dir.path(), "cycle_2").unwrap();

        assert_eq!(preview_dir, dir.path().join("class_images/cycle_2"));
        for class in 1..=3 {
            let png = preview_dir.join(format!("{class}.png"));
            assert!(png.exists(), "missing {}", png.display());
        }
        assert!(!preview_dir.join("4.png").exists());
    }

    #[test]
    fn test_normalize_spans_full_range() {
        let image = normalize_to_image(&[0.0, 0.5, 1.0, 0.25], 2, 2);
        let pixels: Vec<u8> = image.pixels().map(|p| p.0[0]).collect();
        assert_eq!(pixels[0], 0);
        assert_eq!(pixels[2], 255);
    }

    #[test]
    fn test_flat_class_renders_mid_gray() {
        let image = normalize_to_image(&[3.0; 4], 2, 2);
        assert!(image.pixels().all(|p| p.0[0] == 127));
    }

    #[test]
    fn test_rejects_non_float_stack() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cycle_0.mrc");
        let mut raw = vec![0u8; HEADER_BYTES as usize];
        raw[0..4].copy_from_slice(&4i32.to_le_bytes());
        raw[4..8].copy_from_slice(&4i32.to_le_bytes());
        raw[8..12].copy_from_slice(&1i32.to_le_bytes());
        raw[12..16].copy_from_slice(&1i32.to_le_bytes()); // i16 stack
        std::fs::write(&path, raw).unwrap();

        assert!(matches!(
            render_class_previews(dir.path(), "cycle_0"),
            Err(PreviewError::NotFloatStack { mode: 1, .. })
        ));
    }
}
