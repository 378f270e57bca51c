//! Minimal MRC image-stack header codec.
//!
//! Particle stacks (both Warp's per-micrograph exports and our combined
//! stack) are MRC2014 files: a 1024-byte fixed header, an optional extended
//! header, then `nz` contiguous `nx`x`ny` images. The stack store only ever
//! needs the dimensions, the data mode, and the byte-layout formulas, so
//! this codec reads and patches exactly those fields and leaves pixel data
//! alone.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Size of the fixed MRC header in bytes.
pub const HEADER_BYTES: u64 = 1024;

// Byte offsets of the header fields we touch (all little-endian i32).
const OFFSET_NX: u64 = 0;
const OFFSET_NY: u64 = 4;
const OFFSET_NZ: u64 = 8;
const OFFSET_MODE: u64 = 12;
const OFFSET_MZ: u64 = 72;
const OFFSET_NSYMBT: u64 = 92;

/// Errors from reading or patching MRC headers.
#[derive(Debug, Error)]
pub enum MrcError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Data mode we have no element size for
    #[error("unsupported MRC mode {mode} in {path}")]
    UnsupportedMode { path: PathBuf, mode: i32 },

    /// Header declares negative dimensions
    #[error("invalid dimensions {nx}x{ny}x{nz} in {path}")]
    InvalidDimensions {
        path: PathBuf,
        nx: i32,
        ny: i32,
        nz: i32,
    },
}

impl MrcError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// The subset of an MRC header the stack store works with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrcHeader {
    /// Image width in pixels
    pub nx: i32,
    /// Image height in pixels
    pub ny: i32,
    /// Number of images in the stack
    pub nz: i32,
    /// Data mode (element type)
    pub mode: i32,
    /// Extended header length in bytes
    pub nsymbt: i32,
}

impl MrcHeader {
    /// Reads the header fields from the start of an MRC file.
    pub fn read_from(path: &Path) -> Result<Self, MrcError> {
        let mut file = File::open(path).map_err(|e| MrcError::io(path, e))?;
        let mut raw = [0u8; HEADER_BYTES as usize];
        file.read_exact(&mut raw).map_err(|e| MrcError::io(path, e))?;

        let field = |offset: u64| {
            let start = offset as usize;
            i32::from_le_bytes([raw[start], raw[start + 1], raw[start + 2], raw[start + 3]])
        };
        let header = Self {
            nx: field(OFFSET_NX),
            ny: field(OFFSET_NY),
            nz: field(OFFSET_NZ),
            mode: field(OFFSET_MODE),
            nsymbt: field(OFFSET_NSYMBT),
        };
        if header.nx < 0 || header.ny < 0 || header.nz < 0 {
            return Err(MrcError::InvalidDimensions {
                path: path.to_path_buf(),
                nx: header.nx,
                ny: header.ny,
                nz: header.nz,
            });
        }
        Ok(header)
    }

    /// Bytes per pixel for the header's data mode.
    ///
    /// Modes: 0 = i8, 1 = i16, 2 = f32, 6 = u16. Warp writes mode 2.
    pub fn element_size(&self, path: &Path) -> Result<u64, MrcError> {
        match self.mode {
            0 => Ok(1),
            1 | 6 => Ok(2),
            2 => Ok(4),
            mode => Err(MrcError::UnsupportedMode {
                path: path.to_path_buf(),
                mode,
            }),
        }
    }

    /// Byte offset of the first image: fixed header plus extended header.
    pub fn data_offset(&self) -> u64 {
        HEADER_BYTES + self.nsymbt as u64
    }

    /// Bytes occupied by one image slice.
    pub fn slice_bytes(&self, path: &Path) -> Result<u64, MrcError> {
        Ok(self.nx as u64 * self.ny as u64 * self.element_size(path)?)
    }

    /// The exact file size implied by the header for `count` images.
    ///
    /// `data_offset + nx * ny * count * element_size` — the consistency
    /// formula the stack store asserts after every append.
    pub fn expected_file_size(&self, path: &Path, count: u64) -> Result<u64, MrcError> {
        Ok(self.data_offset() + self.slice_bytes(path)? * count)
    }
}

/// Rewrites only the image-count fields (`nz` and `mz`) of an MRC file.
///
/// Pixel data and every other header field are untouched; this is the final
/// step of a stack append, once all new slices are in place.
pub fn patch_image_count(path: &Path, count: u64) -> Result<(), MrcError> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| MrcError::io(path, e))?;
    let bytes = (count as i32).to_le_bytes();
    for offset in [OFFSET_NZ, OFFSET_MZ] {
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| MrcError::io(path, e))?;
        file.write_all(&bytes).map_err(|e| MrcError::io(path, e))?;
    }
    Ok(())
}
