//! Frame persistence.
//!
//! The pipeline never touches the filesystem directly: every read and write
//! of a frame goes through a [`FrameStore`]. [`crate::io::fits::FitsStore`]
//! persists frames as FITS images on disk, [`memory::MemoryStore`] keeps them
//! in a map for tests and dry runs.

pub mod memory;

use crate::frame::Frame;
use crate::header::FrameHeader;
use ndarray::Array2;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use memory::MemoryStore;

/// File extensions recognised as frames during discovery.
pub const FRAME_EXTENSIONS: [&str; 3] = ["fits", "fit", "fts"];

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("FITS error on {path}: {source}")]
    Fits {
        path: PathBuf,
        #[source]
        source: fitsio::errors::Error,
    },
    #[error("no frame stored at {0}")]
    NotFound(PathBuf),
    #[error("no 2-D image HDU in {0}")]
    NoImage(PathBuf),
    #[error("invalid image shape in {path}: {reason}")]
    BadShape { path: PathBuf, reason: String },
    #[error("rows {start}..{end} out of range for {path} with {rows} rows")]
    RowRange {
        path: PathBuf,
        start: usize,
        end: usize,
        rows: usize,
    },
}

/// Header and pixel dimensions of a stored frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameInfo {
    pub header: FrameHeader,
    /// (rows, columns)
    pub shape: (usize, usize),
}

/// Backend holding frames addressed by path.
///
/// Writes are whole-frame: a frame is either fully present at its path or
/// replaced by a newer complete frame, never partially updated.
pub trait FrameStore: Send + Sync {
    fn exists(&self, path: &Path) -> bool;

    fn is_dir(&self, path: &Path) -> bool;

    fn create_dir_all(&self, path: &Path) -> Result<(), StoreError>;

    /// Frames directly inside `dir` (not recursive), sorted by file name.
    fn list_frames(&self, dir: &Path) -> Result<Vec<PathBuf>, StoreError>;

    fn read_info(&self, path: &Path) -> Result<FrameInfo, StoreError>;

    fn read_frame(&self, path: &Path) -> Result<Frame, StoreError>;

    /// Read `count` rows starting at `start` as a (count, columns) array.
    fn read_rows(&self, path: &Path, start: usize, count: usize)
        -> Result<Array2<f64>, StoreError>;

    fn write_frame(&self, path: &Path, frame: &Frame) -> Result<(), StoreError>;
}

/// True if the file name carries one of [`FRAME_EXTENSIONS`].
pub fn is_frame_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            FRAME_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

pub(crate) fn check_row_range(
    path: &Path,
    start: usize,
    count: usize,
    rows: usize,
) -> Result<(), StoreError> {
    let end = start.saturating_add(count);
    if end > rows {
        return Err(StoreError::RowRange {
            path: path.to_path_buf(),
            start,
            end,
            rows,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_frame_file() {
        assert!(is_frame_file(Path::new("a/dark_001.fits")));
        assert!(is_frame_file(Path::new("a/dark_001.FIT")));
        assert!(is_frame_file(Path::new("flat.fts")));
        assert!(!is_frame_file(Path::new("notes.txt")));
        assert!(!is_frame_file(Path::new("cali_dark")));
    }

    #[test]
    fn test_row_range_check() {
        assert!(check_row_range(Path::new("x.fits"), 0, 4, 4).is_ok());
        let err = check_row_range(Path::new("x.fits"), 2, 4, 4).unwrap_err();
        assert!(err.to_string().contains("rows 2..6 out of range"));
    }
}
