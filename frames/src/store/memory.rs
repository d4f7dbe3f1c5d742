use super::{check_row_range, is_frame_file, FrameInfo, FrameStore, StoreError};
use crate::frame::Frame;
use ndarray::{s, Array2};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Frame store held entirely in memory.
///
/// Mirrors the directory semantics of the on-disk store closely enough that
/// the pipeline behaves identically: writes need an existing parent
/// directory and listings are per-directory and sorted.
#[derive(Debug, Default)]
pub struct MemoryStore {
    frames: Mutex<BTreeMap<PathBuf, Frame>>,
    dirs: Mutex<BTreeSet<PathBuf>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `frame` at `path`, creating parent directories as needed.
    pub fn insert(&self, path: impl Into<PathBuf>, frame: Frame) {
        let path = path.into();
        if let Some(parent) = path.parent() {
            self.add_dirs(parent);
        }
        self.frames().insert(path, frame);
    }

    /// Copy of the frame stored at `path`.
    pub fn get(&self, path: &Path) -> Option<Frame> {
        self.frames().get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.frames().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All stored paths, sorted.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.frames().keys().cloned().collect()
    }

    fn frames(&self) -> MutexGuard<'_, BTreeMap<PathBuf, Frame>> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn dirs(&self) -> MutexGuard<'_, BTreeSet<PathBuf>> {
        self.dirs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn add_dirs(&self, dir: &Path) {
        let mut dirs = self.dirs();
        for ancestor in dir.ancestors() {
            if ancestor.as_os_str().is_empty() {
                continue;
            }
            dirs.insert(ancestor.to_path_buf());
        }
    }

    fn lookup(&self, path: &Path) -> Result<Frame, StoreError> {
        self.get(path)
            .ok_or_else(|| StoreError::NotFound(path.to_path_buf()))
    }
}

impl FrameStore for MemoryStore {
    fn exists(&self, path: &Path) -> bool {
        self.is_dir(path) || self.frames().contains_key(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.dirs().contains(path)
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), StoreError> {
        if self.frames().contains_key(path) {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "a frame exists at this path",
                ),
            });
        }
        self.add_dirs(path);
        Ok(())
    }

    fn list_frames(&self, dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
        if !self.is_dir(dir) {
            return Err(StoreError::NotFound(dir.to_path_buf()));
        }
        Ok(self
            .frames()
            .keys()
            .filter(|p| p.parent() == Some(dir) && is_frame_file(p))
            .cloned()
            .collect())
    }

    fn read_info(&self, path: &Path) -> Result<FrameInfo, StoreError> {
        let frames = self.frames();
        let frame = frames
            .get(path)
            .ok_or_else(|| StoreError::NotFound(path.to_path_buf()))?;
        Ok(FrameInfo {
            header: frame.header.clone(),
            shape: frame.shape(),
        })
    }

    fn read_frame(&self, path: &Path) -> Result<Frame, StoreError> {
        self.lookup(path)
    }

    fn read_rows(
        &self,
        path: &Path,
        start: usize,
        count: usize,
    ) -> Result<Array2<f64>, StoreError> {
        let frames = self.frames();
        let frame = frames
            .get(path)
            .ok_or_else(|| StoreError::NotFound(path.to_path_buf()))?;
        check_row_range(path, start, count, frame.shape().0)?;
        Ok(frame.data.slice(s![start..start + count, ..]).to_owned())
    }

    fn write_frame(&self, path: &Path, frame: &Frame) -> Result<(), StoreError> {
        let parent_ok = path
            .parent()
            .map(|p| p.as_os_str().is_empty() || self.is_dir(p))
            .unwrap_or(true);
        if !parent_ok {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "parent directory does not exist",
                ),
            });
        }
        // Uncertainty is not persisted with the frame, same as on disk.
        let mut stored = frame.clone();
        stored.uncertainty = None;
        self.frames().insert(path.to_path_buf(), stored);
        Ok(())
    }
}
