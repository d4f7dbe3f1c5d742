//! Discovery of frames in a directory and metadata-based selection.

use crate::header::FrameHeader;
use crate::store::{FrameStore, StoreError};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum CollectionError {
    #[error("path not found: {0}")]
    PathNotFound(PathBuf),
    #[error("path is not a directory: {0}")]
    NotADirectory(PathBuf),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A discovered frame: its location plus the metadata cached at discovery.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRef {
    pub path: PathBuf,
    pub header: FrameHeader,
    /// (rows, columns)
    pub shape: (usize, usize),
}

impl FrameRef {
    /// File name component, used to name derived products.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Conjunction of metadata tests. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameFilter {
    imagetyp: Option<String>,
    exptime: Option<f64>,
    exptime_range: Option<(f64, f64)>,
    view_pos_prefix: Option<String>,
    combined: Option<bool>,
}

impl FrameFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// `IMAGETYP` equal to `value`, compared case-insensitively.
    pub fn imagetyp(mut self, value: impl Into<String>) -> Self {
        self.imagetyp = Some(value.into());
        self
    }

    /// `EXPTIME` exactly equal to `seconds`.
    pub fn exptime(mut self, seconds: f64) -> Self {
        self.exptime = Some(seconds);
        self
    }

    /// `EXPTIME` within `[min, max]`.
    pub fn exptime_between(mut self, min: f64, max: f64) -> Self {
        self.exptime_range = Some((min, max));
        self
    }

    pub fn view_pos_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.view_pos_prefix = Some(prefix.into());
        self
    }

    /// Require the `combined` provenance flag to equal `value`.
    pub fn combined(mut self, value: bool) -> Self {
        self.combined = Some(value);
        self
    }

    pub fn matches(&self, header: &FrameHeader) -> bool {
        if let Some(imagetyp) = &self.imagetyp {
            if !header.is_imagetyp(imagetyp) {
                return false;
            }
        }
        if let Some(exptime) = self.exptime {
            if header.exptime != Some(exptime) {
                return false;
            }
        }
        if let Some((min, max)) = self.exptime_range {
            match header.exptime {
                Some(t) if t >= min && t <= max => {}
                _ => return false,
            }
        }
        if let Some(prefix) = &self.view_pos_prefix {
            if !header.view_pos_starts_with(prefix) {
                return false;
            }
        }
        if let Some(combined) = self.combined {
            if header.provenance.combined != combined {
                return false;
            }
        }
        true
    }
}

/// Ordered set of frames found directly inside one directory.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameCollection {
    dir: PathBuf,
    frames: Vec<FrameRef>,
}

impl FrameCollection {
    /// Scan `dir` and cache each frame's header.
    ///
    /// Files that cannot be read as frames are skipped with a warning.
    pub fn discover(store: &dyn FrameStore, dir: &Path) -> Result<Self, CollectionError> {
        if !store.exists(dir) {
            return Err(CollectionError::PathNotFound(dir.to_path_buf()));
        }
        if !store.is_dir(dir) {
            return Err(CollectionError::NotADirectory(dir.to_path_buf()));
        }

        let mut frames = Vec::new();
        for path in store.list_frames(dir)? {
            match store.read_info(&path) {
                Ok(info) => frames.push(FrameRef {
                    path,
                    header: info.header,
                    shape: info.shape,
                }),
                Err(e) => warn!("Skipping unreadable frame {}: {}", path.display(), e),
            }
        }
        debug!("Discovered {} frames in {}", frames.len(), dir.display());

        Ok(Self {
            dir: dir.to_path_buf(),
            frames,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FrameRef> {
        self.frames.iter()
    }

    /// Frames matching `filter`, in discovery order.
    pub fn filter(&self, filter: &FrameFilter) -> Vec<&FrameRef> {
        self.filter_by(|header| filter.matches(header))
    }

    /// Frames whose header satisfies `predicate`, in discovery order.
    pub fn filter_by<F>(&self, predicate: F) -> Vec<&FrameRef>
    where
        F: Fn(&FrameHeader) -> bool,
    {
        self.frames.iter().filter(|f| predicate(&f.header)).collect()
    }

    /// Distinct exposure times among frames matching `filter`, ascending.
    pub fn exposure_times(&self, filter: &FrameFilter) -> Vec<f64> {
        let mut times: Vec<f64> = self
            .filter(filter)
            .iter()
            .filter_map(|f| f.header.exptime)
            .collect();
        times.sort_by(f64::total_cmp);
        times.dedup();
        times
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::header::ImageType;
    use crate::store::MemoryStore;

    fn store_with_darks() -> MemoryStore {
        let store = MemoryStore::new();
        for (name, exptime) in [("d3.fits", 20.0), ("d1.fits", 10.0), ("d2.fits", 10.0)] {
            store.insert(
                format!("/darks/{name}"),
                Frame::constant((2, 2), 1.0, FrameHeader::new(ImageType::Dark, exptime)),
            );
        }
        let mut combined = FrameHeader::new(ImageType::Dark, 10.0);
        combined.provenance.combined = true;
        store.insert(
            "/darks/d0_master.fits",
            Frame::constant((2, 2), 1.0, combined),
        );
        store.insert(
            "/darks/f1.fits",
            Frame::constant((2, 2), 1.0, FrameHeader::new(ImageType::Flat, 1.0)),
        );
        store
    }

    #[test]
    fn test_discover_missing_path() {
        let store = MemoryStore::new();
        let err = FrameCollection::discover(&store, Path::new("/nope")).unwrap_err();
        assert!(matches!(err, CollectionError::PathNotFound(_)));
    }

    #[test]
    fn test_discover_file_is_not_directory() {
        let store = store_with_darks();
        let err = FrameCollection::discover(&store, Path::new("/darks/d1.fits")).unwrap_err();
        assert!(matches!(err, CollectionError::NotADirectory(_)));
    }

    #[test]
    fn test_filter_preserves_discovery_order() {
        let store = store_with_darks();
        let collection = FrameCollection::discover(&store, Path::new("/darks")).unwrap();
        assert_eq!(collection.len(), 5);

        let darks = collection.filter(&FrameFilter::new().imagetyp("DARK").combined(false));
        let names: Vec<_> = darks.iter().map(|f| f.file_name()).collect();
        assert_eq!(names, vec!["d1.fits", "d2.fits", "d3.fits"]);

        let ten = collection.filter(&FrameFilter::new().imagetyp("dark").exptime(10.0));
        assert_eq!(ten.len(), 3);
        assert_eq!(collection.len(), 5);
    }

    #[test]
    fn test_filter_exptime_range_and_prefix() {
        let store = MemoryStore::new();
        for (name, tag, t) in [("a.fits", "open1", 5.0), ("b.fits", "closed", 50.0)] {
            store.insert(
                format!("/sci/{name}"),
                Frame::constant(
                    (1, 1),
                    0.0,
                    FrameHeader::new(ImageType::Object, t).with_view_pos(tag),
                ),
            );
        }
        let collection = FrameCollection::discover(&store, Path::new("/sci")).unwrap();
        assert_eq!(
            collection
                .filter(&FrameFilter::new().exptime_between(0.0, 10.0))
                .len(),
            1
        );
        let open = collection.filter(&FrameFilter::new().view_pos_prefix("open"));
        assert_eq!(open[0].file_name(), "a.fits");
    }

    #[test]
    fn test_exposure_times_sorted_unique() {
        let store = store_with_darks();
        let collection = FrameCollection::discover(&store, Path::new("/darks")).unwrap();
        let times = collection.exposure_times(&FrameFilter::new().imagetyp("dark"));
        assert_eq!(times, vec![10.0, 20.0]);
    }
}
