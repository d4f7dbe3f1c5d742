//! Test helpers for the CCD reduction workspace
//!
//! Synthetic frames, raw run directory layouts in any [`FrameStore`], and
//! one-time log setup for tests.

use frames::{Frame, FrameHeader, FrameStore, ImageType};
use ndarray::Array2;
use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

static LOGGING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
});

/// Route `tracing` output through the test harness. Safe to call from
/// every test.
pub fn init_test_logging() {
    Lazy::force(&LOGGING);
}

/// Frame of Gaussian noise around `mean`, reproducible from `seed`.
pub fn noise_frame(
    shape: (usize, usize),
    mean: f64,
    std_dev: f64,
    seed: u64,
    header: FrameHeader,
) -> Frame {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(mean, std_dev).expect("Invalid noise parameters");
    let data = Array2::from_shape_simple_fn(shape, || normal.sample(&mut rng));
    Frame::new(data, header)
}

/// Header as written by the camera: upper-case `IMAGETYP`.
pub fn raw_header(kind: ImageType, exptime: f64) -> FrameHeader {
    let mut header = FrameHeader::new(kind, exptime);
    header.imagetyp = header.imagetyp.map(|t| t.to_ascii_uppercase());
    header
}

/// Raw frame directories of one observing run.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRun {
    pub bias: PathBuf,
    pub dark: PathBuf,
    pub flat: PathBuf,
    pub science: PathBuf,
}

impl RawRun {
    /// `bias/`, `dark/`, `flat/` and `science/` under `root`, created in
    /// `store`.
    pub fn create(store: &dyn FrameStore, root: &Path) -> Self {
        let run = Self {
            bias: root.join("bias"),
            dark: root.join("dark"),
            flat: root.join("flat"),
            science: root.join("science"),
        };
        for dir in [&run.bias, &run.dark, &run.flat, &run.science] {
            store
                .create_dir_all(dir)
                .expect("Failed to create raw frame directory");
        }
        run
    }

    /// Write `frame` as `dir/name` and return its path.
    pub fn add(&self, store: &dyn FrameStore, dir: &Path, name: &str, frame: &Frame) -> PathBuf {
        let path = dir.join(name);
        store
            .write_frame(&path, frame)
            .expect("Failed to write raw frame");
        path
    }
}

/// The reference run: an all-zero bias, two darks of 2 ADU at 10 s, two
/// flats of 100.2 ADU at 1 s (100 ADU once the scaled dark is removed) and
/// two identical science frames of 50 ADU at 10 s tagged `open1`/`open2`.
pub fn reference_run(store: &dyn FrameStore, root: &Path, shape: (usize, usize)) -> RawRun {
    let run = RawRun::create(store, root);
    run.add(
        store,
        &run.bias,
        "bias_001.fits",
        &Frame::constant(shape, 0.0, raw_header(ImageType::Bias, 0.0)),
    );
    for i in 1..=2 {
        run.add(
            store,
            &run.dark,
            &format!("dark_{i:03}.fits"),
            &Frame::constant(shape, 2.0, raw_header(ImageType::Dark, 10.0)),
        );
        run.add(
            store,
            &run.flat,
            &format!("flat_{i:03}.fits"),
            &Frame::constant(shape, 100.2, raw_header(ImageType::Flat, 1.0)),
        );
        run.add(
            store,
            &run.science,
            &format!("science_{i:03}.fits"),
            &Frame::constant(
                shape,
                50.0,
                raw_header(ImageType::Object, 10.0).with_view_pos(format!("open{i}")),
            ),
        );
    }
    run
}

/// Scratch directory on disk, removed when the returned guard drops.
pub fn scratch_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create scratch directory")
}

#[cfg(test)]
mod tests {
    use super::*;
    use frames::MemoryStore;

    #[test]
    fn test_noise_frame_is_reproducible() {
        let a = noise_frame((8, 8), 100.0, 5.0, 42, FrameHeader::default());
        let b = noise_frame((8, 8), 100.0, 5.0, 42, FrameHeader::default());
        let c = noise_frame((8, 8), 100.0, 5.0, 43, FrameHeader::default());
        assert_eq!(a.data, b.data);
        assert_ne!(a.data, c.data);
    }

    #[test]
    fn test_raw_header_is_upper_case() {
        let header = raw_header(ImageType::Dark, 10.0);
        assert_eq!(header.imagetyp.as_deref(), Some("DARK"));
        assert_eq!(header.image_type(), Some(ImageType::Dark));
    }

    #[test]
    fn test_reference_run_layout() {
        let store = MemoryStore::new();
        let run = reference_run(&store, Path::new("/night"), (4, 4));
        assert_eq!(store.len(), 7);
        assert_eq!(store.list_frames(&run.science).unwrap().len(), 2);
        let science = store.get(&run.science.join("science_002.fits")).unwrap();
        assert_eq!(science.header.view_pos.as_deref(), Some("open2"));
    }
}
