//! FITS persistence for calibration frames
//!
//! Frames are written as a single primary image HDU of doubles carrying the
//! pipeline's header keywords. Reading accepts any file whose first 2-D
//! image HDU holds the pixels, which covers raw instrument output as well as
//! products written here.

use crate::frame::Frame;
use crate::header::{
    FrameHeader, Provenance, ADU_UNIT, KEY_BUNIT, KEY_EXPTIME, KEY_IMAGETYP, KEY_VIEW_POS,
    PASSTHROUGH_KEYS,
};
use crate::store::{check_row_range, is_frame_file, FrameInfo, FrameStore, StoreError};
use fitsio::hdu::FitsHdu;
use fitsio::images::{ImageDescription, ImageType};
use fitsio::FitsFile;
use ndarray::Array2;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Suffix of the scratch file a frame is written to before being renamed
/// into place.
const PARTIAL_SUFFIX: &str = "partial";

/// Frame store backed by FITS files on the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FitsStore;

impl FitsStore {
    pub fn new() -> Self {
        Self
    }
}

fn fits_err(path: &Path) -> impl FnOnce(fitsio::errors::Error) -> StoreError + '_ {
    move |source| StoreError::Fits {
        path: path.to_path_buf(),
        source,
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Locate the first HDU holding a 2-D image and return it with its
/// (rows, columns).
fn open_image_hdu(fptr: &mut FitsFile, path: &Path) -> Result<(FitsHdu, (usize, usize)), StoreError> {
    let mut hdu_idx = 0;
    while let Ok(hdu) = fptr.hdu(hdu_idx) {
        let naxis = hdu.read_key::<i64>(fptr, "NAXIS").unwrap_or(0);
        if naxis == 2 {
            let naxis1 = hdu.read_key::<i64>(fptr, "NAXIS1").unwrap_or(0);
            let naxis2 = hdu.read_key::<i64>(fptr, "NAXIS2").unwrap_or(0);
            if naxis1 <= 0 || naxis2 <= 0 {
                return Err(StoreError::BadShape {
                    path: path.to_path_buf(),
                    reason: format!("NAXIS1={naxis1}, NAXIS2={naxis2}"),
                });
            }
            return Ok((hdu, (naxis2 as usize, naxis1 as usize)));
        }
        hdu_idx += 1;
    }
    Err(StoreError::NoImage(path.to_path_buf()))
}

/// Read the recognised keywords from `hdu`. Missing keywords stay unset.
fn read_header(fptr: &mut FitsFile, hdu: &FitsHdu) -> FrameHeader {
    let mut header = FrameHeader {
        imagetyp: hdu.read_key::<String>(fptr, KEY_IMAGETYP).ok(),
        exptime: hdu.read_key::<f64>(fptr, KEY_EXPTIME).ok(),
        view_pos: hdu.read_key::<String>(fptr, KEY_VIEW_POS).ok(),
        ..Default::default()
    };

    // CFITSIO converts logical T/F to 1/0 when read as an integer.
    let mut provenance = Provenance::default();
    for (key, _) in Provenance::default().keywords() {
        if let Ok(value) = hdu.read_key::<i64>(fptr, key) {
            provenance.set_keyword(key, value != 0);
        }
    }
    header.provenance = provenance;

    for key in PASSTHROUGH_KEYS {
        if let Ok(value) = hdu.read_key::<String>(fptr, key) {
            header.extra.insert(key.to_string(), value);
        }
    }
    header
}

fn write_header(fptr: &mut FitsFile, hdu: &FitsHdu, header: &FrameHeader, path: &Path) -> Result<(), StoreError> {
    hdu.write_key(fptr, KEY_BUNIT, ADU_UNIT.to_string())
        .map_err(fits_err(path))?;
    if let Some(imagetyp) = &header.imagetyp {
        hdu.write_key(fptr, KEY_IMAGETYP, imagetyp.clone())
            .map_err(fits_err(path))?;
    }
    if let Some(exptime) = header.exptime {
        hdu.write_key(fptr, KEY_EXPTIME, exptime)
            .map_err(fits_err(path))?;
    }
    if let Some(view_pos) = &header.view_pos {
        hdu.write_key(fptr, KEY_VIEW_POS, view_pos.clone())
            .map_err(fits_err(path))?;
    }
    for (key, value) in header.provenance.keywords() {
        hdu.write_key(fptr, key, i64::from(value))
            .map_err(fits_err(path))?;
    }
    for (key, value) in &header.extra {
        hdu.write_key(fptr, key.as_str(), value.clone())
            .map_err(fits_err(path))?;
    }
    Ok(())
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

impl FrameStore for FitsStore {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), StoreError> {
        fs::create_dir_all(path).map_err(io_err(path))
    }

    fn list_frames(&self, dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
        let mut frames = Vec::new();
        for entry in fs::read_dir(dir).map_err(io_err(dir))? {
            let entry = entry.map_err(io_err(dir))?;
            let path = entry.path();
            if path.is_file() && is_frame_file(&path) {
                frames.push(path);
            }
        }
        frames.sort();
        Ok(frames)
    }

    fn read_info(&self, path: &Path) -> Result<FrameInfo, StoreError> {
        let mut fptr = FitsFile::open(path).map_err(fits_err(path))?;
        let (hdu, shape) = open_image_hdu(&mut fptr, path)?;
        let mut header = read_header(&mut fptr, &hdu);

        // Raw files often keep observation keywords in the primary header
        // and pixels in an extension.
        if header.imagetyp.is_none() || header.exptime.is_none() {
            if let Ok(primary) = fptr.primary_hdu() {
                let fallback = read_header(&mut fptr, &primary);
                header.imagetyp = header.imagetyp.or(fallback.imagetyp);
                header.exptime = header.exptime.or(fallback.exptime);
                header.view_pos = header.view_pos.or(fallback.view_pos);
            }
        }
        Ok(FrameInfo { header, shape })
    }

    fn read_frame(&self, path: &Path) -> Result<Frame, StoreError> {
        let info = self.read_info(path)?;
        let mut fptr = FitsFile::open(path).map_err(fits_err(path))?;
        let (hdu, (rows, cols)) = open_image_hdu(&mut fptr, path)?;
        let pixels: Vec<f64> = hdu.read_image(&mut fptr).map_err(fits_err(path))?;
        let data = Array2::from_shape_vec((rows, cols), pixels).map_err(|e| StoreError::BadShape {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        debug!("Read {} ({}x{})", path.display(), rows, cols);
        Ok(Frame::new(data, info.header))
    }

    fn read_rows(
        &self,
        path: &Path,
        start: usize,
        count: usize,
    ) -> Result<Array2<f64>, StoreError> {
        let mut fptr = FitsFile::open(path).map_err(fits_err(path))?;
        let (hdu, (rows, cols)) = open_image_hdu(&mut fptr, path)?;
        check_row_range(path, start, count, rows)?;
        let pixels: Vec<f64> = hdu
            .read_rows(&mut fptr, start, count)
            .map_err(fits_err(path))?;
        Array2::from_shape_vec((count, cols), pixels).map_err(|e| StoreError::BadShape {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    fn write_frame(&self, path: &Path, frame: &Frame) -> Result<(), StoreError> {
        let (rows, cols) = frame.shape();
        let scratch = partial_path(path);
        let written = write_scratch(&scratch, frame)
            .and_then(|()| fs::rename(&scratch, path).map_err(io_err(path)));
        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_file(&scratch) {
                debug!("Could not remove {}: {}", scratch.display(), cleanup);
            }
            return Err(e);
        }
        debug!("Wrote {} ({}x{})", path.display(), rows, cols);
        Ok(())
    }
}

/// Write `frame` as a complete FITS file at `scratch`.
fn write_scratch(scratch: &Path, frame: &Frame) -> Result<(), StoreError> {
    let (rows, cols) = frame.shape();
    let description = ImageDescription {
        data_type: ImageType::Double,
        dimensions: &[rows, cols],
    };
    let mut fptr = FitsFile::create(scratch)
        .with_custom_primary(&description)
        .overwrite()
        .open()
        .map_err(fits_err(scratch))?;
    let hdu = fptr.primary_hdu().map_err(fits_err(scratch))?;
    let flat: Vec<f64> = frame.data.iter().copied().collect();
    hdu.write_image(&mut fptr, &flat)
        .map_err(fits_err(scratch))?;
    write_header(&mut fptr, &hdu, &frame.header, scratch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::ImageType;
    use approx::assert_relative_eq;
    use tempfile::TempDir;

    fn science_frame() -> Frame {
        let data = Array2::from_shape_fn((5, 7), |(r, c)| r as f64 * 100.0 + c as f64 + 0.25);
        let mut header = FrameHeader::new(ImageType::Object, 300.0).with_view_pos("open1");
        header.provenance.flat_corrected = true;
        header
            .extra
            .insert("OBJECT".to_string(), "NGC 1068".to_string());
        Frame::new(data, header)
    }

    #[test]
    fn test_fits_roundtrip_non_square() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("science.fits");
        let store = FitsStore::new();

        let frame = science_frame();
        store.write_frame(&path, &frame).unwrap();
        assert!(!partial_path(&path).exists());

        let read = store.read_frame(&path).unwrap();
        assert_eq!(read.shape(), (5, 7));
        assert_relative_eq!(read.data[[0, 0]], 0.25, epsilon = 1e-12);
        assert_relative_eq!(read.data[[4, 6]], 406.25, epsilon = 1e-12);
        assert!(read.header.is_imagetyp("object"));
        assert_eq!(read.header.exptime, Some(300.0));
        assert_eq!(read.header.view_pos.as_deref(), Some("open1"));
        assert!(read.header.provenance.flat_corrected);
        assert!(!read.header.provenance.combined);
        assert_eq!(read.header.extra.get("OBJECT").map(String::as_str), Some("NGC 1068"));
    }

    #[test]
    fn test_read_rows_band() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("band.fits");
        let store = FitsStore::new();
        store.write_frame(&path, &science_frame()).unwrap();

        let band = store.read_rows(&path, 2, 2).unwrap();
        assert_eq!(band.dim(), (2, 7));
        assert_relative_eq!(band[[0, 0]], 200.25, epsilon = 1e-12);
        assert_relative_eq!(band[[1, 3]], 303.25, epsilon = 1e-12);

        assert!(matches!(
            store.read_rows(&path, 4, 3),
            Err(StoreError::RowRange { .. })
        ));
    }

    #[test]
    fn test_overwrite_replaces_frame() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("over.fits");
        let store = FitsStore::new();
        store.write_frame(&path, &science_frame()).unwrap();

        let replacement = Frame::constant((2, 2), 1.0, FrameHeader::new(ImageType::Dark, 5.0));
        store.write_frame(&path, &replacement).unwrap();

        let info = store.read_info(&path).unwrap();
        assert_eq!(info.shape, (2, 2));
        assert!(info.header.is_imagetyp("DARK"));
    }

    #[test]
    fn test_failed_write_leaves_no_scratch_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("taken.fits");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("keep.txt"), "x").unwrap();

        let store = FitsStore::new();
        let err = store.write_frame(&path, &science_frame()).unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
        assert!(!partial_path(&path).exists());
        assert!(path.join("keep.txt").exists());
    }

    #[test]
    fn test_list_frames_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        let store = FitsStore::new();
        let frame = Frame::constant((2, 2), 0.0, FrameHeader::new(ImageType::Bias, 0.0));
        store.write_frame(&dir.path().join("b.fits"), &frame).unwrap();
        store.write_frame(&dir.path().join("a.fit"), &frame).unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();
        store.create_dir_all(&dir.path().join("cali_bias")).unwrap();

        let listed = store.list_frames(dir.path()).unwrap();
        let names: Vec<_> = listed
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.fit", "b.fits"]);
    }

    #[test]
    fn test_missing_file_is_fits_error() {
        let store = FitsStore::new();
        let err = store.read_info(Path::new("/nonexistent/frame.fits")).unwrap_err();
        assert!(matches!(err, StoreError::Fits { .. }));
    }
}
