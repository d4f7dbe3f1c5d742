//! Header keywords recognised by the reduction pipeline.
//!
//! Raw exposures carry an image type, an exposure time and a slit/view
//! position tag. Every product written by the pipeline additionally carries
//! provenance flags recording which corrections have been applied.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const KEY_IMAGETYP: &str = "IMAGETYP";
pub const KEY_EXPTIME: &str = "EXPTIME";
pub const KEY_VIEW_POS: &str = "VIEW_POS";
pub const KEY_BUNIT: &str = "BUNIT";

pub const KEY_COMBINED: &str = "COMBINED";
pub const KEY_SUBBIAS: &str = "SUBBIAS";
pub const KEY_SUBDARK: &str = "SUBDARK";
pub const KEY_FLATCOR: &str = "FLATCOR";
pub const KEY_SKY_SUB: &str = "SKY_SUB";
pub const KEY_ERROR: &str = "ERROR";

/// Pixel unit of every frame handled by the pipeline.
pub const ADU_UNIT: &str = "adu";

/// Keywords copied verbatim from input frames to their products.
pub const PASSTHROUGH_KEYS: [&str; 6] = [
    "OBJECT", "DATE-OBS", "INSTRUME", "FILTER", "TELESCOP", "OBSERVER",
];

/// Exposure category from the `IMAGETYP` keyword.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageType {
    Bias,
    Dark,
    Flat,
    Object,
    Other(String),
}

impl ImageType {
    /// Parse an `IMAGETYP` value. Matching is case-insensitive and ignores
    /// surrounding whitespace, since instruments disagree on both.
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "bias" | "zero" => ImageType::Bias,
            "dark" => ImageType::Dark,
            "flat" => ImageType::Flat,
            "object" => ImageType::Object,
            _ => ImageType::Other(trimmed.to_string()),
        }
    }

    /// True if this type matches the given `IMAGETYP` string.
    pub fn matches(&self, value: &str) -> bool {
        match (self, ImageType::parse(value)) {
            (ImageType::Other(a), ImageType::Other(b)) => a.eq_ignore_ascii_case(&b),
            (a, b) => *a == b,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ImageType::Bias => "bias",
            ImageType::Dark => "dark",
            ImageType::Flat => "flat",
            ImageType::Object => "object",
            ImageType::Other(s) => s,
        }
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Corrections already applied to a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub combined: bool,
    pub bias_subtracted: bool,
    pub dark_subtracted: bool,
    pub flat_corrected: bool,
    pub sky_subtracted: bool,
    pub error: bool,
}

impl Provenance {
    /// Keyword/value pairs in the order they are written.
    pub fn keywords(&self) -> [(&'static str, bool); 6] {
        [
            (KEY_COMBINED, self.combined),
            (KEY_SUBBIAS, self.bias_subtracted),
            (KEY_SUBDARK, self.dark_subtracted),
            (KEY_FLATCOR, self.flat_corrected),
            (KEY_SKY_SUB, self.sky_subtracted),
            (KEY_ERROR, self.error),
        ]
    }

    /// Set the flag stored under `key`. Unknown keys are ignored.
    pub fn set_keyword(&mut self, key: &str, value: bool) {
        match key {
            KEY_COMBINED => self.combined = value,
            KEY_SUBBIAS => self.bias_subtracted = value,
            KEY_SUBDARK => self.dark_subtracted = value,
            KEY_FLATCOR => self.flat_corrected = value,
            KEY_SKY_SUB => self.sky_subtracted = value,
            KEY_ERROR => self.error = value,
            _ => {}
        }
    }
}

/// Metadata record of a frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameHeader {
    /// Raw `IMAGETYP` string as found in the file
    pub imagetyp: Option<String>,
    /// Exposure time in seconds
    pub exptime: Option<f64>,
    /// Slit/view position tag, e.g. "open1"
    pub view_pos: Option<String>,
    pub provenance: Provenance,
    /// Pass-through keywords, see [`PASSTHROUGH_KEYS`]
    pub extra: BTreeMap<String, String>,
}

impl FrameHeader {
    pub fn new(image_type: ImageType, exptime: f64) -> Self {
        Self {
            imagetyp: Some(image_type.as_str().to_string()),
            exptime: Some(exptime),
            ..Default::default()
        }
    }

    pub fn with_view_pos(mut self, view_pos: impl Into<String>) -> Self {
        self.view_pos = Some(view_pos.into());
        self
    }

    pub fn image_type(&self) -> Option<ImageType> {
        self.imagetyp.as_deref().map(ImageType::parse)
    }

    /// Case-insensitive comparison against an `IMAGETYP` value.
    pub fn is_imagetyp(&self, value: &str) -> bool {
        self.imagetyp
            .as_deref()
            .is_some_and(|own| own.trim().eq_ignore_ascii_case(value.trim()))
    }

    /// True if the view position tag starts with `prefix`.
    pub fn view_pos_starts_with(&self, prefix: &str) -> bool {
        self.view_pos
            .as_deref()
            .is_some_and(|tag| tag.trim_start().starts_with(prefix))
    }
}
