//! Reduction of raw CCD spectroscopy exposures.
//!
//! Master bias, dark and flat frames are built by sigma-clipped combination,
//! applied to every flat and science frame in that order, and consecutive
//! nod pairs of science frames are differenced into sky-subtracted products
//! with per-pixel error frames. [`pipeline::CalibrationPipeline`] runs the
//! whole sequence over a [`frames::FrameStore`].

pub mod bias;
pub mod combine;
pub mod config;
pub mod dark;
pub mod error;
pub mod flat;
pub mod noise;
pub mod pipeline;
pub mod sky;

pub use bias::{subtract_bias, subtract_bias_if_present};
pub use combine::{clipped_mean, CombineError, CombineSettings, Combiner, MasterFrame};
pub use config::{DarkSettings, ReductionConfig};
pub use dark::{
    apply_dark, find_nearest, resolve_dark_strategy, subtract_dark, DarkLibrary, DarkMatchStrategy,
};
pub use error::CalibrationError;
pub use flat::{inverse_median, FlatNormalizer, FlatSettings};
pub use noise::{propagate, ErrorCombination, ErrorFrame, NoiseModel};
pub use pipeline::{
    CalibrationContext, CalibrationPipeline, FrameFailure, OutputLayout, PipelineError,
    PipelineInputs, RunReport, ScienceOutcome, Stage,
};
pub use sky::{pair_frames, pair_in_order, subtract_pair, ScienceFramePair};
