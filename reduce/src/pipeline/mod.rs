//! Orchestration of a full reduction run.
//!
//! Stages run strictly in the order Bias, Dark, Flat, SkyPair. Each stage
//! writes its products through the [`FrameStore`] and the next stage reads
//! them back from there instead of receiving them in memory. Writes are
//! whole-frame; a rerun overwrites products but never leaves half of one.
//!
//! Nod pairs are fixed by the discovery order of the raw science frames,
//! before any of them is calibrated. A pair whose member failed calibration
//! is dropped as a whole rather than shifting later frames onto the wrong
//! partner.

pub mod layout;
pub mod report;

use crate::bias::subtract_bias_if_present;
use crate::combine::{CombineError, Combiner, MasterFrame};
use crate::config::ReductionConfig;
use crate::dark::{DarkLibrary, DarkMatchStrategy};
use crate::error::CalibrationError;
use crate::flat::FlatNormalizer;
use crate::noise::{propagate, ErrorCombination};
use crate::sky::{pair_in_order, ScienceFramePair};
use frames::{
    CollectionError, Frame, FrameCollection, FrameFilter, FrameHeader, FrameRef, FrameStore,
    ImageType, StoreError,
};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use layout::OutputLayout;
pub use report::{FrameFailure, RunReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Bias,
    Dark,
    Flat,
    SkyPair,
}

impl Stage {
    pub const FIRST: Stage = Stage::Bias;

    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Bias => Some(Stage::Dark),
            Stage::Dark => Some(Stage::Flat),
            Stage::Flat => Some(Stage::SkyPair),
            Stage::SkyPair => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Bias => "bias",
            Stage::Dark => "dark",
            Stage::Flat => "flat",
            Stage::SkyPair => "sky-pair",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("{role} path not found: {path}")]
    PathNotFound { role: &'static str, path: PathBuf },

    #[error("{role} path is not a directory: {path}")]
    NotADirectory { role: &'static str, path: PathBuf },

    #[error("{stage} stage has no {what}")]
    EmptyInput { stage: Stage, what: &'static str },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Collection(#[from] CollectionError),

    #[error(transparent)]
    Combine(#[from] CombineError),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error("nod partner {0} was not calibrated in this run")]
    PartnerNotCalibrated(PathBuf),

    #[error("{stage} stage failed on {path}: {source}")]
    FrameFailed {
        stage: Stage,
        path: PathBuf,
        #[source]
        source: Box<PipelineError>,
    },
}

/// Directories of one observing run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineInputs {
    pub dark_dir: PathBuf,
    pub flat_dir: PathBuf,
    pub science_dir: PathBuf,
    /// Without bias frames the run proceeds with no bias subtraction
    pub bias_dir: Option<PathBuf>,
    /// `IMAGETYP` of the science frames
    pub science_imagetyp: String,
}

impl PipelineInputs {
    pub fn new(
        dark_dir: impl Into<PathBuf>,
        flat_dir: impl Into<PathBuf>,
        science_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            dark_dir: dark_dir.into(),
            flat_dir: flat_dir.into(),
            science_dir: science_dir.into(),
            bias_dir: None,
            science_imagetyp: "object".to_string(),
        }
    }

    pub fn with_bias(mut self, bias_dir: impl Into<PathBuf>) -> Self {
        self.bias_dir = Some(bias_dir.into());
        self
    }

    pub fn with_science_imagetyp(mut self, imagetyp: impl Into<String>) -> Self {
        self.science_imagetyp = imagetyp.into();
        self
    }
}

/// A raw science frame and the calibrated product this run wrote for it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScienceOutcome {
    pub raw: FrameRef,
    /// `None` when calibration of this frame failed
    pub calibrated: Option<PathBuf>,
}

/// Master frames and calibrated science of a run, filled in stage by stage.
#[derive(Debug, Clone, Default)]
pub struct CalibrationContext {
    pub master_bias: Option<MasterFrame>,
    pub master_darks: DarkLibrary,
    pub master_flat: Option<MasterFrame>,
    /// Every raw science frame in discovery order
    pub science: Vec<ScienceOutcome>,
}

/// Raw frames of `kind` that are not themselves combined products.
fn raw_frames_of(kind: ImageType) -> impl Fn(&FrameHeader) -> bool {
    move |header| {
        !header.provenance.combined
            && header
                .imagetyp
                .as_deref()
                .is_some_and(|value| kind.matches(value))
    }
}

/// Paths grouped by exposure time, ascending. Frames without `EXPTIME` are
/// left out.
fn exposure_groups(refs: &[&FrameRef]) -> Vec<(f64, Vec<PathBuf>)> {
    let mut groups: Vec<(f64, Vec<PathBuf>)> = Vec::new();
    for frame_ref in refs {
        let Some(exptime) = frame_ref.header.exptime else {
            warn!("{} has no EXPTIME; left out of master darks", frame_ref.path.display());
            continue;
        };
        match groups.iter_mut().find(|(t, _)| *t == exptime) {
            Some((_, paths)) => paths.push(frame_ref.path.clone()),
            None => groups.push((exptime, vec![frame_ref.path.clone()])),
        }
    }
    groups.sort_by(|a, b| a.0.total_cmp(&b.0));
    groups
}

/// Runs the reduction stages over a [`FrameStore`].
pub struct CalibrationPipeline<S: FrameStore> {
    config: ReductionConfig,
    layout: OutputLayout,
    store: S,
}

impl<S: FrameStore> CalibrationPipeline<S> {
    pub fn new(config: ReductionConfig, store: S) -> Self {
        let layout = OutputLayout::new(config.file_extension.clone());
        Self {
            config,
            layout,
            store,
        }
    }

    pub fn config(&self) -> &ReductionConfig {
        &self.config
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Reduce one run.
    ///
    /// Mandatory directories are checked before anything is written. Frames
    /// that fail individually are recorded in the report and skipped unless
    /// `fail_fast` is set; failures that leave a stage without input abort
    /// the run.
    ///
    /// # Arguments
    ///
    /// * `inputs` - Raw frame directories of the run
    ///
    /// # Returns
    ///
    /// * `Ok(report)` - Products written and frames skipped
    /// * `Err(PathNotFound | NotADirectory)` - A given directory is unusable
    /// * `Err(EmptyInput)` - A stage was left with nothing to process
    /// * `Err(FrameFailed)` - A frame failed while `fail_fast` is set
    pub fn run(&self, inputs: &PipelineInputs) -> Result<RunReport, PipelineError> {
        self.check_dir("dark", &inputs.dark_dir)?;
        self.check_dir("flat", &inputs.flat_dir)?;
        self.check_dir("science", &inputs.science_dir)?;
        match &inputs.bias_dir {
            Some(dir) => self.check_dir("bias", dir)?,
            None => warn!("No bias frames given; continuing without bias subtraction"),
        }

        let mut report = RunReport {
            without_bias: inputs.bias_dir.is_none(),
            ..RunReport::default()
        };
        let mut context = CalibrationContext::default();

        let mut stage = Some(Stage::FIRST);
        while let Some(current) = stage {
            info!("Starting {} stage", current);
            match current {
                Stage::Bias => context.master_bias = self.bias_stage(inputs, &mut report)?,
                Stage::Dark => {
                    context.master_darks = self.dark_stage(inputs, &context, &mut report)?
                }
                Stage::Flat => {
                    let master_flat = self.flat_stage(inputs, &context, &mut report)?;
                    context.science =
                        self.correct_science(inputs, &context, &master_flat, &mut report)?;
                    context.master_flat = Some(master_flat);
                }
                Stage::SkyPair => self.sky_pair_stage(inputs, &context.science, &mut report)?,
            }
            info!("Finished {} stage", current);
            stage = current.next();
        }

        report.log_summary();
        Ok(report)
    }

    fn check_dir(&self, role: &'static str, path: &Path) -> Result<(), PipelineError> {
        if !self.store.exists(path) {
            return Err(PipelineError::PathNotFound {
                role,
                path: path.to_path_buf(),
            });
        }
        if !self.store.is_dir(path) {
            return Err(PipelineError::NotADirectory {
                role,
                path: path.to_path_buf(),
            });
        }
        Ok(())
    }

    fn combiner(&self) -> Combiner {
        Combiner::new(self.config.combine.clone())
    }

    fn flat_normalizer(&self) -> FlatNormalizer {
        FlatNormalizer::new(self.combiner(), self.config.flats.clone())
    }

    fn write(&self, path: &Path, frame: &Frame, report: &mut RunReport) -> Result<(), PipelineError> {
        if let Some(parent) = path.parent() {
            self.store.create_dir_all(parent)?;
        }
        self.store.write_frame(path, frame)?;
        debug!("Wrote {}", path.display());
        report.wrote(path.to_path_buf());
        Ok(())
    }

    /// Turn a per-frame failure into a report entry, or into a fatal error
    /// in fail-fast mode. A failed nod pair is reported under both of its
    /// frames.
    fn isolate<T>(
        &self,
        report: &mut RunReport,
        stage: Stage,
        paths: &[&Path],
        result: Result<T, PipelineError>,
    ) -> Result<Option<T>, PipelineError> {
        let e = match result {
            Ok(value) => return Ok(Some(value)),
            Err(e) => e,
        };
        let Some(first) = paths.first() else {
            return Err(e);
        };
        if self.config.fail_fast {
            return Err(PipelineError::FrameFailed {
                stage,
                path: first.to_path_buf(),
                source: Box::new(e),
            });
        }
        let message = e.to_string();
        for path in paths {
            warn!("Skipping {} in {} stage: {}", path.display(), stage, message);
            report.failed(stage, path.to_path_buf(), message.clone());
        }
        Ok(None)
    }

    fn bias_stage(
        &self,
        inputs: &PipelineInputs,
        report: &mut RunReport,
    ) -> Result<Option<MasterFrame>, PipelineError> {
        let Some(bias_dir) = inputs.bias_dir.as_deref() else {
            return Ok(None);
        };

        let raw = FrameCollection::discover(&self.store, bias_dir)?;
        let paths: Vec<PathBuf> = raw
            .filter_by(raw_frames_of(ImageType::Bias))
            .into_iter()
            .map(|f| f.path.clone())
            .collect();
        if paths.is_empty() {
            return Err(PipelineError::EmptyInput {
                stage: Stage::Bias,
                what: "bias frames",
            });
        }

        let master = self.combiner().combine_from_store(&self.store, &paths, None)?;
        let out = self.layout.master_bias(bias_dir);
        self.write(&out, &master, report)?;
        info!("Master bias from {} frames: {}", paths.len(), out.display());

        Ok(Some(self.store.read_frame(&out)?))
    }

    fn dark_stage(
        &self,
        inputs: &PipelineInputs,
        context: &CalibrationContext,
        report: &mut RunReport,
    ) -> Result<DarkLibrary, PipelineError> {
        let dark_dir = inputs.dark_dir.as_path();
        let raw = FrameCollection::discover(&self.store, dark_dir)?;
        let raw_darks = raw.filter_by(raw_frames_of(ImageType::Dark));
        if raw_darks.is_empty() {
            return Err(PipelineError::EmptyInput {
                stage: Stage::Dark,
                what: "dark frames",
            });
        }

        info!(
            "Raw dark exposures: {:?} s",
            raw.exposure_times(&FrameFilter::new().imagetyp("dark").combined(false))
        );

        let cali_dir = self.layout.cali_dark_dir(dark_dir);
        self.store.create_dir_all(&cali_dir)?;
        for frame_ref in raw_darks {
            let out = self.layout.corrected_dark(dark_dir, &frame_ref.file_name());
            let result = self
                .store
                .read_frame(&frame_ref.path)
                .map_err(PipelineError::from)
                .and_then(|frame| Ok(subtract_bias_if_present(frame, context.master_bias.as_ref())?));
            if let Some(frame) =
                self.isolate(report, Stage::Dark, &[frame_ref.path.as_path()], result)?
            {
                self.write(&out, &frame, report)?;
            }
        }

        let corrected = FrameCollection::discover(&self.store, &cali_dir)?;
        let groups = exposure_groups(&corrected.filter_by(raw_frames_of(ImageType::Dark)));
        if groups.is_empty() {
            return Err(PipelineError::EmptyInput {
                stage: Stage::Dark,
                what: "corrected dark frames",
            });
        }
        for (exptime, paths) in groups {
            let mut master = self.combiner().combine_from_store(&self.store, &paths, None)?;
            master.header.exptime = Some(exptime);
            let out = self.layout.combined_dark(dark_dir, exptime);
            self.write(&out, &master, report)?;
            info!(
                "Master dark for {}s from {} frames: {}",
                exptime,
                paths.len(),
                out.display()
            );
        }

        let products = FrameCollection::discover(&self.store, &cali_dir)?;
        let mut library = DarkLibrary::new();
        for frame_ref in products.filter_by(|h| {
            h.provenance.combined && h.image_type().as_ref() == Some(&ImageType::Dark)
        }) {
            let Some(exptime) = frame_ref.header.exptime else {
                warn!("Master dark {} has no EXPTIME; ignored", frame_ref.path.display());
                continue;
            };
            library.insert(exptime, self.store.read_frame(&frame_ref.path)?)?;
        }
        info!("Master darks available for {:?} s", library.exposures());
        report.master_darks = library.len();
        Ok(library)
    }

    /// Bias, dark and optionally flat correct one frame, returning the
    /// corrected frame and the dark match used.
    fn calibrate(
        &self,
        frame_ref: &FrameRef,
        context: &CalibrationContext,
        dark_correct: bool,
        master_flat: Option<&MasterFrame>,
    ) -> Result<(Frame, Option<DarkMatchStrategy>), PipelineError> {
        let frame = self.store.read_frame(&frame_ref.path)?;
        let mut frame = subtract_bias_if_present(frame, context.master_bias.as_ref())?;

        let mut strategy = None;
        if dark_correct {
            let (corrected, matched) = context
                .master_darks
                .correct(&frame, self.config.darks.match_tolerance)?;
            debug!("{}: {}", frame_ref.file_name(), matched);
            frame = corrected;
            strategy = Some(matched);
        }

        if let Some(flat) = master_flat {
            frame = self.flat_normalizer().apply(&frame, flat)?;
        }
        Ok((frame, strategy))
    }

    fn flat_stage(
        &self,
        inputs: &PipelineInputs,
        context: &CalibrationContext,
        report: &mut RunReport,
    ) -> Result<MasterFrame, PipelineError> {
        let flat_dir = inputs.flat_dir.as_path();
        let raw = FrameCollection::discover(&self.store, flat_dir)?;
        let raw_flats = raw.filter_by(raw_frames_of(ImageType::Flat));
        if raw_flats.is_empty() {
            return Err(PipelineError::EmptyInput {
                stage: Stage::Flat,
                what: "flat frames",
            });
        }

        let cali_dir = self.layout.cali_flat_dir(flat_dir);
        self.store.create_dir_all(&cali_dir)?;
        for frame_ref in raw_flats {
            let out = self.layout.corrected_flat(flat_dir, &frame_ref.file_name());
            let result = self.calibrate(frame_ref, context, true, None);
            if let Some((frame, strategy)) =
                self.isolate(report, Stage::Flat, &[frame_ref.path.as_path()], result)?
            {
                self.write(&out, &frame, report)?;
                report
                    .dark_matches
                    .extend(strategy.map(|s| (frame_ref.path.clone(), s)));
            }
        }

        let corrected = FrameCollection::discover(&self.store, &cali_dir)?;
        let paths: Vec<PathBuf> = corrected
            .filter_by(raw_frames_of(ImageType::Flat))
            .into_iter()
            .map(|f| f.path.clone())
            .collect();
        if paths.is_empty() {
            return Err(PipelineError::EmptyInput {
                stage: Stage::Flat,
                what: "corrected flat frames",
            });
        }

        let master = self
            .flat_normalizer()
            .build_master_flat_from_store(&self.store, &paths)?;
        let out = self.layout.master_flat(flat_dir);
        self.write(&out, &master, report)?;
        info!("Master flat from {} frames: {}", paths.len(), out.display());

        Ok(self.store.read_frame(&out)?)
    }

    /// Calibrate every raw science frame, returning one outcome per frame
    /// in discovery order.
    fn correct_science(
        &self,
        inputs: &PipelineInputs,
        context: &CalibrationContext,
        master_flat: &MasterFrame,
        report: &mut RunReport,
    ) -> Result<Vec<ScienceOutcome>, PipelineError> {
        let science_dir = inputs.science_dir.as_path();
        let science_type = ImageType::parse(&inputs.science_imagetyp);
        let raw = FrameCollection::discover(&self.store, science_dir)?;
        let raw_science = raw.filter_by(raw_frames_of(science_type));
        if raw_science.is_empty() {
            return Err(PipelineError::EmptyInput {
                stage: Stage::Flat,
                what: "science frames",
            });
        }
        if !self.config.dark_correct_science {
            warn!("Dark correction of science frames is disabled");
        }

        self.store
            .create_dir_all(&self.layout.cali_science_dir(science_dir))?;
        let mut outcomes = Vec::with_capacity(raw_science.len());
        for frame_ref in raw_science {
            let out = self
                .layout
                .calibrated_science(science_dir, &frame_ref.file_name());
            let result = self.calibrate(
                frame_ref,
                context,
                self.config.dark_correct_science,
                Some(master_flat),
            );
            let mut calibrated = None;
            if let Some((frame, strategy)) =
                self.isolate(report, Stage::Flat, &[frame_ref.path.as_path()], result)?
            {
                self.write(&out, &frame, report)?;
                report
                    .dark_matches
                    .extend(strategy.map(|s| (frame_ref.path.clone(), s)));
                calibrated = Some(out);
            }
            outcomes.push(ScienceOutcome {
                raw: frame_ref.clone(),
                calibrated,
            });
        }
        Ok(outcomes)
    }

    fn sky_pair_stage(
        &self,
        inputs: &PipelineInputs,
        science: &[ScienceOutcome],
        report: &mut RunReport,
    ) -> Result<(), PipelineError> {
        let science_dir = inputs.science_dir.as_path();
        let prefix = self.config.spectrum_tag_prefix.as_str();

        let eligible: Vec<&ScienceOutcome> = science
            .iter()
            .filter(|outcome| outcome.raw.header.view_pos_starts_with(prefix))
            .collect();
        if eligible.is_empty() {
            warn!(
                "No science frames with VIEW_POS starting with '{}'; nothing to sky-subtract",
                prefix
            );
            return Ok(());
        }

        let pairs = pair_in_order(eligible)?;
        info!("Sky-subtracting {} nod pairs", pairs.len());
        if self.config.error_combination == ErrorCombination::FullyCorrelated {
            warn!(
                "Error frames use the fully correlated combination sqrt(a^2 + b^2 - 2ab), \
                 which is zero for equal errors; use the independent combination for \
                 uncorrelated noise"
            );
        }

        self.store.create_dir_all(&self.layout.final_dir(science_dir))?;
        self.store.create_dir_all(&self.layout.error_dir(science_dir))?;
        for (first, second) in pairs {
            let result = self.subtract_sky(science_dir, first, second, report);
            let members = [first.raw.path.as_path(), second.raw.path.as_path()];
            if self
                .isolate(report, Stage::SkyPair, &members, result)?
                .is_some()
            {
                report.sky_pairs += 1;
            }
        }
        Ok(())
    }

    fn subtract_sky(
        &self,
        science_dir: &Path,
        first: &ScienceOutcome,
        second: &ScienceOutcome,
        report: &mut RunReport,
    ) -> Result<(), PipelineError> {
        let product = |member: &ScienceOutcome| {
            member
                .calibrated
                .clone()
                .ok_or_else(|| PipelineError::PartnerNotCalibrated(member.raw.path.clone()))
        };
        let first_path = product(first)?;
        let second_path = product(second)?;
        let pair = ScienceFramePair::new(
            self.store.read_frame(&first_path)?,
            self.store.read_frame(&second_path)?,
        )?;
        let (first_minus_second, second_minus_first) = pair.subtract()?;
        let error = propagate(
            &pair.first,
            &pair.second,
            &self.config.noise,
            self.config.error_combination,
        )?;

        let (first_name, second_name) = (first.raw.file_name(), second.raw.file_name());
        self.write(
            &self.layout.sky_subtracted(science_dir, &first_name),
            &first_minus_second,
            report,
        )?;
        self.write(
            &self.layout.sky_subtracted(science_dir, &second_name),
            &second_minus_first,
            report,
        )?;
        self.write(
            &self.layout.sky_subtracted_error(science_dir, &first_name),
            &error,
            report,
        )?;
        self.write(
            &self.layout.sky_subtracted_error(science_dir, &second_name),
            &error,
            report,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        let mut order = Vec::new();
        let mut stage = Some(Stage::FIRST);
        while let Some(s) = stage {
            order.push(s);
            stage = s.next();
        }
        assert_eq!(
            order,
            vec![Stage::Bias, Stage::Dark, Stage::Flat, Stage::SkyPair]
        );
    }

    #[test]
    fn test_exposure_groups_sorted() {
        let refs: Vec<FrameRef> = [(60.0, "a"), (10.0, "b"), (60.0, "c")]
            .iter()
            .map(|&(t, name)| FrameRef {
                path: PathBuf::from(format!("/d/{name}.fits")),
                header: FrameHeader::new(ImageType::Dark, t),
                shape: (2, 2),
            })
            .collect();
        let borrowed: Vec<&FrameRef> = refs.iter().collect();
        let groups = exposure_groups(&borrowed);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, 10.0);
        assert_eq!(
            groups[1].1,
            vec![PathBuf::from("/d/a.fits"), PathBuf::from("/d/c.fits")]
        );
    }

    #[test]
    fn test_raw_frame_filter() {
        let is_dark = raw_frames_of(ImageType::Dark);
        let mut header = FrameHeader::new(ImageType::Dark, 10.0);
        header.imagetyp = Some("DARK".to_string());
        assert!(is_dark(&header));
        header.provenance.combined = true;
        assert!(!is_dark(&header));
        assert!(!is_dark(&FrameHeader::new(ImageType::Flat, 1.0)));
    }
}
