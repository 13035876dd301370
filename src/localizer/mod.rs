//! Moment localization with a CG-DETR grounding model over CLIP features.
//!
//! The feature extractor and the grounding network are opaque ONNX graphs
//! behind [`FeatureExtractor`] and [`GroundingModel`]; this module only
//! prepares their inputs and decodes their outputs.

mod clip;
mod grounding;
mod span;

use std::path::Path;
use std::sync::{Mutex, OnceLock};
use tracing::info;

use crate::video::VideoError;

pub(crate) use clip::ClipFeatureExtractor;
pub(crate) use grounding::CgDetr;

/// Seconds of video summarized by one feature vector.
pub(crate) const CLIP_LEN: f64 = 2.0;
/// Longest clip sequence the pretrained positional embedding supports (150 s).
pub(crate) const MAX_CLIPS: usize = 75;
const NORM_EPS: f32 = 1e-5;

#[derive(Debug, thiserror::Error)]
pub(crate) enum LocalizeError {
    #[error("failed to load model: {0}")]
    Model(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("video spans {clips} clips but the grounding model supports at most {max}", max = MAX_CLIPS)]
    VideoTooLong { clips: usize },
    #[error("no moment predicted")]
    NoPrediction,
    #[error(transparent)]
    Video(#[from] VideoError),
}

/// One candidate moment, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct WindowPrediction {
    pub(crate) start: f64,
    pub(crate) end: f64,
    pub(crate) score: f64,
}

/// Per-clip video features plus the duration they were sampled from.
#[derive(Debug, Clone)]
pub(crate) struct ClipFeatures {
    pub(crate) rows: Vec<Vec<f32>>,
    pub(crate) duration: f64,
}

#[derive(Debug, Clone)]
pub(crate) struct GroundingInputs {
    /// `(T, D + 2)`: normalized clip features followed by their TEF.
    pub(crate) video: Vec<Vec<f32>>,
    /// `(L, D)`: normalized token features of the query.
    pub(crate) text: Vec<Vec<f32>>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct RawPredictions {
    pub(crate) logits: Vec<[f32; 2]>,
    pub(crate) spans: Vec<[f32; 2]>,
}

pub(crate) trait FeatureExtractor: Send + Sync {
    /// Length of the video in seconds, read without decoding any frame.
    fn duration(&self, path: &Path) -> Result<f64, LocalizeError>;

    fn encode_video(&self, path: &Path) -> Result<ClipFeatures, LocalizeError>;

    fn encode_text(&self, query: &str) -> Result<Vec<Vec<f32>>, LocalizeError>;
}

pub(crate) trait GroundingModel: Send + Sync {
    fn infer(&self, inputs: &GroundingInputs) -> Result<RawPredictions, LocalizeError>;
}

pub(crate) struct Localizer {
    extractor: Box<dyn FeatureExtractor>,
    model: Box<dyn GroundingModel>,
}

static SHARED: OnceLock<Localizer> = OnceLock::new();
static SHARED_INIT: Mutex<()> = Mutex::new(());

/// The process-wide localizer, loaded from `model_dir` on first use.
///
/// Later calls return the cached instance regardless of `model_dir`.
pub(crate) fn shared(model_dir: &Path) -> Result<&'static Localizer, LocalizeError> {
    if let Some(localizer) = SHARED.get() {
        return Ok(localizer);
    }
    let _guard = SHARED_INIT
        .lock()
        .map_err(|_| LocalizeError::Model("model init lock poisoned".to_string()))?;
    if let Some(localizer) = SHARED.get() {
        return Ok(localizer);
    }
    let localizer = Localizer::load(model_dir)?;
    Ok(SHARED.get_or_init(|| localizer))
}

impl Localizer {
    pub(crate) fn new(extractor: Box<dyn FeatureExtractor>, model: Box<dyn GroundingModel>) -> Self {
        Self { extractor, model }
    }

    /// Loads `clip_visual.onnx`, `clip_text.onnx`, `tokenizer.json` and
    /// `cgdetr.onnx` from `model_dir`.
    pub(crate) fn load(model_dir: &Path) -> Result<Self, LocalizeError> {
        info!(model_dir = %model_dir.display(), "loading feature extractors");
        let extractor = ClipFeatureExtractor::load(model_dir)?;
        info!("loading trained CG-DETR model");
        let model = CgDetr::load(&model_dir.join("cgdetr.onnx"))?;
        Ok(Self::new(Box::new(extractor), Box::new(model)))
    }

    /// Ranked candidate windows for `query` in the video at `path`, best first.
    pub(crate) fn localize(
        &self,
        path: &Path,
        query: &str,
    ) -> Result<Vec<WindowPrediction>, LocalizeError> {
        let clips = clip_count(self.extractor.duration(path)?);
        if clips > MAX_CLIPS {
            return Err(LocalizeError::VideoTooLong { clips });
        }

        let features = self.extractor.encode_video(path)?;
        if features.rows.len() > MAX_CLIPS {
            return Err(LocalizeError::VideoTooLong {
                clips: features.rows.len(),
            });
        }
        if features.rows.is_empty() {
            return Err(LocalizeError::Video(VideoError::NoFrames(path.to_path_buf())));
        }

        let mut video = features.rows;
        l2_normalize(&mut video);
        append_tef(&mut video);

        let mut text = self.extractor.encode_text(query)?;
        l2_normalize(&mut text);

        let raw = self.model.infer(&GroundingInputs { video, text })?;
        let windows = span::rank_windows(&raw.logits, &raw.spans, features.duration);
        info!(
            video = %path.display(),
            query,
            candidates = windows.len(),
            best = ?windows.first(),
            "localized moment"
        );
        Ok(windows)
    }

    /// The highest scoring window.
    pub(crate) fn best_moment(&self, path: &Path, query: &str) -> Result<WindowPrediction, LocalizeError> {
        self.localize(path, query)?
            .into_iter()
            .next()
            .ok_or(LocalizeError::NoPrediction)
    }
}

fn l2_normalize(rows: &mut [Vec<f32>]) {
    for row in rows {
        let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt().max(NORM_EPS);
        row.iter_mut().for_each(|v| *v /= norm);
    }
}

/// Appends the temporal endpoint feature `[i / n, (i + 1) / n]` to clip `i`.
fn append_tef(rows: &mut [Vec<f32>]) {
    let n = rows.len() as f32;
    for (i, row) in rows.iter_mut().enumerate() {
        let start = i as f32 / n;
        row.push(start);
        row.push(start + 1.0 / n);
    }
}

/// Number of clips covering `duration`, one per started [`CLIP_LEN`].
pub(crate) fn clip_count(duration: f64) -> usize {
    (duration / CLIP_LEN).ceil().max(0.0) as usize
}
