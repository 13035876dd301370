//! CLIP ViT-B/32 image and text encoders run through ONNX Runtime.

use image::imageops::FilterType;
use image::RgbImage;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use std::path::Path;
use std::sync::Mutex;
use tokenizers::Tokenizer;
use tracing::debug;

use super::{clip_count, ClipFeatures, FeatureExtractor, LocalizeError, CLIP_LEN};
use crate::capture;
use crate::video;

const INPUT_SIZE: u32 = 224;
const CONTEXT_LEN: usize = 77;
const BATCH_SIZE: usize = 60;
const MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

pub(crate) struct ClipFeatureExtractor {
    visual: Mutex<Session>,
    text: Mutex<Session>,
    tokenizer: Tokenizer,
}

pub(super) fn load_session(path: &Path) -> Result<Session, LocalizeError> {
    if !path.exists() {
        return Err(LocalizeError::Model(format!(
            "model not found at {}",
            path.display()
        )));
    }
    Session::builder()
        .map_err(|e| LocalizeError::Model(e.to_string()))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| LocalizeError::Model(e.to_string()))?
        .commit_from_file(path)
        .map_err(|e| LocalizeError::Model(format!("{}: {e}", path.display())))
}

impl ClipFeatureExtractor {
    pub(crate) fn load(model_dir: &Path) -> Result<Self, LocalizeError> {
        let visual = load_session(&model_dir.join("clip_visual.onnx"))?;
        let text = load_session(&model_dir.join("clip_text.onnx"))?;
        let tokenizer = Tokenizer::from_file(model_dir.join("tokenizer.json"))
            .map_err(|e| LocalizeError::Model(format!("tokenizer: {e}")))?;
        Ok(Self {
            visual: Mutex::new(visual),
            text: Mutex::new(text),
            tokenizer,
        })
    }

    fn encode_batch(&self, batch: &[Vec<f32>]) -> Result<Vec<Vec<f32>>, LocalizeError> {
        let side = INPUT_SIZE as usize;
        let pixels: Vec<f32> = batch.concat();
        let input = Tensor::from_array(([batch.len(), 3, side, side], pixels))
            .map_err(|e| LocalizeError::Inference(e.to_string()))?;

        let mut session = self
            .visual
            .lock()
            .map_err(|_| LocalizeError::Inference("lock poisoned".to_string()))?;
        let outputs = session
            .run(ort::inputs![input])
            .map_err(|e| LocalizeError::Inference(e.to_string()))?;
        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| LocalizeError::Inference(e.to_string()))?;
        let dim = match &shape[..] {
            [n, d] if *n as usize == batch.len() => *d as usize,
            other => {
                return Err(LocalizeError::Inference(format!(
                    "unexpected image embedding shape {other:?}"
                )))
            }
        };
        Ok(data.chunks(dim).map(<[f32]>::to_vec).collect())
    }
}

impl FeatureExtractor for ClipFeatureExtractor {
    fn duration(&self, path: &Path) -> Result<f64, LocalizeError> {
        Ok(video::probe_duration(path)?)
    }

    /// One embedding per [`CLIP_LEN`] seconds, taken from the frame shown at
    /// the start of each clip.
    fn encode_video(&self, path: &Path) -> Result<ClipFeatures, LocalizeError> {
        let duration = video::probe_duration(path)?;
        let timestamps: Vec<f64> = (0..clip_count(duration))
            .map(|i| i as f64 * CLIP_LEN)
            .collect();
        debug!(duration, clips = timestamps.len(), "encoding video");

        let mut rows = Vec::with_capacity(timestamps.len());
        let mut batch = Vec::with_capacity(BATCH_SIZE);
        for frame in capture::frames_at(path, timestamps)? {
            batch.push(preprocess(&frame?.image));
            if batch.len() == BATCH_SIZE {
                rows.extend(self.encode_batch(&batch)?);
                batch.clear();
            }
        }
        if !batch.is_empty() {
            rows.extend(self.encode_batch(&batch)?);
        }
        Ok(ClipFeatures { rows, duration })
    }

    /// Per-token `last_hidden_state` rows for the valid (unpadded) tokens.
    fn encode_text(&self, query: &str) -> Result<Vec<Vec<f32>>, LocalizeError> {
        let encoding = self
            .tokenizer
            .encode(query, true)
            .map_err(|e| LocalizeError::Inference(format!("tokenizer: {e}")))?;
        let (input_ids, attention_mask, valid) = pad_tokens(encoding.get_ids());

        let ids = Tensor::from_array(([1usize, CONTEXT_LEN], input_ids))
            .map_err(|e| LocalizeError::Inference(e.to_string()))?;
        let mask = Tensor::from_array(([1usize, CONTEXT_LEN], attention_mask))
            .map_err(|e| LocalizeError::Inference(e.to_string()))?;

        let mut session = self
            .text
            .lock()
            .map_err(|_| LocalizeError::Inference("lock poisoned".to_string()))?;
        let outputs = session
            .run(ort::inputs!["input_ids" => ids, "attention_mask" => mask])
            .map_err(|e| LocalizeError::Inference(e.to_string()))?;
        let output = outputs
            .get("last_hidden_state")
            .ok_or_else(|| LocalizeError::Inference("missing last_hidden_state".to_string()))?;
        let (shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| LocalizeError::Inference(e.to_string()))?;
        let dim = match &shape[..] {
            [1, len, d] if *len as usize == CONTEXT_LEN => *d as usize,
            other => {
                return Err(LocalizeError::Inference(format!(
                    "unexpected text embedding shape {other:?}"
                )))
            }
        };
        Ok(data.chunks(dim).take(valid).map(<[f32]>::to_vec).collect())
    }
}

/// Pads or truncates token ids to the CLIP context, keeping the final
/// end-of-text token. Returns ids, attention mask and the valid length.
fn pad_tokens(ids: &[u32]) -> (Vec<i64>, Vec<i64>, usize) {
    let mut tokens: Vec<i64> = ids.iter().map(|&id| i64::from(id)).collect();
    if tokens.len() > CONTEXT_LEN {
        let eot = tokens[tokens.len() - 1];
        tokens.truncate(CONTEXT_LEN);
        tokens[CONTEXT_LEN - 1] = eot;
    }
    let valid = tokens.len();
    let mut mask = vec![1i64; valid];
    tokens.resize(CONTEXT_LEN, 0);
    mask.resize(CONTEXT_LEN, 0);
    (tokens, mask, valid)
}

/// Resize the short side to 224, center crop, and lay out as normalized CHW.
fn preprocess(image: &RgbImage) -> Vec<f32> {
    let (width, height) = image.dimensions();
    let scale = INPUT_SIZE as f64 / width.min(height) as f64;
    let resized_width = ((width as f64 * scale).round() as u32).max(INPUT_SIZE);
    let resized_height = ((height as f64 * scale).round() as u32).max(INPUT_SIZE);
    let resized =
        image::imageops::resize(image, resized_width, resized_height, FilterType::CatmullRom);
    let left = (resized_width - INPUT_SIZE) / 2;
    let top = (resized_height - INPUT_SIZE) / 2;
    let cropped = image::imageops::crop_imm(&resized, left, top, INPUT_SIZE, INPUT_SIZE).to_image();

    let side = INPUT_SIZE as usize;
    let mut chw = vec![0.0f32; 3 * side * side];
    for (x, y, pixel) in cropped.enumerate_pixels() {
        for c in 0..3 {
            let v = pixel[c] as f32 / 255.0;
            chw[c * side * side + y as usize * side + x as usize] = (v - MEAN[c]) / STD[c];
        }
    }
    chw
}
