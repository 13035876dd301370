use ort::session::Session;
use ort::value::Tensor;
use std::path::Path;
use std::sync::Mutex;

use super::clip::load_session;
use super::{GroundingInputs, GroundingModel, LocalizeError, RawPredictions};

/// CG-DETR exported with `src_vid`, `src_vid_mask`, `src_txt`, `src_txt_mask`
/// inputs and `pred_logits`, `pred_spans` outputs.
pub(crate) struct CgDetr {
    session: Mutex<Session>,
}

impl CgDetr {
    pub(crate) fn load(model_path: &Path) -> Result<Self, LocalizeError> {
        Ok(Self {
            session: Mutex::new(load_session(model_path)?),
        })
    }
}

fn batch_of_one(rows: &[Vec<f32>]) -> Result<(Tensor<f32>, Tensor<f32>), LocalizeError> {
    let len = rows.len();
    let dim = rows.first().map_or(0, Vec::len);
    if rows.iter().any(|row| row.len() != dim) {
        return Err(LocalizeError::Inference("ragged feature rows".to_string()));
    }
    let features = Tensor::from_array(([1usize, len, dim], rows.concat()))
        .map_err(|e| LocalizeError::Inference(e.to_string()))?;
    let mask = Tensor::from_array(([1usize, len], vec![1.0f32; len]))
        .map_err(|e| LocalizeError::Inference(e.to_string()))?;
    Ok((features, mask))
}

fn pairs(shape: &[i64], data: &[f32], name: &str) -> Result<Vec<[f32; 2]>, LocalizeError> {
    match shape {
        [1, _, 2] => Ok(data.chunks_exact(2).map(|p| [p[0], p[1]]).collect()),
        other => Err(LocalizeError::Inference(format!(
            "unexpected {name} shape {other:?}"
        ))),
    }
}

impl GroundingModel for CgDetr {
    fn infer(&self, inputs: &GroundingInputs) -> Result<RawPredictions, LocalizeError> {
        let (src_vid, src_vid_mask) = batch_of_one(&inputs.video)?;
        let (src_txt, src_txt_mask) = batch_of_one(&inputs.text)?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| LocalizeError::Inference("lock poisoned".to_string()))?;
        let outputs = session
            .run(ort::inputs![
                "src_vid" => src_vid,
                "src_vid_mask" => src_vid_mask,
                "src_txt" => src_txt,
                "src_txt_mask" => src_txt_mask,
            ])
            .map_err(|e| LocalizeError::Inference(e.to_string()))?;

        let extract = |name: &str| -> Result<Vec<[f32; 2]>, LocalizeError> {
            let output = outputs
                .get(name)
                .ok_or_else(|| LocalizeError::Inference(format!("missing {name} output")))?;
            let (shape, data) = output
                .try_extract_tensor::<f32>()
                .map_err(|e| LocalizeError::Inference(e.to_string()))?;
            pairs(shape, data, name)
        };
        let logits = extract("pred_logits")?;
        let spans = extract("pred_spans")?;
        if logits.len() != spans.len() {
            return Err(LocalizeError::Inference(format!(
                "{} logits for {} spans",
                logits.len(),
                spans.len()
            )));
        }
        Ok(RawPredictions { logits, spans })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_reads_batched_two_column_output() {
        let data = [0.1, 0.2, 0.3, 0.4];
        let out = pairs(&[1, 2, 2], &data, "pred_spans").unwrap();
        assert_eq!(out, vec![[0.1, 0.2], [0.3, 0.4]]);
    }

    #[test]
    fn pairs_rejects_other_shapes() {
        assert!(pairs(&[2, 2], &[0.0; 4], "pred_logits").is_err());
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let rows = vec![vec![1.0, 2.0], vec![1.0]];
        assert!(batch_of_one(&rows).is_err());
    }
}
