//! UltraFace (version-RFB-320) face locator via ONNX Runtime.
//!
//! The model emits normalized corner boxes with per-anchor
//! background/face scores: `scores [1, N, 2]` and `boxes [1, N, 4]`.

use crate::preprocess::{nms, resize_tensor, ScoredBox};
use crate::ModelError;
use image::RgbImage;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use vigil_core::{BoundingBox, CapabilityError, FaceLocator};

const ULTRAFACE_INPUT_WIDTH: u32 = 320;
const ULTRAFACE_INPUT_HEIGHT: u32 = 240;
const ULTRAFACE_MEAN: f32 = 127.0;
const ULTRAFACE_STD: f32 = 128.0;
const ULTRAFACE_CONFIDENCE_THRESHOLD: f32 = 0.7;
const ULTRAFACE_NMS_THRESHOLD: f32 = 0.3;

pub struct UltraFaceLocator {
    session: Session,
    /// (scores, boxes) output indices, discovered by name at load time with a
    /// positional fallback.
    output_indices: (usize, usize),
}

impl UltraFaceLocator {
    pub fn load(model_path: &str) -> Result<Self, ModelError> {
        if !Path::new(model_path).exists() {
            return Err(ModelError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        let output_indices = discover_output_indices(&names);

        tracing::info!(
            path = model_path,
            outputs = ?names,
            ?output_indices,
            "loaded UltraFace locator model"
        );

        Ok(Self { session, output_indices })
    }

    fn run(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, ModelError> {
        let (src_w, src_h) = image.dimensions();
        let input = resize_tensor(
            image,
            ULTRAFACE_INPUT_WIDTH,
            ULTRAFACE_INPUT_HEIGHT,
            ULTRAFACE_MEAN,
            ULTRAFACE_STD,
        );

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (scores_idx, boxes_idx) = self.output_indices;
        let (_, scores) = outputs[scores_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::InferenceFailed(format!("face scores: {e}")))?;
        let (_, boxes) = outputs[boxes_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::InferenceFailed(format!("face boxes: {e}")))?;

        let num_anchors = scores.len() / 2;
        if boxes.len() != num_anchors * 4 {
            return Err(ModelError::InferenceFailed(format!(
                "mismatched output sizes: {} scores vs {} box coords",
                scores.len(),
                boxes.len()
            )));
        }

        let mut candidates = Vec::new();
        for i in 0..num_anchors {
            // [background, face] per anchor.
            let score = scores[i * 2 + 1];
            if score <= ULTRAFACE_CONFIDENCE_THRESHOLD {
                continue;
            }

            let x1 = (boxes[i * 4] * src_w as f32).clamp(0.0, src_w as f32);
            let y1 = (boxes[i * 4 + 1] * src_h as f32).clamp(0.0, src_h as f32);
            let x2 = (boxes[i * 4 + 2] * src_w as f32).clamp(0.0, src_w as f32);
            let y2 = (boxes[i * 4 + 3] * src_h as f32).clamp(0.0, src_h as f32);
            if x2 <= x1 || y2 <= y1 {
                continue;
            }

            candidates.push(ScoredBox {
                bbox: BoundingBox::new(x1, y1, x2 - x1, y2 - y1),
                score,
                class_id: 0,
            });
        }

        Ok(nms(candidates, ULTRAFACE_NMS_THRESHOLD)
            .into_iter()
            .map(|sb| sb.bbox)
            .collect())
    }
}

impl FaceLocator for UltraFaceLocator {
    fn locate(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, CapabilityError> {
        self.run(image).map_err(Into::into)
    }
}

/// UltraFace exports name their outputs "scores" and "boxes"; fall back to
/// positional order for renamed exports.
fn discover_output_indices(names: &[String]) -> (usize, usize) {
    let scores = names.iter().position(|n| n == "scores");
    let boxes = names.iter().position(|n| n == "boxes");
    match (scores, boxes) {
        (Some(s), Some(b)) => (s, b),
        _ => {
            tracing::info!(?names, "face locator output names not recognized, using positional mapping");
            (0, 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discover_output_indices_named() {
        let names: Vec<String> = ["boxes", "scores"].iter().map(|s| s.to_string()).collect();
        assert_eq!(discover_output_indices(&names), (1, 0));
    }

    #[test]
    fn test_discover_output_indices_fallback() {
        let names: Vec<String> = ["517", "601"].iter().map(|s| s.to_string()).collect();
        assert_eq!(discover_output_indices(&names), (0, 1));
    }
}
