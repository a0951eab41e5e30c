//! YOLOv8 person detector via ONNX Runtime.
//!
//! Decodes the anchor-free `[1, 4 + classes, anchors]` output layout of
//! ultralytics YOLOv8 exports. The pipeline only tracks the person class,
//! but all classes above the confidence threshold are returned; filtering
//! is the zone tracker's concern.

use crate::preprocess::{letterbox_tensor, nms, ScoredBox};
use crate::ModelError;
use image::RgbImage;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use vigil_core::{BoundingBox, CapabilityError, Detection, PersonDetector};

const YOLO_INPUT_SIZE: u32 = 640;
const YOLO_PAD_VALUE: u8 = 114;
const YOLO_NUM_CLASSES: usize = 80;
const YOLO_BOX_ATTRS: usize = 4 + YOLO_NUM_CLASSES;
const YOLO_NMS_THRESHOLD: f32 = 0.45;

pub struct YoloPersonDetector {
    session: Session,
    confidence_threshold: f32,
}

impl YoloPersonDetector {
    /// Load a YOLOv8 ONNX export from `model_path`.
    pub fn load(model_path: &str, confidence_threshold: f32) -> Result<Self, ModelError> {
        if !Path::new(model_path).exists() {
            return Err(ModelError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| i.name().to_string()).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name().to_string()).collect::<Vec<_>>(),
            "loaded YOLOv8 detection model"
        );

        Ok(Self { session, confidence_threshold })
    }

    fn run(&mut self, image: &RgbImage) -> Result<Vec<Detection>, ModelError> {
        let (src_w, src_h) = image.dimensions();
        let (input, letterbox) = letterbox_tensor(
            image,
            YOLO_INPUT_SIZE,
            YOLO_INPUT_SIZE,
            YOLO_PAD_VALUE,
            0.0,
            255.0,
        );

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::InferenceFailed(format!("detection output: {e}")))?;

        if data.len() % YOLO_BOX_ATTRS != 0 {
            return Err(ModelError::InferenceFailed(format!(
                "unexpected output length {} for {YOLO_BOX_ATTRS}-attribute layout",
                data.len()
            )));
        }
        let num_anchors = data.len() / YOLO_BOX_ATTRS;

        // Layout is attribute-major: data[attr * num_anchors + anchor].
        let attr = |a: usize, i: usize| data[a * num_anchors + i];

        let mut candidates = Vec::new();
        for i in 0..num_anchors {
            let mut best_class = 0usize;
            let mut best_score = 0.0f32;
            for c in 0..YOLO_NUM_CLASSES {
                let score = attr(4 + c, i);
                if score > best_score {
                    best_score = score;
                    best_class = c;
                }
            }
            if best_score <= self.confidence_threshold {
                continue;
            }

            let cx = attr(0, i);
            let cy = attr(1, i);
            let w = attr(2, i);
            let h = attr(3, i);

            let x1 = letterbox.unmap_x(cx - w / 2.0).clamp(0.0, src_w as f32);
            let y1 = letterbox.unmap_y(cy - h / 2.0).clamp(0.0, src_h as f32);
            let x2 = letterbox.unmap_x(cx + w / 2.0).clamp(0.0, src_w as f32);
            let y2 = letterbox.unmap_y(cy + h / 2.0).clamp(0.0, src_h as f32);

            candidates.push(ScoredBox {
                bbox: BoundingBox::new(x1, y1, x2 - x1, y2 - y1),
                score: best_score,
                class_id: best_class as u32,
            });
        }

        let detections = nms(candidates, YOLO_NMS_THRESHOLD)
            .into_iter()
            .map(|sb| Detection {
                bbox: sb.bbox,
                class_id: sb.class_id,
                confidence: sb.score,
            })
            .collect();

        Ok(detections)
    }
}

impl PersonDetector for YoloPersonDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, CapabilityError> {
        self.run(image).map_err(Into::into)
    }
}
