//! External model capabilities.
//!
//! The detection and embedding models are black boxes to the pipeline:
//! synchronous functions provided by an external runtime. Workers own a
//! `Box<dyn ...>` and call them serially; the implementations are not
//! assumed reentrant.

use crate::types::{BoundingBox, Detection, Embedding};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CapabilityError {
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("bad input: {0}")]
    BadInput(String),
}

/// Object detection over a full frame: `Detect(frame) -> [box, class, confidence]`.
pub trait PersonDetector: Send {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, CapabilityError>;
}

/// Face location within an image: `Locate(image) -> [box]`.
pub trait FaceLocator: Send {
    fn locate(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, CapabilityError>;
}

/// Face embedding extraction: `Embed(faceImage) -> FixedVector`.
pub trait FaceEmbedder: Send {
    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, CapabilityError>;
}
