//! ONNX-backed implementations of the pipeline's external model
//! capabilities.
//!
//! Person detection uses a YOLOv8 export, face location an UltraFace
//! (version-RFB-320) export, and embeddings an ArcFace-style 112x112 model,
//! all via ONNX Runtime on CPU. The pipeline itself only sees the
//! `vigil-core` capability traits.

pub mod embedder;
pub mod face;
pub mod person;
mod preprocess;

use thiserror::Error;
use vigil_core::CapabilityError;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl From<ModelError> for CapabilityError {
    fn from(err: ModelError) -> Self {
        CapabilityError::Inference(err.to_string())
    }
}

pub use embedder::FaceEmbeddingModel;
pub use face::UltraFaceLocator;
pub use person::YoloPersonDetector;
