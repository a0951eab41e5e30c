//! ArcFace-style face embedder via ONNX Runtime.
//!
//! Takes a face crop, resizes to 112x112, and emits an L2-normalized
//! fixed-length embedding.

use crate::preprocess::resize_tensor;
use crate::ModelError;
use image::RgbImage;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use vigil_core::{CapabilityError, Embedding, FaceEmbedder};

const EMBED_INPUT_SIZE: u32 = 112;
const EMBED_MEAN: f32 = 127.5;
const EMBED_STD: f32 = 127.5;
/// Embedding dimensionality varies by export (128 for MobileFaceNet,
/// 512 for w600k); anything shorter than this is a broken model.
const EMBED_MIN_DIM: usize = 64;

pub struct FaceEmbeddingModel {
    session: Session,
}

impl FaceEmbeddingModel {
    pub fn load(model_path: &str) -> Result<Self, ModelError> {
        if !Path::new(model_path).exists() {
            return Err(ModelError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = model_path, "loaded face embedding model");

        Ok(Self { session })
    }

    fn run(&mut self, face: &RgbImage) -> Result<Embedding, ModelError> {
        let input = resize_tensor(face, EMBED_INPUT_SIZE, EMBED_INPUT_SIZE, EMBED_MEAN, EMBED_STD);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() < EMBED_MIN_DIM {
            return Err(ModelError::InferenceFailed(format!(
                "embedding too short: {} dims",
                raw.len()
            )));
        }

        let mut embedding = Embedding::new(raw.to_vec());
        embedding.l2_normalize();
        Ok(embedding)
    }
}

impl FaceEmbedder for FaceEmbeddingModel {
    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, CapabilityError> {
        self.run(face).map_err(Into::into)
    }
}
