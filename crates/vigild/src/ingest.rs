//! Registration ingestion.
//!
//! The web side drops one JSON artifact per candidate guest into the videos
//! directory, alongside a folder of frames extracted from their registration
//! video. On an interval the ingestor samples frames for confirmed artifacts
//! that still lack encodings, then promotes any artifact that has collected
//! enough into the guest store.

use crate::recognition::RecognitionModels;
use rand::seq::SliceRandom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use vigil_store::{pending, FaceGallery, PendingRegistration, Store, StoreError};

/// Artifacts worked on per cycle; keeps a burst of registrations from
/// monopolizing the interval.
const MAX_ARTIFACTS_PER_CYCLE: usize = 5;
/// Frames sampled per candidate per cycle.
const MAX_SAMPLE_FRAMES: usize = 25;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("frame sampling failed for {guest_id}: {source}")]
    Sample {
        guest_id: String,
        #[source]
        source: std::io::Error,
    },
}

/// Supplies candidate frames for a guest. Video decode stays outside the
/// daemon; the default implementation reads frame images pre-extracted
/// next to the artifact.
pub trait FrameSampler: Send {
    fn sample(&mut self, guest_id: &str, max: usize) -> Result<Vec<image::RgbImage>, IngestError>;
}

/// Samples random frame images from `{videos_dir}/{guest_id}/`.
pub struct DirFrameSampler {
    root: PathBuf,
}

impl DirFrameSampler {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

impl FrameSampler for DirFrameSampler {
    fn sample(&mut self, guest_id: &str, max: usize) -> Result<Vec<image::RgbImage>, IngestError> {
        let dir = self.root.join(guest_id);
        if !dir.is_dir() {
            tracing::warn!(guest_id, dir = %dir.display(), "no frame directory for candidate");
            return Ok(Vec::new());
        }

        let err = |source| IngestError::Sample {
            guest_id: guest_id.to_string(),
            source,
        };
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)
            .map_err(err)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("jpg") | Some("jpeg") | Some("png")
                )
            })
            .collect();
        paths.shuffle(&mut rand::thread_rng());
        paths.truncate(max);

        let mut frames = Vec::with_capacity(paths.len());
        for path in paths {
            match image::open(&path) {
                Ok(img) => frames.push(img.into_rgb8()),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "frame decode failed, skipping");
                }
            }
        }
        Ok(frames)
    }
}

pub struct RegistrationIngestor {
    videos_dir: PathBuf,
    store: Arc<Store>,
    gallery: Arc<FaceGallery>,
    sampler: Box<dyn FrameSampler>,
    models: RecognitionModels,
}

impl RegistrationIngestor {
    pub fn new(
        videos_dir: PathBuf,
        store: Arc<Store>,
        gallery: Arc<FaceGallery>,
        sampler: Box<dyn FrameSampler>,
        models: RecognitionModels,
    ) -> Self {
        Self {
            videos_dir,
            store,
            gallery,
            sampler,
            models,
        }
    }

    /// Run ingestion cycles on `interval` until the stop signal flips. A
    /// cycle in flight always completes before shutdown.
    pub async fn run(mut self, interval: Duration, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self = tokio::task::spawn_blocking(move || {
                        self.run_cycle();
                        self
                    })
                    .await
                    .expect("ingestion cycle panicked");
                }
                _ = stop.changed() => {
                    tracing::info!("registration ingestion stopping");
                    return;
                }
            }
        }
    }

    /// One ingestion cycle: encode, then promote.
    pub fn run_cycle(&mut self) {
        let artifacts = pending::scan_dir(&self.videos_dir);
        if artifacts.is_empty() {
            return;
        }
        tracing::debug!(count = artifacts.len(), "ingestion cycle");

        let mut worked = 0usize;
        for (path, mut reg) in artifacts {
            if reg.needs_encodings() {
                if worked >= MAX_ARTIFACTS_PER_CYCLE {
                    continue;
                }
                worked += 1;
                if let Err(err) = self.collect_encodings(&path, &mut reg) {
                    tracing::warn!(guest_id = reg.guest_id, error = %err, "encoding collection failed");
                    continue;
                }
            }

            if reg.promotable() {
                if let Err(err) = self.promote(&path, &reg) {
                    tracing::warn!(guest_id = reg.guest_id, error = %err, "promotion failed, artifact kept for retry");
                }
            }
        }
    }

    /// Sample frames for a candidate, embed the first face of each, and merge
    /// the embeddings into the artifact on disk.
    fn collect_encodings(
        &mut self,
        path: &Path,
        reg: &mut PendingRegistration,
    ) -> Result<(), IngestError> {
        let frames = self.sampler.sample(&reg.guest_id, MAX_SAMPLE_FRAMES)?;
        if frames.is_empty() {
            return Ok(());
        }

        let mut encodings = Vec::new();
        for frame in &frames {
            let boxes = match self.models.locator.locate(frame) {
                Ok(boxes) => boxes,
                Err(err) => {
                    tracing::warn!(error = %err, "face location failed on sampled frame");
                    continue;
                }
            };
            // Registration videos show one person; anything else is ambiguous.
            if boxes.len() != 1 {
                continue;
            }
            let face = crate::recognition::crop_face(frame, &boxes[0]);
            match self.models.embedder.embed(&face) {
                Ok(embedding) => encodings.push(embedding.values),
                Err(err) => {
                    tracing::warn!(error = %err, "embedding failed on sampled frame");
                }
            }
        }

        let added = reg.merge_encodings(encodings);
        if added > 0 {
            if let Err(err) = reg.save(path) {
                tracing::warn!(path = %path.display(), error = %err, "artifact save failed");
                return Ok(());
            }
            tracing::info!(
                guest_id = reg.guest_id,
                added,
                total = reg.valid_count(),
                "encodings merged into artifact"
            );
        }
        Ok(())
    }

    /// Write the candidate into the store and retire the artifact. The
    /// artifact's guest id is reused as the store key, so re-running a
    /// promotion whose delete failed is a no-op insert.
    fn promote(&self, path: &Path, reg: &PendingRegistration) -> Result<(), IngestError> {
        let inserted = self.store.promote_guest(reg)?;
        if inserted {
            self.gallery.invalidate();
            tracing::info!(guest_id = reg.guest_id, "guest promoted");
        } else {
            tracing::info!(guest_id = reg.guest_id, "guest already present, retiring artifact");
        }

        if let Err(err) = std::fs::remove_file(path) {
            // The next cycle retries; promote_guest is idempotent.
            tracing::warn!(path = %path.display(), error = %err, "artifact delete failed");
        }
        Ok(())
    }
}
