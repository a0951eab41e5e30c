//! Recognition dispatch.
//!
//! A `Semaphore` of capacity N caps concurrent recognition work; when it is
//! saturated new photo ids are dropped, never queued; the capture files
//! remain on disk and the pipeline's idle backlog scan retries them later.
//! Each permit owns one `RecognitionModels` instance checked out of a pool,
//! returned by a drop guard so a panicking worker leaks neither the permit
//! nor the models.

use crate::capture::{CaptureError, FrameCapturer};
use image::{imageops, RgbImage};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use vigil_core::{nearest_match, BoundingBox, FaceEmbedder, FaceLocator};
use vigil_store::{AttendanceLedger, FaceGallery, Store, StoreError};

const ATTENDANCE_METHOD: &str = "face";
const UNKNOWN_GUEST: &str = "unknown";

#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The pair of models one worker needs.
pub struct RecognitionModels {
    pub locator: Box<dyn FaceLocator>,
    pub embedder: Box<dyn FaceEmbedder>,
}

struct BackendPool {
    idle: Mutex<Vec<RecognitionModels>>,
}

/// Checked-out models plus the permit that entitled the checkout. Drop
/// returns the models to the pool, then releases the permit.
struct PooledBackend {
    models: Option<RecognitionModels>,
    pool: Arc<BackendPool>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for PooledBackend {
    fn drop(&mut self) {
        if let Some(models) = self.models.take() {
            self.pool
                .idle
                .lock()
                .expect("backend pool lock poisoned")
                .push(models);
        }
    }
}

pub struct RecognitionDispatcher {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    pool: Arc<BackendPool>,
    runtime: tokio::runtime::Handle,
    capturer: Arc<FrameCapturer>,
    store: Arc<Store>,
    gallery: Arc<FaceGallery>,
    ledger: Arc<AttendanceLedger>,
    match_tolerance: f32,
    camera_id: String,
    retention: chrono::Duration,
    container: bool,
}

impl RecognitionDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        models: Vec<RecognitionModels>,
        runtime: tokio::runtime::Handle,
        capturer: Arc<FrameCapturer>,
        store: Arc<Store>,
        gallery: Arc<FaceGallery>,
        ledger: Arc<AttendanceLedger>,
        match_tolerance: f32,
        camera_id: String,
        retention: chrono::Duration,
        container: bool,
    ) -> Self {
        let capacity = models.len();
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            pool: Arc::new(BackendPool {
                idle: Mutex::new(models),
            }),
            runtime,
            capturer,
            store,
            gallery,
            ledger,
            match_tolerance,
            camera_id,
            retention,
            container,
        }
    }

    /// Start a recognition worker for `photo_id`. Returns `false` when all
    /// permits are taken; the photo id is dropped, not queued.
    pub fn dispatch(&self, photo_id: &str) -> bool {
        let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::warn!(photo_id, "recognition saturated, dropping dispatch");
                return false;
            }
        };

        // A permit guarantees an idle backend exists.
        let models = self
            .pool
            .idle
            .lock()
            .expect("backend pool lock poisoned")
            .pop()
            .expect("backend pool out of sync with semaphore");
        let mut backend = PooledBackend {
            models: Some(models),
            pool: Arc::clone(&self.pool),
            _permit: permit,
        };

        let photo_id = photo_id.to_string();
        let capturer = Arc::clone(&self.capturer);
        let store = Arc::clone(&self.store);
        let gallery = Arc::clone(&self.gallery);
        let ledger = Arc::clone(&self.ledger);
        let tolerance = self.match_tolerance;
        let camera_id = self.camera_id.clone();
        let retention = self.retention;
        let container = self.container;

        self.runtime.spawn_blocking(move || {
            let models = backend.models.as_mut().expect("models present until drop");
            let result = process_photo(
                &photo_id, models, &capturer, &store, &gallery, &ledger, tolerance, &camera_id,
            );
            if let Err(err) = result {
                tracing::warn!(photo_id, error = %err, "recognition failed");
                // Release the claim so the backlog scan can redispatch the
                // surviving captures.
                capturer.purge_claim_dir(&photo_id);
            }
            if container {
                capturer.purge_claim_dir(&photo_id);
                if let Err(err) = capturer.sweep_older_than(retention) {
                    tracing::warn!(error = %err, "retention sweep failed");
                }
            }
            drop(backend);
        });
        true
    }

    /// Wait until every in-flight worker has finished.
    pub async fn wait_idle(&self) {
        let all = self
            .semaphore
            .acquire_many(self.capacity as u32)
            .await
            .expect("dispatcher semaphore closed");
        drop(all);
    }
}

/// Run one photo id end to end: list captures, locate and crop faces, embed,
/// match against the gallery, and record attendance. Per-capture and
/// per-face failures are logged and skipped.
#[allow(clippy::too_many_arguments)]
fn process_photo(
    photo_id: &str,
    models: &mut RecognitionModels,
    capturer: &FrameCapturer,
    store: &Store,
    gallery: &FaceGallery,
    ledger: &AttendanceLedger,
    tolerance: f32,
    camera_id: &str,
) -> Result<(), RecognitionError> {
    let files = capturer.list(photo_id)?;
    if files.is_empty() {
        tracing::debug!(photo_id, "no captures to recognize");
        return Ok(());
    }
    let known = gallery.get_or_load(store)?;
    // Claimed only once the gallery snapshot is in hand; a marker without a
    // live worker would hide the photo id from the backlog scan.
    let inspection_dir = capturer.claim_dir(photo_id)?;

    let mut faces_seen = 0usize;
    let mut marks = 0usize;
    for file in &files {
        let image = match image::open(&file.path) {
            Ok(img) => img.into_rgb8(),
            Err(err) => {
                tracing::warn!(path = %file.path.display(), error = %err, "capture decode failed, skipping");
                continue;
            }
        };

        let boxes = match models.locator.locate(&image) {
            Ok(boxes) => boxes,
            Err(err) => {
                tracing::warn!(path = %file.path.display(), error = %err, "face location failed, skipping");
                continue;
            }
        };

        for (face_idx, bbox) in boxes.iter().enumerate() {
            let face = crop_face(&image, bbox);
            let crop_path = inspection_dir.join(format!("{:02}_{face_idx}.jpg", file.seq));
            if let Err(err) = face.save(&crop_path) {
                tracing::warn!(path = %crop_path.display(), error = %err, "inspection crop save failed");
            }

            let embedding = match models.embedder.embed(&face) {
                Ok(e) => e,
                Err(err) => {
                    tracing::warn!(error = %err, "embedding failed, skipping face");
                    continue;
                }
            };
            faces_seen += 1;

            let outcome = nearest_match(&embedding, &known, tolerance);
            let guest_id = outcome
                .guest_id
                .as_deref()
                .unwrap_or(UNKNOWN_GUEST)
                .to_string();
            tracing::debug!(
                photo_id,
                guest_id,
                matched = outcome.matched,
                distance = outcome.distance,
                "face matched"
            );

            match ledger.mark(&guest_id, file.modified_at, camera_id, ATTENDANCE_METHOD) {
                Ok(true) => marks += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(guest_id, error = %err, "attendance insert failed");
                }
            }
        }
    }

    capturer.delete_captures(photo_id)?;
    tracing::info!(
        photo_id,
        captures = files.len(),
        faces = faces_seen,
        recorded = marks,
        "recognition complete"
    );
    Ok(())
}

/// Crop a located face out of the full capture, clamped to image bounds.
pub(crate) fn crop_face(image: &RgbImage, bbox: &BoundingBox) -> RgbImage {
    let (w, h) = image.dimensions();
    let x = bbox.x.max(0.0) as u32;
    let y = bbox.y.max(0.0) as u32;
    let cw = (bbox.width as u32).clamp(1, w.saturating_sub(x).max(1));
    let ch = (bbox.height as u32).clamp(1, h.saturating_sub(y).max(1));
    imageops::crop_imm(image, x.min(w - 1), y.min(h - 1), cw, ch).to_image()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::mpsc as std_mpsc;
    use vigil_core::{CapabilityError, Embedding, Frame};

    struct WholeFrameLocator;

    impl FaceLocator for WholeFrameLocator {
        fn locate(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, CapabilityError> {
            let (w, h) = image.dimensions();
            Ok(vec![BoundingBox::new(0.0, 0.0, w as f32, h as f32)])
        }
    }

    struct StaticEmbedder;

    impl FaceEmbedder for StaticEmbedder {
        fn embed(&mut self, _face: &RgbImage) -> Result<Embedding, CapabilityError> {
            Ok(Embedding::new(vec![0.0; 128]))
        }
    }

    /// Blocks each embed call until a token arrives on the gate channel.
    struct GatedEmbedder {
        gate: Mutex<std_mpsc::Receiver<()>>,
    }

    impl FaceEmbedder for GatedEmbedder {
        fn embed(&mut self, _face: &RgbImage) -> Result<Embedding, CapabilityError> {
            self.gate.lock().unwrap().recv().ok();
            Ok(Embedding::new(vec![0.0; 128]))
        }
    }

    fn frame() -> Frame {
        Frame {
            image: RgbImage::from_pixel(8, 8, image::Rgb([9, 9, 9])),
            sequence: 1,
            captured_at: Utc::now(),
        }
    }

    fn dispatcher_with(
        models: Vec<RecognitionModels>,
        capturer: Arc<FrameCapturer>,
    ) -> RecognitionDispatcher {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let ledger = Arc::new(AttendanceLedger::new(
            Arc::clone(&store),
            chrono::Duration::seconds(30),
        ));
        RecognitionDispatcher::new(
            models,
            tokio::runtime::Handle::current(),
            capturer,
            store,
            Arc::new(FaceGallery::new()),
            ledger,
            0.5,
            "LIFT".to_string(),
            chrono::Duration::minutes(120),
            false,
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_saturated_dispatcher_drops_third() {
        let tmp = tempfile::tempdir().unwrap();
        let capturer = Arc::new(FrameCapturer::new(tmp.path(), "LIFT").unwrap());
        for id in ["a-0001-t1", "a-0001-t2", "a-0001-t3"] {
            capturer.save(&frame(), id, 1, 1).unwrap();
        }

        let (gate_tx, gate_rx1) = std_mpsc::channel();
        let (gate_tx2, gate_rx2) = std_mpsc::channel();
        let models = vec![
            RecognitionModels {
                locator: Box::new(WholeFrameLocator),
                embedder: Box::new(GatedEmbedder {
                    gate: Mutex::new(gate_rx1),
                }),
            },
            RecognitionModels {
                locator: Box::new(WholeFrameLocator),
                embedder: Box::new(GatedEmbedder {
                    gate: Mutex::new(gate_rx2),
                }),
            },
        ];
        let dispatcher = dispatcher_with(models, Arc::clone(&capturer));

        assert!(dispatcher.dispatch("a-0001-t1"));
        assert!(dispatcher.dispatch("a-0001-t2"));
        // Both permits taken: the third photo id is dropped, not queued.
        assert!(!dispatcher.dispatch("a-0001-t3"));

        gate_tx.send(()).unwrap();
        gate_tx2.send(()).unwrap();
        dispatcher.wait_idle().await;

        // The dropped photo id still has its captures for the backlog scan.
        assert!(capturer.list("a-0001-t1").unwrap().is_empty());
        assert!(capturer.list("a-0001-t2").unwrap().is_empty());
        assert_eq!(capturer.list("a-0001-t3").unwrap().len(), 1);

        // Permits and models both returned.
        assert!(dispatcher.dispatch("a-0001-t3"));
        gate_tx.send(()).ok();
        gate_tx2.send(()).ok();
        dispatcher.wait_idle().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_worker_leaves_photo_redispatchable() {
        let tmp = tempfile::tempdir().unwrap();
        let capturer = Arc::new(FrameCapturer::new(tmp.path(), "LIFT").unwrap());
        capturer.save(&frame(), "c-0001-t1", 1, 1).unwrap();

        // A stray file squatting on the claim path makes the worker fail
        // before it processes anything.
        let blocker = capturer.base_dir().join("c-0001-t1");
        std::fs::write(&blocker, b"").unwrap();

        let models = vec![RecognitionModels {
            locator: Box::new(WholeFrameLocator),
            embedder: Box::new(StaticEmbedder),
        }];
        let dispatcher = dispatcher_with(models, Arc::clone(&capturer));

        assert!(dispatcher.dispatch("c-0001-t1"));
        dispatcher.wait_idle().await;

        // The captures survive the failure and no marker hides the photo id
        // from the backlog scan.
        assert_eq!(capturer.list("c-0001-t1").unwrap().len(), 1);
        assert_eq!(
            capturer.first_unprocessed_photo_id().unwrap(),
            Some("c-0001-t1".to_string())
        );

        // Once the obstruction clears, a retry consumes the captures.
        std::fs::remove_file(&blocker).unwrap();
        assert!(dispatcher.dispatch("c-0001-t1"));
        dispatcher.wait_idle().await;
        assert!(capturer.list("c-0001-t1").unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_worker_records_attendance_and_deletes_captures() {
        let tmp = tempfile::tempdir().unwrap();
        let capturer = Arc::new(FrameCapturer::new(tmp.path(), "LIFT").unwrap());
        capturer.save(&frame(), "b-0001-t1", 1, 1).unwrap();
        capturer.save(&frame(), "b-0001-t1", 2, 2).unwrap();

        let (gate_tx, gate_rx) = std_mpsc::channel();
        // Pre-load enough tokens that the worker never blocks.
        for _ in 0..4 {
            gate_tx.send(()).unwrap();
        }
        let models = vec![RecognitionModels {
            locator: Box::new(WholeFrameLocator),
            embedder: Box::new(GatedEmbedder {
                gate: Mutex::new(gate_rx),
            }),
        }];

        let store = Arc::new(Store::open_in_memory().unwrap());
        let ledger = Arc::new(AttendanceLedger::new(
            Arc::clone(&store),
            chrono::Duration::seconds(30),
        ));
        let dispatcher = RecognitionDispatcher::new(
            models,
            tokio::runtime::Handle::current(),
            Arc::clone(&capturer),
            Arc::clone(&store),
            Arc::new(FaceGallery::new()),
            Arc::clone(&ledger),
            0.5,
            "LIFT".to_string(),
            chrono::Duration::minutes(120),
            false,
        );

        assert!(dispatcher.dispatch("b-0001-t1"));
        dispatcher.wait_idle().await;

        // Empty gallery: both faces resolve to "unknown", and the two capture
        // mtimes fall within one cooldown window, so exactly one row lands.
        let rows = store.recent_attendance(10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].guest_id, "unknown");
        assert_eq!(rows[0].device_id, "LIFT");

        assert!(capturer.list("b-0001-t1").unwrap().is_empty());
    }
}
