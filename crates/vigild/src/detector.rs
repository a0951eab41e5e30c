//! Person detection worker.
//!
//! Inference runs serially on a dedicated OS thread behind a pair of
//! bounded queues. The capture loop never blocks on detection: when the
//! inbound queue is full, frames are dropped at the submission site.

use tokio::sync::mpsc;
use vigil_core::{Detection, Frame, PersonDetector};

const QUEUE_CAPACITY: usize = 5;

/// Handle to the detection thread. Dropping it closes the inbound queue,
/// letting the thread drain outstanding frames and exit.
pub struct DetectorWorker {
    in_tx: mpsc::Sender<Frame>,
    out_rx: mpsc::Receiver<(Frame, Vec<Detection>)>,
}

impl DetectorWorker {
    /// Spawn the detection thread around `detector`.
    pub fn spawn(mut detector: Box<dyn PersonDetector>) -> Self {
        let (in_tx, mut in_rx) = mpsc::channel::<Frame>(QUEUE_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel::<(Frame, Vec<Detection>)>(QUEUE_CAPACITY);

        std::thread::Builder::new()
            .name("vigil-detector".into())
            .spawn(move || {
                tracing::info!("detector thread started");
                while let Some(frame) = in_rx.blocking_recv() {
                    match detector.detect(&frame.image) {
                        Ok(detections) => {
                            if out_tx.blocking_send((frame, detections)).is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            tracing::warn!(
                                sequence = frame.sequence,
                                error = %err,
                                "detection failed, skipping frame"
                            );
                        }
                    }
                }
                tracing::info!("detector thread exiting");
            })
            .expect("failed to spawn detector thread");

        Self { in_tx, out_rx }
    }

    /// Offer a frame to the detector. Returns `false` if the queue is full
    /// and the frame was dropped.
    pub fn submit(&self, frame: Frame) -> bool {
        match self.in_tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                tracing::warn!(sequence = frame.sequence, "detector queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("detector thread gone, dropping frame");
                false
            }
        }
    }

    /// Pull the next completed detection batch, if any.
    pub fn try_recv(&mut self) -> Option<(Frame, Vec<Detection>)> {
        self.out_rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use image::RgbImage;
    use std::sync::mpsc as std_mpsc;
    use std::sync::Mutex;
    use vigil_core::{BoundingBox, CapabilityError};

    fn frame(sequence: u64) -> Frame {
        Frame {
            image: RgbImage::new(4, 4),
            sequence,
            captured_at: Utc::now(),
        }
    }

    /// Blocks each `detect` call until a token arrives on the gate channel.
    struct GatedDetector {
        gate: Mutex<std_mpsc::Receiver<()>>,
    }

    impl PersonDetector for GatedDetector {
        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<Detection>, CapabilityError> {
            self.gate.lock().unwrap().recv().ok();
            Ok(vec![Detection {
                bbox: BoundingBox::new(0.0, 0.0, 10.0, 10.0),
                class_id: 0,
                confidence: 0.9,
            }])
        }
    }

    struct FailingDetector;

    impl PersonDetector for FailingDetector {
        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<Detection>, CapabilityError> {
            Err(CapabilityError::Inference("boom".into()))
        }
    }

    #[test]
    fn test_submit_drops_when_queue_full() {
        let (gate_tx, gate_rx) = std_mpsc::channel();
        let mut worker = DetectorWorker::spawn(Box::new(GatedDetector {
            gate: Mutex::new(gate_rx),
        }));

        // The thread pulls at most one frame off the queue before blocking in
        // detect, so at most capacity + 1 submissions can succeed.
        let mut accepted = 0u64;
        for seq in 0..20 {
            if worker.submit(frame(seq)) {
                accepted += 1;
            }
        }
        assert!(accepted >= QUEUE_CAPACITY as u64);
        assert!(accepted <= QUEUE_CAPACITY as u64 + 1);

        // Release every queued frame and confirm results flow out.
        for _ in 0..accepted {
            gate_tx.send(()).unwrap();
        }
        let mut received = 0u64;
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while received < accepted && std::time::Instant::now() < deadline {
            if let Some((_, detections)) = worker.try_recv() {
                assert_eq!(detections.len(), 1);
                received += 1;
            } else {
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
        }
        assert_eq!(received, accepted);
    }

    #[test]
    fn test_detection_errors_are_skipped() {
        let mut worker = DetectorWorker::spawn(Box::new(FailingDetector));
        assert!(worker.submit(frame(1)));

        std::thread::sleep(std::time::Duration::from_millis(100));
        assert!(worker.try_recv().is_none());

        // Worker is still alive and accepting after the failure.
        assert!(worker.submit(frame(2)));
    }
}
