//! The zone pipeline loop.
//!
//! Runs on a dedicated OS thread: pull a frame, crop to the region of
//! interest, hand it to the detector worker, feed completed batches to the
//! zone tracker, and execute the tracker's actions. Idle passes are spent
//! dispatching one orphaned capture backlog entry at a time.

use crate::capture::FrameCapturer;
use crate::config::Roi;
use crate::detector::DetectorWorker;
use crate::recognition::RecognitionDispatcher;
use crate::source::FrameSource;
use image::imageops;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use vigil_core::{Frame, TrackerAction, ZoneTracker};

/// Pacing between loop passes when no work arrived.
const IDLE_PACING: Duration = Duration::from_millis(30);

pub struct ZonePipeline {
    pub source: Box<dyn FrameSource>,
    pub detector: DetectorWorker,
    pub tracker: ZoneTracker,
    pub capturer: Arc<FrameCapturer>,
    pub dispatcher: Arc<RecognitionDispatcher>,
    pub roi: Roi,
}

impl ZonePipeline {
    /// Spawn the pipeline thread. Flipping `stop` to `true` makes the loop
    /// stop submitting frames and exit; the detector worker drains as its
    /// queue closes on drop.
    pub fn spawn(mut self, stop: watch::Receiver<bool>) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("vigil-pipeline".into())
            .spawn(move || {
                tracing::info!("pipeline thread started");
                while !*stop.borrow() {
                    let did_work = self.pass();
                    if !did_work {
                        std::thread::sleep(IDLE_PACING);
                    }
                }
                tracing::info!("pipeline thread exiting");
            })
            .expect("failed to spawn pipeline thread")
    }

    /// One loop pass. Returns whether any frame moved.
    fn pass(&mut self) -> bool {
        let mut did_work = false;

        match self.source.next_frame() {
            Ok(Some(frame)) => {
                did_work = true;
                let cropped = crop_roi(frame, self.roi);
                self.detector.submit(cropped);
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(error = %err, "frame source error");
            }
        }

        while let Some((frame, detections)) = self.detector.try_recv() {
            did_work = true;
            let actions = self.tracker.observe(&detections, frame.captured_at);
            self.execute(&frame, actions);
        }

        if !did_work && !self.tracker.event_active() {
            self.dispatch_backlog();
        }

        did_work
    }

    fn execute(&mut self, frame: &Frame, actions: Vec<TrackerAction>) {
        for action in actions {
            match action {
                TrackerAction::EventStarted { event_id } => {
                    tracing::info!(event_id, "zone event started");
                }
                TrackerAction::Capture {
                    photo_id,
                    seq,
                    total_humans,
                } => {
                    if let Err(err) =
                        self.capturer
                            .save(frame, &photo_id, seq, total_humans as u32)
                    {
                        tracing::warn!(photo_id, error = %err, "capture save failed");
                    }
                }
                TrackerAction::EventEnded {
                    event_id,
                    dispatch,
                    discarded,
                } => {
                    tracing::info!(
                        event_id,
                        dispatching = dispatch.len(),
                        discarded,
                        "zone event ended"
                    );
                    for photo_id in dispatch {
                        // Saturated dispatches stay on disk for the backlog scan.
                        self.dispatcher.dispatch(&photo_id);
                    }
                }
            }
        }
    }

    /// Hand one orphaned photo id to recognition. Orphans accumulate when a
    /// dispatch was dropped under saturation or a previous run crashed
    /// mid-event.
    fn dispatch_backlog(&self) {
        match self.capturer.first_unprocessed_photo_id() {
            Ok(Some(photo_id)) => {
                tracing::info!(photo_id, "dispatching backlog captures");
                self.dispatcher.dispatch(&photo_id);
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(error = %err, "backlog scan failed");
            }
        }
    }
}

/// Crop a frame to the region of interest, clamped to the frame bounds.
fn crop_roi(frame: Frame, roi: Roi) -> Frame {
    let (w, h) = frame.image.dimensions();
    let left = roi.left.min(w.saturating_sub(1));
    let top = roi.top.min(h.saturating_sub(1));
    let width = roi.width().clamp(1, w - left);
    let height = roi.height().clamp(1, h - top);
    if (left, top, width, height) == (0, 0, w, h) {
        return frame;
    }
    Frame {
        image: imageops::crop_imm(&frame.image, left, top, width, height).to_image(),
        sequence: frame.sequence,
        captured_at: frame.captured_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use image::RgbImage;

    #[test]
    fn test_crop_roi_clamps_to_frame() {
        let frame = Frame {
            image: RgbImage::new(100, 80),
            sequence: 1,
            captured_at: Utc::now(),
        };
        let roi = Roi {
            top: 10,
            bottom: 200,
            left: 20,
            right: 300,
        };
        let cropped = crop_roi(frame, roi);
        assert_eq!(cropped.image.dimensions(), (80, 70));
        assert_eq!(cropped.sequence, 1);
    }

    #[test]
    fn test_crop_roi_full_frame_is_identity() {
        let frame = Frame {
            image: RgbImage::new(50, 40),
            sequence: 7,
            captured_at: Utc::now(),
        };
        let roi = Roi {
            top: 0,
            bottom: 40,
            left: 0,
            right: 50,
        };
        assert_eq!(crop_roi(frame, roi).image.dimensions(), (50, 40));
    }
}
