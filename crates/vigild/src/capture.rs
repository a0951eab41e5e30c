//! Capture persistence.
//!
//! Each dispatched track leaves a set of JPEG files named
//! `{photo_id}_{seq:02}_{human_count}.jpg` under `{capture_dir}/{camera_id}/`.
//! The filename is the only index: recognition lists a photo id back out of
//! the directory, and a crash leaves recoverable files behind rather than
//! dangling in-memory state.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use thiserror::Error;
use vigil_core::Frame;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("capture io: {0}")]
    Io(#[from] std::io::Error),
    #[error("jpeg encode failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// One stored capture, parsed back from its filename.
#[derive(Debug, Clone)]
pub struct CaptureFile {
    pub path: PathBuf,
    pub seq: u32,
    pub human_count: u32,
    pub modified_at: DateTime<Utc>,
}

pub struct FrameCapturer {
    base: PathBuf,
}

impl FrameCapturer {
    /// Capturer rooted at `{capture_dir}/{camera_id}`.
    pub fn new(capture_dir: &Path, camera_id: &str) -> Result<Self, CaptureError> {
        let base = capture_dir.join(camera_id);
        std::fs::create_dir_all(&base)?;
        Ok(Self { base })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    /// Write `frame` as the `seq`-th capture of `photo_id`.
    pub fn save(
        &self,
        frame: &Frame,
        photo_id: &str,
        seq: u32,
        human_count: u32,
    ) -> Result<PathBuf, CaptureError> {
        let path = self
            .base
            .join(format!("{photo_id}_{seq:02}_{human_count}.jpg"));
        frame.image.save(&path)?;
        tracing::debug!(path = %path.display(), "capture saved");
        Ok(path)
    }

    /// All captures of `photo_id`, sorted most-humans-first so recognition
    /// sees the busiest frames first.
    pub fn list(&self, photo_id: &str) -> Result<Vec<CaptureFile>, CaptureError> {
        let prefix = format!("{photo_id}_");
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.base)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(&prefix) {
                continue;
            }
            let Some((seq, human_count)) = parse_capture_name(name, photo_id) else {
                tracing::warn!(name, "unparseable capture filename, skipping");
                continue;
            };
            let modified_at = entry.metadata()?.modified().map(DateTime::from)?;
            files.push(CaptureFile {
                path: entry.path(),
                seq,
                human_count,
                modified_at,
            });
        }
        files.sort_by(|a, b| b.human_count.cmp(&a.human_count).then(a.seq.cmp(&b.seq)));
        Ok(files)
    }

    /// Oldest photo id with capture files but no in-progress marker
    /// directory. Recovers captures orphaned by a crash or a saturated
    /// dispatcher.
    pub fn first_unprocessed_photo_id(&self) -> Result<Option<String>, CaptureError> {
        let mut oldest: Option<(DateTime<Utc>, String)> = None;
        for entry in std::fs::read_dir(&self.base)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(photo_id) = photo_id_of(name) else { continue };
            if self.base.join(&photo_id).is_dir() {
                // Marker directory present: a worker owns this photo id.
                continue;
            }
            let modified_at: DateTime<Utc> = entry.metadata()?.modified().map(DateTime::from)?;
            match &oldest {
                Some((ts, _)) if *ts <= modified_at => {}
                _ => oldest = Some((modified_at, photo_id)),
            }
        }
        Ok(oldest.map(|(_, id)| id))
    }

    /// Directory for a worker's inspection crops; doubles as the
    /// in-progress marker for `first_unprocessed_photo_id`.
    pub fn claim_dir(&self, photo_id: &str) -> Result<PathBuf, CaptureError> {
        let dir = self.base.join(photo_id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Remove all capture files of `photo_id`. Failures on individual files
    /// are logged and skipped.
    pub fn delete_captures(&self, photo_id: &str) -> Result<(), CaptureError> {
        for file in self.list(photo_id)? {
            if let Err(err) = std::fs::remove_file(&file.path) {
                tracing::warn!(path = %file.path.display(), error = %err, "capture delete failed");
            }
        }
        Ok(())
    }

    /// Remove the inspection/marker directory of `photo_id`.
    pub fn purge_claim_dir(&self, photo_id: &str) {
        let dir = self.base.join(photo_id);
        if dir.is_dir() {
            if let Err(err) = std::fs::remove_dir_all(&dir) {
                tracing::warn!(path = %dir.display(), error = %err, "claim dir purge failed");
            }
        }
    }

    /// Delete capture files older than `age`. Bounds disk usage when running
    /// inside a container with no external cleanup.
    pub fn sweep_older_than(&self, age: chrono::Duration) -> Result<usize, CaptureError> {
        let cutoff = Utc::now() - age;
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.base)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let modified_at: DateTime<Utc> = entry.metadata()?.modified().map(DateTime::from)?;
            if modified_at < cutoff {
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(err) => {
                        tracing::warn!(path = %entry.path().display(), error = %err, "sweep delete failed");
                    }
                }
            }
        }
        if removed > 0 {
            tracing::info!(removed, "swept expired captures");
        }
        Ok(removed)
    }
}

/// Whether the daemon is running inside a container.
pub fn in_container() -> bool {
    Path::new("/.dockerenv").exists()
}

/// Parse `{photo_id}_{seq:02}_{human_count}.jpg` given a known photo id.
fn parse_capture_name(name: &str, photo_id: &str) -> Option<(u32, u32)> {
    let rest = name
        .strip_prefix(photo_id)?
        .strip_prefix('_')?
        .strip_suffix(".jpg")?;
    let (seq, humans) = rest.split_once('_')?;
    Some((seq.parse().ok()?, humans.parse().ok()?))
}

/// Extract the photo id from a capture filename. Photo ids contain no
/// underscores, so everything before the first `_` is the id.
fn photo_id_of(name: &str) -> Option<String> {
    if !name.ends_with(".jpg") {
        return None;
    }
    let (id, _) = name.split_once('_')?;
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use image::RgbImage;

    fn frame() -> Frame {
        Frame {
            image: RgbImage::from_pixel(6, 6, image::Rgb([1, 2, 3])),
            sequence: 1,
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn test_save_list_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let capturer = FrameCapturer::new(tmp.path(), "LIFT").unwrap();

        capturer.save(&frame(), "250823120000123-0001-t1", 1, 2).unwrap();
        capturer.save(&frame(), "250823120000123-0001-t1", 2, 5).unwrap();
        capturer.save(&frame(), "250823120000123-0001-t2", 1, 1).unwrap();

        let files = capturer.list("250823120000123-0001-t1").unwrap();
        assert_eq!(files.len(), 2);
        // Most humans first.
        assert_eq!(files[0].human_count, 5);
        assert_eq!(files[0].seq, 2);
        assert_eq!(files[1].human_count, 2);
    }

    #[test]
    fn test_parse_capture_name() {
        assert_eq!(
            parse_capture_name("abc-0001-t3_07_4.jpg", "abc-0001-t3"),
            Some((7, 4))
        );
        assert_eq!(parse_capture_name("abc-0001-t3_bad.jpg", "abc-0001-t3"), None);
        assert_eq!(photo_id_of("abc-0001-t3_07_4.jpg"), Some("abc-0001-t3".into()));
        assert_eq!(photo_id_of("noext_01_1.png"), None);
    }

    #[test]
    fn test_first_unprocessed_skips_claimed() {
        let tmp = tempfile::tempdir().unwrap();
        let capturer = FrameCapturer::new(tmp.path(), "LIFT").unwrap();

        capturer.save(&frame(), "a-0001-t1", 1, 1).unwrap();
        capturer.save(&frame(), "b-0002-t1", 1, 1).unwrap();

        capturer.claim_dir("a-0001-t1").unwrap();
        assert_eq!(
            capturer.first_unprocessed_photo_id().unwrap(),
            Some("b-0002-t1".to_string())
        );

        capturer.claim_dir("b-0002-t1").unwrap();
        assert_eq!(capturer.first_unprocessed_photo_id().unwrap(), None);
    }

    #[test]
    fn test_delete_and_sweep() {
        let tmp = tempfile::tempdir().unwrap();
        let capturer = FrameCapturer::new(tmp.path(), "LIFT").unwrap();

        capturer.save(&frame(), "a-0001-t1", 1, 1).unwrap();
        capturer.save(&frame(), "a-0001-t1", 2, 1).unwrap();
        capturer.delete_captures("a-0001-t1").unwrap();
        assert!(capturer.list("a-0001-t1").unwrap().is_empty());

        capturer.save(&frame(), "b-0002-t1", 1, 1).unwrap();
        // Nothing is older than a day.
        assert_eq!(capturer.sweep_older_than(chrono::Duration::days(1)).unwrap(), 0);
        // Everything is older than a negative cutoff in the future.
        assert_eq!(
            capturer.sweep_older_than(chrono::Duration::seconds(-60)).unwrap(),
            1
        );
    }
}
