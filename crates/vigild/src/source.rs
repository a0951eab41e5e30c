//! Frame acquisition.
//!
//! The daemon is decoupled from how frames arrive. `FrameSpool` is the
//! default source: an external producer drops JPEG frames into a spool
//! directory and the pipeline consumes them oldest-first.

use chrono::Utc;
use std::path::PathBuf;
use thiserror::Error;
use vigil_core::Frame;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("spool io: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame decode failed for {path}: {source}")]
    Decode {
        path: PathBuf,
        source: image::ImageError,
    },
}

/// A source of frames for the zone pipeline. `next_frame` returns `None`
/// when no frame is currently available.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError>;
}

/// Consumes JPEG frames from a spool directory, oldest first by file name.
/// Each consumed file is removed from the spool.
pub struct FrameSpool {
    dir: PathBuf,
    sequence: u64,
    /// Expected frame geometry; mismatches are logged, not rejected.
    expected_dims: Option<(u32, u32)>,
}

impl FrameSpool {
    pub fn new(dir: PathBuf) -> Result<Self, SourceError> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            sequence: 0,
            expected_dims: None,
        })
    }

    pub fn with_expected_dims(mut self, width: u32, height: u32) -> Self {
        self.expected_dims = Some((width, height));
        self
    }

    fn oldest_jpeg(&self) -> Result<Option<PathBuf>, SourceError> {
        let mut jpegs: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg"))
                    .unwrap_or(false)
            })
            .collect();
        jpegs.sort();
        Ok(jpegs.into_iter().next())
    }
}

impl FrameSource for FrameSpool {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        let Some(path) = self.oldest_jpeg()? else {
            return Ok(None);
        };

        let decoded = image::open(&path);
        // Consume the file either way so a corrupt frame cannot wedge the spool.
        if let Err(err) = std::fs::remove_file(&path) {
            tracing::warn!(path = %path.display(), error = %err, "failed to remove spool frame");
        }

        let image = decoded
            .map_err(|source| SourceError::Decode {
                path: path.clone(),
                source,
            })?
            .into_rgb8();

        if let Some((w, h)) = self.expected_dims {
            if image.dimensions() != (w, h) {
                tracing::debug!(
                    got = ?image.dimensions(),
                    expected = ?(w, h),
                    "frame geometry differs from configured camera feed"
                );
            }
        }

        self.sequence += 1;
        Ok(Some(Frame {
            image,
            sequence: self.sequence,
            captured_at: Utc::now(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn write_jpeg(dir: &std::path::Path, name: &str) {
        let image = RgbImage::from_pixel(8, 8, image::Rgb([10, 20, 30]));
        image.save(dir.join(name)).unwrap();
    }

    #[test]
    fn test_spool_consumes_oldest_first() {
        let tmp = tempfile::tempdir().unwrap();
        write_jpeg(tmp.path(), "0002.jpg");
        write_jpeg(tmp.path(), "0001.jpg");

        let mut spool = FrameSpool::new(tmp.path().to_path_buf()).unwrap();
        let first = spool.next_frame().unwrap().unwrap();
        assert_eq!(first.sequence, 1);
        // The first file by name is gone, one remains.
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 1);

        let second = spool.next_frame().unwrap().unwrap();
        assert_eq!(second.sequence, 2);
        assert!(spool.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_spool_drops_corrupt_frame() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("bad.jpg"), b"not a jpeg").unwrap();

        let mut spool = FrameSpool::new(tmp.path().to_path_buf()).unwrap();
        assert!(spool.next_frame().is_err());
        // Corrupt file was consumed rather than retried forever.
        assert!(spool.next_frame().unwrap().is_none());
    }
}
