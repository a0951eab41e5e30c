//! Pending-registration artifacts.
//!
//! A guest registered through the web side lands as one JSON file per
//! candidate identity in the videos directory. The artifact accumulates face
//! encodings over ingestion cycles until it is promotable, then it is written
//! into the store and deleted. The record is typed with an explicit schema
//! version and validated on read; malformed files are skipped, never deleted,
//! so they stay available for manual inspection.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const SCHEMA_VERSION: u32 = 1;
/// Hard cap on encodings kept per candidate.
pub const MAX_ENCODINGS: usize = 3;
/// Vectors shorter than this are degenerate (truncated or empty) and dropped.
pub const MIN_ENCODING_DIMS: usize = 16;
/// Valid encodings required before a confirmed artifact is promoted.
pub const PROMOTION_MIN_ENCODINGS: usize = 2;

#[derive(Error, Debug)]
pub enum PendingError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed artifact {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported schema version {version} in {path}")]
    UnsupportedVersion { path: PathBuf, version: u32 },
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

/// A not-yet-promoted identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRegistration {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub guest_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub guest_type: Option<String>,
    #[serde(default)]
    pub bed_no: Option<String>,
    #[serde(default)]
    pub confirmed: bool,
    #[serde(default)]
    pub face_encodings: Vec<Vec<f32>>,
}

impl PendingRegistration {
    pub fn valid_encodings(&self) -> impl Iterator<Item = &Vec<f32>> {
        self.face_encodings
            .iter()
            .filter(|e| e.len() >= MIN_ENCODING_DIMS)
    }

    pub fn valid_count(&self) -> usize {
        self.valid_encodings().count()
    }

    /// Confirmed but still short of promotable: the ingestion loop should
    /// sample more frames for this candidate.
    pub fn needs_encodings(&self) -> bool {
        self.confirmed && self.valid_count() < PROMOTION_MIN_ENCODINGS
    }

    pub fn promotable(&self) -> bool {
        self.confirmed && self.valid_count() >= PROMOTION_MIN_ENCODINGS
    }

    /// Merge freshly computed encodings into the artifact.
    ///
    /// Degenerate vectors are dropped, exact duplicates of already-stored
    /// vectors are skipped, and the total is capped at [`MAX_ENCODINGS`].
    /// Running the merge again with the same input is a no-op, which keeps a
    /// partially-processed artifact safe to reprocess.
    pub fn merge_encodings(&mut self, new: Vec<Vec<f32>>) -> usize {
        // Re-validate what is already stored; older artifacts may carry
        // degenerate entries.
        self.face_encodings.retain(|e| e.len() >= MIN_ENCODING_DIMS);

        let mut added = 0;
        for encoding in new {
            if self.face_encodings.len() >= MAX_ENCODINGS {
                break;
            }
            if encoding.len() < MIN_ENCODING_DIMS {
                continue;
            }
            if self.face_encodings.iter().any(|e| *e == encoding) {
                continue;
            }
            self.face_encodings.push(encoding);
            added += 1;
        }
        added
    }

    /// Parse and validate an artifact file.
    pub fn load(path: &Path) -> Result<Self, PendingError> {
        let raw = fs::read_to_string(path).map_err(|source| PendingError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let reg: PendingRegistration =
            serde_json::from_str(&raw).map_err(|source| PendingError::Malformed {
                path: path.to_path_buf(),
                source,
            })?;
        if reg.schema_version != SCHEMA_VERSION {
            return Err(PendingError::UnsupportedVersion {
                path: path.to_path_buf(),
                version: reg.schema_version,
            });
        }
        Ok(reg)
    }

    /// Write the artifact atomically: temp file in the same directory, then
    /// rename over the target.
    pub fn save(&self, path: &Path) -> Result<(), PendingError> {
        let json = serde_json::to_string_pretty(self).expect("artifact serializes infallibly");
        let tmp = path.with_extension("json.tmp");
        let io_err = |source| PendingError::Io { path: path.to_path_buf(), source };
        fs::write(&tmp, json).map_err(io_err)?;
        fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }
}

/// List all readable pending artifacts in `dir`. Malformed or
/// unsupported-version files are logged and left in place.
pub fn scan_dir(dir: &Path) -> Vec<(PathBuf, PendingRegistration)> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(dir = %dir.display(), error = %err, "cannot scan pending artifacts");
            return Vec::new();
        }
    };

    let mut artifacts = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match PendingRegistration::load(&path) {
            Ok(reg) => artifacts.push((path, reg)),
            Err(err) => {
                // Preserved for manual inspection, never deleted.
                tracing::warn!(error = %err, "skipping unreadable pending artifact");
            }
        }
    }
    artifacts.sort_by(|a, b| a.0.cmp(&b.0));
    artifacts
}
