//! Zone presence tracking and identity matching.
//!
//! Pure domain logic for the attendance pipeline: bounding-box geometry,
//! the per-visit event state machine, and nearest-embedding matching.
//! Model inference and storage live behind the traits in [`capability`].

pub mod capability;
pub mod tracker;
pub mod types;

pub use capability::{CapabilityError, FaceEmbedder, FaceLocator, PersonDetector};
pub use tracker::{TrackerAction, TrackerConfig, ZoneTracker};
pub use types::{nearest_match, BoundingBox, Detection, Embedding, Frame, KnownFace, MatchOutcome};
