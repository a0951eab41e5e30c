use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Object class index for a person in the detection model's label set.
pub const PERSON_CLASS_ID: u32 = 0;

/// A raw frame handed to the pipeline, cropped to the region of interest.
///
/// Ephemeral: owned by whichever stage currently holds it, never shared
/// mutably across stages.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    /// Monotonic sequence number assigned by the frame source.
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
}

/// Axis-aligned bounding box in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    /// Vertical center, used for the monitored-band test.
    pub fn center_y(&self) -> f32 {
        self.y + self.height / 2.0
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// Intersection-over-union with another box, in [0, 1].
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;

        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// One detection produced by the person detector for a single frame.
/// Consumed once by the zone tracker; never persisted.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class_id: u32,
    pub confidence: f32,
}

impl Detection {
    pub fn is_person(&self) -> bool {
        self.class_id == PERSON_CLASS_ID
    }
}

/// Fixed-length face embedding vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Euclidean distance to another embedding. Lower = more similar.
    pub fn distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// L2-normalize in place. A zero vector is left untouched.
    pub fn l2_normalize(&mut self) {
        let norm: f32 = self.values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut self.values {
                *v /= norm;
            }
        }
    }
}

/// A known identity loaded from the gallery store.
#[derive(Debug, Clone)]
pub struct KnownFace {
    pub guest_id: String,
    pub embedding: Embedding,
}

/// Result of matching a probe embedding against the gallery.
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub matched: bool,
    /// Euclidean distance of the best candidate (infinity on empty gallery).
    pub distance: f32,
    pub guest_id: Option<String>,
}

/// Find the nearest gallery entry to `probe`. A match requires the best
/// distance to be within `tolerance`; otherwise the outcome carries the
/// distance but no guest id.
pub fn nearest_match(probe: &Embedding, gallery: &[KnownFace], tolerance: f32) -> MatchOutcome {
    let mut best_dist = f32::INFINITY;
    let mut best_idx: Option<usize> = None;

    for (i, face) in gallery.iter().enumerate() {
        let dist = probe.distance(&face.embedding);
        if dist < best_dist {
            best_dist = dist;
            best_idx = Some(i);
        }
    }

    match best_idx {
        Some(idx) if best_dist <= tolerance => MatchOutcome {
            matched: true,
            distance: best_dist,
            guest_id: Some(gallery[idx].guest_id.clone()),
        },
        _ => MatchOutcome {
            matched: false,
            distance: best_dist,
            guest_id: None,
        },
    }
}
