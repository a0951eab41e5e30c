//! Zone tracker: the per-visit event state machine.
//!
//! Consumes detection batches and drives the `Idle -> EventActive -> Idle`
//! lifecycle: an event opens when a person's vertical center enters the
//! monitored band, tracks are maintained by bounding-box IOU across batches,
//! and the event closes after a streak of person-free batches. The tracker is
//! pure state: it emits [`TrackerAction`]s and performs no I/O, so the whole
//! lifecycle is testable with synthetic detection streams.

use crate::types::{BoundingBox, Detection};
use chrono::{DateTime, Duration, Utc};

/// Tracker tuning. Defaults mirror the deployed lift-camera values.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Monitored band: a person is "in the zone" when the vertical center of
    /// their box lies strictly between these two Y coordinates.
    pub band_top_y: f32,
    pub band_bottom_y: f32,
    /// Minimum IOU for a detection to continue an existing track.
    pub iou_threshold: f32,
    /// Consecutive person-free batches required to end an active event.
    pub no_human_streak_to_end: u32,
    /// Tracks with fewer captures than this are discarded without dispatch.
    pub min_captures_per_track: u32,
    /// Hard cap on captures per track.
    pub max_captures_per_track: u32,
    /// Minimum spacing between two captures of the same track.
    pub capture_spacing: Duration,
    /// Rate limit: at most this many events per rolling period.
    pub event_ceiling: u32,
    pub event_period: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            band_top_y: 550.0,
            band_bottom_y: 1100.0,
            iou_threshold: 0.6,
            no_human_streak_to_end: 10,
            min_captures_per_track: 5,
            max_captures_per_track: 20,
            capture_spacing: Duration::milliseconds(500),
            event_ceiling: 3,
            event_period: Duration::seconds(60),
        }
    }
}

/// One physically distinct person inside the zone during an event.
#[derive(Debug, Clone)]
pub struct Track {
    pub track_no: u32,
    pub photo_id: String,
    pub last_box: BoundingBox,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub captures: u32,
    pub last_capture_at: DateTime<Utc>,
}

#[derive(Debug)]
struct ActiveEvent {
    id: String,
    started_at: DateTime<Utc>,
    tracks: Vec<Track>,
    no_human_streak: u32,
}

/// Side effects requested by [`ZoneTracker::observe`]; the pipeline executes
/// them (frame save, recognition dispatch).
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerAction {
    EventStarted {
        event_id: String,
    },
    /// Persist the current frame for `photo_id` as capture number `seq`.
    Capture {
        photo_id: String,
        seq: u32,
        total_humans: usize,
    },
    /// Event closed: `dispatch` holds the photo ids with enough captures to
    /// be worth recognizing; the rest were discarded.
    EventEnded {
        event_id: String,
        dispatch: Vec<String>,
        discarded: u32,
    },
}

/// State machine over detection batches. At most one event is active at a
/// time; all timing comes from the caller-supplied `now`.
pub struct ZoneTracker {
    cfg: TrackerConfig,
    event: Option<ActiveEvent>,
    window_start: Option<DateTime<Utc>>,
    events_in_window: u32,
    /// Process-monotonic counter folded into event ids so same-millisecond
    /// starts cannot collide.
    event_seq: u64,
}

impl ZoneTracker {
    pub fn new(cfg: TrackerConfig) -> Self {
        Self {
            cfg,
            event: None,
            window_start: None,
            events_in_window: 0,
            event_seq: 0,
        }
    }

    pub fn event_active(&self) -> bool {
        self.event.is_some()
    }

    /// Feed one detection batch. Non-person classes are ignored; people
    /// outside the band are logged but never tracked or captured.
    pub fn observe(&mut self, detections: &[Detection], now: DateTime<Utc>) -> Vec<TrackerAction> {
        let humans: Vec<&Detection> = detections.iter().filter(|d| d.is_person()).collect();
        let total_humans = humans.len();

        // Roll the rate-limit window.
        match self.window_start {
            Some(start) if now - start <= self.cfg.event_period => {}
            _ => {
                self.window_start = Some(now);
                self.events_in_window = 0;
            }
        }

        let mut actions = Vec::new();

        let any_in_band = humans.iter().any(|d| self.in_band(&d.bbox));
        if self.event.is_none() && any_in_band {
            if self.events_in_window < self.cfg.event_ceiling {
                let id = self.next_event_id(now);
                self.events_in_window += 1;
                tracing::info!(event_id = %id, "event started: person entered monitored band");
                actions.push(TrackerAction::EventStarted { event_id: id.clone() });
                self.event = Some(ActiveEvent {
                    id,
                    started_at: now,
                    tracks: Vec::new(),
                    no_human_streak: 0,
                });
            } else {
                tracing::debug!(
                    events_in_window = self.events_in_window,
                    "suppressing event start: ceiling reached for current period"
                );
            }
        }

        let mut end_event = false;
        if let Some(event) = self.event.as_mut() {
            for det in &humans {
                if !in_band_cfg(&self.cfg, &det.bbox) {
                    tracing::trace!(cy = det.bbox.center_y(), "person outside band, not tracked");
                    continue;
                }

                // Best-IOU match against live tracks; ambiguity resolves to
                // the highest IOU and is not corrected after the fact.
                let mut best_iou = 0.0f32;
                let mut best_idx: Option<usize> = None;
                for (i, track) in event.tracks.iter().enumerate() {
                    let v = track.last_box.iou(&det.bbox);
                    if v > best_iou {
                        best_iou = v;
                        best_idx = Some(i);
                    }
                }

                match best_idx {
                    Some(i) if best_iou > self.cfg.iou_threshold => {
                        let track = &mut event.tracks[i];
                        track.last_box = det.bbox;
                        track.last_seen = now;
                        let due = now - track.last_capture_at >= self.cfg.capture_spacing;
                        if track.captures < self.cfg.max_captures_per_track && due {
                            track.captures += 1;
                            track.last_capture_at = now;
                            tracing::debug!(
                                photo_id = %track.photo_id,
                                seq = track.captures,
                                "throttled capture"
                            );
                            actions.push(TrackerAction::Capture {
                                photo_id: track.photo_id.clone(),
                                seq: track.captures,
                                total_humans,
                            });
                        }
                    }
                    _ => {
                        let track_no = event.tracks.len() as u32 + 1;
                        let photo_id = format!("{}-t{}", event.id, track_no);
                        tracing::info!(photo_id = %photo_id, "new track in zone");
                        event.tracks.push(Track {
                            track_no,
                            photo_id: photo_id.clone(),
                            last_box: det.bbox,
                            first_seen: now,
                            last_seen: now,
                            captures: 1,
                            last_capture_at: now,
                        });
                        actions.push(TrackerAction::Capture {
                            photo_id,
                            seq: 1,
                            total_humans,
                        });
                    }
                }
            }

            if total_humans == 0 {
                event.no_human_streak += 1;
                end_event = event.no_human_streak >= self.cfg.no_human_streak_to_end;
            } else {
                event.no_human_streak = 0;
            }
        }

        if end_event {
            // Checked above: end_event is only set while an event is active.
            let event = self.event.take().expect("active event");
            let min = self.cfg.min_captures_per_track;
            let mut dispatch = Vec::new();
            let mut discarded = 0u32;
            for track in &event.tracks {
                if track.captures >= min {
                    dispatch.push(track.photo_id.clone());
                } else {
                    // Too few samples to trust a match; accepted false negative.
                    discarded += 1;
                }
            }
            tracing::info!(
                event_id = %event.id,
                duration_secs = (now - event.started_at).num_seconds(),
                dispatch = dispatch.len(),
                discarded,
                "event ended"
            );
            actions.push(TrackerAction::EventEnded {
                event_id: event.id,
                dispatch,
                discarded,
            });
        }

        actions
    }

    fn in_band(&self, bbox: &BoundingBox) -> bool {
        in_band_cfg(&self.cfg, bbox)
    }

    fn next_event_id(&mut self, now: DateTime<Utc>) -> String {
        let seq = self.event_seq;
        self.event_seq += 1;
        format!("{}-{:04}", now.format("%y%m%d%H%M%S%3f"), seq)
    }
}

fn in_band_cfg(cfg: &TrackerConfig, bbox: &BoundingBox) -> bool {
    let cy = bbox.center_y();
    cy > cfg.band_top_y && cy < cfg.band_bottom_y
}
