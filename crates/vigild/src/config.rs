use std::path::PathBuf;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Logical camera identifier, recorded as the attendance device id.
    pub camera_id: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory where capture JPEGs and inspection crops are written.
    pub capture_dir: PathBuf,
    /// Directory holding registration artifacts and their frame folders.
    pub videos_dir: PathBuf,
    /// Directory the frame source watches for incoming JPEG frames.
    pub spool_dir: PathBuf,
    /// Expected full-frame geometry from the camera feed.
    pub frame_width: u32,
    pub frame_height: u32,
    /// Region of interest cropped from each incoming frame.
    pub roi: Roi,
    /// Upper edge of the presence band, in ROI coordinates.
    pub band_top_y: f32,
    /// Lower edge of the presence band, in ROI coordinates.
    pub band_bottom_y: f32,
    /// Consecutive empty detection batches that end an active event.
    pub no_human_streak: u32,
    /// Minimum captures a track needs to be dispatched for recognition.
    pub min_frames_per_track: usize,
    /// Capture cap per track.
    pub max_frames_per_track: usize,
    /// Minimum spacing between captures of the same track, in milliseconds.
    pub capture_spacing_ms: u64,
    /// Person detection confidence threshold.
    pub detect_confidence: f32,
    /// Concurrent recognition worker cap.
    pub recognition_concurrency: usize,
    /// Euclidean distance at or below which an embedding matches a guest.
    pub match_tolerance: f32,
    /// Attendance dedup cooldown, in seconds.
    pub cooldown_secs: u64,
    /// Maximum events allowed per rolling period.
    pub event_ceiling: u32,
    /// Length of the rolling event-ceiling period, in seconds.
    pub event_period_secs: u64,
    /// Registration ingestion interval, in seconds.
    pub ingest_interval_secs: u64,
    /// Capture retention window for the containerized sweep, in minutes.
    pub retention_minutes: u64,
}

/// Crop rectangle applied to every incoming frame before detection.
#[derive(Debug, Clone, Copy)]
pub struct Roi {
    pub top: u32,
    pub bottom: u32,
    pub left: u32,
    pub right: u32,
}

impl Roi {
    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }
}

impl Config {
    /// Load configuration from `VIGIL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("VIGIL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/lib/vigil"));

        let model_dir = std::env::var("VIGIL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("models"));
        let db_path = std::env::var("VIGIL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("vigil.db"));
        let capture_dir = std::env::var("VIGIL_CAPTURE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("captures"));
        let videos_dir = std::env::var("VIGIL_VIDEOS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("videos"));
        let spool_dir = std::env::var("VIGIL_SPOOL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("spool"));

        Self {
            camera_id: std::env::var("VIGIL_CAMERA_ID").unwrap_or_else(|_| "LIFT".to_string()),
            model_dir,
            db_path,
            capture_dir,
            videos_dir,
            spool_dir,
            frame_width: env_u32("VIGIL_FRAME_WIDTH", 2560),
            frame_height: env_u32("VIGIL_FRAME_HEIGHT", 1440),
            roi: Roi {
                top: env_u32("VIGIL_ROI_TOP", 100),
                bottom: env_u32("VIGIL_ROI_BOTTOM", 1900),
                left: env_u32("VIGIL_ROI_LEFT", 1075),
                right: env_u32("VIGIL_ROI_RIGHT", 1875),
            },
            band_top_y: env_f32("VIGIL_BAND_TOP_Y", 550.0),
            band_bottom_y: env_f32("VIGIL_BAND_BOTTOM_Y", 1100.0),
            no_human_streak: env_u32("VIGIL_NO_HUMAN_STREAK", 10),
            min_frames_per_track: env_usize("VIGIL_MIN_FRAMES_PER_TRACK", 5),
            max_frames_per_track: env_usize("VIGIL_MAX_FRAMES_PER_TRACK", 20),
            capture_spacing_ms: env_u64("VIGIL_CAPTURE_SPACING_MS", 500),
            detect_confidence: env_f32("VIGIL_DETECT_CONFIDENCE", 0.5),
            recognition_concurrency: env_usize("VIGIL_RECOGNITION_CONCURRENCY", 2),
            match_tolerance: env_f32("VIGIL_MATCH_TOLERANCE", 0.5),
            cooldown_secs: env_u64("VIGIL_COOLDOWN_SECS", 30),
            event_ceiling: env_u32("VIGIL_EVENT_CEILING", 3),
            event_period_secs: env_u64("VIGIL_EVENT_PERIOD_SECS", 60),
            ingest_interval_secs: env_u64("VIGIL_INGEST_INTERVAL_SECS", 3600),
            retention_minutes: env_u64("VIGIL_RETENTION_MINUTES", 120),
        }
    }

    /// Path to the YOLOv8 person detection model.
    pub fn yolo_model_path(&self) -> String {
        self.model_dir
            .join("yolov8n.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the UltraFace face locator model.
    pub fn ultraface_model_path(&self) -> String {
        self.model_dir
            .join("version-RFB-320.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the face embedding model.
    pub fn embedder_model_path(&self) -> String {
        self.model_dir
            .join("arcface.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
