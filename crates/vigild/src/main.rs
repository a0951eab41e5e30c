use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use vigil_core::{TrackerConfig, ZoneTracker};
use vigil_models::{FaceEmbeddingModel, UltraFaceLocator, YoloPersonDetector};
use vigil_store::{AttendanceLedger, FaceGallery, Store};

mod capture;
mod config;
mod detector;
mod ingest;
mod pipeline;
mod recognition;
mod source;

use capture::FrameCapturer;
use detector::DetectorWorker;
use ingest::{DirFrameSampler, RegistrationIngestor};
use pipeline::ZonePipeline;
use recognition::{RecognitionDispatcher, RecognitionModels};
use source::FrameSpool;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("vigild starting");

    let cfg = config::Config::from_env();
    let container = capture::in_container();
    if container {
        tracing::info!("container environment detected, capture retention sweep enabled");
    }

    if let Some(parent) = cfg.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::create_dir_all(&cfg.videos_dir)
        .with_context(|| format!("creating {}", cfg.videos_dir.display()))?;

    let store = Arc::new(Store::open(&cfg.db_path).context("opening database")?);
    let gallery = Arc::new(FaceGallery::new());
    let ledger = Arc::new(AttendanceLedger::new(
        Arc::clone(&store),
        chrono::Duration::seconds(cfg.cooldown_secs as i64),
    ));
    ledger.seed_from_store().context("seeding attendance cooldowns")?;

    // Load models up front (fail-fast): one detector for the pipeline, one
    // locator/embedder pair per recognition permit, plus a pair for ingestion.
    let person_detector = YoloPersonDetector::load(&cfg.yolo_model_path(), cfg.detect_confidence)
        .context("loading person detection model")?;
    let mut recognition_models = Vec::with_capacity(cfg.recognition_concurrency);
    for _ in 0..cfg.recognition_concurrency {
        recognition_models.push(load_face_models(&cfg)?);
    }
    let ingest_models = load_face_models(&cfg)?;

    let capturer = Arc::new(
        FrameCapturer::new(&cfg.capture_dir, &cfg.camera_id).context("preparing capture dir")?,
    );
    let dispatcher = Arc::new(RecognitionDispatcher::new(
        recognition_models,
        tokio::runtime::Handle::current(),
        Arc::clone(&capturer),
        Arc::clone(&store),
        Arc::clone(&gallery),
        Arc::clone(&ledger),
        cfg.match_tolerance,
        cfg.camera_id.clone(),
        chrono::Duration::minutes(cfg.retention_minutes as i64),
        container,
    ));

    let tracker = ZoneTracker::new(TrackerConfig {
        band_top_y: cfg.band_top_y,
        band_bottom_y: cfg.band_bottom_y,
        no_human_streak_to_end: cfg.no_human_streak,
        min_captures_per_track: cfg.min_frames_per_track as u32,
        max_captures_per_track: cfg.max_frames_per_track as u32,
        capture_spacing: chrono::Duration::milliseconds(cfg.capture_spacing_ms as i64),
        event_ceiling: cfg.event_ceiling,
        event_period: chrono::Duration::seconds(cfg.event_period_secs as i64),
        ..TrackerConfig::default()
    });

    let (stop_tx, stop_rx) = watch::channel(false);

    let pipeline = ZonePipeline {
        source: Box::new(
            FrameSpool::new(cfg.spool_dir.clone())
                .context("preparing spool dir")?
                .with_expected_dims(cfg.frame_width, cfg.frame_height),
        ),
        detector: DetectorWorker::spawn(Box::new(person_detector)),
        tracker,
        capturer,
        dispatcher: Arc::clone(&dispatcher),
        roi: cfg.roi,
    };
    let pipeline_handle = pipeline.spawn(stop_rx.clone());

    let ingestor = RegistrationIngestor::new(
        cfg.videos_dir.clone(),
        Arc::clone(&store),
        Arc::clone(&gallery),
        Box::new(DirFrameSampler::new(cfg.videos_dir.clone())),
        ingest_models,
    );
    let ingest_task = tokio::spawn(ingestor.run(
        Duration::from_secs(cfg.ingest_interval_secs),
        stop_rx,
    ));

    tracing::info!(camera_id = cfg.camera_id, "vigild ready");
    tokio::signal::ctrl_c().await?;
    tracing::info!("vigild shutting down");

    // Stop frame intake, let the detector drain, wait for in-flight
    // recognition and the current ingestion cycle.
    stop_tx.send(true).ok();
    tokio::task::spawn_blocking(move || {
        let _ = pipeline_handle.join();
    })
    .await
    .ok();
    ingest_task.await.ok();
    dispatcher.wait_idle().await;

    tracing::info!("vigild stopped");
    Ok(())
}

fn load_face_models(cfg: &config::Config) -> Result<RecognitionModels> {
    Ok(RecognitionModels {
        locator: Box::new(
            UltraFaceLocator::load(&cfg.ultraface_model_path())
                .context("loading face locator model")?,
        ),
        embedder: Box::new(
            FaceEmbeddingModel::load(&cfg.embedder_model_path())
                .context("loading face embedding model")?,
        ),
    })
}
