use smart_mirror::capture::{CameraOpener, CameraSource};
use smart_mirror::error::AppError;
use smart_mirror::fiducial::{FiducialTracker, IntrinsicsCache, default_detector};
use smart_mirror::pipeline::broadcast::DEFAULT_CAPACITY;
use smart_mirror::pipeline::{
    ChannelBroadcaster, LatencyLog, PerceptionOrchestrator, SharedHandles, SyntheticLandmarks,
};
use smart_mirror::remote::{HttpRemoteDetector, RemoteLandmarkService, RemoteSlot};
use smart_mirror::state::session::{Routines, load_routines};
use smart_mirror::state::{HealthHandle, SessionHandle, SettingsHandle};
use smart_mirror::MirrorConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    init_logging();
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = MirrorConfig::load(config_path.as_deref())?;

    let settings = SettingsHandle::new(config.settings.clone());
    let health = HealthHandle::new();
    let routines = match &config.pipeline.routines_path {
        Some(path) => load_routines(path)?,
        None => Routines::new(),
    };
    let handles = SharedHandles {
        settings: settings.clone(),
        health: health.clone(),
        session: SessionHandle::new(routines),
    };

    let service = if config.remote.enabled {
        let detector = HttpRemoteDetector::new(config.remote.endpoint.clone(), config.remote.api_key.clone())?;
        RemoteLandmarkService::new(Arc::new(detector), settings.snapshot().remote_limits())
    } else {
        RemoteLandmarkService::disabled()
    };
    let remote = RemoteSlot::new(service, tokio::runtime::Handle::current());

    let source = CameraSource::open(&config.camera, health.clone())?;
    let opener = CameraOpener::new(config.camera.clone(), health.clone());
    let tracker = FiducialTracker::new(
        default_detector(),
        Arc::new(IntrinsicsCache::new(config.pipeline.intrinsics_path.clone())),
    );
    info!("No mesh model configured, using synthetic landmarks");

    let (broadcaster, mut overlay_rx) = ChannelBroadcaster::new(DEFAULT_CAPACITY);
    let mut orchestrator = PerceptionOrchestrator::new(
        handles,
        Box::new(source),
        Box::new(opener),
        Box::new(SyntheticLandmarks::default()),
        tracker,
        Arc::new(broadcaster),
    )
    .with_remote(remote);
    if let Some(path) = &config.pipeline.latency_log_path {
        match LatencyLog::open(path) {
            Ok(log) => orchestrator = orchestrator.with_latency_log(log),
            Err(err) => warn!("Latency log disabled: {}", err),
        }
    }

    let cancel_token = CancellationToken::new();
    let pipeline_thread = orchestrator.spawn(cancel_token.clone())?;

    let log_token = cancel_token.clone();
    let overlay_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = log_token.cancelled() => break,
                received = overlay_rx.recv() => match received {
                    Ok(message) => match message.to_json() {
                        Ok(json) => debug!("Overlay: {}", json),
                        Err(err) => warn!("Overlay could not be serialized: {}", err),
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Overlay subscriber lagged behind, skipped {} messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Overlay channel closed.");
                        break;
                    }
                },
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    cancel_token.cancel();
    let _ = overlay_task.await;
    tokio::task::spawn_blocking(move || pipeline_thread.join())
        .await
        .map_err(|err| AppError::Pipeline(err.to_string()))?
        .map_err(|_| AppError::Pipeline("perception thread panicked".to_string()))?;
    info!("Health at exit: {:?}", health.snapshot());
    Ok(())
}
