use crate::capture::backend::{CaptureDevice, DeviceOpener, default_opener, open_device};
use crate::capture::mock::render_mock_frame;
use crate::common::{Frame, ScalarEma, frame::encode_jpeg, mean_luma};
use crate::config::CameraConfig;
use crate::error::CaptureError;
use crate::state::{CameraStatus, HealthHandle, Lighting};
use bytes::Bytes;
use image::RgbImage;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

const FPS_ALPHA: f64 = 0.2;
const LIGHTING_THRESHOLD: f64 = 60.0;
const PREVIEW_QUALITY: u8 = 80;

/// Source of the latest captured frame.
pub trait FrameSource: Send {
    /// Copy out the most recent complete frame. Never blocks on acquisition.
    fn read(&self) -> Result<Frame, CaptureError>;
    fn preview_jpeg(&self) -> Option<Bytes> {
        None
    }
    fn status(&self) -> CameraStatus;
    /// Stop acquisition and release the device. Safe to call more than once.
    fn close(&mut self);
}

/// Produces fresh sources, used when the pipeline soft-resets the camera.
pub trait SourceOpener: Send {
    fn open(&self) -> Result<Box<dyn FrameSource>, CaptureError>;
}

#[derive(Default)]
struct SharedFrames {
    latest: Mutex<Option<Frame>>,
    preview: Mutex<Option<Bytes>>,
}

/// Camera or synthetic frame source with its own acquisition thread.
pub struct CameraSource {
    shared: Arc<SharedFrames>,
    status: CameraStatus,
    health: HealthHandle,
    cancel_token: CancellationToken,
    acquisition_thread: Option<JoinHandle<()>>,
}

impl CameraSource {
    pub fn open(config: &CameraConfig, health: HealthHandle) -> Result<Self, CaptureError> {
        Self::open_with(config, health, &default_opener())
    }

    pub fn open_with(
        config: &CameraConfig,
        health: HealthHandle,
        opener: &DeviceOpener,
    ) -> Result<Self, CaptureError> {
        let (device, status) = match open_device(config, opener) {
            Ok(device) => {
                health.set_camera(CameraStatus::On, None);
                (Some(device), CameraStatus::On)
            }
            Err(err) if config.allow_mock => {
                tracing::warn!("Camera unavailable, falling back to mock frames: {}", err);
                health.set_camera(CameraStatus::Mock, Some(err.to_string()));
                (None, CameraStatus::Mock)
            }
            Err(err) => {
                tracing::error!("Camera unavailable and mock frames disabled: {}", err);
                health.set_camera(CameraStatus::Off, Some(err.to_string()));
                return Err(err);
            }
        };

        let shared = Arc::new(SharedFrames::default());
        let cancel_token = CancellationToken::new();
        let mut acquisition = Acquisition {
            device,
            config: config.clone(),
            shared: shared.clone(),
            health: health.clone(),
            fps: ScalarEma::new(FPS_ALPHA),
            last_capture: None,
            started: Instant::now(),
        };
        let token = cancel_token.clone();
        let acquisition_thread = std::thread::Builder::new()
            .name("camera-acquisition".to_string())
            .spawn(move || acquisition.run(token))
            .map_err(|e| CaptureError::Backend(e.to_string()))?;

        Ok(Self {
            shared,
            status,
            health,
            cancel_token,
            acquisition_thread: Some(acquisition_thread),
        })
    }
}

impl FrameSource for CameraSource {
    fn read(&self) -> Result<Frame, CaptureError> {
        if self.acquisition_thread.is_none() {
            return Err(CaptureError::Closed);
        }
        self.shared
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(CaptureError::NotReady)
    }

    fn preview_jpeg(&self) -> Option<Bytes> {
        self.shared
            .preview
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn status(&self) -> CameraStatus {
        self.status
    }

    fn close(&mut self) {
        self.cancel_token.cancel();
        if let Some(thread) = self.acquisition_thread.take() {
            if thread.join().is_err() {
                tracing::error!("Camera acquisition thread panicked");
            }
            self.shared
                .latest
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            // The last open error stays visible after shutdown.
            self.health.update(|health| health.camera = CameraStatus::Off);
        }
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        self.close();
    }
}

struct Acquisition {
    device: Option<Box<dyn CaptureDevice>>,
    config: CameraConfig,
    shared: Arc<SharedFrames>,
    health: HealthHandle,
    fps: ScalarEma,
    last_capture: Option<Instant>,
    started: Instant,
}

impl Acquisition {
    fn run(&mut self, cancel_token: CancellationToken) {
        let period = self.config.frame_period();
        while !cancel_token.is_cancelled() {
            let cycle_start = Instant::now();
            match self.acquire(cycle_start) {
                Ok(image) => self.publish(image, cycle_start),
                Err(err) => tracing::debug!("Frame acquisition failed: {}", err),
            }
            let elapsed = cycle_start.elapsed();
            if elapsed < period {
                std::thread::sleep(period - elapsed);
            }
        }
        // Dropping the device here releases it before the joining thread resumes.
        if self.device.take().is_some() {
            tracing::info!("Camera device {} released", self.config.device);
        }
    }

    fn acquire(&mut self, now: Instant) -> Result<RgbImage, CaptureError> {
        match self.device.as_mut() {
            Some(device) => device.grab(),
            None => {
                let t = now.saturating_duration_since(self.started).as_secs_f64();
                let clock = chrono::Local::now().format("%H:%M:%S").to_string();
                Ok(render_mock_frame(
                    self.config.width,
                    self.config.height,
                    t,
                    &clock,
                ))
            }
        }
    }

    fn publish(&mut self, image: RgbImage, captured_at: Instant) {
        let lighting = if mean_luma(&image) > LIGHTING_THRESHOLD {
            Lighting::Ok
        } else {
            Lighting::Dim
        };
        let fps = match self.last_capture {
            Some(previous) => {
                let interval = captured_at.saturating_duration_since(previous).as_secs_f64();
                if interval > 0.0 {
                    self.fps.update(1.0 / interval)
                } else {
                    self.fps.value().unwrap_or(0.0)
                }
            }
            None => 0.0,
        };
        self.last_capture = Some(captured_at);

        let frame = Frame::new(image, captured_at);
        match encode_jpeg(frame.image(), PREVIEW_QUALITY) {
            Ok(jpeg) => {
                *self
                    .shared
                    .preview
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(jpeg);
            }
            Err(err) => tracing::debug!("Preview encoding failed: {}", err),
        }

        let timestamp_ns = frame.timestamp_ns();
        *self
            .shared
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(frame);

        self.health.update(|health| {
            health.lighting = lighting;
            health.fps = fps;
            health.last_frame_ns = Some(timestamp_ns);
        });
    }
}

/// Opens camera sources from a fixed configuration.
pub struct CameraOpener {
    config: CameraConfig,
    health: HealthHandle,
    device_opener: DeviceOpener,
}

impl CameraOpener {
    pub fn new(config: CameraConfig, health: HealthHandle) -> Self {
        Self::with_device_opener(config, health, default_opener())
    }

    pub fn with_device_opener(
        config: CameraConfig,
        health: HealthHandle,
        device_opener: DeviceOpener,
    ) -> Self {
        Self {
            config,
            health,
            device_opener,
        }
    }
}

impl SourceOpener for CameraOpener {
    fn open(&self) -> Result<Box<dyn FrameSource>, CaptureError> {
        let source = CameraSource::open_with(&self.config, self.health.clone(), &self.device_opener)?;
        Ok(Box::new(source))
    }
}
