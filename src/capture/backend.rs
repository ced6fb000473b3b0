use crate::config::CameraConfig;
use crate::error::CaptureError;
use image::RgbImage;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureBackend {
    AvFoundation,
    V4l2,
    Any,
}

impl CaptureBackend {
    /// Platform priority order. The generic backend is always tried last.
    pub fn candidates() -> Vec<CaptureBackend> {
        if cfg!(target_os = "macos") {
            vec![CaptureBackend::AvFoundation, CaptureBackend::Any]
        } else if cfg!(target_os = "linux") {
            vec![CaptureBackend::V4l2, CaptureBackend::Any]
        } else {
            vec![CaptureBackend::Any]
        }
    }
}

/// An opened, configured physical device.
pub trait CaptureDevice: Send {
    fn grab(&mut self) -> Result<RgbImage, CaptureError>;
    fn backend(&self) -> CaptureBackend;
}

pub type DeviceOpener = Arc<
    dyn Fn(&CameraConfig, CaptureBackend) -> Result<Box<dyn CaptureDevice>, CaptureError>
        + Send
        + Sync,
>;

/// Walk the backend candidates and return the first device that opens.
/// The error of the last attempt is kept for diagnostics.
pub fn open_device(
    config: &CameraConfig,
    opener: &DeviceOpener,
) -> Result<Box<dyn CaptureDevice>, CaptureError> {
    let mut last_error = CaptureError::DeviceUnavailable {
        device: config.device,
        reason: "no capture backend available".to_string(),
    };
    for backend in CaptureBackend::candidates() {
        match opener(config, backend) {
            Ok(device) => {
                tracing::info!("Opened camera {} with {:?} backend", config.device, backend);
                return Ok(device);
            }
            Err(err) => {
                tracing::debug!(
                    "Camera {} failed to open with {:?} backend: {}",
                    config.device,
                    backend,
                    err
                );
                last_error = err;
            }
        }
    }
    Err(last_error)
}

#[cfg(feature = "opencv")]
pub fn default_opener() -> DeviceOpener {
    Arc::new(|config: &CameraConfig, backend: CaptureBackend| {
        opencv_device::OpenCvDevice::open(config, backend)
            .map(|device| Box::new(device) as Box<dyn CaptureDevice>)
    })
}

#[cfg(not(feature = "opencv"))]
pub fn default_opener() -> DeviceOpener {
    Arc::new(|config: &CameraConfig, _backend: CaptureBackend| -> Result<Box<dyn CaptureDevice>, CaptureError> {
        Err(CaptureError::DeviceUnavailable {
            device: config.device,
            reason: "built without camera support".to_string(),
        })
    })
}

#[cfg(feature = "opencv")]
mod opencv_device {
    use super::{CaptureBackend, CaptureDevice};
    use crate::config::CameraConfig;
    use crate::error::CaptureError;
    use image::RgbImage;
    use opencv::{
        core::Mat,
        imgproc,
        prelude::*,
        videoio::{self, VideoCapture},
    };

    fn backend_error(err: opencv::Error) -> CaptureError {
        CaptureError::Backend(err.to_string())
    }

    pub struct OpenCvDevice {
        capture: VideoCapture,
        backend: CaptureBackend,
        bgr: Mat,
        rgb: Mat,
    }

    impl OpenCvDevice {
        pub fn open(config: &CameraConfig, backend: CaptureBackend) -> Result<Self, CaptureError> {
            let api = match backend {
                CaptureBackend::AvFoundation => videoio::CAP_AVFOUNDATION,
                CaptureBackend::V4l2 => videoio::CAP_V4L2,
                CaptureBackend::Any => videoio::CAP_ANY,
            };
            let unavailable = |reason: String| CaptureError::DeviceUnavailable {
                device: config.device,
                reason,
            };
            let mut capture =
                VideoCapture::new(config.device, api).map_err(|e| unavailable(e.to_string()))?;
            if !capture.is_opened().map_err(backend_error)? {
                return Err(unavailable(format!("{:?} backend did not open", backend)));
            }
            let _ = capture.set(videoio::CAP_PROP_FRAME_WIDTH, f64::from(config.width));
            let _ = capture.set(videoio::CAP_PROP_FRAME_HEIGHT, f64::from(config.height));
            let _ = capture.set(videoio::CAP_PROP_FPS, f64::from(config.fps));
            Ok(Self {
                capture,
                backend,
                bgr: Mat::default(),
                rgb: Mat::default(),
            })
        }
    }

    impl CaptureDevice for OpenCvDevice {
        fn grab(&mut self) -> Result<RgbImage, CaptureError> {
            let ok = self.capture.read(&mut self.bgr).map_err(backend_error)?;
            if !ok || self.bgr.empty() {
                return Err(CaptureError::NotReady);
            }
            imgproc::cvt_color(&self.bgr, &mut self.rgb, imgproc::COLOR_BGR2RGB, 0)
                .map_err(backend_error)?;
            let size = self.rgb.size().map_err(backend_error)?;
            let data = self.rgb.data_bytes().map_err(backend_error)?.to_vec();
            RgbImage::from_raw(size.width as u32, size.height as u32, data)
                .ok_or_else(|| CaptureError::Backend("frame buffer size mismatch".to_string()))
        }

        fn backend(&self) -> CaptureBackend {
            self.backend
        }
    }
}
