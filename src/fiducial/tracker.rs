use crate::common::{Frame, KeyedEma, Point};
use crate::fiducial::detector::MarkerDetector;
use crate::fiducial::intrinsics::IntrinsicsCache;
use crate::fiducial::pose::{EulerAngles, estimate_pose};
use image::imageops;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DETECTION_INTERVAL: Duration = Duration::from_millis(65);
const SMOOTHING_ALPHA: f64 = 0.4;

/// A tracked marker: smoothed center in pixels and, when pose is available,
/// smoothed orientation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FiducialAnchor {
    pub id: i32,
    pub center: Point,
    pub pose: Option<EulerAngles>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct DetectionMeta {
    pub pose_requested: bool,
    pub pose_available: bool,
    pub intrinsics_error: Option<String>,
    pub detector_error: Option<String>,
}

/// Fixed-cadence marker tracker. Between detections the previous anchors are
/// returned unchanged.
pub struct FiducialTracker {
    detector: Box<dyn MarkerDetector>,
    intrinsics: Arc<IntrinsicsCache>,
    min_interval: Duration,
    last_detection: Option<Instant>,
    anchors: Vec<FiducialAnchor>,
    centers: KeyedEma<i32, 2>,
    angles: KeyedEma<i32, 3>,
    detector_error: Option<String>,
}

impl FiducialTracker {
    pub fn new(detector: Box<dyn MarkerDetector>, intrinsics: Arc<IntrinsicsCache>) -> Self {
        Self {
            detector,
            intrinsics,
            min_interval: DETECTION_INTERVAL,
            last_detection: None,
            anchors: Vec::new(),
            centers: KeyedEma::new(SMOOTHING_ALPHA),
            angles: KeyedEma::new(SMOOTHING_ALPHA),
            detector_error: None,
        }
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    /// Detection status, available before any marker has been seen.
    pub fn meta(&self, pose_enabled: bool) -> DetectionMeta {
        let intrinsics_error = self.intrinsics.error_message();
        DetectionMeta {
            pose_requested: pose_enabled,
            pose_available: pose_enabled && intrinsics_error.is_none(),
            intrinsics_error,
            detector_error: self.detector_error.clone(),
        }
    }

    pub fn detect(
        &mut self,
        frame: &Frame,
        pose_enabled: bool,
        marker_size: f64,
        now: Instant,
    ) -> (Vec<FiducialAnchor>, DetectionMeta) {
        let due = self
            .last_detection
            .map_or(true, |last| now.saturating_duration_since(last) >= self.min_interval);
        if !due {
            return (self.anchors.clone(), self.meta(pose_enabled));
        }
        self.last_detection = Some(now);

        let gray = imageops::grayscale(frame.image());
        let markers = match self.detector.detect(&gray) {
            Ok(markers) => {
                self.detector_error = None;
                markers
            }
            Err(err) => {
                let message = err.to_string();
                if self.detector_error.as_deref() != Some(message.as_str()) {
                    tracing::warn!("Marker detection failed: {}", message);
                }
                self.detector_error = Some(message);
                Vec::new()
            }
        };

        let cache = self.intrinsics.clone();
        let intrinsics = if pose_enabled { cache.get().ok() } else { None };
        let mut anchors = Vec::with_capacity(markers.len());
        for marker in &markers {
            let raw = marker.center();
            let [x, y] = self.centers.update(marker.id, [raw.x, raw.y]);
            let pose = intrinsics
                .and_then(|intrinsics| estimate_pose(&marker.corners, marker_size, intrinsics))
                .map(|pose| {
                    let euler = pose.euler();
                    let [yaw, pitch, roll] = self
                        .angles
                        .update(marker.id, [euler.yaw, euler.pitch, euler.roll]);
                    EulerAngles { yaw, pitch, roll }
                });
            anchors.push(FiducialAnchor {
                id: marker.id,
                center: Point::new(x, y),
                pose,
            });
        }
        self.anchors = anchors;
        (self.anchors.clone(), self.meta(pose_enabled))
    }
}
