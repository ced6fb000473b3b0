pub mod detector;
pub mod intrinsics;
pub mod pose;
pub mod tracker;

pub use detector::{DetectedMarker, MarkerDetector, UnavailableDetector, default_detector};
pub use intrinsics::{CameraIntrinsics, IntrinsicsCache};
pub use pose::EulerAngles;
pub use tracker::{DetectionMeta, FiducialAnchor, FiducialTracker};
