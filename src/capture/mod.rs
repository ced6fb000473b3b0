pub mod backend;
pub mod mock;
pub mod source;

pub use backend::{CaptureBackend, CaptureDevice, DeviceOpener};
pub use source::{CameraOpener, CameraSource, FrameSource, SourceOpener};
