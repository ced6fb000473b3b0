pub mod capture;
pub mod common;
pub mod config;
pub mod error;
pub mod fiducial;
pub mod pipeline;
pub mod remote;
pub mod state;

pub use config::MirrorConfig;
pub use error::{AppError, CaptureError, RemoteError};
pub use pipeline::{PerceptionOrchestrator, SharedHandles};
