pub mod health;
pub mod session;
pub mod settings;

pub use health::{CameraStatus, HealthHandle, HealthState, Lighting};
pub use session::{ActiveStep, GuidedStep, SessionHandle, ToolBinding};
pub use settings::{RemoteLimits, Settings, SettingsHandle};
