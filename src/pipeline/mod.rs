pub mod broadcast;
pub mod fusion;
pub mod governor;
pub mod guidance;
pub mod landmarks;
pub mod latency_log;
pub mod orchestrator;
pub mod overlay;
pub mod roi;

pub use broadcast::{Broadcaster, ChannelBroadcaster};
pub use guidance::{AlignmentState, GuidanceTracker};
pub use landmarks::{LandmarkExtractor, LandmarkSet, MeshLandmarkExtractor, MeshModel, SyntheticLandmarks};
pub use latency_log::LatencyLog;
pub use orchestrator::{PerceptionOrchestrator, SharedHandles};
pub use overlay::OverlayMessage;
