pub mod breaker;
pub mod cache;
pub mod client;
pub mod rate_limit;
pub mod service;
pub mod worker;

pub use client::{HttpRemoteDetector, RemoteDetector, RemoteRequest, RemoteResult};
pub use service::{RemoteLandmarkService, RemoteMetrics};
pub use worker::{CompletedRefinement, RemoteSlot};
