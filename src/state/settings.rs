use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Live operator settings. External writers may update these at any time; the
/// orchestrator takes a snapshot at the start of every cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub use_cloud: bool,
    pub face: bool,
    pub hands: bool,
    pub aruco: bool,
    pub aruco_pose: bool,
    pub marker_size_m: f64,
    pub cloud_rps: u32,
    pub cloud_timeout_s: f64,
    pub cloud_min_interval_ms: u64,
    /// Operator baseline for the fiducial stride; the governor never relaxes below it.
    pub aruco_stride: u32,
    pub reduce_motion: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            use_cloud: false,
            face: true,
            hands: true,
            aruco: false,
            aruco_pose: true,
            marker_size_m: 0.032,
            cloud_rps: 2,
            cloud_timeout_s: 0.8,
            cloud_min_interval_ms: 600,
            aruco_stride: 2,
            reduce_motion: false,
        }
    }
}

impl Settings {
    /// Clamp values to the ranges the pipeline accepts.
    pub fn clamped(mut self) -> Self {
        self.aruco_stride = self.aruco_stride.clamp(1, 8);
        self.cloud_rps = self.cloud_rps.clamp(1, 10);
        if !self.cloud_timeout_s.is_finite() {
            self.cloud_timeout_s = 0.8;
        }
        self.cloud_timeout_s = self.cloud_timeout_s.clamp(0.1, 3.0);
        if !(self.marker_size_m.is_finite() && self.marker_size_m > 0.0) {
            self.marker_size_m = 0.032;
        }
        self
    }

    pub fn remote_limits(&self) -> RemoteLimits {
        RemoteLimits {
            rps: self.cloud_rps,
            timeout: Duration::from_secs_f64(self.cloud_timeout_s),
            min_interval: Duration::from_millis(self.cloud_min_interval_ms),
        }
    }
}

/// Rate limits applied to the remote landmark service.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemoteLimits {
    pub rps: u32,
    pub timeout: Duration,
    pub min_interval: Duration,
}

/// Shared handle to the live settings.
#[derive(Debug, Clone, Default)]
pub struct SettingsHandle {
    inner: Arc<RwLock<Settings>>,
}

impl SettingsHandle {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings.clamped())),
        }
    }

    pub fn snapshot(&self) -> Settings {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply an update; the result is clamped before it becomes visible.
    pub fn update<F>(&self, apply: F) -> Settings
    where
        F: FnOnce(&mut Settings),
    {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = guard.clone();
        apply(&mut next);
        *guard = next.clamped();
        tracing::info!("Settings updated: {:?}", *guard);
        guard.clone()
    }
}
