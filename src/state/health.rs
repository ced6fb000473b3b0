use crate::remote::service::RemoteMetrics;
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CameraStatus {
    On,
    Mock,
    #[default]
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Lighting {
    #[default]
    Unknown,
    Ok,
    Dim,
}

/// Pose availability as last reported by the fiducial tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct PoseHealth {
    pub requested: bool,
    pub available: bool,
    pub intrinsics_error: Option<String>,
}

/// Current adaptive budget, surfaced for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Default)]
pub struct BudgetHealth {
    pub face_stride: u32,
    pub fiducial_stride: u32,
    pub face_target_width: u32,
}

/// Health snapshot read by the serving layer.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct HealthState {
    pub camera: CameraStatus,
    pub camera_error: Option<String>,
    pub lighting: Lighting,
    pub fps: f64,
    pub latency_ms: f64,
    pub last_frame_ns: Option<u64>,
    pub remote: RemoteMetrics,
    pub pose: PoseHealth,
    pub budget: BudgetHealth,
}

/// Shared handle to the health state. Written by the frame source and the
/// orchestrator, read by everyone else.
#[derive(Debug, Clone, Default)]
pub struct HealthHandle {
    inner: Arc<RwLock<HealthState>>,
}

impl HealthHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HealthState {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update<F>(&self, apply: F)
    where
        F: FnOnce(&mut HealthState),
    {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        apply(&mut guard);
    }

    pub fn set_camera(&self, status: CameraStatus, error: Option<String>) {
        self.update(|health| {
            health.camera = status;
            health.camera_error = error;
        });
    }
}
