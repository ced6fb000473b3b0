use crate::error::AppError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// A marker bound to a target landmark for the current step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolBinding {
    pub marker_id: i32,
    pub target_landmark: String,
    #[serde(default = "default_distance_tol_px")]
    pub distance_tol_px: f64,
    #[serde(default = "default_angle_tol_deg")]
    pub yaw_tol_deg: f64,
    #[serde(default = "default_angle_tol_deg")]
    pub pitch_tol_deg: f64,
}

fn default_distance_tol_px() -> f64 {
    40.0
}

fn default_angle_tol_deg() -> f64 {
    15.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuidedStep {
    pub title: String,
    #[serde(default)]
    pub subtitle: String,
    #[serde(default)]
    pub hint: Option<String>,
    #[serde(default)]
    pub min_time_s: f64,
    #[serde(default)]
    pub target_anchors: Vec<String>,
    #[serde(default)]
    pub tool_bindings: Vec<ToolBinding>,
}

pub type Routines = IndexMap<String, Vec<GuidedStep>>;

/// Parse a routines document: routine id mapped to its ordered steps.
pub fn load_routines(path: &Path) -> Result<Routines, AppError> {
    let raw = std::fs::read_to_string(path)?;
    let routines: Routines = serde_json::from_str(&raw)?;
    tracing::info!(
        "Loaded {} routine(s) from {}",
        routines.len(),
        path.display()
    );
    Ok(routines)
}

#[derive(Debug, Clone, Default)]
struct SessionState {
    routine_id: Option<String>,
    step_index: usize,
    step_started_at: Option<Instant>,
    routines: Routines,
}

/// Resolved view of the active step, handed to the orchestrator each cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveStep {
    pub routine_id: String,
    pub index: usize,
    pub total: usize,
    pub step: GuidedStep,
    pub started_at: Instant,
}

/// Shared guided-session state. Written by the serving layer, read by the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct SessionHandle {
    inner: Arc<RwLock<SessionState>>,
}

impl SessionHandle {
    pub fn new(routines: Routines) -> Self {
        Self {
            inner: Arc::new(RwLock::new(SessionState {
                routines,
                ..SessionState::default()
            })),
        }
    }

    /// Start a routine at its first step. Unknown routine ids are ignored.
    pub fn start(&self, routine_id: &str, now: Instant) -> bool {
        let mut state = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if !state.routines.contains_key(routine_id) {
            tracing::warn!("Unknown routine '{}'", routine_id);
            return false;
        }
        state.routine_id = Some(routine_id.to_string());
        state.step_index = 0;
        state.step_started_at = Some(now);
        true
    }

    /// Jump to a step of the active routine. Out of range indices are ignored.
    pub fn set_step(&self, index: usize, now: Instant) -> bool {
        let mut state = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let total = state
            .routine_id
            .as_ref()
            .and_then(|id| state.routines.get(id))
            .map(Vec::len)
            .unwrap_or(0);
        if index >= total {
            return false;
        }
        state.step_index = index;
        state.step_started_at = Some(now);
        true
    }

    pub fn stop(&self) {
        let mut state = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        state.routine_id = None;
        state.step_index = 0;
        state.step_started_at = None;
    }

    pub fn active_step(&self) -> Option<ActiveStep> {
        let state = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let routine_id = state.routine_id.as_ref()?;
        let steps = state.routines.get(routine_id)?;
        let step = steps.get(state.step_index)?;
        Some(ActiveStep {
            routine_id: routine_id.clone(),
            index: state.step_index,
            total: steps.len(),
            step: step.clone(),
            started_at: state.step_started_at?,
        })
    }
}
