use crate::common::Point;
use crate::fiducial::FiducialAnchor;
use crate::state::ToolBinding;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const DWELL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlignmentState {
    Searching,
    Aligning,
    Good,
}

/// Per-cycle alignment of one bound marker against its target.
#[derive(Debug, Clone, PartialEq)]
pub struct Alignment {
    pub state: AlignmentState,
    pub distance_px: Option<f64>,
    pub tilt_hint: Option<&'static str>,
}

impl Alignment {
    fn searching() -> Self {
        Self {
            state: AlignmentState::Searching,
            distance_px: None,
            tilt_hint: None,
        }
    }
}

/// Classify a marker against its binding. `target_px` is the target landmark
/// in full-frame pixels when it resolved this cycle.
pub fn evaluate(
    anchor: Option<&FiducialAnchor>,
    binding: Option<&ToolBinding>,
    target_px: Option<Point>,
    pose_available: bool,
) -> Alignment {
    let (Some(anchor), Some(binding), Some(target)) = (anchor, binding, target_px) else {
        return Alignment::searching();
    };
    let distance = anchor.center.distance(&target);
    let mut tilt_hint = None;
    if pose_available {
        if let Some(pose) = anchor.pose {
            if pose.yaw.abs() > binding.yaw_tol_deg {
                tilt_hint = Some(if pose.yaw > 0.0 { "Turn tool left" } else { "Turn tool right" });
            } else if pose.pitch.abs() > binding.pitch_tol_deg {
                tilt_hint = Some(if pose.pitch > 0.0 { "Tilt tool down" } else { "Tilt tool up" });
            }
        }
    }
    let state = if distance <= binding.distance_tol_px && tilt_hint.is_none() {
        AlignmentState::Good
    } else {
        AlignmentState::Aligning
    };
    Alignment {
        state,
        distance_px: Some(distance),
        tilt_hint,
    }
}

#[derive(Debug, Clone)]
struct MarkerGuidance {
    confirmed: AlignmentState,
    observed: AlignmentState,
    /// When `observed` was first seen without interruption.
    since: Instant,
}

/// Debounces alignment states per marker id: a new state is only confirmed
/// once it has been observed continuously for the dwell time.
#[derive(Debug, Clone)]
pub struct GuidanceTracker {
    dwell: Duration,
    markers: HashMap<i32, MarkerGuidance>,
}

impl Default for GuidanceTracker {
    fn default() -> Self {
        Self::new(DWELL)
    }
}

impl GuidanceTracker {
    pub fn new(dwell: Duration) -> Self {
        Self {
            dwell,
            markers: HashMap::new(),
        }
    }

    pub fn observe(&mut self, marker_id: i32, observed: AlignmentState, now: Instant) -> AlignmentState {
        let entry = self.markers.entry(marker_id).or_insert_with(|| MarkerGuidance {
            confirmed: observed,
            observed,
            since: now,
        });
        if entry.observed != observed {
            entry.observed = observed;
            entry.since = now;
        }
        if entry.observed != entry.confirmed && now.saturating_duration_since(entry.since) >= self.dwell {
            tracing::debug!(
                "Marker {} guidance {:?} -> {:?}",
                marker_id,
                entry.confirmed,
                entry.observed
            );
            entry.confirmed = entry.observed;
        }
        entry.confirmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiducial::EulerAngles;

    fn binding() -> ToolBinding {
        ToolBinding {
            marker_id: 7,
            target_landmark: "mouth_center".to_string(),
            distance_tol_px: 40.0,
            yaw_tol_deg: 15.0,
            pitch_tol_deg: 15.0,
        }
    }

    fn anchor(x: f64, y: f64, pose: Option<EulerAngles>) -> FiducialAnchor {
        FiducialAnchor {
            id: 7,
            center: Point::new(x, y),
            pose,
        }
    }

    #[test]
    fn searching_without_binding_or_target() {
        let marker = anchor(100.0, 100.0, None);
        assert_eq!(
            evaluate(Some(&marker), None, Some(Point::new(0.0, 0.0)), false).state,
            AlignmentState::Searching
        );
        assert_eq!(
            evaluate(Some(&marker), Some(&binding()), None, false).state,
            AlignmentState::Searching
        );
        assert_eq!(
            evaluate(None, Some(&binding()), Some(Point::new(0.0, 0.0)), false).state,
            AlignmentState::Searching
        );
    }

    #[test]
    fn distance_decides_in_planar_mode() {
        let target = Some(Point::new(100.0, 100.0));
        let near = anchor(120.0, 110.0, None);
        let far = anchor(300.0, 100.0, None);
        assert_eq!(evaluate(Some(&near), Some(&binding()), target, false).state, AlignmentState::Good);
        let aligning = evaluate(Some(&far), Some(&binding()), target, false);
        assert_eq!(aligning.state, AlignmentState::Aligning);
        assert_eq!(aligning.distance_px, Some(200.0));
    }

    #[test]
    fn orientation_tolerances_apply_with_pose() {
        let target = Some(Point::new(100.0, 100.0));
        let tilted = anchor(
            100.0,
            100.0,
            Some(EulerAngles {
                yaw: 2.0,
                pitch: 30.0,
                roll: 180.0,
            }),
        );
        let result = evaluate(Some(&tilted), Some(&binding()), target, true);
        assert_eq!(result.state, AlignmentState::Aligning);
        assert_eq!(result.tilt_hint, Some("Tilt tool down"));

        // Without pose the same marker is judged on distance only.
        assert_eq!(
            evaluate(Some(&tilted), Some(&binding()), target, false).state,
            AlignmentState::Good
        );
    }

    #[test]
    fn single_transient_is_ignored() {
        let start = Instant::now();
        let mut tracker = GuidanceTracker::default();
        assert_eq!(tracker.observe(7, AlignmentState::Good, start), AlignmentState::Good);
        let blip = start + Duration::from_millis(40);
        assert_eq!(tracker.observe(7, AlignmentState::Aligning, blip), AlignmentState::Good);
        let back = start + Duration::from_millis(80);
        assert_eq!(tracker.observe(7, AlignmentState::Good, back), AlignmentState::Good);
        // The blip restarted nothing: a later flip needs its own full dwell.
        let flip = back + Duration::from_millis(200);
        assert_eq!(tracker.observe(7, AlignmentState::Aligning, flip), AlignmentState::Good);
        assert_eq!(
            tracker.observe(7, AlignmentState::Aligning, flip + Duration::from_millis(200)),
            AlignmentState::Good
        );
        assert_eq!(tracker.observe(7, AlignmentState::Aligning, flip + DWELL), AlignmentState::Aligning);
    }

    #[test]
    fn sustained_change_is_confirmed_after_dwell() {
        let start = Instant::now();
        let mut tracker = GuidanceTracker::default();
        tracker.observe(7, AlignmentState::Searching, start);
        let first = start + Duration::from_millis(100);
        assert_eq!(tracker.observe(7, AlignmentState::Aligning, first), AlignmentState::Searching);
        let mid = first + Duration::from_millis(200);
        assert_eq!(tracker.observe(7, AlignmentState::Aligning, mid), AlignmentState::Searching);
        let done = first + DWELL;
        assert_eq!(tracker.observe(7, AlignmentState::Aligning, done), AlignmentState::Aligning);
        assert_eq!(
            tracker.observe(7, AlignmentState::Aligning, done + Duration::from_secs(1)),
            AlignmentState::Aligning
        );
    }

    #[test]
    fn markers_are_debounced_independently() {
        let now = Instant::now();
        let mut tracker = GuidanceTracker::default();
        tracker.observe(1, AlignmentState::Good, now);
        tracker.observe(2, AlignmentState::Searching, now);

        let later = now + Duration::from_millis(300);
        tracker.observe(1, AlignmentState::Aligning, later);
        tracker.observe(2, AlignmentState::Aligning, later);

        let end = later + Duration::from_millis(300);
        assert_eq!(tracker.observe(1, AlignmentState::Aligning, end), AlignmentState::Aligning);
        assert_eq!(tracker.observe(2, AlignmentState::Searching, end), AlignmentState::Searching);
        // A marker seen for the first time takes its observed state at once.
        assert_eq!(tracker.observe(3, AlignmentState::Good, end), AlignmentState::Good);
    }
}
