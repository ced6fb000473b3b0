use crate::common::Point;
use crate::pipeline::landmarks::LandmarkSet;
use crate::remote::RemoteResult;

const MIN_WEIGHT: f64 = 0.2;
const MAX_WEIGHT: f64 = 0.8;
const FALLBACK_WEIGHT: f64 = 0.5;

/// Weight given to the remote estimate for a reported confidence.
pub fn remote_weight(confidence: f64) -> f64 {
    if !confidence.is_finite() || confidence <= 0.0 {
        FALLBACK_WEIGHT
    } else {
        confidence.clamp(MIN_WEIGHT, MAX_WEIGHT)
    }
}

/// Merge a fresh remote result (in full-frame coordinates) into the local set.
/// Negative results leave the local landmarks untouched.
pub fn fuse(mut local: LandmarkSet, remote: Option<&RemoteResult>) -> LandmarkSet {
    let Some(remote) = remote.filter(|remote| remote.ok) else {
        return local;
    };
    let weight = remote_weight(remote.confidence);
    for (name, remote_point) in &remote.landmarks {
        let fused = match local.get(name) {
            Some(local_point) => Point::new(
                local_point.x * (1.0 - weight) + remote_point.x * weight,
                local_point.y * (1.0 - weight) + remote_point.y * weight,
            ),
            None => *remote_point,
        };
        local.insert(name.clone(), fused);
    }
    local
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(entries: &[(&str, f64, f64)]) -> LandmarkSet {
        entries
            .iter()
            .map(|(name, x, y)| (name.to_string(), Point::new(*x, *y)))
            .collect()
    }

    fn remote(ok: bool, confidence: f64, entries: &[(&str, f64, f64)]) -> RemoteResult {
        RemoteResult {
            ok,
            confidence,
            landmarks: set(entries),
            ..RemoteResult::default()
        }
    }

    #[test]
    fn blends_toward_remote_by_confidence() {
        let local = set(&[("mouth_center", 0.5, 0.5)]);
        let fused = fuse(local, Some(&remote(true, 0.6, &[("mouth_center", 0.7, 0.3)])));
        let mouth = fused["mouth_center"];
        assert!((0.55..=0.7).contains(&mouth.x));
        assert!((0.3..=0.48).contains(&mouth.y));
        assert!((mouth.x - 0.62).abs() < 1e-9);
    }

    #[test]
    fn weight_is_clamped_and_defaults_for_bad_confidence() {
        assert_eq!(remote_weight(0.05), 0.2);
        assert_eq!(remote_weight(0.99), 0.8);
        assert_eq!(remote_weight(0.0), 0.5);
        assert_eq!(remote_weight(-1.0), 0.5);
        assert_eq!(remote_weight(f64::NAN), 0.5);
    }

    #[test]
    fn remote_only_landmarks_are_adopted() {
        let local = set(&[("mouth_center", 0.5, 0.5)]);
        let fused = fuse(local, Some(&remote(true, 0.6, &[("cheek_left", 0.3, 0.4)])));
        assert_eq!(fused["cheek_left"], Point::new(0.3, 0.4));
        assert_eq!(fused["mouth_center"], Point::new(0.5, 0.5));
    }

    #[test]
    fn negative_or_missing_results_are_a_no_op() {
        let local = set(&[("mouth_center", 0.5, 0.5)]);
        let negative = remote(false, 0.9, &[("mouth_center", 0.9, 0.9)]);
        assert_eq!(fuse(local.clone(), Some(&negative)), local);
        assert_eq!(fuse(local.clone(), None), local);
    }
}
