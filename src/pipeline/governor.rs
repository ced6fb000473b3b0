use crate::state::health::BudgetHealth;
use std::time::{Duration, Instant};

const RELAX_BELOW_MS: f64 = 180.0;
const RELAX_AFTER: Duration = Duration::from_millis(3000);
const MIN_WIDTH: u32 = 320;
const MAX_FACE_STRIDE: u32 = 8;
const MAX_FIDUCIAL_STRIDE: u32 = 8;
const MIN_FIDUCIAL_STRIDE: u32 = 2;

struct Tier {
    above_ms: f64,
    face_stride: u32,
    fiducial_stride: u32,
    max_width: u32,
}

// Checked from the most severe down; the first match applies.
const TIERS: [Tier; 3] = [
    Tier {
        above_ms: 1200.0,
        face_stride: 8,
        fiducial_stride: 6,
        max_width: 640,
    },
    Tier {
        above_ms: 600.0,
        face_stride: 4,
        fiducial_stride: 4,
        max_width: 800,
    },
    Tier {
        above_ms: 300.0,
        face_stride: 2,
        fiducial_stride: 3,
        max_width: 960,
    },
];

/// Latency-driven load shedding. Owned and mutated by the processing loop only.
#[derive(Debug, Clone)]
pub struct PerformanceBudget {
    face_stride: u32,
    fiducial_stride: u32,
    face_target_width: u32,
    native_width: u32,
    last_adapted: Instant,
}

impl PerformanceBudget {
    pub fn new(native_width: u32, fiducial_baseline: u32, now: Instant) -> Self {
        let native_width = native_width.max(MIN_WIDTH);
        Self {
            face_stride: 1,
            fiducial_stride: Self::fiducial_floor(fiducial_baseline),
            face_target_width: native_width,
            native_width,
            last_adapted: now,
        }
    }

    fn fiducial_floor(baseline: u32) -> u32 {
        baseline.clamp(MIN_FIDUCIAL_STRIDE, MAX_FIDUCIAL_STRIDE)
    }

    pub fn face_stride(&self) -> u32 {
        self.face_stride
    }

    pub fn fiducial_stride(&self) -> u32 {
        self.fiducial_stride
    }

    pub fn face_target_width(&self) -> u32 {
        self.face_target_width
    }

    pub fn snapshot(&self) -> BudgetHealth {
        BudgetHealth {
            face_stride: self.face_stride,
            fiducial_stride: self.fiducial_stride,
            face_target_width: self.face_target_width,
        }
    }

    /// Feed the latest end-to-end latency. Returns true when the budget changed.
    pub fn adapt(&mut self, latency_ms: f64, fiducial_baseline: u32, now: Instant) -> bool {
        let before = self.snapshot();
        let floor = Self::fiducial_floor(fiducial_baseline);
        self.fiducial_stride = self.fiducial_stride.max(floor);

        if let Some(tier) = TIERS.iter().find(|tier| latency_ms > tier.above_ms) {
            self.face_stride = self.face_stride.max(tier.face_stride).min(MAX_FACE_STRIDE);
            self.fiducial_stride = self
                .fiducial_stride
                .max(tier.fiducial_stride)
                .min(MAX_FIDUCIAL_STRIDE);
            self.face_target_width = self
                .face_target_width
                .min(tier.max_width)
                .clamp(MIN_WIDTH, self.native_width);
            self.last_adapted = now;
            if self.snapshot() != before {
                tracing::info!(
                    "Latency {:.0}ms, shedding load: face stride {}, fiducial stride {}, width {}",
                    latency_ms,
                    self.face_stride,
                    self.fiducial_stride,
                    self.face_target_width
                );
            }
        } else if latency_ms < RELAX_BELOW_MS
            && now.saturating_duration_since(self.last_adapted) >= RELAX_AFTER
        {
            self.face_stride = self.face_stride.saturating_sub(1).max(1);
            self.fiducial_stride = self.fiducial_stride.saturating_sub(1).max(floor);
            let widened = (f64::from(self.face_target_width) * 1.25).round() as u32;
            self.face_target_width = widened.min(self.native_width);
            if self.snapshot() != before {
                self.last_adapted = now;
                tracing::info!(
                    "Latency recovered, relaxing: face stride {}, fiducial stride {}, width {}",
                    self.face_stride,
                    self.fiducial_stride,
                    self.face_target_width
                );
            }
        }
        self.snapshot() != before
    }
}
