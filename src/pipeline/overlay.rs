use crate::common::Point;
use crate::fiducial::FiducialAnchor;
use crate::pipeline::guidance::AlignmentState;
use crate::pipeline::landmarks::LandmarkSet;
use crate::state::ActiveStep;
use serde::Serialize;
use std::time::Instant;

pub const OVERLAY_SET: &str = "overlay.set";

const TARGET_RING_RADIUS: f64 = 90.0;
const IDLE_RING_RADIUS: f64 = 80.0;
const LOCATOR_RING_RADIUS: f64 = 60.0;
const HOLD_RING_RADIUS: f64 = 70.0;
const BADGE_OFFSET: Point = Point { x: 0.0, y: -120.0 };
const HINT_OFFSET: Point = Point { x: 0.0, y: -80.0 };
const HAND_KEY: &str = "hand_right_index_tip_Right";

/// Where a shape is placed on the display.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Anchor {
    Pixel(Point),
    Landmark(String),
    ArucoId(i32),
}

impl Anchor {
    /// Pixel anchor for whatever this one names, if it is visible in the current frame.
    pub fn resolve(&self, ctx: &OverlayContext<'_>) -> Option<Anchor> {
        let point = match self {
            Anchor::Pixel(point) => *point,
            Anchor::Landmark(name) => ctx.landmark_px(name)?,
            Anchor::ArucoId(id) => ctx.anchors.iter().find(|anchor| anchor.id == *id)?.center,
        };
        Some(Anchor::Pixel(point))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Accent {
    Neutral,
    Info,
    Warning,
    Success,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Shape {
    Ring {
        anchor: Anchor,
        radius_px: f64,
        accent: Accent,
        #[serde(skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    Arrow {
        anchor: Anchor,
        to: Anchor,
        accent: Accent,
    },
    Badge {
        anchor: Anchor,
        text: String,
        offset_px: Point,
        accent: Accent,
    },
}

impl Shape {
    /// The shape with every anchor resolved to pixels; `None` if any is not visible.
    fn resolved(self, ctx: &OverlayContext<'_>) -> Option<Shape> {
        let shape = match self {
            Shape::Ring {
                anchor,
                radius_px,
                accent,
                label,
            } => Shape::Ring {
                anchor: anchor.resolve(ctx)?,
                radius_px,
                accent,
                label,
            },
            Shape::Arrow { anchor, to, accent } => Shape::Arrow {
                anchor: anchor.resolve(ctx)?,
                to: to.resolve(ctx)?,
                accent,
            },
            Shape::Badge {
                anchor,
                text,
                offset_px,
                accent,
            } => Shape::Badge {
                anchor: anchor.resolve(ctx)?,
                text,
                offset_px,
                accent,
            },
        };
        Some(shape)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct Hud {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    pub subtitle: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_left_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_time_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverlayMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub shapes: Vec<Shape>,
    pub hud: Option<Hud>,
}

impl OverlayMessage {
    pub fn new(shapes: Vec<Shape>, hud: Option<Hud>) -> Self {
        Self {
            kind: OVERLAY_SET,
            shapes,
            hud,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Debounced guidance for one bound marker, resolved to pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerCue {
    pub marker_id: i32,
    pub state: AlignmentState,
    pub marker_px: Option<Point>,
    pub target_px: Option<Point>,
    pub tilt_hint: Option<&'static str>,
}

/// Everything one overlay frame is built from.
pub struct OverlayContext<'a> {
    pub frame_width: u32,
    pub frame_height: u32,
    pub landmarks: &'a LandmarkSet,
    pub anchors: &'a [FiducialAnchor],
    pub step: Option<&'a ActiveStep>,
    pub cues: &'a [MarkerCue],
    pub hands_enabled: bool,
    pub now: Instant,
}

impl OverlayContext<'_> {
    fn landmark_px(&self, name: &str) -> Option<Point> {
        self.landmarks
            .get(name)
            .map(|point| point.to_pixels(self.frame_width, self.frame_height))
    }
}

pub fn build_overlay(ctx: &OverlayContext<'_>) -> OverlayMessage {
    let mut shapes = Vec::new();

    match ctx.step {
        Some(active) => {
            for target in &active.step.target_anchors {
                shapes.push(Shape::Ring {
                    anchor: Anchor::Landmark(target.clone()),
                    radius_px: TARGET_RING_RADIUS,
                    accent: Accent::Info,
                    label: None,
                });
            }
            let mouth_target = active
                .step
                .target_anchors
                .iter()
                .filter(|name| name.contains("mouth"))
                .find(|name| ctx.landmarks.contains_key(name.as_str()));
            if ctx.hands_enabled {
                if let Some(mouth) = mouth_target {
                    shapes.push(Shape::Arrow {
                        anchor: Anchor::Landmark(HAND_KEY.to_string()),
                        to: Anchor::Landmark(mouth.clone()),
                        accent: Accent::Info,
                    });
                }
            }
        }
        None => shapes.push(Shape::Ring {
            anchor: Anchor::Pixel(Point::new(
                f64::from(ctx.frame_width) / 2.0,
                f64::from(ctx.frame_height) / 2.0,
            )),
            radius_px: IDLE_RING_RADIUS,
            accent: Accent::Neutral,
            label: None,
        }),
    }

    for cue in ctx.cues {
        push_cue(&mut shapes, cue);
    }

    for anchor in ctx.anchors {
        if ctx.cues.iter().any(|cue| cue.marker_id == anchor.id) {
            continue;
        }
        shapes.push(Shape::Badge {
            anchor: Anchor::ArucoId(anchor.id),
            text: "Hold here".to_string(),
            offset_px: BADGE_OFFSET,
            accent: Accent::Info,
        });
    }

    // Shapes whose landmark or marker is not visible this frame are dropped.
    let shapes = shapes.into_iter().filter_map(|shape| shape.resolved(ctx)).collect();
    OverlayMessage::new(shapes, ctx.step.map(|step| step_hud(step, ctx.now)))
}

fn push_cue(shapes: &mut Vec<Shape>, cue: &MarkerCue) {
    match cue.state {
        AlignmentState::Searching => {
            if let Some(marker) = cue.marker_px {
                shapes.push(Shape::Ring {
                    anchor: Anchor::Pixel(marker),
                    radius_px: LOCATOR_RING_RADIUS,
                    accent: Accent::Neutral,
                    label: None,
                });
            } else if let Some(target) = cue.target_px {
                shapes.push(Shape::Badge {
                    anchor: Anchor::Pixel(target),
                    text: "Show tool".to_string(),
                    offset_px: BADGE_OFFSET,
                    accent: Accent::Neutral,
                });
            }
        }
        AlignmentState::Aligning => {
            if let (Some(marker), Some(target)) = (cue.marker_px, cue.target_px) {
                shapes.push(Shape::Arrow {
                    anchor: Anchor::Pixel(marker),
                    to: Anchor::Pixel(target),
                    accent: Accent::Warning,
                });
            }
            if let (Some(marker), Some(hint)) = (cue.marker_px, cue.tilt_hint) {
                shapes.push(Shape::Badge {
                    anchor: Anchor::Pixel(marker),
                    text: hint.to_string(),
                    offset_px: HINT_OFFSET,
                    accent: Accent::Warning,
                });
            }
        }
        AlignmentState::Good => {
            if let Some(at) = cue.marker_px.or(cue.target_px) {
                shapes.push(Shape::Ring {
                    anchor: Anchor::Pixel(at),
                    radius_px: HOLD_RING_RADIUS,
                    accent: Accent::Success,
                    label: Some("Hold".to_string()),
                });
            }
        }
    }
}

fn step_hud(active: &ActiveStep, now: Instant) -> Hud {
    let min_time = active.step.min_time_s.max(0.0);
    let elapsed = now.saturating_duration_since(active.started_at).as_secs_f64();
    let progress = if min_time > 0.0 {
        (elapsed / min_time).clamp(0.0, 1.0)
    } else {
        1.0
    };
    Hud {
        title: active.step.title.clone(),
        step: Some(format!("Step {} of {}", active.index + 1, active.total)),
        subtitle: active.step.subtitle.clone(),
        hint: active.step.hint.clone(),
        time_left_s: Some((min_time - elapsed).max(0.0)),
        max_time_s: Some(min_time),
        progress: Some(progress),
    }
}

/// Shown when the face detector is on but nothing has been seen for a while.
pub fn positioning_hint() -> OverlayMessage {
    OverlayMessage::new(
        Vec::new(),
        Some(Hud {
            title: "Position Yourself".to_string(),
            subtitle: "Move closer to camera".to_string(),
            hint: Some("Ensure good lighting".to_string()),
            ..Hud::default()
        }),
    )
}
