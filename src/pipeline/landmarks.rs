use crate::common::Point;
use crate::config::FeatureMap;
use image::RgbImage;
use indexmap::IndexMap;
use std::time::Instant;

/// Landmark name to normalized (x, y).
pub type LandmarkSet = IndexMap<String, Point>;

/// Normalized bounding box relative to the image it was detected in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizedBox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FaceDetection {
    pub landmarks: LandmarkSet,
    pub bbox: Option<NormalizedBox>,
}

/// Local landmark extraction. Coordinates are normalized to the input image.
pub trait LandmarkExtractor: Send {
    fn detect_face(&mut self, image: &RgbImage) -> Option<FaceDetection>;
    fn detect_hands(&mut self, image: &RgbImage) -> LandmarkSet;
}

#[derive(Debug, Clone, PartialEq)]
pub struct HandMesh {
    pub handedness: String,
    pub points: Vec<Point>,
}

/// Opaque mesh inference capability (face mesh, hand landmarks).
pub trait MeshModel: Send {
    fn face_mesh(&mut self, image: &RgbImage) -> Option<Vec<Point>>;
    fn hand_meshes(&mut self, image: &RgbImage) -> Vec<HandMesh>;
}

/// Reduces raw mesh output to the configured named features.
pub struct MeshLandmarkExtractor<M> {
    model: M,
    features: FeatureMap,
}

impl<M: MeshModel> MeshLandmarkExtractor<M> {
    pub fn new(model: M, features: FeatureMap) -> Self {
        Self { model, features }
    }
}

fn mean_of(points: &[Point], indices: &[usize]) -> Option<Point> {
    if indices.is_empty() {
        return None;
    }
    let mut sum = Point::default();
    for &index in indices {
        let point = points.get(index)?;
        sum.x += point.x;
        sum.y += point.y;
    }
    let n = indices.len() as f64;
    Some(Point::new(sum.x / n, sum.y / n))
}

fn extent(points: &[Point]) -> Option<NormalizedBox> {
    let first = points.first()?;
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
    for point in points {
        min_x = min_x.min(point.x);
        min_y = min_y.min(point.y);
        max_x = max_x.max(point.x);
        max_y = max_y.max(point.y);
    }
    Some(NormalizedBox {
        x: min_x,
        y: min_y,
        w: max_x - min_x,
        h: max_y - min_y,
    })
}

impl<M: MeshModel> LandmarkExtractor for MeshLandmarkExtractor<M> {
    fn detect_face(&mut self, image: &RgbImage) -> Option<FaceDetection> {
        let mesh = self.model.face_mesh(image)?;
        let landmarks = self
            .features
            .face
            .iter()
            .filter_map(|(name, indices)| mean_of(&mesh, indices).map(|p| (name.clone(), p)))
            .collect();
        Some(FaceDetection {
            landmarks,
            bbox: extent(&mesh),
        })
    }

    fn detect_hands(&mut self, image: &RgbImage) -> LandmarkSet {
        let mut landmarks = LandmarkSet::new();
        for hand in self.model.hand_meshes(image) {
            for (name, indices) in &self.features.hands {
                // Hand features use their first index only.
                let Some(point) = indices.first().and_then(|i| hand.points.get(*i)) else {
                    continue;
                };
                landmarks.insert(format!("{}_{}", name, hand.handedness), *point);
            }
        }
        landmarks
    }
}

/// Stand-in used when no mesh model is available: a mouth landmark pulsing
/// gently around the frame center.
pub struct SyntheticLandmarks {
    started: Instant,
}

impl Default for SyntheticLandmarks {
    fn default() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl SyntheticLandmarks {
    pub fn mouth_at(t: f64) -> Point {
        Point::new(0.5 + 0.02 * (2.0 * t).sin(), 0.5)
    }
}

impl LandmarkExtractor for SyntheticLandmarks {
    fn detect_face(&mut self, _image: &RgbImage) -> Option<FaceDetection> {
        let t = self.started.elapsed().as_secs_f64();
        let mut landmarks = LandmarkSet::new();
        landmarks.insert("mouth_center".to_string(), Self::mouth_at(t));
        Some(FaceDetection {
            landmarks,
            bbox: None,
        })
    }

    fn detect_hands(&mut self, _image: &RgbImage) -> LandmarkSet {
        LandmarkSet::new()
    }
}
