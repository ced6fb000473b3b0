use crate::common::Point;
use crate::error::DetectError;
use image::GrayImage;

pub const DETECTION_UNAVAILABLE: &str = "aruco not available";

/// A detected marker with its corners in detector order (TL, TR, BR, BL), in pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedMarker {
    pub id: i32,
    pub corners: [Point; 4],
}

impl DetectedMarker {
    pub fn center(&self) -> Point {
        let (sx, sy) = self
            .corners
            .iter()
            .fold((0.0, 0.0), |(sx, sy), c| (sx + c.x, sy + c.y));
        Point::new(sx / 4.0, sy / 4.0)
    }
}

pub trait MarkerDetector: Send {
    fn detect(&mut self, gray: &GrayImage) -> Result<Vec<DetectedMarker>, DetectError>;
}

/// Stand-in used when no marker detection backend is compiled in.
#[derive(Debug, Default)]
pub struct UnavailableDetector;

impl MarkerDetector for UnavailableDetector {
    fn detect(&mut self, _gray: &GrayImage) -> Result<Vec<DetectedMarker>, DetectError> {
        Err(DetectError::Unavailable(DETECTION_UNAVAILABLE.to_string()))
    }
}

#[cfg(feature = "opencv")]
pub fn default_detector() -> Box<dyn MarkerDetector> {
    match aruco::ArucoMarkerDetector::new() {
        Ok(detector) => Box::new(detector),
        Err(err) => {
            tracing::warn!("ArUco detector could not be created: {}", err);
            Box::new(UnavailableDetector)
        }
    }
}

#[cfg(not(feature = "opencv"))]
pub fn default_detector() -> Box<dyn MarkerDetector> {
    Box::new(UnavailableDetector)
}

#[cfg(feature = "opencv")]
mod aruco {
    use super::{DetectedMarker, MarkerDetector};
    use crate::common::Point;
    use crate::error::DetectError;
    use image::GrayImage;
    use opencv::{
        core::{Mat, Point2f, Vector},
        objdetect::{
            self, ArucoDetector, DetectorParameters, PredefinedDictionaryType, RefineParameters,
        },
        prelude::*,
    };

    fn backend_error(err: opencv::Error) -> DetectError {
        DetectError::Backend(err.to_string())
    }

    pub struct ArucoMarkerDetector {
        detector: ArucoDetector,
    }

    impl ArucoMarkerDetector {
        pub fn new() -> Result<Self, DetectError> {
            let dictionary =
                objdetect::get_predefined_dictionary(PredefinedDictionaryType::DICT_5X5_250)
                    .map_err(backend_error)?;
            let parameters = DetectorParameters::default().map_err(backend_error)?;
            let refine = RefineParameters::new_def().map_err(backend_error)?;
            let detector =
                ArucoDetector::new(&dictionary, &parameters, refine).map_err(backend_error)?;
            Ok(Self { detector })
        }
    }

    impl MarkerDetector for ArucoMarkerDetector {
        fn detect(&mut self, gray: &GrayImage) -> Result<Vec<DetectedMarker>, DetectError> {
            let flat = Mat::from_slice(gray.as_raw()).map_err(backend_error)?;
            let mat = flat
                .reshape(1, gray.height() as i32)
                .map_err(backend_error)?;
            let mut corners: Vector<Vector<Point2f>> = Vector::new();
            let mut ids: Vector<i32> = Vector::new();
            let mut rejected: Vector<Vector<Point2f>> = Vector::new();
            self.detector
                .detect_markers(&mat, &mut corners, &mut ids, &mut rejected)
                .map_err(backend_error)?;

            let mut markers = Vec::with_capacity(ids.len());
            for (id, quad) in ids.iter().zip(corners.iter()) {
                if quad.len() != 4 {
                    continue;
                }
                let mut points = [Point::default(); 4];
                for (slot, corner) in points.iter_mut().zip(quad.iter()) {
                    *slot = Point::new(f64::from(corner.x), f64::from(corner.y));
                }
                markers.push(DetectedMarker {
                    id,
                    corners: points,
                });
            }
            Ok(markers)
        }
    }
}
