use crate::error::IntrinsicsError;
use nalgebra::Matrix3;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Pinhole camera matrix plus OpenCV-ordered distortion (k1, k2, p1, p2, k3).
#[derive(Debug, Clone, PartialEq)]
pub struct CameraIntrinsics {
    pub k: Matrix3<f64>,
    pub dist: Vec<f64>,
}

#[derive(Deserialize)]
struct IntrinsicsFile {
    #[serde(rename = "K")]
    k: [[f64; 3]; 3],
    #[serde(default)]
    dist: Vec<f64>,
}

impl CameraIntrinsics {
    pub fn from_json(raw: &str) -> Result<Self, IntrinsicsError> {
        let file: IntrinsicsFile =
            serde_json::from_str(raw).map_err(|e| IntrinsicsError::Malformed(e.to_string()))?;
        let k = Matrix3::from_fn(|row, col| file.k[row][col]);
        if !k.iter().all(|v| v.is_finite()) || !file.dist.iter().all(|v| v.is_finite()) {
            return Err(IntrinsicsError::Malformed("non-finite value".to_string()));
        }
        if k[(0, 0)] <= 0.0 || k[(1, 1)] <= 0.0 {
            return Err(IntrinsicsError::Malformed(
                "focal lengths must be positive".to_string(),
            ));
        }
        Ok(Self { k, dist: file.dist })
    }

    pub fn load(path: &Path) -> Result<Self, IntrinsicsError> {
        let raw = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => IntrinsicsError::NotFound(path.to_path_buf()),
            _ => IntrinsicsError::Io(e.to_string()),
        })?;
        Self::from_json(&raw)
    }

    pub fn fx(&self) -> f64 {
        self.k[(0, 0)]
    }

    pub fn fy(&self) -> f64 {
        self.k[(1, 1)]
    }

    pub fn cx(&self) -> f64 {
        self.k[(0, 2)]
    }

    pub fn cy(&self) -> f64 {
        self.k[(1, 2)]
    }

    fn coefficient(&self, index: usize) -> f64 {
        self.dist.get(index).copied().unwrap_or(0.0)
    }

    /// Apply lens distortion to a point in normalized camera coordinates.
    pub fn distort(&self, x: f64, y: f64) -> (f64, f64) {
        let (k1, k2, p1, p2, k3) = (
            self.coefficient(0),
            self.coefficient(1),
            self.coefficient(2),
            self.coefficient(3),
            self.coefficient(4),
        );
        let r2 = x * x + y * y;
        let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
        (
            x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x),
            y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y,
        )
    }

    /// Pixel to undistorted normalized camera coordinates, by fixed-point iteration.
    pub fn undistort_pixel(&self, u: f64, v: f64) -> (f64, f64) {
        let xd = (u - self.cx()) / self.fx();
        let yd = (v - self.cy()) / self.fy();
        if self.dist.iter().all(|c| *c == 0.0) {
            return (xd, yd);
        }
        let (mut x, mut y) = (xd, yd);
        for _ in 0..10 {
            let (dx, dy) = self.distort(x, y);
            x += xd - dx;
            y += yd - dy;
        }
        (x, y)
    }
}

/// Loads intrinsics at most once and remembers the outcome, including failure.
#[derive(Debug)]
pub struct IntrinsicsCache {
    path: PathBuf,
    loaded: OnceLock<Result<CameraIntrinsics, IntrinsicsError>>,
}

impl IntrinsicsCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            loaded: OnceLock::new(),
        }
    }

    pub fn get(&self) -> Result<&CameraIntrinsics, &IntrinsicsError> {
        self.loaded
            .get_or_init(|| {
                let result = CameraIntrinsics::load(&self.path);
                match &result {
                    Ok(_) => tracing::info!("Loaded camera intrinsics from {}", self.path.display()),
                    Err(err) => tracing::warn!("Camera intrinsics unavailable, pose disabled: {}", err),
                }
                result
            })
            .as_ref()
    }

    pub fn error_message(&self) -> Option<String> {
        self.get().err().map(ToString::to_string)
    }
}
