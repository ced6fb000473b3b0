use crate::common::Point;
use crate::fiducial::intrinsics::CameraIntrinsics;
use nalgebra::{Matrix3, SMatrix, SVector, Vector3};
use serde::Serialize;

/// Euler angles in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Default)]
pub struct EulerAngles {
    pub yaw: f64,
    pub pitch: f64,
    pub roll: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarkerPose {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl MarkerPose {
    pub fn euler(&self) -> EulerAngles {
        euler_degrees(&self.rotation)
    }
}

/// Marker-plane corner coordinates in detector order: top-left, top-right,
/// bottom-right, bottom-left.
pub fn marker_object_points(size: f64) -> [(f64, f64); 4] {
    let half = size / 2.0;
    [(-half, half), (half, half), (half, -half), (-half, -half)]
}

/// Decompose a rotation matrix into yaw (z), pitch (y) and roll (x), handling
/// the gimbal-lock case where the pitch is ±90°.
pub fn euler_degrees(r: &Matrix3<f64>) -> EulerAngles {
    let sy = (r[(0, 0)] * r[(0, 0)] + r[(1, 0)] * r[(1, 0)]).sqrt();
    let (x, y, z) = if sy >= 1e-6 {
        (
            r[(2, 1)].atan2(r[(2, 2)]),
            (-r[(2, 0)]).atan2(sy),
            r[(1, 0)].atan2(r[(0, 0)]),
        )
    } else {
        ((-r[(1, 2)]).atan2(r[(1, 1)]), (-r[(2, 0)]).atan2(sy), 0.0)
    };
    EulerAngles {
        yaw: z.to_degrees(),
        pitch: y.to_degrees(),
        roll: x.to_degrees(),
    }
}

/// Direct linear homography from four plane points to four image points, with h33 fixed to 1.
pub fn homography(src: &[(f64, f64); 4], dst: &[(f64, f64); 4]) -> Option<Matrix3<f64>> {
    let mut a = SMatrix::<f64, 8, 8>::zeros();
    let mut b = SVector::<f64, 8>::zeros();
    for (i, (&(x, y), &(u, v))) in src.iter().zip(dst.iter()).enumerate() {
        let r = 2 * i;
        a[(r, 0)] = x;
        a[(r, 1)] = y;
        a[(r, 2)] = 1.0;
        a[(r, 6)] = -u * x;
        a[(r, 7)] = -u * y;
        b[r] = u;

        a[(r + 1, 3)] = x;
        a[(r + 1, 4)] = y;
        a[(r + 1, 5)] = 1.0;
        a[(r + 1, 6)] = -v * x;
        a[(r + 1, 7)] = -v * y;
        b[r + 1] = v;
    }
    let h = a.lu().solve(&b)?;
    Some(Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0))
}

fn quad_area(corners: &[Point; 4]) -> f64 {
    let twice: f64 = (0..4)
        .map(|i| {
            let (a, b) = (corners[i], corners[(i + 1) % 4]);
            a.x * b.y - b.x * a.y
        })
        .sum();
    twice.abs() / 2.0
}

/// Estimate a marker's pose from its four detected pixel corners.
pub fn estimate_pose(
    corners: &[Point; 4],
    marker_size: f64,
    intrinsics: &CameraIntrinsics,
) -> Option<MarkerPose> {
    if !(marker_size > 0.0) || quad_area(corners) < 1.0 {
        return None;
    }
    let image_points = corners.map(|c| intrinsics.undistort_pixel(c.x, c.y));
    let h = homography(&marker_object_points(marker_size), &image_points)?;

    let h1 = h.column(0).into_owned();
    let h2 = h.column(1).into_owned();
    let h3 = h.column(2).into_owned();
    let norm = (h1.norm() + h2.norm()) / 2.0;
    if norm <= f64::EPSILON {
        return None;
    }
    let mut scale = 1.0 / norm;
    // The marker must lie in front of the camera.
    if h3.z * scale < 0.0 {
        scale = -scale;
    }
    let r1 = h1 * scale;
    let r2 = h2 * scale;
    let translation = h3 * scale;
    let r3 = r1.cross(&r2);
    let approx = Matrix3::from_columns(&[r1, r2, r3]);

    let svd = approx.svd(true, true);
    let (mut u, v_t) = (svd.u?, svd.v_t?);
    let mut rotation = u * v_t;
    if rotation.determinant() < 0.0 {
        u.column_mut(2).neg_mut();
        rotation = u * v_t;
    }
    Some(MarkerPose {
        rotation,
        translation,
    })
}
