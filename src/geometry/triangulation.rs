//! Two-view linear triangulation.

use nalgebra::{Matrix3x4, Matrix4, Vector3};

use super::SE3;

/// 3×4 projection matrix `[R | t]` of a world → camera transform.
pub fn projection_matrix(pose_cw: &SE3) -> Matrix3x4<f64> {
    let r = pose_cw.rotation_matrix();
    let t = &pose_cw.translation;
    Matrix3x4::new(
        r[(0, 0)],
        r[(0, 1)],
        r[(0, 2)],
        t.x,
        r[(1, 0)],
        r[(1, 1)],
        r[(1, 2)],
        t.y,
        r[(2, 0)],
        r[(2, 1)],
        r[(2, 2)],
        t.z,
    )
}

/// Triangulate a world point from two normalized-coordinate rays by DLT.
///
/// `xn1`/`xn2` are homogeneous normalized image coordinates (z = 1) in each
/// camera; `pose*_cw` are the world → camera transforms. The 4×4 system is
/// solved by SVD; the solution is the right singular vector of the smallest
/// singular value. Returns `None` when the homogeneous scale vanishes.
pub fn triangulate_dlt(
    xn1: &Vector3<f64>,
    xn2: &Vector3<f64>,
    pose1_cw: &SE3,
    pose2_cw: &SE3,
) -> Option<Vector3<f64>> {
    let p1 = projection_matrix(pose1_cw);
    let p2 = projection_matrix(pose2_cw);

    let mut a = Matrix4::<f64>::zeros();
    for j in 0..4 {
        a[(0, j)] = xn1.x * p1[(2, j)] - p1[(0, j)];
        a[(1, j)] = xn1.y * p1[(2, j)] - p1[(1, j)];
        a[(2, j)] = xn2.x * p2[(2, j)] - p2[(0, j)];
        a[(3, j)] = xn2.y * p2[(2, j)] - p2[(1, j)];
    }

    let svd = a.svd(true, true);
    let v_t = svd.v_t?;
    let h = v_t.row(3);

    if h[3].abs() < 1e-10 {
        return None;
    }

    Some(Vector3::new(h[0] / h[3], h[1] / h[3], h[2] / h[3]))
}
