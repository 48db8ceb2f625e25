//! Keypoints produced by the detector network and the relative-motion
//! transfer that maps driving motion onto the source face.

use anyhow::Result;
use ndarray::{s, Array2, Array3};
use serde::{Deserialize, Serialize};

use crate::error::VisionError;

/// Keypoints for one frame in the network's [-1, 1] coordinate space.
#[derive(Debug, Clone, PartialEq)]
pub struct Keypoints {
    /// [num_kp, 2]
    pub value: Array2<f32>,
    /// [num_kp, 2, 2], present when the model estimates local affine
    /// transforms around each keypoint.
    pub jacobian: Option<Array3<f32>>,
}

impl Keypoints {
    pub fn len(&self) -> usize {
        self.value.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn points(&self) -> Vec<(f32, f32)> {
        self.value.rows().into_iter().map(|r| (r[0], r[1])).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeOptions {
    pub adapt_movement_scale: bool,
    pub use_relative_movement: bool,
    pub use_relative_jacobian: bool,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            adapt_movement_scale: true,
            use_relative_movement: true,
            use_relative_jacobian: true,
        }
    }
}

fn cross(o: (f32, f32), a: (f32, f32), b: (f32, f32)) -> f32 {
    (a.0 - o.0) * (b.1 - o.1) - (a.1 - o.1) * (b.0 - o.0)
}

/// Monotone chain convex hull, counter-clockwise, collinear points dropped.
pub fn convex_hull(points: &[(f32, f32)]) -> Vec<(f32, f32)> {
    let mut pts: Vec<(f32, f32)> = points
        .iter()
        .copied()
        .filter(|p| p.0.is_finite() && p.1.is_finite())
        .collect();
    pts.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)));
    pts.dedup();

    if pts.len() < 3 {
        return pts;
    }

    let mut lower: Vec<(f32, f32)> = Vec::with_capacity(pts.len());
    for &p in &pts {
        while lower.len() >= 2 && cross(lower[lower.len() - 2], lower[lower.len() - 1], p) <= 0.0 {
            lower.pop();
        }
        lower.push(p);
    }

    let mut upper: Vec<(f32, f32)> = Vec::with_capacity(pts.len());
    for &p in pts.iter().rev() {
        while upper.len() >= 2 && cross(upper[upper.len() - 2], upper[upper.len() - 1], p) <= 0.0 {
            upper.pop();
        }
        upper.push(p);
    }

    lower.pop();
    upper.pop();
    lower.extend(upper);
    lower
}

/// Shoelace area of a simple polygon.
pub fn polygon_area(polygon: &[(f32, f32)]) -> f32 {
    if polygon.len() < 3 {
        return 0.0;
    }
    let twice: f32 = polygon
        .iter()
        .zip(polygon.iter().cycle().skip(1))
        .map(|(a, b)| a.0 * b.1 - b.0 * a.1)
        .sum();
    twice.abs() / 2.0
}

pub fn hull_area(points: &[(f32, f32)]) -> f32 {
    polygon_area(&convex_hull(points))
}

/// sqrt(source hull area) / sqrt(driving hull area). Falls back to 1 when
/// either hull is degenerate.
pub fn movement_scale(source: &Keypoints, driving_initial: &Keypoints) -> f32 {
    let source_area = hull_area(&source.points());
    let driving_area = hull_area(&driving_initial.points());

    if source_area <= f32::EPSILON || driving_area <= f32::EPSILON {
        log::warn!(
            "degenerate keypoint hull (source {:.4}, driving {:.4}), movement scale left at 1",
            source_area,
            driving_area
        );
        return 1.0;
    }

    source_area.sqrt() / driving_area.sqrt()
}

fn inverse_2x2(m: [[f32; 2]; 2]) -> Option<[[f32; 2]; 2]> {
    let det = m[0][0] * m[1][1] - m[0][1] * m[1][0];
    if det.abs() <= f32::EPSILON || !det.is_finite() {
        return None;
    }
    Some([
        [m[1][1] / det, -m[0][1] / det],
        [-m[1][0] / det, m[0][0] / det],
    ])
}

fn matmul_2x2(a: [[f32; 2]; 2], b: [[f32; 2]; 2]) -> [[f32; 2]; 2] {
    let mut out = [[0.0; 2]; 2];
    for (r, row) in out.iter_mut().enumerate() {
        for (c, cell) in row.iter_mut().enumerate() {
            *cell = a[r][0] * b[0][c] + a[r][1] * b[1][c];
        }
    }
    out
}

fn mat_at(j: &Array3<f32>, k: usize) -> [[f32; 2]; 2] {
    [[j[[k, 0, 0]], j[[k, 0, 1]]], [j[[k, 1, 0]], j[[k, 1, 1]]]]
}

fn check_len(a: &Keypoints, b: &Keypoints) -> Result<()> {
    if a.len() != b.len() {
        return Err(VisionError::KeypointMismatch {
            left: a.len(),
            right: b.len(),
        }
        .into());
    }
    Ok(())
}

/// Jacobians, when present, carry one 2x2 matrix per keypoint.
fn check_jacobian(kp: &Keypoints) -> Result<()> {
    match &kp.jacobian {
        Some(j) if j.shape() != [kp.len(), 2, 2] => Err(VisionError::KeypointMismatch {
            left: kp.len(),
            right: j.shape()[0],
        }
        .into()),
        _ => Ok(()),
    }
}

/// Re-project driving keypoints onto the source face.
///
/// value = (driving - initial) * scale + source
/// jacobian = (driving_jac * initial_jac^-1) * source_jac
pub fn normalize_kp(
    kp_source: &Keypoints,
    kp_driving: &Keypoints,
    kp_driving_initial: &Keypoints,
    options: &NormalizeOptions,
) -> Result<Keypoints> {
    check_len(kp_source, kp_driving)?;
    check_len(kp_source, kp_driving_initial)?;
    for kp in [kp_source, kp_driving, kp_driving_initial] {
        check_jacobian(kp)?;
    }

    let mut kp_new = kp_driving.clone();
    if !options.use_relative_movement {
        return Ok(kp_new);
    }

    let scale = if options.adapt_movement_scale {
        movement_scale(kp_source, kp_driving_initial)
    } else {
        1.0
    };

    kp_new.value = (&kp_driving.value - &kp_driving_initial.value) * scale + &kp_source.value;

    if options.use_relative_jacobian {
        if let (Some(driving), Some(initial), Some(source)) = (
            &kp_driving.jacobian,
            &kp_driving_initial.jacobian,
            &kp_source.jacobian,
        ) {
            let mut out = Array3::<f32>::zeros((kp_source.len(), 2, 2));
            for k in 0..kp_source.len() {
                let inv = inverse_2x2(mat_at(initial, k)).ok_or(VisionError::SingularJacobian(k))?;
                let m = matmul_2x2(matmul_2x2(mat_at(driving, k), inv), mat_at(source, k));
                let mut slot = out.slice_mut(s![k, .., ..]);
                for r in 0..2 {
                    for c in 0..2 {
                        slot[[r, c]] = m[r][c];
                    }
                }
            }
            kp_new.jacobian = Some(out);
        }
    }

    Ok(kp_new)
}
