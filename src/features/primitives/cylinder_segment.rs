//! Cylinder segment: fallback model for grown regions whose joint plane fit
//! fails the MSE test.
//!
//! The axis comes from an SVD of the stacked cell normals (a cylinder's
//! normals all lie in the plane orthogonal to its axis); circle parameters
//! are then RANSAC-fitted to the cell centroids projected along the axis.
//! Runs of inliers contiguous in cell order become sub-segments, each with
//! its own inlier bitmap and local-to-global index mapping.

use nalgebra::{DMatrix, DVector, Vector2, Vector3};
use rand::rngs::StdRng;
use rand::Rng;

use crate::config::DetectionSection;
use crate::features::primitives::plane_segment::PlaneSegment;

/// Minimum run length of contiguous inliers kept as a sub-segment.
const MINIMUM_SEGMENT_RUN: usize = 3;

/// One fitted circular cross-section over a contiguous cell run.
#[derive(Clone, Debug)]
pub struct CylinderSubSegment {
    /// A point of the axis line, in camera coordinates.
    pub center: Vector3<f64>,
    pub radius: f64,
    /// Mean squared radial residual of the inliers, in mm².
    pub mse: f64,
    /// Inlier flags over the parent's local cell indices.
    inliers: Vec<bool>,
}

#[derive(Clone, Debug)]
pub struct CylinderSegment {
    axis: Vector3<f64>,
    /// Local index -> cell index of the activated set, ascending.
    local_to_global: Vec<usize>,
    segments: Vec<CylinderSubSegment>,
}

impl CylinderSegment {
    /// Fit a cylinder decomposition to the activated cells of the grid.
    pub fn fit(
        plane_grid: &[PlaneSegment],
        activated: &[bool],
        config: &DetectionSection,
        rng: &mut StdRng,
    ) -> Self {
        let mut local_to_global = Vec::new();
        let mut centroids = Vec::new();
        let mut normals = Vec::new();
        for (cell, &is_active) in activated.iter().enumerate() {
            if is_active && plane_grid[cell].is_planar() {
                local_to_global.push(cell);
                centroids.push(plane_grid[cell].mean());
                normals.push(plane_grid[cell].normal());
            }
        }

        let mut segment = Self {
            axis: Vector3::zeros(),
            local_to_global,
            segments: Vec::new(),
        };
        if segment.local_to_global.len() < MINIMUM_SEGMENT_RUN {
            return segment;
        }

        let Some(axis) = fit_axis(&normals) else {
            return segment;
        };
        segment.axis = axis;

        // orthonormal basis of the plane perpendicular to the axis
        let u = orthogonal_unit(&axis);
        let v = axis.cross(&u);
        let projected: Vec<Vector2<f64>> = centroids
            .iter()
            .map(|centroid| Vector2::new(centroid.dot(&u), centroid.dot(&v)))
            .collect();

        // angular gate: a cylinder cell's normal is orthogonal to the axis
        let maximum_axis_alignment =
            (1.0 - config.primitive_maximum_cos_angle.powi(2)).sqrt();
        let angular_ok: Vec<bool> = normals
            .iter()
            .map(|normal| normal.dot(&axis).abs() <= maximum_axis_alignment)
            .collect();

        let residual_threshold = (config.primitive_maximum_merge_distance_mm / 2.0).powi(2);

        let Some(best_inliers) = ransac_circle(
            &projected,
            &angular_ok,
            residual_threshold,
            config.cylinder_ransac_iterations,
            rng,
        ) else {
            return segment;
        };

        // split the inlier set into contiguous local runs; each run gets its
        // own refined circle
        for run in contiguous_runs(&best_inliers) {
            if run.len() < MINIMUM_SEGMENT_RUN {
                continue;
            }
            let run_points: Vec<Vector2<f64>> =
                run.iter().map(|&local| projected[local]).collect();
            let Some((center_2d, radius, mse)) = least_squares_circle(&run_points) else {
                continue;
            };

            let mut inliers = vec![false; segment.local_to_global.len()];
            for &local in &run {
                inliers[local] = true;
            }
            segment.segments.push(CylinderSubSegment {
                center: u * center_2d.x + v * center_2d.y,
                radius,
                mse,
                inliers,
            });
        }

        segment
    }

    pub fn axis(&self) -> Vector3<f64> {
        self.axis
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn segment(&self, index: usize) -> &CylinderSubSegment {
        &self.segments[index]
    }

    pub fn mse_at(&self, index: usize) -> f64 {
        self.segments[index].mse
    }

    pub fn is_inlier_at(&self, segment_index: usize, local_index: usize) -> bool {
        self.segments[segment_index].inliers[local_index]
    }

    pub fn local_size(&self) -> usize {
        self.local_to_global.len()
    }

    pub fn local_to_global(&self, local_index: usize) -> usize {
        self.local_to_global[local_index]
    }
}

/// Axis direction: right singular vector of the smallest singular value of
/// the stacked normals. `None` when the SVD degenerates or the normals do
/// not span a plane.
fn fit_axis(normals: &[Vector3<f64>]) -> Option<Vector3<f64>> {
    let mut stacked = DMatrix::zeros(normals.len(), 3);
    for (row, normal) in normals.iter().enumerate() {
        stacked.set_row(row, &normal.transpose());
    }

    let svd = stacked.svd(false, true);
    let v_t = svd.v_t?;
    let axis = Vector3::new(v_t[(2, 0)], v_t[(2, 1)], v_t[(2, 2)]);
    let norm = axis.norm();
    if norm.is_finite() && norm > f64::EPSILON {
        Some(axis / norm)
    } else {
        None
    }
}

/// Any unit vector orthogonal to `axis`.
fn orthogonal_unit(axis: &Vector3<f64>) -> Vector3<f64> {
    let helper = if axis.x.abs() < 0.9 {
        Vector3::x()
    } else {
        Vector3::y()
    };
    axis.cross(&helper).normalize()
}

/// RANSAC circle search: 3-point circumcenter hypotheses scored by squared
/// radial residual. Returns the local indices of the best inlier set.
fn ransac_circle(
    points: &[Vector2<f64>],
    angular_ok: &[bool],
    residual_threshold: f64,
    iterations: usize,
    rng: &mut StdRng,
) -> Option<Vec<usize>> {
    let count = points.len();
    if count < 3 {
        return None;
    }

    let mut best: Option<(Vec<usize>, f64)> = None;
    for _ in 0..iterations {
        let a = rng.gen_range(0..count);
        let b = rng.gen_range(0..count);
        let c = rng.gen_range(0..count);
        if a == b || b == c || a == c {
            continue;
        }

        let Some((center, radius)) = circumcircle(&points[a], &points[b], &points[c]) else {
            continue;
        };

        let mut inliers = Vec::new();
        let mut error_sum = 0.0;
        for (index, point) in points.iter().enumerate() {
            if !angular_ok[index] {
                continue;
            }
            let residual = ((point - center).norm() - radius).powi(2);
            if residual < residual_threshold {
                inliers.push(index);
                error_sum += residual;
            }
        }
        if inliers.len() < MINIMUM_SEGMENT_RUN {
            continue;
        }

        let mse = error_sum / inliers.len() as f64;
        let better = match &best {
            None => true,
            Some((best_inliers, best_mse)) => {
                inliers.len() > best_inliers.len()
                    || (inliers.len() == best_inliers.len() && mse < *best_mse)
            }
        };
        if better {
            best = Some((inliers, mse));
        }
    }

    best.map(|(inliers, _)| inliers)
}

/// Circumcircle of three points; `None` for near-collinear triples.
fn circumcircle(a: &Vector2<f64>, b: &Vector2<f64>, c: &Vector2<f64>) -> Option<(Vector2<f64>, f64)> {
    let d = 2.0 * (a.x * (b.y - c.y) + b.x * (c.y - a.y) + c.x * (a.y - b.y));
    if d.abs() < 1e-9 {
        return None;
    }

    let a_sq = a.norm_squared();
    let b_sq = b.norm_squared();
    let c_sq = c.norm_squared();
    let center = Vector2::new(
        (a_sq * (b.y - c.y) + b_sq * (c.y - a.y) + c_sq * (a.y - b.y)) / d,
        (a_sq * (c.x - b.x) + b_sq * (a.x - c.x) + c_sq * (b.x - a.x)) / d,
    );
    Some((center, (a - center).norm()))
}

/// Kåsa least-squares circle over a point set, with its radial MSE.
fn least_squares_circle(points: &[Vector2<f64>]) -> Option<(Vector2<f64>, f64, f64)> {
    if points.len() < 3 {
        return None;
    }

    // x² + y² = 2·a·x + 2·b·y + c, linear in (a, b, c)
    let mut design = DMatrix::zeros(points.len(), 3);
    let mut rhs = DVector::zeros(points.len());
    for (row, point) in points.iter().enumerate() {
        design[(row, 0)] = 2.0 * point.x;
        design[(row, 1)] = 2.0 * point.y;
        design[(row, 2)] = 1.0;
        rhs[row] = point.norm_squared();
    }

    let svd = design.svd(true, true);
    let solution = svd.solve(&rhs, 1e-12).ok()?;
    let center = Vector2::new(solution[0], solution[1]);
    let radius_sq = solution[2] + center.norm_squared();
    if radius_sq <= 0.0 || !radius_sq.is_finite() {
        return None;
    }
    let radius = radius_sq.sqrt();

    let mse = points
        .iter()
        .map(|point| ((point - center).norm() - radius).powi(2))
        .sum::<f64>()
        / points.len() as f64;
    Some((center, radius, mse))
}

/// Split ascending indices into runs of consecutive values.
fn contiguous_runs(indices: &[usize]) -> Vec<Vec<usize>> {
    let mut runs: Vec<Vec<usize>> = Vec::new();
    for &index in indices {
        match runs.last_mut() {
            Some(run) if *run.last().unwrap() + 1 == index => run.push(index),
            _ => runs.push(vec![index]),
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;

    #[test]
    fn circumcircle_of_known_triangle() {
        let (center, radius) = circumcircle(
            &Vector2::new(1.0, 0.0),
            &Vector2::new(-1.0, 0.0),
            &Vector2::new(0.0, 1.0),
        )
        .unwrap();
        assert_relative_eq!(center.norm(), 0.0, epsilon = 1e-9);
        assert_relative_eq!(radius, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn collinear_points_have_no_circumcircle() {
        assert!(circumcircle(
            &Vector2::new(0.0, 0.0),
            &Vector2::new(1.0, 0.0),
            &Vector2::new(2.0, 0.0),
        )
        .is_none());
    }

    #[test]
    fn least_squares_circle_recovers_parameters() {
        let points: Vec<Vector2<f64>> = (0..12)
            .map(|step| {
                let angle = step as f64 * std::f64::consts::PI / 6.0;
                Vector2::new(3.0 + 50.0 * angle.cos(), -2.0 + 50.0 * angle.sin())
            })
            .collect();

        let (center, radius, mse) = least_squares_circle(&points).unwrap();
        assert_relative_eq!(center.x, 3.0, epsilon = 1e-6);
        assert_relative_eq!(center.y, -2.0, epsilon = 1e-6);
        assert_relative_eq!(radius, 50.0, epsilon = 1e-6);
        assert!(mse < 1e-9);
    }

    #[test]
    fn contiguous_runs_split_on_gaps() {
        let runs = contiguous_runs(&[0, 1, 2, 5, 6, 9]);
        assert_eq!(runs, vec![vec![0, 1, 2], vec![5, 6], vec![9]]);
    }

    #[test]
    fn axis_of_cylindrical_normals() {
        // normals of a cylinder along z: all in the xy plane
        let normals: Vec<Vector3<f64>> = (0..10)
            .map(|step| {
                let angle = step as f64 * 0.3;
                Vector3::new(angle.cos(), angle.sin(), 0.0)
            })
            .collect();

        let axis = fit_axis(&normals).unwrap();
        assert_relative_eq!(axis.z.abs(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn fits_synthetic_cylinder_cells() {
        // build a grid of plane segments sampling a cylinder of radius
        // 300 mm along the y axis, centered 2 m ahead
        let radius = 300.0;
        let center = Vector3::new(0.0, 0.0, 2000.0);
        let mut grid = Vec::new();
        let mut activated = Vec::new();
        for step in 0..12 {
            let angle = -0.9 + step as f64 * 0.15;
            let normal = Vector3::new(angle.sin(), 0.0, -angle.cos());
            let surface = center + Vector3::new(-normal.x, 0.0, -normal.z) * radius;
            let tangent = Vector3::new(normal.z, 0.0, normal.x);

            // a small planar patch tangent to the cylinder surface
            let points: Vec<Vector3<f64>> = [(0.0, 0.0), (5.0, 8.0), (-4.0, 6.0), (3.0, -7.0)]
                .iter()
                .map(|&(dx, dy)| surface + tangent * dx + Vector3::new(0.0, dy, 0.0))
                .collect();
            grid.push(PlaneSegment::from_points(&points));
            activated.push(true);
        }

        let mut rng = StdRng::seed_from_u64(7);
        let cylinder =
            CylinderSegment::fit(&grid, &activated, &DetectionSection::default(), &mut rng);

        assert!(cylinder.segment_count() >= 1);
        assert_relative_eq!(cylinder.axis().y.abs(), 1.0, epsilon = 0.1);
        let fitted = cylinder.segment(0);
        assert!((fitted.radius - radius).abs() < 60.0);
    }
}
