//! Plane segment: online accumulation of first and second point moments
//! with an eigen-decomposition plane fit.
//!
//! Expansion is purely additive on the moments, which makes merging two
//! segments O(1); the fit is recomputed on demand.

use nalgebra::{Matrix3, Vector3};

use crate::config::DetectionSection;
use crate::features::depth_map::OrganizedPointCloud;

/// Additive slack of the planarity bound, in millimeters.
const PLANARITY_MARGIN_MM: f64 = 0.5;

#[derive(Clone, Debug)]
pub struct PlaneSegment {
    point_count: usize,
    sum: Vector3<f64>,
    /// Sum of outer products, the six independent second moments.
    sum_outer: Matrix3<f64>,

    mean: Vector3<f64>,
    normal: Vector3<f64>,
    plane_d: f64,
    mse: f64,
    is_planar: bool,
}

impl Default for PlaneSegment {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaneSegment {
    pub fn new() -> Self {
        Self {
            point_count: 0,
            sum: Vector3::zeros(),
            sum_outer: Matrix3::zeros(),
            mean: Vector3::zeros(),
            normal: Vector3::zeros(),
            plane_d: 0.0,
            mse: f64::INFINITY,
            is_planar: false,
        }
    }

    /// Load the points of one cell, fit, and test planarity.
    ///
    /// A cell is rejected outright when too many of its pixels carry no
    /// valid depth or when a depth discontinuity crosses its middle row or
    /// column (a jump edge cuts two surfaces apart).
    pub fn init_from_cell(
        &mut self,
        cloud: &OrganizedPointCloud,
        cell_index: usize,
        config: &DetectionSection,
    ) {
        *self = Self::new();

        let points = cloud.cell_points(cell_index);
        let cell_size = cloud.cell_size();

        let valid_count = points.iter().filter(|point| point.z > 0.0).count();
        let minimum_valid =
            ((1.0 - config.maximum_invalid_depth_ratio) * points.len() as f64) as usize;
        if valid_count < minimum_valid.max(3) {
            return;
        }

        if Self::has_depth_discontinuity(points, cell_size, config) {
            return;
        }

        for point in points.iter().filter(|point| point.z > 0.0) {
            self.accumulate(point);
        }
        self.fit_plane();

        // depth-adaptive planarity bound from the sensor noise model
        let mean_depth = self.mean.z;
        let depth_sigma =
            config.depth_sigma_error * mean_depth * mean_depth * config.depth_sigma_margin;
        let mse_bound = (depth_sigma + PLANARITY_MARGIN_MM).powi(2);

        self.is_planar = self.mse < mse_bound;
    }

    /// Scan the middle row and middle column for depth jumps between valid
    /// neighbors.
    fn has_depth_discontinuity(
        points: &[Vector3<f64>],
        cell_size: usize,
        config: &DetectionSection,
    ) -> bool {
        let middle = cell_size / 2;

        let jump = |previous: f64, current: f64| {
            (current - previous).abs()
                > config.depth_alpha * previous + config.depth_discontinuity_limit
        };

        let mut last_row_depth: Option<f64> = None;
        let mut last_col_depth: Option<f64> = None;
        for index in 0..cell_size {
            let row_depth = points[middle * cell_size + index].z;
            if row_depth > 0.0 {
                if let Some(previous) = last_row_depth {
                    if jump(previous, row_depth) {
                        return true;
                    }
                }
                last_row_depth = Some(row_depth);
            }

            let col_depth = points[index * cell_size + middle].z;
            if col_depth > 0.0 {
                if let Some(previous) = last_col_depth {
                    if jump(previous, col_depth) {
                        return true;
                    }
                }
                last_col_depth = Some(col_depth);
            }
        }
        false
    }

    fn accumulate(&mut self, point: &Vector3<f64>) {
        self.point_count += 1;
        self.sum += point;
        self.sum_outer += point * point.transpose();
    }

    /// Fit a segment directly from a point set (no cell gating).
    pub fn from_points(points: &[Vector3<f64>]) -> Self {
        let mut segment = Self::new();
        for point in points {
            segment.accumulate(point);
        }
        segment.fit_plane();
        segment
    }

    /// Refit the plane from the accumulated moments.
    ///
    /// Normal = eigenvector of the smallest eigenvalue of the scatter
    /// covariance, flipped so it points toward the camera origin; `d` is
    /// chosen non-negative; MSE is that smallest eigenvalue. A degenerate
    /// decomposition marks the segment non-planar.
    pub fn fit_plane(&mut self) {
        if self.point_count < 3 {
            self.is_planar = false;
            return;
        }

        let count = self.point_count as f64;
        self.mean = self.sum / count;
        let covariance = self.sum_outer / count - self.mean * self.mean.transpose();

        let eigen = covariance.symmetric_eigen();
        let mut min_index = 0;
        for index in 1..3 {
            if eigen.eigenvalues[index] < eigen.eigenvalues[min_index] {
                min_index = index;
            }
        }

        let mut normal: Vector3<f64> = eigen.eigenvectors.column(min_index).into_owned();
        let norm = normal.norm();
        if !norm.is_finite() || norm < f64::EPSILON || !eigen.eigenvalues[min_index].is_finite() {
            self.is_planar = false;
            return;
        }
        normal /= norm;

        // normal points from the plane toward the origin, so d >= 0
        if normal.dot(&self.mean) > 0.0 {
            normal = -normal;
        }

        self.normal = normal;
        self.plane_d = -normal.dot(&self.mean);
        self.mse = eigen.eigenvalues[min_index].max(0.0);
        self.is_planar = true;
    }

    /// Additive moment merge. The fit is stale afterwards; the segment
    /// reports non-planar until the next `fit_plane`.
    pub fn expand_segment(&mut self, other: &PlaneSegment) {
        self.point_count += other.point_count;
        self.sum += other.sum;
        self.sum_outer += other.sum_outer;
        self.is_planar = false;
    }

    /// Plane evidence: supporting points per unit of fit error.
    pub fn score(&self) -> f64 {
        if self.mse > 0.0 {
            self.point_count as f64 / self.mse
        } else if self.point_count > 0 {
            f64::INFINITY
        } else {
            0.0
        }
    }

    pub fn is_planar(&self) -> bool {
        self.is_planar
    }

    pub fn point_count(&self) -> usize {
        self.point_count
    }

    pub fn normal(&self) -> Vector3<f64> {
        self.normal
    }

    pub fn mean(&self) -> Vector3<f64> {
        self.mean
    }

    pub fn plane_d(&self) -> f64 {
        self.plane_d
    }

    pub fn mse(&self) -> f64 {
        self.mse
    }
}
