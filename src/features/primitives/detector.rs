//! Histogram-guided region-growing segmentation of the organized cloud into
//! planes and cylinders.
//!
//! Per frame: fit a plane to every cell, bin the planar cells by normal
//! orientation, grow regions from the densest-bin seed with the smallest
//! fit error, fall back to cylinder fitting for curved regions, merge
//! adjacent coplanar regions, and refine the final masks morphologically.
//! All grid buffers are preallocated and reused across frames.

use std::collections::VecDeque;

use image::GrayImage;
use imageproc::distance_transform::Norm;
use imageproc::morphology::{dilate, erode};
use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::error;

use crate::config::DetectionSection;
use crate::features::depth_map::OrganizedPointCloud;
use crate::features::primitives::cylinder_segment::CylinderSegment;
use crate::features::primitives::histogram::OrientationHistogram;
use crate::features::primitives::plane_segment::PlaneSegment;
use crate::geometry::coordinates::{normal_spherical_angles, PlaneCameraCoordinates};

/// A detected planar patch, in camera coordinates.
#[derive(Clone, Debug)]
pub struct DetectedPlane {
    pub plane: PlaneCameraCoordinates,
    pub centroid: Vector3<f64>,
    pub mse: f64,
    pub score: f64,
    /// Cell-resolution membership mask (255 = member).
    pub cell_mask: GrayImage,
}

/// A detected cylindrical patch, in camera coordinates.
#[derive(Clone, Debug)]
pub struct DetectedCylinder {
    pub axis: Vector3<f64>,
    pub center: Vector3<f64>,
    pub radius: f64,
    pub mse: f64,
    pub cell_mask: GrayImage,
}

#[derive(Clone, Debug, Default)]
pub struct DetectedPrimitives {
    pub planes: Vec<DetectedPlane>,
    pub cylinders: Vec<DetectedCylinder>,
}

pub struct PrimitiveDetector {
    cells_x: usize,
    cells_y: usize,
    total_cells: usize,
    config: DetectionSection,
    rng: StdRng,

    // per-frame buffers, reused
    plane_grid: Vec<PlaneSegment>,
    unassigned_mask: Vec<bool>,
    cell_distance_tols: Vec<f64>,
    histogram: OrientationHistogram,
    grid_plane_segment_map: Vec<u32>,
    grid_cylinder_segment_map: Vec<u32>,
    plane_segments: Vec<PlaneSegment>,
    cylinder_segments: Vec<CylinderSegment>,
}

impl PrimitiveDetector {
    pub fn new(width: usize, height: usize, config: DetectionSection, seed: u64) -> Self {
        let cell_size = config.depth_map_patch_size_px;
        let cells_x = width / cell_size;
        let cells_y = height / cell_size;
        let total_cells = cells_x * cells_y;

        Self {
            cells_x,
            cells_y,
            total_cells,
            histogram: OrientationHistogram::new(config.histogram_bins_per_coordinate),
            config,
            rng: StdRng::seed_from_u64(seed),
            plane_grid: vec![PlaneSegment::new(); total_cells],
            unassigned_mask: vec![false; total_cells],
            cell_distance_tols: vec![0.0; total_cells],
            grid_plane_segment_map: vec![0; total_cells],
            grid_cylinder_segment_map: vec![0; total_cells],
            plane_segments: Vec::new(),
            cylinder_segments: Vec::new(),
        }
    }

    /// Segment one frame's organized cloud.
    pub fn find_primitives(&mut self, cloud: &OrganizedPointCloud) -> DetectedPrimitives {
        if cloud.cells_x() != self.cells_x || cloud.cells_y() != self.cells_y {
            error!(
                cloud_cells_x = cloud.cells_x(),
                cloud_cells_y = cloud.cells_y(),
                "organized cloud layout does not match the detector grid"
            );
            return DetectedPrimitives::default();
        }

        self.reset_data();
        self.init_planar_cell_fitting(cloud);
        let remaining_planar_cells = self.init_histogram();
        let cylinder_to_region = self.grow_planes_and_cylinders(remaining_planar_cells);
        let plane_merge_labels = self.merge_planes();

        DetectedPrimitives {
            planes: self.collect_planes(&plane_merge_labels),
            cylinders: self.collect_cylinders(&cylinder_to_region),
        }
    }

    fn reset_data(&mut self) {
        self.histogram.reset();
        self.plane_segments.clear();
        self.cylinder_segments.clear();
        self.grid_plane_segment_map.fill(0);
        self.grid_cylinder_segment_map.fill(0);
        self.unassigned_mask.fill(false);
        self.cell_distance_tols.fill(0.0);
    }

    /// Phase 1: per-cell plane fit and merge tolerance.
    fn init_planar_cell_fitting(&mut self, cloud: &OrganizedPointCloud) {
        let sin_angle_for_merge =
            (1.0 - self.config.primitive_maximum_cos_angle.powi(2)).sqrt();

        for cell in 0..self.total_cells {
            self.plane_grid[cell].init_from_cell(cloud, cell, &self.config);

            if self.plane_grid[cell].is_planar() {
                let diameter = cell_diameter(cloud, cell);
                let tolerance = (diameter * sin_angle_for_merge)
                    .clamp(20.0, self.config.primitive_maximum_merge_distance_mm);
                self.cell_distance_tols[cell] = tolerance * tolerance;
            }
        }
    }

    /// Phase 2: insert the planar cells into the orientation histogram.
    fn init_histogram(&mut self) -> usize {
        let mut remaining = 0;
        let mut angles = vec![(0.0, 0.0); self.total_cells];
        for cell in 0..self.total_cells {
            if self.plane_grid[cell].is_planar() {
                angles[cell] = normal_spherical_angles(&self.plane_grid[cell].normal());
                self.unassigned_mask[cell] = true;
                remaining += 1;
            }
        }
        self.histogram.init(&angles, &self.unassigned_mask);
        remaining
    }

    /// Phases 3-5: seed selection, region growing, plane/cylinder
    /// classification. Returns the (cylinder, sub-segment) pairs accepted as
    /// cylinders, in the order their ids were written to the cylinder map.
    fn grow_planes_and_cylinders(&mut self, remaining_planar_cells: usize) -> Vec<(usize, usize)> {
        let mut cylinder_to_region = Vec::new();
        let mut untried = remaining_planar_cells;

        while untried > 0 {
            let seed_candidates = self.histogram.most_frequent_bin();
            if seed_candidates.len() < self.config.minimum_plane_seed_count {
                break;
            }

            // candidate with the smallest fit error; ties keep the lowest
            // cell index because candidates arrive in ascending order
            let mut seed = None;
            let mut minimum_mse = f64::MAX;
            for &candidate in &seed_candidates {
                let mse = self.plane_grid[candidate].mse();
                if self.plane_grid[candidate].is_planar() && mse < minimum_mse {
                    seed = Some(candidate);
                    minimum_mse = mse;
                    if mse <= 0.0 {
                        break;
                    }
                }
            }
            let Some(seed) = seed else {
                error!("could not find a planar seed in the densest bin");
                break;
            };

            untried = self.grow_segment_at_seed(seed, untried, &mut cylinder_to_region);
        }

        cylinder_to_region
    }

    fn grow_segment_at_seed(
        &mut self,
        seed: usize,
        mut untried: usize,
        cylinder_to_region: &mut Vec<(usize, usize)>,
    ) -> usize {
        let seed_normal = self.plane_grid[seed].normal();
        let seed_d = self.plane_grid[seed].plane_d();

        let mut activated = vec![false; self.total_cells];
        self.region_growing(seed, &seed_normal, seed_d, &mut activated);

        // consume the activated cells
        let mut merged = PlaneSegment::new();
        let mut activated_count = 0;
        for cell in 0..self.total_cells {
            if activated[cell] && self.plane_grid[cell].is_planar() {
                let segment = self.plane_grid[cell].clone();
                merged.expand_segment(&segment);
                self.histogram.remove(cell);
                self.unassigned_mask[cell] = false;
                untried = untried.saturating_sub(1);
                activated_count += 1;
            }
        }

        if activated_count < self.config.minimum_cell_activated {
            self.histogram.remove(seed);
            return untried;
        }

        merged.fit_plane();
        if merged.score() > self.config.plane_score_threshold {
            self.plane_segments.push(merged);
            let plane_id = self.plane_segments.len() as u32;
            for cell in 0..self.total_cells {
                if activated[cell] {
                    self.grid_plane_segment_map[cell] = plane_id;
                }
            }
        } else if activated_count > self.config.cylinder_minimum_cell_count {
            self.cylinder_fitting(&activated, cylinder_to_region);
        }

        untried
    }

    /// Cylinder fallback with per-sub-segment model selection: the plane
    /// refit of a sub-segment's inliers wins when its MSE is smaller.
    fn cylinder_fitting(
        &mut self,
        activated: &[bool],
        cylinder_to_region: &mut Vec<(usize, usize)>,
    ) {
        let cylinder =
            CylinderSegment::fit(&self.plane_grid, activated, &self.config, &mut self.rng);
        self.cylinder_segments.push(cylinder);
        let cylinder_index = self.cylinder_segments.len() - 1;

        for segment_index in 0..self.cylinder_segments[cylinder_index].segment_count() {
            let mut refit = PlaneSegment::new();
            let mut fitable = false;
            let local_size = self.cylinder_segments[cylinder_index].local_size();
            for local in 0..local_size {
                if self.cylinder_segments[cylinder_index].is_inlier_at(segment_index, local) {
                    let cell = self.cylinder_segments[cylinder_index].local_to_global(local);
                    if self.plane_grid[cell].is_planar() {
                        let segment = self.plane_grid[cell].clone();
                        refit.expand_segment(&segment);
                        fitable = true;
                    }
                }
            }
            if !fitable {
                continue;
            }

            refit.fit_plane();
            let cylinder = &self.cylinder_segments[cylinder_index];
            if refit.is_planar() && refit.mse() < cylinder.mse_at(segment_index) {
                // the plane explains these cells better than the cylinder
                self.plane_segments.push(refit);
                let plane_id = self.plane_segments.len() as u32;
                for local in 0..local_size {
                    if cylinder.is_inlier_at(segment_index, local) {
                        let cell = cylinder.local_to_global(local);
                        self.grid_plane_segment_map[cell] = plane_id;
                    }
                }
            } else {
                cylinder_to_region.push((cylinder_index, segment_index));
                let cylinder_id = cylinder_to_region.len() as u32;
                for local in 0..local_size {
                    if cylinder.is_inlier_at(segment_index, local) {
                        let cell = cylinder.local_to_global(local);
                        self.grid_cylinder_segment_map[cell] = cylinder_id;
                    }
                }
            }
        }
    }

    /// Iterative 4-neighbor flood from the seed.
    ///
    /// A neighbor joins iff it is planar, unassigned, its normal agrees with
    /// the seed's, and its centroid lies within the cell's merge tolerance
    /// of the seed plane. Comparing against the seed plane (not the
    /// wavefront) makes the activation set independent of visit order.
    fn region_growing(
        &self,
        seed: usize,
        seed_normal: &Vector3<f64>,
        seed_d: f64,
        activated: &mut [bool],
    ) {
        debug_assert_eq!(activated.len(), self.total_cells);

        let mut queue = VecDeque::new();
        queue.push_back(seed);

        while let Some(cell) = queue.pop_front() {
            if activated[cell] || !self.unassigned_mask[cell] {
                continue;
            }
            let segment = &self.plane_grid[cell];
            if !segment.is_planar() {
                continue;
            }
            if seed_normal.dot(&segment.normal()) <= self.config.primitive_maximum_cos_angle {
                continue;
            }
            let plane_distance = seed_normal.dot(&segment.mean()) + seed_d;
            if plane_distance * plane_distance >= self.cell_distance_tols[cell] {
                continue;
            }

            activated[cell] = true;

            let x = cell % self.cells_x;
            let y = cell / self.cells_x;
            if x > 0 {
                queue.push_back(cell - 1);
            }
            if x + 1 < self.cells_x {
                queue.push_back(cell + 1);
            }
            if y > 0 {
                queue.push_back(cell - self.cells_x);
            }
            if y + 1 < self.cells_y {
                queue.push_back(cell + self.cells_x);
            }
        }
    }

    /// Phase 6: merge adjacent coplanar segments under union-find labels.
    fn merge_planes(&mut self) -> Vec<usize> {
        let count = self.plane_segments.len();
        let mut connected = self.connected_components_matrix(count);
        let mut labels: Vec<usize> = (0..count).collect();

        let maximum_distance_sq = self.config.primitive_maximum_merge_distance_mm.powi(2);
        for row in 0..count {
            let root = labels[row];
            if !self.plane_segments[root].is_planar() {
                continue;
            }
            let root_normal = self.plane_segments[root].normal();
            let root_d = self.plane_segments[root].plane_d();

            let mut was_expanded = false;
            for col in (row + 1)..count {
                if !connected[row * count + col] {
                    continue;
                }
                let candidate = &self.plane_segments[col];
                if !candidate.is_planar() {
                    continue;
                }

                let cos_angle = root_normal.dot(&candidate.normal());
                let distance_sq = (root_normal.dot(&candidate.mean()) + root_d).powi(2);
                if cos_angle > self.config.primitive_maximum_cos_angle
                    && distance_sq < maximum_distance_sq
                {
                    let candidate = candidate.clone();
                    self.plane_segments[root].expand_segment(&candidate);
                    labels[col] = root;
                    was_expanded = true;
                } else {
                    connected[row * count + col] = false;
                    connected[col * count + row] = false;
                }
            }
            if was_expanded {
                self.plane_segments[root].fit_plane();
            }
        }

        labels
    }

    /// Adjacency of plane segments: two segments connect when their cells
    /// touch in the segment map (right or below neighbor).
    fn connected_components_matrix(&self, count: usize) -> Vec<bool> {
        let mut connected = vec![false; count * count];
        if count == 0 {
            return connected;
        }

        for y in 0..self.cells_y {
            for x in 0..self.cells_x {
                let id = self.grid_plane_segment_map[y * self.cells_x + x] as usize;
                if id == 0 {
                    continue;
                }
                if x + 1 < self.cells_x {
                    let right = self.grid_plane_segment_map[y * self.cells_x + x + 1] as usize;
                    if right > 0 && right != id {
                        connected[(id - 1) * count + (right - 1)] = true;
                        connected[(right - 1) * count + (id - 1)] = true;
                    }
                }
                if y + 1 < self.cells_y {
                    let below = self.grid_plane_segment_map[(y + 1) * self.cells_x + x] as usize;
                    if below > 0 && below != id {
                        connected[(id - 1) * count + (below - 1)] = true;
                        connected[(below - 1) * count + (id - 1)] = true;
                    }
                }
            }
        }
        connected
    }

    /// Phase 7 for planes: rasterize each merged group, close + erode, and
    /// keep the groups that survive erosion.
    fn collect_planes(&self, labels: &[usize]) -> Vec<DetectedPlane> {
        let mut planes = Vec::new();
        for index in 0..self.plane_segments.len() {
            if labels[index] != index || !self.plane_segments[index].is_planar() {
                continue;
            }

            let mut mask = GrayImage::new(self.cells_x as u32, self.cells_y as u32);
            for cell in 0..self.total_cells {
                let id = self.grid_plane_segment_map[cell] as usize;
                if id > 0 && labels[id - 1] == index {
                    mask.put_pixel(
                        (cell % self.cells_x) as u32,
                        (cell / self.cells_x) as u32,
                        image::Luma([255]),
                    );
                }
            }

            let Some(closed) = refine_mask(&mask) else {
                continue;
            };

            let segment = &self.plane_segments[index];
            planes.push(DetectedPlane {
                plane: PlaneCameraCoordinates::new(segment.normal(), segment.plane_d()),
                centroid: segment.mean(),
                mse: segment.mse(),
                score: segment.score(),
                cell_mask: closed,
            });
        }
        planes
    }

    fn collect_cylinders(&self, cylinder_to_region: &[(usize, usize)]) -> Vec<DetectedCylinder> {
        let mut cylinders = Vec::new();
        for (map_index, &(cylinder_index, segment_index)) in cylinder_to_region.iter().enumerate() {
            let id = (map_index + 1) as u32;
            let mut mask = GrayImage::new(self.cells_x as u32, self.cells_y as u32);
            for cell in 0..self.total_cells {
                if self.grid_cylinder_segment_map[cell] == id {
                    mask.put_pixel(
                        (cell % self.cells_x) as u32,
                        (cell / self.cells_x) as u32,
                        image::Luma([255]),
                    );
                }
            }

            let Some(closed) = refine_mask(&mask) else {
                continue;
            };

            let cylinder = &self.cylinder_segments[cylinder_index];
            let segment = cylinder.segment(segment_index);
            cylinders.push(DetectedCylinder {
                axis: cylinder.axis(),
                center: segment.center,
                radius: segment.radius,
                mse: segment.mse,
                cell_mask: closed,
            });
        }
        cylinders
    }
}

/// Morphological closing with a 3x3 cross kernel, then one erosion as the
/// relevance test: a mask that erodes to nothing is rejected.
fn refine_mask(mask: &GrayImage) -> Option<GrayImage> {
    let closed = erode(&dilate(mask, Norm::L1, 1), Norm::L1, 1);
    let eroded = erode(&closed, Norm::L1, 1);
    if eroded.pixels().all(|pixel| pixel.0[0] == 0) {
        None
    } else {
        Some(closed)
    }
}

/// Spatial extent of a cell: distance between its first and last valid
/// points.
fn cell_diameter(cloud: &OrganizedPointCloud, cell: usize) -> f64 {
    let points = cloud.cell_points(cell);
    let first = points.iter().find(|point| point.z > 0.0);
    let last = points.iter().rev().find(|point| point.z > 0.0);
    match (first, last) {
        (Some(first), Some(last)) => (last - first).norm(),
        _ => 0.0,
    }
}
