//! Organized point cloud: one 3D camera-space point per depth pixel, laid
//! out cell by cell.
//!
//! Cell `k` of `cellSize²` pixels occupies the contiguous point rows
//! `[k·cellSize², (k+1)·cellSize²)`, row-major inside the block. This layout
//! is the contract between depth rectification and the primitive detector.

use nalgebra::Vector3;

use crate::geometry::coordinates::{is_depth_valid, CameraIntrinsics};
use crate::DepthImage;

#[derive(Clone, Debug)]
pub struct OrganizedPointCloud {
    /// Camera-space points, cell-major. Invalid pixels hold (0, 0, 0).
    points: Vec<Vector3<f64>>,
    cell_size: usize,
    cells_x: usize,
    cells_y: usize,
}

impl OrganizedPointCloud {
    /// Project a rectified depth image into a cell-ordered cloud. Pixels
    /// outside the last full cell row/column are dropped; invalid depths
    /// produce the zero point.
    pub fn from_depth(
        depth: &DepthImage,
        intrinsics: &CameraIntrinsics,
        cell_size: usize,
    ) -> Self {
        let cells_x = depth.width() as usize / cell_size;
        let cells_y = depth.height() as usize / cell_size;
        let cell_area = cell_size * cell_size;
        let mut points = vec![Vector3::zeros(); cells_x * cells_y * cell_area];

        for cell_y in 0..cells_y {
            for cell_x in 0..cells_x {
                let cell_index = cell_y * cells_x + cell_x;
                let base = cell_index * cell_area;
                for local_y in 0..cell_size {
                    for local_x in 0..cell_size {
                        let u = (cell_x * cell_size + local_x) as u32;
                        let v = (cell_y * cell_size + local_y) as u32;
                        let z = depth.get_pixel(u, v).0[0] as f64;
                        if is_depth_valid(z) {
                            let x = (u as f64 - intrinsics.center_x) * z / intrinsics.focal_x;
                            let y = (v as f64 - intrinsics.center_y) * z / intrinsics.focal_y;
                            points[base + local_y * cell_size + local_x] =
                                Vector3::new(x, y, z);
                        }
                    }
                }
            }
        }

        Self {
            points,
            cell_size,
            cells_x,
            cells_y,
        }
    }

    /// An empty cloud with the given cell layout (no valid points).
    pub fn empty(cells_x: usize, cells_y: usize, cell_size: usize) -> Self {
        Self {
            points: vec![Vector3::zeros(); cells_x * cells_y * cell_size * cell_size],
            cell_size,
            cells_x,
            cells_y,
        }
    }

    pub fn cell_size(&self) -> usize {
        self.cell_size
    }

    pub fn cells_x(&self) -> usize {
        self.cells_x
    }

    pub fn cells_y(&self) -> usize {
        self.cells_y
    }

    pub fn cell_count(&self) -> usize {
        self.cells_x * self.cells_y
    }

    pub fn points_per_cell(&self) -> usize {
        self.cell_size * self.cell_size
    }

    /// The contiguous point block of one cell.
    pub fn cell_points(&self, cell_index: usize) -> &[Vector3<f64>] {
        let area = self.points_per_cell();
        &self.points[cell_index * area..(cell_index + 1) * area]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn intrinsics() -> CameraIntrinsics {
        CameraIntrinsics {
            focal_x: 500.0,
            focal_y: 500.0,
            center_x: 40.0,
            center_y: 30.0,
        }
    }

    #[test]
    fn layout_is_cell_major() {
        let mut depth = DepthImage::new(80, 60);
        for pixel in depth.pixels_mut() {
            pixel.0[0] = 1000.0;
        }
        let cloud = OrganizedPointCloud::from_depth(&depth, &intrinsics(), 20);

        assert_eq!(cloud.cells_x(), 4);
        assert_eq!(cloud.cells_y(), 3);
        assert_eq!(cloud.cell_points(0).len(), 400);

        // first point of cell 1 is pixel (20, 0)
        let expected_x = (20.0 - 40.0) * 1000.0 / 500.0;
        assert_relative_eq!(cloud.cell_points(1)[0].x, expected_x, epsilon = 1e-9);
        assert_relative_eq!(cloud.cell_points(1)[0].z, 1000.0, epsilon = 1e-9);
    }

    #[test]
    fn invalid_depth_yields_zero_points() {
        let mut depth = DepthImage::new(40, 40);
        for pixel in depth.pixels_mut() {
            pixel.0[0] = 0.0;
        }
        depth.get_pixel_mut(0, 0).0[0] = 7000.0; // beyond range
        depth.get_pixel_mut(1, 0).0[0] = 10.0; // below range

        let cloud = OrganizedPointCloud::from_depth(&depth, &intrinsics(), 20);
        assert!(cloud
            .cell_points(0)
            .iter()
            .all(|point| point.z == 0.0));
    }
}
