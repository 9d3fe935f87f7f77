//! Engine configuration.
//!
//! All recognized options, grouped in sections and loadable from a YAML file.
//! Every field has a default so a partial file (or none at all) yields a
//! usable configuration; `Parameters::validate` is the single fatal gate at
//! engine construction.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SlamError;
use crate::geometry::coordinates::CameraIntrinsics;

/// Camera intrinsics/extrinsics and the starting pose.
///
/// Distances in millimeters, angles in radians. Camera 2 is the depth sensor;
/// its pose is expressed relative to camera 1 (the RGB sensor).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSection {
    pub camera1_focal_x: f64,
    pub camera1_focal_y: f64,
    pub camera1_center_x: f64,
    pub camera1_center_y: f64,

    pub camera2_focal_x: f64,
    pub camera2_focal_y: f64,
    pub camera2_center_x: f64,
    pub camera2_center_y: f64,

    pub camera2_translation_x: f64,
    pub camera2_translation_y: f64,
    pub camera2_translation_z: f64,
    pub camera2_rotation_x: f64,
    pub camera2_rotation_y: f64,
    pub camera2_rotation_z: f64,

    pub starting_position_x: f64,
    pub starting_position_y: f64,
    pub starting_position_z: f64,
    pub starting_rotation_x: f64,
    pub starting_rotation_y: f64,
    pub starting_rotation_z: f64,
}

impl Default for CameraSection {
    fn default() -> Self {
        Self {
            camera1_focal_x: 548.867_237_336_962_15,
            camera1_focal_y: 549.584_025_322_371_87,
            camera1_center_x: 316.496_558_358_854_83,
            camera1_center_y: 229.238_734_846_821_5,

            camera2_focal_x: 575.926_854_488_044_68,
            camera2_focal_y: 576.407_916_010_932_47,
            camera2_center_x: 315.150_263_563_881_71,
            camera2_center_y: 230.585_806_621_017_53,

            camera2_translation_x: 11.497_548_441_022_023,
            camera2_translation_y: 35.139_088_879_273_231,
            camera2_translation_z: 21.887_459_420_807_019,
            camera2_rotation_x: 0.0,
            camera2_rotation_y: 0.0,
            camera2_rotation_z: 0.0,

            starting_position_x: 0.0,
            starting_position_y: 0.0,
            starting_position_z: 0.0,
            starting_rotation_x: 0.0,
            starting_rotation_y: 0.0,
            starting_rotation_z: 0.0,
        }
    }
}

/// Keypoint matching.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingSection {
    /// Spatial search radius around a projected map point, in pixels.
    pub match_search_radius_px: f64,
    /// Side of the keypoint spatial-index cells, in pixels.
    pub match_search_cell_size_px: f64,
    /// Maximum normalized descriptor distance for a valid match, in [0, 1].
    pub max_match_distance: f64,
    /// Full keypoint re-detection happens every N frames.
    pub keypoint_refresh_frequency: usize,
}

impl Default for MatchingSection {
    fn default() -> Self {
        Self {
            match_search_radius_px: 30.0,
            match_search_cell_size_px: 50.0,
            max_match_distance: 0.7,
            keypoint_refresh_frequency: 5,
        }
    }
}

/// Primitive and feature detection.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSection {
    /// Side of a depth-cloud cell, in pixels.
    pub depth_map_patch_size_px: usize,
    /// Minimum cosine of the angle between two mergeable plane normals.
    pub primitive_maximum_cos_angle: f64,
    /// Maximum point-to-plane distance for cell merging, in millimeters.
    pub primitive_maximum_merge_distance_mm: f64,
    /// Minimum candidate count in the densest histogram bin to keep seeding.
    pub minimum_plane_seed_count: usize,
    /// Minimum merged cell count for a region to be kept.
    pub minimum_cell_activated: usize,
    /// Plane score (count / MSE) above which a grown region is a plane.
    pub plane_score_threshold: f64,
    /// Activated-cell count above which cylinder fitting is attempted.
    pub cylinder_minimum_cell_count: usize,
    /// Quadratic depth noise model coefficient of the sensor.
    pub depth_sigma_error: f64,
    /// Multiplier applied to the modeled depth noise in the planarity test.
    pub depth_sigma_margin: f64,
    /// Constant term of the jump-edge criterion, in millimeters.
    pub depth_discontinuity_limit: f64,
    /// Depth-proportional term of the jump-edge criterion.
    pub depth_alpha: f64,
    /// Maximum fraction of invalid-depth pixels tolerated in a planar cell.
    pub maximum_invalid_depth_ratio: f64,
    /// Orientation histogram resolution per angular coordinate.
    pub histogram_bins_per_coordinate: usize,
    /// RANSAC iterations of the cylinder circle fit.
    pub cylinder_ransac_iterations: usize,
    /// Prior inverse depth of a freshly observed 2D feature, in 1/mm.
    pub inverse_depth_baseline: f64,
    /// Prior bearing angle uncertainty of a 2D feature, in degrees.
    pub inverse_depth_angle_baseline: f64,
}

impl Default for DetectionSection {
    fn default() -> Self {
        Self {
            depth_map_patch_size_px: 20,
            primitive_maximum_cos_angle: (std::f64::consts::PI / 10.0).cos(),
            primitive_maximum_merge_distance_mm: 100.0,
            minimum_plane_seed_count: 6,
            minimum_cell_activated: 5,
            plane_score_threshold: 100.0,
            cylinder_minimum_cell_count: 5,
            depth_sigma_error: 1.425e-6,
            depth_sigma_margin: 12.0,
            depth_discontinuity_limit: 10.0,
            depth_alpha: 0.06,
            maximum_invalid_depth_ratio: 0.3,
            histogram_bins_per_coordinate: 20,
            cylinder_ransac_iterations: 25,
            inverse_depth_baseline: 0.5e-3,
            inverse_depth_angle_baseline: 1.0,
        }
    }
}

/// Local map feature lifecycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingSection {
    /// Consecutive failed trackings after which a local feature is dropped.
    pub point_unmatched_count_to_loose: u32,
    /// Match count at which a local point reaches full confidence.
    pub point_age_confidence: u32,
    /// Match count at which a staged point reaches full confidence.
    pub point_staged_age_confidence: u32,
    /// Staged confidence above which a feature is promoted to the local map.
    pub point_minimum_confidence_for_map: f64,
    /// Linearity score below which an inverse-depth point upgrades to 3D.
    pub linearity_threshold: f64,
}

impl Default for MappingSection {
    fn default() -> Self {
        Self {
            point_unmatched_count_to_loose: 10,
            point_age_confidence: 15,
            point_staged_age_confidence: 10,
            point_minimum_confidence_for_map: 0.9,
            linearity_threshold: 0.1,
        }
    }
}

/// RANSAC pose search.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RansacSection {
    /// Inlier threshold for 3D points, in pixels of retroprojection error.
    pub maximum_retroprojection_error_for_point_inliers_px: f64,
    /// Inlier threshold for planes, in millimeters.
    pub maximum_retroprojection_error_for_plane_inliers_mm: f64,
    /// Inlier threshold for inverse-depth points, in pixels.
    pub maximum_retroprojection_error_for_point_2d_inliers_px: f64,
    /// Desired probability of drawing at least one outlier-free subset.
    pub probability_of_success: f64,
    /// Assumed inlier fraction of the match set.
    pub inlier_proportion: f64,
    /// Inlier score fraction that stops the search early.
    pub minimum_inliers_proportion_for_early_stop: f64,
    /// Monte-Carlo iterations of the pose covariance estimation.
    pub covariance_iterations: usize,
}

impl Default for RansacSection {
    fn default() -> Self {
        Self {
            maximum_retroprojection_error_for_point_inliers_px: 10.0,
            maximum_retroprojection_error_for_plane_inliers_mm: 50.0,
            maximum_retroprojection_error_for_point_2d_inliers_px: 15.0,
            probability_of_success: 0.9,
            inlier_proportion: 0.6,
            minimum_inliers_proportion_for_early_stop: 0.9,
            covariance_iterations: 100,
        }
    }
}

/// Levenberg-Marquardt stopping criteria and robust loss.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationSection {
    pub maximum_iterations: usize,
    /// Central-difference epsilon of the numerical Jacobian; 0 selects the
    /// machine-precision default.
    pub error_precision: f64,
    pub tolerance_of_solution_vector_norm: f64,
    pub tolerance_of_vector_function: f64,
    pub tolerance_of_error_function_gradient: f64,
    pub diagonal_step_bound_shift: f64,
    /// Barron loss steepness; 2 is L2, 0 is Cauchy, below -100 is Welsch.
    pub point_loss_alpha: f64,
    /// Barron loss scale, in pixels.
    pub point_loss_scale: f64,
    /// Global residual weight; must be positive.
    pub point_error_multiplier: f64,
}

impl Default for OptimizationSection {
    fn default() -> Self {
        Self {
            maximum_iterations: 1024,
            error_precision: 0.0,
            tolerance_of_solution_vector_norm: 1e-4,
            tolerance_of_vector_function: 1e-3,
            tolerance_of_error_function_gradient: 0.0,
            diagonal_step_bound_shift: 100.0,
            point_loss_alpha: 2.0,
            point_loss_scale: 100.0,
            point_error_multiplier: 0.5,
        }
    }
}

/// Full engine configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Parameters {
    pub camera: CameraSection,
    pub matching: MatchingSection,
    pub detection: DetectionSection,
    pub mapping: MappingSection,
    pub ransac: RansacSection,
    pub optimization: OptimizationSection,
    /// Seed of every random draw in the engine. Parallel reductions always
    /// merge in fixed slot order, so a fixed seed makes the per-frame pose
    /// bit-reproducible on a single host.
    pub random_seed: u64,
}

impl Parameters {
    /// Load a YAML configuration file. Missing sections fall back to their
    /// defaults; a malformed file is an error (configuration failure is
    /// fatal at engine construction).
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let params: Parameters = serde_yaml::from_str(&text)?;
        Ok(params)
    }

    pub fn intrinsics(&self) -> CameraIntrinsics {
        CameraIntrinsics {
            focal_x: self.camera.camera1_focal_x,
            focal_y: self.camera.camera1_focal_y,
            center_x: self.camera.camera1_center_x,
            center_y: self.camera.camera1_center_y,
        }
    }

    /// Check every cross-field constraint the engine relies on.
    pub fn validate(&self) -> Result<(), SlamError> {
        let fail = |msg: &str| Err(SlamError::InvalidInput(msg.to_string()));

        if self.camera.camera1_focal_x <= 0.0 || self.camera.camera1_focal_y <= 0.0 {
            return fail("camera 1 focal length must be positive");
        }
        if self.detection.depth_map_patch_size_px == 0 {
            return fail("depth map patch size must be positive");
        }
        if !(0.0..=1.0).contains(&self.detection.primitive_maximum_cos_angle) {
            return fail("primitive maximum cos angle must be in [0, 1]");
        }
        if self.detection.primitive_maximum_merge_distance_mm <= 0.0 {
            return fail("primitive merge distance must be positive");
        }
        if self.detection.histogram_bins_per_coordinate < 2 {
            return fail("histogram needs at least 2 bins per coordinate");
        }
        if self.detection.inverse_depth_baseline <= 0.0 {
            return fail("inverse depth baseline must be positive");
        }
        if !(0.0..=1.0).contains(&self.matching.max_match_distance) {
            return fail("max match distance must be in [0, 1]");
        }
        if self.matching.keypoint_refresh_frequency == 0 {
            return fail("keypoint refresh frequency must be positive");
        }
        if self.mapping.point_staged_age_confidence == 0 || self.mapping.point_age_confidence == 0 {
            return fail("age confidence divisors must be positive");
        }
        if !(0.0..1.0).contains(&self.ransac.probability_of_success)
            || !(0.0..1.0).contains(&self.ransac.inlier_proportion)
        {
            return fail("ransac probabilities must be in (0, 1)");
        }
        if self.optimization.maximum_iterations == 0 {
            return fail("optimizer needs at least one iteration");
        }
        if self.optimization.point_error_multiplier <= 0.0 {
            return fail("point error multiplier must be positive");
        }
        if self.optimization.point_loss_scale <= 0.0 {
            return fail("point loss scale must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Parameters::default().validate().is_ok());
    }

    #[test]
    fn bad_focal_rejected() {
        let mut params = Parameters::default();
        params.camera.camera1_focal_x = 0.0;
        assert!(params.validate().is_err());
    }

    #[test]
    fn bad_ransac_probability_rejected() {
        let mut params = Parameters::default();
        params.ransac.probability_of_success = 1.0;
        assert!(params.validate().is_err());
    }

    #[test]
    fn partial_yaml_falls_back_to_defaults() {
        let yaml = "matching:\n  match_search_radius_px: 42.0\n";
        let params: Parameters = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(params.matching.match_search_radius_px, 42.0);
        assert_eq!(params.matching.keypoint_refresh_frequency, 5);
        assert!(params.validate().is_ok());
    }
}
