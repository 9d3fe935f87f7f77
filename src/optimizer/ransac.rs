//! RANSAC-driven pose optimization.
//!
//! Random minimum-score feature subsets are optimized with
//! Levenberg-Marquardt; the resulting poses are scored over all matches by
//! capped retroprojection error, and the best inlier partition gets a final
//! refinement pass. A failed refinement falls back to the best candidate
//! pose from the loop.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{UnitQuaternion, Vector3};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::{debug, warn};

use crate::config::Parameters;
use crate::error::SlamError;
use crate::geometry::coordinates::CameraIntrinsics;
use crate::geometry::pose::Pose;
use crate::map::matches::{MatchSets, Matches};
use crate::optimizer::functor::PoseEstimator;

/// Feature-count minima for a solvable optimization. A subset is feasible
/// when the weighted count reaches 1 (3 points, or 2 planes + 1 point, ...).
pub const MINIMUM_POINTS_FOR_OPTIMIZATION: usize = 3;
pub const MINIMUM_PLANES_FOR_OPTIMIZATION: usize = 2;
pub const MINIMUM_POINTS_2D_FOR_OPTIMIZATION: usize = 6;

/// Upper bound on RANSAC iterations whatever the configured probabilities.
const MAXIMUM_RANSAC_ITERATIONS: usize = 100;

/// Weighted feature score: sum of per-kind counts over their minima.
fn feature_score(points: usize, points_2d: usize, planes: usize) -> f64 {
    points as f64 / MINIMUM_POINTS_FOR_OPTIMIZATION as f64
        + points_2d as f64 / MINIMUM_POINTS_2D_FOR_OPTIMIZATION as f64
        + planes as f64 / MINIMUM_PLANES_FOR_OPTIMIZATION as f64
}

/// Number of subset draws needed to hit an outlier-free one with the
/// configured probability.
fn ransac_iteration_count(probability_of_success: f64, inlier_proportion: f64) -> usize {
    let failure = 1.0 - probability_of_success;
    let all_inliers = inlier_proportion.powi(MINIMUM_POINTS_FOR_OPTIMIZATION as i32);
    let iterations = (failure.ln() / (1.0 - all_inliers).ln()).ceil();
    (iterations as usize).clamp(1, MAXIMUM_RANSAC_ITERATIONS)
}

/// One Levenberg-Marquardt run over a match set, from the given pose.
/// Returns the optimized pose; a non-success termination is a typed
/// failure and leaves the caller's pose untouched.
pub(crate) fn run_optimization(
    current_position: &Vector3<f64>,
    current_orientation: &UnitQuaternion<f64>,
    matches: &Matches,
    intrinsics: &CameraIntrinsics,
    params: &Parameters,
) -> Result<(Vector3<f64>, UnitQuaternion<f64>), SlamError> {
    let optimization = &params.optimization;
    let estimator = PoseEstimator::new(
        matches,
        *intrinsics,
        *current_position,
        *current_orientation,
        optimization,
    );

    let solver = LevenbergMarquardt::new()
        .with_patience(optimization.maximum_iterations)
        .with_ftol(optimization.tolerance_of_vector_function.max(f64::EPSILON))
        .with_xtol(
            optimization
                .tolerance_of_solution_vector_norm
                .max(f64::EPSILON),
        )
        .with_gtol(
            optimization
                .tolerance_of_error_function_gradient
                .max(f64::EPSILON),
        )
        .with_stepbound(optimization.diagonal_step_bound_shift);

    let (estimator, report) = solver.minimize(estimator);
    if !report.termination.was_successful() {
        return Err(SlamError::NonConvergence(format!(
            "LM over {} features terminated with {:?}",
            matches.len(),
            report.termination
        )));
    }

    let (position, orientation) = estimator.pose_from_params(&estimator.params());
    if position.iter().any(|value| !value.is_finite()) {
        return Err(SlamError::NonConvergence(
            "LM produced a non-finite position".to_string(),
        ));
    }
    Ok((position, orientation))
}

/// Retroprojection residual of every match against a candidate pose,
/// partitioned by the per-kind inlier thresholds. Returns the partition,
/// the capped score (lower is better) and the weighted inlier count.
fn partition_matches(
    position: &Vector3<f64>,
    orientation: &UnitQuaternion<f64>,
    matches: &Matches,
    intrinsics: &CameraIntrinsics,
    params: &Parameters,
) -> (MatchSets, f64, f64) {
    let world_to_camera = crate::geometry::pose::WorldToCamera::new(orientation, position);
    let ransac = &params.ransac;

    let mut sets = MatchSets::default();
    let mut score = 0.0;

    for matched in &matches.points {
        let threshold = ransac.maximum_retroprojection_error_for_point_inliers_px;
        let residual = matched
            .world
            .signed_screen_distance(&matched.screen.as_2d(), intrinsics, &world_to_camera)
            .map(|distance| distance.norm())
            .unwrap_or(f64::INFINITY);
        score += residual.min(threshold);
        if residual < threshold {
            sets.inliers.points.push(matched.clone());
        } else {
            sets.outliers.points.push(matched.clone());
        }
    }

    for matched in &matches.points_2d {
        let threshold = ransac.maximum_retroprojection_error_for_point_2d_inliers_px;
        let estimate = matched.coordinates.to_world_coordinates();
        let residual = estimate
            .signed_screen_distance(&matched.screen, intrinsics, &world_to_camera)
            .map(|distance| distance.norm())
            .unwrap_or(f64::INFINITY);
        score += residual.min(threshold);
        if residual < threshold {
            sets.inliers.points_2d.push(matched.clone());
        } else {
            sets.outliers.points_2d.push(matched.clone());
        }
    }

    for matched in &matches.planes {
        let threshold = ransac.maximum_retroprojection_error_for_plane_inliers_mm;
        let error = matched
            .map_plane
            .reduced_signed_distance(&matched.detected, &world_to_camera);
        let residual = error.z.abs();
        score += residual.min(threshold);
        if residual < threshold {
            sets.inliers.planes.push(matched.clone());
        } else {
            sets.outliers.planes.push(matched.clone());
        }
    }

    let inlier_score = feature_score(
        sets.inliers.points.len(),
        sets.inliers.points_2d.len(),
        sets.inliers.planes.len(),
    );
    (sets, score, inlier_score)
}

/// Draw a random subset of matches with feature score >= 1, no duplicates.
fn draw_minimal_subset(matches: &Matches, rng: &mut StdRng) -> Matches {
    #[derive(Clone, Copy)]
    enum Kind {
        Point(usize),
        Point2D(usize),
        Plane(usize),
    }

    let mut pool: Vec<Kind> = (0..matches.points.len())
        .map(Kind::Point)
        .chain((0..matches.points_2d.len()).map(Kind::Point2D))
        .chain((0..matches.planes.len()).map(Kind::Plane))
        .collect();
    pool.shuffle(rng);

    let mut subset = Matches::default();
    for kind in pool {
        if feature_score(
            subset.points.len(),
            subset.points_2d.len(),
            subset.planes.len(),
        ) >= 1.0
        {
            break;
        }
        match kind {
            Kind::Point(index) => subset.points.push(matches.points[index].clone()),
            Kind::Point2D(index) => subset.points_2d.push(matches.points_2d[index].clone()),
            Kind::Plane(index) => subset.planes.push(matches.planes[index].clone()),
        }
    }
    subset
}

/// Full RANSAC pose search.
///
/// Returns the optimized pose together with the final inlier/outlier
/// partition, or a typed failure when the match set cannot constrain a pose
/// (the caller keeps its previous pose).
pub fn compute_optimized_pose(
    current_pose: &Pose,
    matches: &Matches,
    intrinsics: &CameraIntrinsics,
    params: &Parameters,
    rng: &mut StdRng,
) -> Result<(Pose, MatchSets), SlamError> {
    let total_score = feature_score(
        matches.points.len(),
        matches.points_2d.len(),
        matches.planes.len(),
    );
    if total_score < 1.0 {
        return Err(SlamError::InvalidInput(format!(
            "not enough features for optimization (score {total_score:.2})"
        )));
    }

    let iterations = ransac_iteration_count(
        params.ransac.probability_of_success,
        params.ransac.inlier_proportion,
    );
    let early_stop_score = params.ransac.minimum_inliers_proportion_for_early_stop * total_score;

    let current_position = current_pose.position();
    let current_orientation = current_pose.orientation();

    let mut best: Option<(f64, Vector3<f64>, UnitQuaternion<f64>, MatchSets)> = None;
    for iteration in 0..iterations {
        let subset = draw_minimal_subset(matches, rng);
        let Ok((position, orientation)) = run_optimization(
            &current_position,
            &current_orientation,
            &subset,
            intrinsics,
            params,
        ) else {
            continue;
        };

        let (sets, score, inlier_score) =
            partition_matches(&position, &orientation, matches, intrinsics, params);
        if feature_score(
            sets.inliers.points.len(),
            sets.inliers.points_2d.len(),
            sets.inliers.planes.len(),
        ) < 1.0
        {
            continue; // not enough inliers to refine this candidate
        }

        let is_better = best
            .as_ref()
            .map_or(true, |(best_score, ..)| score < *best_score);
        if is_better {
            let stop = inlier_score >= early_stop_score;
            best = Some((score, position, orientation, sets));
            if stop {
                debug!(iteration, score, "ransac early stop");
                break;
            }
        }
    }

    let Some((_, position, orientation, sets)) = best else {
        return Err(SlamError::NonConvergence(
            "no RANSAC iteration produced a valid pose".to_string(),
        ));
    };

    // refinement over the inlier union; fall back to the candidate pose
    let (final_position, final_orientation, final_sets) = match run_optimization(
        &position,
        &orientation,
        &sets.inliers,
        intrinsics,
        params,
    ) {
        Ok((refined_position, refined_orientation)) => {
            let (refined_sets, _, _) = partition_matches(
                &refined_position,
                &refined_orientation,
                matches,
                intrinsics,
                params,
            );
            (refined_position, refined_orientation, refined_sets)
        }
        Err(error) => {
            warn!(%error, "inlier refinement failed, keeping best candidate");
            (position, orientation, sets)
        }
    };

    Ok((
        Pose::with_covariance(final_position, final_orientation, current_pose.covariance()),
        final_sets,
    ))
}
