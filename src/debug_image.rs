//! Debug overlay rendering.
//!
//! Draws the engine state over a frame: a status band, the tracked map
//! features, the detected primitive masks and a red tint when tracking is
//! lost. Purely functional over the inputs, never mutates engine state.

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_circle_mut};
use imageproc::rect::Rect;

use crate::features::primitives::detector::DetectedPrimitives;
use crate::geometry::coordinates::CameraIntrinsics;
use crate::geometry::pose::Pose;
use crate::map::local_map::LocalMap;

/// What the overlay should include.
#[derive(Clone, Copy, Debug, Default)]
pub struct DebugDisplayFlags {
    pub display_staged_points: bool,
    pub display_primitive_masks: bool,
    pub display_lines: bool,
}

/// Blend factor of the primitive mask overlay.
const MASK_ALPHA: f64 = 0.4;
/// Blend factor of the tracking-lost tint.
const LOST_TINT_ALPHA: f64 = 0.2;

const MASK_COLORS: [[u8; 3]; 6] = [
    [52, 152, 219],
    [46, 204, 113],
    [155, 89, 182],
    [241, 196, 15],
    [230, 126, 34],
    [26, 188, 156],
];

#[allow(clippy::too_many_arguments)]
pub fn render_debug_image(
    pose: &Pose,
    rgb: &RgbImage,
    elapsed_seconds: f64,
    flags: DebugDisplayFlags,
    local_map: &LocalMap,
    primitives: &DetectedPrimitives,
    cell_size: usize,
    intrinsics: &CameraIntrinsics,
    is_tracking_lost: bool,
) -> RgbImage {
    let mut canvas = rgb.clone();
    let width = canvas.width();
    let height = canvas.height();

    if flags.display_primitive_masks {
        overlay_masks(&mut canvas, primitives, cell_size);
    }

    let world_to_camera = pose.world_to_camera();
    for point in local_map.local_points() {
        if let Some(screen) = point
            .coordinates()
            .to_screen_coordinates(intrinsics, &world_to_camera)
        {
            let (u, v) = (screen.u() as i32, screen.v() as i32);
            if u >= 0 && v >= 0 && (u as u32) < width && (v as u32) < height {
                // marker size follows the long-term confidence of the point
                let radius =
                    2 + (point.age_confidence(local_map.mapping()).max(0.0) * 3.0) as i32;
                draw_filled_circle_mut(&mut canvas, (u, v), radius, Rgb(point.color));
                draw_hollow_circle_mut(&mut canvas, (u, v), radius + 2, Rgb([255, 0, 0]));
            }
        }
    }

    if flags.display_staged_points {
        for point in local_map.staged_points() {
            if let Some(screen) = point
                .coordinates()
                .to_screen_coordinates(intrinsics, &world_to_camera)
            {
                let (u, v) = (screen.u() as i32, screen.v() as i32);
                if u >= 0 && v >= 0 && (u as u32) < width && (v as u32) < height {
                    draw_filled_circle_mut(&mut canvas, (u, v), 2, Rgb(point.color));
                }
            }
        }
    }

    // status band on top: black background, frame-rate gauge
    let band_height = (height as f64 / 25.0).floor().max(1.0) as u32;
    draw_filled_rect_mut(
        &mut canvas,
        Rect::at(0, 0).of_size(width, band_height),
        Rgb([0, 0, 0]),
    );
    if elapsed_seconds > 0.0 {
        let fps = 1.0 / elapsed_seconds;
        let gauge = ((fps / 60.0).min(1.0) * width as f64) as u32;
        if gauge > 0 {
            draw_filled_rect_mut(
                &mut canvas,
                Rect::at(0, 0).of_size(gauge, (band_height / 3).max(1)),
                Rgb([255, 255, 255]),
            );
        }
    }

    if is_tracking_lost {
        for pixel in canvas.pixels_mut() {
            pixel.0[0] =
                (pixel.0[0] as f64 * (1.0 - LOST_TINT_ALPHA) + 255.0 * LOST_TINT_ALPHA) as u8;
            pixel.0[1] = (pixel.0[1] as f64 * (1.0 - LOST_TINT_ALPHA)) as u8;
            pixel.0[2] = (pixel.0[2] as f64 * (1.0 - LOST_TINT_ALPHA)) as u8;
        }
    }

    canvas
}

/// Upsample each primitive's cell mask to pixel resolution and alpha-blend
/// a per-primitive color.
fn overlay_masks(canvas: &mut RgbImage, primitives: &DetectedPrimitives, cell_size: usize) {
    let masks = primitives
        .planes
        .iter()
        .map(|plane| &plane.cell_mask)
        .chain(primitives.cylinders.iter().map(|cylinder| &cylinder.cell_mask));

    for (index, mask) in masks.enumerate() {
        let color = MASK_COLORS[index % MASK_COLORS.len()];
        for (cell_x, cell_y, value) in mask.enumerate_pixels() {
            if value.0[0] == 0 {
                continue;
            }
            for local_y in 0..cell_size {
                for local_x in 0..cell_size {
                    let u = cell_x * cell_size as u32 + local_x as u32;
                    let v = cell_y * cell_size as u32 + local_y as u32;
                    if u < canvas.width() && v < canvas.height() {
                        let pixel = canvas.get_pixel_mut(u, v);
                        for channel in 0..3 {
                            pixel.0[channel] = (pixel.0[channel] as f64 * (1.0 - MASK_ALPHA)
                                + color[channel] as f64 * MASK_ALPHA)
                                as u8;
                        }
                    }
                }
            }
        }
    }
}
