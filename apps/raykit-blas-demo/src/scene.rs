//! Procedural test scene.

use glam::{Mat4, Vec3};
use raykit_accel::AabbPositions;

/// Boxes per BLAS cycle through `1..=MAX_BOXES`.
const MAX_BOXES: usize = 16;

/// Spacing between BLAS instances in the TLAS grid.
const GRID_SPACING: f32 = 4.0;

/// Number of boxes in BLAS `index`.
#[allow(clippy::cast_possible_truncation)]
pub const fn box_count(index: usize) -> u32 {
    (index % MAX_BOXES) as u32 + 1
}

/// Boxes of every BLAS, laid out back to back.
#[allow(clippy::cast_precision_loss)]
pub fn make_aabbs(blas_count: usize) -> Vec<AabbPositions> {
    (0..blas_count)
        .flat_map(|blas| {
            (0..box_count(blas)).map(|i| {
                let offset = i as f32 * 0.25;
                AabbPositions::new([offset; 3], [offset + 0.2; 3])
            })
        })
        .collect()
}

/// Placement of instance `index` on a square grid.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn grid_transform(index: usize, count: usize) -> Mat4 {
    let side = (count as f32).sqrt().ceil().max(1.0) as usize;
    let x = (index % side) as f32;
    let z = (index / side) as f32;
    Mat4::from_translation(Vec3::new(x * GRID_SPACING, 0.0, z * GRID_SPACING))
}
