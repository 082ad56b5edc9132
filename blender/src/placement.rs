//! Rejection sampling of the companion placement offset.
//!
//! The companion galaxy is displaced from the central one by an integer
//! pixel offset whose Euclidean norm must fall inside an annulus derived
//! from the two effective radii: far enough apart that neither galaxy sits
//! on top of the other, close enough that the pair actually blends.

use rand::Rng;

use crate::catalog::GalaxyRecord;

/// Number of candidate draws before the sampler gives up on a pair.
pub const PLACEMENT_TRIES: usize = 25;

/// Integer pixel offset of the companion relative to the central galaxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Displacement {
    pub dy: i64,
    pub dx: i64,
}

impl Displacement {
    /// Euclidean norm of the offset in pixels.
    pub fn norm(&self) -> f64 {
        ((self.dy * self.dy + self.dx * self.dx) as f64).sqrt()
    }
}

/// Acceptance annulus `[rad_min, rad_max]` for a galaxy pair.
///
/// The minimum separation is the larger of the two effective radii; the
/// maximum is the smaller radius scaled by `radius_ratio`, capped at half
/// the stamp size so the toroidal shift never wraps. When the companion is
/// so large that the annulus would be empty, the minimum is relaxed to 80%
/// of the maximum.
pub fn placement_bounds(
    rad1: f64,
    rad2: f64,
    radius_ratio: f64,
    image_size: usize,
) -> (f64, f64) {
    let rad_min = rad1.max(rad2);
    let rad_max = (rad1.min(rad2) * radius_ratio).min((image_size / 2) as f64);
    if rad_min >= rad_max {
        (0.8 * rad_max, rad_max)
    } else {
        (rad_min, rad_max)
    }
}

/// Rejection-sample an integer offset with norm in `[rad_min, rad_max]`.
///
/// Candidates are drawn as two independent uniform integers in
/// `[-floor(rad_max), floor(rad_max))`, consumed from the generator in
/// `(dy, dx)` order, one pair per attempt. The zero offset is accepted up
/// front when the annulus contains it, consuming no randomness. Returns
/// `None` after [`PLACEMENT_TRIES`] rejected draws.
pub fn sample_in_annulus<R: Rng>(
    rng: &mut R,
    rad_min: f64,
    rad_max: f64,
) -> Option<Displacement> {
    let hi = rad_max as i64;
    let mut coords = Displacement { dy: 0, dx: 0 };
    let mut tries = PLACEMENT_TRIES;
    while !(rad_min <= coords.norm() && coords.norm() <= rad_max) {
        if tries == 0 {
            return None;
        }
        coords = if hi > 0 {
            Displacement {
                dy: rng.random_range(-hi..hi),
                dx: rng.random_range(-hi..hi),
            }
        } else {
            // Degenerate annulus: the only candidate is the origin.
            Displacement { dy: 0, dx: 0 }
        };
        tries -= 1;
    }
    Some(coords)
}

/// Sample a placement offset for a galaxy pair, or `None` when the attempt
/// budget is exhausted.
pub fn sample_offset<R: Rng>(
    rng: &mut R,
    central: &GalaxyRecord,
    companion: &GalaxyRecord,
    radius_ratio: f64,
    image_size: usize,
) -> Option<Displacement> {
    let (rad_min, rad_max) =
        placement_bounds(central.radius, companion.radius, radius_ratio, image_size);
    sample_in_annulus(rng, rad_min, rad_max)
}
