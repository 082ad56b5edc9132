//! Pad, crop and toroidal shift operations on square stamps.
//!
//! These are the array transforms underlying blend composition: a companion
//! stamp is padded to twice its size, rolled by the sampled displacement and
//! cropped back, so that for any displacement smaller than half the stamp
//! size the shift behaves like a plain translation with zero fill.

use ndarray::{s, Array2, ArrayView2, Axis, Slice};

use crate::placement::Displacement;

/// Zero-pad a square array symmetrically by half its size on every side.
///
/// A `S x S` input becomes `2S x 2S` with the original data centered.
pub fn pad<A: Copy + Default>(array: &ArrayView2<A>) -> Array2<A> {
    let (height, width) = array.dim();
    let margin = height / 2;
    let mut padded = Array2::<A>::default((height + 2 * margin, width + 2 * margin));
    padded
        .slice_mut(s![margin..margin + height, margin..margin + width])
        .assign(array);
    padded
}

/// Extract the central `size x size` region of a padded array.
///
/// Inverse of [`pad`] for an original side length of `size`.
pub fn crop<A: Copy>(array: &ArrayView2<A>, size: usize) -> Array2<A> {
    let margin = size / 2;
    array.slice(s![margin..margin + size, margin..margin + size]).to_owned()
}

/// Wrap-around roll of an array along one axis, numpy `roll` semantics:
/// the element at index `i` moves to `(i + shift) mod len`.
pub fn roll<A: Copy>(array: &ArrayView2<A>, shift: i64, axis: Axis) -> Array2<A> {
    let len = array.len_of(axis);
    if len == 0 {
        return array.to_owned();
    }
    let k = shift.rem_euclid(len as i64) as usize;
    let mut rolled = array.to_owned();
    if k == 0 {
        return rolled;
    }
    rolled
        .slice_axis_mut(axis, Slice::from(..k))
        .assign(&array.slice_axis(axis, Slice::from(len - k..)));
    rolled
        .slice_axis_mut(axis, Slice::from(k..))
        .assign(&array.slice_axis(axis, Slice::from(..len - k)));
    rolled
}

/// Displace a stamp by `(dy, dx)` pixels with zero fill.
///
/// The stamp is padded, rolled by `dx` columns and then by `dy` rows, and
/// cropped back to its original size.
/// Wrap-around can only reach the cropped region when a displacement
/// component exceeds half the stamp size, which the placement bounds
/// prevent.
pub fn shift<A: Copy + Default>(array: &ArrayView2<A>, displacement: Displacement) -> Array2<A> {
    let size = array.nrows();
    let padded = pad(array);
    let rolled = roll(&padded.view(), displacement.dx, Axis(1));
    let rolled = roll(&rolled.view(), displacement.dy, Axis(0));
    crop(&rolled.view(), size)
}
