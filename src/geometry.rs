//! Pairwise geometry for growth: dense n×n matrices and the circle-circle
//! intersection (lens) area.

use std::f32::consts::PI;

use rayon::prelude::*;

use crate::layout::NeuronLayout;

/// Dense row-major `n × n` matrix of `f32`.
#[derive(Clone, Debug, PartialEq)]
pub struct PairMatrix {
    n: usize,
    data: Vec<f32>,
}

impl PairMatrix {
    pub fn zeros(n: usize) -> Self {
        Self { n, data: vec![0.0; n * n] }
    }

    /// Euclidean distances between every pair of layout locations.
    pub fn distances(layout: &dyn NeuronLayout) -> Self {
        let n = layout.len();
        let points: Vec<(f32, f32)> = (0..n).map(|i| layout.location(i)).collect();
        let mut m = Self::zeros(n);
        for i in 0..n {
            for j in 0..n {
                let (dx, dy) = (points[i].0 - points[j].0, points[i].1 - points[j].1);
                m.data[i * n + j] = (dx * dx + dy * dy).sqrt();
            }
        }
        m
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.n
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f32 {
        self.data[i * self.n + j]
    }

    #[inline]
    pub fn set(&mut self, i: usize, j: usize, v: f32) {
        self.data[i * self.n + j] = v;
    }

    #[inline]
    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.n..(i + 1) * self.n]
    }

    /// Mutable rows, for row-parallel updates.
    pub fn par_rows_mut(&mut self) -> rayon::slice::ChunksMut<'_, f32> {
        self.data.par_chunks_mut(self.n.max(1))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

/// Area of the intersection of two circles with radii `r1`, `r2` whose
/// centres are `dist` apart.
///
/// Zero when the circles are disjoint or tangent, `π·min(r1,r2)²` when one
/// contains the other, the lens area otherwise. Always within
/// `[0, π·min(r1,r2)²]` and never NaN for finite non-negative inputs.
pub fn overlap_area(dist: f32, r1: f32, r2: f32) -> f32 {
    let r_min = r1.min(r2);
    let r_max = r1.max(r2);
    let full = PI * r_min * r_min;

    if r_min <= 0.0 || dist >= r1 + r2 {
        return 0.0;
    }
    if dist + r_min <= r_max {
        return full;
    }

    // Half-angles subtended at each centre by the chord through the two
    // intersection points. Clamped so rounding can't leave acos's domain.
    let cos_b = ((r2 * r2 + dist * dist - r1 * r1) / (2.0 * r2 * dist)).clamp(-1.0, 1.0);
    let cos_a = ((r1 * r1 + dist * dist - r2 * r2) / (2.0 * r1 * dist)).clamp(-1.0, 1.0);
    let ang_b = 2.0 * cos_b.acos();
    let ang_a = 2.0 * cos_a.acos();
    let area = 0.5 * (r2 * r2 * (ang_b - ang_b.sin()) + r1 * r1 * (ang_a - ang_a.sin()));

    if area.is_nan() {
        return 0.0;
    }
    area.clamp(0.0, full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{FixedLayout, GridLayout};

    #[test]
    fn disjoint_circles_do_not_overlap() {
        assert_eq!(overlap_area(5.0, 2.0, 2.0), 0.0);
        assert_eq!(overlap_area(4.0, 2.0, 2.0), 0.0, "tangent");
    }

    #[test]
    fn contained_circle_gives_full_disc() {
        let a = overlap_area(0.5, 3.0, 1.0);
        assert!((a - PI).abs() < 1e-5);
        let same_centre = overlap_area(0.0, 2.0, 2.0);
        assert!((same_centre - 4.0 * PI).abs() < 1e-4);
    }

    #[test]
    fn equal_lens_matches_closed_form() {
        // Two unit circles one radius apart: 2π/3 − √3/2.
        let a = overlap_area(1.0, 1.0, 1.0);
        let expected = 2.0 * PI / 3.0 - 3.0f32.sqrt() / 2.0;
        assert!((a - expected).abs() < 1e-5, "got {a}, expected {expected}");
    }

    #[test]
    fn lens_is_symmetric_in_radii() {
        let a = overlap_area(2.5, 1.5, 2.0);
        let b = overlap_area(2.5, 2.0, 1.5);
        assert!((a - b).abs() < 1e-5);
        assert!(a > 0.0 && a < PI * 1.5 * 1.5);
    }

    #[test]
    fn distances_follow_grid() {
        let m = PairMatrix::distances(&GridLayout::new(3, 2));
        assert_eq!(m.dim(), 6);
        assert_eq!(m.get(0, 0), 0.0);
        assert_eq!(m.get(0, 2), 2.0);
        assert!((m.get(0, 4) - 2.0f32.sqrt()).abs() < 1e-6);
        assert_eq!(m.get(4, 0), m.get(0, 4));
    }

    #[test]
    fn distances_from_fixed_points() {
        let m = PairMatrix::distances(&FixedLayout::new(vec![(0.0, 0.0), (3.0, 4.0)]));
        assert_eq!(m.row(0), &[0.0, 5.0]);
    }
}
