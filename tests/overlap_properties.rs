//! Property-based tests for the lens overlap area using proptest

use std::f32::consts::PI;

use neurogrow::overlap_area;
use proptest::prelude::*;

fn radius() -> impl Strategy<Value = f32> {
    0.01f32..20.0
}

proptest! {
    #[test]
    fn area_is_bounded_and_finite(d in 0.0f32..50.0, r1 in radius(), r2 in radius()) {
        let a = overlap_area(d, r1, r2);
        let r_min = r1.min(r2);
        prop_assert!(a.is_finite());
        prop_assert!(a >= 0.0);
        prop_assert!(a <= PI * r_min * r_min * (1.0 + 1e-6));
    }

    #[test]
    fn area_is_symmetric(d in 0.0f32..50.0, r1 in radius(), r2 in radius()) {
        let a = overlap_area(d, r1, r2);
        let b = overlap_area(d, r2, r1);
        prop_assert!((a - b).abs() <= 1e-4 * a.max(1.0));
    }

    #[test]
    fn disjoint_pairs_have_no_area(r1 in radius(), r2 in radius(), gap in 0.0f32..10.0) {
        prop_assert_eq!(overlap_area(r1 + r2 + gap, r1, r2), 0.0);
    }

    #[test]
    fn containment_gives_full_disc(r_small in radius(), extra in 0.0f32..10.0, t in 0.0f32..1.0) {
        let r_big = r_small + extra;
        let d = extra * t;
        let a = overlap_area(d, r_big, r_small);
        prop_assert!((a - PI * r_small * r_small).abs() <= 1e-4 * a.max(1.0));
    }

    #[test]
    fn area_shrinks_with_distance(r1 in radius(), r2 in radius(), t1 in 0.0f32..1.0, t2 in 0.0f32..1.0) {
        let span = r1 + r2;
        let (near, far) = if t1 < t2 { (t1, t2) } else { (t2, t1) };
        let a_near = overlap_area(near * span, r1, r2);
        let a_far = overlap_area(far * span, r1, r2);
        prop_assert!(a_near + 1e-3 * a_near.max(1.0) >= a_far);
    }
}
