//! Shape penalties that steer collapses away from sliver triangles.

use nalgebra::Point3;

use crate::config::Settings;
use crate::topology::{pivot, Mesh};

type Point = Point3<f64>;

/// Scales `area / perimeter²` so an equilateral triangle scores 1.
const COMPACTNESS_FACTOR: f64 = 0.5 * 4.0 * 1.732050808;

/// Shape penalty for moving the corner `old` of a triangle to `new`.
///
/// Parameters
/// ------------
/// new, old
///   Corner position after and before the collapse.
/// left, right
///   The two corners that stay in place.
/// target
///   Compactness at which the penalty vanishes.
///
/// Returns
/// ------------
/// penalty
///   `None` when the move flips the triangle normal.
pub fn triangle_penalty(
    new: &Point,
    old: &Point,
    left: &Point,
    right: &Point,
    target: f64,
) -> Option<f64> {
    let vecta = right - left;
    let old_normal = vecta.cross(&(old - left));
    let new_normal = vecta.cross(&(new - left));
    if old_normal.dot(&new_normal) < 0.0 {
        return None;
    }

    let vecta2 = vecta.norm_squared();
    let new_norm = vecta2 + (new - left).norm_squared() + (new - right).norm_squared();
    let new_compact = COMPACTNESS_FACTOR * new_normal.norm();
    if new_compact >= target * new_norm {
        return Some(0.0);
    }
    let new_compact = new_compact / new_norm;

    let old_norm = vecta2 + (old - left).norm_squared() + (old - right).norm_squared();
    let old_compact = COMPACTNESS_FACTOR * old_normal.norm() / old_norm;
    let penalty = old_compact.min(target) - new_compact;
    Some(penalty.max(0.0))
}

/// Sum of triangle penalties over the fan of `pivot_vertex` when it moves to
/// `point`, triangles also touching `skip` are the ones being removed.
fn fan_penalty(
    mesh: &Mesh,
    pivot_vertex: i32,
    skip: i32,
    point: &Point,
    settings: &Settings,
) -> Option<f64> {
    let mut sum = 0.0;
    for tri in mesh.fan(pivot_vertex) {
        let t = mesh.triangle(tri);
        if t.is_dead() {
            continue;
        }
        let v = t.vertices();
        let Some(k) = pivot(&v, pivot_vertex) else {
            continue;
        };
        let (right, left) = (v[(k + 1) % 3], v[(k + 2) % 3]);
        if right == skip || left == skip {
            continue;
        }
        sum += triangle_penalty(
            point,
            &mesh.vertex(pivot_vertex).point(),
            &mesh.vertex(left).point(),
            &mesh.vertex(right).point(),
            settings.compactness_target,
        )?;
    }
    Some(sum * settings.compactness_penalty)
}

/// Penalty for collapsing `v0` and `v1` into `point`, `None` when any
/// remaining triangle would flip.
pub(crate) fn collapse_penalty(
    mesh: &Mesh,
    v0: i32,
    v1: i32,
    point: &Point,
    settings: &Settings,
) -> Option<f64> {
    let penalty = fan_penalty(mesh, v0, v1, point, settings)?
        + fan_penalty(mesh, v1, v0, point, settings)?;

    let (a, b) = (mesh.vertex(v0), mesh.vertex(v1));
    let count = (a.triref_count() + b.triref_count()) as f64;
    if count <= 0.0 {
        return Some(0.0);
    }
    let area = a.quadric().area() + b.quadric().area();
    Some(penalty * area * area / count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    #[test]
    fn test_equilateral_is_free() {
        let left = Point::new(0.0, 0.0, 0.0);
        let right = Point::new(1.0, 0.0, 0.0);
        let apex = Point::new(0.5, 3f64.sqrt() / 2.0, 0.0);
        assert_relative_eq!(
            triangle_penalty(&apex, &apex, &left, &right, 0.25).unwrap(),
            0.0
        );
    }

    #[test]
    fn test_sliver_is_penalized() {
        let left = Point::new(0.0, 0.0, 0.0);
        let right = Point::new(1.0, 0.0, 0.0);
        let old = Point::new(0.5, 0.8, 0.0);
        let new = Point::new(0.5, 0.01, 0.0);
        let penalty = triangle_penalty(&new, &old, &left, &right, 0.25).unwrap();
        assert!(penalty > 0.2);
        assert!(penalty <= 0.25);
    }

    #[test]
    fn test_flip_is_denied() {
        let left = Point::new(0.0, 0.0, 0.0);
        let right = Point::new(1.0, 0.0, 0.0);
        let old = Point::new(0.5, 1.0, 0.0);
        let new = Point::new(0.5, -1.0, 0.0);
        assert!(triangle_penalty(&new, &old, &left, &right, 0.25).is_none());
    }

    proptest! {
        #[test]
        fn prop_accepted_moves_keep_orientation(
            old in prop::array::uniform3(-10.0..10.0f64),
            new in prop::array::uniform3(-10.0..10.0f64),
            left in prop::array::uniform3(-10.0..10.0f64),
            right in prop::array::uniform3(-10.0..10.0f64),
        ) {
            let (old, new) = (Point::from(old), Point::from(new));
            let (left, right) = (Point::from(left), Point::from(right));
            let edge = right - left;
            let before = edge.cross(&(old - left));
            let after = edge.cross(&(new - left));
            if let Some(penalty) = triangle_penalty(&new, &old, &left, &right, 0.25) {
                prop_assert!(before.dot(&after) >= 0.0);
                prop_assert!((0.0..=0.25).contains(&penalty));
            } else {
                prop_assert!(before.dot(&after) < 0.0);
            }
        }
    }
}
