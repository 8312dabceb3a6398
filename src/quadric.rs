//! Plane quadrics and the optimal collapse point of an edge.

use nalgebra::{Point3, Vector3};
use std::ops::{Add, AddAssign};

type Point = Point3<f64>;
type Vector = Vector3<f64>;

/// Number of f64 words needed to store a quadric.
pub(crate) const QUADRIC_WORDS: usize = 12;

/// Solves whose determinant falls under `EPSILON * area^6` are rejected.
const SOLVE_EPSILON: f64 = 1e-10;

// --- Helper: compensated sum for the constant term ---

/// Two-term accumulator used for `d²`, which suffers the most from
/// cancellation once many planes are summed.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct WideSum {
    hi: f64,
    lo: f64,
}

impl WideSum {
    fn new(value: f64) -> Self {
        Self { hi: value, lo: 0.0 }
    }

    fn add(self, rhs: Self) -> Self {
        // Knuth two-sum
        let sum = self.hi + rhs.hi;
        let bp = sum - self.hi;
        let err = (self.hi - (sum - bp)) + (rhs.hi - bp);
        Self {
            hi: sum,
            lo: self.lo + rhs.lo + err,
        }
    }

    fn scale(self, factor: f64) -> Self {
        Self {
            hi: self.hi * factor,
            lo: self.lo * factor,
        }
    }
}

// --- Quadric ---

/// Area weighted sum of squared plane distances.
///
/// Layout of `m` matches the plane outer product
/// `[a², ab, ac, ad, b², bc, bd, c², cd]`, the constant term lives
/// in its own accumulator.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Quadric {
    m: [f64; 9],
    d2: WideSum,
    area: f64,
}

impl Quadric {
    /// Build a quadric from the plane `ax + by + cz + d = 0`.
    ///
    /// Parameters
    /// ------------
    /// a, b, c, d
    ///   Plane coefficients, the normal is expected to already be
    ///   scaled by the triangle area.
    /// area
    ///   Area carried along for the degeneracy test in `solve`.
    pub fn from_plane(a: f64, b: f64, c: f64, d: f64, area: f64) -> Self {
        Quadric {
            m: [
                a * a,
                a * b,
                a * c,
                a * d,
                b * b,
                b * c,
                b * d,
                c * c,
                c * d,
            ],
            d2: WideSum::new(d * d),
            area,
        }
    }

    /// Plane quadric of a triangle, zero for a degenerate one.
    pub fn from_triangle(p0: &Point, p1: &Point, p2: &Point) -> Self {
        let vecta = p1 - p0;
        let vectb = p2 - p0;
        let plane = vectb.cross(&vecta);
        let norm = plane.norm();
        if norm <= 0.0 || !norm.is_finite() {
            return Quadric::default();
        }
        let area = 0.5 * norm;
        let plane = plane * 0.5;
        let d = -plane.dot(&p0.coords);
        Quadric::from_plane(plane.x, plane.y, plane.z, d, area)
    }

    /// Quadric of the plane standing perpendicular on the triangle along
    /// the edge `p0 -> p1`, scaled by `weight`.
    ///
    /// Returns `None` when the edge or triangle is degenerate.
    pub fn boundary(p0: &Point, p1: &Point, p2: &Point, weight: f64) -> Option<Self> {
        let vecta = p1 - p0;
        let vectb = p2 - p0;
        let normal = vectb.cross(&vecta);
        let norm = normal.norm();
        if norm <= 0.0 || !norm.is_finite() {
            return None;
        }
        let normal = normal / norm;

        let side = vecta.cross(&normal);
        let side_norm = side.norm();
        if side_norm <= 0.0 {
            return None;
        }
        let area = 0.5 * norm;
        let side = side * (area / side_norm);
        let d = -side.dot(&p0.coords);
        let mut q = Quadric::from_plane(side.x, side.y, side.z, d, area);
        q.scale(weight);
        Some(q)
    }

    /// Rebuild from the flat words produced by `to_words`.
    pub(crate) fn from_words(w: &[f64; QUADRIC_WORDS]) -> Self {
        Quadric {
            m: [w[0], w[1], w[2], w[3], w[4], w[5], w[6], w[7], w[8]],
            d2: WideSum { hi: w[9], lo: w[10] },
            area: w[11],
        }
    }

    pub(crate) fn to_words(self) -> [f64; QUADRIC_WORDS] {
        let m = self.m;
        [
            m[0], m[1], m[2], m[3], m[4], m[5], m[6], m[7], m[8], self.d2.hi, self.d2.lo,
            self.area,
        ]
    }

    pub fn area(&self) -> f64 {
        self.area
    }

    /// Scale every term but the area.
    pub fn scale(&mut self, factor: f64) {
        for v in self.m.iter_mut() {
            *v *= factor;
        }
        self.d2 = self.d2.scale(factor);
    }

    /// Evaluate the quadric form at `v`.
    ///
    /// The summation order is fixed so results do not depend on how the
    /// compiler would associate a single expression.
    pub fn evaluate(&self, v: &Point) -> f64 {
        let [a2, ab, ac, ad, b2, bc, bd, c2, cd] = self.m;
        let (x, y, z) = (v.x, v.y, v.z);
        let mut d = x * x * a2 + y * y * b2 + z * z * c2;
        d += 2.0 * (x * y * ab + x * z * ac + y * z * bc);
        d += 2.0 * (x * ad + y * bd + z * cd);
        d += self.d2.hi;
        d += self.d2.lo;
        d
    }

    /// Determinant of the symmetric 3x3 block of quadratic terms.
    fn det(&self) -> f64 {
        let [a2, ab, ac, _, b2, bc, _, c2, _] = self.m;
        a2 * (b2 * c2 - bc * bc) - ab * (ab * c2 - bc * ac) + ac * (ab * bc - b2 * ac)
    }

    /// Point minimizing the quadric form.
    ///
    /// Returns `None` when the matrix is singular relative to the
    /// accumulated area, which scales the quadric terms.
    pub fn solve(&self) -> Option<Point> {
        let det = self.det();
        let area_scale = self.area.powi(6);
        if !det.is_finite() || det.abs() <= SOLVE_EPSILON * area_scale {
            return None;
        }
        let [a2, ab, ac, ad, b2, bc, bd, c2, cd] = self.m;
        let inv = 1.0 / det;

        // explicit adjugate of the symmetric block
        let i00 = (b2 * c2 - bc * bc) * inv;
        let i01 = (ac * bc - ab * c2) * inv;
        let i02 = (ab * bc - ac * b2) * inv;
        let i11 = (a2 * c2 - ac * ac) * inv;
        let i12 = (ab * ac - a2 * bc) * inv;
        let i22 = (a2 * b2 - ab * ab) * inv;

        let rhs = Vector::new(-ad, -bd, -cd);
        let point = Point::new(
            i00 * rhs.x + i01 * rhs.y + i02 * rhs.z,
            i01 * rhs.x + i11 * rhs.y + i12 * rhs.z,
            i02 * rhs.x + i12 * rhs.y + i22 * rhs.z,
        );
        if point.coords.iter().all(|c| c.is_finite()) {
            Some(point)
        } else {
            None
        }
    }
}

impl Add for Quadric {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        let mut result = self;
        result += rhs;
        result
    }
}

impl AddAssign for Quadric {
    fn add_assign(&mut self, rhs: Self) {
        for i in 0..9 {
            self.m[i] += rhs.m[i];
        }
        self.d2 = self.d2.add(rhs.d2);
        self.area += rhs.area;
    }
}

/// Collapse target and cost for merging the two endpoints of an edge.
///
/// Parameters
/// ------------
/// q0, p0
///   Quadric and position of the first endpoint.
/// q1, p1
///   Quadric and position of the second endpoint.
///
/// Returns
/// ------------
/// point
///   Solved point when it beats the midpoint, otherwise the best of
///   midpoint and both endpoints.
/// cost
///   Quadric error at that point.
pub fn edge_solve(q0: &Quadric, p0: &Point, q1: &Quadric, p1: &Point) -> (Point, f64) {
    let q = *q0 + *q1;
    let midpoint = Point::from((p0.coords + p1.coords) * 0.5);
    let midcost = q.evaluate(&midpoint);

    if let Some(solved) = q.solve() {
        let cost = q.evaluate(&solved);
        if cost < midcost {
            return (solved, cost);
        }
        return (midpoint, midcost);
    }

    let mut best = (midpoint, midcost);
    for p in [p0, p1] {
        let cost = q.evaluate(p);
        if cost < best.1 {
            best = (*p, cost);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_relative_eq, relative_eq};

    #[test]
    fn test_triangle_area() {
        let q = Quadric::from_triangle(
            &Point::new(0.0, 0.0, 0.0),
            &Point::new(1.0, 0.0, 0.0),
            &Point::new(0.0, 1.0, 0.0),
        );
        assert_relative_eq!(q.area(), 0.5);
        // on the plane
        assert_relative_eq!(q.evaluate(&Point::new(3.0, -2.0, 0.0)), 0.0);
        // one unit off the plane, scaled by area²
        assert_relative_eq!(q.evaluate(&Point::new(0.2, 0.2, 1.0)), 0.25);
    }

    #[test]
    fn test_degenerate_triangle() {
        let p = Point::new(1.0, 1.0, 1.0);
        let q = Quadric::from_triangle(&p, &p, &Point::new(2.0, 2.0, 2.0));
        assert_eq!(q, Quadric::default());
        assert!(q.solve().is_none());
    }

    #[test]
    fn test_add_and_scale() {
        let a = Quadric::from_plane(1.0, 0.0, 0.0, -1.0, 1.0);
        let b = Quadric::from_plane(0.0, 1.0, 0.0, -2.0, 2.0);
        let mut sum = a + b;
        assert_relative_eq!(sum.area(), 3.0);
        let at = Point::new(1.0, 2.0, 7.0);
        assert_relative_eq!(sum.evaluate(&at), 0.0);

        sum.scale(2.0);
        assert_relative_eq!(sum.area(), 3.0);
        assert_relative_eq!(sum.evaluate(&Point::new(0.0, 0.0, 0.0)), 10.0);
    }

    #[test]
    fn test_words_roundtrip() {
        let q = Quadric::from_plane(0.3, -0.4, 0.5, 1.5, 0.7)
            + Quadric::from_plane(1.0, 0.0, 0.0, 2.0, 1.0);
        assert_eq!(Quadric::from_words(&q.to_words()), q);
    }

    #[test]
    fn test_solve_corner() {
        // three orthogonal planes meet in a single point
        let q = Quadric::from_plane(1.0, 0.0, 0.0, -1.0, 1.0)
            + Quadric::from_plane(0.0, 1.0, 0.0, -2.0, 1.0)
            + Quadric::from_plane(0.0, 0.0, 1.0, -3.0, 1.0);
        let p = q.solve().unwrap();
        assert!(relative_eq!(p, Point::new(1.0, 2.0, 3.0), epsilon = 1e-12));
        assert!(q.evaluate(&p).abs() < 1e-12);
    }

    #[test]
    fn test_solve_rejects_single_plane() {
        let q = Quadric::from_plane(0.0, 0.0, 1.0, 0.0, 1.0);
        assert!(q.solve().is_none());
    }

    #[test]
    fn test_edge_solve_planar_falls_back_to_midpoint() {
        let q = Quadric::from_plane(0.0, 0.0, 1.0, 0.0, 1.0);
        let p0 = Point::new(0.0, 0.0, 0.0);
        let p1 = Point::new(2.0, 0.0, 0.0);
        let (p, cost) = edge_solve(&q, &p0, &q, &p1);
        assert_relative_eq!(p, Point::new(1.0, 0.0, 0.0));
        assert_relative_eq!(cost, 0.0);
    }

    #[test]
    fn test_edge_solve_prefers_endpoint() {
        // midpoint sits off both planes, the first endpoint lies on both
        let q0 = Quadric::from_plane(0.0, 0.0, 1.0, 0.0, 1.0);
        let q1 = Quadric::from_plane(1.0, 0.0, 0.0, 0.0, 1.0);
        let p0 = Point::new(0.0, 0.0, 0.0);
        let p1 = Point::new(2.0, 0.0, 2.0);
        let (p, cost) = edge_solve(&q0, &p0, &q1, &p1);
        assert_relative_eq!(p, p0);
        assert_relative_eq!(cost, 0.0);
    }

    #[test]
    fn test_boundary_plane() {
        let p0 = Point::new(0.0, 0.0, 0.0);
        let p1 = Point::new(1.0, 0.0, 0.0);
        let p2 = Point::new(0.0, 1.0, 0.0);
        let q = Quadric::boundary(&p0, &p1, &p2, 2.0).unwrap();
        // plane y = 0 with normal scaled by area 0.5, then weighted by 2
        assert_relative_eq!(q.evaluate(&Point::new(5.0, 0.0, 3.0)), 0.0);
        assert_relative_eq!(q.evaluate(&Point::new(0.0, 1.0, 0.0)), 0.5);
        assert!(Quadric::boundary(&p0, &p0, &p2, 1.0).is_none());
    }
}
