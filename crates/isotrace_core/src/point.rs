//! Field samples and their local quadratic model.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Error};
use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};

use crate::field::{self, ScalarField};

/// Classification tag of an evaluated point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PointKind {
    /// On the zero set.
    Root,
    /// Stationary point of the field, or a coordinate extreme of the zero set.
    Extreme,
    /// On the valley or ridge line of the local conic.
    Axis,
    /// Zero with vanishing gradient.
    SecondOrder,
    Unclassified,
}

impl fmt::Display for PointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PointKind::Root => "root",
            PointKind::Extreme => "extreme",
            PointKind::Axis => "axis",
            PointKind::SecondOrder => "second_order",
            PointKind::Unclassified => "unclassified",
        })
    }
}

impl FromStr for PointKind {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "root" => PointKind::Root,
            "extreme" => PointKind::Extreme,
            "axis" => PointKind::Axis,
            "second_order" => PointKind::SecondOrder,
            "unclassified" => PointKind::Unclassified,
            other => return Err(anyhow!("unknown point kind '{other}'")),
        })
    }
}

/// Second-order Taylor model of the field about `center`, rotated onto
/// the principal axes of the Hessian.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Conic {
    pub center: Vector2<f64>,
    pub value: f64,
    pub gradient: Vector2<f64>,
    pub hessian: Matrix2<f64>,
    /// Rotation from the parameter axes to the principal axes.
    pub angle: f64,
    /// Hessian eigenvalues along the first and second principal axes.
    pub curvatures: Vector2<f64>,
}

impl Conic {
    pub fn new(center: Vector2<f64>, value: f64, gradient: Vector2<f64>, hessian: Matrix2<f64>) -> Self {
        let (fuu, fuv, fvv) = (hessian[(0, 0)], hessian[(0, 1)], hessian[(1, 1)]);
        let angle = 0.5 * (2.0 * fuv).atan2(fuu - fvv);
        let mut conic = Self {
            center,
            value,
            gradient,
            hessian,
            angle,
            curvatures: Vector2::zeros(),
        };
        let (e1, e2) = conic.axes();
        conic.curvatures = Vector2::new(e1.dot(&(hessian * e1)), e2.dot(&(hessian * e2)));
        conic
    }

    /// Principal axes as unit vectors in parameter space.
    pub fn axes(&self) -> (Vector2<f64>, Vector2<f64>) {
        let (s, c) = self.angle.sin_cos();
        (Vector2::new(c, s), Vector2::new(-s, c))
    }

    /// Model value at `center + offset`.
    pub fn eval(&self, offset: &Vector2<f64>) -> f64 {
        self.value + self.gradient.dot(offset) + 0.5 * offset.dot(&(self.hessian * offset))
    }

    /// Coefficients `(a, b, c)` of `q(t) = c + b t + a t^2 / 2` along `dir`.
    pub fn along(&self, dir: &Vector2<f64>) -> (f64, f64, f64) {
        (dir.dot(&(self.hessian * dir)), self.gradient.dot(dir), self.value)
    }

    /// Zeros of the model along `dir`, sorted by absolute distance.
    pub fn roots_along(&self, dir: &Vector2<f64>) -> Vec<f64> {
        let (a, b, c) = self.along(dir);
        let scale = a.abs().max(b.abs()).max(c.abs());
        if scale == 0.0 {
            return Vec::new();
        }
        if a.abs() <= 1e-14 * scale {
            if b == 0.0 {
                return Vec::new();
            }
            return vec![-c / b];
        }
        let disc = b * b - 2.0 * a * c;
        if disc < 0.0 {
            return Vec::new();
        }
        // q = -(b + sign(b) sqrt(disc)) avoids cancellation.
        let q = -(b + b.signum() * disc.sqrt());
        let mut roots = if q == 0.0 {
            vec![0.0]
        } else {
            vec![2.0 * c / q, q / a]
        };
        roots.sort_by(|x, y| x.abs().total_cmp(&y.abs()));
        roots
    }

    /// Offset to the closest zero of the model along the gradient line,
    /// falling back to a first-order Newton step.
    pub fn nearest_zero(&self) -> Option<Vector2<f64>> {
        let g2 = self.gradient.norm_squared();
        if g2 == 0.0 {
            return None;
        }
        let dir = self.gradient / g2.sqrt();
        let newton = -self.value / g2.sqrt();
        match self.roots_along(&dir).first() {
            Some(&t) if t.abs() <= 2.0 * newton.abs() + f64::EPSILON => Some(dir * t),
            _ => Some(dir * newton),
        }
    }

    /// Offset to the zero of the model along `dir` on the far side.
    pub fn farthest_zero(&self, dir: &Vector2<f64>) -> Option<Vector2<f64>> {
        self.roots_along(dir)
            .into_iter()
            .filter(|t| *t > 0.0)
            .last()
            .map(|t| dir * t)
    }

    /// Principal axis of smallest absolute curvature.
    pub fn axis(&self) -> Vector2<f64> {
        let (e1, e2) = self.axes();
        if self.curvatures.x.abs() <= self.curvatures.y.abs() {
            e1
        } else {
            e2
        }
    }

    /// Principal axis of largest absolute curvature.
    pub fn stiff_axis(&self) -> Vector2<f64> {
        let (e1, e2) = self.axes();
        if self.curvatures.x.abs() > self.curvatures.y.abs() {
            e1
        } else {
            e2
        }
    }

    /// Zero-set directions of the pure quadratic part at a singular zero.
    ///
    /// Four unit directions for a crossing, the two senses of the double
    /// line when one curvature vanishes, none when the Hessian is definite
    /// or vanishes entirely.
    pub fn asymptotes(&self, resnor: f64) -> Vec<Vector2<f64>> {
        let (l1, l2) = (self.curvatures.x, self.curvatures.y);
        let scale = l1.abs().max(l2.abs());
        if scale <= resnor {
            return Vec::new();
        }
        let (e1, e2) = self.axes();
        let flat = 1e-6 * scale;
        if l1.abs() <= flat {
            return vec![e1, -e1];
        }
        if l2.abs() <= flat {
            return vec![e2, -e2];
        }
        if l1 * l2 > 0.0 {
            return Vec::new();
        }
        // l1 s^2 + l2 t^2 = 0  =>  t / s = +-sqrt(-l1 / l2)
        let m = (-l1 / l2).sqrt();
        let d1 = (e1 + e2 * m).normalize();
        let d2 = (e1 - e2 * m).normalize();
        vec![d1, d2, -d1, -d2]
    }

    /// Radius around the center within which the model stays within `eps`.
    pub fn flat_extent(&self, eps: f64) -> f64 {
        let c = self.value.abs();
        if c > eps {
            return 0.0;
        }
        let b = self.gradient.norm();
        let a = 0.5 * self.curvatures.x.abs().max(self.curvatures.y.abs());
        let slack = eps - c;
        if a == 0.0 {
            return if b == 0.0 { f64::INFINITY } else { slack / b };
        }
        (-b + (b * b + 4.0 * a * slack).sqrt()) / (2.0 * a)
    }

    /// Canonical unit tangent `(-fv, fu) / |grad f|` of the level curve.
    pub fn tangent(&self) -> Option<Vector2<f64>> {
        let n = self.gradient.norm();
        (n > 0.0).then(|| Vector2::new(-self.gradient.y, self.gradient.x) / n)
    }

    /// Signed curvature of the level curve through the center.
    pub fn curvature(&self) -> Option<f64> {
        let n = self.gradient.norm();
        let t = self.tangent()?;
        Some(-t.dot(&(self.hessian * t)) / n)
    }

    /// Offset to the stationary point of the model.
    pub fn stationary_offset(&self) -> Option<Vector2<f64>> {
        self.hessian.lu().solve(&(-self.gradient))
    }
}

/// A field sample with lazily computed derivatives and conic.
///
/// Derivative slots are filled once and never silently invalidated; call
/// [`EvaluatedPoint::reset`] to force re-evaluation. Clones are deep.
/// Equality compares the sampled data and ignores the conic cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatedPoint {
    uv: Vector2<f64>,
    value: Option<f64>,
    gradient: Option<Vector2<f64>>,
    hessian: Option<Matrix2<f64>>,
    third: Option<[f64; 4]>,
    /// Orders the field reported as exact at this position.
    accurate: usize,
    failed: bool,
    #[serde(skip)]
    conic: Option<Conic>,
    kind: PointKind,
}

impl PartialEq for EvaluatedPoint {
    fn eq(&self, other: &Self) -> bool {
        self.uv == other.uv
            && self.value == other.value
            && self.gradient == other.gradient
            && self.hessian == other.hessian
            && self.third == other.third
            && self.accurate == other.accurate
            && self.failed == other.failed
            && self.kind == other.kind
    }
}

impl EvaluatedPoint {
    pub fn new(uv: Vector2<f64>) -> Self {
        Self {
            uv,
            value: None,
            gradient: None,
            hessian: None,
            third: None,
            accurate: 0,
            failed: false,
            conic: None,
            kind: PointKind::Unclassified,
        }
    }

    pub fn at<F: ScalarField + ?Sized>(field: &mut F, uv: Vector2<f64>) -> Self {
        let mut point = Self::new(uv);
        point.evaluate(field, 2);
        point
    }

    pub fn uv(&self) -> Vector2<f64> {
        self.uv
    }

    pub fn kind(&self) -> PointKind {
        self.kind
    }

    pub fn set_kind(&mut self, kind: PointKind) {
        self.kind = kind;
    }

    pub fn accurate(&self) -> usize {
        self.accurate
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Drops every cached quantity so the next query re-evaluates.
    pub fn reset(&mut self) {
        *self = Self {
            kind: self.kind,
            ..Self::new(self.uv)
        };
    }

    fn available(&self) -> usize {
        if self.value.is_none() {
            0
        } else if self.gradient.is_none() {
            1
        } else if self.hessian.is_none() {
            2
        } else if self.third.is_none() {
            3
        } else {
            4
        }
    }

    /// Makes derivatives up to `order` available. Returns the number of
    /// orders (counting the value) now cached.
    pub fn evaluate<F: ScalarField + ?Sized>(&mut self, field: &mut F, order: usize) -> usize {
        let wanted = (order + 1).min(4);
        if self.failed || self.available() >= wanted {
            return self.available();
        }
        let s = field::sample(field, self.uv, order);
        if s.is_failed() {
            self.failed = true;
            return self.available();
        }
        self.accurate = self.accurate.max(s.accurate);
        if self.value.is_none() {
            self.value = Some(s.value);
        }
        if s.available >= 2 && self.gradient.is_none() {
            self.gradient = Some(s.gradient);
        }
        if s.available >= 3 && self.hessian.is_none() {
            self.hessian = Some(s.hessian);
        }
        if s.available >= 4 && self.third.is_none() {
            self.third = Some(s.third);
        }
        self.available()
    }

    pub fn value<F: ScalarField + ?Sized>(&mut self, field: &mut F) -> Option<f64> {
        self.evaluate(field, 0);
        self.value
    }

    pub fn gradient<F: ScalarField + ?Sized>(&mut self, field: &mut F) -> Option<Vector2<f64>> {
        self.evaluate(field, 1);
        self.gradient
    }

    pub fn hessian<F: ScalarField + ?Sized>(&mut self, field: &mut F) -> Option<Matrix2<f64>> {
        self.evaluate(field, 2);
        self.hessian
    }

    pub fn third<F: ScalarField + ?Sized>(&mut self, field: &mut F) -> Option<[f64; 4]> {
        self.evaluate(field, 3);
        self.third
    }

    pub fn cached_value(&self) -> Option<f64> {
        self.value
    }

    pub fn cached_gradient(&self) -> Option<Vector2<f64>> {
        self.gradient
    }

    pub fn cached_hessian(&self) -> Option<Matrix2<f64>> {
        self.hessian
    }

    /// The local conic, built on first request.
    pub fn conic<F: ScalarField + ?Sized>(&mut self, field: &mut F) -> Option<Conic> {
        if let Some(conic) = self.conic {
            return Some(conic);
        }
        self.evaluate(field, 2);
        let conic = Conic::new(self.uv, self.value?, self.gradient?, self.hessian?);
        self.conic = Some(conic);
        Some(conic)
    }

    /// The gradient vanishes within `resnor`: conic directions are meaningless.
    pub fn is_degenerate<F: ScalarField + ?Sized>(&mut self, field: &mut F, resnor: f64) -> bool {
        self.gradient(field).map_or(true, |g| g.norm() <= resnor)
    }

    /// Canonical unit tangent of the level curve through this point.
    pub fn tangent<F: ScalarField + ?Sized>(&mut self, field: &mut F) -> Option<Vector2<f64>> {
        self.conic(field)?.tangent()
    }

    /// Branch directions at a singular zero: from the Hessian when it is
    /// informative, otherwise from the cubic form of the third derivatives.
    pub fn singular_directions<F: ScalarField + ?Sized>(
        &mut self,
        field: &mut F,
        resnor: f64,
    ) -> Vec<Vector2<f64>> {
        let Some(conic) = self.conic(field) else {
            return Vec::new();
        };
        let from_conic = conic.asymptotes(resnor);
        if !from_conic.is_empty() || conic.curvatures.abs().max() > resnor {
            return from_conic;
        }
        match self.third(field) {
            Some(third) => cubic_directions(&third),
            None => Vec::new(),
        }
    }
}

/// Zero directions of `fuuu c^3 + 3 fuuv c^2 s + 3 fuvv c s^2 + fvvv s^3`.
pub fn cubic_directions(third: &[f64; 4]) -> Vec<Vector2<f64>> {
    const SAMPLES: usize = 360;
    let form = |theta: f64| {
        let (s, c) = theta.sin_cos();
        third[0] * c * c * c + 3.0 * third[1] * c * c * s + 3.0 * third[2] * c * s * s + third[3] * s * s * s
    };
    let scale = third.iter().fold(0.0f64, |m, x| m.max(x.abs()));
    if scale == 0.0 {
        return Vec::new();
    }
    let step = std::f64::consts::TAU / SAMPLES as f64;
    let mut out = Vec::new();
    for i in 0..SAMPLES {
        let (a, b) = (i as f64 * step, (i + 1) as f64 * step);
        let (fa, fb) = (form(a), form(b));
        if fa == 0.0 || fa * fb < 0.0 {
            let (mut lo, mut hi) = (a, b);
            for _ in 0..50 {
                let mid = 0.5 * (lo + hi);
                if form(lo) * form(mid) <= 0.0 {
                    hi = mid;
                } else {
                    lo = mid;
                }
            }
            let theta = 0.5 * (lo + hi);
            out.push(Vector2::new(theta.cos(), theta.sin()));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Domain;
    use crate::field::FieldSample;
    use approx::assert_abs_diff_eq;

    struct Circle {
        evaluations: usize,
    }

    impl ScalarField for Circle {
        fn domain(&self) -> Domain {
            Domain::new(-1.0, 1.0, -1.0, 1.0)
        }

        fn evaluate(&mut self, uv: Vector2<f64>, _order: usize) -> FieldSample {
            self.evaluations += 1;
            FieldSample::second_order(
                uv.norm_squared() - 0.25,
                uv * 2.0,
                Matrix2::new(2.0, 0.0, 0.0, 2.0),
            )
        }
    }

    #[test]
    fn derivatives_are_cached_until_reset() {
        let mut field = Circle { evaluations: 0 };
        let mut p = EvaluatedPoint::new(Vector2::new(0.5, 0.0));
        assert_abs_diff_eq!(p.value(&mut field).unwrap(), 0.0);
        p.hessian(&mut field);
        p.conic(&mut field);
        assert_eq!(field.evaluations, 1);
        p.gradient(&mut field);
        assert_eq!(field.evaluations, 1);
        p.reset();
        assert!(p.cached_value().is_none());
        p.value(&mut field);
        assert_eq!(field.evaluations, 2);
    }

    #[test]
    fn clone_is_deep() {
        let mut field = Circle { evaluations: 0 };
        let mut p = EvaluatedPoint::at(&mut field, Vector2::new(0.3, 0.1));
        let mut q = p.clone();
        q.reset();
        assert!(p.cached_hessian().is_some());
        assert!(q.cached_hessian().is_none());
        assert!(p.conic(&mut field).is_some());
    }

    #[test]
    fn equality_ignores_the_conic_cache() {
        let mut field = Circle { evaluations: 0 };
        let mut p = EvaluatedPoint::at(&mut field, Vector2::new(0.3, 0.1));
        let q = p.clone();
        assert!(p.conic(&mut field).is_some());
        assert_eq!(p, q);
        p.set_kind(PointKind::Root);
        assert_ne!(p, q);
    }

    #[test]
    fn circle_conic_curvature_and_tangent() {
        let mut field = Circle { evaluations: 0 };
        let mut p = EvaluatedPoint::at(&mut field, Vector2::new(0.5, 0.0));
        let conic = p.conic(&mut field).unwrap();
        let t = conic.tangent().unwrap();
        assert_abs_diff_eq!(t.x, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(t.y, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(conic.curvature().unwrap().abs(), 2.0, epsilon = 1e-12);
    }

    #[test]
    fn nearest_zero_lands_on_circle() {
        let mut field = Circle { evaluations: 0 };
        let mut p = EvaluatedPoint::at(&mut field, Vector2::new(0.3, 0.3));
        let offset = p.conic(&mut field).unwrap().nearest_zero().unwrap();
        let landed = p.uv() + offset;
        assert_abs_diff_eq!(landed.norm(), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn saddle_asymptotes_are_the_axes() {
        let conic = Conic::new(
            Vector2::zeros(),
            0.0,
            Vector2::zeros(),
            Matrix2::new(0.0, 1.0, 1.0, 0.0),
        );
        let dirs = conic.asymptotes(1e-10);
        assert_eq!(dirs.len(), 4);
        for d in &dirs {
            assert!(d.x.abs() < 1e-12 || d.y.abs() < 1e-12, "unexpected direction {d:?}");
        }
        assert_abs_diff_eq!(conic.angle, std::f64::consts::FRAC_PI_4, epsilon = 1e-12);
    }

    #[test]
    fn definite_hessian_has_no_asymptotes() {
        let conic = Conic::new(
            Vector2::zeros(),
            0.0,
            Vector2::zeros(),
            Matrix2::new(2.0, 0.0, 0.0, 3.0),
        );
        assert!(conic.asymptotes(1e-10).is_empty());
        assert_abs_diff_eq!(conic.flat_extent(1e-8), (1e-8f64 / 1.5).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn double_line_gives_two_directions() {
        let conic = Conic::new(
            Vector2::zeros(),
            0.0,
            Vector2::zeros(),
            Matrix2::new(0.0, 0.0, 0.0, 2.0),
        );
        let dirs = conic.asymptotes(1e-10);
        assert_eq!(dirs.len(), 2);
        assert_abs_diff_eq!(dirs[0].y, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn cubic_form_directions_of_monkey_saddle() {
        // f = u^3 - 3 u v^2: fuuu = 6, fuuv = 0, fuvv = -2, fvvv = 0
        let dirs = cubic_directions(&[6.0, 0.0, -2.0, 0.0]);
        assert_eq!(dirs.len(), 6);
        assert!(dirs.iter().any(|d| d.x.abs() < 1e-9));
    }
}
