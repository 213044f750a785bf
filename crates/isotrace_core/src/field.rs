//! The capability a client geometry operation implements to be traced.

use nalgebra::{Matrix2, Vector2};

use crate::curve::CurvePoint;
use crate::domain::{Domain, Periodicity};
use crate::registry::{self, HelpPoint, Merge, Terminator};
use crate::settings::Resolution;
use crate::stepper::Step;

/// Field value and derivatives at one parameter position.
///
/// `accurate` counts the orders, starting with the value itself, that the
/// field computed exactly: 0 means the field could not be evaluated,
/// 1 value only, 2 adds the gradient, 3 the Hessian, 4 third order.
/// `available` counts the orders filled in, exact or approximated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldSample {
    pub value: f64,
    pub gradient: Vector2<f64>,
    pub hessian: Matrix2<f64>,
    /// `[fuuu, fuuv, fuvv, fvvv]`
    pub third: [f64; 4],
    pub accurate: usize,
    pub available: usize,
}

impl FieldSample {
    pub fn failed() -> Self {
        Self {
            value: f64::NAN,
            gradient: Vector2::zeros(),
            hessian: Matrix2::zeros(),
            third: [0.0; 4],
            accurate: 0,
            available: 0,
        }
    }

    pub fn value_only(value: f64) -> Self {
        Self {
            value,
            accurate: 1,
            available: 1,
            ..Self::failed()
        }
    }

    pub fn first_order(value: f64, gradient: Vector2<f64>) -> Self {
        Self {
            gradient,
            accurate: 2,
            available: 2,
            ..Self::value_only(value)
        }
    }

    pub fn second_order(value: f64, gradient: Vector2<f64>, hessian: Matrix2<f64>) -> Self {
        Self {
            hessian,
            accurate: 3,
            available: 3,
            ..Self::first_order(value, gradient)
        }
    }

    pub fn third_order(
        value: f64,
        gradient: Vector2<f64>,
        hessian: Matrix2<f64>,
        third: [f64; 4],
    ) -> Self {
        Self {
            third,
            accurate: 4,
            available: 4,
            ..Self::second_order(value, gradient, hessian)
        }
    }

    pub fn is_failed(&self) -> bool {
        self.available == 0 || !self.value.is_finite()
    }
}

/// Core interface implemented by any scalar field whose zero set is traced.
///
/// Only `domain` and `evaluate` are required; every other hook has a
/// default matching a plain, non-periodic, smooth field.
pub trait ScalarField {
    /// Parameter rectangle. Periodic axes must span exactly 1.0.
    fn domain(&self) -> Domain;

    /// Evaluate the field and derivatives up to `order` (0 = value only).
    ///
    /// Report in `accurate` how many orders are exact. Orders the field
    /// cannot provide are approximated by the caller.
    fn evaluate(&mut self, uv: Vector2<f64>, order: usize) -> FieldSample;

    fn periodic_u(&self) -> bool {
        false
    }

    fn periodic_v(&self) -> bool {
        false
    }

    fn periodicity(&self) -> Periodicity {
        Periodicity::new(self.periodic_u(), self.periodic_v())
    }

    /// Advisory sub-range where evaluation is numerically safe.
    fn safe_range(&self) -> Option<Domain> {
        None
    }

    /// Membership test of the traced region. Override for non-convex domains;
    /// the result must imply rectangle membership.
    fn inside(&self, uv: &Vector2<f64>) -> bool {
        self.domain().contains(uv, self.periodicity(), 0.0)
    }

    /// Points where the field or its first/second derivatives are discontinuous.
    fn discontinuities(&self) -> Vec<Vector2<f64>> {
        Vec::new()
    }

    /// Return `true` to stop the branch before `step` is taken.
    fn special_termination(&mut self, _step: &Step) -> bool {
        false
    }

    /// Post-process a point once it is committed to a curve.
    fn edit_curve_point(&mut self, _point: &mut CurvePoint) {}

    fn mergeable(&self, a: &HelpPoint, b: &HelpPoint, res: &Resolution) -> Merge {
        registry::default_mergeable(self.periodicity(), a, b, res)
    }

    fn fvals_equal(&self, a: f64, b: f64, res: &Resolution) -> bool {
        (a - b).abs() <= res.epsilon
    }

    fn terminators_equal(&self, a: &Terminator, b: &Terminator, res: &Resolution) -> bool {
        registry::default_terminators_equal(self.periodicity(), a, b, res)
    }
}

const GRADIENT_FROM_VALUES: f64 = 1e-6;
const HESSIAN_FROM_GRADIENTS: f64 = 1e-5;
const HESSIAN_FROM_VALUES: f64 = 1e-4;
const THIRD_FROM_HESSIANS: f64 = 1e-4;

/// Evaluates `field` up to `order`, filling every order the field did not
/// compute exactly by central differencing of the highest exact order.
pub fn sample<F: ScalarField + ?Sized>(field: &mut F, uv: Vector2<f64>, order: usize) -> FieldSample {
    let mut s = field.evaluate(uv, order);
    s.available = s.accurate.min(4);
    if s.accurate == 0 || !s.value.is_finite() {
        return FieldSample::failed();
    }
    let wanted = (order + 1).min(4);

    if wanted >= 2 && s.available < 2 {
        match gradient_by_values(field, uv) {
            Some(g) => {
                s.gradient = g;
                s.available = 2;
            }
            None => return s,
        }
    }
    if wanted >= 3 && s.available < 3 {
        let hessian = if s.accurate >= 2 {
            hessian_by_gradients(field, uv)
        } else {
            hessian_by_values(field, uv, s.value)
        };
        match hessian {
            Some(h) => {
                s.hessian = h;
                s.available = 3;
            }
            None => return s,
        }
    }
    if wanted >= 4 && s.available < 4 {
        if let Some(t) = third_by_hessians(field, uv) {
            s.third = t;
            s.available = 4;
        }
    }
    s
}

fn axis_offset(axis: usize, h: f64) -> Vector2<f64> {
    if axis == 0 {
        Vector2::new(h, 0.0)
    } else {
        Vector2::new(0.0, h)
    }
}

fn value_at<F: ScalarField + ?Sized>(field: &mut F, uv: Vector2<f64>) -> Option<f64> {
    let s = field.evaluate(uv, 0);
    (s.accurate > 0 && s.value.is_finite()).then_some(s.value)
}

fn gradient_by_values<F: ScalarField + ?Sized>(field: &mut F, uv: Vector2<f64>) -> Option<Vector2<f64>> {
    let mut g = Vector2::zeros();
    for axis in 0..2 {
        let h = GRADIENT_FROM_VALUES * (1.0 + uv[axis].abs());
        let plus = value_at(field, uv + axis_offset(axis, h))?;
        let minus = value_at(field, uv - axis_offset(axis, h))?;
        g[axis] = (plus - minus) / (2.0 * h);
    }
    Some(g)
}

fn hessian_by_gradients<F: ScalarField + ?Sized>(field: &mut F, uv: Vector2<f64>) -> Option<Matrix2<f64>> {
    let mut cols = [Vector2::zeros(); 2];
    for axis in 0..2 {
        let h = HESSIAN_FROM_GRADIENTS * (1.0 + uv[axis].abs());
        let plus = field.evaluate(uv + axis_offset(axis, h), 1);
        let minus = field.evaluate(uv - axis_offset(axis, h), 1);
        if plus.accurate < 2 || minus.accurate < 2 {
            let center = value_at(field, uv)?;
            return hessian_by_values(field, uv, center);
        }
        cols[axis] = (plus.gradient - minus.gradient) / (2.0 * h);
    }
    let off = 0.5 * (cols[0].y + cols[1].x);
    Some(Matrix2::new(cols[0].x, off, off, cols[1].y))
}

fn hessian_by_values<F: ScalarField + ?Sized>(
    field: &mut F,
    uv: Vector2<f64>,
    center: f64,
) -> Option<Matrix2<f64>> {
    let hu = HESSIAN_FROM_VALUES * (1.0 + uv.x.abs());
    let hv = HESSIAN_FROM_VALUES * (1.0 + uv.y.abs());
    let eu = axis_offset(0, hu);
    let ev = axis_offset(1, hv);
    let fpu = value_at(field, uv + eu)?;
    let fmu = value_at(field, uv - eu)?;
    let fpv = value_at(field, uv + ev)?;
    let fmv = value_at(field, uv - ev)?;
    let fpp = value_at(field, uv + eu + ev)?;
    let fpm = value_at(field, uv + eu - ev)?;
    let fmp = value_at(field, uv - eu + ev)?;
    let fmm = value_at(field, uv - eu - ev)?;
    let fuu = (fpu - 2.0 * center + fmu) / (hu * hu);
    let fvv = (fpv - 2.0 * center + fmv) / (hv * hv);
    let fuv = (fpp - fpm - fmp + fmm) / (4.0 * hu * hv);
    Some(Matrix2::new(fuu, fuv, fuv, fvv))
}

fn third_by_hessians<F: ScalarField + ?Sized>(field: &mut F, uv: Vector2<f64>) -> Option<[f64; 4]> {
    let mut d = [Matrix2::zeros(); 2];
    for axis in 0..2 {
        let h = THIRD_FROM_HESSIANS * (1.0 + uv[axis].abs());
        let plus = sample(field, uv + axis_offset(axis, h), 2);
        let minus = sample(field, uv - axis_offset(axis, h), 2);
        if plus.available < 3 || minus.available < 3 {
            return None;
        }
        d[axis] = (plus.hessian - minus.hessian) / (2.0 * h);
    }
    // d[0] = dH/du, d[1] = dH/dv; mixed entries are averaged for symmetry.
    let fuuu = d[0][(0, 0)];
    let fuuv = 0.5 * (d[0][(0, 1)] + d[1][(0, 0)]);
    let fuvv = 0.5 * (d[0][(1, 1)] + d[1][(0, 1)]);
    let fvvv = d[1][(1, 1)];
    Some([fuuu, fuuv, fuvv, fvvv])
}

/// A field given by a value-only closure. Every derivative is obtained by
/// finite differencing.
pub struct ClosureField<G>
where
    G: FnMut(f64, f64) -> f64,
{
    domain: Domain,
    periodicity: Periodicity,
    function: G,
}

impl<G> ClosureField<G>
where
    G: FnMut(f64, f64) -> f64,
{
    pub fn new(domain: Domain, function: G) -> Self {
        Self {
            domain,
            periodicity: Periodicity::default(),
            function,
        }
    }

    pub fn with_periodicity(mut self, periodicity: Periodicity) -> Self {
        self.periodicity = periodicity;
        self
    }
}

impl<G> ScalarField for ClosureField<G>
where
    G: FnMut(f64, f64) -> f64,
{
    fn domain(&self) -> Domain {
        self.domain
    }

    fn evaluate(&mut self, uv: Vector2<f64>, _order: usize) -> FieldSample {
        let value = (self.function)(uv.x, uv.y);
        if value.is_finite() {
            FieldSample::value_only(value)
        } else {
            FieldSample::failed()
        }
    }

    fn periodic_u(&self) -> bool {
        self.periodicity.u
    }

    fn periodic_v(&self) -> bool {
        self.periodicity.v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    struct FirstOrderOnly;

    impl ScalarField for FirstOrderOnly {
        fn domain(&self) -> Domain {
            Domain::unit()
        }

        fn evaluate(&mut self, uv: Vector2<f64>, _order: usize) -> FieldSample {
            // f = u^3 + u v^2
            let (u, v) = (uv.x, uv.y);
            FieldSample::first_order(
                u * u * u + u * v * v,
                Vector2::new(3.0 * u * u + v * v, 2.0 * u * v),
            )
        }
    }

    #[test]
    fn closure_field_derivatives_are_differenced() {
        let mut field = ClosureField::new(Domain::unit(), |u, v| u * u + 3.0 * u * v - v);
        let s = sample(&mut field, Vector2::new(0.5, 0.25), 2);
        assert_eq!(s.accurate, 1);
        assert_eq!(s.available, 3);
        assert_abs_diff_eq!(s.gradient.x, 1.0 + 0.75, epsilon = 1e-7);
        assert_abs_diff_eq!(s.gradient.y, 1.5 - 1.0, epsilon = 1e-7);
        assert_abs_diff_eq!(s.hessian[(0, 0)], 2.0, epsilon = 1e-4);
        assert_abs_diff_eq!(s.hessian[(0, 1)], 3.0, epsilon = 1e-4);
        assert_abs_diff_eq!(s.hessian[(1, 1)], 0.0, epsilon = 1e-4);
    }

    #[test]
    fn hessian_from_exact_gradients() {
        let mut field = FirstOrderOnly;
        let s = sample(&mut field, Vector2::new(0.5, 0.5), 2);
        assert_eq!(s.accurate, 2);
        assert_eq!(s.available, 3);
        assert_abs_diff_eq!(s.hessian[(0, 0)], 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(s.hessian[(0, 1)], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(s.hessian[(1, 1)], 1.0, epsilon = 1e-6);
    }

    /// Exact gradients only on the line `u = 0.3`.
    struct GradientOnLine;

    impl ScalarField for GradientOnLine {
        fn domain(&self) -> Domain {
            Domain::unit()
        }

        fn evaluate(&mut self, uv: Vector2<f64>, _order: usize) -> FieldSample {
            // f = u^2 + 3 u v + v^2
            let (u, v) = (uv.x, uv.y);
            let value = u * u + 3.0 * u * v + v * v;
            if u == 0.3 {
                FieldSample::first_order(value, Vector2::new(2.0 * u + 3.0 * v, 3.0 * u + 2.0 * v))
            } else {
                FieldSample::value_only(value)
            }
        }
    }

    #[test]
    fn hessian_falls_back_to_values_when_neighbours_lack_gradients() {
        let mut field = GradientOnLine;
        let s = sample(&mut field, Vector2::new(0.3, 0.2), 2);
        assert_eq!(s.accurate, 2);
        assert_eq!(s.available, 3);
        assert_abs_diff_eq!(s.hessian[(0, 0)], 2.0, epsilon = 1e-4);
        assert_abs_diff_eq!(s.hessian[(0, 1)], 3.0, epsilon = 1e-4);
        assert_abs_diff_eq!(s.hessian[(1, 1)], 2.0, epsilon = 1e-4);
    }

    #[test]
    fn third_order_from_hessians() {
        let mut field = FirstOrderOnly;
        let s = sample(&mut field, Vector2::new(0.5, 0.5), 3);
        assert_eq!(s.available, 4);
        // fuuu = 6, fuuv = 0, fuvv = 2, fvvv = 0
        assert_abs_diff_eq!(s.third[0], 6.0, epsilon = 1e-3);
        assert_abs_diff_eq!(s.third[1], 0.0, epsilon = 1e-3);
        assert_abs_diff_eq!(s.third[2], 2.0, epsilon = 1e-3);
        assert_abs_diff_eq!(s.third[3], 0.0, epsilon = 1e-3);
    }

    #[test]
    fn failed_evaluation_reports_nothing_available() {
        let mut field = ClosureField::new(Domain::unit(), |u, _v| (u - 0.5).ln());
        let s = sample(&mut field, Vector2::new(0.25, 0.5), 2);
        assert!(s.is_failed());
        assert_eq!(s.available, 0);
    }
}
