//! Relaxation of point estimates onto the zero set and onto the special
//! points of the field.
//!
//! Every operation iterates a Newton-type update inside a bounding box and
//! reports why it stopped. Only [`RelaxReason::SmallStep`] means success;
//! callers inspect the reason rather than assuming the point is usable.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Error};
use nalgebra::{Matrix2, Matrix3x2, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::domain::{Domain, Side};
use crate::field::ScalarField;
use crate::point::{EvaluatedPoint, PointKind};
use crate::stepper::Tracer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelaxReason {
    /// Converged.
    SmallStep,
    /// The local model is ill-posed.
    Degenerate,
    /// No improving direction.
    Stalled,
    /// No solution nearby.
    Abandoned,
    /// Iteration budget exceeded.
    Aborted,
    /// The update was clipped at the bounding box.
    Truncated,
}

#[derive(Debug, Clone)]
pub struct Relaxed {
    pub point: EvaluatedPoint,
    pub reason: RelaxReason,
    pub iterations: usize,
}

impl Relaxed {
    pub fn converged(&self) -> bool {
        self.reason == RelaxReason::SmallStep
    }
}

/// One Newton update proposed by a relaxation.
enum Update {
    Step { delta: Vector2<f64>, residual: f64 },
    Degenerate,
}

/// Tracks the best residual to detect stalling.
struct Progress {
    best: f64,
    idle: usize,
}

const STALL_ITERATIONS: usize = 5;
const BISECTION_CAP: usize = 200;
const FIRST_CROSSING_SAMPLES: usize = 8;

impl Progress {
    fn new() -> Self {
        Self {
            best: f64::INFINITY,
            idle: 0,
        }
    }

    fn stalled(&mut self, residual: f64) -> bool {
        if residual < 0.9 * self.best {
            self.best = residual;
            self.idle = 0;
        } else {
            self.idle += 1;
        }
        self.idle >= STALL_ITERATIONS
    }
}

/// Iteration limits shared by one relaxation call.
struct Limits<'a> {
    bounds: &'a Domain,
    anchor: Vector2<f64>,
    reach: f64,
    tolerance: f64,
    kind: PointKind,
}

impl<'f, F: ScalarField + ?Sized> Tracer<'f, F> {
    fn finish(&mut self, mut point: EvaluatedPoint, reason: RelaxReason, iterations: usize, kind: PointKind) -> Relaxed {
        if reason == RelaxReason::SmallStep {
            point.set_kind(kind);
        }
        self.last_relax = Some(reason);
        log::trace!(
            "relaxation to {kind:?} stopped after {iterations} iterations: {reason} at ({:.6}, {:.6})",
            point.uv().x,
            point.uv().y
        );
        Relaxed {
            point,
            reason,
            iterations,
        }
    }

    /// Moves `uv` into `bounds`, honouring periodic axes. Returns the
    /// confined position and whether it had to be clipped.
    fn confine(&self, uv: &Vector2<f64>, bounds: &Domain) -> (Vector2<f64>, bool) {
        let mut out = *uv;
        let mut clipped = false;
        for axis in 0..2 {
            let (lo, hi) = (bounds.min(axis), bounds.max(axis));
            if self.periodicity.axis(axis) {
                if hi - lo >= 1.0 - 1e-12 {
                    continue;
                }
                let x = lo + (out[axis] - lo).rem_euclid(1.0);
                out[axis] = if x <= hi {
                    x
                } else {
                    clipped = true;
                    if x - hi < lo + 1.0 - x {
                        hi
                    } else {
                        lo
                    }
                };
            } else if out[axis] < lo || out[axis] > hi {
                out[axis] = out[axis].clamp(lo, hi);
                clipped = true;
            }
        }
        (self.normalize(&out), clipped)
    }

    fn iterate<U>(&mut self, start: EvaluatedPoint, limits: Limits<'_>, order: usize, mut update: U) -> Relaxed
    where
        U: FnMut(&mut EvaluatedPoint, &mut F) -> Update,
    {
        let resabs = self.settings.resolution.resabs;
        let mut progress = Progress::new();
        let (uv, _) = self.confine(&start.uv(), limits.bounds);
        let mut point = if uv == start.uv() { start } else { EvaluatedPoint::new(uv) };

        for iteration in 1..=self.settings.max_relax_iterations {
            if point.evaluate(self.field, order) < order + 1 {
                return self.finish(point, RelaxReason::Abandoned, iteration, limits.kind);
            }
            let (delta, residual) = match update(&mut point, &mut *self.field) {
                Update::Step { delta, residual } if delta.iter().all(|x| x.is_finite()) => (delta, residual),
                _ => return self.finish(point, RelaxReason::Degenerate, iteration, limits.kind),
            };
            if residual <= limits.tolerance && delta.norm() <= resabs {
                let (uv, clipped) = self.confine(&(point.uv() + delta), limits.bounds);
                if !clipped {
                    point = EvaluatedPoint::new(uv);
                }
                return self.finish(point, RelaxReason::SmallStep, iteration, limits.kind);
            }
            if progress.stalled(residual) {
                return self.finish(point, RelaxReason::Stalled, iteration, limits.kind);
            }
            let target = point.uv() + delta;
            if self.periodicity.distance(&limits.anchor, &target) > limits.reach {
                return self.finish(point, RelaxReason::Abandoned, iteration, limits.kind);
            }
            let (next, clipped) = self.confine(&target, limits.bounds);
            if clipped && self.periodicity.distance(&next, &point.uv()) <= resabs {
                return self.finish(point, RelaxReason::Truncated, iteration, limits.kind);
            }
            point = EvaluatedPoint::new(next);
        }
        let iterations = self.settings.max_relax_iterations;
        self.finish(point, RelaxReason::Aborted, iterations, limits.kind)
    }

    fn default_reach(&self) -> f64 {
        4.0 * self.max_step()
    }

    /// Closest zero-set point, following the conic's nearest zero.
    pub fn nearpoint(&mut self, start: EvaluatedPoint, bounds: &Domain) -> Relaxed {
        let resnor = self.settings.resolution.resnor;
        let limits = Limits {
            bounds,
            anchor: start.uv(),
            reach: self.default_reach(),
            tolerance: self.settings.resolution.epsilon,
            kind: PointKind::Root,
        };
        self.iterate(start, limits, 2, |point, field| {
            let Some(conic) = point.conic(field) else {
                return Update::Degenerate;
            };
            if conic.gradient.norm() <= resnor {
                return Update::Degenerate;
            }
            match conic.nearest_zero() {
                Some(delta) => Update::Step {
                    delta,
                    residual: conic.value.abs(),
                },
                None => Update::Degenerate,
            }
        })
    }

    /// Bordered Newton corrector: the zero set intersected with the line
    /// through `predicted` orthogonal to `direction`.
    pub fn steppoint(&mut self, predicted: EvaluatedPoint, direction: &Vector2<f64>, reach: f64) -> Relaxed {
        let resnor = self.settings.resolution.resnor;
        let periodicity = self.periodicity;
        let anchor = predicted.uv();
        let bounds = self.domain;
        let limits = Limits {
            bounds: &bounds,
            anchor,
            reach,
            tolerance: self.settings.resolution.epsilon,
            kind: PointKind::Root,
        };
        let d = *direction;
        self.iterate(predicted, limits, 1, |point, field| {
            let (Some(f), Some(g)) = (point.value(field), point.gradient(field)) else {
                return Update::Degenerate;
            };
            let constraint = d.dot(&periodicity.delta(&anchor, &point.uv()));
            let jac = Matrix2::new(g.x, g.y, d.x, d.y);
            if jac.determinant().abs() <= resnor * g.norm().max(resnor) {
                return Update::Degenerate;
            }
            match jac.lu().solve(&Vector2::new(-f, -constraint)) {
                Some(delta) => Update::Step {
                    delta,
                    residual: f.abs(),
                },
                None => Update::Degenerate,
            }
        })
    }

    /// Zero along the ray `origin + t * direction`, `0 < t <= reach`,
    /// starting from the far root of the conic.
    pub fn farpoint(&mut self, mut origin: EvaluatedPoint, direction: &Vector2<f64>, reach: f64, bounds: &Domain) -> Relaxed {
        let resnor = self.settings.resolution.resnor;
        let d = *direction;
        let anchor = origin.uv();
        let start = match origin.conic(self.field).and_then(|c| c.farthest_zero(&d)) {
            Some(offset) if offset.norm() <= reach => EvaluatedPoint::new(self.normalize(&(anchor + offset))),
            _ => origin,
        };
        let limits = Limits {
            bounds,
            anchor,
            reach,
            tolerance: self.settings.resolution.epsilon,
            kind: PointKind::Root,
        };
        self.iterate(start, limits, 1, |point, field| {
            let (Some(f), Some(g)) = (point.value(field), point.gradient(field)) else {
                return Update::Degenerate;
            };
            let slope = g.dot(&d);
            if slope.abs() <= resnor {
                return Update::Degenerate;
            }
            Update::Step {
                delta: d * (-f / slope),
                residual: f.abs(),
            }
        })
    }

    /// Point on the valley or ridge line: the derivative along the stiff
    /// axis of the starting conic vanishes.
    pub fn axispoint(&mut self, mut start: EvaluatedPoint, bounds: &Domain) -> Relaxed {
        let resnor = self.settings.resolution.resnor;
        let Some(axis) = start.conic(self.field).map(|c| c.stiff_axis()) else {
            return self.finish(start, RelaxReason::Degenerate, 0, PointKind::Axis);
        };
        let limits = Limits {
            bounds,
            anchor: start.uv(),
            reach: self.default_reach(),
            tolerance: self.settings.resolution.epsilon,
            kind: PointKind::Axis,
        };
        self.iterate(start, limits, 2, |point, field| {
            let (Some(g), Some(h)) = (point.gradient(field), point.hessian(field)) else {
                return Update::Degenerate;
            };
            let slope = axis.dot(&(h * axis));
            if slope.abs() <= resnor {
                return Update::Degenerate;
            }
            let along = axis.dot(&g);
            Update::Step {
                delta: axis * (-along / slope),
                residual: along.abs(),
            }
        })
    }

    /// Stationary point of the field (Newton on the gradient).
    pub fn turning_point(&mut self, start: EvaluatedPoint, bounds: &Domain) -> Relaxed {
        let resnor = self.settings.resolution.resnor;
        let epsilon = self.settings.resolution.epsilon;
        let limits = Limits {
            bounds,
            anchor: start.uv(),
            reach: bounds.diagonal(),
            tolerance: epsilon,
            kind: PointKind::Extreme,
        };
        let mut relaxed = self.iterate(start, limits, 2, |point, field| {
            let (Some(g), Some(h)) = (point.gradient(field), point.hessian(field)) else {
                return Update::Degenerate;
            };
            if h.determinant().abs() <= resnor {
                return Update::Degenerate;
            }
            match h.lu().solve(&(-g)) {
                Some(delta) => Update::Step {
                    delta,
                    residual: g.norm(),
                },
                None => Update::Degenerate,
            }
        });
        if relaxed.converged() && relaxed.point.value(self.field).map_or(false, |f| f.abs() <= epsilon) {
            relaxed.point.set_kind(PointKind::SecondOrder);
        }
        relaxed
    }

    /// Zero of the field where the gradient vanishes too, by Gauss-Newton
    /// on `(f, fu, fv) = 0`.
    pub fn second_order_point(&mut self, start: EvaluatedPoint, bounds: &Domain) -> Relaxed {
        let resnor = self.settings.resolution.resnor;
        let limits = Limits {
            bounds,
            anchor: start.uv(),
            reach: bounds.diagonal().max(self.default_reach()),
            tolerance: self.settings.resolution.epsilon,
            kind: PointKind::SecondOrder,
        };
        self.iterate(start, limits, 2, |point, field| {
            let (Some(f), Some(g), Some(h)) = (point.value(field), point.gradient(field), point.hessian(field)) else {
                return Update::Degenerate;
            };
            let residual = Vector3::new(f, g.x, g.y);
            let jac = Matrix3x2::new(g.x, g.y, h[(0, 0)], h[(0, 1)], h[(1, 0)], h[(1, 1)]);
            match jac.svd(true, true).solve(&(-residual), resnor) {
                Ok(delta) => Update::Step {
                    delta,
                    residual: residual.norm(),
                },
                Err(_) => Update::Degenerate,
            }
        })
    }

    /// Zero-set point where the curve is extreme along `axis`
    /// (0: extreme in u, so `fv = 0`; 1: extreme in v, so `fu = 0`).
    pub fn extreme_point(&mut self, start: EvaluatedPoint, axis: usize, bounds: &Domain) -> Relaxed {
        let resnor = self.settings.resolution.resnor;
        let other = 1 - axis.min(1);
        let limits = Limits {
            bounds,
            anchor: start.uv(),
            reach: self.default_reach(),
            tolerance: self.settings.resolution.epsilon,
            kind: PointKind::Extreme,
        };
        self.iterate(start, limits, 2, |point, field| {
            let (Some(f), Some(g), Some(h)) = (point.value(field), point.gradient(field), point.hessian(field)) else {
                return Update::Degenerate;
            };
            let jac = Matrix2::new(g.x, g.y, h[(other, 0)], h[(other, 1)]);
            if jac.determinant().abs() <= resnor {
                return Update::Degenerate;
            }
            match jac.lu().solve(&Vector2::new(-f, -g[other])) {
                Some(delta) => Update::Step {
                    delta,
                    residual: f.abs() + g[other].abs(),
                },
                None => Update::Degenerate,
            }
        })
    }

    /// Zero-set point on the domain boundary between `inside` and `outside`.
    ///
    /// Bisects the segment with a bounded worklist. When the segment leaves
    /// and re-enters the domain the first crossing is searched again from
    /// the new pair. The boundary hit is then relaxed onto the zero set
    /// along the boundary side.
    pub fn boundary_point(&mut self, inside: &EvaluatedPoint, outside: Vector2<f64>) -> Relaxed {
        let resabs = self.settings.resolution.resabs;
        let anchor = inside.uv();
        let far = anchor + self.periodicity.delta(&anchor, &outside);
        let mut worklist = vec![far];
        let mut budget = BISECTION_CAP;

        while let Some(mut b) = worklist.pop() {
            let mut a = anchor;
            while (b - a).norm() > resabs {
                if budget == 0 {
                    return self.finish(inside.clone(), RelaxReason::Aborted, BISECTION_CAP, PointKind::Root);
                }
                budget -= 1;
                let mid = 0.5 * (a + b);
                if self.inside(&mid) {
                    a = mid;
                } else {
                    b = mid;
                }
            }
            let earlier = (1..FIRST_CROSSING_SAMPLES)
                .map(|k| anchor + (a - anchor) * (k as f64 / FIRST_CROSSING_SAMPLES as f64))
                .find(|p| !self.inside(p));
            if let Some(p) = earlier {
                worklist.push(p);
                continue;
            }

            let tol = 4.0 * resabs;
            let hit = self.normalize(&a);
            let sides = self.domain.sides_near(&hit, self.periodicity, tol);
            return match sides.first() {
                Some(&side) => {
                    let reach = 2.0 * self.periodicity.distance(&anchor, &far) + self.min_step();
                    self.relax_on_side(hit, side, reach)
                }
                None => {
                    let mut point = EvaluatedPoint::new(hit);
                    let reason = if self.is_zero(&mut point) {
                        RelaxReason::SmallStep
                    } else {
                        RelaxReason::Abandoned
                    };
                    self.finish(point, reason, BISECTION_CAP - budget, PointKind::Root)
                }
            };
        }
        self.finish(inside.clone(), RelaxReason::Abandoned, BISECTION_CAP - budget, PointKind::Root)
    }

    /// Zero on `side`, moving only along the side.
    pub fn relax_on_side(&mut self, uv: Vector2<f64>, side: Side, reach: f64) -> Relaxed {
        let resnor = self.settings.resolution.resnor;
        let fixed = side.fixed_axis();
        let free = 1 - fixed;
        let value = match side {
            Side::UMin | Side::VMin => self.domain.min(fixed),
            Side::UMax | Side::VMax => self.domain.max(fixed),
        };
        let mut edge = self.domain;
        if fixed == 0 {
            edge.umin = value;
            edge.umax = value;
        } else {
            edge.vmin = value;
            edge.vmax = value;
        }
        let mut start = uv;
        start[fixed] = value;
        let limits = Limits {
            bounds: &edge,
            anchor: start,
            reach,
            tolerance: self.settings.resolution.epsilon,
            kind: PointKind::Root,
        };
        self.iterate(EvaluatedPoint::new(start), limits, 1, |point, field| {
            let (Some(f), Some(g)) = (point.value(field), point.gradient(field)) else {
                return Update::Degenerate;
            };
            if g[free].abs() <= resnor {
                return Update::Degenerate;
            }
            let mut delta = Vector2::zeros();
            delta[free] = -f / g[free];
            Update::Step {
                delta,
                residual: f.abs(),
            }
        })
    }
}

impl fmt::Display for RelaxReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelaxReason::SmallStep => "small_step",
            RelaxReason::Degenerate => "degenerate",
            RelaxReason::Stalled => "stalled",
            RelaxReason::Abandoned => "abandoned",
            RelaxReason::Aborted => "aborted",
            RelaxReason::Truncated => "truncated",
        };
        f.write_str(name)
    }
}

impl FromStr for RelaxReason {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "small_step" => RelaxReason::SmallStep,
            "degenerate" => RelaxReason::Degenerate,
            "stalled" => RelaxReason::Stalled,
            "abandoned" => RelaxReason::Abandoned,
            "aborted" => RelaxReason::Aborted,
            "truncated" => RelaxReason::Truncated,
            other => return Err(anyhow!("unknown relaxation reason '{other}'")),
        })
    }
}
