//! Rectangular parameter domains and periodic normalization.

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

use crate::error::{ExploreError, Result};

/// One side of a rectangular domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    UMin,
    UMax,
    VMin,
    VMax,
}

impl Side {
    pub const ALL: [Side; 4] = [Side::UMin, Side::UMax, Side::VMin, Side::VMax];

    /// Unit normal pointing into the domain.
    pub fn inward_normal(self) -> Vector2<f64> {
        match self {
            Side::UMin => Vector2::new(1.0, 0.0),
            Side::UMax => Vector2::new(-1.0, 0.0),
            Side::VMin => Vector2::new(0.0, 1.0),
            Side::VMax => Vector2::new(0.0, -1.0),
        }
    }

    /// Index of the coordinate held fixed along this side.
    pub fn fixed_axis(self) -> usize {
        match self {
            Side::UMin | Side::UMax => 0,
            Side::VMin | Side::VMax => 1,
        }
    }
}

/// Per-axis periodicity. A periodic axis always has period 1.0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Periodicity {
    pub u: bool,
    pub v: bool,
}

impl Periodicity {
    pub fn new(u: bool, v: bool) -> Self {
        Self { u, v }
    }

    pub fn axis(&self, index: usize) -> bool {
        if index == 0 {
            self.u
        } else {
            self.v
        }
    }

    /// Shortest parameter difference `to - from`, wrapping periodic axes
    /// into `[-0.5, 0.5)`.
    pub fn delta(&self, from: &Vector2<f64>, to: &Vector2<f64>) -> Vector2<f64> {
        let mut d = to - from;
        for axis in 0..2 {
            if self.axis(axis) {
                d[axis] -= (d[axis] + 0.5).floor();
            }
        }
        d
    }

    pub fn distance(&self, a: &Vector2<f64>, b: &Vector2<f64>) -> f64 {
        self.delta(a, b).norm()
    }

    /// Distance from `p` to the segment `a -> b` and the segment parameter
    /// of the closest point, both measured with periodic deltas.
    pub fn segment_distance(
        &self,
        p: &Vector2<f64>,
        a: &Vector2<f64>,
        b: &Vector2<f64>,
    ) -> (f64, f64) {
        let ab = self.delta(a, b);
        let ap = self.delta(a, p);
        let len2 = ab.norm_squared();
        if len2 == 0.0 {
            return (ap.norm(), 0.0);
        }
        let t = (ap.dot(&ab) / len2).clamp(0.0, 1.0);
        ((ap - ab * t).norm(), t)
    }
}

/// A rectangular parameter domain `[umin, umax] x [vmin, vmax]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Domain {
    pub umin: f64,
    pub umax: f64,
    pub vmin: f64,
    pub vmax: f64,
}

impl Domain {
    pub fn new(umin: f64, umax: f64, vmin: f64, vmax: f64) -> Self {
        Self {
            umin,
            umax,
            vmin,
            vmax,
        }
    }

    pub fn unit() -> Self {
        Self::new(0.0, 1.0, 0.0, 1.0)
    }

    /// Checks the domain is finite, non-empty, and exactly one period wide
    /// along every periodic axis.
    pub fn validate(&self, periodicity: Periodicity) -> Result<()> {
        let finite = [self.umin, self.umax, self.vmin, self.vmax]
            .iter()
            .all(|v| v.is_finite());
        if !finite {
            return Err(ExploreError::InvalidDomain("bounds must be finite".into()));
        }
        if self.umax <= self.umin || self.vmax <= self.vmin {
            return Err(ExploreError::InvalidDomain(format!(
                "empty domain [{}, {}] x [{}, {}]",
                self.umin, self.umax, self.vmin, self.vmax
            )));
        }
        if periodicity.u && (self.width() - 1.0).abs() > 1e-12 {
            return Err(ExploreError::InvalidDomain(
                "periodic u axis must span exactly 1.0".into(),
            ));
        }
        if periodicity.v && (self.height() - 1.0).abs() > 1e-12 {
            return Err(ExploreError::InvalidDomain(
                "periodic v axis must span exactly 1.0".into(),
            ));
        }
        Ok(())
    }

    pub fn width(&self) -> f64 {
        self.umax - self.umin
    }

    pub fn height(&self) -> f64 {
        self.vmax - self.vmin
    }

    pub fn diagonal(&self) -> f64 {
        self.width().hypot(self.height())
    }

    pub fn center(&self) -> Vector2<f64> {
        Vector2::new(0.5 * (self.umin + self.umax), 0.5 * (self.vmin + self.vmax))
    }

    pub fn min(&self, axis: usize) -> f64 {
        if axis == 0 {
            self.umin
        } else {
            self.vmin
        }
    }

    pub fn max(&self, axis: usize) -> f64 {
        if axis == 0 {
            self.umax
        } else {
            self.vmax
        }
    }

    /// Containment test on the non-periodic axes, widened by `tol`.
    pub fn contains(&self, uv: &Vector2<f64>, periodicity: Periodicity, tol: f64) -> bool {
        (0..2).all(|axis| {
            periodicity.axis(axis)
                || (uv[axis] >= self.min(axis) - tol && uv[axis] <= self.max(axis) + tol)
        })
    }

    /// Moves periodic coordinates into `[min, min + 1)`.
    pub fn normalize(&self, uv: &Vector2<f64>, periodicity: Periodicity) -> Vector2<f64> {
        let mut out = *uv;
        for axis in 0..2 {
            if periodicity.axis(axis) {
                let base = self.min(axis);
                out[axis] = base + (out[axis] - base).rem_euclid(1.0);
            }
        }
        out
    }

    /// Clamps non-periodic coordinates into the rectangle.
    pub fn clamp(&self, uv: &Vector2<f64>, periodicity: Periodicity) -> Vector2<f64> {
        let mut out = self.normalize(uv, periodicity);
        for axis in 0..2 {
            if !periodicity.axis(axis) {
                out[axis] = out[axis].clamp(self.min(axis), self.max(axis));
            }
        }
        out
    }

    /// Sides of the rectangle that lie within `tol` of `uv`.
    pub fn sides_near(&self, uv: &Vector2<f64>, periodicity: Periodicity, tol: f64) -> Vec<Side> {
        Side::ALL
            .iter()
            .copied()
            .filter(|side| {
                let axis = side.fixed_axis();
                if periodicity.axis(axis) {
                    return false;
                }
                let bound = match side {
                    Side::UMin | Side::VMin => self.min(axis),
                    Side::UMax | Side::VMax => self.max(axis),
                };
                (uv[axis] - bound).abs() <= tol
            })
            .collect()
    }

    /// The side a point outside the rectangle violates the most.
    pub fn violated_side(&self, uv: &Vector2<f64>, periodicity: Periodicity) -> Option<Side> {
        let mut worst: Option<(Side, f64)> = None;
        for side in Side::ALL {
            let axis = side.fixed_axis();
            if periodicity.axis(axis) {
                continue;
            }
            let excess = match side {
                Side::UMin | Side::VMin => self.min(axis) - uv[axis],
                Side::UMax | Side::VMax => uv[axis] - self.max(axis),
            };
            if excess > 0.0 && worst.map_or(true, |(_, best)| excess > best) {
                worst = Some((side, excess));
            }
        }
        worst.map(|(side, _)| side)
    }

    /// Position on `side` at parameter `t` in `[0, 1]` along the free axis.
    pub fn point_on_side(&self, side: Side, t: f64) -> Vector2<f64> {
        match side {
            Side::UMin => Vector2::new(self.umin, self.vmin + t * self.height()),
            Side::UMax => Vector2::new(self.umax, self.vmin + t * self.height()),
            Side::VMin => Vector2::new(self.umin + t * self.width(), self.vmin),
            Side::VMax => Vector2::new(self.umin + t * self.width(), self.vmax),
        }
    }

    /// Splits into four quadrants: (umin, vmin), (umax, vmin), (umin, vmax), (umax, vmax).
    pub fn quadrants(&self) -> [Domain; 4] {
        let c = self.center();
        [
            Domain::new(self.umin, c.x, self.vmin, c.y),
            Domain::new(c.x, self.umax, self.vmin, c.y),
            Domain::new(self.umin, c.x, c.y, self.vmax),
            Domain::new(c.x, self.umax, c.y, self.vmax),
        ]
    }
}
