//! Configuration for a single exploration call.

use serde::{Deserialize, Serialize};

use crate::error::{ExploreError, Result};

/// Numeric resolution used for every equality and convergence test.
///
/// The defaults were tuned on unit-scale domains; callers working at other
/// scales should treat them as configuration rather than fixed constants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// Parameter-space distance below which two positions are the same.
    pub resabs: f64,
    /// Normalized tolerance for gradient magnitudes and angles.
    pub resnor: f64,
    /// Field value tolerance: `|f| <= epsilon` means "on the zero set".
    pub epsilon: f64,
}

impl Resolution {
    pub const DEFAULT_RESABS: f64 = 1e-7;
    pub const DEFAULT_RESNOR: f64 = 1e-10;
    pub const DEFAULT_EPSILON: f64 = 1e-9;

    pub fn new(resabs: f64, resnor: f64, epsilon: f64) -> Self {
        Self {
            resabs,
            resnor,
            epsilon,
        }
    }

    pub fn is_zero_value(&self, value: f64) -> bool {
        value.abs() <= self.epsilon
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_RESABS,
            Self::DEFAULT_RESNOR,
            Self::DEFAULT_EPSILON,
        )
    }
}

/// How much of the zero set an exploration must return.
///
/// Levels are ordered: each one includes the work of the previous ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Completeness {
    /// Trace the branch through the first seed and stop.
    SingleBranch,
    /// Trace the first seed's branch and continue straight through terminators.
    CompositeBranch,
    /// Trace every branch touching a supplied seed.
    SeedBranches,
    /// Additionally scan the domain boundary for entry and exit points.
    Boundaries,
    /// Additionally subdivide the domain to seed interior closed loops.
    Subdivide,
    /// Additionally search every region for isolated zeros and turning points.
    Everything,
}

impl Default for Completeness {
    fn default() -> Self {
        Completeness::Boundaries
    }
}

/// Settings controlling the marching algorithm.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExplorationSettings {
    pub resolution: Resolution,
    /// Target turning angle of the zero-set tangent across one step (radians).
    pub control_angle: f64,
    /// Maximum number of accepted steps along one branch.
    pub max_steps: usize,
    /// Iteration budget of every relaxation.
    pub max_relax_iterations: usize,
    /// Smallest step length as a fraction of the domain diagonal.
    pub min_step_fraction: f64,
    /// Largest step length as a fraction of the domain diagonal.
    pub max_step_fraction: f64,
    /// Caller asserts every singular point is already supplied as a seed.
    pub safe_area: bool,
    pub completeness: Completeness,
    /// Recoverable anomalies tolerated before the exploration is abandoned.
    pub error_threshold: usize,
    /// Region subdivision depth (the domain is split into `4^depth` boxes).
    pub subdivision_depth: usize,
    /// Radius of the circle scanned around terminators, as a fraction of
    /// the domain diagonal.
    pub terminator_radius: f64,
}

impl Default for ExplorationSettings {
    fn default() -> Self {
        Self {
            resolution: Resolution::default(),
            control_angle: 0.1,
            max_steps: 5_000,
            max_relax_iterations: 30,
            min_step_fraction: 1e-7,
            max_step_fraction: 0.05,
            safe_area: false,
            completeness: Completeness::default(),
            error_threshold: 32,
            subdivision_depth: 3,
            terminator_radius: 0.015,
        }
    }
}

impl ExplorationSettings {
    pub fn with_completeness(mut self, completeness: Completeness) -> Self {
        self.completeness = completeness;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let res = &self.resolution;
        if !(res.resabs > 0.0 && res.resnor > 0.0 && res.epsilon > 0.0) {
            return Err(ExploreError::InvalidSettings(
                "resolution values must be positive".into(),
            ));
        }
        if !(self.control_angle > 0.0 && self.control_angle < std::f64::consts::FRAC_PI_2) {
            return Err(ExploreError::InvalidSettings(format!(
                "control angle {} must lie in (0, pi/2)",
                self.control_angle
            )));
        }
        if self.max_steps == 0 {
            return Err(ExploreError::InvalidSettings(
                "max_steps must be greater than zero".into(),
            ));
        }
        if self.max_relax_iterations == 0 {
            return Err(ExploreError::InvalidSettings(
                "max_relax_iterations must be greater than zero".into(),
            ));
        }
        if !(self.min_step_fraction > 0.0 && self.min_step_fraction < self.max_step_fraction) {
            return Err(ExploreError::InvalidSettings(
                "step fractions must satisfy 0 < min < max".into(),
            ));
        }
        if self.max_step_fraction > 1.0 {
            return Err(ExploreError::InvalidSettings(
                "max_step_fraction must not exceed 1".into(),
            ));
        }
        if !(self.terminator_radius > 0.0 && self.terminator_radius < 0.5) {
            return Err(ExploreError::InvalidSettings(
                "terminator_radius must lie in (0, 0.5)".into(),
            ));
        }
        Ok(())
    }
}
