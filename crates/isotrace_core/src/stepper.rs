//! Per-branch stepping state: step length control, step scoring and the
//! predictor/corrector step itself.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Error};
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

use crate::domain::{Domain, Periodicity};
use crate::error::Result;
use crate::field::ScalarField;
use crate::point::EvaluatedPoint;
use crate::registry::TerminatorId;
use crate::relax::RelaxReason;
use crate::settings::ExplorationSettings;

/// How a branch march was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StartKind {
    ClosedLoopCandidate,
    RestartAfterReversal,
    DomainEntry,
    DomainExit,
    TerminatorForward,
    TerminatorBackward,
    TangentCandidate,
}

/// Why a branch march stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BranchEnd {
    ClosedLoop,
    DomainExit,
    Terminator(TerminatorId),
    IsolatedPoint,
    OutsideDomain,
    /// The branch was traced away from a terminator in both directions.
    BothDirections,
    SpecialTermination,
    FailedToLeaveTerminator,
    StepLimit,
    RelaxationFailed,
    /// The error budget ran out mid-branch.
    Aborted,
}

impl BranchEnd {
    /// Ends that count against the error budget.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            BranchEnd::BothDirections
                | BranchEnd::OutsideDomain
                | BranchEnd::StepLimit
                | BranchEnd::RelaxationFailed
        )
    }
}

/// The step currently being taken along a branch.
#[derive(Debug, Clone)]
pub struct Step {
    pub from: EvaluatedPoint,
    /// Unit direction of travel at `from`.
    pub direction: Vector2<f64>,
    pub length: f64,
    /// Turning angle the step length aims for.
    pub target_angle: f64,
    /// Score of the last judged step, see [`Tracer::judge_step`].
    pub quality: Option<f64>,
    pub to: Option<EvaluatedPoint>,
    /// Number of steps already accepted on this branch.
    pub index: usize,
}

impl Step {
    pub fn new(from: EvaluatedPoint, direction: Vector2<f64>, target_angle: f64) -> Self {
        Self {
            from,
            direction,
            length: 0.0,
            target_angle,
            quality: None,
            to: None,
            index: 0,
        }
    }

    /// Moves the step origin to an accepted point.
    pub fn advance(&mut self, to: EvaluatedPoint, direction: Vector2<f64>) {
        self.from = to;
        self.direction = direction;
        self.to = None;
        self.index += 1;
    }
}

/// Result of one predictor/corrector step.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Accepted {
        point: EvaluatedPoint,
        tangent: Vector2<f64>,
    },
    /// The branch leaves the domain at `point`, which lies on the boundary.
    Exit {
        point: EvaluatedPoint,
        tangent: Vector2<f64>,
    },
    /// The canonical tangent flipped or vanished: a singular point lies near `near`.
    Singular { near: Vector2<f64> },
    /// No acceptable step above the minimum length.
    Failed,
}

/// Borrowed field plus the numeric state shared by every relaxation and step.
pub struct Tracer<'f, F: ScalarField + ?Sized> {
    pub(crate) field: &'f mut F,
    pub(crate) settings: ExplorationSettings,
    pub(crate) domain: Domain,
    pub(crate) periodicity: Periodicity,
    pub(crate) last_relax: Option<RelaxReason>,
    errors: usize,
}

impl<'f, F: ScalarField + ?Sized> Tracer<'f, F> {
    pub fn new(field: &'f mut F, settings: ExplorationSettings) -> Result<Self> {
        settings.validate()?;
        let domain = field.domain();
        let periodicity = field.periodicity();
        domain.validate(periodicity)?;
        Ok(Self {
            field,
            settings,
            domain,
            periodicity,
            last_relax: None,
            errors: 0,
        })
    }

    pub fn settings(&self) -> &ExplorationSettings {
        &self.settings
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn periodicity(&self) -> Periodicity {
        self.periodicity
    }

    pub fn field(&mut self) -> &mut F {
        self.field
    }

    /// Reason the most recent relaxation stopped.
    pub fn last_relax(&self) -> Option<RelaxReason> {
        self.last_relax
    }

    pub fn min_step(&self) -> f64 {
        self.settings.min_step_fraction * self.domain.diagonal()
    }

    pub fn max_step(&self) -> f64 {
        self.settings.max_step_fraction * self.domain.diagonal()
    }

    pub fn normalize(&self, uv: &Vector2<f64>) -> Vector2<f64> {
        self.domain.normalize(uv, self.periodicity)
    }

    /// Evaluates the field up to second order at `uv`.
    pub fn eval(&mut self, uv: Vector2<f64>) -> EvaluatedPoint {
        let uv = self.normalize(&uv);
        EvaluatedPoint::at(self.field, uv)
    }

    /// Field value only, without derivatives.
    pub fn value_at(&mut self, uv: &Vector2<f64>) -> Option<f64> {
        let uv = self.normalize(uv);
        EvaluatedPoint::new(uv).value(self.field)
    }

    pub fn inside(&self, uv: &Vector2<f64>) -> bool {
        let uv = self.normalize(uv);
        self.domain.contains(&uv, self.periodicity, 0.0) && self.field.inside(&uv)
    }

    /// Within resolution of a rectangle side.
    pub fn on_boundary(&self, uv: &Vector2<f64>) -> bool {
        let tol = 2.0 * self.settings.resolution.resabs;
        !self.domain.sides_near(uv, self.periodicity, tol).is_empty()
    }

    pub fn is_zero(&mut self, point: &mut EvaluatedPoint) -> bool {
        let epsilon = self.settings.resolution.epsilon;
        point.value(self.field).map_or(false, |f| f.abs() <= epsilon)
    }

    /// Counts one recoverable anomaly.
    pub fn record_error(&mut self, what: &str) {
        self.errors += 1;
        log::debug!("recoverable anomaly #{}: {what}", self.errors);
    }

    pub fn errors(&self) -> usize {
        self.errors
    }

    pub fn error_budget_exhausted(&self) -> bool {
        self.errors >= self.settings.error_threshold
    }

    /// Sets `step.length` so the tangent turns by about `step.target_angle`
    /// under the curvature at `step.from`. Returns whether curvature was used.
    pub fn steplength(&mut self, step: &mut Step) -> bool {
        let (min, max) = (self.min_step(), self.max_step());
        let curvature = step
            .from
            .conic(self.field)
            .and_then(|c| c.curvature())
            .filter(|k| k.is_finite());
        let (length, used) = match curvature {
            Some(k) if k.abs() * max > step.target_angle => (step.target_angle / k.abs(), true),
            Some(_) => (max, true),
            None => (0.25 * max, false),
        };
        let length = if step.length > 0.0 {
            length.min(2.0 * step.length)
        } else {
            length
        };
        step.length = length.clamp(min, max);
        used
    }

    /// Score of a realized turning angle: 1.0 exactly at the control angle.
    pub fn judge_angle(&self, realized: f64) -> f64 {
        realized / self.settings.control_angle
    }

    /// Scores the step `step.from -> step.to` against the control angle.
    ///
    /// The realized angle is the larger of the tangent rotation between the
    /// end points and the curvature integrated along the chord.
    pub fn judge_step(&mut self, step: &mut Step) -> f64 {
        let Some(to) = step.to.as_mut() else {
            return f64::INFINITY;
        };
        let c0 = step.from.conic(self.field);
        let c1 = to.conic(self.field);
        let (Some(c0), Some(c1)) = (c0, c1) else {
            return f64::INFINITY;
        };
        let (Some(t0), Some(t1)) = (c0.tangent(), c1.tangent()) else {
            return f64::INFINITY;
        };
        let chord = self.periodicity.delta(&step.from.uv(), &to.uv()).norm();
        let direct = t0.dot(&t1).clamp(-1.0, 1.0).acos();
        let k0 = c0.curvature().unwrap_or(0.0).abs();
        let k1 = c1.curvature().unwrap_or(0.0).abs();
        let integrated = 0.5 * (k0 + k1) * chord;
        let quality = self.judge_angle(direct.max(integrated));
        step.quality = Some(quality);
        quality
    }

    /// Predicts along `step.direction`, corrects onto the zero set and
    /// shrinks the step until the result is acceptable.
    pub fn take_step(&mut self, step: &mut Step) -> StepOutcome {
        let min_step = self.min_step();
        let start = step.from.uv();
        let Some(canonical) = step.from.tangent(self.field) else {
            return StepOutcome::Singular { near: start };
        };
        let sense = if canonical.dot(&step.direction) >= 0.0 { 1.0 } else { -1.0 };

        loop {
            if step.length < min_step {
                return StepOutcome::Failed;
            }
            let h = step.length;
            let predicted = start + step.direction * h;
            if !self.inside(&predicted) {
                if let Some((point, tangent)) = self.try_exit(step, predicted, sense) {
                    return StepOutcome::Exit { point, tangent };
                }
                step.length *= 0.5;
                continue;
            }

            let relaxed = self.steppoint(EvaluatedPoint::new(self.normalize(&predicted)), &step.direction, h);
            match relaxed.reason {
                RelaxReason::SmallStep => {}
                RelaxReason::Truncated => {
                    let landed = start + self.periodicity.delta(&start, &relaxed.point.uv());
                    let outward = (landed - start)
                        .try_normalize(0.0)
                        .unwrap_or(step.direction);
                    let beyond = landed + outward * (10.0 * self.settings.resolution.resabs);
                    if let Some((point, tangent)) = self.try_exit(step, beyond, sense) {
                        return StepOutcome::Exit { point, tangent };
                    }
                    step.length *= 0.5;
                    continue;
                }
                RelaxReason::Degenerate => {
                    let mut candidate = relaxed.point.clone();
                    if !candidate.failed() && candidate.is_degenerate(self.field, self.settings.resolution.resnor) {
                        return StepOutcome::Singular { near: candidate.uv() };
                    }
                    step.length *= 0.5;
                    continue;
                }
                _ => {
                    step.length *= 0.5;
                    continue;
                }
            }

            let mut to = relaxed.point;
            let chord = self.periodicity.delta(&start, &to.uv());
            let length = chord.norm();
            if length < 0.2 * h || length > 2.5 * h {
                step.length *= 0.5;
                continue;
            }
            let m = chord / length;
            let Some(c1) = to.tangent(self.field) else {
                return StepOutcome::Singular { near: to.uv() };
            };
            let along0 = sense * canonical.dot(&m);
            let along1 = sense * c1.dot(&m);
            if along0 > 0.3 && along1 < -0.3 {
                return StepOutcome::Singular {
                    near: self.normalize(&(start + chord * 0.5)),
                };
            }
            if along1.abs() < 0.3 {
                step.length *= 0.5;
                continue;
            }

            step.to = Some(to.clone());
            let quality = self.judge_step(step);
            if quality > 1.0 && 0.5 * h >= min_step {
                step.length *= (0.9 / quality).clamp(0.25, 0.8);
                continue;
            }
            log::trace!(
                "step {} accepted at ({:.6}, {:.6}), h = {h:.3e}, quality = {quality:.3}",
                step.index,
                to.uv().x,
                to.uv().y
            );
            return StepOutcome::Accepted {
                point: to,
                tangent: c1 * sense,
            };
        }
    }

    /// Locates the boundary crossing between `step.from` and the outside
    /// point `outside`; accepts it when the branch really leaves there.
    fn try_exit(
        &mut self,
        step: &Step,
        outside: Vector2<f64>,
        sense: f64,
    ) -> Option<(EvaluatedPoint, Vector2<f64>)> {
        let relaxed = self.boundary_point(&step.from, outside);
        if !relaxed.converged() {
            return None;
        }
        let mut point = relaxed.point;
        let start = step.from.uv();
        let reach = self.periodicity.distance(&start, &point.uv());
        if reach > 2.0 * step.length.max(self.min_step()) {
            return None;
        }
        let tangent = point.tangent(self.field)? * sense;
        if tangent.dot(&step.direction) <= 0.0 {
            return None;
        }
        let tol = 2.0 * self.settings.resolution.resabs;
        let leaving = self
            .domain
            .sides_near(&point.uv(), self.periodicity, tol)
            .iter()
            .all(|side| tangent.dot(&side.inward_normal()) <= 0.0);
        leaving.then_some((point, tangent))
    }
}

impl fmt::Display for StartKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StartKind::ClosedLoopCandidate => "closed_loop_candidate",
            StartKind::RestartAfterReversal => "restart_after_reversal",
            StartKind::DomainEntry => "domain_entry",
            StartKind::DomainExit => "domain_exit",
            StartKind::TerminatorForward => "terminator_forward",
            StartKind::TerminatorBackward => "terminator_backward",
            StartKind::TangentCandidate => "tangent_candidate",
        };
        f.write_str(name)
    }
}

impl FromStr for StartKind {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "closed_loop_candidate" => StartKind::ClosedLoopCandidate,
            "restart_after_reversal" => StartKind::RestartAfterReversal,
            "domain_entry" => StartKind::DomainEntry,
            "domain_exit" => StartKind::DomainExit,
            "terminator_forward" => StartKind::TerminatorForward,
            "terminator_backward" => StartKind::TerminatorBackward,
            "tangent_candidate" => StartKind::TangentCandidate,
            other => return Err(anyhow!("unknown start kind '{other}'")),
        })
    }
}

impl fmt::Display for BranchEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BranchEnd::ClosedLoop => "closed_loop",
            BranchEnd::DomainExit => "domain_exit",
            BranchEnd::Terminator(_) => "terminator",
            BranchEnd::IsolatedPoint => "isolated_point",
            BranchEnd::OutsideDomain => "outside_domain",
            BranchEnd::BothDirections => "both_directions",
            BranchEnd::SpecialTermination => "special_termination",
            BranchEnd::FailedToLeaveTerminator => "failed_to_leave_terminator",
            BranchEnd::StepLimit => "step_limit",
            BranchEnd::RelaxationFailed => "relaxation_failed",
            BranchEnd::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Parses every end name except `terminator`, which needs a key.
impl FromStr for BranchEnd {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "closed_loop" => BranchEnd::ClosedLoop,
            "domain_exit" => BranchEnd::DomainExit,
            "isolated_point" => BranchEnd::IsolatedPoint,
            "outside_domain" => BranchEnd::OutsideDomain,
            "both_directions" => BranchEnd::BothDirections,
            "special_termination" => BranchEnd::SpecialTermination,
            "failed_to_leave_terminator" => BranchEnd::FailedToLeaveTerminator,
            "step_limit" => BranchEnd::StepLimit,
            "relaxation_failed" => BranchEnd::RelaxationFailed,
            "aborted" => BranchEnd::Aborted,
            "terminator" => {
                return Err(anyhow!("terminator ends carry a key and cannot be parsed by name"))
            }
            other => return Err(anyhow!("unknown branch end '{other}'")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::ClosureField;
    use approx::assert_relative_eq;

    fn circle() -> ClosureField<impl FnMut(f64, f64) -> f64> {
        ClosureField::new(Domain::new(-1.0, 1.0, -1.0, 1.0), |u, v| u * u + v * v - 0.25)
    }

    #[test]
    fn judge_angle_is_one_at_control_angle_and_monotonic() {
        let mut field = circle();
        let tracer = Tracer::new(&mut field, ExplorationSettings::default()).unwrap();
        let alpha = tracer.settings().control_angle;
        assert_relative_eq!(tracer.judge_angle(alpha), 1.0);
        let scores: Vec<f64> = [0.1, 0.5, 1.0, 1.5, 3.0]
            .iter()
            .map(|r| tracer.judge_angle(r * alpha))
            .collect();
        assert!(scores.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn judge_step_is_one_when_the_step_turns_by_the_control_angle() {
        let mut field = circle();
        let mut tracer = Tracer::new(&mut field, ExplorationSettings::default()).unwrap();
        let alpha = tracer.settings().control_angle;
        let mut score = |theta: f64| {
            let from = tracer.eval(Vector2::new(0.5, 0.0));
            let to = tracer.eval(Vector2::new(0.5 * theta.cos(), 0.5 * theta.sin()));
            let mut step = Step::new(from, Vector2::new(0.0, 1.0), alpha);
            step.to = Some(to);
            tracer.judge_step(&mut step)
        };
        assert_relative_eq!(score(alpha), 1.0, epsilon = 1e-6);
        let scores: Vec<f64> = [0.25, 0.5, 2.0, 4.0].iter().map(|r| score(r * alpha)).collect();
        assert!(scores.windows(2).all(|w| w[0] < w[1]));
        assert_relative_eq!(scores[1], 0.5, epsilon = 1e-6);
        assert!(scores[2] > 1.0);
    }

    #[test]
    fn steplength_uses_curvature() {
        let mut field = circle();
        let mut tracer = Tracer::new(&mut field, ExplorationSettings::default()).unwrap();
        let from = tracer.eval(Vector2::new(0.5, 0.0));
        let mut step = Step::new(from, Vector2::new(0.0, 1.0), 0.08);
        assert!(tracer.steplength(&mut step));
        // curvature of a circle of radius 0.5 is 2
        assert_relative_eq!(step.length, 0.04, max_relative = 1e-4);
    }

    #[test]
    fn steplength_on_a_line_is_the_maximum() {
        let mut field = ClosureField::new(Domain::new(-1.0, 1.0, -1.0, 1.0), |u, v| u + v);
        let mut tracer = Tracer::new(&mut field, ExplorationSettings::default()).unwrap();
        let from = tracer.eval(Vector2::new(0.0, 0.0));
        let mut step = Step::new(from, Vector2::new(-1.0, 1.0).normalize(), 0.08);
        tracer.steplength(&mut step);
        assert_relative_eq!(step.length, tracer.max_step());
    }

    #[test]
    fn taken_step_lands_on_circle_within_control_angle() {
        let mut field = circle();
        let mut tracer = Tracer::new(&mut field, ExplorationSettings::default()).unwrap();
        let from = tracer.eval(Vector2::new(0.5, 0.0));
        let mut step = Step::new(from, Vector2::new(0.0, 1.0), 0.08);
        tracer.steplength(&mut step);
        match tracer.take_step(&mut step) {
            StepOutcome::Accepted { point, tangent } => {
                assert_relative_eq!(point.uv().norm(), 0.5, epsilon = 1e-8);
                assert!(point.uv().y > 0.0);
                assert!(tangent.x < 0.0);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(step.quality.unwrap() <= 1.0);
    }

    #[test]
    fn step_across_a_crossing_reports_singular() {
        let mut field = ClosureField::new(Domain::new(-1.0, 1.0, -1.0, 1.0), |u, v| u * v);
        let mut tracer = Tracer::new(&mut field, ExplorationSettings::default()).unwrap();
        let from = tracer.eval(Vector2::new(0.05, 0.0));
        let mut step = Step::new(from, Vector2::new(-1.0, 0.0), 0.08);
        step.length = 0.1;
        match tracer.take_step(&mut step) {
            StepOutcome::Singular { near } => assert!(near.norm() < 0.1),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn step_out_of_the_domain_exits_on_the_boundary() {
        let mut field = ClosureField::new(Domain::new(-1.0, 1.0, -1.0, 1.0), |_u, v| v - 0.2);
        let mut tracer = Tracer::new(&mut field, ExplorationSettings::default()).unwrap();
        let from = tracer.eval(Vector2::new(0.95, 0.2));
        let mut step = Step::new(from, Vector2::new(1.0, 0.0), 0.08);
        step.length = 0.1;
        match tracer.take_step(&mut step) {
            StepOutcome::Exit { point, tangent } => {
                assert_relative_eq!(point.uv().x, 1.0, epsilon = 1e-9);
                assert_relative_eq!(point.uv().y, 0.2, epsilon = 1e-7);
                assert!(tangent.x > 0.0);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn branch_end_names_round_trip() {
        for end in [BranchEnd::ClosedLoop, BranchEnd::FailedToLeaveTerminator, BranchEnd::Aborted] {
            assert_eq!(end.to_string().parse::<BranchEnd>().unwrap(), end);
        }
        assert!("terminator".parse::<BranchEnd>().is_err());
        assert_eq!(
            "domain_entry".parse::<StartKind>().unwrap(),
            StartKind::DomainEntry
        );
    }
}
