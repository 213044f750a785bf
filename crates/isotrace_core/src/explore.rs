//! The exploration driver: processes seeds in a fixed order, marches each
//! branch with the [`Tracer`], resolves terminators and assembles curves.

use std::f64::consts::TAU;

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

use crate::curve::{Assembler, Curve, CurveId, CurvePoint};
use crate::domain::{Domain, Side};
use crate::error::{ExploreError, Result};
use crate::field::ScalarField;
use crate::point::EvaluatedPoint;
use crate::region::RegionPartition;
use crate::registry::{
    HelpId, HelpKind, HelpPoint, Insert, Registry, Terminator, TerminatorBranch, TerminatorId,
};
use crate::relax::RelaxReason;
use crate::settings::{Completeness, ExplorationSettings};
use crate::stepper::{BranchEnd, Step, StartKind, StepOutcome, Tracer};

/// Samples on a full terminator scan circle.
const SCAN_SAMPLES: usize = 360;
/// Half-width in radians of the dense window around a double-line direction.
const TANGENT_WINDOW: f64 = 0.35;
const TANGENT_SAMPLES: usize = 256;
/// Samples per domain side during the boundary scan.
const BOUNDARY_SAMPLES: usize = 64;
/// Grid samples per axis inside one region leaf.
const LEAF_GRID: usize = 3;
const BISECTIONS: usize = 60;
/// Terminators capture a branch slightly outside their scan circle.
const CAPTURE_FACTOR: f64 = 1.05;
/// Largest angle between the approach and a branch direction for a capture.
const PASS_ANGLE: f64 = 0.5;
/// Target turning angle per step as a fraction of the control angle.
const TARGET_FRACTION: f64 = 0.8;
/// Bound on terminators chained through in composite mode.
const MAX_COMPOSITE_LINKS: usize = 64;

/// How one branch march started and why it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BranchRecord {
    pub start: StartKind,
    pub end: BranchEnd,
    /// `None` once the curve was discarded.
    pub curve: Option<CurveId>,
}

/// Everything an exploration found.
#[derive(Debug, Clone)]
pub struct Exploration {
    pub curves: Vec<Curve>,
    pub terminators: Vec<(TerminatorId, Terminator)>,
    pub isolated: Vec<Vector2<f64>>,
    pub turning_points: Vec<Vector2<f64>>,
    pub discontinuities: Vec<Vector2<f64>>,
    pub branches: Vec<BranchRecord>,
    pub errors: usize,
    /// The error budget ran out and the result is partial.
    pub aborted: bool,
}

impl Exploration {
    pub fn curve(&self, id: CurveId) -> Option<&Curve> {
        self.curves.iter().find(|c| c.id == id)
    }

    pub fn terminator(&self, id: TerminatorId) -> Option<&Terminator> {
        self.terminators
            .iter()
            .find(|(tid, _)| *tid == id)
            .map(|(_, t)| t)
    }

    pub fn closed_curves(&self) -> impl Iterator<Item = &Curve> {
        self.curves.iter().filter(|c| c.closed)
    }
}

/// Result of probing a double-line direction on two radii.
#[derive(Debug, Clone, PartialEq)]
pub struct TangentProbe {
    /// Zeros on the outer circle inside the window.
    pub departures: Vec<Vector2<f64>>,
    /// Both circles see a pair: two branches leave tangentially.
    pub tangent: bool,
}

/// Parameters of one branch march.
#[derive(Debug, Clone, Copy)]
struct March {
    direction: Vector2<f64>,
    at_end: bool,
    kind: StartKind,
    departure: Option<(TerminatorId, usize)>,
    closure: Option<Vector2<f64>>,
}

pub struct Explorer<'f, F: ScalarField + ?Sized> {
    tracer: Tracer<'f, F>,
    registry: Registry,
    assembler: Assembler,
    regions: RegionPartition,
    branches: Vec<BranchRecord>,
    last_arrival: Option<(TerminatorId, usize)>,
    aborted: bool,
}

/// Explores `field` from `seeds` in one call.
pub fn explore<F: ScalarField + ?Sized>(
    field: &mut F,
    seeds: &[HelpPoint],
    settings: ExplorationSettings,
) -> Result<Exploration> {
    let mut explorer = Explorer::new(field, settings)?;
    for seed in seeds {
        explorer.add_seed(seed.clone())?;
    }
    Ok(explorer.explore())
}

impl<'f, F: ScalarField + ?Sized> Explorer<'f, F> {
    pub fn new(field: &'f mut F, settings: ExplorationSettings) -> Result<Self> {
        let tracer = Tracer::new(field, settings)?;
        let regions = RegionPartition::new(
            tracer.domain(),
            tracer.periodicity(),
            settings.subdivision_depth,
        );
        Ok(Self {
            tracer,
            registry: Registry::new(),
            assembler: Assembler::new(),
            regions,
            branches: Vec::new(),
            last_arrival: None,
            aborted: false,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn assembler(&self) -> &Assembler {
        &self.assembler
    }

    /// Registers a caller-supplied seed. Seeds outside the domain are rejected.
    pub fn add_seed(&mut self, mut point: HelpPoint) -> Result<Insert> {
        let domain = self.tracer.domain();
        let periodicity = self.tracer.periodicity();
        let res = self.tracer.settings().resolution;
        let uv = domain.normalize(&point.uv, periodicity);
        if !domain.contains(&uv, periodicity, 10.0 * res.resabs) || !point.uv.iter().all(|x| x.is_finite()) {
            return Err(ExploreError::SeedOutsideDomain {
                u: point.uv.x,
                v: point.uv.y,
            });
        }
        point.uv = domain.clamp(&uv, periodicity);
        Ok(self.registry.add_point(&*self.tracer.field, &res, point))
    }

    /// Runs the whole exploration at the configured completeness.
    pub fn explore(mut self) -> Exploration {
        let completeness = self.tracer.settings().completeness;
        let safe_area = self.tracer.settings().safe_area;

        self.seed_discontinuities();
        for id in self.registry.unconsumed(HelpKind::Terminator) {
            if self.stop() {
                break;
            }
            self.explore_help_point(id);
        }
        for id in self.registry.unconsumed(HelpKind::Isolated) {
            if self.stop() {
                break;
            }
            self.explore_help_point(id);
        }
        if completeness >= Completeness::Boundaries && !self.stop() {
            self.scan_boundaries();
        }
        self.run_pending();

        if completeness >= Completeness::Subdivide && !safe_area && !self.stop() {
            self.seed_subdivision();
            self.run_pending();
        }
        if completeness >= Completeness::Everything && !safe_area && !self.stop() {
            self.search_stationary_points();
            self.run_pending();
        }
        self.coalesce_terminators();
        log::debug!(
            "exploration finished: {} curves, {} terminators, {} errors",
            self.assembler.len(),
            self.registry.terminators().count(),
            self.tracer.errors()
        );
        self.into_exploration()
    }

    /// Explores one registered seed according to its kind.
    pub fn explore_help_point(&mut self, id: HelpId) {
        let Some(seed) = self.registry.point(id).cloned() else {
            return;
        };
        self.registry.consume(id);
        self.last_arrival = None;
        match seed.kind {
            HelpKind::Entry | HelpKind::Exit => self.explore_boundary_seed(&seed),
            HelpKind::Help => {
                if let Some(curve) = self.explore_interior_seed(seed.uv) {
                    if self.tracer.settings().completeness == Completeness::CompositeBranch {
                        self.continue_composite(curve);
                    }
                }
            }
            HelpKind::Terminator => self.explore_supplied_terminator(seed.uv),
            HelpKind::Isolated => self.verify_isolated(id, seed.uv),
            HelpKind::Flat | HelpKind::TurningPoint => {}
        }
    }

    fn stop(&mut self) -> bool {
        if self.aborted {
            return true;
        }
        if self.tracer.error_budget_exhausted() {
            log::warn!(
                "error budget of {} exhausted, returning a partial exploration",
                self.tracer.settings().error_threshold
            );
            self.aborted = true;
            return true;
        }
        self.tracer.settings().completeness <= Completeness::CompositeBranch
            && !self.branches.is_empty()
    }

    /// Processes boundary seeds, help seeds and open terminator branches
    /// until none remain.
    fn run_pending(&mut self) {
        loop {
            if self.stop() {
                return;
            }
            let next = [HelpKind::Entry, HelpKind::Exit, HelpKind::Help]
                .into_iter()
                .find_map(|kind| self.registry.unconsumed(kind).first().copied());
            if let Some(id) = next {
                self.explore_help_point(id);
                continue;
            }
            if let Some((tid, idx)) = self.next_open_branch() {
                self.explore_terminator_branch(tid, idx);
                continue;
            }
            return;
        }
    }

    fn next_open_branch(&self) -> Option<(TerminatorId, usize)> {
        let discovered = self.tracer.settings().completeness >= Completeness::Boundaries;
        self.registry
            .terminators()
            .filter(|(_, t)| t.supplied || discovered)
            .find_map(|(tid, t)| t.unvisited().next().map(|(idx, _)| (tid, idx)))
    }

    fn default_radius(&self) -> f64 {
        self.tracer.settings().terminator_radius * self.tracer.domain().diagonal()
    }

    fn merge_floor(&self) -> f64 {
        10.0 * self.tracer.settings().resolution.resabs
    }

    /// Seed consumption tolerance around a segment of length `seg`.
    fn segment_tolerance(&self, seg: f64) -> f64 {
        0.5 * self.tracer.settings().control_angle * seg + self.merge_floor()
    }

    fn on_existing_curve(&self, uv: &Vector2<f64>) -> bool {
        self.assembler.on_existing_curve(
            self.tracer.periodicity(),
            uv,
            self.tracer.settings().control_angle,
            self.merge_floor(),
        )
    }

    /// Square of half-width `w` around `center`, cut to the domain on
    /// non-periodic axes.
    fn local_box(&self, center: &Vector2<f64>, w: f64) -> Domain {
        let domain = self.tracer.domain();
        let periodicity = self.tracer.periodicity();
        let mut bounds = Domain::new(center.x - w, center.x + w, center.y - w, center.y + w);
        if !periodicity.u {
            bounds.umin = bounds.umin.max(domain.umin);
            bounds.umax = bounds.umax.min(domain.umax);
        }
        if !periodicity.v {
            bounds.vmin = bounds.vmin.max(domain.vmin);
            bounds.vmax = bounds.vmax.min(domain.vmax);
        }
        bounds
    }

    fn capture_radius(&self, terminator: &Terminator) -> f64 {
        let radius = terminator.scan_radius.max(terminator.flat_extent);
        let radius = if radius > 0.0 { radius } else { self.default_radius() };
        CAPTURE_FACTOR * radius
    }

    fn terminator_near(&self, uv: &Vector2<f64>) -> Option<TerminatorId> {
        let periodicity = self.tracer.periodicity();
        let limit = (0.5 * self.default_radius()).max(self.merge_floor());
        self.registry
            .terminators()
            .map(|(tid, t)| (tid, periodicity.distance(&t.uv, uv)))
            .filter(|(_, d)| *d <= limit)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(tid, _)| tid)
    }

    fn isolated_near(&self, uv: &Vector2<f64>) -> bool {
        let periodicity = self.tracer.periodicity();
        let limit = (0.5 * self.default_radius()).max(self.merge_floor());
        self.registry
            .points()
            .any(|(_, p)| p.kind == HelpKind::Isolated && periodicity.distance(&p.uv, uv) <= limit)
    }

    /// Appends or prepends a point travelled along `travel`; the stored
    /// tangent follows the curve's own orientation.
    fn commit(
        &mut self,
        point: EvaluatedPoint,
        travel: Vector2<f64>,
        at_end: bool,
        terminator: Option<TerminatorId>,
    ) {
        let uv = point.uv();
        let tangent = if at_end { travel } else { -travel };
        let mut curve_point = CurvePoint::new(point, tangent);
        curve_point.on_boundary = self.tracer.on_boundary(&uv);
        curve_point.terminator = terminator;
        self.regions.tick(&uv);
        self.assembler
            .add_curve_point(&mut *self.tracer.field, curve_point, at_end);
    }

    /// Finishes the current curve, discarding it when a march was ambiguous
    /// or it never got anywhere.
    fn finish_current(&mut self) -> Option<CurveId> {
        let curve = self.assembler.current()?;
        let spoiled = [curve.head, curve.tail].iter().any(|end| {
            matches!(
                end,
                Some(BranchEnd::BothDirections) | Some(BranchEnd::FailedToLeaveTerminator)
            )
        });
        let closed = curve.tail == Some(BranchEnd::ClosedLoop);
        let (id, len) = (curve.id, curve.len());
        if (spoiled || len < 2) && self.assembler.abort_curve() {
            log::debug!("discarded curve with {len} points");
            return None;
        }
        let finished = self.assembler.finish_curve(closed);
        log::debug!("finished curve {id:?} with {len} points, closed = {closed}");
        finished
    }

    fn explore_interior_seed(&mut self, uv: Vector2<f64>) -> Option<CurveId> {
        let resnor = self.tracer.settings().resolution.resnor;
        let mut point = self.tracer.eval(uv);
        if !self.tracer.is_zero(&mut point) {
            let domain = self.tracer.domain();
            let relaxed = self.tracer.nearpoint(point, &domain);
            if relaxed.reason == RelaxReason::Degenerate {
                let mut stuck = relaxed.point;
                if self.tracer.is_zero(&mut stuck) {
                    self.explore_supplied_terminator(stuck.uv());
                } else {
                    self.tracer
                        .record_error("seed sits on a stationary point off the zero set");
                }
                return None;
            }
            if !relaxed.converged() {
                self.tracer
                    .record_error("seed did not relax onto the zero set");
                return None;
            }
            point = relaxed.point;
        }
        if point.is_degenerate(&mut *self.tracer.field, resnor) {
            self.explore_supplied_terminator(point.uv());
            return None;
        }
        if self.on_existing_curve(&point.uv()) {
            return None;
        }
        let tangent = point.tangent(&mut *self.tracer.field)?;

        self.assembler.start_new_curve(false);
        self.commit(point.clone(), tangent, true, None);
        let forward = self.march(
            point.clone(),
            March {
                direction: tangent,
                at_end: true,
                kind: StartKind::ClosedLoopCandidate,
                departure: None,
                closure: Some(point.uv()),
            },
        );
        match forward {
            BranchEnd::ClosedLoop => self.assembler.set_end(false, BranchEnd::ClosedLoop),
            BranchEnd::Aborted => {}
            _ => {
                self.march(
                    point,
                    March {
                        direction: -tangent,
                        at_end: false,
                        kind: StartKind::RestartAfterReversal,
                        departure: None,
                        closure: None,
                    },
                );
            }
        }
        self.finish_current()
    }

    fn explore_boundary_seed(&mut self, seed: &HelpPoint) {
        let domain = self.tracer.domain();
        let periodicity = self.tracer.periodicity();
        let resabs = self.tracer.settings().resolution.resabs;
        let resnor = self.tracer.settings().resolution.resnor;
        let sides = domain.sides_near(&seed.uv, periodicity, 4.0 * resabs);

        let mut point = self.tracer.eval(seed.uv);
        if !self.tracer.is_zero(&mut point) {
            let Some(&side) = sides.first() else {
                self.explore_interior_seed(seed.uv);
                return;
            };
            let reach = self.tracer.max_step();
            let relaxed = self.tracer.relax_on_side(seed.uv, side, reach);
            if !relaxed.converged() {
                self.tracer
                    .record_error("boundary seed did not relax along its side");
                return;
            }
            point = relaxed.point;
        }
        if point.is_degenerate(&mut *self.tracer.field, resnor) {
            self.explore_supplied_terminator(point.uv());
            return;
        }
        if self.on_existing_curve(&point.uv()) {
            return;
        }
        let Some(canonical) = point.tangent(&mut *self.tracer.field) else {
            return;
        };
        let inward = sides
            .iter()
            .fold(Vector2::<f64>::zeros(), |acc, side| acc + side.inward_normal());
        let sense = match inward.try_normalize(0.0) {
            Some(n) => canonical.dot(&n),
            None if seed.kind == HelpKind::Entry => 1.0,
            None => -1.0,
        };
        if sense.abs() < 1e-3 {
            self.explore_interior_seed(point.uv());
            return;
        }

        self.assembler.start_new_curve(false);
        if sense > 0.0 {
            self.commit(point.clone(), canonical, true, None);
            self.assembler.set_end(false, BranchEnd::DomainExit);
            self.march(
                point,
                March {
                    direction: canonical,
                    at_end: true,
                    kind: StartKind::DomainEntry,
                    departure: None,
                    closure: None,
                },
            );
        } else {
            self.commit(point.clone(), -canonical, false, None);
            self.assembler.set_end(true, BranchEnd::DomainExit);
            self.march(
                point,
                March {
                    direction: -canonical,
                    at_end: false,
                    kind: StartKind::DomainExit,
                    departure: None,
                    closure: None,
                },
            );
        }
        self.finish_current();
    }

    /// Resolves a caller-supplied singular point and traces every branch
    /// leaving it.
    fn explore_supplied_terminator(&mut self, uv: Vector2<f64>) {
        let bounds = self.local_box(&uv, self.default_radius());
        let start = self.tracer.eval(uv);
        let relaxed = self.tracer.second_order_point(start, &bounds);
        let mut point = if relaxed.converged() {
            relaxed.point
        } else {
            self.tracer.eval(uv)
        };
        if !self.tracer.is_zero(&mut point) {
            self.tracer
                .record_error("supplied terminator is not on the zero set");
            return;
        }
        let uv = point.uv();
        if let Some(tid) = self.terminator_near(&uv) {
            if let Some(existing) = self.registry.terminator_mut(tid) {
                existing.supplied = true;
            }
            self.explore_branches_of(tid);
            return;
        }
        let mut terminator = self.analyze_terminator(uv, false);
        terminator.supplied = true;
        if terminator.branches.is_empty() {
            let res = self.tracer.settings().resolution;
            self.registry
                .add_point(&*self.tracer.field, &res, HelpPoint::isolated(uv));
            return;
        }
        let res = self.tracer.settings().resolution;
        let (tid, _) = self
            .registry
            .add_terminator(&*self.tracer.field, &res, terminator);
        self.explore_branches_of(tid);
    }

    fn explore_branches_of(&mut self, tid: TerminatorId) {
        while !self.stop() {
            let Some(idx) = self
                .registry
                .terminator(tid)
                .and_then(|t| t.unvisited().next().map(|(idx, _)| idx))
            else {
                return;
            };
            self.explore_terminator_branch(tid, idx);
        }
    }

    /// Relaxes a supplied isolated point; unresolved ones are kept as given.
    fn verify_isolated(&mut self, id: HelpId, uv: Vector2<f64>) {
        let bounds = self.local_box(&uv, self.default_radius());
        let start = self.tracer.eval(uv);
        let relaxed = self.tracer.second_order_point(start, &bounds);
        if relaxed.converged() {
            if let Some(point) = self.registry.point_mut(id) {
                point.uv = relaxed.point.uv();
            }
        }
    }

    /// Traces branch `idx` of `tid` away from the terminator. The curve is
    /// oriented along the canonical tangent whichever way it leaves.
    pub fn explore_terminator_branch(
        &mut self,
        tid: TerminatorId,
        idx: usize,
    ) -> Option<(CurveId, BranchEnd)> {
        let terminator = self.registry.terminator(tid)?.clone();
        let branch = terminator.branches.get(idx)?.clone();
        if let Some(t) = self.registry.terminator_mut(tid) {
            t.branches[idx].visited = true;
        }
        let mut start = self.tracer.eval(branch.start);
        let Some(canonical) = start.tangent(&mut *self.tracer.field) else {
            self.tracer
                .record_error("terminator branch starts at a degenerate point");
            return None;
        };
        let forward = canonical.dot(&branch.direction) >= 0.0;
        let kind = match (branch.tangent, forward) {
            (true, _) => StartKind::TangentCandidate,
            (false, true) => StartKind::TerminatorForward,
            (false, false) => StartKind::TerminatorBackward,
        };
        let travel = if forward { canonical } else { -canonical };

        self.assembler.start_new_curve(branch.tangent);
        let center = self.tracer.eval(terminator.uv);
        self.commit(center, branch.direction, forward, Some(tid));
        self.commit(start.clone(), travel, forward, None);
        self.assembler
            .set_end(!forward, BranchEnd::Terminator(tid));
        let end = self.march(
            start,
            March {
                direction: travel,
                at_end: forward,
                kind,
                departure: Some((tid, idx)),
                closure: None,
            },
        );
        let id = self.finish_current()?;
        Some((id, end))
    }

    /// Keeps going straight through each terminator the curve ends at.
    fn continue_composite(&mut self, mut previous: CurveId) {
        for _ in 0..MAX_COMPOSITE_LINKS {
            let Some((tid, arrived)) = self.last_arrival.take() else {
                return;
            };
            if self.tracer.error_budget_exhausted() {
                return;
            }
            let Some(terminator) = self.registry.terminator(tid) else {
                return;
            };
            let incoming = terminator.branches[arrived].direction;
            let straight = terminator
                .unvisited()
                .map(|(idx, b)| (idx, -b.direction.dot(&incoming)))
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(idx, _)| idx);
            let Some(idx) = straight else {
                return;
            };
            let Some((id, end)) = self.explore_terminator_branch(tid, idx) else {
                return;
            };
            self.assembler.link(previous, id);
            previous = id;
            if !matches!(end, BranchEnd::Terminator(_)) {
                return;
            }
        }
    }

    /// Follows one branch from `start` until it stops, recording the end
    /// on the current curve.
    fn march(&mut self, start: EvaluatedPoint, m: March) -> BranchEnd {
        let periodicity = self.tracer.periodicity();
        let settings = *self.tracer.settings();
        let target = TARGET_FRACTION * settings.control_angle;
        let mut step = Step::new(start, m.direction, target);
        let mut travelled = 0.0;
        let mut cap = f64::INFINITY;

        let end = loop {
            if self.tracer.error_budget_exhausted() {
                break BranchEnd::Aborted;
            }
            if step.index >= settings.max_steps {
                self.tracer.record_error("step limit reached");
                break BranchEnd::StepLimit;
            }
            self.tracer.steplength(&mut step);
            step.length = step.length.min(cap);
            if self.tracer.field().special_termination(&step) {
                break BranchEnd::SpecialTermination;
            }
            let p = step.from.uv();
            let ahead = p + step.direction * step.length;
            if let Some(tid) = self.captured_by(&p, &ahead, &step.direction) {
                break self.arrive(tid, &p, &step.direction, &m, travelled);
            }

            match self.tracer.take_step(&mut step) {
                StepOutcome::Accepted { point, tangent } => {
                    let q = point.uv();
                    let seg = periodicity.distance(&p, &q);
                    let tol = self.segment_tolerance(seg);
                    self.registry.consume_near_segment(periodicity, &p, &q, tol);
                    if let Some(origin) = m.closure {
                        let (d, _) = periodicity.segment_distance(&origin, &p, &q);
                        if step.index >= 2 && d <= tol && tangent.dot(&m.direction) > 0.5 {
                            let first = self.assembler.current().and_then(|c| c.first().cloned());
                            if let Some(first) = first {
                                self.assembler
                                    .add_curve_point(&mut *self.tracer.field, first, true);
                            }
                            break BranchEnd::ClosedLoop;
                        }
                    }
                    self.commit(point.clone(), tangent, m.at_end, None);
                    travelled += seg;
                    cap = f64::INFINITY;
                    step.advance(point, tangent);
                }
                StepOutcome::Exit { point, tangent } => {
                    let q = point.uv();
                    let tol = self.segment_tolerance(periodicity.distance(&p, &q));
                    self.registry.consume_near_segment(periodicity, &p, &q, tol);
                    self.commit(point, tangent, m.at_end, None);
                    break BranchEnd::DomainExit;
                }
                StepOutcome::Singular { near } => {
                    if let Some(end) = self.resolve_singular(near, &p, &step.direction, &m, travelled) {
                        break end;
                    }
                    cap = 0.5 * step.length;
                    if cap < self.tracer.min_step() {
                        self.tracer.record_error("could not step past a singular point");
                        break BranchEnd::RelaxationFailed;
                    }
                }
                StepOutcome::Failed => {
                    self.tracer.record_error("no acceptable step");
                    break BranchEnd::RelaxationFailed;
                }
            }
        };

        self.assembler.set_end(m.at_end, end);
        self.branches.push(BranchRecord {
            start: m.kind,
            end,
            curve: self.assembler.current_id(),
        });
        log::debug!("{} branch ended with {} after {} steps", m.kind, end, step.index);
        end
    }

    /// The terminator whose capture circle the segment `p -> ahead` enters
    /// while heading toward it along one of its branches.
    fn captured_by(
        &self,
        p: &Vector2<f64>,
        ahead: &Vector2<f64>,
        direction: &Vector2<f64>,
    ) -> Option<TerminatorId> {
        let periodicity = self.tracer.periodicity();
        let mut best: Option<(TerminatorId, f64)> = None;
        for (tid, t) in self.registry.terminators() {
            let (d, _) = periodicity.segment_distance(&t.uv, p, ahead);
            if d > self.capture_radius(t) {
                continue;
            }
            if periodicity.delta(p, &t.uv).dot(direction) <= 0.0 {
                continue;
            }
            let from_t = periodicity.delta(&t.uv, p);
            let approach = from_t.try_normalize(0.0).unwrap_or(-direction);
            match t.closest_branch(&approach) {
                Some((_, angle)) if angle <= PASS_ANGLE => {}
                _ => continue,
            }
            if best.map_or(true, |(_, bd)| d < bd) {
                best = Some((tid, d));
            }
        }
        best.map(|(tid, _)| tid)
    }

    /// Ends the march at `tid`: marks the arrival branch and appends its
    /// start point (when still ahead) and the terminator itself.
    fn arrive(
        &mut self,
        tid: TerminatorId,
        p: &Vector2<f64>,
        direction: &Vector2<f64>,
        m: &March,
        travelled: f64,
    ) -> BranchEnd {
        let periodicity = self.tracer.periodicity();
        let resabs = self.tracer.settings().resolution.resabs;
        let Some(terminator) = self.registry.terminator(tid).cloned() else {
            return BranchEnd::RelaxationFailed;
        };
        let radius = self.capture_radius(&terminator);
        let from_t = periodicity.delta(&terminator.uv, p);
        let approach = from_t.try_normalize(0.0).unwrap_or(-direction);
        let Some((idx, _)) = terminator.closest_branch(&approach) else {
            return BranchEnd::IsolatedPoint;
        };
        let branch = terminator.branches[idx].clone();

        if let Some((departed, _)) = m.departure {
            if departed == tid && travelled < 2.0 * radius {
                if let Some(t) = self.registry.terminator_mut(tid) {
                    t.branches[idx].visited = true;
                }
                return BranchEnd::FailedToLeaveTerminator;
            }
        }
        if branch.visited {
            self.tracer
                .record_error("branch reached a terminator along a traced direction");
            return BranchEnd::BothDirections;
        }
        if let Some(t) = self.registry.terminator_mut(tid) {
            t.branches[idx].visited = true;
        }
        self.last_arrival = Some((tid, idx));

        if from_t.norm() > periodicity.distance(&terminator.uv, &branch.start) + resabs {
            let mut start = self.tracer.eval(branch.start);
            let travel = match start.tangent(&mut *self.tracer.field) {
                Some(t) if t.dot(&branch.direction) > 0.0 => -t,
                Some(t) => t,
                None => -branch.direction,
            };
            self.commit(start, travel, m.at_end, None);
        }
        let center = self.tracer.eval(terminator.uv);
        self.commit(center, -branch.direction, m.at_end, Some(tid));
        BranchEnd::Terminator(tid)
    }

    /// Locates the singular point a step ran into. `None` when it cannot be
    /// resolved and the step should be retried shorter.
    fn resolve_singular(
        &mut self,
        near: Vector2<f64>,
        p: &Vector2<f64>,
        direction: &Vector2<f64>,
        m: &March,
        travelled: f64,
    ) -> Option<BranchEnd> {
        if let Some(tid) = self.terminator_near(&near) {
            return Some(self.arrive(tid, p, direction, m, travelled));
        }
        let periodicity = self.tracer.periodicity();
        let w = self
            .default_radius()
            .max(2.0 * periodicity.distance(p, &near));
        let bounds = self.local_box(&near, w);
        let start = self.tracer.eval(near);
        let relaxed = self.tracer.second_order_point(start, &bounds);
        if !relaxed.converged() {
            return None;
        }
        let uv = relaxed.point.uv();
        if let Some(tid) = self.terminator_near(&uv) {
            return Some(self.arrive(tid, p, direction, m, travelled));
        }

        let terminator = self.analyze_terminator(uv, false);
        let res = self.tracer.settings().resolution;
        if terminator.branches.is_empty() {
            self.registry
                .add_point(&*self.tracer.field, &res, HelpPoint::isolated(uv));
            if m.kind != StartKind::TangentCandidate {
                log::warn!(
                    "branch ran into an isolated point at ({:.6}, {:.6}); terminator misclassified",
                    uv.x,
                    uv.y
                );
                self.tracer.record_error("isolated point on a non-tangent branch");
            }
            let travel = periodicity
                .delta(p, &uv)
                .try_normalize(0.0)
                .unwrap_or(*direction);
            self.commit(relaxed.point, travel, m.at_end, None);
            return Some(BranchEnd::IsolatedPoint);
        }
        let (tid, _) = self
            .registry
            .add_terminator(&*self.tracer.field, &res, terminator);
        Some(self.arrive(tid, p, direction, m, travelled))
    }

    /// Scans a circle around `uv` for the branches leaving it. A terminator
    /// without branches is an isolated zero.
    pub fn analyze_terminator(&mut self, uv: Vector2<f64>, discontinuity: bool) -> Terminator {
        let periodicity = self.tracer.periodicity();
        let res = self.tracer.settings().resolution;
        let radius = self.default_radius();
        let mut center = self.tracer.eval(uv);
        let conic = center.conic(&mut *self.tracer.field);
        let flat_extent = conic.map_or(0.0, |c| c.flat_extent(res.epsilon).min(0.5 * radius));

        let mut roots = self.scan_circle(&uv, radius, 0.0, TAU, SCAN_SAMPLES);
        let mut tangent_roots = Vec::new();
        if !discontinuity {
            if let Some(conic) = conic {
                if conic.curvatures.abs().max() <= res.resnor {
                    self.registry
                        .add_point(&*self.tracer.field, &res, HelpPoint::flat(uv));
                }
                let candidates = conic.asymptotes(res.resnor);
                if candidates.len() == 2 {
                    for direction in candidates {
                        let scan = self.tangent_explore(&uv, &direction, radius);
                        roots.retain(|r| {
                            let d = periodicity.delta(&uv, r);
                            d.angle(&direction) > TANGENT_WINDOW
                        });
                        if scan.tangent {
                            tangent_roots.extend(scan.departures.iter().copied());
                        }
                        roots.extend(scan.departures);
                    }
                }
            }
        }

        let mut branches: Vec<TerminatorBranch> = roots
            .into_iter()
            .filter_map(|start| {
                let direction = periodicity.delta(&uv, &start).try_normalize(0.0)?;
                Some(TerminatorBranch {
                    direction,
                    start,
                    visited: false,
                    tangent: tangent_roots
                        .iter()
                        .any(|t| periodicity.distance(t, &start) <= res.resabs),
                })
            })
            .collect();
        branches.sort_by(|a, b| {
            a.direction
                .y
                .atan2(a.direction.x)
                .total_cmp(&b.direction.y.atan2(b.direction.x))
        });
        log::debug!(
            "terminator at ({:.6}, {:.6}) has {} branches",
            uv.x,
            uv.y,
            branches.len()
        );
        Terminator {
            uv,
            branches,
            flat_extent,
            scan_radius: radius,
            discontinuity,
            supplied: false,
        }
    }

    /// Counts departures near a double-line direction on two radii.
    pub fn tangent_explore(
        &mut self,
        center: &Vector2<f64>,
        direction: &Vector2<f64>,
        radius: f64,
    ) -> TangentProbe {
        let theta = direction.y.atan2(direction.x);
        let from = theta - TANGENT_WINDOW;
        let span = 2.0 * TANGENT_WINDOW;
        let departures = self.scan_circle(center, radius, from, span, TANGENT_SAMPLES);
        let inner = self.scan_circle(center, 0.5 * radius, from, span, TANGENT_SAMPLES);
        let tangent = departures.len() >= 2 && inner.len() >= 2;
        TangentProbe {
            departures,
            tangent,
        }
    }

    /// Zeros of the field on the arc `from .. from + span` of the circle
    /// around `center`, located by sign changes between samples.
    fn scan_circle(
        &mut self,
        center: &Vector2<f64>,
        radius: f64,
        from: f64,
        span: f64,
        samples: usize,
    ) -> Vec<Vector2<f64>> {
        let closed = span >= TAU - 1e-12;
        let count = if closed { samples } else { samples + 1 };
        let at = |theta: f64| center + Vector2::new(theta.cos(), theta.sin()) * radius;
        let angle = |k: usize| from + span * k as f64 / samples as f64;

        let values: Vec<Option<f64>> = (0..count)
            .map(|k| {
                let p = at(angle(k));
                if self.tracer.inside(&p) {
                    self.tracer.value_at(&p)
                } else {
                    None
                }
            })
            .collect();

        let mut found = Vec::new();
        for k in 0..count {
            let next = if closed { (k + 1) % count } else { k + 1 };
            let Some(fa) = values[k] else { continue };
            if fa == 0.0 {
                found.push(at(angle(k)));
                continue;
            }
            let Some(Some(fb)) = values.get(next).copied() else {
                continue;
            };
            if fa * fb >= 0.0 {
                continue;
            }
            let (mut lo, mut hi) = (angle(k), angle(k) + span / samples as f64);
            for _ in 0..BISECTIONS {
                let mid = 0.5 * (lo + hi);
                match self.tracer.value_at(&at(mid)) {
                    Some(fm) if fm * fa > 0.0 => lo = mid,
                    Some(_) => hi = mid,
                    None => break,
                }
            }
            found.push(at(0.5 * (lo + hi)));
        }

        let periodicity = self.tracer.periodicity();
        let domain = self.tracer.domain();
        let mut roots: Vec<Vector2<f64>> = Vec::new();
        for root in found {
            let mut point = self.tracer.eval(root);
            let root = if self.tracer.is_zero(&mut point) {
                point.uv()
            } else {
                let relaxed = self.tracer.nearpoint(point, &domain);
                let d = periodicity.distance(center, &relaxed.point.uv());
                if !relaxed.converged() || d < 0.5 * radius || d > 1.5 * radius {
                    continue;
                }
                relaxed.point.uv()
            };
            if roots
                .iter()
                .all(|r| periodicity.distance(r, &root) > 1e-3 * radius)
            {
                roots.push(root);
            }
        }
        roots
    }

    /// Finds where the zero set crosses the rectangle sides and registers
    /// the crossings as entry or exit seeds.
    fn scan_boundaries(&mut self) {
        let domain = self.tracer.domain();
        let periodicity = self.tracer.periodicity();
        let res = self.tracer.settings().resolution;
        let reach = self.tracer.max_step();

        for side in Side::ALL {
            if periodicity.axis(side.fixed_axis()) {
                continue;
            }
            let at = |t: f64| domain.point_on_side(side, t);
            let values: Vec<Option<f64>> = (0..=BOUNDARY_SAMPLES)
                .map(|k| {
                    let p = at(k as f64 / BOUNDARY_SAMPLES as f64);
                    if self.tracer.inside(&p) {
                        self.tracer.value_at(&p)
                    } else {
                        None
                    }
                })
                .collect();

            for k in 0..=BOUNDARY_SAMPLES {
                let Some(fa) = values[k] else { continue };
                let t0 = k as f64 / BOUNDARY_SAMPLES as f64;
                let guess = if fa == 0.0 {
                    at(t0)
                } else {
                    let Some(Some(fb)) = values.get(k + 1).copied() else {
                        continue;
                    };
                    if fa * fb >= 0.0 {
                        continue;
                    }
                    let (mut lo, mut hi) = (t0, (k + 1) as f64 / BOUNDARY_SAMPLES as f64);
                    for _ in 0..BISECTIONS {
                        let mid = 0.5 * (lo + hi);
                        match self.tracer.value_at(&at(mid)) {
                            Some(fm) if fm * fa > 0.0 => lo = mid,
                            Some(_) => hi = mid,
                            None => break,
                        }
                    }
                    at(0.5 * (lo + hi))
                };
                let relaxed = self.tracer.relax_on_side(guess, side, reach);
                if !relaxed.converged() {
                    continue;
                }
                let mut point = relaxed.point;
                let uv = point.uv();
                if !self.tracer.inside(&uv) {
                    continue;
                }
                let seed = match point.tangent(&mut *self.tracer.field) {
                    Some(tangent) if tangent.dot(&side.inward_normal()) > 0.0 => {
                        HelpPoint::entry(uv, tangent)
                    }
                    Some(tangent) => HelpPoint::exit(uv, tangent),
                    None => HelpPoint::terminator(uv),
                };
                self.registry.add_point(&*self.tracer.field, &res, seed);
            }
        }
        log::debug!(
            "boundary scan registered {} entries and {} exits",
            self.registry.of_kind(HelpKind::Entry).len(),
            self.registry.of_kind(HelpKind::Exit).len()
        );
        for id in self.registry.unconsumed(HelpKind::Terminator) {
            self.explore_help_point(id);
        }
    }

    /// Seeds every sign change on a coarse grid inside each leaf no curve
    /// has visited.
    fn seed_subdivision(&mut self) {
        let res = self.tracer.settings().resolution;
        let leaves = self.regions.unvisited_leaves();
        let mut added = 0usize;
        for id in leaves {
            let Some(bounds) = self.regions.region(id).map(|r| r.bounds) else {
                continue;
            };
            let grid = |i: usize, j: usize| {
                let s = (LEAF_GRID - 1) as f64;
                Vector2::new(
                    bounds.umin + bounds.width() * i as f64 / s,
                    bounds.vmin + bounds.height() * j as f64 / s,
                )
            };
            let mut pairs = Vec::new();
            for i in 0..LEAF_GRID {
                for j in 0..LEAF_GRID {
                    if i + 1 < LEAF_GRID {
                        pairs.push((grid(i, j), grid(i + 1, j)));
                    }
                    if j + 1 < LEAF_GRID {
                        pairs.push((grid(i, j), grid(i, j + 1)));
                    }
                }
            }
            for (a, b) in pairs {
                if let Some(uv) = self.bisect_segment(a, b) {
                    if let Insert::Added(_) =
                        self.registry
                            .add_point(&*self.tracer.field, &res, HelpPoint::help(uv))
                    {
                        added += 1;
                    }
                }
            }
        }
        log::debug!("subdivision added {added} seeds");
    }

    /// A zero on `a -> b` when the field changes sign along it.
    fn bisect_segment(&mut self, a: Vector2<f64>, b: Vector2<f64>) -> Option<Vector2<f64>> {
        if !self.tracer.inside(&a) || !self.tracer.inside(&b) {
            return None;
        }
        let fa = self.tracer.value_at(&a)?;
        if fa == 0.0 {
            return Some(a);
        }
        let fb = self.tracer.value_at(&b)?;
        if fa * fb >= 0.0 {
            return None;
        }
        let (mut lo, mut hi) = (a, b);
        for _ in 0..BISECTIONS {
            let mid = 0.5 * (lo + hi);
            match self.tracer.value_at(&mid) {
                Some(fm) if fm * fa > 0.0 => lo = mid,
                Some(_) => hi = mid,
                None => return None,
            }
        }
        Some(0.5 * (lo + hi))
    }

    /// Looks for stationary points in every leaf: zeros among them are
    /// terminators or isolated points, the rest are turning points.
    fn search_stationary_points(&mut self) {
        let res = self.tracer.settings().resolution;
        let safe = self.tracer.field().safe_range();
        for id in self.regions.leaves() {
            if self.stop() {
                return;
            }
            let Some(bounds) = self.regions.region(id).map(|r| r.bounds) else {
                continue;
            };
            if let Some(s) = safe {
                let disjoint = s.umax < bounds.umin
                    || s.umin > bounds.umax
                    || s.vmax < bounds.vmin
                    || s.vmin > bounds.vmax;
                if disjoint {
                    continue;
                }
            }
            let start = self.tracer.eval(bounds.center());
            let relaxed = self.tracer.turning_point(start, &bounds);
            if !relaxed.converged() {
                continue;
            }
            let mut point = relaxed.point;
            let uv = point.uv();
            if !self.tracer.inside(&uv) {
                continue;
            }
            if !self.tracer.is_zero(&mut point) {
                self.registry
                    .add_point(&*self.tracer.field, &res, HelpPoint::turning_point(uv));
                continue;
            }
            if self.terminator_near(&uv).is_some() || self.isolated_near(&uv) {
                continue;
            }
            let terminator = self.analyze_terminator(uv, false);
            if terminator.branches.is_empty() {
                self.registry
                    .add_point(&*self.tracer.field, &res, HelpPoint::isolated(uv));
            } else {
                self.registry
                    .add_terminator(&*self.tracer.field, &res, terminator);
            }
        }
    }

    /// Turns reported discontinuities on the zero set into terminators so
    /// curves stop there instead of stepping across.
    fn seed_discontinuities(&mut self) {
        let res = self.tracer.settings().resolution;
        let discontinuities = self.tracer.field().discontinuities();
        for uv in discontinuities {
            let uv = self.tracer.normalize(&uv);
            self.registry.add_discontinuity(uv);
            let Some(value) = self.tracer.value_at(&uv) else {
                continue;
            };
            if !self.tracer.field().fvals_equal(value, 0.0, &res) {
                continue;
            }
            let mut terminator = self.analyze_terminator(uv, true);
            terminator.supplied = true;
            if !terminator.branches.is_empty() {
                self.registry
                    .add_terminator(&*self.tracer.field, &res, terminator);
            }
        }
    }

    /// Folds terminators that turned out to be the same point and
    /// re-points the curves that referenced the dropped ones.
    fn coalesce_terminators(&mut self) {
        let res = self.tracer.settings().resolution;
        let ids = self.registry.terminator_ids();
        for (i, &keep) in ids.iter().enumerate() {
            for &other in &ids[i + 1..] {
                let (Some(a), Some(b)) = (self.registry.terminator(keep), self.registry.terminator(other))
                else {
                    continue;
                };
                if !self.tracer.field.terminators_equal(a, b, &res) {
                    continue;
                }
                let folded = if b.branches.is_empty() {
                    self.registry.replace_terminator(other, keep)
                } else {
                    self.registry.merge_terminators(keep, other)
                };
                if folded {
                    self.assembler.replace_terminator(other, keep);
                }
            }
        }
    }

    fn into_exploration(self) -> Exploration {
        let uvs = |kind: HelpKind| -> Vec<Vector2<f64>> {
            self.registry
                .points()
                .filter(|(_, p)| p.kind == kind)
                .map(|(_, p)| p.uv)
                .collect()
        };
        let isolated = uvs(HelpKind::Isolated);
        let turning_points = uvs(HelpKind::TurningPoint);
        let terminators = self
            .registry
            .terminators()
            .map(|(id, t)| (id, t.clone()))
            .collect();
        let discontinuities = self.registry.discontinuities().to_vec();
        let errors = self.tracer.errors();
        Exploration {
            curves: self.assembler.into_curves(),
            terminators,
            isolated,
            turning_points,
            discontinuities,
            branches: self.branches,
            errors,
            aborted: self.aborted,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Periodicity;
    use crate::expression::ExpressionField;
    use crate::field::FieldSample;
    use crate::settings::Resolution;
    use nalgebra::Matrix2;

    fn square() -> Domain {
        Domain::new(-1.0, 1.0, -1.0, 1.0)
    }

    fn field(source: &str) -> ExpressionField {
        ExpressionField::new(source, square()).expect("expression should compile")
    }

    fn settings(completeness: Completeness) -> ExplorationSettings {
        ExplorationSettings::default().with_completeness(completeness)
    }

    fn run(field: &mut ExpressionField, seeds: &[HelpPoint], completeness: Completeness) -> Exploration {
        explore(field, seeds, settings(completeness)).expect("exploration should start")
    }

    fn assert_on_zero_set(field: &mut ExpressionField, exploration: &Exploration) {
        for curve in &exploration.curves {
            for point in curve.points() {
                let value = EvaluatedPoint::new(point.uv())
                    .value(field)
                    .expect("field is defined everywhere");
                assert!(value.abs() <= 1e-8, "|f| = {} at {:?}", value.abs(), point.uv());
            }
        }
    }

    fn centroid(curve: &Curve) -> Vector2<f64> {
        let uvs = curve.uvs();
        let n = uvs.len() - 1;
        uvs[..n].iter().fold(Vector2::<f64>::zeros(), |acc, p| acc + p) / n as f64
    }

    #[test]
    fn circle_from_single_seed_is_one_closed_curve() {
        let mut f = field("u^2 + v^2 - 0.25");
        let result = run(&mut f, &[HelpPoint::help(Vector2::new(0.5, 0.0))], Completeness::Boundaries);
        assert_eq!(result.curves.len(), 1);
        let curve = &result.curves[0];
        assert!(curve.closed);
        assert_eq!(curve.tail, Some(BranchEnd::ClosedLoop));
        let (first, last) = (curve.first().unwrap().uv(), curve.last().unwrap().uv());
        assert!((first - last).norm() < 1e-9);
        assert!(curve.len() > 40 && curve.len() < 400, "{} points", curve.len());
        assert!(result.terminators.is_empty());
        assert_eq!(result.errors, 0);
        assert_on_zero_set(&mut f, &result);
    }

    #[test]
    fn crossing_lines_traced_from_two_seeds() {
        let mut f = field("u*v");
        let seeds = [
            HelpPoint::help(Vector2::new(0.9, 0.0)),
            HelpPoint::help(Vector2::new(0.0, 0.9)),
        ];
        let result = run(&mut f, &seeds, Completeness::SeedBranches);
        assert_eq!(result.curves.len(), 2);
        assert_eq!(result.terminators.len(), 1);
        let (tid, terminator) = &result.terminators[0];
        assert!(terminator.uv.norm() < 1e-6);
        assert_eq!(terminator.branches.len(), 4);
        for curve in &result.curves {
            let ends = [curve.head, curve.tail];
            assert!(ends.contains(&Some(BranchEnd::DomainExit)));
            assert!(ends.contains(&Some(BranchEnd::Terminator(*tid))));
        }
        assert_on_zero_set(&mut f, &result);
    }

    #[test]
    fn supplied_crossing_traces_all_four_branches() {
        let mut f = field("u*v");
        let seeds = [
            HelpPoint::terminator(Vector2::new(0.0, 0.0)),
            HelpPoint::help(Vector2::new(0.9, 0.0)),
        ];
        let result = run(&mut f, &seeds, Completeness::SeedBranches);
        assert_eq!(result.terminators.len(), 1);
        let terminator = &result.terminators[0].1;
        assert!(terminator.supplied);
        assert_eq!(terminator.branches.len(), 4);
        assert!(terminator.branches.iter().all(|b| b.visited));
        assert_eq!(result.curves.len(), 4);
        assert!(result.curves.iter().all(|c| c.is_linked() || c.head == Some(BranchEnd::DomainExit) || c.tail == Some(BranchEnd::DomainExit)));
    }

    #[test]
    fn boundary_scan_finds_every_branch_of_a_crossing() {
        let mut f = field("u*v");
        let result = run(&mut f, &[], Completeness::Boundaries);
        assert_eq!(result.terminators.len(), 1);
        assert_eq!(result.curves.len(), 4);
        let domain = square();
        for curve in &result.curves {
            for point in curve.points() {
                let uv = point.uv();
                let strictly_inside = uv.x > domain.umin
                    && uv.x < domain.umax
                    && uv.y > domain.vmin
                    && uv.y < domain.vmax;
                assert!(strictly_inside || point.on_boundary, "{uv:?}");
            }
        }
        assert_on_zero_set(&mut f, &result);
    }

    #[test]
    fn periodic_wave_closes_around_the_period() {
        let domain = Domain::new(0.0, 1.0, -1.0, 1.0);
        let mut f = ExpressionField::new("v - 0.3 - 0.1*sin(2*pi*u)", domain)
            .expect("expression should compile")
            .with_periodicity(Periodicity::new(true, false));
        let result = run(&mut f, &[HelpPoint::help(Vector2::new(0.25, 0.4))], Completeness::Boundaries);
        assert_eq!(result.curves.len(), 1);
        assert!(result.curves[0].closed);
        assert_on_zero_set(&mut f, &result);
    }

    #[test]
    fn seed_order_does_not_change_the_curves() {
        let source = "((u-0.5)^2 + v^2 - 0.04) * ((u+0.5)^2 + v^2 - 0.04)";
        let seeds = [
            HelpPoint::help(Vector2::new(0.7, 0.0)),
            HelpPoint::help(Vector2::new(-0.3, 0.0)),
            HelpPoint::help(Vector2::new(0.5, 0.2)),
        ];
        let mut reversed = seeds.clone();
        reversed.reverse();
        let settings = ExplorationSettings {
            safe_area: true,
            ..settings(Completeness::SeedBranches)
        };
        let mut centers = Vec::new();
        for order in [&seeds[..], &reversed[..]] {
            let mut f = field(source);
            let result = explore(&mut f, order, settings).unwrap();
            assert_eq!(result.curves.len(), 2);
            assert!(result.curves.iter().all(|c| c.closed));
            let mut c: Vec<Vector2<f64>> = result.curves.iter().map(centroid).collect();
            c.sort_by(|a, b| a.x.total_cmp(&b.x));
            centers.push(c);
        }
        for (a, b) in centers[0].iter().zip(&centers[1]) {
            assert!((a - b).norm() < 1e-2, "{a:?} vs {b:?}");
        }
    }

    #[test]
    fn subdivision_finds_a_loop_without_seeds() {
        let mut f = field("u^2 + v^2 - 0.25");
        let result = run(&mut f, &[], Completeness::Subdivide);
        assert_eq!(result.curves.len(), 1);
        assert!(result.curves[0].closed);
    }

    #[test]
    fn everything_reports_isolated_zero() {
        let mut f = field("u^2 + v^2");
        let result = run(&mut f, &[], Completeness::Everything);
        assert!(result.curves.is_empty());
        assert_eq!(result.isolated.len(), 1);
        assert!(result.isolated[0].norm() < 1e-6);
    }

    #[test]
    fn help_seed_on_an_isolated_zero_reports_it() {
        let mut f = field("(u-0.3)^2 + (v+0.2)^2");
        let seeds = [HelpPoint::help(Vector2::new(0.3, -0.2))];
        let result = run(&mut f, &seeds, Completeness::SeedBranches);
        assert!(result.curves.is_empty());
        assert_eq!(result.errors, 0);
        assert_eq!(result.isolated.len(), 1);
        assert!((result.isolated[0] - Vector2::new(0.3, -0.2)).norm() < 1e-6);
    }

    #[test]
    fn everything_reports_turning_point_inside_a_loop() {
        let mut f = field("u^2 + v^2 - 0.25");
        let result = run(&mut f, &[], Completeness::Everything);
        assert_eq!(result.curves.len(), 1);
        assert_eq!(result.turning_points.len(), 1);
        assert!(result.turning_points[0].norm() < 1e-6);
    }

    #[test]
    fn small_lemniscate_lobes_fail_to_leave_the_terminator() {
        let mut f = ExpressionField::with_constants(
            "(u^2 + v^2)^2 - a^2*(u^2 - v^2)",
            square(),
            &[("a", 0.06)],
        )
        .unwrap();
        let result = run(
            &mut f,
            &[HelpPoint::terminator(Vector2::new(0.0, 0.0))],
            Completeness::SeedBranches,
        );
        assert_eq!(result.terminators.len(), 1);
        assert_eq!(result.terminators[0].1.branches.len(), 4);
        assert!(result.curves.is_empty());
        let failed = result
            .branches
            .iter()
            .filter(|b| b.end == BranchEnd::FailedToLeaveTerminator)
            .count();
        assert_eq!(failed, 2);
        assert!(result.branches.iter().all(|b| b.end != BranchEnd::StepLimit));
    }

    #[test]
    fn tangent_terminator_branches_are_flagged() {
        let mut f = field("v*(v - u^2)");
        let mut explorer = Explorer::new(&mut f, ExplorationSettings::default()).unwrap();
        let terminator = explorer.analyze_terminator(Vector2::zeros(), false);
        assert_eq!(terminator.branches.len(), 4);
        assert!(terminator.branches.iter().all(|b| b.tangent));
    }

    #[test]
    fn crossing_is_not_tangent() {
        let mut f = field("u*v");
        let mut explorer = Explorer::new(&mut f, ExplorationSettings::default()).unwrap();
        let radius = 0.05;
        let scan = explorer.tangent_explore(&Vector2::zeros(), &Vector2::new(1.0, 0.0), radius);
        assert_eq!(scan.departures.len(), 1);
        assert!(!scan.tangent);
    }

    #[test]
    fn seeds_outside_the_domain_are_rejected() {
        let mut f = field("u*v");
        let mut explorer = Explorer::new(&mut f, ExplorationSettings::default()).unwrap();
        let err = explorer
            .add_seed(HelpPoint::help(Vector2::new(3.0, 0.0)))
            .expect_err("seed is outside");
        assert!(matches!(err, ExploreError::SeedOutsideDomain { .. }));
    }

    /// Circle of radius 0.5 whose branches are vetoed below `v = -0.2`.
    struct Vetoed;

    impl ScalarField for Vetoed {
        fn domain(&self) -> Domain {
            square()
        }

        fn evaluate(&mut self, uv: Vector2<f64>, _order: usize) -> FieldSample {
            FieldSample::second_order(
                uv.norm_squared() - 0.25,
                uv * 2.0,
                Matrix2::new(2.0, 0.0, 0.0, 2.0),
            )
        }

        fn special_termination(&mut self, step: &Step) -> bool {
            step.from.uv().y < -0.2
        }
    }

    #[test]
    fn special_termination_stops_both_legs() {
        let mut f = Vetoed;
        let result = explore(
            &mut f,
            &[HelpPoint::help(Vector2::new(0.5, 0.0))],
            settings(Completeness::SeedBranches),
        )
        .unwrap();
        assert_eq!(result.curves.len(), 1);
        let curve = &result.curves[0];
        assert!(!curve.closed);
        assert_eq!(curve.head, Some(BranchEnd::SpecialTermination));
        assert_eq!(curve.tail, Some(BranchEnd::SpecialTermination));
    }

    /// The line `v = 0`, undefined for `u < 0.2`.
    struct Truncated;

    impl ScalarField for Truncated {
        fn domain(&self) -> Domain {
            square()
        }

        fn evaluate(&mut self, uv: Vector2<f64>, _order: usize) -> FieldSample {
            if uv.x < 0.2 {
                return FieldSample::failed();
            }
            FieldSample::second_order(uv.y, Vector2::new(0.0, 1.0), Matrix2::zeros())
        }
    }

    #[test]
    fn exhausted_error_budget_returns_partial_result() {
        let mut f = Truncated;
        let settings = ExplorationSettings {
            error_threshold: 1,
            ..settings(Completeness::SeedBranches)
        };
        let result = explore(&mut f, &[HelpPoint::help(Vector2::new(0.5, 0.0))], settings).unwrap();
        assert!(result.aborted);
        assert!(result.errors >= 1);
        assert_eq!(result.curves.len(), 1);
        assert!(result
            .branches
            .iter()
            .any(|b| b.end == BranchEnd::RelaxationFailed));
    }

    #[test]
    fn exhausted_budget_skips_remaining_isolated_seeds() {
        let mut f = field("(u-0.3)^2 + (v+0.2)^2");
        let settings = ExplorationSettings {
            error_threshold: 1,
            ..settings(Completeness::SeedBranches)
        };
        let seeds = [
            HelpPoint::terminator(Vector2::new(-0.7, 0.7)),
            HelpPoint::isolated(Vector2::new(0.31, -0.2)),
        ];
        let result = explore(&mut f, &seeds, settings).unwrap();
        assert!(result.aborted);
        assert_eq!(result.errors, 1);
        assert_eq!(result.isolated, vec![Vector2::new(0.31, -0.2)]);
    }

    #[test]
    fn composite_branch_continues_straight_through_the_crossing() {
        let mut f = field("u*v");
        let seeds = [HelpPoint::help(Vector2::new(0.5, 0.0))];
        let result = run(&mut f, &seeds, Completeness::CompositeBranch);
        assert_eq!(result.curves.len(), 2);
        assert_eq!(result.terminators.len(), 1);
        let (first, second) = (&result.curves[0], &result.curves[1]);
        assert_eq!(first.next, Some(second.id));
        assert_eq!(second.next, None);
        let tid = result.terminators[0].0;
        assert!(first.terminators().contains(&Some(tid)));
        assert!(second.terminators().contains(&Some(tid)));
        assert!(first.uvs().iter().all(|p| p.y.abs() < 1e-6 && p.x > -1e-6));
        assert!(second.uvs().iter().all(|p| p.y.abs() < 1e-6 && p.x < 1e-6));
        let visited = result.terminators[0].1.branches.iter().filter(|b| b.visited).count();
        assert_eq!(visited, 2);
    }

    /// `u*v` whose terminator equality can be switched on after discovery.
    struct LateMerge {
        merge: bool,
    }

    impl ScalarField for LateMerge {
        fn domain(&self) -> Domain {
            square()
        }

        fn evaluate(&mut self, uv: Vector2<f64>, _order: usize) -> FieldSample {
            FieldSample::second_order(
                uv.x * uv.y,
                Vector2::new(uv.y, uv.x),
                Matrix2::new(0.0, 1.0, 1.0, 0.0),
            )
        }

        fn terminators_equal(&self, _a: &Terminator, _b: &Terminator, _res: &Resolution) -> bool {
            self.merge
        }
    }

    #[test]
    fn coalescing_repoints_curves_to_the_kept_terminator() {
        let mut f = LateMerge { merge: false };
        let mut explorer = Explorer::new(&mut f, settings(Completeness::SeedBranches)).unwrap();
        let res = Resolution::default();
        let origin = Vector2::new(0.0, 0.0);
        let terminator = explorer.analyze_terminator(origin, false);
        assert_eq!(terminator.branches.len(), 4);
        let (keep, _) = explorer
            .registry
            .add_terminator(&*explorer.tracer.field, &res, terminator.clone());
        let (other, merged) = explorer
            .registry
            .add_terminator(&*explorer.tracer.field, &res, terminator);
        assert!(!merged);

        let (curve, end) = explorer.explore_terminator_branch(other, 0).unwrap();
        assert_eq!(end, BranchEnd::DomainExit);
        assert!(explorer.assembler.get(curve).unwrap().terminators().contains(&Some(other)));

        explorer.tracer.field.merge = true;
        explorer.coalesce_terminators();
        assert!(explorer.registry.terminator(other).is_none());
        assert!(explorer.registry.terminator(keep).unwrap().branches[0].visited);
        let curve = explorer.assembler.get(curve).unwrap();
        assert!(curve.terminators().contains(&Some(keep)));
        assert!(curve.points().all(|p| p.terminator != Some(other)));
        assert!(curve.points().any(|p| p.terminator == Some(keep)));
    }

    #[test]
    fn single_branch_stops_after_the_first_seed() {
        let source = "((u-0.5)^2 + v^2 - 0.04) * ((u+0.5)^2 + v^2 - 0.04)";
        let mut f = field(source);
        let seeds = [
            HelpPoint::help(Vector2::new(0.7, 0.0)),
            HelpPoint::help(Vector2::new(-0.3, 0.0)),
        ];
        let result = run(&mut f, &seeds, Completeness::SingleBranch);
        assert_eq!(result.curves.len(), 1);
        assert!(result.curves[0].uvs().iter().all(|p| p.x > 0.0));
    }
}
