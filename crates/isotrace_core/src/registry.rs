//! Typed seed and branch-point bookkeeping.
//!
//! Every help point and terminator lives in a slot map so that merges and
//! replacements are key rewrites. Insertion order is tracked separately so
//! the driver visits seeds deterministically.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Error};
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use slotmap::{new_key_type, SlotMap};

use crate::domain::Periodicity;
use crate::field::ScalarField;
use crate::settings::Resolution;

new_key_type! {
    pub struct HelpId;
    pub struct TerminatorId;
}

/// Role of a help point in the exploration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HelpKind {
    /// Zero-set point on the boundary where the curve enters the domain.
    Entry,
    /// Zero-set point on the boundary where the curve leaves the domain.
    Exit,
    /// Any other seed.
    Help,
    Terminator,
    Isolated,
    /// Singular zero whose Hessian is degenerate too.
    Flat,
    TurningPoint,
}

impl HelpKind {
    pub fn is_boundary(self) -> bool {
        matches!(self, HelpKind::Entry | HelpKind::Exit)
    }

    /// Starting seeds, as opposed to points already classified by analysis.
    pub fn is_seed(self) -> bool {
        matches!(self, HelpKind::Help | HelpKind::Entry | HelpKind::Exit)
    }

    /// Kinds whose records are tested against each other for merging.
    /// Seeds compare among themselves; classified kinds only with their own.
    fn comparable(self, other: HelpKind) -> bool {
        self == other || (self.is_seed() && other.is_seed())
    }
}

impl fmt::Display for HelpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HelpKind::Entry => "entry",
            HelpKind::Exit => "exit",
            HelpKind::Help => "help",
            HelpKind::Terminator => "terminator",
            HelpKind::Isolated => "isolated",
            HelpKind::Flat => "flat",
            HelpKind::TurningPoint => "turning_point",
        })
    }
}

impl FromStr for HelpKind {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "entry" => HelpKind::Entry,
            "exit" => HelpKind::Exit,
            "help" => HelpKind::Help,
            "terminator" => HelpKind::Terminator,
            "isolated" => HelpKind::Isolated,
            "flat" => HelpKind::Flat,
            "turning_point" => HelpKind::TurningPoint,
            other => return Err(anyhow!("unknown help kind '{other}'")),
        })
    }
}

/// Outcome of the three-way merge test between two help points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Merge {
    /// Same point: the new one is dropped.
    Mergeable,
    /// Different points: both kept.
    Distinct,
    /// Same position, different branches: both kept and linked.
    Partner,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelpPoint {
    pub uv: Vector2<f64>,
    /// Parameter on a second domain, when the field couples two of them.
    pub secondary: Option<Vector2<f64>>,
    pub tangent: Option<Vector2<f64>>,
    pub kind: HelpKind,
    pub on_boundary: bool,
    pub partner: Option<HelpId>,
    pub consumed: bool,
}

impl HelpPoint {
    fn with_kind(uv: Vector2<f64>, kind: HelpKind, on_boundary: bool) -> Self {
        Self {
            uv,
            secondary: None,
            tangent: None,
            kind,
            on_boundary,
            partner: None,
            consumed: false,
        }
    }

    pub fn help(uv: Vector2<f64>) -> Self {
        Self::with_kind(uv, HelpKind::Help, false)
    }

    pub fn entry(uv: Vector2<f64>, tangent: Vector2<f64>) -> Self {
        Self {
            tangent: Some(tangent),
            ..Self::with_kind(uv, HelpKind::Entry, true)
        }
    }

    pub fn exit(uv: Vector2<f64>, tangent: Vector2<f64>) -> Self {
        Self {
            tangent: Some(tangent),
            ..Self::with_kind(uv, HelpKind::Exit, true)
        }
    }

    pub fn terminator(uv: Vector2<f64>) -> Self {
        Self::with_kind(uv, HelpKind::Terminator, false)
    }

    pub fn isolated(uv: Vector2<f64>) -> Self {
        Self::with_kind(uv, HelpKind::Isolated, false)
    }

    pub fn flat(uv: Vector2<f64>) -> Self {
        Self::with_kind(uv, HelpKind::Flat, false)
    }

    pub fn turning_point(uv: Vector2<f64>) -> Self {
        Self::with_kind(uv, HelpKind::TurningPoint, false)
    }

    pub fn on_boundary(mut self, on_boundary: bool) -> Self {
        self.on_boundary = on_boundary || self.kind.is_boundary();
        self
    }
}

/// One zero-set branch leaving a terminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminatorBranch {
    /// Unit direction from the terminator towards the branch.
    pub direction: Vector2<f64>,
    /// Zero-set point on the scan circle where the branch starts.
    pub start: Vector2<f64>,
    /// Set once a curve has left or arrived along this branch.
    pub visited: bool,
    /// The branch touches another one tangentially at the terminator.
    pub tangent: bool,
}

/// A branch point where two or more zero-set branches meet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Terminator {
    pub uv: Vector2<f64>,
    pub branches: Vec<TerminatorBranch>,
    /// Radius around `uv` inside which the field stays within resolution.
    pub flat_extent: f64,
    /// Radius of the circle on which `branches` were found.
    pub scan_radius: f64,
    pub discontinuity: bool,
    /// Supplied by the caller rather than discovered while stepping.
    pub supplied: bool,
}

impl Terminator {
    pub fn new(uv: Vector2<f64>) -> Self {
        Self {
            uv,
            branches: Vec::new(),
            flat_extent: 0.0,
            scan_radius: 0.0,
            discontinuity: false,
            supplied: false,
        }
    }

    pub fn directions(&self) -> Vec<Vector2<f64>> {
        self.branches.iter().map(|b| b.direction).collect()
    }

    pub fn is_tangent(&self) -> bool {
        self.branches.iter().any(|b| b.tangent)
    }

    pub fn unvisited(&self) -> impl Iterator<Item = (usize, &TerminatorBranch)> {
        self.branches.iter().enumerate().filter(|(_, b)| !b.visited)
    }

    /// Index of the branch whose direction is closest to `direction`,
    /// preferring unvisited ones, with the angle between them.
    pub fn closest_branch(&self, direction: &Vector2<f64>) -> Option<(usize, f64)> {
        let angle = |b: &TerminatorBranch| b.direction.dot(direction).clamp(-1.0, 1.0).acos();
        let pick = |visited: bool| {
            self.branches
                .iter()
                .enumerate()
                .filter(|(_, b)| b.visited == visited)
                .map(|(i, b)| (i, angle(b)))
                .min_by(|a, b| a.1.total_cmp(&b.1))
        };
        match (pick(false), pick(true)) {
            (Some(open), Some(done)) if done.1 + 0.2 < open.1 => Some(done),
            (Some(open), _) => Some(open),
            (None, done) => done,
        }
    }

    /// Adds the branches of `other` whose directions are not already present.
    fn absorb(&mut self, other: &Terminator) {
        for branch in &other.branches {
            match self
                .branches
                .iter_mut()
                .find(|b| b.direction.dot(&branch.direction) > DIRECTION_MATCH_COS)
            {
                Some(existing) => existing.visited |= branch.visited,
                None => self.branches.push(branch.clone()),
            }
        }
        self.flat_extent = self.flat_extent.max(other.flat_extent);
        self.discontinuity |= other.discontinuity;
        self.supplied |= other.supplied;
    }
}

/// Cosine of the largest angle at which two branch directions still match.
const DIRECTION_MATCH_COS: f64 = 0.98;

/// Distance, as a multiple of `resabs`, within which seeds coincide.
const MERGE_FACTOR: f64 = 10.0;

pub fn default_mergeable(
    periodicity: Periodicity,
    a: &HelpPoint,
    b: &HelpPoint,
    res: &Resolution,
) -> Merge {
    if periodicity.distance(&a.uv, &b.uv) > MERGE_FACTOR * res.resabs {
        return Merge::Distinct;
    }
    match (a.kind, b.kind) {
        (HelpKind::Entry, HelpKind::Exit) | (HelpKind::Exit, HelpKind::Entry) => Merge::Partner,
        _ => match (a.tangent, b.tangent) {
            (Some(ta), Some(tb)) if ta.perp(&tb).abs() > 1e-4 => Merge::Partner,
            _ => Merge::Mergeable,
        },
    }
}

/// True only when the two terminators are certainly the same branch point.
///
/// Positions must agree within resolution. For flat terminators the
/// resolution is the smaller flat extent, and overlap alone is certain;
/// otherwise positions must agree within `resabs` and every branch of the
/// sparser terminator must match a branch of the other.
pub fn default_terminators_equal(
    periodicity: Periodicity,
    a: &Terminator,
    b: &Terminator,
    res: &Resolution,
) -> bool {
    let d = periodicity.distance(&a.uv, &b.uv);
    // Inside a flat region positions are only resolved to its extent.
    let flat = a.flat_extent.min(b.flat_extent);
    if flat > 0.0 && d <= flat {
        return true;
    }
    if d > MERGE_FACTOR * res.resabs {
        return false;
    }
    if a.branches.is_empty() || b.branches.is_empty() {
        return false;
    }
    let (small, large) = if a.branches.len() <= b.branches.len() {
        (a, b)
    } else {
        (b, a)
    };
    small.branches.iter().all(|s| {
        large
            .branches
            .iter()
            .any(|l| l.direction.dot(&s.direction) > DIRECTION_MATCH_COS)
    })
}

/// Result of inserting a help point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    Added(HelpId),
    Merged(HelpId),
    Partnered { added: HelpId, partner: HelpId },
}

impl Insert {
    pub fn id(self) -> HelpId {
        match self {
            Insert::Added(id) | Insert::Merged(id) => id,
            Insert::Partnered { added, .. } => added,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    points: SlotMap<HelpId, HelpPoint>,
    order: Vec<HelpId>,
    terminators: SlotMap<TerminatorId, Terminator>,
    terminator_order: Vec<TerminatorId>,
    discontinuities: Vec<Vector2<f64>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `point` unless an existing entry is mergeable with it.
    pub fn add_point<F: ScalarField + ?Sized>(
        &mut self,
        field: &F,
        res: &Resolution,
        mut point: HelpPoint,
    ) -> Insert {
        point.on_boundary |= point.kind.is_boundary();
        let mut partner = None;
        for &id in &self.order {
            let existing = &self.points[id];
            if !existing.kind.comparable(point.kind) {
                continue;
            }
            match field.mergeable(existing, &point, res) {
                Merge::Mergeable => return Insert::Merged(id),
                Merge::Partner => partner = Some(id),
                Merge::Distinct => {}
            }
        }
        point.partner = partner;
        let added = self.points.insert(point);
        self.order.push(added);
        match partner {
            Some(partner) => {
                self.points[partner].partner = Some(added);
                Insert::Partnered { added, partner }
            }
            None => Insert::Added(added),
        }
    }

    pub fn point(&self, id: HelpId) -> Option<&HelpPoint> {
        self.points.get(id)
    }

    pub fn point_mut(&mut self, id: HelpId) -> Option<&mut HelpPoint> {
        self.points.get_mut(id)
    }

    pub fn points(&self) -> impl Iterator<Item = (HelpId, &HelpPoint)> {
        self.order.iter().map(move |&id| (id, &self.points[id]))
    }

    pub fn of_kind(&self, kind: HelpKind) -> Vec<HelpId> {
        self.points()
            .filter(|(_, p)| p.kind == kind)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn unconsumed(&self, kind: HelpKind) -> Vec<HelpId> {
        self.points()
            .filter(|(_, p)| p.kind == kind && !p.consumed)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn consume(&mut self, id: HelpId) {
        if let Some(point) = self.points.get_mut(id) {
            point.consumed = true;
        }
    }

    pub fn remove(&mut self, id: HelpId) -> Option<HelpPoint> {
        let removed = self.points.remove(id)?;
        self.order.retain(|&other| other != id);
        for &other in &self.order {
            if self.points[other].partner == Some(id) {
                self.points[other].partner = None;
            }
        }
        Some(removed)
    }

    /// Consumes every seed lying within `tol` of the segment `a -> b`.
    /// Terminators, isolated and turning points are left alone.
    pub fn consume_near_segment(
        &mut self,
        periodicity: Periodicity,
        a: &Vector2<f64>,
        b: &Vector2<f64>,
        tol: f64,
    ) -> Vec<HelpId> {
        let mut consumed = Vec::new();
        for &id in &self.order {
            let point = &mut self.points[id];
            if point.consumed
                || !matches!(point.kind, HelpKind::Help | HelpKind::Entry | HelpKind::Exit)
            {
                continue;
            }
            let (d, _) = periodicity.segment_distance(&point.uv, a, b);
            if d <= tol {
                point.consumed = true;
                consumed.push(id);
            }
        }
        consumed
    }

    /// Inserts `terminator`, or merges it into an existing equal one.
    /// Returns the id that now represents it and whether a merge happened.
    pub fn add_terminator<F: ScalarField + ?Sized>(
        &mut self,
        field: &F,
        res: &Resolution,
        terminator: Terminator,
    ) -> (TerminatorId, bool) {
        for &id in &self.terminator_order {
            if field.terminators_equal(&self.terminators[id], &terminator, res) {
                self.terminators[id].absorb(&terminator);
                return (id, true);
            }
        }
        let id = self.terminators.insert(terminator);
        self.terminator_order.push(id);
        (id, false)
    }

    pub fn terminator(&self, id: TerminatorId) -> Option<&Terminator> {
        self.terminators.get(id)
    }

    pub fn terminator_mut(&mut self, id: TerminatorId) -> Option<&mut Terminator> {
        self.terminators.get_mut(id)
    }

    pub fn terminators(&self) -> impl Iterator<Item = (TerminatorId, &Terminator)> {
        self.terminator_order
            .iter()
            .map(move |&id| (id, &self.terminators[id]))
    }

    pub fn terminator_ids(&self) -> Vec<TerminatorId> {
        self.terminator_order.clone()
    }

    /// Folds `drop` into `keep`. The caller re-points curves referencing `drop`.
    pub fn merge_terminators(&mut self, keep: TerminatorId, drop: TerminatorId) -> bool {
        if keep == drop || !self.terminators.contains_key(keep) {
            return false;
        }
        let Some(dropped) = self.terminators.remove(drop) else {
            return false;
        };
        self.terminator_order.retain(|&id| id != drop);
        self.terminators[keep].absorb(&dropped);
        true
    }

    /// Replaces `old` by `new` outright, discarding the old record.
    pub fn replace_terminator(&mut self, old: TerminatorId, new: TerminatorId) -> bool {
        if old == new || !self.terminators.contains_key(new) {
            return false;
        }
        if self.terminators.remove(old).is_none() {
            return false;
        }
        self.terminator_order.retain(|&id| id != old);
        true
    }

    pub fn add_discontinuity(&mut self, uv: Vector2<f64>) {
        self.discontinuities.push(uv);
    }

    pub fn discontinuities(&self) -> &[Vector2<f64>] {
        &self.discontinuities
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Domain;
    use crate::field::ClosureField;

    fn field() -> ClosureField<impl FnMut(f64, f64) -> f64> {
        ClosureField::new(Domain::new(-1.0, 1.0, -1.0, 1.0), |u, v| u * v)
    }

    fn branch(direction: Vector2<f64>) -> TerminatorBranch {
        TerminatorBranch {
            direction,
            start: direction * 0.01,
            visited: false,
            tangent: false,
        }
    }

    #[test]
    fn coincident_help_points_merge() {
        let field = field();
        let res = Resolution::default();
        let mut registry = Registry::new();
        let first = registry.add_point(&field, &res, HelpPoint::help(Vector2::new(0.5, 0.0)));
        let second = registry.add_point(
            &field,
            &res,
            HelpPoint::help(Vector2::new(0.5 + 1e-8, 0.0)),
        );
        assert!(matches!(first, Insert::Added(_)));
        assert_eq!(second, Insert::Merged(first.id()));
        assert_eq!(registry.points().count(), 1);
    }

    #[test]
    fn entry_and_exit_at_same_place_are_partners() {
        let field = field();
        let res = Resolution::default();
        let mut registry = Registry::new();
        let uv = Vector2::new(1.0, 0.0);
        let entry = registry.add_point(&field, &res, HelpPoint::entry(uv, Vector2::new(-1.0, 0.0)));
        let exit = registry.add_point(&field, &res, HelpPoint::exit(uv, Vector2::new(1.0, 0.0)));
        match exit {
            Insert::Partnered { added, partner } => {
                assert_eq!(partner, entry.id());
                assert_eq!(registry.point(partner).unwrap().partner, Some(added));
                assert!(registry.point(added).unwrap().on_boundary);
            }
            other => panic!("expected partners, got {other:?}"),
        }
    }

    #[test]
    fn seeds_on_segment_are_consumed() {
        let field = field();
        let res = Resolution::default();
        let mut registry = Registry::new();
        let on = registry.add_point(&field, &res, HelpPoint::help(Vector2::new(0.5, 0.0))).id();
        let off = registry.add_point(&field, &res, HelpPoint::help(Vector2::new(0.5, 0.3))).id();
        let consumed = registry.consume_near_segment(
            Periodicity::default(),
            &Vector2::new(0.4, 0.0),
            &Vector2::new(0.6, 0.0),
            1e-6,
        );
        assert_eq!(consumed, vec![on]);
        assert!(!registry.point(off).unwrap().consumed);
        assert!(registry.unconsumed(HelpKind::Help) == vec![off]);
    }

    #[test]
    fn terminators_equal_needs_direction_agreement() {
        let res = Resolution::default();
        let mut a = Terminator::new(Vector2::new(0.0, 0.0));
        a.branches = vec![branch(Vector2::new(1.0, 0.0)), branch(Vector2::new(-1.0, 0.0))];
        let mut b = Terminator::new(Vector2::new(5e-7, 0.0));
        b.branches = vec![branch(Vector2::new(0.0, 1.0)), branch(Vector2::new(0.0, -1.0))];
        assert!(!default_terminators_equal(Periodicity::default(), &a, &b, &res));

        b.branches = vec![branch(Vector2::new(1.0, 0.0))];
        assert!(default_terminators_equal(Periodicity::default(), &a, &b, &res));

        // Probably equal but unconfirmed: no directions known.
        b.branches.clear();
        assert!(!default_terminators_equal(Periodicity::default(), &a, &b, &res));
    }

    #[test]
    fn flat_extent_overlap_is_certain_equality() {
        let res = Resolution::default();
        let mut a = Terminator::new(Vector2::new(0.0, 0.0));
        a.flat_extent = 1e-3;
        let mut b = Terminator::new(Vector2::new(5e-4, 0.0));
        b.flat_extent = 1e-3;
        assert!(default_terminators_equal(Periodicity::default(), &a, &b, &res));

        b.uv = Vector2::new(2e-3, 0.0);
        assert!(!default_terminators_equal(Periodicity::default(), &a, &b, &res));
        a.flat_extent = 0.0;
        b.uv = a.uv;
        assert!(!default_terminators_equal(Periodicity::default(), &a, &b, &res));
    }

    #[test]
    fn classified_points_do_not_merge_into_seeds() {
        let field = field();
        let res = Resolution::default();
        let mut registry = Registry::new();
        let uv = Vector2::new(0.3, -0.2);
        let seed = registry.add_point(&field, &res, HelpPoint::help(uv)).id();
        registry.consume(seed);
        let isolated = registry.add_point(&field, &res, HelpPoint::isolated(uv));
        assert!(matches!(isolated, Insert::Added(_)));
        let turning = registry.add_point(&field, &res, HelpPoint::turning_point(uv));
        assert!(matches!(turning, Insert::Added(_)));
        assert_eq!(registry.of_kind(HelpKind::Isolated), vec![isolated.id()]);

        let again = registry.add_point(&field, &res, HelpPoint::isolated(uv + Vector2::new(1e-8, 0.0)));
        assert_eq!(again, Insert::Merged(isolated.id()));
        let help = registry.add_point(&field, &res, HelpPoint::help(uv));
        assert_eq!(help, Insert::Merged(seed));
    }

    #[test]
    fn merging_terminators_unions_branches() {
        let field = field();
        let res = Resolution::default();
        let mut registry = Registry::new();
        let mut a = Terminator::new(Vector2::new(0.0, 0.0));
        a.branches = vec![branch(Vector2::new(1.0, 0.0))];
        let mut b = Terminator::new(Vector2::new(0.3, 0.0));
        b.branches = vec![branch(Vector2::new(0.0, 1.0)), branch(Vector2::new(1.0, 0.0))];
        b.branches[0].visited = true;
        let (keep, _) = registry.add_terminator(&field, &res, a);
        let (drop, merged) = registry.add_terminator(&field, &res, b);
        assert!(!merged);
        assert!(registry.merge_terminators(keep, drop));
        let kept = registry.terminator(keep).unwrap();
        assert_eq!(kept.branches.len(), 2);
        assert!(kept.branches[1].visited);
        assert!(registry.terminator(drop).is_none());
        assert_eq!(registry.terminators().count(), 1);
    }
}
