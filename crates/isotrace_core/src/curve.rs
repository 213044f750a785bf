//! Accumulates accepted points into output polylines.

use std::collections::VecDeque;

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use slotmap::{new_key_type, SlotMap};

use crate::domain::Periodicity;
use crate::field::ScalarField;
use crate::point::EvaluatedPoint;
use crate::registry::TerminatorId;
use crate::stepper::BranchEnd;

new_key_type! {
    pub struct CurveId;
}

/// One committed point of a curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    pub point: EvaluatedPoint,
    /// Unit tangent in the direction of the curve.
    pub tangent: Vector2<f64>,
    pub on_boundary: bool,
    pub terminator: Option<TerminatorId>,
    /// Second tangent for points where the curve has a corner, e.g. at a
    /// discontinuity of the field's derivatives.
    pub outgoing: Option<Vector2<f64>>,
}

impl CurvePoint {
    pub fn new(point: EvaluatedPoint, tangent: Vector2<f64>) -> Self {
        Self {
            point,
            tangent,
            on_boundary: false,
            terminator: None,
            outgoing: None,
        }
    }

    pub fn boundary(mut self) -> Self {
        self.on_boundary = true;
        self
    }

    pub fn at_terminator(mut self, id: TerminatorId) -> Self {
        self.terminator = Some(id);
        self
    }

    pub fn uv(&self) -> Vector2<f64> {
        self.point.uv()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CurveStatus {
    InProgress,
    Finished,
}

/// An ordered, doubly extensible point sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Curve {
    pub id: CurveId,
    points: VecDeque<CurvePoint>,
    /// The curve runs along a tangential branch.
    pub tangent: bool,
    pub closed: bool,
    pub status: CurveStatus,
    /// How the curve ends at its first point.
    pub head: Option<BranchEnd>,
    /// How the curve ends at its last point.
    pub tail: Option<BranchEnd>,
    pub next: Option<CurveId>,
}

impl Curve {
    fn new(id: CurveId, tangent: bool) -> Self {
        Self {
            id,
            points: VecDeque::new(),
            tangent,
            closed: false,
            status: CurveStatus::InProgress,
            head: None,
            tail: None,
            next: None,
        }
    }

    pub fn points(&self) -> impl DoubleEndedIterator<Item = &CurvePoint> + ExactSizeIterator {
        self.points.iter()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn first(&self) -> Option<&CurvePoint> {
        self.points.front()
    }

    pub fn last(&self) -> Option<&CurvePoint> {
        self.points.back()
    }

    pub fn uvs(&self) -> Vec<Vector2<f64>> {
        self.points.iter().map(CurvePoint::uv).collect()
    }

    /// Linked to a terminator at both ends.
    pub fn is_linked(&self) -> bool {
        matches!(self.head, Some(BranchEnd::Terminator(_)))
            && matches!(self.tail, Some(BranchEnd::Terminator(_)))
    }

    pub fn terminators(&self) -> [Option<TerminatorId>; 2] {
        let id = |end: Option<BranchEnd>| match end {
            Some(BranchEnd::Terminator(id)) => Some(id),
            _ => None,
        };
        [id(self.head), id(self.tail)]
    }

    /// Polyline length measured with periodic deltas.
    pub fn length(&self, periodicity: Periodicity) -> f64 {
        self.points
            .iter()
            .zip(self.points.iter().skip(1))
            .map(|(a, b)| periodicity.distance(&a.uv(), &b.uv()))
            .sum()
    }

    /// Reverses the traversal direction, tangents and end labels included.
    pub fn reverse(&mut self) {
        let reversed: VecDeque<CurvePoint> = self
            .points
            .drain(..)
            .rev()
            .map(|mut p| {
                p.tangent = -p.tangent;
                p.outgoing = p.outgoing.map(|t| -t);
                p
            })
            .collect();
        self.points = reversed;
        std::mem::swap(&mut self.head, &mut self.tail);
    }

    /// Smallest distance from `uv` to the polyline, with the length of the
    /// closest segment.
    pub fn distance_to(&self, periodicity: Periodicity, uv: &Vector2<f64>) -> Option<(f64, f64)> {
        if self.points.len() == 1 {
            let d = periodicity.distance(uv, &self.points[0].uv());
            return Some((d, 0.0));
        }
        self.points
            .iter()
            .zip(self.points.iter().skip(1))
            .map(|(a, b)| {
                let (d, _) = periodicity.segment_distance(uv, &a.uv(), &b.uv());
                (d, periodicity.distance(&a.uv(), &b.uv()))
            })
            .min_by(|x, y| x.0.total_cmp(&y.0))
    }
}

/// Builds curves one at a time; the most recent one is "current".
#[derive(Debug, Clone, Default)]
pub struct Assembler {
    curves: SlotMap<CurveId, Curve>,
    order: Vec<CurveId>,
    current: Option<CurveId>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_new_curve(&mut self, tangent: bool) -> CurveId {
        let id = self.curves.insert_with_key(|id| Curve::new(id, tangent));
        self.order.push(id);
        self.current = Some(id);
        id
    }

    pub fn current(&self) -> Option<&Curve> {
        self.current.and_then(|id| self.curves.get(id))
    }

    pub fn current_id(&self) -> Option<CurveId> {
        self.current
    }

    /// Appends (`at_end`) or prepends a point to the current curve after
    /// letting the field post-process it.
    pub fn add_curve_point<F: ScalarField + ?Sized>(
        &mut self,
        field: &mut F,
        mut point: CurvePoint,
        at_end: bool,
    ) -> bool {
        let Some(curve) = self.current.and_then(|id| self.curves.get_mut(id)) else {
            return false;
        };
        if curve.status != CurveStatus::InProgress {
            return false;
        }
        field.edit_curve_point(&mut point);
        if at_end {
            curve.points.push_back(point);
        } else {
            curve.points.push_front(point);
        }
        true
    }

    pub fn set_end(&mut self, at_end: bool, end: BranchEnd) {
        if let Some(curve) = self.current.and_then(|id| self.curves.get_mut(id)) {
            if at_end {
                curve.tail = Some(end);
            } else {
                curve.head = Some(end);
            }
        }
    }

    /// Discards the current curve unless it is already finished or linked
    /// to terminators at both ends.
    pub fn abort_curve(&mut self) -> bool {
        let Some(id) = self.current else {
            return false;
        };
        let abortable = self
            .curves
            .get(id)
            .map_or(false, |c| c.status == CurveStatus::InProgress && !c.is_linked());
        if !abortable {
            return false;
        }
        self.curves.remove(id);
        self.order.retain(|&other| other != id);
        self.current = None;
        true
    }

    /// Closes the current curve for further edits.
    pub fn finish_curve(&mut self, closed: bool) -> Option<CurveId> {
        let id = self.current.take()?;
        let curve = self.curves.get_mut(id)?;
        curve.closed = closed;
        curve.status = CurveStatus::Finished;
        Some(id)
    }

    pub fn reverse_current(&mut self) {
        if let Some(curve) = self.current.and_then(|id| self.curves.get_mut(id)) {
            curve.reverse();
        }
    }

    pub fn link(&mut self, from: CurveId, to: CurveId) {
        if self.curves.contains_key(to) {
            if let Some(curve) = self.curves.get_mut(from) {
                curve.next = Some(to);
            }
        }
    }

    /// Re-points every curve end and point that referenced `old` to `new`.
    pub fn replace_terminator(&mut self, old: TerminatorId, new: TerminatorId) {
        let swap = |end: &mut Option<BranchEnd>| {
            if *end == Some(BranchEnd::Terminator(old)) {
                *end = Some(BranchEnd::Terminator(new));
            }
        };
        for curve in self.curves.values_mut() {
            swap(&mut curve.head);
            swap(&mut curve.tail);
            for point in curve.points.iter_mut() {
                if point.terminator == Some(old) {
                    point.terminator = Some(new);
                }
            }
        }
    }

    pub fn get(&self, id: CurveId) -> Option<&Curve> {
        self.curves.get(id)
    }

    pub fn curves(&self) -> impl Iterator<Item = &Curve> {
        self.order.iter().map(move |&id| &self.curves[id])
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// True when `uv` lies on a finished curve, within the chord sagitta a
    /// step of turning angle `angle` can produce.
    pub fn on_existing_curve(
        &self,
        periodicity: Periodicity,
        uv: &Vector2<f64>,
        angle: f64,
        floor: f64,
    ) -> bool {
        self.curves().any(|curve| {
            curve
                .distance_to(periodicity, uv)
                .map_or(false, |(d, seg)| d <= 0.5 * angle * seg + floor)
        })
    }

    pub fn into_curves(mut self) -> Vec<Curve> {
        self.order
            .iter()
            .filter_map(|&id| self.curves.remove(id))
            .collect()
    }
}
