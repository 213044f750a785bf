pub mod curve;
#[cfg(any(test, feature = "debug-text"))]
pub mod debug;
pub mod domain;
pub mod error;
pub mod explore;
pub mod expression;
pub mod field;
pub mod jet;
pub mod point;
pub mod region;
pub mod registry;
pub mod relax;
pub mod settings;
/// The `isotrace_core` crate traces the zero set `f(u, v) = 0` of a scalar
/// field over a rectangular, optionally periodic, two-parameter domain.
///
/// Key components:
/// - **Field**: `ScalarField`, the capability a client implements (value and
///   derivatives, domain, periodicity, optional hooks), with finite-difference
///   fill-in for missing derivatives.
/// - **Relaxation**: Newton-type iterations onto the zero set and onto
///   stationary, singular and boundary points.
/// - **Stepper**: curvature-controlled predictor/corrector marching with step
///   scoring and tangent-flip detection.
/// - **Explorer**: seed processing, terminator analysis, boundary scan,
///   region subdivision and curve assembly.
/// - **Expression**: text-defined fields evaluated exactly by a bytecode VM.
pub mod stepper;

pub use curve::{Curve, CurveId, CurvePoint};
pub use domain::{Domain, Periodicity, Side};
pub use error::{ExploreError, Result};
pub use explore::{explore, BranchRecord, Exploration, Explorer};
pub use expression::ExpressionField;
pub use field::{ClosureField, FieldSample, ScalarField};
pub use registry::{HelpKind, HelpPoint, Terminator, TerminatorId};
pub use settings::{Completeness, ExplorationSettings, Resolution};
pub use stepper::{BranchEnd, StartKind};
