//! Text form of points and curves for diagnostics. Not a stable format.

use anyhow::{anyhow, Result};

use crate::curve::Curve;
use crate::point::EvaluatedPoint;

pub fn print_point(point: &EvaluatedPoint) -> Result<String> {
    serde_json::to_string(point).map_err(|e| anyhow!("Failed to print point: {e}"))
}

pub fn parse_point(text: &str) -> Result<EvaluatedPoint> {
    serde_json::from_str(text).map_err(|e| anyhow!("Failed to parse point: {e}"))
}

pub fn print_curve(curve: &Curve) -> Result<String> {
    serde_json::to_string_pretty(curve).map_err(|e| anyhow!("Failed to print curve: {e}"))
}

pub fn parse_curve(text: &str) -> Result<Curve> {
    serde_json::from_str(text).map_err(|e| anyhow!("Failed to parse curve: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Domain;
    use crate::explore::explore;
    use crate::field::ClosureField;
    use crate::point::PointKind;
    use crate::registry::{HelpKind, HelpPoint};
    use crate::settings::{Completeness, ExplorationSettings};
    use nalgebra::Vector2;

    #[test]
    fn evaluated_point_survives_text_form() {
        let mut field = ClosureField::new(Domain::unit(), |u, v| u * u + v * v - 0.25);
        let mut point = EvaluatedPoint::at(&mut field, Vector2::new(0.3, 0.4));
        point.set_kind(PointKind::Root);
        point.conic(&mut field);
        let text = print_point(&point).unwrap();
        assert_eq!(parse_point(&text).unwrap(), point);
    }

    #[test]
    fn traced_curve_survives_text_form() {
        let mut field = ClosureField::new(Domain::new(-1.0, 1.0, -1.0, 1.0), |u, v| {
            u * u + v * v - 0.25
        });
        let settings = ExplorationSettings::default().with_completeness(Completeness::SeedBranches);
        let result = explore(&mut field, &[HelpPoint::help(Vector2::new(0.5, 0.0))], settings).unwrap();
        let curve = &result.curves[0];
        let back = parse_curve(&print_curve(curve).unwrap()).unwrap();
        assert_eq!(&back, curve);
        assert_eq!(back.len(), curve.len());
    }

    #[test]
    fn malformed_text_is_an_error() {
        let err = parse_point("{\"uv\": [0.1]}").expect_err("truncated point");
        assert!(err.to_string().contains("Failed to parse point"));
    }

    #[test]
    fn kind_names_round_trip() {
        for kind in [
            PointKind::Root,
            PointKind::Extreme,
            PointKind::Axis,
            PointKind::SecondOrder,
            PointKind::Unclassified,
        ] {
            assert_eq!(kind.to_string().parse::<PointKind>().unwrap(), kind);
        }
        for kind in [
            HelpKind::Entry,
            HelpKind::Exit,
            HelpKind::Help,
            HelpKind::Terminator,
            HelpKind::Isolated,
            HelpKind::Flat,
            HelpKind::TurningPoint,
        ] {
            assert_eq!(kind.to_string().parse::<HelpKind>().unwrap(), kind);
        }
        assert!("saddle".parse::<PointKind>().is_err());
    }
}
