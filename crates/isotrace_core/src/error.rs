use thiserror::Error;

/// Failures that prevent an exploration from starting.
///
/// Numerical trouble during tracing is not reported here: it surfaces as
/// relaxation reasons, branch end classifications and the error counter
/// on [`crate::explore::Exploration`].
#[derive(Debug, Error)]
pub enum ExploreError {
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("Seed at ({u}, {v}) lies outside the domain")]
    SeedOutsideDomain { u: f64, v: f64 },

    #[error("Expression error: {0}")]
    Expression(String),
}

pub type Result<T> = std::result::Result<T, ExploreError>;
