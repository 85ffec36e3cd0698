use thiserror::Error;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can surface from the numeric core.
///
/// Only the surface solver raises these; the validator recovers from all of
/// them locally.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Ill-posed fit: {0}")]
    IllPosedFit(String),

    #[error("No usable solution: best mean fractional residual {best_score:.3e}")]
    NoUsableSolution { best_score: f64 },

    #[error("SVD did not converge for a {rows}x{cols} design matrix")]
    SvdFailed { rows: usize, cols: usize },
}
