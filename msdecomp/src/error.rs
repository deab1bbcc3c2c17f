use thiserror::Error;

use crate::chemistry::elements::Element;

pub type Result<T> = std::result::Result<T, DecompositionError>;

/// Everything that can go wrong before or while setting up a decomposition.
///
/// Finding no formula for a mass is not an error, searches report that with an
/// empty result.
#[derive(Debug, Error)]
pub enum DecompositionError {
    #[error("Invalid bounds for {element}: min {min} > max {max}")]
    InvalidBounds { element: Element, min: i32, max: i32 },

    #[error("Negative bound for {element}: {value}")]
    NegativeBound { element: Element, value: i32 },

    #[error("Mass tolerance must be a positive ppm value, got {0}")]
    InvalidTolerance(f64),

    #[error("Invalid DBE range: min {min} > max {max}")]
    InvalidDbeRange { min: f64, max: f64 },

    #[error("Mass precision must be positive and finite, got {0}")]
    InvalidPrecision(f64),

    #[error("Got {masses} masses but {bounds} bound pairs")]
    LengthMismatch { masses: usize, bounds: usize },

    #[error("Known precursor has {precursor} {element} but the lower bound is {min}")]
    PrecursorBelowMinimum { element: Element, precursor: i32, min: i32 },

    #[error("Integer mass range exhausted while discretizing {element}, use a coarser precision or tighter bounds")]
    NumericOverflow { element: Element },

    #[error("Residue table with {rows} rows exceeds the allocation limit, use a coarser precision")]
    ResidueTableTooLarge { rows: i64 },

    #[error("Failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Could not parse formula: {0}")]
    FormulaParse(String),
}

impl DecompositionError {
    /// True for the errors caused by malformed parameters or bounds.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            DecompositionError::InvalidBounds { .. }
                | DecompositionError::NegativeBound { .. }
                | DecompositionError::InvalidTolerance(_)
                | DecompositionError::InvalidDbeRange { .. }
                | DecompositionError::InvalidPrecision(_)
                | DecompositionError::LengthMismatch { .. }
                | DecompositionError::PrecursorBelowMinimum { .. }
        )
    }
}
