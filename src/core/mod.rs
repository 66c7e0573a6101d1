//! Problem modelling for nonlinear least squares
//!
//! This module contains the data model the solver operates on:
//! - Parameter blocks (user state, constancy, manifolds) addressed by opaque handles
//! - Residual blocks wrapping cost functions and optional robust losses
//! - The [`Problem`](problem::Problem) arena that owns both
//! - [`Program`](program::Program), the ordered view the solver reduces and reorders
//! - Elimination orderings and the parameter-block co-occurrence graph

pub mod corrector;
pub mod cost_function;
pub mod graph;
pub mod loss_functions;
pub mod manifold;
pub mod ordering;
pub mod parameter_block;
pub mod problem;
pub mod program;
pub mod residual_block;

use thiserror::Error;
use tracing::error;

/// Core module error types for problem construction, programs and orderings
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Parameter block handle is stale, unknown or misused
    #[error("Parameter block error: {0}")]
    ParameterBlock(String),

    /// Residual block construction or lookup failed
    #[error("Residual block error: {0}")]
    ResidualBlock(String),

    /// A cost function reported failure while being evaluated
    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    /// Ordering does not match the problem it is applied to
    #[error("Invalid ordering: {0}")]
    Ordering(String),

    /// Dimension mismatch between cost functions, manifolds and parameter blocks
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Loss function error
    #[error("Loss function error: {0}")]
    LossFunction(String),

    /// Invalid input parameter or configuration
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl CoreError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| CoreError::from(e).log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with the underlying source error
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for core module operations
pub type CoreResult<T> = Result<T, CoreError>;
