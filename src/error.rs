//! Error types for the lsq-solver library
//!
//! This module provides the top-level error and result types.
//! All errors use the `thiserror` crate for automatic trait implementations.
//!
//! # Error Hierarchy
//!
//! - **`SolverError`** is the top-level error produced while preparing a solve
//! - **Module errors** (`CoreError`, `LinAlgError`, `OptimizerError`, `CallbackError`) are
//!   wrapped inside `SolverError`
//! - **Error sources** are preserved, allowing full error chain inspection
//!
//! `solve` never returns a `SolverError` directly: configuration problems end up in
//! [`Summary::error`](crate::solver::Summary::error) as the compact chain.

use crate::{
    callbacks::CallbackError, core::CoreError, linalg::LinAlgError, optimizer::OptimizerError,
};
use std::error::Error as StdError;
use thiserror::Error;
use tracing::error;

/// Main result type used throughout the solver
pub type SolverResult<T> = Result<T, SolverError>;

#[derive(Debug, Error)]
pub enum SolverError {
    /// Problem, program, ordering and evaluation errors
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Linear solver construction and factorization errors
    #[error(transparent)]
    LinearAlgebra(#[from] LinAlgError),

    /// Minimizer configuration errors
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),

    /// Iteration callback errors
    #[error(transparent)]
    Callback(#[from] CallbackError),

    /// Inconsistent or out of range solver options
    #[error("Invalid solver options: {0}")]
    InvalidOptions(String),
}

impl SolverError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Get the full error chain as a string for logging and debugging.
    ///
    /// ```rust,ignore
    /// if let Err(e) = validate(&options) {
    ///     warn!("Error chain: {}", e.chain());
    /// }
    /// ```
    pub fn chain(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(format!("  → {}", err));
            source = err.source();
        }

        chain.join("\n")
    }

    /// Get a compact single-line error chain for logging
    pub fn chain_compact(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }

        chain.join(" → ")
    }
}
