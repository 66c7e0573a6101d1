//! # lsq-solver
//!
//! Nonlinear least squares: minimize `½ Σ ρᵢ(||fᵢ(x)||²)` over parameter blocks `x`.
//!
//! A [`Problem`] owns parameter blocks and residual blocks. [`Solver::solve`] turns it into
//! a reduced program, picks the linear solver and the evaluator for it, runs a trust-region
//! or line-search minimizer and reports everything in a [`Summary`].
//!
//! ## Pipeline
//!
//! - **Reduction**: constant parameter blocks and the residual blocks that only touch them
//!   are removed, their cost is kept as the fixed cost
//! - **Ordering**: parameter blocks are laid out by elimination group; Schur-type solvers
//!   get an independent set of e-blocks and residuals bucketed by their first e-block
//! - **Fallback**: a Schur solver with nothing left to eliminate is replaced by
//!   `DENSE_QR`, `SPARSE_NORMAL_CHOLESKY` or `CGNR`
//! - **Minimization**: Levenberg-Marquardt or dogleg trust-region steps, optional inner
//!   iterations, or a line search along steepest descent or L-BFGS directions
//! - **Callbacks**: state updating, progress logging, a solver log and user callbacks after
//!   every iteration
//!
//! ## Linear algebra
//!
//! Dense solvers use nalgebra, sparse factorizations use faer. CGNR and iterative Schur are
//! implemented on the block-sparse Jacobian directly.

pub mod callbacks;
pub mod core;
pub mod error;
pub mod evaluator;
pub mod linalg;
#[cfg(feature = "logging")]
pub mod logger;
pub mod optimizer;
mod parallel;
pub mod solver;

pub use crate::core::{
    cost_function::CostFunction,
    ordering::ParameterBlockOrdering,
    parameter_block::ParameterBlockId,
    problem::Problem,
    residual_block::ResidualBlockId,
};
pub use error::{SolverError, SolverResult};
pub use linalg::{LinearSolverType, PreconditionerType};
#[cfg(feature = "logging")]
pub use logger::{init_logger, init_logger_with_level};
pub use optimizer::{MinimizerType, TerminationType};
pub use solver::{LoggingType, Solver, SolverOptions, Summary, solve};
