//! Minimizers for nonlinear least squares problems.
//!
//! This module provides the minimization loops the solver drives:
//! - Trust region minimization with Levenberg-Marquardt or dogleg steps
//! - Line search minimization with steepest descent or L-BFGS directions
//! - Coordinate descent over independent parameter block groups (inner iterations)
//!
//! Every minimizer reports through the same [`IterationSummary`] records and stops with a
//! [`TerminationType`].

use std::{
    fmt,
    fmt::{Display, Formatter},
};

use nalgebra::DVector;
use thiserror::Error;
use tracing::error;
use web_time::Duration;

use crate::callbacks::CallbackPipeline;
use crate::core::CoreError;
use crate::evaluator::EvaluatorStatistics;
use crate::linalg;

pub mod driver;
pub mod inner_iterations;
pub mod line_search;
pub mod strategy;
pub mod trust_region;

pub use driver::{DriverOutcome, final_cost_from_history, run_minimizer};
pub use inner_iterations::CoordinateDescentMinimizer;
pub use line_search::{LineSearchDirectionType, LineSearchMinimizer};
pub use strategy::{
    DoglegStrategy, DoglegType, LevenbergMarquardtStrategy, TrustRegionStrategy,
    TrustRegionStrategyType,
};
pub use trust_region::TrustRegionMinimizer;

/// Family of minimization loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum MinimizerType {
    #[default]
    TrustRegion,
    LineSearch,
}

impl Display for MinimizerType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MinimizerType::TrustRegion => write!(f, "TRUST_REGION"),
            MinimizerType::LineSearch => write!(f, "LINE_SEARCH"),
        }
    }
}

/// Reason a minimization run stopped.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TerminationType {
    /// Relative cost change fell below `function_tolerance`.
    FunctionTolerance,
    /// Max norm of the gradient fell below `gradient_tolerance`.
    GradientTolerance,
    /// Relative step size fell below `parameter_tolerance`, or the trust region collapsed.
    ParameterTolerance,
    /// Iteration or time budget exhausted.
    NoConvergence,
    /// Evaluation or the linear solver kept failing.
    NumericalFailure,
    /// A callback asked to stop.
    UserAbort,
    /// A callback declared the current state good enough.
    UserSuccess,
    /// The minimizer was never run.
    #[default]
    DidNotRun,
}

impl TerminationType {
    /// Whether the run ended at a usable solution.
    pub fn is_usable(&self) -> bool {
        matches!(
            self,
            TerminationType::FunctionTolerance
                | TerminationType::GradientTolerance
                | TerminationType::ParameterTolerance
                | TerminationType::NoConvergence
                | TerminationType::UserSuccess
        )
    }

    /// Whether the optimized state may be written back into user memory.
    pub fn writes_back(&self) -> bool {
        !matches!(
            self,
            TerminationType::UserAbort | TerminationType::NumericalFailure
        )
    }
}

impl Display for TerminationType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TerminationType::FunctionTolerance => write!(f, "FUNCTION_TOLERANCE"),
            TerminationType::GradientTolerance => write!(f, "GRADIENT_TOLERANCE"),
            TerminationType::ParameterTolerance => write!(f, "PARAMETER_TOLERANCE"),
            TerminationType::NoConvergence => write!(f, "NO_CONVERGENCE"),
            TerminationType::NumericalFailure => write!(f, "NUMERICAL_FAILURE"),
            TerminationType::UserAbort => write!(f, "USER_ABORT"),
            TerminationType::UserSuccess => write!(f, "USER_SUCCESS"),
            TerminationType::DidNotRun => write!(f, "DID_NOT_RUN"),
        }
    }
}

/// Optimizer-specific error types
#[derive(Debug, Clone, Error)]
pub enum OptimizerError {
    /// Invalid optimization parameters provided
    #[error("Invalid optimization parameters: {0}")]
    InvalidParameters(String),

    /// Inner iteration ordering is unusable
    #[error("Invalid inner iteration ordering: {0}")]
    InnerIterationOrdering(String),

    /// Linear algebra operation failed
    #[error("Linear algebra error: {0}")]
    LinAlg(#[from] linalg::LinAlgError),

    /// Problem or program lookup failed
    #[error("Problem error: {0}")]
    Core(#[from] CoreError),
}

impl OptimizerError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error from a third-party library
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for optimizer operations
pub type OptimizerResult<T> = Result<T, OptimizerError>;

/// Record of one minimizer iteration.
#[derive(Debug, Clone, Default)]
pub struct IterationSummary {
    /// Iteration number; 0 is the initial evaluation.
    pub iteration: usize,
    /// The linear solver produced a finite step with positive model decrease.
    pub step_is_valid: bool,
    /// The step was accepted although it increased the cost.
    pub step_is_nonmonotonic: bool,
    /// The step was accepted and the state moved.
    pub step_is_successful: bool,
    /// Cost at the current state after this iteration.
    pub cost: f64,
    /// Cost decrease of the step, negative when the cost grew.
    pub cost_change: f64,
    /// Infinity norm of the gradient.
    pub gradient_max_norm: f64,
    pub gradient_norm: f64,
    pub step_norm: f64,
    /// Ratio of actual to predicted cost decrease (trust region).
    pub relative_decrease: f64,
    pub trust_region_radius: f64,
    /// Accepted step length along the search direction (line search).
    pub step_size: f64,
    pub line_search_function_evaluations: usize,
    pub linear_solver_iterations: usize,
    pub iteration_time: Duration,
    pub cumulative_time: Duration,
}

impl IterationSummary {
    /// Column header matching [`IterationSummary::table_row`].
    pub fn table_header() -> String {
        format!(
            "{:>4}  {:>13}  {:>11}  {:>11}  {:>11}  {:>11}  {:>11}  {:>7}  {:>11}  {:>11}",
            "iter",
            "cost",
            "cost_change",
            "|gradient|",
            "|step|",
            "tr_ratio",
            "tr_radius",
            "ls_iter",
            "iter_time",
            "total_time"
        )
    }

    pub fn table_row(&self) -> String {
        format!(
            "{:>4}  {:>13.6e}  {:>11.2e}  {:>11.2e}  {:>11.2e}  {:>11.2e}  {:>11.2e}  {:>7}  {:>9.2}ms  {:>9.2}ms",
            self.iteration,
            self.cost,
            self.cost_change,
            self.gradient_max_norm,
            self.step_norm,
            self.relative_decrease,
            self.trust_region_radius,
            self.linear_solver_iterations,
            self.iteration_time.as_secs_f64() * 1000.0,
            self.cumulative_time.as_secs_f64() * 1000.0,
        )
    }

    /// Column header matching [`IterationSummary::line_search_table_row`].
    pub fn line_search_table_header() -> String {
        format!(
            "{:>4}  {:>13}  {:>11}  {:>11}  {:>11}  {:>11}  {:>7}  {:>11}  {:>11}",
            "iter",
            "cost",
            "cost_change",
            "|gradient|",
            "|step|",
            "step_size",
            "ls_eval",
            "iter_time",
            "total_time"
        )
    }

    pub fn line_search_table_row(&self) -> String {
        format!(
            "{:>4}  {:>13.6e}  {:>11.2e}  {:>11.2e}  {:>11.2e}  {:>11.2e}  {:>7}  {:>9.2}ms  {:>9.2}ms",
            self.iteration,
            self.cost,
            self.cost_change,
            self.gradient_max_norm,
            self.step_norm,
            self.step_size,
            self.line_search_function_evaluations,
            self.iteration_time.as_secs_f64() * 1000.0,
            self.cumulative_time.as_secs_f64() * 1000.0,
        )
    }
}

/// Options shared by all minimizers.
#[derive(Debug, Clone)]
pub struct MinimizerOptions {
    pub max_num_iterations: usize,
    pub max_solver_time_in_seconds: f64,
    /// Stop when `|Δcost| ≤ function_tolerance · cost`.
    pub function_tolerance: f64,
    /// Stop when `||g||∞ ≤ gradient_tolerance`.
    pub gradient_tolerance: f64,
    /// Stop when `||Δx|| ≤ parameter_tolerance · (||x|| + parameter_tolerance)`.
    pub parameter_tolerance: f64,

    pub trust_region_strategy_type: TrustRegionStrategyType,
    pub dogleg_type: DoglegType,
    pub initial_trust_region_radius: f64,
    pub max_trust_region_radius: f64,
    /// The trust region collapsing below this radius counts as convergence.
    pub min_trust_region_radius: f64,
    /// Steps with a smaller ratio of actual to predicted decrease are rejected.
    pub min_relative_decrease: f64,
    pub min_lm_diagonal: f64,
    pub max_lm_diagonal: f64,
    pub jacobi_scaling: bool,
    pub use_nonmonotonic_steps: bool,
    pub max_consecutive_nonmonotonic_steps: usize,
    pub max_num_consecutive_invalid_steps: usize,
    /// Forcing sequence for iterative linear solvers.
    pub eta: f64,
    /// Inner iterations stop once their relative improvement drops below this.
    pub inner_iteration_tolerance: f64,

    pub line_search_direction_type: LineSearchDirectionType,
    pub max_lbfgs_rank: usize,
    /// Armijo constant.
    pub line_search_sufficient_function_decrease: f64,
    pub max_num_line_search_step_size_iterations: usize,
    pub min_line_search_step_size: f64,
}

impl Default for MinimizerOptions {
    fn default() -> Self {
        Self {
            max_num_iterations: 50,
            max_solver_time_in_seconds: 1e9,
            function_tolerance: 1e-6,
            gradient_tolerance: 1e-10,
            parameter_tolerance: 1e-8,
            trust_region_strategy_type: TrustRegionStrategyType::default(),
            dogleg_type: DoglegType::default(),
            initial_trust_region_radius: 1e4,
            max_trust_region_radius: 1e16,
            min_trust_region_radius: 1e-32,
            min_relative_decrease: 1e-3,
            min_lm_diagonal: 1e-6,
            max_lm_diagonal: 1e32,
            jacobi_scaling: true,
            use_nonmonotonic_steps: false,
            max_consecutive_nonmonotonic_steps: 5,
            max_num_consecutive_invalid_steps: 5,
            eta: 1e-1,
            inner_iteration_tolerance: 1e-3,
            line_search_direction_type: LineSearchDirectionType::default(),
            max_lbfgs_rank: 20,
            line_search_sufficient_function_decrease: 1e-4,
            max_num_line_search_step_size_iterations: 20,
            min_line_search_step_size: 1e-9,
        }
    }
}

/// Outcome of a minimization run.
#[derive(Debug, Clone)]
pub struct MinimizerSummary {
    pub termination_type: TerminationType,
    pub message: String,
    pub iterations: Vec<IterationSummary>,
    /// Lowest-cost state visited.
    pub x: DVector<f64>,
    pub initial_cost: f64,
    pub num_successful_steps: usize,
    pub num_unsuccessful_steps: usize,
    pub num_inner_iteration_steps: usize,
    pub linear_solver_time: Duration,
    pub inner_iteration_time: Duration,
    pub evaluator_statistics: EvaluatorStatistics,
}

impl MinimizerSummary {
    pub(crate) fn new(x: DVector<f64>) -> Self {
        Self {
            termination_type: TerminationType::DidNotRun,
            message: String::new(),
            iterations: Vec::new(),
            x,
            initial_cost: 0.0,
            num_successful_steps: 0,
            num_unsuccessful_steps: 0,
            num_inner_iteration_steps: 0,
            linear_solver_time: Duration::ZERO,
            inner_iteration_time: Duration::ZERO,
            evaluator_statistics: EvaluatorStatistics::default(),
        }
    }

    pub(crate) fn terminate(&mut self, termination_type: TerminationType, message: impl Into<String>) {
        self.termination_type = termination_type;
        self.message = message.into();
    }
}

/// A minimization loop over a contiguous state vector.
pub trait Minimizer {
    /// Minimize starting from `x0`, reporting each iteration to `callbacks`.
    fn minimize(
        &mut self,
        options: &MinimizerOptions,
        x0: &DVector<f64>,
        callbacks: &mut CallbackPipeline<'_>,
    ) -> MinimizerSummary;
}
