//! Solver configuration.

use std::path::PathBuf;

use tracing::debug;

use crate::core::ordering::ParameterBlockOrdering;
use crate::error::{SolverError, SolverResult};
use crate::linalg::{LinearSolverType, PreconditionerType, SparseLinearAlgebraLibraryType};
use crate::optimizer::{
    DoglegType, LineSearchDirectionType, MinimizerOptions, MinimizerType,
    TrustRegionStrategyType,
};

/// How much the solver reports while it runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LoggingType {
    /// No per-iteration output.
    Silent,
    /// One table row per minimizer iteration.
    #[default]
    PerMinimizerIteration,
}

/// Everything that controls a call to [`Solver::solve`](crate::solver::Solver::solve).
///
/// Defaults suit medium sized bundle adjustment problems. Use the `with_*` methods to adjust them:
///
/// ```
/// use lsq_solver::linalg::LinearSolverType;
/// use lsq_solver::solver::SolverOptions;
///
/// let options = SolverOptions::default()
///     .with_linear_solver_type(LinearSolverType::SparseSchur)
///     .with_max_num_iterations(100)
///     .with_num_threads(4);
/// assert!(options.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct SolverOptions {
    pub minimizer_type: MinimizerType,
    pub line_search_direction_type: LineSearchDirectionType,
    pub max_lbfgs_rank: usize,
    pub trust_region_strategy_type: TrustRegionStrategyType,
    pub dogleg_type: DoglegType,
    pub use_nonmonotonic_steps: bool,
    pub max_consecutive_nonmonotonic_steps: usize,

    pub max_num_iterations: usize,
    pub max_solver_time_in_seconds: f64,
    /// Threads used for residual and Jacobian evaluation.
    pub num_threads: usize,
    /// Threads used by the linear solver.
    pub num_linear_solver_threads: usize,

    pub initial_trust_region_radius: f64,
    pub max_trust_region_radius: f64,
    pub min_trust_region_radius: f64,
    pub min_relative_decrease: f64,
    pub min_lm_diagonal: f64,
    pub max_lm_diagonal: f64,
    pub max_num_consecutive_invalid_steps: usize,

    pub function_tolerance: f64,
    pub gradient_tolerance: f64,
    pub parameter_tolerance: f64,

    pub linear_solver_type: LinearSolverType,
    pub preconditioner_type: PreconditionerType,
    pub sparse_linear_algebra_library_type: SparseLinearAlgebraLibraryType,
    /// Elimination ordering. `None` lets the solver choose one.
    pub linear_solver_ordering: Option<ParameterBlockOrdering>,

    pub use_inner_iterations: bool,
    /// Groups optimized by inner iterations. `None` computes them automatically.
    pub inner_iteration_ordering: Option<ParameterBlockOrdering>,
    pub inner_iteration_tolerance: f64,

    pub min_linear_solver_iterations: usize,
    pub max_linear_solver_iterations: usize,
    pub eta: f64,
    pub jacobi_scaling: bool,

    pub logging_type: LoggingType,
    pub minimizer_progress_to_stdout: bool,
    /// Plain-text per-iteration log written during the solve.
    pub solver_log: Option<PathBuf>,

    pub check_gradients: bool,
    pub gradient_check_relative_precision: f64,
    pub gradient_check_numeric_derivative_relative_step_size: f64,

    /// Copy accepted states into the problem after every iteration.
    pub update_state_every_iteration: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        let minimizer = MinimizerOptions::default();
        Self {
            minimizer_type: MinimizerType::default(),
            line_search_direction_type: minimizer.line_search_direction_type,
            max_lbfgs_rank: minimizer.max_lbfgs_rank,
            trust_region_strategy_type: minimizer.trust_region_strategy_type,
            dogleg_type: minimizer.dogleg_type,
            use_nonmonotonic_steps: minimizer.use_nonmonotonic_steps,
            max_consecutive_nonmonotonic_steps: minimizer.max_consecutive_nonmonotonic_steps,
            max_num_iterations: minimizer.max_num_iterations,
            max_solver_time_in_seconds: minimizer.max_solver_time_in_seconds,
            num_threads: 1,
            num_linear_solver_threads: 1,
            initial_trust_region_radius: minimizer.initial_trust_region_radius,
            max_trust_region_radius: minimizer.max_trust_region_radius,
            min_trust_region_radius: minimizer.min_trust_region_radius,
            min_relative_decrease: minimizer.min_relative_decrease,
            min_lm_diagonal: minimizer.min_lm_diagonal,
            max_lm_diagonal: minimizer.max_lm_diagonal,
            max_num_consecutive_invalid_steps: minimizer.max_num_consecutive_invalid_steps,
            function_tolerance: minimizer.function_tolerance,
            gradient_tolerance: minimizer.gradient_tolerance,
            parameter_tolerance: minimizer.parameter_tolerance,
            linear_solver_type: LinearSolverType::default(),
            preconditioner_type: PreconditionerType::default(),
            sparse_linear_algebra_library_type: SparseLinearAlgebraLibraryType::default(),
            linear_solver_ordering: None,
            use_inner_iterations: false,
            inner_iteration_ordering: None,
            inner_iteration_tolerance: minimizer.inner_iteration_tolerance,
            min_linear_solver_iterations: 1,
            max_linear_solver_iterations: 500,
            eta: minimizer.eta,
            jacobi_scaling: minimizer.jacobi_scaling,
            logging_type: LoggingType::default(),
            minimizer_progress_to_stdout: false,
            solver_log: None,
            check_gradients: false,
            gradient_check_relative_precision: 1e-8,
            gradient_check_numeric_derivative_relative_step_size: 1e-6,
            update_state_every_iteration: false,
        }
    }
}

impl SolverOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_minimizer_type(mut self, minimizer_type: MinimizerType) -> Self {
        self.minimizer_type = minimizer_type;
        self
    }

    pub fn with_line_search_direction_type(mut self, direction: LineSearchDirectionType) -> Self {
        self.line_search_direction_type = direction;
        self
    }

    pub fn with_trust_region_strategy_type(mut self, strategy: TrustRegionStrategyType) -> Self {
        self.trust_region_strategy_type = strategy;
        self
    }

    pub fn with_dogleg_type(mut self, dogleg_type: DoglegType) -> Self {
        self.dogleg_type = dogleg_type;
        self
    }

    /// Accept steps that increase the cost as long as the cost stays below a reference
    /// value from recent iterations.
    pub fn with_nonmonotonic_steps(mut self, max_consecutive: usize) -> Self {
        self.use_nonmonotonic_steps = true;
        self.max_consecutive_nonmonotonic_steps = max_consecutive;
        self
    }

    pub fn with_max_num_iterations(mut self, max_num_iterations: usize) -> Self {
        self.max_num_iterations = max_num_iterations;
        self
    }

    pub fn with_max_solver_time(mut self, seconds: f64) -> Self {
        self.max_solver_time_in_seconds = seconds;
        self
    }

    /// Set both the evaluation and the linear solver thread counts.
    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self.num_linear_solver_threads = num_threads;
        self
    }

    pub fn with_num_linear_solver_threads(mut self, num_threads: usize) -> Self {
        self.num_linear_solver_threads = num_threads;
        self
    }

    /// Set the initial, maximum and minimum trust region radius.
    pub fn with_trust_region_radius(mut self, initial: f64, max: f64, min: f64) -> Self {
        self.initial_trust_region_radius = initial;
        self.max_trust_region_radius = max;
        self.min_trust_region_radius = min;
        self
    }

    pub fn with_lm_diagonal_bounds(mut self, min: f64, max: f64) -> Self {
        self.min_lm_diagonal = min;
        self.max_lm_diagonal = max;
        self
    }

    pub fn with_function_tolerance(mut self, tolerance: f64) -> Self {
        self.function_tolerance = tolerance;
        self
    }

    pub fn with_gradient_tolerance(mut self, tolerance: f64) -> Self {
        self.gradient_tolerance = tolerance;
        self
    }

    pub fn with_parameter_tolerance(mut self, tolerance: f64) -> Self {
        self.parameter_tolerance = tolerance;
        self
    }

    pub fn with_linear_solver_type(mut self, linear_solver_type: LinearSolverType) -> Self {
        self.linear_solver_type = linear_solver_type;
        self
    }

    pub fn with_preconditioner_type(mut self, preconditioner_type: PreconditionerType) -> Self {
        self.preconditioner_type = preconditioner_type;
        self
    }

    pub fn with_sparse_linear_algebra_library(
        mut self,
        library: SparseLinearAlgebraLibraryType,
    ) -> Self {
        self.sparse_linear_algebra_library_type = library;
        self
    }

    pub fn with_linear_solver_ordering(mut self, ordering: ParameterBlockOrdering) -> Self {
        self.linear_solver_ordering = Some(ordering);
        self
    }

    pub fn with_linear_solver_iterations(mut self, min: usize, max: usize) -> Self {
        self.min_linear_solver_iterations = min;
        self.max_linear_solver_iterations = max;
        self
    }

    /// Enable inner iterations, optionally with explicit groups.
    pub fn with_inner_iterations(mut self, ordering: Option<ParameterBlockOrdering>) -> Self {
        self.use_inner_iterations = true;
        self.inner_iteration_ordering = ordering;
        self
    }

    pub fn with_jacobi_scaling(mut self, jacobi_scaling: bool) -> Self {
        self.jacobi_scaling = jacobi_scaling;
        self
    }

    pub fn with_logging_type(mut self, logging_type: LoggingType) -> Self {
        self.logging_type = logging_type;
        self
    }

    pub fn with_progress_to_stdout(mut self, to_stdout: bool) -> Self {
        self.minimizer_progress_to_stdout = to_stdout;
        self
    }

    pub fn with_solver_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.solver_log = Some(path.into());
        self
    }

    /// Compare analytic Jacobians against central differences during the solve.
    pub fn with_gradient_checking(mut self, relative_precision: f64, relative_step_size: f64) -> Self {
        self.check_gradients = true;
        self.gradient_check_relative_precision = relative_precision;
        self.gradient_check_numeric_derivative_relative_step_size = relative_step_size;
        self
    }

    pub fn with_update_state_every_iteration(mut self, update: bool) -> Self {
        self.update_state_every_iteration = update;
        self
    }

    /// Check ranges and relations between options.
    ///
    /// # Errors
    /// Returns `SolverError::InvalidOptions` naming the first offending option.
    pub fn validate(&self) -> SolverResult<()> {
        fn invalid(message: String) -> SolverResult<()> {
            Err(SolverError::InvalidOptions(message).log())
        }

        if self.max_solver_time_in_seconds < 0.0 {
            return invalid(format!(
                "max_solver_time_in_seconds must be non-negative, got {}",
                self.max_solver_time_in_seconds
            ));
        }
        if self.num_threads == 0 || self.num_linear_solver_threads == 0 {
            return invalid(format!(
                "thread counts must be positive, got num_threads {} and num_linear_solver_threads {}",
                self.num_threads, self.num_linear_solver_threads
            ));
        }
        for (name, value) in [
            ("function_tolerance", self.function_tolerance),
            ("gradient_tolerance", self.gradient_tolerance),
            ("parameter_tolerance", self.parameter_tolerance),
            ("inner_iteration_tolerance", self.inner_iteration_tolerance),
            ("min_relative_decrease", self.min_relative_decrease),
        ] {
            if value.is_nan() || value < 0.0 {
                return invalid(format!("{name} must be non-negative, got {value}"));
            }
        }

        if self.minimizer_type == MinimizerType::TrustRegion {
            if self.initial_trust_region_radius.is_nan() || self.initial_trust_region_radius <= 0.0 {
                return invalid(format!(
                    "initial_trust_region_radius must be positive, got {}",
                    self.initial_trust_region_radius
                ));
            }
            if self.min_trust_region_radius > self.initial_trust_region_radius
                || self.initial_trust_region_radius > self.max_trust_region_radius
            {
                return invalid(format!(
                    "trust region radii must satisfy min ({:e}) <= initial ({:e}) <= max ({:e})",
                    self.min_trust_region_radius,
                    self.initial_trust_region_radius,
                    self.max_trust_region_radius
                ));
            }
            if self.min_lm_diagonal.is_nan()
                || self.min_lm_diagonal <= 0.0
                || self.min_lm_diagonal > self.max_lm_diagonal
            {
                return invalid(format!(
                    "LM diagonal bounds must satisfy 0 < min ({:e}) <= max ({:e})",
                    self.min_lm_diagonal, self.max_lm_diagonal
                ));
            }
            if self.eta.is_nan() || self.eta <= 0.0 {
                return invalid(format!("eta must be positive, got {}", self.eta));
            }
        } else if self.line_search_direction_type == LineSearchDirectionType::Lbfgs
            && self.max_lbfgs_rank == 0
        {
            return invalid("max_lbfgs_rank must be positive for L-BFGS".to_string());
        }

        if self.check_gradients
            && (self.gradient_check_relative_precision.is_nan()
                || self.gradient_check_relative_precision <= 0.0
                || self.gradient_check_numeric_derivative_relative_step_size.is_nan()
                || self.gradient_check_numeric_derivative_relative_step_size <= 0.0)
        {
            return invalid(format!(
                "gradient checking needs positive precision and step size, got {:e} and {:e}",
                self.gradient_check_relative_precision,
                self.gradient_check_numeric_derivative_relative_step_size
            ));
        }
        Ok(())
    }

    /// The subset of options the minimizer loop reads.
    pub fn to_minimizer_options(&self) -> MinimizerOptions {
        MinimizerOptions {
            max_num_iterations: self.max_num_iterations,
            max_solver_time_in_seconds: self.max_solver_time_in_seconds,
            function_tolerance: self.function_tolerance,
            gradient_tolerance: self.gradient_tolerance,
            parameter_tolerance: self.parameter_tolerance,
            trust_region_strategy_type: self.trust_region_strategy_type,
            dogleg_type: self.dogleg_type,
            initial_trust_region_radius: self.initial_trust_region_radius,
            max_trust_region_radius: self.max_trust_region_radius,
            min_trust_region_radius: self.min_trust_region_radius,
            min_relative_decrease: self.min_relative_decrease,
            min_lm_diagonal: self.min_lm_diagonal,
            max_lm_diagonal: self.max_lm_diagonal,
            jacobi_scaling: self.jacobi_scaling,
            use_nonmonotonic_steps: self.use_nonmonotonic_steps,
            max_consecutive_nonmonotonic_steps: self.max_consecutive_nonmonotonic_steps,
            max_num_consecutive_invalid_steps: self.max_num_consecutive_invalid_steps,
            eta: self.eta,
            inner_iteration_tolerance: self.inner_iteration_tolerance,
            line_search_direction_type: self.line_search_direction_type,
            max_lbfgs_rank: self.max_lbfgs_rank,
            ..MinimizerOptions::default()
        }
    }

    /// Print configuration parameters (debug level)
    pub fn print_configuration(&self) {
        debug!(
            "Configuration:\n  Minimizer:           {}\n  Trust region:        {:?} ({:?})\n  Line search:         {:?}\n  Linear solver:       {}\n  Preconditioner:      {}\n  Sparse library:      {}\n  Convergence Criteria:\n  Max iterations:      {}\n  Max time:            {:.2}s\n  Function tolerance:  {:.2e}\n  Gradient tolerance:  {:.2e}\n  Parameter tolerance: {:.2e}\n  Trust Region:\n  Initial radius:      {:.2e}\n  Radius range:        [{:.2e}, {:.2e}]\n  Min rel. decrease:   {:.2e}\n  Threads:\n  Evaluation:          {}\n  Linear solver:       {}\n  Numerical Settings:\n  Jacobi scaling:      {}\n  Non-monotonic steps: {}\n  Inner iterations:    {}\n  Gradient checking:   {}",
            self.minimizer_type,
            self.trust_region_strategy_type,
            self.dogleg_type,
            self.line_search_direction_type,
            self.linear_solver_type,
            self.preconditioner_type,
            self.sparse_linear_algebra_library_type,
            self.max_num_iterations,
            self.max_solver_time_in_seconds,
            self.function_tolerance,
            self.gradient_tolerance,
            self.parameter_tolerance,
            self.initial_trust_region_radius,
            self.min_trust_region_radius,
            self.max_trust_region_radius,
            self.min_relative_decrease,
            self.num_threads,
            self.num_linear_solver_threads,
            enabled(self.jacobi_scaling),
            enabled(self.use_nonmonotonic_steps),
            enabled(self.use_inner_iterations),
            enabled(self.check_gradients),
        );
    }
}

fn enabled(flag: bool) -> &'static str {
    if flag { "enabled" } else { "disabled" }
}
