//! The record produced by every solve.

use std::fmt::{self, Display, Formatter};

use web_time::Duration;

use crate::core::ordering::ParameterBlockOrdering;
use crate::linalg::{LinearSolverType, PreconditionerType, SparseLinearAlgebraLibraryType};
use crate::optimizer::{
    DoglegType, IterationSummary, LineSearchDirectionType, MinimizerType, TerminationType,
    TrustRegionStrategyType,
};
use crate::solver::SolverOptions;

/// Requested versus used configuration, problem sizes, costs and timings of one solve.
///
/// Costs are `-1.0` until they have been computed; a solve that fails during
/// preprocessing leaves them there and sets [`Summary::error`].
#[derive(Debug, Clone)]
pub struct Summary {
    pub minimizer_type: MinimizerType,
    pub trust_region_strategy_type: TrustRegionStrategyType,
    pub dogleg_type: DoglegType,
    pub line_search_direction_type: LineSearchDirectionType,
    pub sparse_linear_algebra_library_type: SparseLinearAlgebraLibraryType,

    pub linear_solver_type_given: LinearSolverType,
    pub linear_solver_type_used: LinearSolverType,
    pub preconditioner_type_given: PreconditionerType,
    pub preconditioner_type_used: PreconditionerType,
    pub num_threads_given: usize,
    pub num_threads_used: usize,
    pub num_linear_solver_threads_given: usize,
    pub num_linear_solver_threads_used: usize,
    /// Group sizes of the user ordering, empty when none was given.
    pub linear_solver_ordering_given: Vec<usize>,
    /// Group sizes of the ordering applied to the reduced program.
    pub linear_solver_ordering_used: Vec<usize>,
    pub inner_iterations_given: bool,
    pub inner_iterations_used: bool,
    pub inner_iteration_ordering_given: Vec<usize>,
    pub inner_iteration_ordering_used: Vec<usize>,

    pub num_parameter_blocks: usize,
    pub num_parameters: usize,
    pub num_effective_parameters: usize,
    pub num_residual_blocks: usize,
    pub num_residuals: usize,
    pub num_parameter_blocks_reduced: usize,
    pub num_parameters_reduced: usize,
    pub num_effective_parameters_reduced: usize,
    pub num_residual_blocks_reduced: usize,
    pub num_residuals_reduced: usize,

    pub initial_cost: f64,
    pub final_cost: f64,
    /// Cost of the residual blocks that depend only on constant parameter blocks.
    pub fixed_cost: f64,

    pub iterations: Vec<IterationSummary>,
    pub num_successful_steps: usize,
    pub num_unsuccessful_steps: usize,
    pub num_inner_iteration_steps: usize,
    pub num_residual_evaluations: usize,
    pub num_jacobian_evaluations: usize,

    pub preprocessor_time: Duration,
    pub minimizer_time: Duration,
    pub postprocessor_time: Duration,
    pub total_time: Duration,
    pub linear_solver_time: Duration,
    pub residual_evaluation_time: Duration,
    pub jacobian_evaluation_time: Duration,
    pub inner_iteration_time: Duration,

    pub num_gradient_check_mismatches: usize,

    pub termination_type: TerminationType,
    pub message: String,
    /// Set when the solve was rejected before or while preprocessing.
    pub error: Option<String>,
}

impl Default for Summary {
    fn default() -> Self {
        Self::from_options(&SolverOptions::default())
    }
}

impl Summary {
    /// Record the requested configuration. The `used` fields start equal to it.
    pub fn from_options(options: &SolverOptions) -> Self {
        let ordering_sizes = |ordering: Option<&ParameterBlockOrdering>| {
            ordering.map(|o| o.group_sizes()).unwrap_or_default()
        };
        Self {
            minimizer_type: options.minimizer_type,
            trust_region_strategy_type: options.trust_region_strategy_type,
            dogleg_type: options.dogleg_type,
            line_search_direction_type: options.line_search_direction_type,
            sparse_linear_algebra_library_type: options.sparse_linear_algebra_library_type,
            linear_solver_type_given: options.linear_solver_type,
            linear_solver_type_used: options.linear_solver_type,
            preconditioner_type_given: options.preconditioner_type,
            preconditioner_type_used: options.preconditioner_type,
            num_threads_given: options.num_threads,
            num_threads_used: options.num_threads,
            num_linear_solver_threads_given: options.num_linear_solver_threads,
            num_linear_solver_threads_used: options.num_linear_solver_threads,
            linear_solver_ordering_given: ordering_sizes(options.linear_solver_ordering.as_ref()),
            linear_solver_ordering_used: Vec::new(),
            inner_iterations_given: options.use_inner_iterations,
            inner_iterations_used: false,
            inner_iteration_ordering_given: ordering_sizes(
                options.inner_iteration_ordering.as_ref(),
            ),
            inner_iteration_ordering_used: Vec::new(),
            num_parameter_blocks: 0,
            num_parameters: 0,
            num_effective_parameters: 0,
            num_residual_blocks: 0,
            num_residuals: 0,
            num_parameter_blocks_reduced: 0,
            num_parameters_reduced: 0,
            num_effective_parameters_reduced: 0,
            num_residual_blocks_reduced: 0,
            num_residuals_reduced: 0,
            initial_cost: -1.0,
            final_cost: -1.0,
            fixed_cost: 0.0,
            iterations: Vec::new(),
            num_successful_steps: 0,
            num_unsuccessful_steps: 0,
            num_inner_iteration_steps: 0,
            num_residual_evaluations: 0,
            num_jacobian_evaluations: 0,
            preprocessor_time: Duration::ZERO,
            minimizer_time: Duration::ZERO,
            postprocessor_time: Duration::ZERO,
            total_time: Duration::ZERO,
            linear_solver_time: Duration::ZERO,
            residual_evaluation_time: Duration::ZERO,
            jacobian_evaluation_time: Duration::ZERO,
            inner_iteration_time: Duration::ZERO,
            num_gradient_check_mismatches: 0,
            termination_type: TerminationType::DidNotRun,
            message: String::new(),
            error: None,
        }
    }

    /// Whether the state left in the problem is a usable solution.
    pub fn is_solution_usable(&self) -> bool {
        self.error.is_none() && self.termination_type.is_usable()
    }

    /// Number of minimizer iterations, not counting the initial evaluation.
    pub fn num_iterations(&self) -> usize {
        self.iterations.len().saturating_sub(1)
    }

    /// One line with iterations, costs and termination.
    pub fn brief_report(&self) -> String {
        if let Some(error) = &self.error {
            return format!("lsq-solver report: Error: {error}");
        }
        format!(
            "lsq-solver report: Iterations: {}, Initial cost: {:e}, Final cost: {:e}, Termination: {}",
            self.num_iterations(),
            self.initial_cost,
            self.final_cost,
            self.termination_type
        )
    }

    /// Multi-line report of configuration, problem sizes, costs and timings.
    pub fn full_report(&self) -> String {
        self.to_string()
    }
}

fn seconds(duration: Duration) -> f64 {
    duration.as_secs_f64()
}

fn group_sizes(sizes: &[usize]) -> String {
    if sizes.is_empty() {
        return "AUTOMATIC".to_string();
    }
    sizes
        .iter()
        .map(usize::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

impl Display for Summary {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "Solver Summary")?;
        writeln!(f)?;
        writeln!(f, "{:<26}{:>14}{:>14}", "", "Original", "Reduced")?;
        writeln!(
            f,
            "{:<26}{:>14}{:>14}",
            "Parameter blocks", self.num_parameter_blocks, self.num_parameter_blocks_reduced
        )?;
        writeln!(
            f,
            "{:<26}{:>14}{:>14}",
            "Parameters", self.num_parameters, self.num_parameters_reduced
        )?;
        if self.num_effective_parameters != self.num_parameters {
            writeln!(
                f,
                "{:<26}{:>14}{:>14}",
                "Effective parameters",
                self.num_effective_parameters,
                self.num_effective_parameters_reduced
            )?;
        }
        writeln!(
            f,
            "{:<26}{:>14}{:>14}",
            "Residual blocks", self.num_residual_blocks, self.num_residual_blocks_reduced
        )?;
        writeln!(
            f,
            "{:<26}{:>14}{:>14}",
            "Residuals", self.num_residuals, self.num_residuals_reduced
        )?;
        writeln!(f)?;

        writeln!(f, "Minimizer                 {}", self.minimizer_type)?;
        match self.minimizer_type {
            MinimizerType::TrustRegion => {
                writeln!(
                    f,
                    "Trust region strategy     {:?}",
                    self.trust_region_strategy_type
                )?;
                if self.trust_region_strategy_type == TrustRegionStrategyType::Dogleg {
                    writeln!(f, "Dogleg                    {:?}", self.dogleg_type)?;
                }
            }
            MinimizerType::LineSearch => {
                writeln!(
                    f,
                    "Line search direction     {:?}",
                    self.line_search_direction_type
                )?;
            }
        }
        writeln!(f)?;
        writeln!(f, "{:<26}{:>24}{:>24}", "", "Given", "Used")?;
        writeln!(
            f,
            "{:<26}{:>24}{:>24}",
            "Linear solver",
            self.linear_solver_type_given.to_string(),
            self.linear_solver_type_used.to_string()
        )?;
        if self.linear_solver_type_given.is_iterative() || self.linear_solver_type_used.is_iterative()
        {
            writeln!(
                f,
                "{:<26}{:>24}{:>24}",
                "Preconditioner",
                self.preconditioner_type_given.to_string(),
                self.preconditioner_type_used.to_string()
            )?;
        }
        writeln!(
            f,
            "{:<26}{:>24}{:>24}",
            "Sparse linear algebra",
            self.sparse_linear_algebra_library_type.to_string(),
            self.sparse_linear_algebra_library_type.to_string()
        )?;
        writeln!(
            f,
            "{:<26}{:>24}{:>24}",
            "Threads", self.num_threads_given, self.num_threads_used
        )?;
        writeln!(
            f,
            "{:<26}{:>24}{:>24}",
            "Linear solver threads",
            self.num_linear_solver_threads_given,
            self.num_linear_solver_threads_used
        )?;
        writeln!(
            f,
            "{:<26}{:>24}{:>24}",
            "Linear solver ordering",
            group_sizes(&self.linear_solver_ordering_given),
            group_sizes(&self.linear_solver_ordering_used)
        )?;
        if self.inner_iterations_given {
            writeln!(
                f,
                "{:<26}{:>24}{:>24}",
                "Inner iterations",
                "True",
                if self.inner_iterations_used { "True" } else { "False" }
            )?;
            writeln!(
                f,
                "{:<26}{:>24}{:>24}",
                "Inner iteration ordering",
                group_sizes(&self.inner_iteration_ordering_given),
                group_sizes(&self.inner_iteration_ordering_used)
            )?;
        }
        writeln!(f)?;

        if let Some(error) = &self.error {
            writeln!(f, "Error: {error}")?;
            return Ok(());
        }

        writeln!(f, "Cost:")?;
        writeln!(f, "  Initial:   {:.6e}", self.initial_cost)?;
        writeln!(f, "  Final:     {:.6e}", self.final_cost)?;
        writeln!(
            f,
            "  Change:    {:.6e}",
            self.initial_cost - self.final_cost
        )?;
        if self.fixed_cost > 0.0 {
            writeln!(f, "  Fixed:     {:.6e}", self.fixed_cost)?;
        }
        writeln!(f)?;
        writeln!(f, "Iterations:")?;
        writeln!(f, "  Minimizer:          {}", self.num_iterations())?;
        writeln!(f, "  Successful steps:   {}", self.num_successful_steps)?;
        writeln!(f, "  Unsuccessful steps: {}", self.num_unsuccessful_steps)?;
        if self.inner_iterations_used {
            writeln!(f, "  Inner iteration steps: {}", self.num_inner_iteration_steps)?;
        }
        writeln!(f)?;
        writeln!(f, "Time (in seconds):")?;
        writeln!(f, "  Preprocessor:        {:.6}", seconds(self.preprocessor_time))?;
        writeln!(
            f,
            "  Residual evaluation: {:.6} ({} evaluations)",
            seconds(self.residual_evaluation_time),
            self.num_residual_evaluations
        )?;
        writeln!(
            f,
            "  Jacobian evaluation: {:.6} ({} evaluations)",
            seconds(self.jacobian_evaluation_time),
            self.num_jacobian_evaluations
        )?;
        writeln!(f, "  Linear solver:       {:.6}", seconds(self.linear_solver_time))?;
        if self.inner_iterations_used {
            writeln!(f, "  Inner iterations:    {:.6}", seconds(self.inner_iteration_time))?;
        }
        writeln!(f, "  Minimizer:           {:.6}", seconds(self.minimizer_time))?;
        writeln!(f, "  Postprocessor:       {:.6}", seconds(self.postprocessor_time))?;
        writeln!(f, "  Total:               {:.6}", seconds(self.total_time))?;
        writeln!(f)?;
        if self.num_gradient_check_mismatches > 0 {
            writeln!(
                f,
                "Gradient check mismatches: {}",
                self.num_gradient_check_mismatches
            )?;
        }
        write!(f, "Termination: {} ({})", self.termination_type, self.message)
    }
}
