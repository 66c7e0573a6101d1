//! Solving a [`Problem`] end to end.
//!
//! [`Solver::solve`] runs the full pipeline:
//!
//! ```text
//! validate options → reduce (fixed cost, ordering, Schur fallback)
//!   → linear solver → evaluator → inner iterations → minimizer → write back
//! ```
//!
//! Every outcome, including configuration errors, is reported through the returned
//! [`Summary`]; `solve` itself never fails.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use lsq_solver::core::cost_function::{CostFunction, CostFunctionOutput};
//! use lsq_solver::core::problem::Problem;
//! use lsq_solver::solver::{Solver, SolverOptions};
//! use nalgebra::{DMatrix, DVector};
//!
//! /// r = x − 3
//! struct Offset;
//!
//! impl CostFunction for Offset {
//!     fn num_residuals(&self) -> usize { 1 }
//!     fn parameter_block_sizes(&self) -> &[usize] { &[1] }
//!     fn evaluate(&self, p: &[DVector<f64>], jacobians: bool) -> Option<CostFunctionOutput> {
//!         let r = DVector::from_vec(vec![p[0][0] - 3.0]);
//!         Some((r, jacobians.then(|| vec![DMatrix::from_element(1, 1, 1.0)])))
//!     }
//! }
//!
//! let mut problem = Problem::new();
//! let x = problem.add_parameter_block(DVector::from_vec(vec![0.0]));
//! problem.add_residual_block(Arc::new(Offset), None, &[x]).unwrap();
//!
//! let summary = Solver::new(SolverOptions::default()).solve(&mut problem);
//! assert!(summary.is_solution_usable());
//! assert!((problem.parameter_values(x).unwrap()[0] - 3.0).abs() < 1e-6);
//! ```

pub mod factory;
pub mod options;
pub mod reducer;
pub mod reorder;
pub mod summary;

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use tracing::{debug, error, warn};
use web_time::Instant;

use crate::callbacks::{
    CallbackPipeline, FileLoggingCallback, IterationCallback, ProgressLoggingCallback,
    StateUpdatingCallback,
};
use crate::core::{CoreError, ordering::ParameterBlockOrdering, problem::Problem, program::Program};
use crate::error::SolverResult;
use crate::evaluator::GradientCheckingOptions;
use crate::optimizer::{
    LineSearchMinimizer, Minimizer, TerminationType, TrustRegionMinimizer, run_minimizer,
    strategy::create_trust_region_strategy,
};

pub use crate::optimizer::MinimizerType;
pub use options::{LoggingType, SolverOptions};
pub use reducer::ReducedProgram;
pub use summary::Summary;

/// Solver options plus the user callbacks run after every iteration.
pub struct Solver {
    options: SolverOptions,
    callbacks: Vec<Box<dyn IterationCallback>>,
}

impl Solver {
    pub fn new(options: SolverOptions) -> Self {
        Self {
            options,
            callbacks: Vec::new(),
        }
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    /// Append a callback. Callbacks run in the order they were added, after the solver's
    /// own state updating and logging stages.
    pub fn add_callback(&mut self, callback: Box<dyn IterationCallback>) -> &mut Self {
        self.callbacks.push(callback);
        self
    }

    /// Minimize the cost of `problem`, updating its parameter values in place.
    ///
    /// Parameter values are written back unless the minimizer stopped with `USER_ABORT` or
    /// `NUMERICAL_FAILURE`. With `update_state_every_iteration` the values of the last
    /// accepted step are already in place at that point.
    pub fn solve(&mut self, problem: &mut Problem) -> Summary {
        let start = Instant::now();
        let mut summary = Summary::from_options(&self.options);
        let original = Program::from_problem(problem);

        if let Err(e) = self.solve_program(problem, &original, &mut summary, start) {
            let message = e.chain_compact();
            error!("Solve failed: {}", message);
            summary.message = message.clone();
            summary.error = Some(message);
        }

        if let Err(e) = original.set_parameter_offsets_and_index(problem) {
            warn!("Restoring parameter block bookkeeping failed: {}", e);
        }
        summary.total_time = start.elapsed();
        debug!("{}", summary.brief_report());
        summary
    }

    fn solve_program(
        &mut self,
        problem: &mut Problem,
        original: &Program,
        summary: &mut Summary,
        start: Instant,
    ) -> SolverResult<()> {
        let mut options = self.options.clone();

        summary.num_parameter_blocks = problem.num_parameter_blocks();
        summary.num_parameters = problem.num_parameters();
        summary.num_effective_parameters = original.num_effective_parameters(problem)?;
        summary.num_residual_blocks = problem.num_residual_blocks();
        summary.num_residuals = problem.num_residuals();
        if problem.num_parameter_blocks() == 0 || problem.num_residual_blocks() == 0 {
            return Err(CoreError::InvalidInput(format!(
                "problem is empty: {} parameter blocks, {} residual blocks",
                problem.num_parameter_blocks(),
                problem.num_residual_blocks()
            ))
            .log()
            .into());
        }

        options.validate()?;
        options.print_configuration();

        if !cfg!(feature = "parallel")
            && (options.num_threads > 1 || options.num_linear_solver_threads > 1)
        {
            warn!(
                "Built without the parallel feature; using 1 thread instead of {} evaluation and {} linear solver threads",
                options.num_threads, options.num_linear_solver_threads
            );
            options.num_threads = 1;
            options.num_linear_solver_threads = 1;
        }
        summary.num_threads_used = options.num_threads;
        summary.num_linear_solver_threads_used = options.num_linear_solver_threads;

        let gradient_checking = options.check_gradients.then(|| GradientCheckingOptions {
            relative_step_size: options.gradient_check_numeric_derivative_relative_step_size,
            relative_precision: options.gradient_check_relative_precision,
            mismatches: Arc::new(AtomicUsize::new(0)),
        });
        let mismatches = gradient_checking.as_ref().map(|check| check.mismatches.clone());

        let ordering = match &options.linear_solver_ordering {
            Some(ordering) => {
                reducer::validate_ordering(problem, original, ordering, options.linear_solver_type)?;
                ordering.clone()
            }
            None => {
                let mut ordering = ParameterBlockOrdering::new();
                for &id in original.parameter_blocks() {
                    ordering.add_element_to_group(id, 0);
                }
                ordering
            }
        };

        let reduced = reducer::create_reduced_program(
            problem,
            original,
            ordering,
            options.linear_solver_type,
            options.preconditioner_type,
        )?;
        summary.linear_solver_type_used = reduced.linear_solver_type;
        summary.preconditioner_type_used = reduced.preconditioner_type;
        summary.linear_solver_ordering_used = reduced.ordering.group_sizes();
        summary.fixed_cost = reduced.fixed_cost;
        summary.num_parameter_blocks_reduced = reduced.program.num_parameter_blocks();
        summary.num_parameters_reduced = reduced.program.num_parameters(problem)?;
        summary.num_effective_parameters_reduced =
            reduced.program.num_effective_parameters(problem)?;
        summary.num_residual_blocks_reduced = reduced.program.num_residual_blocks();
        summary.num_residuals_reduced = reduced.program.num_residuals(problem)?;

        if reduced.program.num_parameter_blocks() == 0 {
            summary.initial_cost = reduced.fixed_cost;
            summary.final_cost = reduced.fixed_cost;
            summary.termination_type = TerminationType::FunctionTolerance;
            summary.message =
                "Function tolerance reached. No non-constant parameter blocks found.".to_string();
            summary.preprocessor_time = start.elapsed();
            return Ok(());
        }

        let linear_solver = match options.minimizer_type {
            MinimizerType::TrustRegion => Some(factory::create_linear_solver(&options, &reduced)?),
            MinimizerType::LineSearch => None,
        };
        let evaluator =
            factory::create_reduced_evaluator(&options, problem, &reduced, gradient_checking)?;

        let inner_iterations = match (options.use_inner_iterations, options.minimizer_type) {
            (false, _) => None,
            (true, MinimizerType::TrustRegion) => {
                factory::create_inner_iteration_minimizer(&options, problem, &reduced, &evaluator)?
            }
            (true, MinimizerType::LineSearch) => {
                warn!("Inner iterations are only used by the trust region minimizer; ignoring them");
                None
            }
        };
        let inner_iterations = inner_iterations.map(|(minimizer, ordering)| {
            summary.inner_iterations_used = true;
            summary.inner_iteration_ordering_used = ordering.group_sizes();
            minimizer
        });

        let minimizer_options = options.to_minimizer_options();
        let mut minimizer: Box<dyn Minimizer> = match linear_solver {
            Some(linear_solver) => {
                let strategy = create_trust_region_strategy(&minimizer_options, linear_solver);
                Box::new(TrustRegionMinimizer::new(evaluator, strategy, inner_iterations))
            }
            None => Box::new(LineSearchMinimizer::new(evaluator)),
        };

        let mut x = reduced.program.parameter_blocks_to_state_vector(problem)?;
        summary.preprocessor_time = start.elapsed();

        let outcome = {
            let mut pipeline = CallbackPipeline::new(self.callbacks.as_mut_slice());
            if options.update_state_every_iteration {
                pipeline =
                    pipeline.with_state_updater(StateUpdatingCallback::new(problem, &reduced.program));
            }
            if options.logging_type != LoggingType::Silent {
                pipeline = pipeline.with_progress_logger(ProgressLoggingCallback::new(
                    options.minimizer_type,
                    options.minimizer_progress_to_stdout,
                ));
            }
            if let Some(path) = &options.solver_log {
                pipeline = pipeline
                    .with_file_logger(FileLoggingCallback::create(path, options.minimizer_type)?);
            }
            run_minimizer(minimizer.as_mut(), &minimizer_options, &mut x, &mut pipeline)
        };

        let postprocessor_start = Instant::now();
        let result = outcome.summary;
        summary.minimizer_time = outcome.minimizer_time;
        // No recorded iteration means the initial point never evaluated; keep the -1 costs.
        if let Some(final_cost) = outcome.final_cost {
            summary.initial_cost = result.initial_cost + reduced.fixed_cost;
            summary.final_cost = final_cost + reduced.fixed_cost;
        }
        summary.num_successful_steps = result.num_successful_steps;
        summary.num_unsuccessful_steps = result.num_unsuccessful_steps;
        summary.num_inner_iteration_steps = result.num_inner_iteration_steps;
        summary.linear_solver_time = result.linear_solver_time;
        summary.inner_iteration_time = result.inner_iteration_time;
        let statistics = result.evaluator_statistics;
        summary.num_residual_evaluations = statistics.num_residual_evaluations;
        summary.num_jacobian_evaluations = statistics.num_jacobian_evaluations;
        summary.residual_evaluation_time = statistics.residual_evaluation_time;
        summary.jacobian_evaluation_time = statistics.jacobian_evaluation_time;
        summary.iterations = result.iterations;
        summary.termination_type = result.termination_type;
        summary.message = result.message;

        if outcome.write_back {
            reduced.program.state_vector_to_parameter_blocks(&x, problem)?;
        }
        if let Some(mismatches) = mismatches {
            summary.num_gradient_check_mismatches = mismatches.load(Ordering::Relaxed);
            if summary.num_gradient_check_mismatches > 0 {
                warn!(
                    "Gradient checking found {} mismatching Jacobian blocks",
                    summary.num_gradient_check_mismatches
                );
            }
        }
        summary.postprocessor_time = postprocessor_start.elapsed();
        Ok(())
    }
}

/// Solve `problem` with `options` and no user callbacks.
pub fn solve(options: &SolverOptions, problem: &mut Problem) -> Summary {
    Solver::new(options.clone()).solve(problem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::CallbackReturnType;
    use crate::core::cost_function::{CostFunction, CostFunctionOutput};
    use crate::core::problem::tests::sum_cost;
    use crate::linalg::LinearSolverType;
    use crate::optimizer::IterationSummary;
    use nalgebra::DVector;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    struct AbortAt(usize);

    /// Fails every evaluation.
    struct Unevaluable;

    impl CostFunction for Unevaluable {
        fn num_residuals(&self) -> usize {
            1
        }

        fn parameter_block_sizes(&self) -> &[usize] {
            &[1]
        }

        fn evaluate(&self, _parameters: &[DVector<f64>], _jacobians: bool) -> Option<CostFunctionOutput> {
            None
        }
    }

    impl IterationCallback for AbortAt {
        fn on_iteration(&mut self, summary: &IterationSummary, _x: &DVector<f64>) -> CallbackReturnType {
            if summary.iteration >= self.0 {
                CallbackReturnType::Abort
            } else {
                CallbackReturnType::Continue
            }
        }
    }

    #[test]
    fn test_empty_problem_is_rejected() {
        let mut problem = Problem::new();
        let summary = solve(&SolverOptions::default(), &mut problem);
        assert!(summary.error.is_some());
        assert_eq!(summary.termination_type, TerminationType::DidNotRun);
        assert!(!summary.is_solution_usable());

        problem.add_parameter_block(DVector::zeros(2));
        let summary = solve(&SolverOptions::default(), &mut problem);
        assert!(summary.error.is_some());
    }

    #[test]
    fn test_invalid_options_are_reported() -> TestResult {
        let mut problem = Problem::new();
        let a = problem.add_parameter_block(DVector::zeros(1));
        problem.add_residual_block(sum_cost(&[1], 1.0), None, &[a])?;
        let summary = solve(&SolverOptions::default().with_num_threads(0), &mut problem);
        let error = summary.error.ok_or("expected an error")?;
        assert!(error.contains("thread counts"));
        assert_eq!(problem.parameter_values(a)?[0], 0.0);
        Ok(())
    }

    #[test]
    fn test_solve_writes_back_and_restores_bookkeeping() -> TestResult {
        let mut problem = Problem::new();
        let a = problem.add_parameter_block(DVector::from_vec(vec![0.0]));
        let b = problem.add_parameter_block(DVector::from_vec(vec![0.0, 0.0]));
        let frozen = problem.add_parameter_block(DVector::from_vec(vec![1.0]));
        problem.set_parameter_block_constant(frozen)?;
        problem.add_residual_block(sum_cost(&[1], 2.0), None, &[a])?;
        problem.add_residual_block(sum_cost(&[2, 1], 4.0), None, &[b, frozen])?;
        // Fully constant: r = 1 − 3, fixed cost 2.
        problem.add_residual_block(sum_cost(&[1], 3.0), None, &[frozen])?;

        let summary = solve(&SolverOptions::default(), &mut problem);
        assert!(summary.error.is_none(), "{:?}", summary.error);
        assert!(summary.is_solution_usable());
        assert_eq!(summary.num_parameter_blocks_reduced, 2);
        assert_eq!(summary.num_residual_blocks_reduced, 2);
        assert!((summary.fixed_cost - 2.0).abs() < 1e-12);
        assert!((summary.final_cost - 2.0).abs() < 1e-8);
        assert!(summary.final_cost <= summary.initial_cost);

        assert!((problem.parameter_values(a)?[0] - 2.0).abs() < 1e-6);
        assert!((problem.parameter_values(b)?.sum() - 3.0).abs() < 1e-6);
        assert!(Program::from_problem(&problem).is_valid(&problem));
        Ok(())
    }

    #[test]
    fn test_abort_keeps_user_state() -> TestResult {
        let mut problem = Problem::new();
        let a = problem.add_parameter_block(DVector::from_vec(vec![0.0]));
        problem.add_residual_block(sum_cost(&[1], 5.0), None, &[a])?;

        let mut solver = Solver::new(SolverOptions::default().with_logging_type(LoggingType::Silent));
        solver.add_callback(Box::new(AbortAt(0)));
        let summary = solver.solve(&mut problem);
        assert_eq!(summary.termination_type, TerminationType::UserAbort);
        assert_eq!(problem.parameter_values(a)?[0], 0.0);
        Ok(())
    }

    #[test]
    fn test_state_updates_every_iteration() -> TestResult {
        let mut problem = Problem::new();
        let a = problem.add_parameter_block(DVector::from_vec(vec![0.0]));
        problem.add_residual_block(sum_cost(&[1], 5.0), None, &[a])?;

        let options = SolverOptions::default().with_update_state_every_iteration(true);
        let mut solver = Solver::new(options);
        solver.add_callback(Box::new(AbortAt(1)));
        let summary = solver.solve(&mut problem);
        assert_eq!(summary.termination_type, TerminationType::UserAbort);
        // The accepted step of iteration 1 reached user memory before the abort.
        assert!((problem.parameter_values(a)?[0] - 5.0).abs() < 1e-2);
        Ok(())
    }

    #[test]
    fn test_given_and_used_solver_differ_after_fallback() -> TestResult {
        let mut problem = Problem::new();
        let point = problem.add_parameter_block(DVector::from_vec(vec![1.0]));
        let camera = problem.add_parameter_block(DVector::from_vec(vec![0.0, 0.0]));
        problem.set_parameter_block_constant(point)?;
        problem.add_residual_block(sum_cost(&[1, 2], 3.0), None, &[point, camera])?;

        let mut ordering = ParameterBlockOrdering::new();
        ordering.add_element_to_group(point, 0);
        ordering.add_element_to_group(camera, 1);
        let options = SolverOptions::default()
            .with_linear_solver_type(LinearSolverType::DenseSchur)
            .with_linear_solver_ordering(ordering);
        let summary = solve(&options, &mut problem);
        assert!(summary.error.is_none(), "{:?}", summary.error);
        assert_eq!(summary.linear_solver_type_given, LinearSolverType::DenseSchur);
        assert_eq!(summary.linear_solver_type_used, LinearSolverType::DenseQr);
        assert_eq!(summary.linear_solver_ordering_given, vec![1, 1]);
        assert_eq!(summary.linear_solver_ordering_used, vec![1]);
        Ok(())
    }

    #[test]
    fn test_failed_initial_evaluation_leaves_costs_unset() -> TestResult {
        let mut problem = Problem::new();
        let frozen = problem.add_parameter_block(DVector::from_vec(vec![1.0]));
        let x = problem.add_parameter_block(DVector::from_vec(vec![4.0]));
        problem.set_parameter_block_constant(frozen)?;
        problem.add_residual_block(sum_cost(&[1], 3.0), None, &[frozen])?;
        problem.add_residual_block(Arc::new(Unevaluable), None, &[x])?;

        let summary = solve(&SolverOptions::default(), &mut problem);
        assert!(summary.error.is_none(), "{:?}", summary.error);
        assert_eq!(summary.termination_type, TerminationType::NumericalFailure);
        assert!(summary.iterations.is_empty());
        assert!((summary.fixed_cost - 2.0).abs() < 1e-12);
        assert_eq!(summary.initial_cost, -1.0);
        assert_eq!(summary.final_cost, -1.0);
        assert!(!summary.is_solution_usable());
        assert_eq!(problem.parameter_values(x)?[0], 4.0);
        Ok(())
    }

    #[cfg(not(feature = "parallel"))]
    #[test]
    fn test_thread_counts_clamped_without_parallel_feature() -> TestResult {
        let mut problem = Problem::new();
        let a = problem.add_parameter_block(DVector::from_vec(vec![0.0]));
        problem.add_residual_block(sum_cost(&[1], 1.0), None, &[a])?;

        let summary = solve(&SolverOptions::default().with_num_threads(4), &mut problem);
        assert!(summary.error.is_none(), "{:?}", summary.error);
        assert_eq!(summary.num_threads_given, 4);
        assert_eq!(summary.num_linear_solver_threads_given, 4);
        assert_eq!(summary.num_threads_used, 1);
        assert_eq!(summary.num_linear_solver_threads_used, 1);
        Ok(())
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn test_thread_counts_kept_with_parallel_feature() -> TestResult {
        let mut problem = Problem::new();
        let a = problem.add_parameter_block(DVector::from_vec(vec![0.0]));
        problem.add_residual_block(sum_cost(&[1], 1.0), None, &[a])?;

        let summary = solve(&SolverOptions::default().with_num_threads(4), &mut problem);
        assert!(summary.error.is_none(), "{:?}", summary.error);
        assert_eq!(summary.num_threads_used, 4);
        assert_eq!(summary.num_linear_solver_threads_used, 4);
        Ok(())
    }
}
