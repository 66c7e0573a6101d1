//! Construction of the run-owned pieces of a solve: linear solver, evaluator and inner
//! iteration minimizer, each configured for the reduced program.

use tracing::{debug, warn};

use crate::core::{
    CoreError, graph::is_independent, graph::recursive_independent_set_ordering,
    ordering::ParameterBlockOrdering, problem::Problem,
};
use crate::error::{SolverError, SolverResult};
use crate::evaluator::{Evaluator, EvaluatorOptions, GradientCheckingOptions, create_evaluator};
use crate::linalg::{self, LinearSolver, LinearSolverOptions};
use crate::optimizer::{
    CoordinateDescentMinimizer, MinimizerType, OptimizerError, TrustRegionStrategyType,
};
use crate::solver::{SolverOptions, reducer::ReducedProgram};

/// Elimination group sizes handed to the linear solver.
///
/// Schur-type solvers need an f-block group even when every block is eliminated, so a
/// single group is followed by an explicit empty one.
pub fn elimination_groups(reduced: &ReducedProgram) -> Vec<usize> {
    let mut groups = reduced.ordering.group_sizes();
    if reduced.linear_solver_type.is_schur_type() && groups.len() == 1 {
        groups.push(0);
    }
    groups
}

/// Options for the linear solver of `reduced`.
///
/// # Errors
/// Returns `SolverError::InvalidOptions` when the trust region strategy cannot work with
/// the linear solver, or the iteration bounds are inconsistent.
pub fn linear_solver_options(
    options: &SolverOptions,
    reduced: &ReducedProgram,
) -> SolverResult<LinearSolverOptions> {
    let linear_solver_type = reduced.linear_solver_type;
    if options.minimizer_type == MinimizerType::TrustRegion
        && options.trust_region_strategy_type == TrustRegionStrategyType::Dogleg
        && linear_solver_type.is_iterative()
    {
        return Err(SolverError::InvalidOptions(format!(
            "DOGLEG needs an exact factorization based linear solver, {linear_solver_type} is iterative"
        ))
        .log());
    }
    if options.min_linear_solver_iterations == 0
        || options.min_linear_solver_iterations > options.max_linear_solver_iterations
    {
        return Err(SolverError::InvalidOptions(format!(
            "linear solver iterations must satisfy 0 < min ({}) <= max ({})",
            options.min_linear_solver_iterations, options.max_linear_solver_iterations
        ))
        .log());
    }

    Ok(LinearSolverOptions {
        linear_solver_type,
        preconditioner_type: reduced.preconditioner_type,
        sparse_linear_algebra_library: options.sparse_linear_algebra_library_type,
        min_num_iterations: options.min_linear_solver_iterations,
        max_num_iterations: options.max_linear_solver_iterations,
        num_threads: options.num_linear_solver_threads,
        elimination_groups: elimination_groups(reduced),
    })
}

/// Build the linear solver for `reduced`.
///
/// # Errors
/// Propagates option validation and `LinAlgError::MissingCapability` for backends or
/// preconditioners this build does not provide.
pub fn create_linear_solver(
    options: &SolverOptions,
    reduced: &ReducedProgram,
) -> SolverResult<Box<dyn LinearSolver>> {
    let linear_solver_options = linear_solver_options(options, reduced)?;
    debug!(
        "Linear solver {} with elimination groups {:?}",
        linear_solver_options.linear_solver_type, linear_solver_options.elimination_groups
    );
    Ok(linalg::create_linear_solver(&linear_solver_options)?)
}

/// Build the evaluator for `reduced`, Schur-ready when e-blocks are eliminated.
///
/// # Errors
/// Fails on stale handles or residual blocks out of Schur order.
pub fn create_reduced_evaluator(
    options: &SolverOptions,
    problem: &Problem,
    reduced: &ReducedProgram,
    gradient_checking: Option<GradientCheckingOptions>,
) -> SolverResult<Evaluator> {
    let evaluator_options = EvaluatorOptions {
        linear_solver_type: reduced.linear_solver_type,
        num_eliminate_blocks: reduced.num_eliminate_blocks(),
        num_threads: options.num_threads,
        gradient_checking,
    };
    Ok(create_evaluator(&evaluator_options, problem, &reduced.program)?)
}

/// Build the inner iteration minimizer, or `None` when there is nothing to alternate
/// between. Returns the ordering actually used alongside it.
///
/// Without a user ordering the groups come from recursively peeling independent sets off
/// the parameter block graph, reversed so the last peeled (most connected) blocks go first.
///
/// # Errors
/// Returns `OptimizerError::InnerIterationOrdering` naming the first user group that is
/// not an independent set.
pub fn create_inner_iteration_minimizer(
    options: &SolverOptions,
    problem: &Problem,
    reduced: &ReducedProgram,
    evaluator: &Evaluator,
) -> SolverResult<Option<(CoordinateDescentMinimizer, ParameterBlockOrdering)>> {
    if reduced.program.num_parameter_blocks() < 2 {
        warn!("Reduced problem only contains one parameter block; disabling inner iterations");
        return Ok(None);
    }

    let ordering = match &options.inner_iteration_ordering {
        Some(ordering) => {
            for (group, members) in ordering.groups() {
                if let Some(id) = members
                    .iter()
                    .find(|&&id| !problem.contains_parameter_block(id))
                {
                    return Err(CoreError::Ordering(format!(
                        "inner iteration group {group} contains parameter block {id}, which is not part of the problem"
                    ))
                    .log()
                    .into());
                }
                if !is_independent(problem, &reduced.program, members)? {
                    return Err(OptimizerError::InnerIterationOrdering(format!(
                        "group {group} is not an independent set"
                    ))
                    .log()
                    .into());
                }
            }
            ordering.clone()
        }
        None => {
            let mut ordering = recursive_independent_set_ordering(problem, &reduced.program)?;
            ordering.reverse();
            ordering
        }
    };

    let minimizer = CoordinateDescentMinimizer::new(&ordering, evaluator, options.num_threads)?;
    Ok(Some((minimizer, ordering)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::program::Program;
    use crate::core::problem::tests::sum_cost;
    use crate::linalg::{LinearSolverType, PreconditionerType};
    use crate::solver::reducer::create_reduced_program;
    use nalgebra::DVector;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// Chain a − b − c with priors on both ends.
    fn chain() -> Result<(Problem, Vec<crate::core::parameter_block::ParameterBlockId>), Box<dyn std::error::Error>> {
        let mut problem = Problem::new();
        let ids: Vec<_> = (0..3)
            .map(|_| problem.add_parameter_block(DVector::zeros(1)))
            .collect();
        problem.add_residual_block(sum_cost(&[1], 1.0), None, &[ids[0]])?;
        problem.add_residual_block(sum_cost(&[1, 1], 3.0), None, &[ids[0], ids[1]])?;
        problem.add_residual_block(sum_cost(&[1, 1], 5.0), None, &[ids[1], ids[2]])?;
        problem.add_residual_block(sum_cost(&[1], 3.0), None, &[ids[2]])?;
        Ok((problem, ids))
    }

    fn reduce(
        problem: &mut Problem,
        linear_solver_type: LinearSolverType,
    ) -> Result<ReducedProgram, Box<dyn std::error::Error>> {
        let original = Program::from_problem(problem);
        let mut ordering = ParameterBlockOrdering::new();
        for id in problem.parameter_block_ids() {
            ordering.add_element_to_group(id, 0);
        }
        Ok(create_reduced_program(
            problem,
            &original,
            ordering,
            linear_solver_type,
            PreconditionerType::Jacobi,
        )?)
    }

    #[test]
    fn test_single_schur_group_gets_empty_f_group() -> TestResult {
        let mut problem = Problem::new();
        let a = problem.add_parameter_block(DVector::zeros(2));
        let b = problem.add_parameter_block(DVector::zeros(2));
        problem.add_residual_block(sum_cost(&[2], 1.0), None, &[a])?;
        problem.add_residual_block(sum_cost(&[2], 1.0), None, &[b])?;
        let reduced = reduce(&mut problem, LinearSolverType::DenseSchur)?;
        assert_eq!(elimination_groups(&reduced), vec![2, 0]);
        create_linear_solver(&SolverOptions::default(), &reduced)?;
        Ok(())
    }

    #[test]
    fn test_dogleg_rejects_iterative_solvers() -> TestResult {
        let (mut problem, _) = chain()?;
        let reduced = reduce(&mut problem, LinearSolverType::Cgnr)?;
        let options = SolverOptions::default()
            .with_trust_region_strategy_type(TrustRegionStrategyType::Dogleg)
            .with_linear_solver_type(LinearSolverType::Cgnr);
        assert!(matches!(
            create_linear_solver(&options, &reduced),
            Err(SolverError::InvalidOptions(_))
        ));

        // Line search never builds a trust region strategy.
        let options = options.with_minimizer_type(MinimizerType::LineSearch);
        create_linear_solver(&options, &reduced)?;
        Ok(())
    }

    #[test]
    fn test_missing_capability_is_reported() -> TestResult {
        let (mut problem, _) = chain()?;
        let reduced = reduce(&mut problem, LinearSolverType::SparseNormalCholesky)?;
        let options = SolverOptions::default().with_sparse_linear_algebra_library(
            crate::linalg::SparseLinearAlgebraLibraryType::NoSparse,
        );
        let error = create_linear_solver(&options, &reduced)
            .err()
            .ok_or("expected an error")?;
        assert!(error.chain_compact().contains("Missing capability"));
        Ok(())
    }

    #[test]
    fn test_bad_iteration_bounds() -> TestResult {
        let (mut problem, _) = chain()?;
        let reduced = reduce(&mut problem, LinearSolverType::Cgnr)?;
        let options = SolverOptions::default().with_linear_solver_iterations(10, 5);
        assert!(linear_solver_options(&options, &reduced).is_err());
        Ok(())
    }

    #[test]
    fn test_automatic_inner_iteration_ordering() -> TestResult {
        let (mut problem, ids) = chain()?;
        let reduced = reduce(&mut problem, LinearSolverType::DenseQr)?;
        let options = SolverOptions::default();
        let evaluator = create_reduced_evaluator(&options, &problem, &reduced, None)?;

        let (minimizer, ordering) =
            create_inner_iteration_minimizer(&options, &problem, &reduced, &evaluator)?
                .ok_or("inner iterations were disabled")?;
        assert_eq!(minimizer.num_groups(), 2);
        // {a, c} is peeled first and runs last after reversal.
        assert_eq!(ordering.group_id(ids[1]), Some(0));
        assert_eq!(ordering.group_id(ids[0]), Some(1));
        assert_eq!(ordering.group_id(ids[2]), Some(1));
        Ok(())
    }

    #[test]
    fn test_user_inner_iteration_group_must_be_independent() -> TestResult {
        let (mut problem, ids) = chain()?;
        let reduced = reduce(&mut problem, LinearSolverType::DenseQr)?;
        let mut ordering = ParameterBlockOrdering::new();
        ordering.add_element_to_group(ids[0], 0);
        ordering.add_element_to_group(ids[1], 4);
        ordering.add_element_to_group(ids[2], 4);
        let options = SolverOptions::default().with_inner_iterations(Some(ordering));
        let evaluator = create_reduced_evaluator(&options, &problem, &reduced, None)?;

        let error = create_inner_iteration_minimizer(&options, &problem, &reduced, &evaluator)
            .err()
            .ok_or("expected an error")?;
        assert!(error.chain_compact().contains("group 4"));
        Ok(())
    }

    #[test]
    fn test_single_block_disables_inner_iterations() -> TestResult {
        let mut problem = Problem::new();
        let a = problem.add_parameter_block(DVector::zeros(1));
        problem.add_residual_block(sum_cost(&[1], 1.0), None, &[a])?;
        let reduced = reduce(&mut problem, LinearSolverType::DenseQr)?;
        let options = SolverOptions::default().with_inner_iterations(None);
        let evaluator = create_reduced_evaluator(&options, &problem, &reduced, None)?;
        assert!(create_inner_iteration_minimizer(&options, &problem, &reduced, &evaluator)?.is_none());
        Ok(())
    }

    #[test]
    fn test_schur_evaluator_layout() -> TestResult {
        let (mut problem, _) = chain()?;
        let reduced = reduce(&mut problem, LinearSolverType::SparseSchur)?;
        assert!(reduced.num_eliminate_blocks() > 0);
        let evaluator =
            create_reduced_evaluator(&SolverOptions::default(), &problem, &reduced, None)?;
        assert_eq!(
            evaluator.layout().num_eliminate_blocks(),
            reduced.num_eliminate_blocks()
        );
        Ok(())
    }
}
