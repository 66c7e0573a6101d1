//! End-to-end tests of `solve` on small problems with known minima.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use lsq_solver::callbacks::{CallbackReturnType, IterationCallback};
use lsq_solver::core::cost_function::{CostFunction, CostFunctionOutput};
use lsq_solver::core::program::Program;
use lsq_solver::optimizer::IterationSummary;
use lsq_solver::optimizer::strategy::TrustRegionStrategyType;
use lsq_solver::solver::reducer::remove_fixed_blocks_from_program;
use lsq_solver::solver::reorder::lexicographically_order_residual_blocks;
use lsq_solver::{
    LinearSolverType, LoggingType, MinimizerType, ParameterBlockOrdering, PreconditionerType,
    Problem, Solver, SolverOptions, TerminationType, solve,
};
use nalgebra::{DMatrix, DVector};

type TestResult = Result<(), Box<dyn std::error::Error>>;

/// `r_i = x_i − target_i` for one block.
struct Anchor {
    target: DVector<f64>,
    sizes: [usize; 1],
}

impl Anchor {
    fn new(target: &[f64]) -> Arc<Self> {
        Arc::new(Self {
            target: DVector::from_column_slice(target),
            sizes: [target.len()],
        })
    }
}

impl CostFunction for Anchor {
    fn num_residuals(&self) -> usize {
        self.sizes[0]
    }

    fn parameter_block_sizes(&self) -> &[usize] {
        &self.sizes
    }

    fn evaluate(&self, parameters: &[DVector<f64>], compute_jacobians: bool) -> Option<CostFunctionOutput> {
        let n = self.sizes[0];
        Some((
            &parameters[0] - &self.target,
            compute_jacobians.then(|| vec![DMatrix::identity(n, n)]),
        ))
    }
}

/// `r = x_a − x_b − offset` between two blocks of equal size.
struct Difference {
    offset: DVector<f64>,
    sizes: [usize; 2],
}

impl Difference {
    fn new(offset: &[f64]) -> Arc<Self> {
        Arc::new(Self {
            offset: DVector::from_column_slice(offset),
            sizes: [offset.len(), offset.len()],
        })
    }
}

impl CostFunction for Difference {
    fn num_residuals(&self) -> usize {
        self.sizes[0]
    }

    fn parameter_block_sizes(&self) -> &[usize] {
        &self.sizes
    }

    fn evaluate(&self, parameters: &[DVector<f64>], compute_jacobians: bool) -> Option<CostFunctionOutput> {
        let n = self.sizes[0];
        Some((
            &parameters[0] - &parameters[1] - &self.offset,
            compute_jacobians.then(|| vec![DMatrix::identity(n, n), -DMatrix::identity(n, n)]),
        ))
    }
}

/// Rosenbrock in residual form: `r = [10 (y − x²), 1 − x]`, minimum at (1, 1).
struct Rosenbrock;

impl CostFunction for Rosenbrock {
    fn num_residuals(&self) -> usize {
        2
    }

    fn parameter_block_sizes(&self) -> &[usize] {
        &[2]
    }

    fn evaluate(&self, parameters: &[DVector<f64>], compute_jacobians: bool) -> Option<CostFunctionOutput> {
        let (x, y) = (parameters[0][0], parameters[0][1]);
        let residuals = DVector::from_vec(vec![10.0 * (y - x * x), 1.0 - x]);
        let jacobians = compute_jacobians
            .then(|| vec![DMatrix::from_row_slice(2, 2, &[-20.0 * x, 10.0, -1.0, 0.0])]);
        Some((residuals, jacobians))
    }
}

/// `r = Σ x − target` over every coordinate of every block.
struct Sum {
    target: f64,
    sizes: Vec<usize>,
}

impl CostFunction for Sum {
    fn num_residuals(&self) -> usize {
        1
    }

    fn parameter_block_sizes(&self) -> &[usize] {
        &self.sizes
    }

    fn evaluate(&self, parameters: &[DVector<f64>], compute_jacobians: bool) -> Option<CostFunctionOutput> {
        let total: f64 = parameters.iter().map(|p| p.sum()).sum();
        let residuals = DVector::from_vec(vec![total - self.target]);
        let jacobians = compute_jacobians.then(|| {
            self.sizes
                .iter()
                .map(|&n| DMatrix::from_element(1, n, 1.0))
                .collect()
        });
        Some((residuals, jacobians))
    }
}

/// Rosenbrock whose Jacobian evaluation fails once `jacobian_budget` Jacobians were
/// produced. Residual-only evaluations always succeed.
struct FailingRosenbrock {
    jacobian_budget: usize,
    jacobians: AtomicUsize,
}

impl CostFunction for FailingRosenbrock {
    fn num_residuals(&self) -> usize {
        2
    }

    fn parameter_block_sizes(&self) -> &[usize] {
        &[2]
    }

    fn evaluate(&self, parameters: &[DVector<f64>], compute_jacobians: bool) -> Option<CostFunctionOutput> {
        if compute_jacobians && self.jacobians.fetch_add(1, Ordering::SeqCst) >= self.jacobian_budget {
            return None;
        }
        Rosenbrock.evaluate(parameters, compute_jacobians)
    }
}

/// Keeps the state reported with the most recent accepted step.
struct LastAccepted(Arc<Mutex<Option<DVector<f64>>>>);

impl IterationCallback for LastAccepted {
    fn on_iteration(&mut self, summary: &IterationSummary, x: &DVector<f64>) -> CallbackReturnType {
        if summary.step_is_successful
            && let Ok(mut last) = self.0.lock()
        {
            *last = Some(x.clone());
        }
        CallbackReturnType::Continue
    }
}

/// Three points and two poses, all 2-D: each point is observed from every pose, plus an
/// anchor on every block. Minimum cost 0 at points = [1, 2, 3], poses = [0, 0] and [1, 1].
fn chain_problem() -> Result<(Problem, Vec<lsq_solver::ParameterBlockId>), Box<dyn std::error::Error>> {
    let mut problem = Problem::new();
    let points: Vec<_> = [0.0, 0.0, 0.0]
        .iter()
        .map(|&v| problem.add_parameter_block(DVector::from_vec(vec![v, v])))
        .collect();
    let poses: Vec<_> = (0..2)
        .map(|_| problem.add_parameter_block(DVector::from_vec(vec![0.5, -0.5])))
        .collect();
    for (i, &point) in points.iter().enumerate() {
        let target = (i + 1) as f64;
        problem.add_residual_block(Anchor::new(&[target, target]), None, &[point])?;
        for (j, &pose) in poses.iter().enumerate() {
            let offset = target - j as f64;
            problem.add_residual_block(Difference::new(&[offset, offset]), None, &[point, pose])?;
        }
    }
    problem.add_residual_block(Anchor::new(&[0.0, 0.0]), None, &[poses[0]])?;
    problem.add_residual_block(Anchor::new(&[1.0, 1.0]), None, &[poses[1]])?;
    let mut blocks = points;
    blocks.extend(poses);
    Ok((problem, blocks))
}

fn quiet() -> SolverOptions {
    SolverOptions::new().with_logging_type(LoggingType::Silent)
}

fn assert_chain_solution(problem: &Problem, blocks: &[lsq_solver::ParameterBlockId]) -> TestResult {
    let expected = [1.0, 2.0, 3.0, 0.0, 1.0];
    for (&block, &value) in blocks.iter().zip(&expected) {
        let values = problem.parameter_values(block)?;
        assert!(
            values.iter().all(|v| (v - value).abs() < 1e-5),
            "block {:?} = {:?}, expected {}",
            block,
            values,
            value
        );
    }
    Ok(())
}

#[test]
fn test_empty_problem_reports_error() {
    let mut problem = Problem::new();
    let summary = solve(&quiet(), &mut problem);
    assert!(summary.error.is_some());
    assert_eq!(summary.termination_type, TerminationType::DidNotRun);
    assert!(summary.brief_report().contains("Error"));
}

#[test]
fn test_every_linear_solver_reaches_the_minimum() -> TestResult {
    let configurations = [
        (LinearSolverType::DenseQr, PreconditionerType::Jacobi),
        (LinearSolverType::DenseNormalCholesky, PreconditionerType::Jacobi),
        (LinearSolverType::SparseNormalCholesky, PreconditionerType::Jacobi),
        (LinearSolverType::DenseSchur, PreconditionerType::Jacobi),
        (LinearSolverType::SparseSchur, PreconditionerType::Jacobi),
        (LinearSolverType::IterativeSchur, PreconditionerType::SchurJacobi),
        (LinearSolverType::Cgnr, PreconditionerType::Jacobi),
    ];
    for (linear_solver_type, preconditioner_type) in configurations {
        let (mut problem, blocks) = chain_problem()?;
        let options = quiet()
            .with_linear_solver_type(linear_solver_type)
            .with_preconditioner_type(preconditioner_type)
            .with_max_num_iterations(100);
        let summary = solve(&options, &mut problem);
        assert!(summary.error.is_none(), "{}: {:?}", linear_solver_type, summary.error);
        assert!(summary.is_solution_usable(), "{}: {}", linear_solver_type, summary.message);
        assert!(summary.final_cost < 1e-10, "{}: {}", linear_solver_type, summary.final_cost);
        assert_eq!(summary.linear_solver_type_used, linear_solver_type);
        assert_chain_solution(&problem, &blocks)?;
    }
    Ok(())
}

#[test]
fn test_schur_ordering_with_user_groups() -> TestResult {
    let (mut problem, blocks) = chain_problem()?;
    let mut ordering = ParameterBlockOrdering::new();
    for &point in &blocks[..3] {
        ordering.add_element_to_group(point, 0);
    }
    for &pose in &blocks[3..] {
        ordering.add_element_to_group(pose, 1);
    }
    let options = quiet()
        .with_linear_solver_type(LinearSolverType::DenseSchur)
        .with_linear_solver_ordering(ordering);
    let summary = solve(&options, &mut problem);
    assert!(summary.error.is_none(), "{:?}", summary.error);
    assert_eq!(summary.linear_solver_ordering_given, vec![3, 2]);
    assert_eq!(summary.linear_solver_ordering_used, vec![3, 2]);
    assert_chain_solution(&problem, &blocks)?;
    Ok(())
}

#[test]
fn test_schur_ordering_rejects_dependent_first_group() -> TestResult {
    let (mut problem, blocks) = chain_problem()?;
    let mut ordering = ParameterBlockOrdering::new();
    // Point 0 and pose 0 share a residual block.
    ordering.add_element_to_group(blocks[0], 0);
    ordering.add_element_to_group(blocks[3], 0);
    for &block in [blocks[1], blocks[2], blocks[4]].iter() {
        ordering.add_element_to_group(block, 1);
    }
    let options = quiet()
        .with_linear_solver_type(LinearSolverType::SparseSchur)
        .with_linear_solver_ordering(ordering);
    let summary = solve(&options, &mut problem);
    assert!(summary.error.is_some());
    assert_eq!(problem.parameter_values(blocks[0])?[0], 0.0);
    Ok(())
}

#[test]
fn test_schur_falls_back_when_first_group_is_constant() -> TestResult {
    for (given, expected) in [
        (LinearSolverType::DenseSchur, LinearSolverType::DenseQr),
        (LinearSolverType::SparseSchur, LinearSolverType::SparseNormalCholesky),
        (LinearSolverType::IterativeSchur, LinearSolverType::Cgnr),
    ] {
        let (mut problem, blocks) = chain_problem()?;
        let mut ordering = ParameterBlockOrdering::new();
        ordering.add_element_to_group(blocks[0], 0);
        for &block in &blocks[1..] {
            ordering.add_element_to_group(block, 1);
        }
        problem.set_parameter_block_constant(blocks[0])?;
        let options = quiet()
            .with_linear_solver_type(given)
            .with_preconditioner_type(PreconditionerType::SchurJacobi)
            .with_linear_solver_ordering(ordering);
        let summary = solve(&options, &mut problem);
        assert!(summary.error.is_none(), "{}: {:?}", given, summary.error);
        assert_eq!(summary.linear_solver_type_given, given);
        assert_eq!(summary.linear_solver_type_used, expected);
        assert_eq!(summary.num_parameter_blocks_reduced, 4);
        if given == LinearSolverType::IterativeSchur {
            assert_eq!(summary.preconditioner_type_used, PreconditionerType::Jacobi);
        }
        assert!(summary.fixed_cost > 0.0);
        assert!(summary.is_solution_usable());
    }
    Ok(())
}

#[test]
fn test_all_constant_problem_reports_fixed_cost() -> TestResult {
    let mut problem = Problem::new();
    let a = problem.add_parameter_block(DVector::from_vec(vec![3.0]));
    let b = problem.add_parameter_block(DVector::from_vec(vec![1.0]));
    problem.add_residual_block(Anchor::new(&[1.0]), None, &[a])?;
    problem.add_residual_block(Difference::new(&[0.0]), None, &[a, b])?;
    problem.set_parameter_block_constant(a)?;
    problem.set_parameter_block_constant(b)?;

    let summary = solve(&quiet(), &mut problem);
    assert!(summary.error.is_none(), "{:?}", summary.error);
    assert_eq!(summary.termination_type, TerminationType::FunctionTolerance);
    // ½·2² + ½·2²
    assert!((summary.fixed_cost - 4.0).abs() < 1e-12);
    assert_eq!(summary.initial_cost, summary.fixed_cost);
    assert_eq!(summary.final_cost, summary.fixed_cost);
    assert_eq!(problem.parameter_values(a)?[0], 3.0);
    Ok(())
}

#[test]
fn test_fixed_cost_is_added_to_reported_costs() -> TestResult {
    let mut problem = Problem::new();
    let frozen = problem.add_parameter_block(DVector::from_vec(vec![2.0]));
    let x = problem.add_parameter_block(DVector::from_vec(vec![0.0]));
    problem.set_parameter_block_constant(frozen)?;
    // Fully constant: ½·(2 − 5)².
    problem.add_residual_block(Anchor::new(&[5.0]), None, &[frozen])?;
    problem.add_residual_block(Difference::new(&[1.0]), None, &[x, frozen])?;

    let summary = solve(&quiet(), &mut problem);
    assert!(summary.is_solution_usable());
    assert!((summary.fixed_cost - 4.5).abs() < 1e-12);
    assert!((summary.initial_cost - (4.5 + 4.5)).abs() < 1e-12);
    assert!((summary.final_cost - 4.5).abs() < 1e-9);
    assert!((problem.parameter_values(x)?[0] - 3.0).abs() < 1e-6);
    Ok(())
}

#[test]
fn test_remove_fixed_blocks_is_idempotent() -> TestResult {
    let (mut problem, blocks) = chain_problem()?;
    problem.set_parameter_block_constant(blocks[3])?;
    let mut program = Program::from_problem(&problem);
    let first = remove_fixed_blocks_from_program(&problem, &mut program, None)?;
    let snapshot = program.clone();
    let second = remove_fixed_blocks_from_program(&problem, &mut program, None)?;
    assert!(first > 0.0);
    assert_eq!(second, 0.0);
    assert_eq!(program, snapshot);
    Ok(())
}

#[test]
fn test_residual_bucketing_is_stable() -> TestResult {
    let (problem, blocks) = chain_problem()?;
    let mut program = Program::from_problem(&problem);
    let original: Vec<_> = program.residual_blocks().to_vec();
    // Points are the first three parameter blocks in insertion order.
    let counts = lexicographically_order_residual_blocks(&problem, &mut program, 3)?;
    assert_eq!(counts, vec![3, 3, 3, 2]);
    assert_eq!(program.residual_blocks(), original.as_slice());
    assert_eq!(blocks.len(), 5);
    Ok(())
}

#[test]
fn test_user_abort_keeps_initial_values() -> TestResult {
    struct AbortAfterFirstStep;
    impl IterationCallback for AbortAfterFirstStep {
        fn on_iteration(&mut self, summary: &IterationSummary, _x: &DVector<f64>) -> CallbackReturnType {
            if summary.iteration >= 1 {
                CallbackReturnType::Abort
            } else {
                CallbackReturnType::Continue
            }
        }
    }

    let (mut problem, blocks) = chain_problem()?;
    let mut solver = Solver::new(quiet());
    solver.add_callback(Box::new(AbortAfterFirstStep));
    let summary = solver.solve(&mut problem);
    assert_eq!(summary.termination_type, TerminationType::UserAbort);
    assert!(!summary.is_solution_usable());
    assert_eq!(problem.parameter_values(blocks[0])?[0], 0.0);
    assert_eq!(problem.parameter_values(blocks[3])?[0], 0.5);
    Ok(())
}

#[test]
fn test_user_callbacks_see_every_iteration_in_order() -> TestResult {
    struct Recorder(Arc<Mutex<Vec<usize>>>);
    impl IterationCallback for Recorder {
        fn on_iteration(&mut self, summary: &IterationSummary, _x: &DVector<f64>) -> CallbackReturnType {
            if let Ok(mut seen) = self.0.lock() {
                seen.push(summary.iteration);
            }
            CallbackReturnType::Continue
        }
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut problem = Problem::new();
    let x = problem.add_parameter_block(DVector::from_vec(vec![-1.2, 1.0]));
    problem.add_residual_block(Arc::new(Rosenbrock), None, &[x])?;

    let mut solver = Solver::new(quiet());
    solver.add_callback(Box::new(Recorder(seen.clone())));
    let summary = solver.solve(&mut problem);
    assert!(summary.is_solution_usable(), "{}", summary.message);

    let seen = seen.lock().map_err(|e| e.to_string())?;
    let expected: Vec<usize> = (0..summary.iterations.len()).collect();
    assert_eq!(*seen, expected);
    let values = problem.parameter_values(x)?;
    assert!((values[0] - 1.0).abs() < 1e-4 && (values[1] - 1.0).abs() < 1e-4);
    Ok(())
}

#[test]
fn test_success_callback_writes_back() -> TestResult {
    struct StopBelow(f64);
    impl IterationCallback for StopBelow {
        fn on_iteration(&mut self, summary: &IterationSummary, _x: &DVector<f64>) -> CallbackReturnType {
            if summary.cost < self.0 {
                CallbackReturnType::TerminateSuccessfully
            } else {
                CallbackReturnType::Continue
            }
        }
    }

    let mut problem = Problem::new();
    let x = problem.add_parameter_block(DVector::from_vec(vec![-1.2, 1.0]));
    problem.add_residual_block(Arc::new(Rosenbrock), None, &[x])?;
    let mut solver = Solver::new(quiet());
    solver.add_callback(Box::new(StopBelow(1.0)));
    let summary = solver.solve(&mut problem);
    assert_eq!(summary.termination_type, TerminationType::UserSuccess);
    assert!(summary.final_cost < 1.0);
    assert_ne!(problem.parameter_values(x)?[0], -1.2);
    Ok(())
}

#[test]
fn test_dogleg_with_iterative_solver_is_rejected() -> TestResult {
    let (mut problem, blocks) = chain_problem()?;
    let options = quiet()
        .with_trust_region_strategy_type(TrustRegionStrategyType::Dogleg)
        .with_linear_solver_type(LinearSolverType::Cgnr);
    let summary = solve(&options, &mut problem);
    assert!(summary.error.is_some());
    assert_eq!(summary.termination_type, TerminationType::DidNotRun);
    assert_eq!(problem.parameter_values(blocks[0])?[0], 0.0);

    let options = quiet()
        .with_trust_region_strategy_type(TrustRegionStrategyType::Dogleg)
        .with_linear_solver_type(LinearSolverType::DenseQr);
    let summary = solve(&options, &mut problem);
    assert!(summary.is_solution_usable(), "{:?}", summary.error);
    assert_chain_solution(&problem, &blocks)?;
    Ok(())
}

#[test]
fn test_line_search_minimizer_solves_rosenbrock() -> TestResult {
    let mut problem = Problem::new();
    let x = problem.add_parameter_block(DVector::from_vec(vec![-1.2, 1.0]));
    problem.add_residual_block(Arc::new(Rosenbrock), None, &[x])?;
    let options = quiet()
        .with_minimizer_type(MinimizerType::LineSearch)
        .with_max_num_iterations(500);
    let summary = solve(&options, &mut problem);
    assert!(summary.is_solution_usable(), "{}", summary.message);
    assert!(summary.final_cost < 1e-3, "{}", summary.final_cost);
    Ok(())
}

#[test]
fn test_inner_iterations_are_used_and_reported() -> TestResult {
    let (mut problem, blocks) = chain_problem()?;
    let options = quiet().with_inner_iterations(None);
    let summary = solve(&options, &mut problem);
    assert!(summary.error.is_none(), "{:?}", summary.error);
    assert!(summary.inner_iterations_given);
    assert!(summary.inner_iterations_used);
    assert_eq!(summary.inner_iteration_ordering_used.iter().sum::<usize>(), 5);
    assert_chain_solution(&problem, &blocks)?;
    Ok(())
}

#[test]
fn test_solver_log_is_written() -> TestResult {
    let path = std::env::temp_dir().join(format!("lsq_solver_log_{}.txt", std::process::id()));
    let (mut problem, _) = chain_problem()?;
    let summary = solve(&quiet().with_solver_log(&path), &mut problem);
    assert!(summary.is_solution_usable());
    let log = std::fs::read_to_string(&path)?;
    std::fs::remove_file(&path)?;
    assert!(log.lines().count() >= summary.iterations.len());
    Ok(())
}

#[test]
fn test_full_report_lists_given_and_used() -> TestResult {
    let (mut problem, _) = chain_problem()?;
    let summary = solve(&quiet(), &mut problem);
    let report = summary.full_report();
    assert!(report.contains("Given"));
    assert!(report.contains("Used"));
    assert!(report.contains("SPARSE_NORMAL_CHOLESKY"));
    assert!(report.contains(&summary.termination_type.to_string()));
    Ok(())
}

#[test]
fn test_two_blocks_one_residual_default_ordering() -> TestResult {
    for linear_solver_type in [
        LinearSolverType::DenseQr,
        LinearSolverType::DenseNormalCholesky,
        LinearSolverType::SparseNormalCholesky,
        LinearSolverType::Cgnr,
    ] {
        let mut problem = Problem::new();
        let a = problem.add_parameter_block(DVector::from_vec(vec![1.0, 2.0, 3.0]));
        let b = problem.add_parameter_block(DVector::from_vec(vec![4.0, 5.0]));
        problem.add_residual_block(
            Arc::new(Sum {
                target: 5.0,
                sizes: vec![3, 2],
            }),
            None,
            &[a, b],
        )?;

        let options = quiet().with_linear_solver_type(linear_solver_type);
        let summary = solve(&options, &mut problem);
        assert!(summary.error.is_none(), "{}: {:?}", linear_solver_type, summary.error);
        assert!(summary.linear_solver_ordering_given.is_empty());
        assert_eq!(summary.linear_solver_ordering_used, vec![2]);
        assert_eq!(summary.num_parameter_blocks_reduced, 2);
        assert_eq!(summary.num_parameters_reduced, 5);
        assert_eq!(summary.num_residual_blocks_reduced, 1);
        assert!(
            matches!(
                summary.termination_type,
                TerminationType::FunctionTolerance
                    | TerminationType::GradientTolerance
                    | TerminationType::ParameterTolerance
                    | TerminationType::NoConvergence
            ),
            "{}: {}",
            linear_solver_type,
            summary.termination_type
        );
        // ½ (15 − 5)²
        assert!((summary.initial_cost - 50.0).abs() < 1e-12);
        assert!(summary.final_cost < summary.initial_cost);
    }
    Ok(())
}

type FailedSolve = (Problem, lsq_solver::ParameterBlockId, Option<DVector<f64>>, TerminationType);

fn solve_until_jacobian_fails(update_state_every_iteration: bool) -> Result<FailedSolve, Box<dyn std::error::Error>> {
    let mut problem = Problem::new();
    let x = problem.add_parameter_block(DVector::from_vec(vec![-1.2, 1.0]));
    // Jacobians at the start and at the first accepted step; the second accepted step fails.
    problem.add_residual_block(
        Arc::new(FailingRosenbrock {
            jacobian_budget: 2,
            jacobians: AtomicUsize::new(0),
        }),
        None,
        &[x],
    )?;

    let last_accepted = Arc::new(Mutex::new(None));
    let options = quiet().with_update_state_every_iteration(update_state_every_iteration);
    let mut solver = Solver::new(options);
    solver.add_callback(Box::new(LastAccepted(last_accepted.clone())));
    let summary = solver.solve(&mut problem);
    let last = last_accepted.lock().map_err(|e| e.to_string())?.clone();
    Ok((problem, x, last, summary.termination_type))
}

#[test]
fn test_numerical_failure_keeps_initial_values() -> TestResult {
    let (problem, x, last, termination_type) = solve_until_jacobian_fails(false)?;
    assert_eq!(termination_type, TerminationType::NumericalFailure);
    let last = last.ok_or("no accepted step was reported")?;
    assert_ne!(last, DVector::from_vec(vec![-1.2, 1.0]));
    assert_eq!(*problem.parameter_values(x)?, DVector::from_vec(vec![-1.2, 1.0]));
    Ok(())
}

#[test]
fn test_numerical_failure_keeps_last_accepted_state_when_updating() -> TestResult {
    let (problem, x, last, termination_type) = solve_until_jacobian_fails(true)?;
    assert_eq!(termination_type, TerminationType::NumericalFailure);
    let last = last.ok_or("no accepted step was reported")?;
    assert_ne!(last, DVector::from_vec(vec![-1.2, 1.0]));
    assert_eq!(*problem.parameter_values(x)?, last);
    Ok(())
}
