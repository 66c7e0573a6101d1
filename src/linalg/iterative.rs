//! Iterative solvers built on preconditioned conjugate gradients.

use nalgebra::{DMatrix, DVector};
use tracing::{debug, warn};

use crate::linalg::{
    BlockSparseMatrix, LinAlgError, LinAlgResult, LinearSolver, LinearSolverSummary,
    LinearSolverTerminationType, PerSolveOptions, PreconditionerType, block_sparse::Block,
    regularizer_squared, schur::SchurEliminator,
};
use crate::parallel::WorkerPool;

#[derive(Debug, Clone)]
pub(crate) struct ConjugateGradientsSummary {
    pub x: DVector<f64>,
    pub num_iterations: usize,
    pub converged: bool,
}

/// Solve `M x = rhs` for a symmetric positive definite operator `M` starting from zero.
///
/// Stops once `||rhs − M x|| ≤ tolerance · ||rhs||` after at least `min_iterations`, or
/// after `max_iterations`. `precondition` applies an approximation of `M⁻¹`.
///
/// # Errors
/// Fails when the very first search direction has non-positive curvature.
pub(crate) fn conjugate_gradients(
    apply: impl Fn(&DVector<f64>) -> DVector<f64>,
    precondition: impl Fn(&DVector<f64>) -> DVector<f64>,
    rhs: &DVector<f64>,
    min_iterations: usize,
    max_iterations: usize,
    tolerance: f64,
) -> LinAlgResult<ConjugateGradientsSummary> {
    let n = rhs.len();
    let mut x = DVector::zeros(n);
    let rhs_norm = rhs.norm();
    if rhs_norm == 0.0 {
        return Ok(ConjugateGradientsSummary {
            x,
            num_iterations: 0,
            converged: true,
        });
    }

    let mut r = rhs.clone();
    let mut z = precondition(&r);
    let mut p = z.clone();
    let mut rz = r.dot(&z);

    for iteration in 1..=max_iterations {
        let q = apply(&p);
        let curvature = p.dot(&q);
        if !curvature.is_finite() || curvature <= 0.0 {
            if iteration == 1 {
                return Err(LinAlgError::FactorizationFailed(
                    "conjugate gradients found a direction of non-positive curvature"
                        .to_string(),
                ));
            }
            debug!("Conjugate gradients stopped at iteration {}: curvature {}", iteration, curvature);
            return Ok(ConjugateGradientsSummary {
                x,
                num_iterations: iteration - 1,
                converged: false,
            });
        }

        let alpha = rz / curvature;
        x.axpy(alpha, &p, 1.0);
        r.axpy(-alpha, &q, 1.0);

        let r_norm = r.norm();
        if r_norm == 0.0 || (iteration >= min_iterations && r_norm <= tolerance * rhs_norm) {
            return Ok(ConjugateGradientsSummary {
                x,
                num_iterations: iteration,
                converged: true,
            });
        }

        z = precondition(&r);
        let rz_next = r.dot(&z);
        let beta = rz_next / rz;
        rz = rz_next;
        p = &z + beta * &p;
    }

    Ok(ConjugateGradientsSummary {
        x,
        num_iterations: max_iterations,
        converged: false,
    })
}

/// Approximate inverse applied by the conjugate gradient loop.
#[derive(Debug, Clone)]
enum Preconditioner {
    Identity,
    Diagonal(DVector<f64>),
    BlockDiagonal(Vec<(Block, DMatrix<f64>)>),
}

impl Preconditioner {
    /// Inverse of a diagonal; entries that cannot be inverted are left at one.
    fn diagonal(diagonal: &DVector<f64>) -> Self {
        Preconditioner::Diagonal(diagonal.map(|v| {
            if v > 0.0 && v.is_finite() {
                1.0 / v
            } else {
                1.0
            }
        }))
    }

    fn apply(&self, r: &DVector<f64>) -> DVector<f64> {
        match self {
            Preconditioner::Identity => r.clone(),
            Preconditioner::Diagonal(inverse) => inverse.component_mul(r),
            Preconditioner::BlockDiagonal(blocks) => {
                let mut z = DVector::zeros(r.len());
                for (block, inverse) in blocks {
                    z.rows_mut(block.position, block.size)
                        .copy_from(&(inverse * r.rows(block.position, block.size)));
                }
                z
            }
        }
    }
}

fn summary_from(cg: ConjugateGradientsSummary, x: DVector<f64>) -> LinearSolverSummary {
    LinearSolverSummary {
        x,
        num_iterations: cg.num_iterations,
        termination_type: if cg.converged {
            LinearSolverTerminationType::Success
        } else {
            LinearSolverTerminationType::NoConvergence
        },
    }
}

/// Conjugate gradients on the normal equations `(AᵀA + D²) x = Aᵀb`.
///
/// Only `A` products are needed, so the normal matrix is never formed.
#[derive(Debug, Clone)]
pub struct CgnrSolver {
    preconditioner_type: PreconditionerType,
    min_num_iterations: usize,
    max_num_iterations: usize,
}

impl CgnrSolver {
    pub fn new(
        preconditioner_type: PreconditionerType,
        min_num_iterations: usize,
        max_num_iterations: usize,
    ) -> Self {
        Self {
            preconditioner_type,
            min_num_iterations,
            max_num_iterations,
        }
    }
}

impl LinearSolver for CgnrSolver {
    fn solve(
        &mut self,
        a: &BlockSparseMatrix,
        b: &DVector<f64>,
        per_solve: &PerSolveOptions,
    ) -> LinAlgResult<LinearSolverSummary> {
        if b.len() != a.num_rows() {
            return Err(LinAlgError::DimensionMismatch(format!(
                "right hand side has {} entries, matrix has {} rows",
                b.len(),
                a.num_rows()
            )));
        }
        let d2 = regularizer_squared(per_solve.d.as_ref(), a.num_cols())?;
        let preconditioner = match self.preconditioner_type {
            PreconditionerType::Identity => Preconditioner::Identity,
            _ => Preconditioner::diagonal(&(a.squared_column_norm() + &d2)),
        };

        let rhs = a.left_multiply(b);
        let cg = conjugate_gradients(
            |v| a.left_multiply(&a.right_multiply(v)) + d2.component_mul(v),
            |r| preconditioner.apply(r),
            &rhs,
            self.min_num_iterations,
            self.max_num_iterations,
            per_solve.r_tolerance,
        )?;
        let x = cg.x.clone();
        Ok(summary_from(cg, x))
    }
}

/// Conjugate gradients on the Schur complement of the e-blocks, applied implicitly.
#[derive(Debug)]
pub struct IterativeSchurSolver {
    num_eliminate_blocks: usize,
    preconditioner_type: PreconditionerType,
    min_num_iterations: usize,
    max_num_iterations: usize,
    pool: WorkerPool,
}

impl IterativeSchurSolver {
    pub fn new(
        num_eliminate_blocks: usize,
        preconditioner_type: PreconditionerType,
        min_num_iterations: usize,
        max_num_iterations: usize,
        num_threads: usize,
    ) -> Self {
        Self {
            num_eliminate_blocks,
            preconditioner_type,
            min_num_iterations,
            max_num_iterations,
            pool: WorkerPool::new(num_threads),
        }
    }

    fn preconditioner(&self, eliminator: &SchurEliminator<'_>) -> Preconditioner {
        match self.preconditioner_type {
            PreconditionerType::Identity => Preconditioner::Identity,
            PreconditionerType::Jacobi => {
                let mut diagonal = DVector::zeros(eliminator.reduced_dimension());
                for ((k, _), values) in eliminator.reduced_blocks(true) {
                    let f = eliminator.f_blocks()[k];
                    diagonal
                        .rows_mut(f.position, f.size)
                        .copy_from(&values.diagonal());
                }
                Preconditioner::diagonal(&diagonal)
            }
            _ => {
                let blocks = eliminator
                    .reduced_blocks(true)
                    .into_iter()
                    .map(|((k, _), values)| {
                        let f = eliminator.f_blocks()[k];
                        let inverse = match values.clone().cholesky() {
                            Some(cholesky) => cholesky.inverse(),
                            None => {
                                warn!("Schur-Jacobi block {} is not positive definite", k);
                                DMatrix::identity(f.size, f.size)
                            }
                        };
                        (f, inverse)
                    })
                    .collect();
                Preconditioner::BlockDiagonal(blocks)
            }
        }
    }
}

impl LinearSolver for IterativeSchurSolver {
    fn solve(
        &mut self,
        a: &BlockSparseMatrix,
        b: &DVector<f64>,
        per_solve: &PerSolveOptions,
    ) -> LinAlgResult<LinearSolverSummary> {
        let d2 = regularizer_squared(per_solve.d.as_ref(), a.num_cols())?;
        let eliminator = SchurEliminator::new(a, b, &d2, self.num_eliminate_blocks, &self.pool)?;

        let rhs = eliminator.reduced_rhs();
        let preconditioner = self.preconditioner(&eliminator);
        let cg = conjugate_gradients(
            |v| eliminator.apply_reduced(v),
            |r| preconditioner.apply(r),
            &rhs,
            self.min_num_iterations,
            self.max_num_iterations,
            per_solve.r_tolerance,
        )?;
        let x = eliminator.back_substitute(&cg.x);
        Ok(summary_from(cg, x))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::dense::tests::{reference_solution, small_system};
    use crate::linalg::schur::tests::bundle_system;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_cg_solves_spd_system_exactly() -> TestResult {
        let m = DMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.0, 1.0, 3.0, 0.5, 0.0, 0.5, 2.0]);
        let rhs = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        let summary = conjugate_gradients(|v| &m * v, |r| r.clone(), &rhs, 1, 10, 1e-12)?;
        assert!(summary.converged);
        assert!(summary.num_iterations <= 3);
        assert!((&m * &summary.x - &rhs).norm() < 1e-10);
        Ok(())
    }

    #[test]
    fn test_cg_reports_iteration_cap() -> TestResult {
        let m = DMatrix::from_diagonal(&DVector::from_vec(vec![1.0, 10.0, 100.0, 1000.0]));
        let rhs = DVector::from_element(4, 1.0);
        let summary = conjugate_gradients(|v| &m * v, |r| r.clone(), &rhs, 1, 2, 1e-14)?;
        assert!(!summary.converged);
        assert_eq!(summary.num_iterations, 2);
        Ok(())
    }

    #[test]
    fn test_cg_rejects_indefinite_operator() {
        let rhs = DVector::from_element(2, 1.0);
        let result = conjugate_gradients(|v| -v, |r| r.clone(), &rhs, 1, 10, 1e-10);
        assert!(result.is_err());
    }

    #[test]
    fn test_cgnr_matches_reference() -> TestResult {
        let (a, b) = small_system();
        for preconditioner in [PreconditionerType::Identity, PreconditionerType::Jacobi] {
            let d = DVector::from_vec(vec![0.2, 0.1, 0.3]);
            let per_solve = PerSolveOptions {
                d: Some(d.clone()),
                r_tolerance: 1e-12,
            };
            let summary = CgnrSolver::new(preconditioner, 1, 50).solve(&a, &b, &per_solve)?;
            assert_eq!(summary.termination_type, LinearSolverTerminationType::Success);
            let expected = reference_solution(&a, &b, Some(&d));
            assert!((summary.x - expected).norm() < 1e-8);
        }
        Ok(())
    }

    #[test]
    fn test_iterative_schur_matches_reference_for_every_preconditioner() -> TestResult {
        let (a, b) = bundle_system();
        let d = DVector::from_element(a.num_cols(), 0.1);
        let expected = reference_solution(&a, &b, Some(&d));
        let per_solve = PerSolveOptions {
            d: Some(d),
            r_tolerance: 1e-12,
        };
        for preconditioner in [
            PreconditionerType::Identity,
            PreconditionerType::Jacobi,
            PreconditionerType::SchurJacobi,
        ] {
            let mut solver = IterativeSchurSolver::new(3, preconditioner, 1, 100, 2);
            let summary = solver.solve(&a, &b, &per_solve)?;
            assert!((summary.x - &expected).norm() < 1e-7, "{}", preconditioner);
        }
        Ok(())
    }
}
