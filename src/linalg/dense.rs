//! Dense direct solvers backed by nalgebra.
//!
//! Both solvers densify the Jacobian and are intended for small problems or for the
//! per-block subproblems of inner iterations.

use nalgebra::{DMatrix, DVector};

use crate::linalg::{
    BlockSparseMatrix, LinAlgError, LinAlgResult, LinearSolver, LinearSolverSummary,
    PerSolveOptions, regularizer_squared,
};

/// Solves the normal equations `(AᵀA + D²) x = Aᵀb` with a dense Cholesky factorization.
#[derive(Debug, Clone, Default)]
pub struct DenseNormalCholeskySolver;

impl DenseNormalCholeskySolver {
    pub fn new() -> Self {
        Self
    }
}

impl LinearSolver for DenseNormalCholeskySolver {
    fn solve(
        &mut self,
        a: &BlockSparseMatrix,
        b: &DVector<f64>,
        per_solve: &PerSolveOptions,
    ) -> LinAlgResult<LinearSolverSummary> {
        let n = a.num_cols();
        let d2 = regularizer_squared(per_solve.d.as_ref(), n)?;
        let dense = a.to_dense();

        let mut hessian = dense.tr_mul(&dense);
        for i in 0..n {
            hessian[(i, i)] += d2[i];
        }
        let rhs = dense.tr_mul(b);

        let cholesky = hessian.cholesky().ok_or(LinAlgError::SingularMatrix)?;
        Ok(LinearSolverSummary::direct(cholesky.solve(&rhs)))
    }
}

/// Solves the least squares problem through a QR factorization of `[A; D]`.
///
/// Numerically more robust than the normal equations since the condition number is not
/// squared.
#[derive(Debug, Clone, Default)]
pub struct DenseQrSolver;

impl DenseQrSolver {
    pub fn new() -> Self {
        Self
    }
}

impl LinearSolver for DenseQrSolver {
    fn solve(
        &mut self,
        a: &BlockSparseMatrix,
        b: &DVector<f64>,
        per_solve: &PerSolveOptions,
    ) -> LinAlgResult<LinearSolverSummary> {
        let m = a.num_rows();
        let n = a.num_cols();
        if b.len() != m {
            return Err(LinAlgError::DimensionMismatch(format!(
                "right hand side has {} entries, matrix has {} rows",
                b.len(),
                m
            )));
        }

        let (stacked, rhs) = match per_solve.d.as_ref() {
            Some(d) => {
                if d.len() != n {
                    return Err(LinAlgError::DimensionMismatch(format!(
                        "regularizer has {} entries, system has {} columns",
                        d.len(),
                        n
                    )));
                }
                let mut stacked = DMatrix::zeros(m + n, n);
                stacked.view_mut((0, 0), (m, n)).copy_from(&a.to_dense());
                for i in 0..n {
                    stacked[(m + i, i)] = d[i];
                }
                let mut rhs = DVector::zeros(m + n);
                rhs.rows_mut(0, m).copy_from(b);
                (stacked, rhs)
            }
            None => (a.to_dense(), b.clone()),
        };

        if stacked.nrows() < n {
            return Err(LinAlgError::FactorizationFailed(format!(
                "least squares system with {} rows and {} columns is underdetermined",
                stacked.nrows(),
                n
            )));
        }

        let qr = stacked.qr();
        let qtb = qr.q().tr_mul(&rhs);
        let x = qr
            .r()
            .solve_upper_triangular(&qtb)
            .ok_or(LinAlgError::SingularMatrix)?;
        if x.iter().any(|v| !v.is_finite()) {
            return Err(LinAlgError::SingularMatrix);
        }
        Ok(LinearSolverSummary::direct(x))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// Two row blocks over column blocks [1, 2]; full column rank.
    pub(crate) fn small_system() -> (BlockSparseMatrix, DVector<f64>) {
        let mut a = BlockSparseMatrix::new(&[1, 2], &[(2, vec![0, 1]), (2, vec![1])]);
        let values = [
            DMatrix::from_row_slice(2, 1, &[1.0, 2.0]),
            DMatrix::from_row_slice(2, 2, &[0.5, -1.0, 1.0, 0.0]),
            DMatrix::from_row_slice(2, 2, &[3.0, 1.0, 0.0, 2.0]),
        ];
        let mut k = 0;
        for row in a.rows_mut() {
            for cell in &mut row.cells {
                cell.values.copy_from(&values[k]);
                k += 1;
            }
        }
        (a, DVector::from_vec(vec![1.0, -1.0, 2.0, 0.5]))
    }

    /// Reference solution of the regularized normal equations.
    pub(crate) fn reference_solution(
        a: &BlockSparseMatrix,
        b: &DVector<f64>,
        d: Option<&DVector<f64>>,
    ) -> DVector<f64> {
        let dense = a.to_dense();
        let mut h = dense.tr_mul(&dense);
        if let Some(d) = d {
            for i in 0..d.len() {
                h[(i, i)] += d[i] * d[i];
            }
        }
        h.lu().solve(&dense.tr_mul(b)).unwrap_or_else(|| DVector::zeros(a.num_cols()))
    }

    #[test]
    fn test_dense_solvers_agree_with_normal_equations() -> TestResult {
        let (a, b) = small_system();
        for d in [None, Some(DVector::from_vec(vec![0.1, 0.2, 0.3]))] {
            let per_solve = PerSolveOptions {
                d: d.clone(),
                ..Default::default()
            };
            let expected = reference_solution(&a, &b, d.as_ref());

            let qr = DenseQrSolver::new().solve(&a, &b, &per_solve)?;
            assert!((qr.x - &expected).norm() < 1e-10);

            let chol = DenseNormalCholeskySolver::new().solve(&a, &b, &per_solve)?;
            assert!((chol.x - &expected).norm() < 1e-10);
        }
        Ok(())
    }

    #[test]
    fn test_rank_deficient_system_fails_without_regularizer() {
        let a = BlockSparseMatrix::new(&[1, 1], &[(1, vec![0])]);
        let b = DVector::from_vec(vec![1.0]);
        let per_solve = PerSolveOptions::default();
        assert!(DenseNormalCholeskySolver::new().solve(&a, &b, &per_solve).is_err());
        assert!(DenseQrSolver::new().solve(&a, &b, &per_solve).is_err());
    }
}
