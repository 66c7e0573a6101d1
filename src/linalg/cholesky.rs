use faer::{
    Mat, Side,
    linalg::solvers::Solve,
    sparse::linalg::solvers::{Llt, SymbolicLlt},
    sparse::{SparseColMat, Triplet},
};
use nalgebra::DVector;
use std::ops::Mul;

use crate::linalg::{
    BlockSparseMatrix, LinAlgError, LinAlgResult, LinearSolver, LinearSolverSummary,
    PerSolveOptions, regularizer_squared,
};

/// Sparse Cholesky factorization of the normal equations `(JᵀJ + D²) x = Jᵀb` using faer.
#[derive(Debug, Clone, Default)]
pub struct SparseNormalCholeskySolver {
    /// Cached symbolic factorization for reuse across iterations.
    ///
    /// The Jacobian structure is fixed for the lifetime of a solve and the regularizer
    /// always contributes a full diagonal, so the pattern of the normal equations does not
    /// change between iterations.
    symbolic_factorization: Option<SymbolicLlt<usize>>,
    symbolic_dimension: usize,
}

impl SparseNormalCholeskySolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn symbolic(&mut self, hessian: &SparseColMat<usize, f64>) -> LinAlgResult<SymbolicLlt<usize>> {
        if let Some(cached) = self.symbolic_factorization.as_ref()
            && self.symbolic_dimension == hessian.ncols()
        {
            // SymbolicLlt is reference counted; clone is O(1)
            return Ok(cached.clone());
        }
        let symbolic = SymbolicLlt::try_new(hessian.symbolic(), Side::Lower).map_err(|e| {
            LinAlgError::FactorizationFailed("Symbolic Cholesky decomposition failed".to_string())
                .log_with_source(e)
        })?;
        self.symbolic_factorization = Some(symbolic.clone());
        self.symbolic_dimension = hessian.ncols();
        Ok(symbolic)
    }
}

/// Solve `(H + diag(d2)) x = rhs` with a sparse Cholesky factorization.
pub(crate) fn solve_regularized_sparse(
    hessian: &SparseColMat<usize, f64>,
    d2: &DVector<f64>,
    rhs: &DVector<f64>,
    cache: &mut SparseNormalCholeskySolver,
) -> LinAlgResult<DVector<f64>> {
    let n = hessian.ncols();
    let diagonal: Vec<Triplet<usize, usize, f64>> =
        (0..n).map(|i| Triplet::new(i, i, d2[i])).collect();
    let regularizer = SparseColMat::try_new_from_triplets(n, n, &diagonal).map_err(|e| {
        LinAlgError::SparseMatrixCreation("Failed to create regularizer matrix".to_string())
            .log_with_source(e)
    })?;
    let augmented_hessian = hessian + regularizer;

    let sym = cache.symbolic(&augmented_hessian)?;
    let cholesky = Llt::try_new_with_symbolic(sym, augmented_hessian.as_ref(), Side::Lower)
        .map_err(|_| LinAlgError::SingularMatrix)?;

    let rhs = Mat::from_fn(n, 1, |i, _| rhs[i]);
    let x = cholesky.solve(&rhs);
    let x = DVector::from_fn(n, |i, _| x[(i, 0)]);
    if x.iter().any(|v| !v.is_finite()) {
        return Err(LinAlgError::SingularMatrix);
    }
    Ok(x)
}

impl LinearSolver for SparseNormalCholeskySolver {
    fn solve(
        &mut self,
        a: &BlockSparseMatrix,
        b: &DVector<f64>,
        per_solve: &PerSolveOptions,
    ) -> LinAlgResult<LinearSolverSummary> {
        let jacobian = a.to_sparse_col_mat()?;

        // H = Jᵀ J
        let jt = jacobian.as_ref().transpose();
        let hessian = jt
            .to_col_major()
            .map_err(|e| {
                LinAlgError::MatrixConversion(
                    "Failed to convert transposed Jacobian to column-major format".to_string(),
                )
                .log_with_source(e)
            })?
            .mul(jacobian.as_ref());

        let d2 = regularizer_squared(per_solve.d.as_ref(), a.num_cols())?;
        let rhs = a.left_multiply(b);
        let x = solve_regularized_sparse(&hessian, &d2, &rhs, self)?;
        Ok(LinearSolverSummary::direct(x))
    }
}
