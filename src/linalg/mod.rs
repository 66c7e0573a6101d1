//! Linear solvers for the trust-region subproblem.
//!
//! Every solver minimizes `||A x − b||² + ||D x||²` for a block-sparse `A` and an optional
//! diagonal regularizer `D`, the form both Levenberg-Marquardt and dogleg steps take.
//!
//! | Type | Method |
//! |------|--------|
//! | `DenseNormalCholesky` | dense `AᵀA + D²`, nalgebra Cholesky |
//! | `DenseQr` | dense QR of `[A; D]` |
//! | `SparseNormalCholesky` | faer sparse Cholesky of `AᵀA + D²` |
//! | `DenseSchur` | eliminate e-blocks, dense Cholesky of the Schur complement |
//! | `SparseSchur` | eliminate e-blocks, faer sparse Cholesky of the Schur complement |
//! | `IterativeSchur` | eliminate e-blocks, preconditioned CG on the implicit Schur complement |
//! | `Cgnr` | preconditioned CG on the normal equations |

pub mod block_sparse;
pub mod cholesky;
pub mod dense;
pub mod iterative;
pub mod schur;

use std::fmt::{self, Display, Formatter};

use nalgebra::DVector;
use thiserror::Error;
use tracing::error;

pub use block_sparse::BlockSparseMatrix;
pub use cholesky::SparseNormalCholeskySolver;
pub use dense::{DenseNormalCholeskySolver, DenseQrSolver};
pub use iterative::{CgnrSolver, IterativeSchurSolver};
pub use schur::SchurComplementSolver;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinearSolverType {
    DenseNormalCholesky,
    DenseQr,
    #[default]
    SparseNormalCholesky,
    DenseSchur,
    SparseSchur,
    IterativeSchur,
    Cgnr,
}

impl LinearSolverType {
    /// Whether the solver eliminates group 0 of the ordering via a Schur complement.
    pub fn is_schur_type(&self) -> bool {
        matches!(
            self,
            LinearSolverType::DenseSchur
                | LinearSolverType::SparseSchur
                | LinearSolverType::IterativeSchur
        )
    }

    pub fn is_iterative(&self) -> bool {
        matches!(
            self,
            LinearSolverType::IterativeSchur | LinearSolverType::Cgnr
        )
    }

    pub fn requires_sparse_library(&self) -> bool {
        matches!(
            self,
            LinearSolverType::SparseNormalCholesky | LinearSolverType::SparseSchur
        )
    }

    /// Non-Schur solver used when a Schur solver has nothing to eliminate.
    pub fn schur_fallback(&self) -> Option<LinearSolverType> {
        match self {
            LinearSolverType::SparseSchur => Some(LinearSolverType::SparseNormalCholesky),
            LinearSolverType::DenseSchur => Some(LinearSolverType::DenseQr),
            LinearSolverType::IterativeSchur => Some(LinearSolverType::Cgnr),
            _ => None,
        }
    }
}

impl Display for LinearSolverType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LinearSolverType::DenseNormalCholesky => write!(f, "DENSE_NORMAL_CHOLESKY"),
            LinearSolverType::DenseQr => write!(f, "DENSE_QR"),
            LinearSolverType::SparseNormalCholesky => write!(f, "SPARSE_NORMAL_CHOLESKY"),
            LinearSolverType::DenseSchur => write!(f, "DENSE_SCHUR"),
            LinearSolverType::SparseSchur => write!(f, "SPARSE_SCHUR"),
            LinearSolverType::IterativeSchur => write!(f, "ITERATIVE_SCHUR"),
            LinearSolverType::Cgnr => write!(f, "CGNR"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PreconditionerType {
    Identity,
    #[default]
    Jacobi,
    SchurJacobi,
    ClusterJacobi,
    ClusterTridiagonal,
}

impl PreconditionerType {
    pub fn is_cluster_type(&self) -> bool {
        matches!(
            self,
            PreconditionerType::ClusterJacobi | PreconditionerType::ClusterTridiagonal
        )
    }
}

impl Display for PreconditionerType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PreconditionerType::Identity => write!(f, "IDENTITY"),
            PreconditionerType::Jacobi => write!(f, "JACOBI"),
            PreconditionerType::SchurJacobi => write!(f, "SCHUR_JACOBI"),
            PreconditionerType::ClusterJacobi => write!(f, "CLUSTER_JACOBI"),
            PreconditionerType::ClusterTridiagonal => write!(f, "CLUSTER_TRIDIAGONAL"),
        }
    }
}

/// Backend used by the sparse direct solvers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SparseLinearAlgebraLibraryType {
    #[default]
    Faer,
    NoSparse,
}

impl SparseLinearAlgebraLibraryType {
    pub fn is_available(&self) -> bool {
        matches!(self, SparseLinearAlgebraLibraryType::Faer)
    }
}

impl Display for SparseLinearAlgebraLibraryType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SparseLinearAlgebraLibraryType::Faer => write!(f, "FAER"),
            SparseLinearAlgebraLibraryType::NoSparse => write!(f, "NO_SPARSE"),
        }
    }
}

/// Linear algebra specific error types
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// Matrix factorization failed (Cholesky, QR, etc.)
    #[error("Matrix factorization failed: {0}")]
    FactorizationFailed(String),

    /// Singular or near-singular matrix detected
    #[error("Singular matrix detected (matrix is not invertible)")]
    SingularMatrix,

    /// Failed to create sparse matrix from triplets
    #[error("Failed to create sparse matrix: {0}")]
    SparseMatrixCreation(String),

    /// Matrix format conversion failed
    #[error("Matrix conversion failed: {0}")]
    MatrixConversion(String),

    /// Vector or matrix sizes do not agree
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Options are inconsistent or out of range
    #[error("Invalid linear solver configuration: {0}")]
    InvalidConfiguration(String),

    /// The requested backend or preconditioner is not part of this build
    #[error("Missing capability: {0}")]
    MissingCapability(String),
}

impl LinAlgError {
    /// Whether retrying with a different regularization cannot help.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            LinAlgError::FactorizationFailed(_) | LinAlgError::SingularMatrix
        )
    }

    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error from a third-party library
    ///
    /// # Example
    /// ```ignore
    /// SymbolicLlt::try_new(matrix.symbolic(), Side::Lower)
    ///     .map_err(|e| {
    ///         LinAlgError::FactorizationFailed(
    ///             "Symbolic Cholesky decomposition failed".to_string()
    ///         )
    ///         .log_with_source(e)
    ///     })?;
    /// ```
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for linear algebra operations
pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Per-call parameters of a linear solve.
#[derive(Debug, Clone)]
pub struct PerSolveOptions {
    /// Diagonal of the regularizer `D`; `None` means `D = 0`.
    pub d: Option<DVector<f64>>,
    /// Iterative solvers stop once the residual of the system they iterate on drops
    /// below `r_tolerance` times the norm of its right hand side.
    pub r_tolerance: f64,
}

impl Default for PerSolveOptions {
    fn default() -> Self {
        Self {
            d: None,
            r_tolerance: 1e-8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinearSolverTerminationType {
    Success,
    /// An iterative solver hit its iteration cap; the returned solution is still usable.
    NoConvergence,
}

#[derive(Debug, Clone)]
pub struct LinearSolverSummary {
    pub x: DVector<f64>,
    pub num_iterations: usize,
    pub termination_type: LinearSolverTerminationType,
}

impl LinearSolverSummary {
    pub(crate) fn direct(x: DVector<f64>) -> Self {
        Self {
            x,
            num_iterations: 1,
            termination_type: LinearSolverTerminationType::Success,
        }
    }
}

/// Trait for linear solvers of the regularized least squares problem.
pub trait LinearSolver: Send {
    /// Minimize `||A x − b||² + ||D x||²`.
    ///
    /// # Errors
    /// Returns `LinAlgError` when the system cannot be factorized or sizes disagree.
    fn solve(
        &mut self,
        a: &BlockSparseMatrix,
        b: &DVector<f64>,
        per_solve: &PerSolveOptions,
    ) -> LinAlgResult<LinearSolverSummary>;
}

/// Options used to construct a linear solver.
#[derive(Debug, Clone)]
pub struct LinearSolverOptions {
    pub linear_solver_type: LinearSolverType,
    pub preconditioner_type: PreconditionerType,
    pub sparse_linear_algebra_library: SparseLinearAlgebraLibraryType,
    pub min_num_iterations: usize,
    pub max_num_iterations: usize,
    pub num_threads: usize,
    /// Sizes of the elimination groups in ascending group order. Schur solvers eliminate
    /// the first group.
    pub elimination_groups: Vec<usize>,
}

impl Default for LinearSolverOptions {
    fn default() -> Self {
        Self {
            linear_solver_type: LinearSolverType::default(),
            preconditioner_type: PreconditionerType::default(),
            sparse_linear_algebra_library: SparseLinearAlgebraLibraryType::default(),
            min_num_iterations: 1,
            max_num_iterations: 500,
            num_threads: 1,
            elimination_groups: Vec::new(),
        }
    }
}

/// Build the solver described by `options`.
///
/// # Errors
/// Returns `LinAlgError::MissingCapability` when the requested backend or preconditioner is
/// unavailable and `LinAlgError::InvalidConfiguration` for malformed options.
pub fn create_linear_solver(options: &LinearSolverOptions) -> LinAlgResult<Box<dyn LinearSolver>> {
    let solver_type = options.linear_solver_type;

    if solver_type.requires_sparse_library() && !options.sparse_linear_algebra_library.is_available()
    {
        return Err(LinAlgError::MissingCapability(format!(
            "{} requires a sparse linear algebra library, but {} was selected",
            solver_type, options.sparse_linear_algebra_library
        ))
        .log());
    }
    if solver_type.is_iterative() && options.preconditioner_type.is_cluster_type() {
        return Err(LinAlgError::MissingCapability(format!(
            "{} preconditioner requires visibility based clustering, which this build does not provide",
            options.preconditioner_type
        ))
        .log());
    }
    if solver_type == LinearSolverType::Cgnr
        && !matches!(
            options.preconditioner_type,
            PreconditionerType::Identity | PreconditionerType::Jacobi
        )
    {
        return Err(LinAlgError::InvalidConfiguration(format!(
            "CGNR supports only IDENTITY and JACOBI preconditioners, got {}",
            options.preconditioner_type
        ))
        .log());
    }
    if options.min_num_iterations == 0 || options.min_num_iterations > options.max_num_iterations
    {
        return Err(LinAlgError::InvalidConfiguration(format!(
            "linear solver iterations must satisfy 0 < min ({}) <= max ({})",
            options.min_num_iterations, options.max_num_iterations
        ))
        .log());
    }
    if solver_type.is_schur_type() && options.elimination_groups.len() < 2 {
        return Err(LinAlgError::InvalidConfiguration(format!(
            "{} needs at least two elimination groups, got {}",
            solver_type,
            options.elimination_groups.len()
        ))
        .log());
    }

    let num_eliminate_blocks = options.elimination_groups.first().copied().unwrap_or(0);

    let solver: Box<dyn LinearSolver> = match solver_type {
        LinearSolverType::DenseNormalCholesky => Box::new(DenseNormalCholeskySolver::new()),
        LinearSolverType::DenseQr => Box::new(DenseQrSolver::new()),
        LinearSolverType::SparseNormalCholesky => Box::new(SparseNormalCholeskySolver::new()),
        LinearSolverType::DenseSchur => Box::new(SchurComplementSolver::dense(
            num_eliminate_blocks,
            options.num_threads,
        )),
        LinearSolverType::SparseSchur => Box::new(SchurComplementSolver::sparse(
            num_eliminate_blocks,
            options.num_threads,
        )),
        LinearSolverType::IterativeSchur => Box::new(IterativeSchurSolver::new(
            num_eliminate_blocks,
            options.preconditioner_type,
            options.min_num_iterations,
            options.max_num_iterations,
            options.num_threads,
        )),
        LinearSolverType::Cgnr => Box::new(CgnrSolver::new(
            options.preconditioner_type,
            options.min_num_iterations,
            options.max_num_iterations,
        )),
    };
    Ok(solver)
}

/// Diagonal of `D²`, or zeros.
pub(crate) fn regularizer_squared(d: Option<&DVector<f64>>, n: usize) -> LinAlgResult<DVector<f64>> {
    match d {
        Some(d) if d.len() != n => Err(LinAlgError::DimensionMismatch(format!(
            "regularizer has {} entries, system has {} columns",
            d.len(),
            n
        ))),
        Some(d) => Ok(d.component_mul(d)),
        None => Ok(DVector::zeros(n)),
    }
}
