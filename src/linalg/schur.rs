//! Schur complement elimination.
//!
//! The first `num_eliminate_blocks` column blocks (the e-blocks) form an independent set:
//! no row block touches more than one of them, so `EᵀE` is block diagonal and cheap to
//! invert. The remaining f-blocks are solved through the reduced system
//!
//! ```text
//! S  = FᵀF + D_f² − FᵀE (EᵀE + D_e²)⁻¹ EᵀF
//! S y = Fᵀb − FᵀE (EᵀE + D_e²)⁻¹ Eᵀb
//! ```
//!
//! after which every e-block is recovered independently by back substitution.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use faer::sparse::{SparseColMat, Triplet};
use nalgebra::{DMatrix, DVector};

use crate::linalg::{
    BlockSparseMatrix, LinAlgError, LinAlgResult, LinearSolver, LinearSolverSummary,
    PerSolveOptions,
    block_sparse::{Block, Cell},
    cholesky::{SparseNormalCholeskySolver, solve_regularized_sparse},
    regularizer_squared,
};
use crate::parallel::WorkerPool;

/// Elimination data of a single e-block.
#[derive(Debug, Clone)]
struct EliminatedBlock {
    /// `(EᵀE + D_e²)⁻¹`
    ete_inv: DMatrix<f64>,
    /// `Eᵀb`
    g: DVector<f64>,
    /// `EᵀF_k` for every f-block `k` sharing a row with this e-block, sorted by `k`.
    etf: Vec<(usize, DMatrix<f64>)>,
}

/// Blocks of the reduced matrix keyed by (row f-block, column f-block).
pub(crate) type ReducedBlocks = BTreeMap<(usize, usize), DMatrix<f64>>;

/// Eliminates the e-blocks of one linear system.
pub(crate) struct SchurEliminator<'a> {
    a: &'a BlockSparseMatrix,
    b: &'a DVector<f64>,
    d2: &'a DVector<f64>,
    pool: &'a WorkerPool,
    num_eliminate_blocks: usize,
    e_dim: usize,
    /// f-blocks with positions relative to the start of the reduced system.
    f_blocks: Vec<Block>,
    eliminated: Vec<EliminatedBlock>,
}

impl<'a> SchurEliminator<'a> {
    /// Form `(EᵀE + D_e²)⁻¹`, `Eᵀb` and `EᵀF` for every e-block.
    ///
    /// # Errors
    /// Fails when sizes disagree, when a row block touches two e-blocks, or when some
    /// `EᵀE + D_e²` is not positive definite.
    pub(crate) fn new(
        a: &'a BlockSparseMatrix,
        b: &'a DVector<f64>,
        d2: &'a DVector<f64>,
        num_eliminate_blocks: usize,
        pool: &'a WorkerPool,
    ) -> LinAlgResult<Self> {
        let col_blocks = a.col_blocks();
        if num_eliminate_blocks > col_blocks.len() {
            return Err(LinAlgError::DimensionMismatch(format!(
                "cannot eliminate {} of {} column blocks",
                num_eliminate_blocks,
                col_blocks.len()
            )));
        }
        if b.len() != a.num_rows() || d2.len() != a.num_cols() {
            return Err(LinAlgError::DimensionMismatch(format!(
                "system is {}x{}, right hand side has {} entries and regularizer {}",
                a.num_rows(),
                a.num_cols(),
                b.len(),
                d2.len()
            )));
        }

        let e_dim = col_blocks
            .get(num_eliminate_blocks)
            .map_or(a.num_cols(), |block| block.position);
        let f_blocks = col_blocks[num_eliminate_blocks..]
            .iter()
            .map(|block| Block {
                size: block.size,
                position: block.position - e_dim,
            })
            .collect();

        let mut rows_of_e_block = vec![Vec::new(); num_eliminate_blocks];
        for (r, row) in a.rows().iter().enumerate() {
            let e_cells = row
                .cells
                .iter()
                .take_while(|cell| cell.block_id < num_eliminate_blocks)
                .count();
            if e_cells > 1 {
                return Err(LinAlgError::InvalidConfiguration(format!(
                    "row block {} depends on {} eliminated blocks",
                    r, e_cells
                )));
            }
            if e_cells == 1 {
                rows_of_e_block[row.cells[0].block_id].push(r);
            }
        }

        let eliminated = pool
            .map_indices(num_eliminate_blocks, |e| {
                eliminate_block(a, b, d2, e, num_eliminate_blocks, &rows_of_e_block[e])
            })
            .into_iter()
            .collect::<LinAlgResult<Vec<_>>>()?;

        Ok(Self {
            a,
            b,
            d2,
            pool,
            num_eliminate_blocks,
            e_dim,
            f_blocks,
            eliminated,
        })
    }

    pub(crate) fn reduced_dimension(&self) -> usize {
        self.a.num_cols() - self.e_dim
    }

    pub(crate) fn f_blocks(&self) -> &[Block] {
        &self.f_blocks
    }

    /// Right hand side of the reduced system.
    pub(crate) fn reduced_rhs(&self) -> DVector<f64> {
        let mut rhs = DVector::zeros(self.reduced_dimension());
        for row in self.a.rows() {
            let b_row = self.b.rows(row.block.position, row.block.size);
            for cell in self.f_cells(&row.cells) {
                let f = self.f_blocks[cell.block_id - self.num_eliminate_blocks];
                let mut out = rhs.rows_mut(f.position, f.size);
                out += cell.values.tr_mul(&b_row);
            }
        }
        for block in &self.eliminated {
            let v = &block.ete_inv * &block.g;
            for (k, etf) in &block.etf {
                let f = self.f_blocks[*k];
                let mut out = rhs.rows_mut(f.position, f.size);
                out -= etf.tr_mul(&v);
            }
        }
        rhs
    }

    /// Non-zero blocks of the reduced matrix, including `D_f²`.
    ///
    /// The block pattern depends only on the structure of `A`, never on its values.
    /// With `diagonal_only` only the `(k, k)` blocks are formed.
    pub(crate) fn reduced_blocks(&self, diagonal_only: bool) -> ReducedBlocks {
        let mut blocks = ReducedBlocks::new();
        for (k, f) in self.f_blocks.iter().enumerate() {
            let d2 = self.d2.rows(self.e_dim + f.position, f.size);
            blocks.insert((k, k), DMatrix::from_diagonal(&d2));
        }

        for row in self.a.rows() {
            let cells: Vec<_> = self.f_cells(&row.cells).collect();
            for c1 in &cells {
                for c2 in &cells {
                    if diagonal_only && c1.block_id != c2.block_id {
                        continue;
                    }
                    let key = (
                        c1.block_id - self.num_eliminate_blocks,
                        c2.block_id - self.num_eliminate_blocks,
                    );
                    accumulate(&mut blocks, key, c1.values.tr_mul(&c2.values));
                }
            }
        }

        for block in &self.eliminated {
            for (l, etf_l) in &block.etf {
                let inv_etf_l = &block.ete_inv * etf_l;
                for (k, etf_k) in &block.etf {
                    if diagonal_only && k != l {
                        continue;
                    }
                    accumulate(&mut blocks, (*k, *l), -etf_k.tr_mul(&inv_etf_l));
                }
            }
        }
        blocks
    }

    pub(crate) fn assemble_dense(&self, blocks: &ReducedBlocks) -> DMatrix<f64> {
        let n = self.reduced_dimension();
        let mut s = DMatrix::zeros(n, n);
        for ((k, l), values) in blocks {
            let (fk, fl) = (self.f_blocks[*k], self.f_blocks[*l]);
            s.view_mut((fk.position, fl.position), (fk.size, fl.size))
                .copy_from(values);
        }
        s
    }

    pub(crate) fn assemble_sparse(
        &self,
        blocks: &ReducedBlocks,
    ) -> LinAlgResult<SparseColMat<usize, f64>> {
        let n = self.reduced_dimension();
        let mut triplets = Vec::new();
        for ((k, l), values) in blocks {
            let (fk, fl) = (self.f_blocks[*k], self.f_blocks[*l]);
            for i in 0..fk.size {
                for j in 0..fl.size {
                    triplets.push(Triplet::new(
                        fk.position + i,
                        fl.position + j,
                        values[(i, j)],
                    ));
                }
            }
        }
        SparseColMat::try_new_from_triplets(n, n, &triplets).map_err(|e| {
            LinAlgError::SparseMatrixCreation("Failed to build Schur complement".to_string())
                .log_with_source(e)
        })
    }

    /// `S y` without forming `S`.
    pub(crate) fn apply_reduced(&self, y: &DVector<f64>) -> DVector<f64> {
        let d2_f = self.d2.rows(self.e_dim, self.reduced_dimension());
        let mut out = d2_f.component_mul(y);

        for row in self.a.rows() {
            let mut fy = DVector::zeros(row.block.size);
            for cell in self.f_cells(&row.cells) {
                let f = self.f_blocks[cell.block_id - self.num_eliminate_blocks];
                fy += &cell.values * y.rows(f.position, f.size);
            }
            for cell in self.f_cells(&row.cells) {
                let f = self.f_blocks[cell.block_id - self.num_eliminate_blocks];
                let mut o = out.rows_mut(f.position, f.size);
                o += cell.values.tr_mul(&fy);
            }
        }

        for block in &self.eliminated {
            let mut z = DVector::zeros(block.ete_inv.nrows());
            for (k, etf) in &block.etf {
                let f = self.f_blocks[*k];
                z += etf * y.rows(f.position, f.size);
            }
            let w = &block.ete_inv * z;
            for (k, etf) in &block.etf {
                let f = self.f_blocks[*k];
                let mut o = out.rows_mut(f.position, f.size);
                o -= etf.tr_mul(&w);
            }
        }
        out
    }

    /// Full solution from the reduced one: `x_e = (EᵀE + D_e²)⁻¹ (Eᵀb − EᵀF y)`.
    pub(crate) fn back_substitute(&self, y: &DVector<f64>) -> DVector<f64> {
        let mut x = DVector::zeros(self.a.num_cols());
        x.rows_mut(self.e_dim, self.reduced_dimension()).copy_from(y);

        let x_e = self.pool.map_indices(self.eliminated.len(), |e| {
            let block = &self.eliminated[e];
            let mut rhs = block.g.clone();
            for (k, etf) in &block.etf {
                let f = self.f_blocks[*k];
                rhs -= etf * y.rows(f.position, f.size);
            }
            &block.ete_inv * rhs
        });
        for (e, values) in x_e.into_iter().enumerate() {
            let block = self.a.col_blocks()[e];
            x.rows_mut(block.position, block.size).copy_from(&values);
        }
        x
    }

    fn f_cells<'c>(&self, cells: &'c [Cell]) -> impl Iterator<Item = &'c Cell> + use<'c> {
        let first_f = self.num_eliminate_blocks;
        cells.iter().filter(move |cell| cell.block_id >= first_f)
    }
}

fn accumulate(blocks: &mut ReducedBlocks, key: (usize, usize), values: DMatrix<f64>) {
    match blocks.entry(key) {
        Entry::Occupied(mut entry) => *entry.get_mut() += values,
        Entry::Vacant(entry) => {
            entry.insert(values);
        }
    }
}

fn eliminate_block(
    a: &BlockSparseMatrix,
    b: &DVector<f64>,
    d2: &DVector<f64>,
    e: usize,
    num_eliminate_blocks: usize,
    rows: &[usize],
) -> LinAlgResult<EliminatedBlock> {
    let block = a.col_blocks()[e];
    let mut ete = DMatrix::from_diagonal(&d2.rows(block.position, block.size));
    let mut g = DVector::zeros(block.size);
    let mut etf: BTreeMap<usize, DMatrix<f64>> = BTreeMap::new();

    for &r in rows {
        let row = &a.rows()[r];
        let e_cell = &row.cells[0];
        let b_row = b.rows(row.block.position, row.block.size);
        ete += e_cell.values.tr_mul(&e_cell.values);
        g += e_cell.values.tr_mul(&b_row);
        for cell in &row.cells[1..] {
            let contribution = e_cell.values.tr_mul(&cell.values);
            match etf.entry(cell.block_id - num_eliminate_blocks) {
                Entry::Occupied(mut entry) => *entry.get_mut() += contribution,
                Entry::Vacant(entry) => {
                    entry.insert(contribution);
                }
            }
        }
    }

    let ete_inv = ete
        .cholesky()
        .ok_or_else(|| {
            LinAlgError::FactorizationFailed(format!(
                "eliminated block {} is not positive definite",
                e
            ))
        })?
        .inverse();

    Ok(EliminatedBlock {
        ete_inv,
        g,
        etf: etf.into_iter().collect(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReducedSystemBackend {
    Dense,
    Sparse,
}

/// Direct Schur complement solver; the reduced system is factorized either densely with
/// nalgebra or sparsely with faer.
#[derive(Debug)]
pub struct SchurComplementSolver {
    num_eliminate_blocks: usize,
    backend: ReducedSystemBackend,
    pool: WorkerPool,
    sparse_cache: SparseNormalCholeskySolver,
}

impl SchurComplementSolver {
    pub fn dense(num_eliminate_blocks: usize, num_threads: usize) -> Self {
        Self::with_backend(num_eliminate_blocks, num_threads, ReducedSystemBackend::Dense)
    }

    pub fn sparse(num_eliminate_blocks: usize, num_threads: usize) -> Self {
        Self::with_backend(num_eliminate_blocks, num_threads, ReducedSystemBackend::Sparse)
    }

    fn with_backend(
        num_eliminate_blocks: usize,
        num_threads: usize,
        backend: ReducedSystemBackend,
    ) -> Self {
        Self {
            num_eliminate_blocks,
            backend,
            pool: WorkerPool::new(num_threads),
            sparse_cache: SparseNormalCholeskySolver::new(),
        }
    }
}

impl LinearSolver for SchurComplementSolver {
    fn solve(
        &mut self,
        a: &BlockSparseMatrix,
        b: &DVector<f64>,
        per_solve: &PerSolveOptions,
    ) -> LinAlgResult<LinearSolverSummary> {
        let d2 = regularizer_squared(per_solve.d.as_ref(), a.num_cols())?;
        let eliminator = SchurEliminator::new(a, b, &d2, self.num_eliminate_blocks, &self.pool)?;

        let n = eliminator.reduced_dimension();
        let y = if n == 0 {
            DVector::zeros(0)
        } else {
            let rhs = eliminator.reduced_rhs();
            let blocks = eliminator.reduced_blocks(false);
            match self.backend {
                ReducedSystemBackend::Dense => eliminator
                    .assemble_dense(&blocks)
                    .cholesky()
                    .ok_or(LinAlgError::SingularMatrix)?
                    .solve(&rhs),
                ReducedSystemBackend::Sparse => {
                    let s = eliminator.assemble_sparse(&blocks)?;
                    solve_regularized_sparse(&s, &DVector::zeros(n), &rhs, &mut self.sparse_cache)?
                }
            }
        };

        let x = eliminator.back_substitute(&y);
        if x.iter().any(|v| !v.is_finite()) {
            return Err(LinAlgError::SingularMatrix);
        }
        Ok(LinearSolverSummary::direct(x))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::linalg::dense::tests::reference_solution;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// Bundle-adjustment shaped system: three 2-dim "points" eliminated against two
    /// 3-dim "cameras", every observation touching one point and one camera.
    pub(crate) fn bundle_system() -> (BlockSparseMatrix, DVector<f64>) {
        let mut structure = Vec::new();
        for point in 0..3 {
            for camera in 3..5 {
                structure.push((2, vec![point, camera]));
            }
        }
        // A prior on the first camera only.
        structure.push((3, vec![3]));
        let mut a = BlockSparseMatrix::new(&[2, 2, 2, 3, 3], &structure);

        let mut value = 0.3;
        for row in a.rows_mut() {
            for cell in &mut row.cells {
                for v in cell.values.iter_mut() {
                    value = (value * 7.3 + 0.11) % 2.0 - 0.5;
                    *v = value;
                }
            }
        }
        if let Some(prior) = a.rows_mut().last_mut() {
            prior.cells[0].values = DMatrix::identity(3, 3);
        }
        let b = DVector::from_fn(a.num_rows(), |i, _| (i as f64 * 0.37).sin());
        (a, b)
    }

    #[test]
    fn test_dense_and_sparse_schur_match_normal_equations() -> TestResult {
        let (a, b) = bundle_system();
        let d = DVector::from_element(a.num_cols(), 0.1);
        let expected = reference_solution(&a, &b, Some(&d));
        let per_solve = PerSolveOptions {
            d: Some(d),
            ..Default::default()
        };

        let mut dense = SchurComplementSolver::dense(3, 1);
        let x = dense.solve(&a, &b, &per_solve)?.x;
        assert!((x - &expected).norm() < 1e-9);

        let mut sparse = SchurComplementSolver::sparse(3, 2);
        for _ in 0..2 {
            let x = sparse.solve(&a, &b, &per_solve)?.x;
            assert!((x - &expected).norm() < 1e-9);
        }
        Ok(())
    }

    #[test]
    fn test_implicit_product_matches_assembled_matrix() -> TestResult {
        let (a, b) = bundle_system();
        let d2 = DVector::from_element(a.num_cols(), 0.04);
        let pool = WorkerPool::new(1);
        let eliminator = SchurEliminator::new(&a, &b, &d2, 3, &pool)?;
        assert_eq!(eliminator.reduced_dimension(), 6);

        let s = eliminator.assemble_dense(&eliminator.reduced_blocks(false));
        assert!((&s - s.transpose()).norm() < 1e-12);

        let y = DVector::from_vec(vec![1.0, -0.5, 0.25, 2.0, 0.0, -1.0]);
        assert!((eliminator.apply_reduced(&y) - &s * &y).norm() < 1e-10);

        let diagonal = eliminator.assemble_dense(&eliminator.reduced_blocks(true));
        for k in 0..6 {
            assert!((diagonal[(k, k)] - s[(k, k)]).abs() < 1e-12);
        }
        Ok(())
    }

    #[test]
    fn test_eliminating_everything() -> TestResult {
        // Every column block eliminated: the reduced system is empty.
        let mut a = BlockSparseMatrix::new(&[1, 2], &[(2, vec![0]), (3, vec![1])]);
        for row in a.rows_mut() {
            for (i, v) in row.cells[0].values.iter_mut().enumerate() {
                *v = 1.0 + (i * i) as f64;
            }
        }
        let b = DVector::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        let expected = reference_solution(&a, &b, None);
        let x = SchurComplementSolver::dense(2, 1)
            .solve(&a, &b, &PerSolveOptions::default())?
            .x;
        assert!((x - expected).norm() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_row_touching_two_eliminated_blocks_is_rejected() {
        let a = BlockSparseMatrix::new(&[1, 1, 1], &[(1, vec![0, 1, 2])]);
        let b = DVector::from_vec(vec![1.0]);
        let result = SchurComplementSolver::dense(2, 1).solve(&a, &b, &PerSolveOptions::default());
        assert!(matches!(result, Err(LinAlgError::InvalidConfiguration(_))));
    }
}
