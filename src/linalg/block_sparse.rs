//! Block-sparse matrices.
//!
//! Jacobians of least squares problems are naturally block structured: each residual
//! block contributes a row block, each parameter block a column block, and the only
//! non-zero cells are where a residual block depends on a parameter block. The matrix
//! stores those cells densely and row-block by row-block, with the cells of each row sorted
//! by column block. Schur eliminators rely on that sort: a row's e-block cell, if any,
//! comes first.

use faer::sparse::{SparseColMat, Triplet};
use nalgebra::{DMatrix, DVector};

use crate::linalg::{LinAlgError, LinAlgResult};

/// Size and starting offset of a row or column block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub size: usize,
    pub position: usize,
}

/// Dense cell of a row block.
#[derive(Debug, Clone)]
pub struct Cell {
    /// Column block index.
    pub block_id: usize,
    pub values: DMatrix<f64>,
}

#[derive(Debug, Clone)]
pub struct CompressedRow {
    pub block: Block,
    pub cells: Vec<Cell>,
}

#[derive(Debug, Clone)]
pub struct BlockSparseMatrix {
    col_blocks: Vec<Block>,
    rows: Vec<CompressedRow>,
    num_rows: usize,
    num_cols: usize,
}

impl BlockSparseMatrix {
    /// Create a zero matrix. `row_structure` lists, per row block, its size and the column
    /// blocks it touches.
    pub fn new(col_block_sizes: &[usize], row_structure: &[(usize, Vec<usize>)]) -> Self {
        let mut col_blocks = Vec::with_capacity(col_block_sizes.len());
        let mut num_cols = 0;
        for &size in col_block_sizes {
            col_blocks.push(Block {
                size,
                position: num_cols,
            });
            num_cols += size;
        }

        let mut rows = Vec::with_capacity(row_structure.len());
        let mut num_rows = 0;
        for (row_size, cols) in row_structure {
            let mut cols = cols.clone();
            cols.sort_unstable();
            cols.dedup();
            let cells = cols
                .into_iter()
                .map(|block_id| Cell {
                    block_id,
                    values: DMatrix::zeros(*row_size, col_blocks[block_id].size),
                })
                .collect();
            rows.push(CompressedRow {
                block: Block {
                    size: *row_size,
                    position: num_rows,
                },
                cells,
            });
            num_rows += row_size;
        }

        Self {
            col_blocks,
            rows,
            num_rows,
            num_cols,
        }
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_cols(&self) -> usize {
        self.num_cols
    }

    pub fn col_blocks(&self) -> &[Block] {
        &self.col_blocks
    }

    pub fn rows(&self) -> &[CompressedRow] {
        &self.rows
    }

    pub fn rows_mut(&mut self) -> &mut [CompressedRow] {
        &mut self.rows
    }

    pub fn num_nonzeros(&self) -> usize {
        self.rows
            .iter()
            .flat_map(|r| r.cells.iter())
            .map(|c| c.values.len())
            .sum()
    }

    pub fn set_zero(&mut self) {
        for row in &mut self.rows {
            for cell in &mut row.cells {
                cell.values.fill(0.0);
            }
        }
    }

    /// `A x`
    pub fn right_multiply(&self, x: &DVector<f64>) -> DVector<f64> {
        let mut y = DVector::zeros(self.num_rows);
        for row in &self.rows {
            let mut out = y.rows_mut(row.block.position, row.block.size);
            for cell in &row.cells {
                let col = self.col_blocks[cell.block_id];
                out += &cell.values * x.rows(col.position, col.size);
            }
        }
        y
    }

    /// `Aᵀ y`
    pub fn left_multiply(&self, y: &DVector<f64>) -> DVector<f64> {
        let mut x = DVector::zeros(self.num_cols);
        for row in &self.rows {
            let y_row = y.rows(row.block.position, row.block.size);
            for cell in &row.cells {
                let col = self.col_blocks[cell.block_id];
                let mut out = x.rows_mut(col.position, col.size);
                out += cell.values.tr_mul(&y_row);
            }
        }
        x
    }

    /// Squared Euclidean norm of every column.
    pub fn squared_column_norm(&self) -> DVector<f64> {
        let mut norms = DVector::zeros(self.num_cols);
        for row in &self.rows {
            for cell in &row.cells {
                let col = self.col_blocks[cell.block_id];
                for j in 0..col.size {
                    norms[col.position + j] += cell.values.column(j).norm_squared();
                }
            }
        }
        norms
    }

    /// Multiply column `j` by `scale[j]`.
    pub fn scale_columns(&mut self, scale: &DVector<f64>) {
        for row in &mut self.rows {
            for cell in &mut row.cells {
                let col = self.col_blocks[cell.block_id];
                for j in 0..col.size {
                    cell.values.column_mut(j).scale_mut(scale[col.position + j]);
                }
            }
        }
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        let mut dense = DMatrix::zeros(self.num_rows, self.num_cols);
        for row in &self.rows {
            for cell in &row.cells {
                let col = self.col_blocks[cell.block_id];
                dense
                    .view_mut((row.block.position, col.position), (row.block.size, col.size))
                    .copy_from(&cell.values);
            }
        }
        dense
    }

    /// Convert to a faer compressed-column matrix.
    pub fn to_sparse_col_mat(&self) -> LinAlgResult<SparseColMat<usize, f64>> {
        let mut triplets = Vec::with_capacity(self.num_nonzeros());
        for row in &self.rows {
            for cell in &row.cells {
                let col = self.col_blocks[cell.block_id];
                for i in 0..row.block.size {
                    for j in 0..col.size {
                        triplets.push(Triplet::new(
                            row.block.position + i,
                            col.position + j,
                            cell.values[(i, j)],
                        ));
                    }
                }
            }
        }
        SparseColMat::try_new_from_triplets(self.num_rows, self.num_cols, &triplets).map_err(|e| {
            LinAlgError::SparseMatrixCreation("Failed to build sparse Jacobian".to_string())
                .log_with_source(e)
        })
    }
}
