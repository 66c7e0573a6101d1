//! Evaluation of a reduced program at a contiguous state vector.
//!
//! The evaluator captures everything it needs from the [`Problem`] when it is created:
//! shared handles to cost functions, losses and manifolds, the values of constant blocks
//! and the offsets of the free ones. It never borrows the problem afterwards, so the
//! minimizer can keep evaluating while callbacks write accepted states back into user
//! memory.
//!
//! Jacobians are produced in tangent space: the column block of a parameter block with a
//! manifold has the manifold's tangent size, and the cost function Jacobian is projected
//! through [`Manifold::plus_jacobian`](crate::core::manifold::Manifold::plus_jacobian).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use nalgebra::{DMatrix, DVector};
use tracing::debug;
use web_time::{Duration, Instant};

use crate::core::{
    CoreError, CoreResult,
    cost_function::{CostFunction, GradientCheckingCostFunction},
    loss_functions::LossFunction,
    manifold::Manifold,
    parameter_block::ParameterBlockId,
    problem::Problem,
    program::Program,
    residual_block::{ResidualBlockId, evaluate_cost_function},
};
use crate::linalg::{BlockSparseMatrix, LinearSolverType};
use crate::parallel::WorkerPool;

/// Shape of the Jacobian handed to the linear solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JacobianLayout {
    /// Rows touching the first `num_eliminate_blocks` column blocks come first, grouped
    /// by that block, as Schur eliminators expect.
    SchurReady { num_eliminate_blocks: usize },
    /// No constraint on the row order.
    General,
}

impl JacobianLayout {
    pub fn for_solver(linear_solver_type: LinearSolverType, num_eliminate_blocks: usize) -> Self {
        if linear_solver_type.is_schur_type() && num_eliminate_blocks > 0 {
            JacobianLayout::SchurReady {
                num_eliminate_blocks,
            }
        } else {
            JacobianLayout::General
        }
    }

    pub fn num_eliminate_blocks(&self) -> usize {
        match self {
            JacobianLayout::SchurReady {
                num_eliminate_blocks,
            } => *num_eliminate_blocks,
            JacobianLayout::General => 0,
        }
    }
}

/// Settings of the gradient-checking decorator applied to every cost function.
#[derive(Debug, Clone)]
pub struct GradientCheckingOptions {
    pub relative_step_size: f64,
    pub relative_precision: f64,
    /// Incremented once per mismatching Jacobian block.
    pub mismatches: Arc<AtomicUsize>,
}

#[derive(Debug, Clone)]
pub struct EvaluatorOptions {
    pub linear_solver_type: LinearSolverType,
    pub num_eliminate_blocks: usize,
    pub num_threads: usize,
    pub gradient_checking: Option<GradientCheckingOptions>,
}

impl Default for EvaluatorOptions {
    fn default() -> Self {
        Self {
            linear_solver_type: LinearSolverType::default(),
            num_eliminate_blocks: 0,
            num_threads: 1,
            gradient_checking: None,
        }
    }
}

/// Result of one evaluation.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// `Σ ½ρ(||rᵢ||²)`
    pub cost: f64,
    /// Loss-corrected residuals.
    pub residuals: DVector<f64>,
    /// Tangent-space gradient `Jᵀr`, present when the Jacobian was requested.
    pub gradient: Option<DVector<f64>>,
    pub jacobian: Option<BlockSparseMatrix>,
}

/// Counters and timers accumulated over the evaluator's lifetime.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvaluatorStatistics {
    pub num_residual_evaluations: usize,
    pub num_jacobian_evaluations: usize,
    pub residual_evaluation_time: Duration,
    pub jacobian_evaluation_time: Duration,
}

#[derive(Clone)]
struct FreeBlock {
    id: ParameterBlockId,
    state_offset: usize,
    size: usize,
    delta_offset: usize,
    local_size: usize,
    manifold: Option<Arc<dyn Manifold>>,
}

#[derive(Clone)]
enum ParameterSlot {
    /// Index into the free blocks, which is also the Jacobian column block.
    Free(usize),
    Constant(DVector<f64>),
}

#[derive(Clone)]
struct ResidualTerm {
    id: ResidualBlockId,
    cost_function: Arc<dyn CostFunction>,
    loss_function: Option<Arc<dyn LossFunction>>,
    slots: Vec<ParameterSlot>,
    row_offset: usize,
    num_residuals: usize,
}

struct TermEvaluation {
    cost: f64,
    residuals: DVector<f64>,
    /// Tangent Jacobians keyed by column block.
    jacobians: Vec<(usize, DMatrix<f64>)>,
}

pub struct Evaluator {
    free_blocks: Vec<FreeBlock>,
    terms: Vec<ResidualTerm>,
    layout: JacobianLayout,
    jacobian_template: BlockSparseMatrix,
    num_parameters: usize,
    num_effective_parameters: usize,
    num_residuals: usize,
    pool: WorkerPool,
    statistics: EvaluatorStatistics,
}

/// Build an evaluator for `program`.
///
/// Every parameter block of the program becomes a free block, in program order; blocks
/// referenced by the program's residuals but not part of it are frozen at their current
/// values.
///
/// # Errors
/// Fails on stale handles, or when a Schur-ready layout is requested and the residual
/// blocks are not grouped by their eliminated parameter block.
pub fn create_evaluator(
    options: &EvaluatorOptions,
    problem: &Problem,
    program: &Program,
) -> CoreResult<Evaluator> {
    let layout = JacobianLayout::for_solver(options.linear_solver_type, options.num_eliminate_blocks);

    let mut free_blocks = Vec::with_capacity(program.num_parameter_blocks());
    let mut column_of: HashMap<ParameterBlockId, usize> = HashMap::new();
    let mut state_offset = 0;
    let mut delta_offset = 0;
    for &id in program.parameter_blocks() {
        let block = problem.parameter_block(id)?;
        column_of.insert(id, free_blocks.len());
        free_blocks.push(FreeBlock {
            id,
            state_offset,
            size: block.size(),
            delta_offset,
            local_size: block.local_size(),
            manifold: block.manifold().cloned(),
        });
        state_offset += block.size();
        delta_offset += block.local_size();
    }

    let mut terms = Vec::with_capacity(program.num_residual_blocks());
    let mut row_structure = Vec::with_capacity(program.num_residual_blocks());
    let mut row_offset = 0;
    for &r in program.residual_blocks() {
        let residual_block = problem.residual_block(r)?;
        let mut slots = Vec::with_capacity(residual_block.parameter_blocks().len());
        let mut columns = Vec::new();
        for &p in residual_block.parameter_blocks() {
            match column_of.get(&p) {
                Some(&column) => {
                    slots.push(ParameterSlot::Free(column));
                    columns.push(column);
                }
                None => slots.push(ParameterSlot::Constant(problem.parameter_values(p)?.clone())),
            }
        }

        let cost_function: Arc<dyn CostFunction> = match &options.gradient_checking {
            Some(check) => Arc::new(GradientCheckingCostFunction::new(
                residual_block.cost_function().clone(),
                format!("residual block {r}"),
                check.relative_step_size,
                check.relative_precision,
                check.mismatches.clone(),
            )),
            None => residual_block.cost_function().clone(),
        };

        let num_residuals = residual_block.num_residuals();
        row_structure.push((num_residuals, columns));
        terms.push(ResidualTerm {
            id: r,
            cost_function,
            loss_function: residual_block.loss_function().cloned(),
            slots,
            row_offset,
            num_residuals,
        });
        row_offset += num_residuals;
    }

    if let JacobianLayout::SchurReady {
        num_eliminate_blocks,
    } = layout
    {
        check_schur_row_order(&row_structure, num_eliminate_blocks)?;
    }

    let col_sizes: Vec<usize> = free_blocks.iter().map(|b| b.local_size).collect();
    let jacobian_template = BlockSparseMatrix::new(&col_sizes, &row_structure);
    let pool = WorkerPool::new(options.num_threads);
    debug!(
        "Evaluator: {} residual blocks, {} free parameter blocks, layout {:?}, {} threads",
        terms.len(),
        free_blocks.len(),
        layout,
        pool.num_threads()
    );

    Ok(Evaluator {
        free_blocks,
        terms,
        layout,
        jacobian_template,
        num_parameters: state_offset,
        num_effective_parameters: delta_offset,
        num_residuals: row_offset,
        pool,
        statistics: EvaluatorStatistics::default(),
    })
}

/// Rows touching an eliminated block must come first, grouped and in ascending order of
/// that block, and no row may touch two of them.
fn check_schur_row_order(
    row_structure: &[(usize, Vec<usize>)],
    num_eliminate_blocks: usize,
) -> CoreResult<()> {
    let mut previous: Option<usize> = None;
    let mut seen_f_only_row = false;
    for (row, (_, columns)) in row_structure.iter().enumerate() {
        let mut e_blocks = columns.iter().filter(|&&c| c < num_eliminate_blocks);
        let Some(&e) = e_blocks.next() else {
            seen_f_only_row = true;
            continue;
        };
        if e_blocks.next().is_some() {
            return Err(CoreError::InvalidInput(format!(
                "residual block {row} depends on more than one eliminated parameter block"
            ))
            .log());
        }
        if seen_f_only_row || previous.is_some_and(|p| p > e) {
            return Err(CoreError::InvalidInput(format!(
                "residual block {row} is out of order for Schur elimination"
            ))
            .log());
        }
        previous = Some(e);
    }
    Ok(())
}

impl Evaluator {
    pub fn layout(&self) -> JacobianLayout {
        self.layout
    }

    /// Ambient size of the state vector.
    pub fn num_parameters(&self) -> usize {
        self.num_parameters
    }

    /// Tangent size; the number of Jacobian columns.
    pub fn num_effective_parameters(&self) -> usize {
        self.num_effective_parameters
    }

    pub fn num_residuals(&self) -> usize {
        self.num_residuals
    }

    pub fn statistics(&self) -> EvaluatorStatistics {
        self.statistics
    }

    /// Tangent size of every free block, in state order.
    pub fn block_local_sizes(&self) -> Vec<usize> {
        self.free_blocks.iter().map(|b| b.local_size).collect()
    }

    pub fn parameter_block_ids(&self) -> Vec<ParameterBlockId> {
        self.free_blocks.iter().map(|b| b.id).collect()
    }

    pub fn num_parameter_blocks(&self) -> usize {
        self.free_blocks.len()
    }

    /// Ambient offset and size of free block `column` in the state vector.
    pub(crate) fn block_state_range(&self, column: usize) -> (usize, usize) {
        let block = &self.free_blocks[column];
        (block.state_offset, block.size)
    }

    /// Evaluator over the single free block `column`, with every other block frozen at its
    /// value in `x`. Only residual blocks that depend on `column` take part.
    pub(crate) fn restricted_to_block(&self, column: usize, x: &DVector<f64>) -> Evaluator {
        let source = &self.free_blocks[column];
        let free_blocks = vec![FreeBlock {
            state_offset: 0,
            delta_offset: 0,
            ..source.clone()
        }];

        let mut terms = Vec::new();
        let mut row_structure = Vec::new();
        let mut row_offset = 0;
        for term in &self.terms {
            if !term
                .slots
                .iter()
                .any(|slot| matches!(slot, ParameterSlot::Free(c) if *c == column))
            {
                continue;
            }
            let slots: Vec<ParameterSlot> = term
                .slots
                .iter()
                .map(|slot| match slot {
                    ParameterSlot::Free(c) if *c == column => ParameterSlot::Free(0),
                    ParameterSlot::Free(c) => {
                        let other = &self.free_blocks[*c];
                        ParameterSlot::Constant(x.rows(other.state_offset, other.size).into_owned())
                    }
                    ParameterSlot::Constant(values) => ParameterSlot::Constant(values.clone()),
                })
                .collect();
            row_structure.push((term.num_residuals, vec![0]));
            terms.push(ResidualTerm {
                id: term.id,
                cost_function: term.cost_function.clone(),
                loss_function: term.loss_function.clone(),
                slots,
                row_offset,
                num_residuals: term.num_residuals,
            });
            row_offset += term.num_residuals;
        }

        Evaluator {
            jacobian_template: BlockSparseMatrix::new(&[source.local_size], &row_structure),
            free_blocks,
            terms,
            layout: JacobianLayout::General,
            num_parameters: source.size,
            num_effective_parameters: source.local_size,
            num_residuals: row_offset,
            pool: WorkerPool::new(1),
            statistics: EvaluatorStatistics::default(),
        }
    }

    /// Evaluate cost, residuals and optionally the Jacobian and gradient at `x`.
    ///
    /// Returns `None` when any cost function fails or produces non-finite values.
    pub fn evaluate(&mut self, x: &DVector<f64>, want_jacobian: bool) -> Option<Evaluation> {
        if x.len() != self.num_parameters {
            return None;
        }
        let start = Instant::now();

        let terms = &self.terms;
        let free_blocks = &self.free_blocks;
        let results = self.pool.map_indices(terms.len(), |i| {
            evaluate_term(&terms[i], free_blocks, x, want_jacobian)
        });

        let mut cost = 0.0;
        let mut residuals = DVector::zeros(self.num_residuals);
        let mut jacobian = want_jacobian.then(|| self.jacobian_template.clone());
        for (row, (term, result)) in self.terms.iter().zip(results).enumerate() {
            let Some(result) = result else {
                debug!("Residual block {} failed to evaluate", term.id);
                return None;
            };
            cost += result.cost;
            residuals
                .rows_mut(term.row_offset, term.num_residuals)
                .copy_from(&result.residuals);
            if let Some(jacobian) = jacobian.as_mut() {
                let row = &mut jacobian.rows_mut()[row];
                for (column, values) in result.jacobians {
                    if let Some(cell) = row.cells.iter_mut().find(|c| c.block_id == column) {
                        cell.values = values;
                    }
                }
            }
        }
        if !cost.is_finite() {
            return None;
        }

        let gradient = jacobian.as_ref().map(|j| j.left_multiply(&residuals));
        let elapsed = start.elapsed();
        if want_jacobian {
            self.statistics.num_jacobian_evaluations += 1;
            self.statistics.jacobian_evaluation_time += elapsed;
        } else {
            self.statistics.num_residual_evaluations += 1;
            self.statistics.residual_evaluation_time += elapsed;
        }

        Some(Evaluation {
            cost,
            residuals,
            gradient,
            jacobian,
        })
    }

    /// Apply a tangent-space step: `x ⊞ delta`, block by block.
    pub fn plus(&self, x: &DVector<f64>, delta: &DVector<f64>) -> DVector<f64> {
        let mut out = x.clone();
        for block in &self.free_blocks {
            let x_block = &x.as_slice()[block.state_offset..block.state_offset + block.size];
            let delta_block =
                &delta.as_slice()[block.delta_offset..block.delta_offset + block.local_size];
            let updated = match &block.manifold {
                Some(manifold) => manifold.plus(x_block, delta_block),
                None => DVector::from_iterator(
                    block.size,
                    x_block.iter().zip(delta_block).map(|(x, d)| x + d),
                ),
            };
            out.rows_mut(block.state_offset, block.size)
                .copy_from(&updated);
        }
        out
    }
}

fn evaluate_term(
    term: &ResidualTerm,
    free_blocks: &[FreeBlock],
    x: &DVector<f64>,
    want_jacobian: bool,
) -> Option<TermEvaluation> {
    let parameters: Vec<DVector<f64>> = term
        .slots
        .iter()
        .map(|slot| match slot {
            ParameterSlot::Free(column) => {
                let block = &free_blocks[*column];
                x.rows(block.state_offset, block.size).into_owned()
            }
            ParameterSlot::Constant(values) => values.clone(),
        })
        .collect();

    let evaluation = evaluate_cost_function(
        term.cost_function.as_ref(),
        term.loss_function.as_deref(),
        &parameters,
        want_jacobian,
    )?;

    let mut jacobians = Vec::new();
    if let Some(ambient) = evaluation.jacobians {
        for ((slot, jacobian), values) in term.slots.iter().zip(ambient).zip(&parameters) {
            let ParameterSlot::Free(column) = slot else {
                continue;
            };
            let tangent = match &free_blocks[*column].manifold {
                Some(manifold) => jacobian * manifold.plus_jacobian(values.as_slice()),
                None => jacobian,
            };
            jacobians.push((*column, tangent));
        }
    }

    Some(TermEvaluation {
        cost: evaluation.cost,
        residuals: evaluation.residuals,
        jacobians,
    })
}
