//! Coordinate descent over groups of parameter blocks.
//!
//! Groups are visited in ascending order. Within a group no two blocks share a residual
//! block, so every block of the group is optimized independently (and in parallel) with
//! all other blocks held at their current values. Each single-block problem is solved with
//! a few Levenberg-Marquardt iterations on a dense QR factorization.

use std::collections::HashMap;

use nalgebra::DVector;
use tracing::debug;

use crate::callbacks::CallbackPipeline;
use crate::core::ordering::ParameterBlockOrdering;
use crate::evaluator::Evaluator;
use crate::linalg::DenseQrSolver;
use crate::optimizer::{
    LevenbergMarquardtStrategy, Minimizer, MinimizerOptions, OptimizerError, OptimizerResult,
    TrustRegionMinimizer,
};
use crate::parallel::WorkerPool;

pub struct CoordinateDescentMinimizer {
    /// Evaluator column indices per group.
    groups: Vec<Vec<usize>>,
    options: MinimizerOptions,
    pool: WorkerPool,
}

impl CoordinateDescentMinimizer {
    /// Map `ordering` onto the free blocks of `evaluator`.
    ///
    /// Blocks of the ordering that the evaluator does not optimize are skipped; empty
    /// groups are dropped.
    ///
    /// # Errors
    /// Returns `OptimizerError::InnerIterationOrdering` when nothing is left to optimize.
    pub fn new(
        ordering: &ParameterBlockOrdering,
        evaluator: &Evaluator,
        num_threads: usize,
    ) -> OptimizerResult<Self> {
        let column_of: HashMap<_, _> = evaluator
            .parameter_block_ids()
            .into_iter()
            .enumerate()
            .map(|(column, id)| (id, column))
            .collect();

        let groups: Vec<Vec<usize>> = ordering
            .groups()
            .map(|(_, members)| {
                members
                    .iter()
                    .filter_map(|id| column_of.get(id).copied())
                    .collect::<Vec<_>>()
            })
            .filter(|group| !group.is_empty())
            .collect();
        if groups.is_empty() {
            return Err(OptimizerError::InnerIterationOrdering(
                "no parameter block of the ordering is being optimized".to_string(),
            )
            .log());
        }
        debug!(
            "Inner iterations over {} groups with sizes {:?}",
            groups.len(),
            groups.iter().map(Vec::len).collect::<Vec<_>>()
        );

        let options = MinimizerOptions {
            max_num_iterations: 5,
            jacobi_scaling: false,
            ..Default::default()
        };
        Ok(Self {
            groups,
            options,
            pool: WorkerPool::new(num_threads),
        })
    }

    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    /// One sweep over all groups, updating `x` in place. Returns the number of blocks
    /// whose values changed.
    pub fn minimize(&self, evaluator: &Evaluator, x: &mut DVector<f64>) -> usize {
        let mut num_updated = 0;
        for group in &self.groups {
            let current: &DVector<f64> = x;
            let updates = self.pool.map_indices(group.len(), |i| {
                solve_single_block(evaluator, group[i], current, &self.options)
            });
            for (&column, update) in group.iter().zip(updates) {
                if let Some(values) = update {
                    let (offset, size) = evaluator.block_state_range(column);
                    x.rows_mut(offset, size).copy_from(&values);
                    num_updated += 1;
                }
            }
        }
        num_updated
    }
}

fn solve_single_block(
    evaluator: &Evaluator,
    column: usize,
    x: &DVector<f64>,
    options: &MinimizerOptions,
) -> Option<DVector<f64>> {
    let sub_evaluator = evaluator.restricted_to_block(column, x);
    if sub_evaluator.num_residuals() == 0 {
        return None;
    }
    let (offset, size) = evaluator.block_state_range(column);
    let x0 = x.rows(offset, size).into_owned();

    let strategy = Box::new(LevenbergMarquardtStrategy::new(
        Box::new(DenseQrSolver::new()),
        options,
    ));
    let mut minimizer = TrustRegionMinimizer::new(sub_evaluator, strategy, None);
    let summary = minimizer.minimize(options, &x0, &mut CallbackPipeline::default());
    (summary.termination_type.writes_back() && summary.num_successful_steps > 0).then_some(summary.x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::problem::{Problem, tests::sum_cost};
    use crate::core::program::Program;
    use crate::evaluator::{EvaluatorOptions, create_evaluator};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// Chain a − b − c with anchors on a and c.
    fn chain() -> Result<(Problem, Program, Vec<crate::core::parameter_block::ParameterBlockId>), Box<dyn std::error::Error>> {
        let mut problem = Problem::new();
        let ids: Vec<_> = [0.0, 0.0, 0.0]
            .iter()
            .map(|&v| problem.add_parameter_block(DVector::from_vec(vec![v])))
            .collect();
        problem.add_residual_block(sum_cost(&[1], 1.0), None, &[ids[0]])?;
        problem.add_residual_block(sum_cost(&[1, 1], 3.0), None, &[ids[0], ids[1]])?;
        problem.add_residual_block(sum_cost(&[1, 1], 5.0), None, &[ids[1], ids[2]])?;
        problem.add_residual_block(sum_cost(&[1], 3.0), None, &[ids[2]])?;
        let program = Program::from_problem(&problem);
        Ok((problem, program, ids))
    }

    #[test]
    fn test_sweep_reduces_cost() -> TestResult {
        let (problem, program, ids) = chain()?;
        let mut evaluator = create_evaluator(&EvaluatorOptions::default(), &problem, &program)?;

        // {a, c} are independent, b depends on both.
        let mut ordering = ParameterBlockOrdering::new();
        ordering.add_element_to_group(ids[0], 0);
        ordering.add_element_to_group(ids[2], 0);
        ordering.add_element_to_group(ids[1], 1);
        let inner = CoordinateDescentMinimizer::new(&ordering, &evaluator, 2)?;
        assert_eq!(inner.num_groups(), 2);

        let mut x = program.parameter_blocks_to_state_vector(&problem)?;
        let before = evaluator.evaluate(&x, false).ok_or("evaluation failed")?.cost;
        let updated = inner.minimize(&evaluator, &mut x);
        let after = evaluator.evaluate(&x, false).ok_or("evaluation failed")?.cost;
        assert_eq!(updated, 3);
        assert!(after < before);

        // Repeated sweeps converge to the consistent solution (1, 2, 3).
        for _ in 0..100 {
            inner.minimize(&evaluator, &mut x);
        }
        assert!((x - DVector::from_vec(vec![1.0, 2.0, 3.0])).norm() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_ordering_without_free_blocks_is_rejected() -> TestResult {
        let (mut problem, _, ids) = chain()?;
        let other = problem.add_parameter_block(DVector::zeros(1));
        let program = Program::from_problem(&problem);
        let mut reduced = program.clone();
        reduced.parameter_blocks_mut().retain(|&id| id != other);
        let evaluator = create_evaluator(&EvaluatorOptions::default(), &problem, &reduced)?;

        let mut ordering = ParameterBlockOrdering::new();
        ordering.add_element_to_group(other, 0);
        assert!(CoordinateDescentMinimizer::new(&ordering, &evaluator, 1).is_err());

        ordering.add_element_to_group(ids[1], 3);
        assert_eq!(CoordinateDescentMinimizer::new(&ordering, &evaluator, 1)?.num_groups(), 1);
        Ok(())
    }
}
