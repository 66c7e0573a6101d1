//! The optimization problem: an arena of parameter blocks and the residual blocks that
//! connect them.
//!
//! Parameter blocks are stored in generation-checked slots, so a [`ParameterBlockId`]
//! that outlives its block is rejected rather than resolving to whatever block reused
//! the slot. Residual block handles are never reused.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use lsq_solver::core::cost_function::{CostFunction, CostFunctionOutput};
//! use lsq_solver::core::problem::Problem;
//! use nalgebra::{DMatrix, DVector};
//! # fn example() -> lsq_solver::core::CoreResult<()> {
//!
//! struct Offset([usize; 1]);
//! impl CostFunction for Offset {
//!     fn num_residuals(&self) -> usize { 1 }
//!     fn parameter_block_sizes(&self) -> &[usize] { &self.0 }
//!     fn evaluate(&self, p: &[DVector<f64>], jac: bool) -> Option<CostFunctionOutput> {
//!         let r = DVector::from_vec(vec![p[0][0] - 10.0]);
//!         Some((r, jac.then(|| vec![DMatrix::from_element(1, 1, 1.0)])))
//!     }
//! }
//!
//! let mut problem = Problem::new();
//! let x = problem.add_parameter_block(DVector::from_vec(vec![0.0]));
//! problem.add_residual_block(Arc::new(Offset([1])), None, &[x])?;
//! assert_eq!(problem.num_residual_blocks(), 1);
//! assert!((problem.evaluate_cost()? - 50.0).abs() < 1e-12);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use nalgebra::DVector;

use crate::core::{
    CoreError, CoreResult,
    cost_function::CostFunction,
    loss_functions::LossFunction,
    manifold::Manifold,
    parameter_block::{ParameterBlock, ParameterBlockId},
    residual_block::{ResidualBlock, ResidualBlockId, ResidualEvaluation},
};

struct Slot {
    generation: u32,
    block: Option<ParameterBlock>,
}

#[derive(Default)]
pub struct Problem {
    slots: Vec<Slot>,
    free_slots: Vec<usize>,
    residual_blocks: Vec<Option<ResidualBlock>>,
    num_parameter_blocks: usize,
    num_residual_blocks: usize,
}

impl Problem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter block holding `values`; the block owns the values until the
    /// solver writes optimized state back into it.
    pub fn add_parameter_block(&mut self, values: DVector<f64>) -> ParameterBlockId {
        let block = ParameterBlock::new(values);
        self.num_parameter_blocks += 1;
        if let Some(slot) = self.free_slots.pop() {
            let entry = &mut self.slots[slot];
            entry.block = Some(block);
            ParameterBlockId::new(slot, entry.generation)
        } else {
            self.slots.push(Slot {
                generation: 0,
                block: Some(block),
            });
            ParameterBlockId::new(self.slots.len() - 1, 0)
        }
    }

    pub fn add_parameter_block_with_manifold(
        &mut self,
        values: DVector<f64>,
        manifold: Arc<dyn Manifold>,
    ) -> CoreResult<ParameterBlockId> {
        let id = self.add_parameter_block(values);
        if let Err(e) = self.set_manifold(id, Some(manifold)) {
            self.remove_parameter_block(id)?;
            return Err(e);
        }
        Ok(id)
    }

    pub fn set_manifold(
        &mut self,
        id: ParameterBlockId,
        manifold: Option<Arc<dyn Manifold>>,
    ) -> CoreResult<()> {
        let block = self.parameter_block_mut(id)?;
        if let Some(m) = manifold.as_ref()
            && m.ambient_size() != block.size()
        {
            return Err(CoreError::DimensionMismatch(format!(
                "manifold ambient size {} does not match parameter block {} of size {}",
                m.ambient_size(),
                id,
                block.size()
            ))
            .log());
        }
        block.set_manifold(manifold);
        Ok(())
    }

    pub fn set_parameter_block_constant(&mut self, id: ParameterBlockId) -> CoreResult<()> {
        self.parameter_block_mut(id)?.set_constant(true);
        Ok(())
    }

    pub fn set_parameter_block_variable(&mut self, id: ParameterBlockId) -> CoreResult<()> {
        self.parameter_block_mut(id)?.set_constant(false);
        Ok(())
    }

    pub fn is_parameter_block_constant(&self, id: ParameterBlockId) -> CoreResult<bool> {
        Ok(self.parameter_block(id)?.is_constant())
    }

    /// Add a residual block evaluating `cost_function` on `parameter_blocks`.
    ///
    /// The blocks must be live, distinct and sized as the cost function declares.
    pub fn add_residual_block(
        &mut self,
        cost_function: Arc<dyn CostFunction>,
        loss_function: Option<Arc<dyn LossFunction>>,
        parameter_blocks: &[ParameterBlockId],
    ) -> CoreResult<ResidualBlockId> {
        let sizes = cost_function.parameter_block_sizes();
        if sizes.len() != parameter_blocks.len() {
            return Err(CoreError::ResidualBlock(format!(
                "cost function expects {} parameter blocks, {} given",
                sizes.len(),
                parameter_blocks.len()
            ))
            .log());
        }

        let mut seen = HashSet::with_capacity(parameter_blocks.len());
        for (&id, &size) in parameter_blocks.iter().zip(sizes) {
            if !seen.insert(id) {
                return Err(CoreError::ResidualBlock(format!(
                    "parameter block {id} appears more than once in a residual block"
                ))
                .log());
            }
            let block = self.parameter_block(id)?;
            if block.size() != size {
                return Err(CoreError::DimensionMismatch(format!(
                    "parameter block {} has size {} but the cost function expects {}",
                    id,
                    block.size(),
                    size
                ))
                .log());
            }
        }

        let id = ResidualBlockId(self.residual_blocks.len());
        self.residual_blocks.push(Some(ResidualBlock::new(
            parameter_blocks.to_vec(),
            cost_function,
            loss_function,
        )));
        self.num_residual_blocks += 1;
        Ok(id)
    }

    pub fn remove_residual_block(&mut self, id: ResidualBlockId) -> CoreResult<()> {
        match self.residual_blocks.get_mut(id.0) {
            Some(entry @ Some(_)) => {
                *entry = None;
                self.num_residual_blocks -= 1;
                Ok(())
            }
            _ => Err(CoreError::ResidualBlock(format!("unknown residual block {id}")).log()),
        }
    }

    /// Remove a parameter block together with every residual block that depends on it.
    /// Outstanding handles to the block become invalid.
    pub fn remove_parameter_block(&mut self, id: ParameterBlockId) -> CoreResult<()> {
        self.parameter_block(id)?;

        let dependent: Vec<ResidualBlockId> = self
            .residual_block_ids()
            .filter(|&r| {
                self.residual_blocks[r.0]
                    .as_ref()
                    .is_some_and(|rb| rb.parameter_blocks().contains(&id))
            })
            .collect();
        for r in dependent {
            self.remove_residual_block(r)?;
        }

        let slot = &mut self.slots[id.slot()];
        slot.block = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_slots.push(id.slot());
        self.num_parameter_blocks -= 1;
        Ok(())
    }

    pub fn parameter_block(&self, id: ParameterBlockId) -> CoreResult<&ParameterBlock> {
        self.slots
            .get(id.slot())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.block.as_ref())
            .ok_or_else(|| {
                CoreError::ParameterBlock(format!("stale or unknown parameter block {id}"))
            })
    }

    pub(crate) fn parameter_block_mut(
        &mut self,
        id: ParameterBlockId,
    ) -> CoreResult<&mut ParameterBlock> {
        self.slots
            .get_mut(id.slot())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.block.as_mut())
            .ok_or_else(|| {
                CoreError::ParameterBlock(format!("stale or unknown parameter block {id}"))
            })
    }

    pub fn contains_parameter_block(&self, id: ParameterBlockId) -> bool {
        self.parameter_block(id).is_ok()
    }

    pub fn residual_block(&self, id: ResidualBlockId) -> CoreResult<&ResidualBlock> {
        self.residual_blocks
            .get(id.0)
            .and_then(|r| r.as_ref())
            .ok_or_else(|| CoreError::ResidualBlock(format!("unknown residual block {id}")))
    }

    pub fn parameter_values(&self, id: ParameterBlockId) -> CoreResult<&DVector<f64>> {
        Ok(self.parameter_block(id)?.values())
    }

    pub fn set_parameter_values(
        &mut self,
        id: ParameterBlockId,
        values: &[f64],
    ) -> CoreResult<()> {
        let block = self.parameter_block_mut(id)?;
        if block.size() != values.len() {
            return Err(CoreError::DimensionMismatch(format!(
                "parameter block {} has size {}, {} values given",
                id,
                block.size(),
                values.len()
            ))
            .log());
        }
        block.values_mut().copy_from_slice(values);
        Ok(())
    }

    pub fn num_parameter_blocks(&self) -> usize {
        self.num_parameter_blocks
    }

    /// Total ambient size of all parameter blocks.
    pub fn num_parameters(&self) -> usize {
        self.parameter_blocks().map(|(_, b)| b.size()).sum()
    }

    pub fn num_residual_blocks(&self) -> usize {
        self.num_residual_blocks
    }

    pub fn num_residuals(&self) -> usize {
        self.residual_blocks
            .iter()
            .flatten()
            .map(ResidualBlock::num_residuals)
            .sum()
    }

    /// Live parameter block handles in slot order.
    pub fn parameter_block_ids(&self) -> impl Iterator<Item = ParameterBlockId> + '_ {
        self.parameter_blocks().map(|(id, _)| id)
    }

    pub fn parameter_blocks(&self) -> impl Iterator<Item = (ParameterBlockId, &ParameterBlock)> {
        self.slots.iter().enumerate().filter_map(|(slot, entry)| {
            entry
                .block
                .as_ref()
                .map(|b| (ParameterBlockId::new(slot, entry.generation), b))
        })
    }

    /// Live residual block handles in insertion order.
    pub fn residual_block_ids(&self) -> impl Iterator<Item = ResidualBlockId> + '_ {
        self.residual_blocks
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_some())
            .map(|(i, _)| ResidualBlockId(i))
    }

    /// Evaluate a residual block at the current user values.
    pub fn evaluate_residual_block(
        &self,
        id: ResidualBlockId,
        apply_loss: bool,
        compute_jacobians: bool,
    ) -> CoreResult<ResidualEvaluation> {
        let residual_block = self.residual_block(id)?;
        let parameters = residual_block
            .parameter_blocks()
            .iter()
            .map(|&p| self.parameter_values(p).cloned())
            .collect::<CoreResult<Vec<_>>>()?;
        residual_block
            .evaluate(&parameters, apply_loss, compute_jacobians)
            .ok_or_else(|| {
                CoreError::Evaluation(format!("cost function of residual block {id} failed"))
            })
    }

    /// Total cost `Σ ½ρ(||r_i||²)` at the current user values.
    pub fn evaluate_cost(&self) -> CoreResult<f64> {
        let mut cost = 0.0;
        for id in self.residual_block_ids() {
            cost += self.evaluate_residual_block(id, true, false)?.cost;
        }
        Ok(cost)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::cost_function::CostFunctionOutput;
    use crate::core::manifold::{QuaternionManifold, SubsetManifold};
    use nalgebra::DMatrix;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// r_k = Σ_blocks x_block[k mod size] − target, one residual.
    pub(crate) struct SumCost {
        pub(crate) sizes: Vec<usize>,
        pub(crate) target: f64,
    }

    impl CostFunction for SumCost {
        fn num_residuals(&self) -> usize {
            1
        }

        fn parameter_block_sizes(&self) -> &[usize] {
            &self.sizes
        }

        fn evaluate(
            &self,
            parameters: &[DVector<f64>],
            compute_jacobians: bool,
        ) -> Option<CostFunctionOutput> {
            let total: f64 = parameters.iter().map(|p| p.sum()).sum();
            let residual = DVector::from_vec(vec![total - self.target]);
            let jacobians = compute_jacobians.then(|| {
                self.sizes
                    .iter()
                    .map(|&s| DMatrix::from_element(1, s, 1.0))
                    .collect()
            });
            Some((residual, jacobians))
        }
    }

    pub(crate) fn sum_cost(sizes: &[usize], target: f64) -> Arc<dyn CostFunction> {
        Arc::new(SumCost {
            sizes: sizes.to_vec(),
            target,
        })
    }

    #[test]
    fn test_add_blocks_and_count() -> TestResult {
        let mut problem = Problem::new();
        let a = problem.add_parameter_block(DVector::from_vec(vec![1.0, 2.0, 3.0]));
        let b = problem.add_parameter_block(DVector::from_vec(vec![4.0, 5.0]));
        problem.add_residual_block(sum_cost(&[3, 2], 0.0), None, &[a, b])?;

        assert_eq!(problem.num_parameter_blocks(), 2);
        assert_eq!(problem.num_parameters(), 5);
        assert_eq!(problem.num_residual_blocks(), 1);
        assert_eq!(problem.num_residuals(), 1);
        // r = 15
        assert!((problem.evaluate_cost()? - 112.5).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_residual_block_validation() {
        let mut problem = Problem::new();
        let a = problem.add_parameter_block(DVector::zeros(3));
        let b = problem.add_parameter_block(DVector::zeros(2));

        assert!(
            problem
                .add_residual_block(sum_cost(&[3, 3], 0.0), None, &[a, b])
                .is_err()
        );
        assert!(
            problem
                .add_residual_block(sum_cost(&[3], 0.0), None, &[a, b])
                .is_err()
        );
        assert!(
            problem
                .add_residual_block(sum_cost(&[3, 3], 0.0), None, &[a, a])
                .is_err()
        );
    }

    #[test]
    fn test_removed_block_invalidates_handle_and_residuals() -> TestResult {
        let mut problem = Problem::new();
        let a = problem.add_parameter_block(DVector::zeros(1));
        let b = problem.add_parameter_block(DVector::zeros(1));
        problem.add_residual_block(sum_cost(&[1, 1], 1.0), None, &[a, b])?;
        problem.add_residual_block(sum_cost(&[1], 1.0), None, &[b])?;

        problem.remove_parameter_block(a)?;
        assert_eq!(problem.num_parameter_blocks(), 1);
        assert_eq!(problem.num_residual_blocks(), 1);
        assert!(problem.parameter_block(a).is_err());

        // The freed slot is reused under a new generation.
        let c = problem.add_parameter_block(DVector::zeros(1));
        assert_eq!(c.slot(), a.slot());
        assert_ne!(c, a);
        assert!(problem.set_parameter_block_constant(a).is_err());
        assert!(problem.set_parameter_block_constant(c).is_ok());
        Ok(())
    }

    #[test]
    fn test_manifold_size_is_checked() -> TestResult {
        let mut problem = Problem::new();
        let q = problem.add_parameter_block_with_manifold(
            DVector::from_vec(vec![1.0, 0.0, 0.0, 0.0]),
            Arc::new(QuaternionManifold),
        )?;
        assert_eq!(problem.parameter_block(q)?.local_size(), 3);

        let bad = problem.add_parameter_block_with_manifold(
            DVector::zeros(2),
            Arc::new(SubsetManifold::new(3, &[0])?),
        );
        assert!(bad.is_err());
        assert_eq!(problem.num_parameter_blocks(), 1);
        Ok(())
    }

    #[test]
    fn test_set_parameter_values() -> TestResult {
        let mut problem = Problem::new();
        let a = problem.add_parameter_block(DVector::zeros(2));
        problem.set_parameter_values(a, &[1.0, 2.0])?;
        assert_eq!(problem.parameter_values(a)?.as_slice(), &[1.0, 2.0]);
        assert!(problem.set_parameter_values(a, &[1.0]).is_err());
        Ok(())
    }
}
