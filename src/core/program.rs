//! Programs: ordered views over a [`Problem`].
//!
//! The solver never mutates the problem's structure. It clones the program built from the
//! problem, reduces and reorders the clone, and assigns per-block bookkeeping (index,
//! state offset, delta offset) from whichever program is currently active.

use nalgebra::DVector;

use crate::core::{
    CoreError, CoreResult, parameter_block::ParameterBlockId, problem::Problem,
    residual_block::ResidualBlockId,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Program {
    parameter_blocks: Vec<ParameterBlockId>,
    residual_blocks: Vec<ResidualBlockId>,
}

impl Program {
    /// All live blocks of `problem`, parameter blocks in slot order and residual blocks in
    /// insertion order.
    pub fn from_problem(problem: &Problem) -> Self {
        Self {
            parameter_blocks: problem.parameter_block_ids().collect(),
            residual_blocks: problem.residual_block_ids().collect(),
        }
    }

    pub fn new(
        parameter_blocks: Vec<ParameterBlockId>,
        residual_blocks: Vec<ResidualBlockId>,
    ) -> Self {
        Self {
            parameter_blocks,
            residual_blocks,
        }
    }

    pub fn parameter_blocks(&self) -> &[ParameterBlockId] {
        &self.parameter_blocks
    }

    pub(crate) fn parameter_blocks_mut(&mut self) -> &mut Vec<ParameterBlockId> {
        &mut self.parameter_blocks
    }

    pub fn residual_blocks(&self) -> &[ResidualBlockId] {
        &self.residual_blocks
    }

    pub(crate) fn residual_blocks_mut(&mut self) -> &mut Vec<ResidualBlockId> {
        &mut self.residual_blocks
    }

    pub fn num_parameter_blocks(&self) -> usize {
        self.parameter_blocks.len()
    }

    pub fn num_residual_blocks(&self) -> usize {
        self.residual_blocks.len()
    }

    /// Total ambient size of the program's parameter blocks.
    pub fn num_parameters(&self, problem: &Problem) -> CoreResult<usize> {
        self.parameter_blocks.iter().try_fold(0, |acc, &id| {
            Ok(acc + problem.parameter_block(id)?.size())
        })
    }

    /// Total tangent size of the program's parameter blocks.
    pub fn num_effective_parameters(&self, problem: &Problem) -> CoreResult<usize> {
        self.parameter_blocks.iter().try_fold(0, |acc, &id| {
            Ok(acc + problem.parameter_block(id)?.local_size())
        })
    }

    pub fn num_residuals(&self, problem: &Problem) -> CoreResult<usize> {
        self.residual_blocks.iter().try_fold(0, |acc, &id| {
            Ok(acc + problem.residual_block(id)?.num_residuals())
        })
    }

    /// Assign index, state offset and delta offset to every parameter block, in program
    /// order.
    pub fn set_parameter_offsets_and_index(&self, problem: &mut Problem) -> CoreResult<()> {
        let mut state_offset = 0;
        let mut delta_offset = 0;
        for (index, &id) in self.parameter_blocks.iter().enumerate() {
            let block = problem.parameter_block_mut(id)?;
            block.index = Some(index);
            block.state_offset = state_offset;
            block.delta_offset = delta_offset;
            state_offset += block.size();
            delta_offset += block.local_size();
        }
        Ok(())
    }

    /// Whether the bookkeeping stored on the blocks agrees with this program's order.
    pub fn is_valid(&self, problem: &Problem) -> bool {
        let mut state_offset = 0;
        let mut delta_offset = 0;
        for (index, &id) in self.parameter_blocks.iter().enumerate() {
            let Ok(block) = problem.parameter_block(id) else {
                return false;
            };
            if block.index != Some(index)
                || block.state_offset != state_offset
                || block.delta_offset != delta_offset
            {
                return false;
            }
            state_offset += block.size();
            delta_offset += block.local_size();
        }
        true
    }

    /// Concatenate the user values of every parameter block.
    pub fn parameter_blocks_to_state_vector(&self, problem: &Problem) -> CoreResult<DVector<f64>> {
        let mut state = Vec::with_capacity(self.num_parameters(problem)?);
        for &id in &self.parameter_blocks {
            state.extend_from_slice(problem.parameter_values(id)?.as_slice());
        }
        Ok(DVector::from_vec(state))
    }

    /// Write `state` back into the user values of every parameter block.
    pub fn state_vector_to_parameter_blocks(
        &self,
        state: &DVector<f64>,
        problem: &mut Problem,
    ) -> CoreResult<()> {
        let expected = self.num_parameters(problem)?;
        if state.len() != expected {
            return Err(CoreError::DimensionMismatch(format!(
                "state vector has {} entries, program has {} parameters",
                state.len(),
                expected
            ))
            .log());
        }
        let mut offset = 0;
        for &id in &self.parameter_blocks {
            let size = problem.parameter_block(id)?.size();
            problem.set_parameter_values(id, &state.as_slice()[offset..offset + size])?;
            offset += size;
        }
        Ok(())
    }
}
