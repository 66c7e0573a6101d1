//! Residual blocks: a cost function, an optional robust loss and the parameter blocks
//! they read.
//!
//! Evaluating a block produces its cost `½ρ(||r||²)` (or `½||r||²` without a loss) and,
//! when requested, residuals and per-block Jacobians already passed through the
//! [`Corrector`] so that downstream linear algebra can treat every block as plain least
//! squares.

use std::fmt;
use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use crate::core::{
    corrector::Corrector, cost_function::CostFunction, loss_functions::LossFunction,
    parameter_block::ParameterBlockId,
};

/// Handle to a residual block inside a [`Problem`](crate::core::problem::Problem).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResidualBlockId(pub(crate) usize);

impl ResidualBlockId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for ResidualBlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Output of [`ResidualBlock::evaluate`].
#[derive(Debug, Clone)]
pub struct ResidualEvaluation {
    pub cost: f64,
    pub residuals: DVector<f64>,
    /// One matrix per parameter block in ambient coordinates, when requested.
    pub jacobians: Option<Vec<DMatrix<f64>>>,
}

#[derive(Clone)]
pub struct ResidualBlock {
    parameter_blocks: Vec<ParameterBlockId>,
    cost_function: Arc<dyn CostFunction>,
    loss_function: Option<Arc<dyn LossFunction>>,
}

impl ResidualBlock {
    pub(crate) fn new(
        parameter_blocks: Vec<ParameterBlockId>,
        cost_function: Arc<dyn CostFunction>,
        loss_function: Option<Arc<dyn LossFunction>>,
    ) -> Self {
        Self {
            parameter_blocks,
            cost_function,
            loss_function,
        }
    }

    pub fn parameter_blocks(&self) -> &[ParameterBlockId] {
        &self.parameter_blocks
    }

    pub fn num_residuals(&self) -> usize {
        self.cost_function.num_residuals()
    }

    pub fn cost_function(&self) -> &Arc<dyn CostFunction> {
        &self.cost_function
    }

    pub fn loss_function(&self) -> Option<&Arc<dyn LossFunction>> {
        self.loss_function.as_ref()
    }

    /// Evaluate the block at `parameters` (one vector per parameter block, in order).
    ///
    /// Returns `None` when the cost function fails, returns wrongly shaped output or
    /// produces non-finite values.
    pub fn evaluate(
        &self,
        parameters: &[DVector<f64>],
        apply_loss: bool,
        compute_jacobians: bool,
    ) -> Option<ResidualEvaluation> {
        evaluate_cost_function(
            self.cost_function.as_ref(),
            if apply_loss {
                self.loss_function.as_deref()
            } else {
                None
            },
            parameters,
            compute_jacobians,
        )
    }
}

/// Evaluate a cost function and apply the robust loss correction.
pub(crate) fn evaluate_cost_function(
    cost_function: &dyn CostFunction,
    loss_function: Option<&dyn LossFunction>,
    parameters: &[DVector<f64>],
    compute_jacobians: bool,
) -> Option<ResidualEvaluation> {
    let (mut residuals, jacobians) = cost_function.evaluate(parameters, compute_jacobians)?;

    let num_residuals = cost_function.num_residuals();
    if residuals.len() != num_residuals || residuals.iter().any(|v| !v.is_finite()) {
        return None;
    }

    let mut jacobians = if compute_jacobians {
        let jacobians = jacobians?;
        let sizes = cost_function.parameter_block_sizes();
        if jacobians.len() != sizes.len() {
            return None;
        }
        for (jacobian, &size) in jacobians.iter().zip(sizes) {
            if jacobian.shape() != (num_residuals, size) || jacobian.iter().any(|v| !v.is_finite())
            {
                return None;
            }
        }
        Some(jacobians)
    } else {
        None
    };

    let sq_norm = residuals.norm_squared();
    let cost = match loss_function {
        Some(loss) => {
            let rho = loss.evaluate(sq_norm);
            if let Some(jacobians) = jacobians.as_mut() {
                let corrector = Corrector::new(loss, sq_norm);
                for jacobian in jacobians.iter_mut() {
                    corrector.correct_jacobian(&residuals, jacobian);
                }
                corrector.correct_residuals(&mut residuals);
            }
            0.5 * rho[0]
        }
        None => 0.5 * sq_norm,
    };

    Some(ResidualEvaluation {
        cost,
        residuals,
        jacobians,
    })
}
