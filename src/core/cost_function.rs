//! Cost functions and the gradient-checking decorator.
//!
//! A cost function maps the values of the parameter blocks it depends on to a residual
//! vector and, on request, one Jacobian per parameter block (in ambient coordinates).
//! Returning `None` signals a failed evaluation, which the solver treats as an invalid
//! step during minimization and as a hard error while reducing the problem.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use nalgebra::{DMatrix, DVector};
use tracing::warn;

/// Residuals and optional per-block Jacobians produced by a cost function.
pub type CostFunctionOutput = (DVector<f64>, Option<Vec<DMatrix<f64>>>);

/// Trait for user supplied residual functions.
///
/// Implementations must be thread safe: the evaluator calls them from a worker pool when
/// the `parallel` feature is enabled.
///
/// # Example
///
/// ```
/// use lsq_solver::core::cost_function::{CostFunction, CostFunctionOutput};
/// use nalgebra::{DMatrix, DVector};
///
/// /// r = x - target
/// struct Prior {
///     target: DVector<f64>,
///     sizes: [usize; 1],
/// }
///
/// impl CostFunction for Prior {
///     fn num_residuals(&self) -> usize {
///         self.target.len()
///     }
///     fn parameter_block_sizes(&self) -> &[usize] {
///         &self.sizes
///     }
///     fn evaluate(&self, parameters: &[DVector<f64>], jacobians: bool) -> Option<CostFunctionOutput> {
///         let residual = &parameters[0] - &self.target;
///         let n = self.target.len();
///         Some((residual, jacobians.then(|| vec![DMatrix::identity(n, n)])))
///     }
/// }
/// ```
pub trait CostFunction: Send + Sync {
    /// Number of residuals produced.
    fn num_residuals(&self) -> usize;

    /// Ambient sizes of the parameter blocks this function depends on, in order.
    fn parameter_block_sizes(&self) -> &[usize];

    /// Evaluate residuals and, when `compute_jacobians` is set, Jacobians of shape
    /// `num_residuals × parameter_block_sizes()[i]`.
    fn evaluate(
        &self,
        parameters: &[DVector<f64>],
        compute_jacobians: bool,
    ) -> Option<CostFunctionOutput>;
}

/// Central-difference Jacobians of `cost_function` at `parameters`.
///
/// Each coordinate is perturbed by `relative_step_size · max(|x_i|, 1)`.
pub fn numeric_jacobians(
    cost_function: &dyn CostFunction,
    parameters: &[DVector<f64>],
    relative_step_size: f64,
) -> Option<Vec<DMatrix<f64>>> {
    let num_residuals = cost_function.num_residuals();
    let mut perturbed: Vec<DVector<f64>> = parameters.to_vec();
    let mut jacobians = Vec::with_capacity(parameters.len());

    for (block, values) in parameters.iter().enumerate() {
        let mut jacobian = DMatrix::zeros(num_residuals, values.len());
        for j in 0..values.len() {
            let h = relative_step_size * values[j].abs().max(1.0);

            perturbed[block][j] = values[j] + h;
            let (forward, _) = cost_function.evaluate(&perturbed, false)?;
            perturbed[block][j] = values[j] - h;
            let (backward, _) = cost_function.evaluate(&perturbed, false)?;
            perturbed[block][j] = values[j];

            let column = (forward - backward) / (2.0 * h);
            jacobian.set_column(j, &column);
        }
        jacobians.push(jacobian);
    }
    Some(jacobians)
}

/// Wraps a cost function and compares its analytic Jacobians against numeric ones.
///
/// Mismatches are logged and counted; evaluation always proceeds with the analytic
/// result of the wrapped function.
pub struct GradientCheckingCostFunction {
    inner: Arc<dyn CostFunction>,
    label: String,
    relative_step_size: f64,
    relative_precision: f64,
    mismatches: Arc<AtomicUsize>,
}

impl GradientCheckingCostFunction {
    pub fn new(
        inner: Arc<dyn CostFunction>,
        label: impl Into<String>,
        relative_step_size: f64,
        relative_precision: f64,
        mismatches: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            inner,
            label: label.into(),
            relative_step_size,
            relative_precision,
            mismatches,
        }
    }

    fn check(&self, parameters: &[DVector<f64>], analytic: &[DMatrix<f64>]) {
        let Some(numeric) =
            numeric_jacobians(self.inner.as_ref(), parameters, self.relative_step_size)
        else {
            warn!(
                "Gradient check for {} skipped: numeric differentiation failed",
                self.label
            );
            return;
        };

        for (block, (a, n)) in analytic.iter().zip(numeric.iter()).enumerate() {
            let mut worst = 0.0_f64;
            let mut worst_at = (0, 0);
            for i in 0..a.nrows() {
                for j in 0..a.ncols() {
                    let scale = a[(i, j)].abs().max(n[(i, j)].abs()).max(1.0);
                    let error = (a[(i, j)] - n[(i, j)]).abs() / scale;
                    if error > worst {
                        worst = error;
                        worst_at = (i, j);
                    }
                }
            }
            if worst > self.relative_precision {
                self.mismatches.fetch_add(1, Ordering::Relaxed);
                let (i, j) = worst_at;
                warn!(
                    "Gradient check failed for {} block {}: J[{},{}] analytic {:.6e} numeric {:.6e} (relative error {:.2e})",
                    self.label,
                    block,
                    i,
                    j,
                    a[(i, j)],
                    n[(i, j)],
                    worst
                );
            }
        }
    }
}

impl CostFunction for GradientCheckingCostFunction {
    fn num_residuals(&self) -> usize {
        self.inner.num_residuals()
    }

    fn parameter_block_sizes(&self) -> &[usize] {
        self.inner.parameter_block_sizes()
    }

    fn evaluate(
        &self,
        parameters: &[DVector<f64>],
        compute_jacobians: bool,
    ) -> Option<CostFunctionOutput> {
        let output = self.inner.evaluate(parameters, compute_jacobians)?;
        if let Some(jacobians) = output.1.as_ref() {
            self.check(parameters, jacobians);
        }
        Some(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// r = [x0 * x1, x0 - 2]
    struct Product {
        sizes: [usize; 1],
        broken_jacobian: bool,
    }

    impl CostFunction for Product {
        fn num_residuals(&self) -> usize {
            2
        }

        fn parameter_block_sizes(&self) -> &[usize] {
            &self.sizes
        }

        fn evaluate(
            &self,
            parameters: &[DVector<f64>],
            compute_jacobians: bool,
        ) -> Option<CostFunctionOutput> {
            let x = &parameters[0];
            let residual = DVector::from_vec(vec![x[0] * x[1], x[0] - 2.0]);
            let jacobian = compute_jacobians.then(|| {
                let d = if self.broken_jacobian { 5.0 } else { x[0] };
                vec![DMatrix::from_row_slice(2, 2, &[x[1], d, 1.0, 0.0])]
            });
            Some((residual, jacobian))
        }
    }

    #[test]
    fn test_numeric_jacobian_matches_analytic() {
        let f = Product {
            sizes: [2],
            broken_jacobian: false,
        };
        let params = vec![DVector::from_vec(vec![3.0, -1.5])];
        let numeric = numeric_jacobians(&f, &params, 1e-6);
        assert!(numeric.is_some());
        if let (Some(numeric), Some((_, Some(analytic)))) = (numeric, f.evaluate(&params, true)) {
            assert!((&numeric[0] - &analytic[0]).abs().max() < 1e-6);
        }
    }

    #[test]
    fn test_gradient_checker_counts_mismatch_and_continues() {
        let counter = Arc::new(AtomicUsize::new(0));
        let checked = GradientCheckingCostFunction::new(
            Arc::new(Product {
                sizes: [2],
                broken_jacobian: true,
            }),
            "residual 0",
            1e-6,
            1e-4,
            Arc::clone(&counter),
        );
        let params = vec![DVector::from_vec(vec![1.0, 1.0])];
        let output = checked.evaluate(&params, true);
        assert!(output.is_some());
        assert_eq!(counter.load(Ordering::Relaxed), 1);

        // Residual-only evaluations are not checked.
        let _ = checked.evaluate(&params, false);
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_gradient_checker_accepts_correct_jacobian() {
        let counter = Arc::new(AtomicUsize::new(0));
        let checked = GradientCheckingCostFunction::new(
            Arc::new(Product {
                sizes: [2],
                broken_jacobian: false,
            }),
            "residual 0",
            1e-6,
            1e-4,
            Arc::clone(&counter),
        );
        let params = vec![DVector::from_vec(vec![2.0, 0.5])];
        assert!(checked.evaluate(&params, true).is_some());
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }
}
