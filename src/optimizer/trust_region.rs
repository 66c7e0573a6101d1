//! Trust region minimization.
//!
//! Each iteration asks the [`TrustRegionStrategy`] for a step on the linearized problem,
//! evaluates the cost at the candidate point and accepts the step when the ratio of
//! actual to predicted cost decrease exceeds `min_relative_decrease`.
//!
//! Features on top of the basic loop:
//! - Jacobi scaling: columns of `J` are scaled by `1 / (1 + ||Jᵢ||)` computed at the start
//! - Non-monotonic steps: step quality is measured against a reference cost that may lag
//!   behind the current one, so the cost is allowed to increase for a bounded number of
//!   steps
//! - Inner iterations: coordinate descent over independent block groups after each valid
//!   step
//!
//! # Convergence criteria
//!
//! - Gradient: `||g||∞ ≤ gradient_tolerance`
//! - Parameter: `||Δx|| ≤ parameter_tolerance · (||x|| + parameter_tolerance)`, or the
//!   trust region radius dropping below `min_trust_region_radius`
//! - Function: `|Δcost| ≤ function_tolerance · cost`
//! - Budget: `max_num_iterations`, `max_solver_time_in_seconds`
//! - Numerical failure: more than `max_num_consecutive_invalid_steps` invalid steps in a
//!   row, or a failed evaluation at an accepted point

use nalgebra::DVector;
use tracing::debug;
use web_time::Instant;

use crate::callbacks::{CallbackPipeline, CallbackReturnType};
use crate::evaluator::Evaluator;
use crate::linalg::BlockSparseMatrix;
use crate::optimizer::{
    CoordinateDescentMinimizer, IterationSummary, Minimizer, MinimizerOptions, MinimizerSummary,
    TerminationType, TrustRegionStrategy,
};

/// Residuals, gradient and scaled Jacobian at the current state.
struct LinearizedState {
    cost: f64,
    residuals: DVector<f64>,
    gradient: DVector<f64>,
    jacobian: BlockSparseMatrix,
}

/// Bookkeeping for step acceptance with optional non-monotonic steps.
///
/// With `max_consecutive_nonmonotonic_steps == 0` the reference cost always equals the
/// current cost and acceptance is monotonic.
#[derive(Debug, Clone)]
struct StepEvaluator {
    reference_cost: f64,
    minimum_cost: f64,
    current_cost: f64,
    candidate_cost: f64,
    accumulated_reference_model_cost_change: f64,
    accumulated_candidate_model_cost_change: f64,
    num_consecutive_nonmonotonic_steps: usize,
    max_consecutive_nonmonotonic_steps: usize,
}

impl StepEvaluator {
    fn new(initial_cost: f64, max_consecutive_nonmonotonic_steps: usize) -> Self {
        Self {
            reference_cost: initial_cost,
            minimum_cost: initial_cost,
            current_cost: initial_cost,
            candidate_cost: initial_cost,
            accumulated_reference_model_cost_change: 0.0,
            accumulated_candidate_model_cost_change: 0.0,
            num_consecutive_nonmonotonic_steps: 0,
            max_consecutive_nonmonotonic_steps,
        }
    }

    /// Ratio of actual to predicted decrease, against the current and reference costs.
    fn step_quality(&self, cost: f64, model_cost_change: f64) -> f64 {
        if !cost.is_finite() {
            return f64::MIN;
        }
        let relative_decrease = (self.current_cost - cost) / model_cost_change;
        let historical_relative_decrease = (self.reference_cost - cost)
            / (self.accumulated_reference_model_cost_change + model_cost_change);
        relative_decrease.max(historical_relative_decrease)
    }

    fn step_accepted(&mut self, cost: f64, model_cost_change: f64) {
        self.current_cost = cost;
        self.accumulated_candidate_model_cost_change += model_cost_change;
        self.accumulated_reference_model_cost_change += model_cost_change;

        if self.current_cost < self.minimum_cost {
            self.minimum_cost = self.current_cost;
            self.num_consecutive_nonmonotonic_steps = 0;
            self.candidate_cost = self.current_cost;
            self.accumulated_candidate_model_cost_change = 0.0;
        } else {
            self.num_consecutive_nonmonotonic_steps += 1;
            if self.current_cost > self.candidate_cost {
                self.candidate_cost = self.current_cost;
                self.accumulated_candidate_model_cost_change = 0.0;
            }
        }

        if self.num_consecutive_nonmonotonic_steps == self.max_consecutive_nonmonotonic_steps {
            self.reference_cost = self.candidate_cost;
            self.accumulated_reference_model_cost_change =
                self.accumulated_candidate_model_cost_change;
        }
    }
}

pub struct TrustRegionMinimizer {
    evaluator: Evaluator,
    strategy: Box<dyn TrustRegionStrategy>,
    inner_iterations: Option<CoordinateDescentMinimizer>,
}

impl TrustRegionMinimizer {
    pub fn new(
        evaluator: Evaluator,
        strategy: Box<dyn TrustRegionStrategy>,
        inner_iterations: Option<CoordinateDescentMinimizer>,
    ) -> Self {
        Self {
            evaluator,
            strategy,
            inner_iterations,
        }
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    fn linearize(&mut self, x: &DVector<f64>, scale: Option<&DVector<f64>>) -> Option<LinearizedState> {
        let evaluation = self.evaluator.evaluate(x, true)?;
        let mut jacobian = evaluation.jacobian?;
        if let Some(scale) = scale {
            jacobian.scale_columns(scale);
        }
        Some(LinearizedState {
            cost: evaluation.cost,
            residuals: evaluation.residuals,
            gradient: evaluation.gradient?,
            jacobian,
        })
    }
}

impl Minimizer for TrustRegionMinimizer {
    fn minimize(
        &mut self,
        options: &MinimizerOptions,
        x0: &DVector<f64>,
        callbacks: &mut CallbackPipeline<'_>,
    ) -> MinimizerSummary {
        let start = Instant::now();
        let mut summary = MinimizerSummary::new(x0.clone());
        let mut x = x0.clone();

        let Some(mut state) = self.linearize(&x, None) else {
            summary.terminate(
                TerminationType::NumericalFailure,
                "Residual and Jacobian evaluation failed at the initial point",
            );
            summary.evaluator_statistics = self.evaluator.statistics();
            return summary;
        };
        let scale = if options.jacobi_scaling {
            state
                .jacobian
                .squared_column_norm()
                .map(|v| 1.0 / (1.0 + v.sqrt()))
        } else {
            DVector::from_element(self.evaluator.num_effective_parameters(), 1.0)
        };
        state.jacobian.scale_columns(&scale);
        summary.initial_cost = state.cost;

        let mut x_norm = x.norm();
        let mut x_cost = state.cost;
        let mut x_min = x.clone();
        let mut minimum_cost = x_cost;
        let mut step_evaluator = StepEvaluator::new(
            x_cost,
            if options.use_nonmonotonic_steps {
                options.max_consecutive_nonmonotonic_steps
            } else {
                0
            },
        );
        let mut inner_iterations_enabled = self.inner_iterations.is_some();
        let mut num_consecutive_invalid_steps = 0;
        let mut iteration_start = start;

        let mut current = IterationSummary {
            iteration: 0,
            step_is_valid: true,
            step_is_successful: true,
            cost: x_cost,
            gradient_max_norm: state.gradient.amax(),
            gradient_norm: state.gradient.norm(),
            ..Default::default()
        };

        loop {
            if current.step_is_successful {
                if current.iteration > 0 {
                    summary.num_successful_steps += 1;
                }
                if x_cost < minimum_cost {
                    minimum_cost = x_cost;
                    x_min.copy_from(&x);
                }
            } else {
                summary.num_unsuccessful_steps += 1;
            }
            current.trust_region_radius = self.strategy.radius();
            current.iteration_time = iteration_start.elapsed();
            current.cumulative_time = start.elapsed();
            summary.iterations.push(current.clone());

            match callbacks.run(&current, &x) {
                CallbackReturnType::Continue => {}
                CallbackReturnType::Abort => {
                    summary.terminate(TerminationType::UserAbort, "User callback returned Abort");
                    break;
                }
                CallbackReturnType::TerminateSuccessfully => {
                    summary.terminate(
                        TerminationType::UserSuccess,
                        "User callback returned TerminateSuccessfully",
                    );
                    break;
                }
            }

            if current.iteration >= options.max_num_iterations {
                summary.terminate(
                    TerminationType::NoConvergence,
                    format!(
                        "Maximum number of iterations reached. Number of iterations: {}",
                        current.iteration
                    ),
                );
                break;
            }
            if start.elapsed().as_secs_f64() >= options.max_solver_time_in_seconds {
                summary.terminate(
                    TerminationType::NoConvergence,
                    format!(
                        "Maximum solver time reached. Total solver time: {:.3}s",
                        start.elapsed().as_secs_f64()
                    ),
                );
                break;
            }
            if current.gradient_max_norm <= options.gradient_tolerance {
                summary.terminate(
                    TerminationType::GradientTolerance,
                    format!(
                        "Gradient tolerance reached. Gradient max norm: {:e} <= {:e}",
                        current.gradient_max_norm, options.gradient_tolerance
                    ),
                );
                break;
            }
            if current.trust_region_radius < options.min_trust_region_radius {
                summary.terminate(
                    TerminationType::ParameterTolerance,
                    format!(
                        "Minimum trust region radius reached. Trust region radius: {:e} < {:e}",
                        current.trust_region_radius, options.min_trust_region_radius
                    ),
                );
                break;
            }

            iteration_start = Instant::now();
            current = IterationSummary {
                iteration: current.iteration + 1,
                cost: x_cost,
                gradient_max_norm: current.gradient_max_norm,
                gradient_norm: current.gradient_norm,
                ..Default::default()
            };

            let linear_solver_start = Instant::now();
            let step = self.strategy.compute_step(&state.jacobian, &state.residuals);
            summary.linear_solver_time += linear_solver_start.elapsed();
            let step = match step {
                Ok(step) => {
                    current.linear_solver_iterations = step.num_linear_solver_iterations;
                    Some(step.step)
                }
                Err(e) if e.is_fatal() => {
                    summary.terminate(
                        TerminationType::NumericalFailure,
                        format!("Linear solver failed: {e}"),
                    );
                    break;
                }
                Err(e) => {
                    debug!("Linear solver failed at iteration {}: {}", current.iteration, e);
                    None
                }
            };

            // Predicted decrease of the linear model: −(rᵀJs + ½||Js||²).
            let valid_step = step.and_then(|scaled_step| {
                let js = state.jacobian.right_multiply(&scaled_step);
                let model_cost_change = -(state.residuals.dot(&js) + 0.5 * js.norm_squared());
                (model_cost_change.is_finite() && model_cost_change > 0.0)
                    .then(|| (scaled_step.component_mul(&scale), model_cost_change))
            });
            let Some((delta, mut model_cost_change)) = valid_step else {
                num_consecutive_invalid_steps += 1;
                if num_consecutive_invalid_steps > options.max_num_consecutive_invalid_steps {
                    summary.terminate(
                        TerminationType::NumericalFailure,
                        format!(
                            "Number of consecutive invalid steps more than max_num_consecutive_invalid_steps: {}",
                            options.max_num_consecutive_invalid_steps
                        ),
                    );
                    break;
                }
                self.strategy.step_is_invalid();
                current.step_is_valid = false;
                continue;
            };
            num_consecutive_invalid_steps = 0;
            current.step_is_valid = true;

            if start.elapsed().as_secs_f64() >= options.max_solver_time_in_seconds {
                summary.terminate(
                    TerminationType::NoConvergence,
                    format!(
                        "Maximum solver time reached. Total solver time: {:.3}s",
                        start.elapsed().as_secs_f64()
                    ),
                );
                break;
            }

            let mut candidate_x = self.evaluator.plus(&x, &delta);
            let mut candidate_cost = self
                .evaluator
                .evaluate(&candidate_x, false)
                .map_or(f64::INFINITY, |e| e.cost);

            if inner_iterations_enabled
                && candidate_cost.is_finite()
                && let Some(inner) = self.inner_iterations.as_ref()
            {
                let inner_start = Instant::now();
                let mut inner_x = candidate_x.clone();
                summary.num_inner_iteration_steps += inner.minimize(&self.evaluator, &mut inner_x);
                let inner_cost = self
                    .evaluator
                    .evaluate(&inner_x, false)
                    .map_or(f64::INFINITY, |e| e.cost);
                let relative_progress = 1.0 - inner_cost / candidate_cost;
                if inner_cost < candidate_cost {
                    model_cost_change += candidate_cost - inner_cost;
                    candidate_x = inner_x;
                    candidate_cost = inner_cost;
                }
                if !(relative_progress > options.inner_iteration_tolerance) {
                    debug!(
                        "Disabling inner iterations. Relative progress: {:e}",
                        relative_progress
                    );
                    inner_iterations_enabled = false;
                }
                summary.inner_iteration_time += inner_start.elapsed();
            }

            current.step_norm = (&x - &candidate_x).norm();
            let step_size_tolerance =
                options.parameter_tolerance * (x_norm + options.parameter_tolerance);
            if current.step_norm <= step_size_tolerance {
                summary.terminate(
                    TerminationType::ParameterTolerance,
                    format!(
                        "Parameter tolerance reached. Relative step norm: {:e} <= {:e}",
                        current.step_norm / (x_norm + options.parameter_tolerance),
                        options.parameter_tolerance
                    ),
                );
                break;
            }

            current.cost_change = x_cost - candidate_cost;
            let absolute_function_tolerance = options.function_tolerance * x_cost;
            if current.cost_change.abs() <= absolute_function_tolerance {
                summary.terminate(
                    TerminationType::FunctionTolerance,
                    format!(
                        "Function tolerance reached. |cost_change|/cost: {:e} <= {:e}",
                        current.cost_change.abs() / x_cost,
                        options.function_tolerance
                    ),
                );
                break;
            }

            let relative_decrease = step_evaluator.step_quality(candidate_cost, model_cost_change);
            current.relative_decrease = relative_decrease;
            if relative_decrease > options.min_relative_decrease {
                current.step_is_nonmonotonic =
                    (x_cost - candidate_cost) / model_cost_change < options.min_relative_decrease;
                x = candidate_x;
                x_norm = x.norm();
                state = match self.linearize(&x, Some(&scale)) {
                    Some(state) => state,
                    None => {
                        summary.terminate(
                            TerminationType::NumericalFailure,
                            "Residual and Jacobian evaluation failed at an accepted point",
                        );
                        break;
                    }
                };
                x_cost = state.cost;
                current.step_is_successful = true;
                current.cost = x_cost;
                current.gradient_max_norm = state.gradient.amax();
                current.gradient_norm = state.gradient.norm();
                self.strategy.step_accepted(relative_decrease);
                step_evaluator.step_accepted(x_cost, model_cost_change);
            } else {
                self.strategy.step_rejected(relative_decrease);
            }
        }

        debug!(
            "Trust region minimizer finished: {} ({})",
            summary.termination_type, summary.message
        );
        summary.x = x_min;
        summary.evaluator_statistics = self.evaluator.statistics();
        summary
    }
}
