//! Line search minimization.
//!
//! Each iteration picks a descent direction from the gradient, then backtracks along it
//! until the Armijo condition `f(x ⊞ αd) ≤ f(x) + c·α·gᵀd` holds. Every accepted step
//! moves the state, so the cost decreases monotonically.

use std::collections::VecDeque;
use std::{
    fmt,
    fmt::{Display, Formatter},
};

use nalgebra::DVector;
use tracing::debug;
use web_time::Instant;

use crate::callbacks::{CallbackPipeline, CallbackReturnType};
use crate::evaluator::Evaluator;
use crate::optimizer::{
    IterationSummary, Minimizer, MinimizerOptions, MinimizerSummary, TerminationType,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LineSearchDirectionType {
    SteepestDescent,
    /// Limited memory BFGS with `max_lbfgs_rank` correction pairs.
    #[default]
    Lbfgs,
}

impl Display for LineSearchDirectionType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LineSearchDirectionType::SteepestDescent => write!(f, "STEEPEST_DESCENT"),
            LineSearchDirectionType::Lbfgs => write!(f, "LBFGS"),
        }
    }
}

/// Two-loop recursion over the most recent correction pairs.
#[derive(Debug, Clone)]
struct Lbfgs {
    rank: usize,
    s: VecDeque<DVector<f64>>,
    y: VecDeque<DVector<f64>>,
}

impl Lbfgs {
    fn new(rank: usize) -> Self {
        Self {
            rank,
            s: VecDeque::with_capacity(rank),
            y: VecDeque::with_capacity(rank),
        }
    }

    fn reset(&mut self) {
        self.s.clear();
        self.y.clear();
    }

    fn update(&mut self, s: DVector<f64>, y: DVector<f64>) {
        let sy = s.dot(&y);
        if sy <= f64::EPSILON * y.norm_squared() {
            debug!("Skipping L-BFGS update, curvature sᵀy = {:e}", sy);
            return;
        }
        if self.s.len() == self.rank {
            self.s.pop_front();
            self.y.pop_front();
        }
        self.s.push_back(s);
        self.y.push_back(y);
    }

    /// `−H·g` for the implicit inverse Hessian approximation `H`.
    fn direction(&self, gradient: &DVector<f64>) -> DVector<f64> {
        let mut q = gradient.clone();
        let mut alphas = Vec::with_capacity(self.s.len());
        for (s, y) in self.s.iter().zip(&self.y).rev() {
            let rho = 1.0 / y.dot(s);
            let alpha = rho * s.dot(&q);
            q.axpy(-alpha, y, 1.0);
            alphas.push((rho, alpha));
        }

        let gamma = match (self.s.back(), self.y.back()) {
            (Some(s), Some(y)) => s.dot(y) / y.norm_squared(),
            _ => 1.0,
        };
        let mut r = q * gamma;
        for ((s, y), (rho, alpha)) in self.s.iter().zip(&self.y).zip(alphas.into_iter().rev()) {
            let beta = rho * y.dot(&r);
            r.axpy(alpha - beta, s, 1.0);
        }
        -r
    }
}

pub struct LineSearchMinimizer {
    evaluator: Evaluator,
}

impl LineSearchMinimizer {
    pub fn new(evaluator: Evaluator) -> Self {
        Self { evaluator }
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    fn evaluate_gradient(&mut self, x: &DVector<f64>) -> Option<(f64, DVector<f64>)> {
        let evaluation = self.evaluator.evaluate(x, true)?;
        Some((evaluation.cost, evaluation.gradient?))
    }

    /// Backtrack from `initial_step` until the Armijo condition holds.
    ///
    /// Returns the step length, the new point, its cost and the number of evaluations.
    fn backtrack(
        &mut self,
        options: &MinimizerOptions,
        x: &DVector<f64>,
        cost: f64,
        direction: &DVector<f64>,
        directional_derivative: f64,
        initial_step: f64,
    ) -> Result<(f64, DVector<f64>, f64, usize), usize> {
        let mut step = initial_step;
        let mut evaluations = 0;
        loop {
            evaluations += 1;
            let candidate = self.evaluator.plus(x, &(direction * step));
            let candidate_cost = self
                .evaluator
                .evaluate(&candidate, false)
                .map_or(f64::INFINITY, |e| e.cost);
            if candidate_cost
                <= cost + options.line_search_sufficient_function_decrease * step * directional_derivative
            {
                return Ok((step, candidate, candidate_cost, evaluations));
            }
            if evaluations >= options.max_num_line_search_step_size_iterations {
                return Err(evaluations);
            }

            // Minimizer of the quadratic through f(0), f'(0) and f(step), kept within
            // [0.1, 0.5]·step.
            let next = if candidate_cost.is_finite() {
                let denominator = 2.0 * (candidate_cost - cost - directional_derivative * step);
                -directional_derivative * step * step / denominator
            } else {
                0.5 * step
            };
            step = if next.is_finite() {
                next.clamp(0.1 * step, 0.5 * step)
            } else {
                0.5 * step
            };
            if step < options.min_line_search_step_size {
                return Err(evaluations);
            }
        }
    }
}

impl Minimizer for LineSearchMinimizer {
    fn minimize(
        &mut self,
        options: &MinimizerOptions,
        x0: &DVector<f64>,
        callbacks: &mut CallbackPipeline<'_>,
    ) -> MinimizerSummary {
        let start = Instant::now();
        let mut summary = MinimizerSummary::new(x0.clone());
        let mut x = x0.clone();

        let Some((mut cost, mut gradient)) = self.evaluate_gradient(&x) else {
            summary.terminate(
                TerminationType::NumericalFailure,
                "Residual and Jacobian evaluation failed at the initial point",
            );
            summary.evaluator_statistics = self.evaluator.statistics();
            return summary;
        };
        summary.initial_cost = cost;

        let mut lbfgs = Lbfgs::new(options.max_lbfgs_rank);
        let mut previous_cost_change: Option<f64> = None;
        let mut iteration_start = start;
        let mut current = IterationSummary {
            iteration: 0,
            step_is_valid: true,
            step_is_successful: true,
            cost,
            gradient_max_norm: gradient.amax(),
            gradient_norm: gradient.norm(),
            ..Default::default()
        };

        loop {
            if current.iteration > 0 {
                summary.num_successful_steps += 1;
            }
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
            if current.iteration > 0 {
                let x_norm = x.norm();
                if current.step_norm <= options.parameter_tolerance * (x_norm + options.parameter_tolerance) {
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
                let previous_cost = cost + current.cost_change;
                if current.cost_change.abs() <= options.function_tolerance * previous_cost {
                    summary.terminate(
                        TerminationType::FunctionTolerance,
                        format!(
                            "Function tolerance reached. |cost_change|/cost: {:e} <= {:e}",
                            current.cost_change.abs() / previous_cost,
                            options.function_tolerance
                        ),
                    );
                    break;
                }
            }

            iteration_start = Instant::now();
            let iteration = current.iteration + 1;

            let mut direction = match options.line_search_direction_type {
                LineSearchDirectionType::SteepestDescent => -&gradient,
                LineSearchDirectionType::Lbfgs => lbfgs.direction(&gradient),
            };
            let mut directional_derivative = gradient.dot(&direction);
            if !(directional_derivative < 0.0) {
                debug!("Direction is not a descent direction, restarting from steepest descent");
                lbfgs.reset();
                direction = -&gradient;
                directional_derivative = -gradient.norm_squared();
            }

            // First step scaled by the gradient; later steepest descent steps reuse the
            // previous decrease, quasi-Newton steps start at the unit step.
            let initial_step = match (options.line_search_direction_type, previous_cost_change) {
                (LineSearchDirectionType::Lbfgs, Some(_)) => 1.0,
                (LineSearchDirectionType::SteepestDescent, Some(change)) => {
                    (2.02 * change / -directional_derivative).clamp(f64::EPSILON, 1.0)
                }
                (_, None) => (1.0 / gradient.amax()).min(1.0),
            };

            let (step_size, x_new, _, evaluations) = match self.backtrack(
                options,
                &x,
                cost,
                &direction,
                directional_derivative,
                initial_step,
            ) {
                Ok(found) => found,
                Err(evaluations) => {
                    summary.terminate(
                        TerminationType::NumericalFailure,
                        format!(
                            "Line search failed to find a step satisfying the Armijo condition after {evaluations} evaluations"
                        ),
                    );
                    break;
                }
            };

            let Some((new_cost, new_gradient)) = self.evaluate_gradient(&x_new) else {
                summary.terminate(
                    TerminationType::NumericalFailure,
                    "Residual and Jacobian evaluation failed at an accepted point",
                );
                break;
            };

            lbfgs.update(&direction * step_size, &new_gradient - &gradient);
            let cost_change = cost - new_cost;
            previous_cost_change = Some(cost_change);

            current = IterationSummary {
                iteration,
                step_is_valid: true,
                step_is_successful: true,
                cost: new_cost,
                cost_change,
                gradient_max_norm: new_gradient.amax(),
                gradient_norm: new_gradient.norm(),
                step_norm: (&x_new - &x).norm(),
                step_size,
                line_search_function_evaluations: evaluations,
                ..Default::default()
            };
            x = x_new;
            cost = new_cost;
            gradient = new_gradient;
        }

        debug!(
            "Line search minimizer finished: {} ({})",
            summary.termination_type, summary.message
        );
        summary.x = x;
        summary.evaluator_statistics = self.evaluator.statistics();
        summary
    }
}
