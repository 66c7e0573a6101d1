//! Trust region step computation.
//!
//! A strategy turns the Jacobian and residuals at the current state into a step `s` that
//! approximately minimizes the linear model `||J s + r||²` inside the trust region, and
//! adjusts the region from the quality of the steps the minimizer reports back.
//!
//! - [`LevenbergMarquardtStrategy`]: regularized Gauss-Newton with Nielsen's damping update
//! - [`DoglegStrategy`]: Powell's dogleg, or the two dimensional subspace variant

use std::{
    fmt,
    fmt::{Display, Formatter},
};

use nalgebra::{DVector, Matrix2, Vector2};
use tracing::{debug, warn};

use crate::linalg::{BlockSparseMatrix, LinAlgError, LinAlgResult, LinearSolver, PerSolveOptions};
use crate::optimizer::MinimizerOptions;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TrustRegionStrategyType {
    #[default]
    LevenbergMarquardt,
    Dogleg,
}

impl Display for TrustRegionStrategyType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TrustRegionStrategyType::LevenbergMarquardt => write!(f, "LEVENBERG_MARQUARDT"),
            TrustRegionStrategyType::Dogleg => write!(f, "DOGLEG"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DoglegType {
    /// Piecewise linear path from the Cauchy point to the Gauss-Newton point.
    #[default]
    TraditionalDogleg,
    /// Exact model minimizer over the span of the gradient and the Gauss-Newton step.
    SubspaceDogleg,
}

impl Display for DoglegType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DoglegType::TraditionalDogleg => write!(f, "TRADITIONAL_DOGLEG"),
            DoglegType::SubspaceDogleg => write!(f, "SUBSPACE_DOGLEG"),
        }
    }
}

/// A computed step in tangent coordinates.
#[derive(Debug, Clone)]
pub struct TrustRegionStep {
    pub step: DVector<f64>,
    pub num_linear_solver_iterations: usize,
}

pub trait TrustRegionStrategy: Send {
    /// Compute a step for the linear model `||J s + r||²`.
    ///
    /// # Errors
    /// Fails when the linear solver cannot produce a finite step. Errors for which
    /// [`LinAlgError::is_fatal`] holds end the minimization.
    fn compute_step(
        &mut self,
        jacobian: &BlockSparseMatrix,
        residuals: &DVector<f64>,
    ) -> LinAlgResult<TrustRegionStep>;

    /// The last step was accepted with the given ratio of actual to predicted decrease.
    fn step_accepted(&mut self, step_quality: f64);

    fn step_rejected(&mut self, step_quality: f64);

    /// The last step was not finite or did not decrease the model.
    fn step_is_invalid(&mut self);

    fn radius(&self) -> f64;
}

/// Build the strategy selected by `options` around `linear_solver`.
pub fn create_trust_region_strategy(
    options: &MinimizerOptions,
    linear_solver: Box<dyn LinearSolver>,
) -> Box<dyn TrustRegionStrategy> {
    match options.trust_region_strategy_type {
        TrustRegionStrategyType::LevenbergMarquardt => {
            Box::new(LevenbergMarquardtStrategy::new(linear_solver, options))
        }
        TrustRegionStrategyType::Dogleg => Box::new(DoglegStrategy::new(linear_solver, options)),
    }
}

fn is_finite(v: &DVector<f64>) -> bool {
    v.iter().all(|x| x.is_finite())
}

/// Levenberg-Marquardt steps.
///
/// Solves `(JᵀJ + λ·diag(JᵀJ)) s = −Jᵀr` with `λ = 1 / radius`, the diagonal clamped to
/// `[min_lm_diagonal, max_lm_diagonal]`. The radius follows Nielsen's rule:
/// - accepted with quality ρ: `radius /= max(1/3, 1 − (2ρ − 1)³)`, ν = 2
/// - rejected: `radius /= ν`, ν doubles
pub struct LevenbergMarquardtStrategy {
    linear_solver: Box<dyn LinearSolver>,
    radius: f64,
    max_radius: f64,
    min_diagonal: f64,
    max_diagonal: f64,
    decrease_factor: f64,
    eta: f64,
}

impl LevenbergMarquardtStrategy {
    pub fn new(linear_solver: Box<dyn LinearSolver>, options: &MinimizerOptions) -> Self {
        Self {
            linear_solver,
            radius: options.initial_trust_region_radius,
            max_radius: options.max_trust_region_radius,
            min_diagonal: options.min_lm_diagonal,
            max_diagonal: options.max_lm_diagonal,
            decrease_factor: 2.0,
            eta: options.eta,
        }
    }

    /// Current damping parameter λ.
    pub fn damping(&self) -> f64 {
        1.0 / self.radius
    }
}

impl TrustRegionStrategy for LevenbergMarquardtStrategy {
    fn compute_step(
        &mut self,
        jacobian: &BlockSparseMatrix,
        residuals: &DVector<f64>,
    ) -> LinAlgResult<TrustRegionStep> {
        let diagonal = jacobian
            .squared_column_norm()
            .map(|v| v.clamp(self.min_diagonal, self.max_diagonal));
        let per_solve = PerSolveOptions {
            d: Some(diagonal.map(|v| (v / self.radius).sqrt())),
            r_tolerance: self.eta,
        };
        let summary = self.linear_solver.solve(jacobian, &(-residuals), &per_solve)?;
        if !is_finite(&summary.x) {
            return Err(LinAlgError::FactorizationFailed(
                "linear solver produced a non-finite step".to_string(),
            ));
        }
        Ok(TrustRegionStep {
            step: summary.x,
            num_linear_solver_iterations: summary.num_iterations,
        })
    }

    fn step_accepted(&mut self, step_quality: f64) {
        let factor = (1.0 / 3.0_f64).max(1.0 - (2.0 * step_quality - 1.0).powi(3));
        self.radius = (self.radius / factor).min(self.max_radius);
        self.decrease_factor = 2.0;
    }

    fn step_rejected(&mut self, _step_quality: f64) {
        self.radius /= self.decrease_factor;
        self.decrease_factor *= 2.0;
    }

    fn step_is_invalid(&mut self) {
        self.step_rejected(0.0);
    }

    fn radius(&self) -> f64 {
        self.radius
    }
}

/// Orthonormal basis of span{g, Gauss-Newton step} and the model restricted to it.
struct Subspace {
    basis: [DVector<f64>; 2],
    gradient: Vector2<f64>,
    hessian: Matrix2<f64>,
}

/// Dogleg steps in the scaled variables `y = D s`, `D = sqrt(clamp(diag(JᵀJ)))`.
///
/// After a rejected step only the radius changes, so the gradient, Cauchy point and
/// Gauss-Newton step are reused and no linear solve is needed.
pub struct DoglegStrategy {
    linear_solver: Box<dyn LinearSolver>,
    dogleg_type: DoglegType,
    radius: f64,
    max_radius: f64,
    min_diagonal: f64,
    max_diagonal: f64,
    eta: f64,

    /// Regularization of the Gauss-Newton solve, raised when it fails.
    mu: f64,
    min_mu: f64,
    max_mu: f64,
    mu_increase_factor: f64,

    reuse: bool,
    diagonal: DVector<f64>,
    gradient: DVector<f64>,
    gauss_newton_step: DVector<f64>,
    alpha: f64,
    subspace: Option<Subspace>,
    dogleg_step_norm: f64,
}

impl DoglegStrategy {
    pub fn new(linear_solver: Box<dyn LinearSolver>, options: &MinimizerOptions) -> Self {
        Self {
            linear_solver,
            dogleg_type: options.dogleg_type,
            radius: options.initial_trust_region_radius,
            max_radius: options.max_trust_region_radius,
            min_diagonal: options.min_lm_diagonal,
            max_diagonal: options.max_lm_diagonal,
            eta: options.eta,
            mu: 1e-8,
            min_mu: 1e-8,
            max_mu: 1.0,
            mu_increase_factor: 10.0,
            reuse: false,
            diagonal: DVector::zeros(0),
            gradient: DVector::zeros(0),
            gauss_newton_step: DVector::zeros(0),
            alpha: 0.0,
            subspace: None,
            dogleg_step_norm: 0.0,
        }
    }

    fn compute_gauss_newton_step(
        &mut self,
        jacobian: &BlockSparseMatrix,
        residuals: &DVector<f64>,
    ) -> LinAlgResult<usize> {
        let rhs = -residuals;
        loop {
            let per_solve = PerSolveOptions {
                d: Some(&self.diagonal * self.mu.sqrt()),
                r_tolerance: self.eta,
            };
            let failure = match self.linear_solver.solve(jacobian, &rhs, &per_solve) {
                Ok(summary) if is_finite(&summary.x) => {
                    self.gauss_newton_step = summary.x.component_mul(&self.diagonal);
                    self.mu = (2.0 * self.mu / self.mu_increase_factor).max(self.min_mu);
                    return Ok(summary.num_iterations);
                }
                Ok(_) => "non-finite Gauss-Newton step".to_string(),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => e.to_string(),
            };
            self.mu *= self.mu_increase_factor;
            debug!("Gauss-Newton solve failed ({}), raising mu to {:.3e}", failure, self.mu);
            if self.mu > self.max_mu {
                return Err(LinAlgError::FactorizationFailed(format!(
                    "Gauss-Newton step failed with mu up to {:.3e}: {}",
                    self.max_mu, failure
                )));
            }
        }
    }

    fn compute_subspace(&self, jacobian: &BlockSparseMatrix) -> Option<Subspace> {
        let g_norm = self.gradient.norm();
        if g_norm == 0.0 {
            return None;
        }
        let e1 = &self.gradient / g_norm;
        let v = &self.gauss_newton_step - &e1 * e1.dot(&self.gauss_newton_step);
        let v_norm = v.norm();
        if v_norm <= 1e-10 * self.gauss_newton_step.norm().max(1.0) {
            return None;
        }
        let e2 = v / v_norm;

        let j1 = jacobian.right_multiply(&e1.component_div(&self.diagonal));
        let j2 = jacobian.right_multiply(&e2.component_div(&self.diagonal));
        let gradient = Vector2::new(e1.dot(&self.gradient), e2.dot(&self.gradient));
        let off_diagonal = j1.dot(&j2);
        let hessian = Matrix2::new(j1.norm_squared(), off_diagonal, off_diagonal, j2.norm_squared());
        Some(Subspace {
            basis: [e1, e2],
            gradient,
            hessian,
        })
    }

    /// Step along the dogleg path for the current radius, in tangent coordinates.
    fn dogleg_step(&mut self) -> DVector<f64> {
        let gn_norm = self.gauss_newton_step.norm();
        if gn_norm <= self.radius {
            self.dogleg_step_norm = gn_norm;
            return self.gauss_newton_step.component_div(&self.diagonal);
        }

        let scaled = match (self.dogleg_type, &self.subspace) {
            (DoglegType::SubspaceDogleg, Some(subspace)) => {
                let y = minimize_on_circle(subspace, self.radius);
                &subspace.basis[0] * y[0] + &subspace.basis[1] * y[1]
            }
            _ => self.traditional_scaled_step(gn_norm),
        };
        self.dogleg_step_norm = scaled.norm();
        scaled.component_div(&self.diagonal)
    }

    fn traditional_scaled_step(&self, gn_norm: f64) -> DVector<f64> {
        let gradient_norm = self.gradient.norm();
        if gradient_norm == 0.0 {
            return &self.gauss_newton_step * (self.radius / gn_norm);
        }
        if gradient_norm * self.alpha >= self.radius {
            return &self.gradient * (-self.radius / gradient_norm);
        }

        // Point on the segment from the Cauchy point a to the Gauss-Newton point b at
        // distance radius from the origin.
        let a = &self.gradient * -self.alpha;
        let b_minus_a = &self.gauss_newton_step - &a;
        let c = a.dot(&b_minus_a);
        let a_squared = a.norm_squared();
        let b_minus_a_squared = b_minus_a.norm_squared();
        let r_squared = self.radius * self.radius;
        let d = (c * c + b_minus_a_squared * (r_squared - a_squared)).sqrt();
        let beta = if c <= 0.0 {
            (d - c) / b_minus_a_squared
        } else {
            (r_squared - a_squared) / (d + c)
        };
        a + b_minus_a * beta
    }
}

/// Minimize `gᵀy + ½yᵀBy` over `||y|| = radius`.
fn minimize_on_circle(subspace: &Subspace, radius: f64) -> Vector2<f64> {
    let model = |theta: f64| {
        let y = Vector2::new(theta.cos(), theta.sin()) * radius;
        subspace.gradient.dot(&y) + 0.5 * y.dot(&(subspace.hessian * y))
    };

    const SAMPLES: usize = 360;
    let spacing = std::f64::consts::TAU / SAMPLES as f64;
    let mut best = 0.0;
    let mut best_value = f64::INFINITY;
    for k in 0..SAMPLES {
        let theta = k as f64 * spacing;
        let value = model(theta);
        if value < best_value {
            best = theta;
            best_value = value;
        }
    }

    // Golden section search in the bracket around the best sample.
    let ratio = (5.0_f64.sqrt() - 1.0) / 2.0;
    let (mut lo, mut hi) = (best - spacing, best + spacing);
    for _ in 0..60 {
        let left = hi - ratio * (hi - lo);
        let right = lo + ratio * (hi - lo);
        if model(left) < model(right) {
            hi = right;
        } else {
            lo = left;
        }
    }
    let theta = 0.5 * (lo + hi);
    Vector2::new(theta.cos(), theta.sin()) * radius
}

impl TrustRegionStrategy for DoglegStrategy {
    fn compute_step(
        &mut self,
        jacobian: &BlockSparseMatrix,
        residuals: &DVector<f64>,
    ) -> LinAlgResult<TrustRegionStep> {
        if self.reuse {
            return Ok(TrustRegionStep {
                step: self.dogleg_step(),
                num_linear_solver_iterations: 0,
            });
        }

        self.diagonal = jacobian
            .squared_column_norm()
            .map(|v| v.clamp(self.min_diagonal, self.max_diagonal).sqrt());
        self.gradient = jacobian.left_multiply(residuals).component_div(&self.diagonal);

        let jg = jacobian.right_multiply(&self.gradient.component_div(&self.diagonal));
        self.alpha = self.gradient.norm_squared() / jg.norm_squared();
        if !self.alpha.is_finite() {
            self.alpha = 0.0;
        }

        let iterations = self.compute_gauss_newton_step(jacobian, residuals)?;
        self.subspace = match self.dogleg_type {
            DoglegType::SubspaceDogleg => {
                let subspace = self.compute_subspace(jacobian);
                if subspace.is_none() {
                    warn!("Gradient and Gauss-Newton step are parallel, using the traditional dogleg");
                }
                subspace
            }
            DoglegType::TraditionalDogleg => None,
        };
        self.reuse = true;

        Ok(TrustRegionStep {
            step: self.dogleg_step(),
            num_linear_solver_iterations: iterations,
        })
    }

    fn step_accepted(&mut self, step_quality: f64) {
        if step_quality < 0.25 {
            self.radius *= 0.5;
        }
        if step_quality > 0.75 {
            self.radius = self.radius.max(3.0 * self.dogleg_step_norm);
        }
        self.radius = self.radius.min(self.max_radius);
        self.reuse = false;
    }

    fn step_rejected(&mut self, _step_quality: f64) {
        self.radius *= 0.5;
        self.reuse = true;
    }

    fn step_is_invalid(&mut self) {
        self.mu *= self.mu_increase_factor;
        self.reuse = false;
    }

    fn radius(&self) -> f64 {
        self.radius
    }
}
