//! Corrector for robust loss functions.
//!
//! Given a residual `r`, its Jacobian `J` and a loss ρ evaluated at `s = ||r||²`, the
//! corrector produces `r̃` and `J̃` such that the Gauss-Newton model of `½||r̃||²` has
//! the same gradient as `½ρ(s)` and a curvature that accounts for `ρ''`:
//!
//! ```text
//! α  = 1 − √(1 + 2 s ρ''/ρ')          (0 when ρ'' ≤ 0)
//! r̃  = √ρ' / (1 − α) · r
//! J̃  = √ρ' · (J − α/s · r rᵀ J)
//! ```
//!
//! Reference: Triggs et al., "Bundle Adjustment — A Modern Synthesis" (1999), and the
//! Ceres Solver corrector.

use crate::core::loss_functions::LossFunction;
use nalgebra::{DMatrix, DVector};

#[derive(Debug, Clone)]
pub struct Corrector {
    sqrt_rho1: f64,
    residual_scaling: f64,
    alpha_sq_norm: f64,
}

impl Corrector {
    /// Build the corrector for squared residual norm `sq_norm`.
    pub fn new(loss_function: &dyn LossFunction, sq_norm: f64) -> Self {
        let [_, rho_1, rho_2] = loss_function.evaluate(sq_norm);
        let sqrt_rho1 = rho_1.sqrt();

        // Without positive curvature the correction reduces to plain reweighting.
        if sq_norm == 0.0 || rho_2 <= 0.0 {
            return Self {
                sqrt_rho1,
                residual_scaling: sqrt_rho1,
                alpha_sq_norm: 0.0,
            };
        }

        // α solves ½α² − α − (ρ''/ρ')·s = 0
        let d = 1.0 + 2.0 * sq_norm * rho_2 / rho_1;
        let alpha = 1.0 - d.sqrt();

        Self {
            sqrt_rho1,
            residual_scaling: sqrt_rho1 / (1.0 - alpha),
            alpha_sq_norm: alpha / sq_norm,
        }
    }

    /// Correct the Jacobian of one parameter block in place. `residual` must be the
    /// uncorrected residual.
    pub fn correct_jacobian(&self, residual: &DVector<f64>, jacobian: &mut DMatrix<f64>) {
        if self.alpha_sq_norm == 0.0 {
            *jacobian *= self.sqrt_rho1;
            return;
        }
        let rtj = residual.transpose() * &*jacobian;
        let correction = residual * rtj * self.alpha_sq_norm;
        *jacobian -= correction;
        *jacobian *= self.sqrt_rho1;
    }

    pub fn correct_residuals(&self, residual: &mut DVector<f64>) {
        *residual *= self.residual_scaling;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::loss_functions::{CauchyLoss, HuberLoss, LossFunction};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// ρ(s) = s + s², positive curvature everywhere.
    struct Quadratic;

    impl LossFunction for Quadratic {
        fn evaluate(&self, s: f64) -> [f64; 3] {
            [s + s * s, 1.0 + 2.0 * s, 2.0]
        }
    }

    #[test]
    fn test_corrector_huber_inlier_is_identity() -> TestResult {
        let loss = HuberLoss::new(1.0)?;
        let residual = DVector::from_vec(vec![0.1, 0.2, 0.1]);
        let corrector = Corrector::new(&loss, residual.norm_squared());

        let mut corrected = residual.clone();
        corrector.correct_residuals(&mut corrected);
        assert!((corrected - &residual).norm() < 1e-12);

        let jacobian = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let mut corrected_jacobian = jacobian.clone();
        corrector.correct_jacobian(&residual, &mut corrected_jacobian);
        assert!((corrected_jacobian - jacobian).norm() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_corrector_downweights_outliers() -> TestResult {
        let residual = DVector::from_vec(vec![5.0, 5.0, 5.0]);
        let losses: [Box<dyn LossFunction>; 2] = [
            Box::new(HuberLoss::new(1.0)?),
            Box::new(CauchyLoss::new(1.0)?),
        ];
        for loss in losses {
            let corrector = Corrector::new(loss.as_ref(), residual.norm_squared());
            let mut corrected = residual.clone();
            corrector.correct_residuals(&mut corrected);
            assert!(corrected.norm() < residual.norm());
        }
        Ok(())
    }

    #[test]
    fn test_corrected_gradient_matches_robust_gradient() {
        let residual = DVector::from_vec(vec![0.6, -0.3]);
        let jacobian = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, -1.0, 0.5]);
        let s = residual.norm_squared();
        let corrector = Corrector::new(&Quadratic, s);

        let mut r = residual.clone();
        let mut j = jacobian.clone();
        corrector.correct_jacobian(&residual, &mut j);
        corrector.correct_residuals(&mut r);

        // ∇(½ρ(||r||²)) = ρ'·Jᵀr
        let expected = jacobian.transpose() * &residual * Quadratic.evaluate(s)[1];
        let actual = j.transpose() * r;
        assert!((actual - expected).norm() < 1e-12);
    }
}
