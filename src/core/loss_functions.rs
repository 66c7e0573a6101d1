//! Robust loss functions.
//!
//! A loss function ρ(s) is applied to the squared norm `s = ||r||²` of a residual block.
//! The cost of a block is `½ ρ(s)`, and the [`Corrector`](crate::core::corrector::Corrector)
//! rewrites residuals and Jacobians so that the linear solvers see an equivalent
//! reweighted least squares problem.
//!
//! Every loss satisfies `ρ(0) = 0`, `ρ'(0) = 1` and behaves like `s` near the origin.
//!
//! | Loss | ρ(s) |
//! |------|------|
//! | [`HuberLoss`] | `s` for `s ≤ δ²`, `2δ√s − δ²` otherwise |
//! | [`SoftLOneLoss`] | `2δ²(√(1 + s/δ²) − 1)` |
//! | [`CauchyLoss`] | `δ² ln(1 + s/δ²)` |
//! | [`ArctanLoss`] | `δ atan(s/δ)` |
//!
//! # Example
//!
//! ```
//! use lsq_solver::core::loss_functions::{LossFunction, HuberLoss};
//! # fn example() -> lsq_solver::core::CoreResult<()> {
//! let huber = HuberLoss::new(1.345)?;
//! let [rho, rho_prime, _] = huber.evaluate(0.5);
//! assert_eq!(rho, 0.5);
//! assert_eq!(rho_prime, 1.0);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use crate::core::{CoreError, CoreResult};

/// Trait for robust loss functions.
pub trait LossFunction: Send + Sync {
    /// Evaluate `[ρ(s), ρ'(s), ρ''(s)]` at the squared residual norm `s ≥ 0`.
    fn evaluate(&self, s: f64) -> [f64; 3];
}

fn check_scale(name: &str, scale: f64) -> CoreResult<f64> {
    if scale <= 0.0 || !scale.is_finite() {
        return Err(CoreError::LossFunction(format!(
            "{name} scale needs to be a positive finite number, got {scale}"
        ))
        .log());
    }
    Ok(scale)
}

/// Huber loss: quadratic for inliers, linear for outliers.
#[derive(Debug, Clone)]
pub struct HuberLoss {
    scale: f64,
    scale2: f64,
}

impl HuberLoss {
    pub fn new(scale: f64) -> CoreResult<Self> {
        let scale = check_scale("Huber", scale)?;
        Ok(HuberLoss {
            scale,
            scale2: scale * scale,
        })
    }
}

impl LossFunction for HuberLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        if s > self.scale2 {
            // Outlier region: ρ(s) = 2δ√s − δ²
            let r = s.sqrt();
            let rho1 = (self.scale / r).max(f64::MIN_POSITIVE);
            [2.0 * self.scale * r - self.scale2, rho1, -rho1 / (2.0 * s)]
        } else {
            [s, 1.0, 0.0]
        }
    }
}

/// Smooth approximation of the L1 loss.
#[derive(Debug, Clone)]
pub struct SoftLOneLoss {
    b: f64,
    c: f64,
}

impl SoftLOneLoss {
    pub fn new(scale: f64) -> CoreResult<Self> {
        let scale = check_scale("SoftLOne", scale)?;
        let b = scale * scale;
        Ok(SoftLOneLoss { b, c: 1.0 / b })
    }
}

impl LossFunction for SoftLOneLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        let sum = 1.0 + s * self.c;
        let tmp = sum.sqrt();
        [
            2.0 * self.b * (tmp - 1.0),
            (1.0 / tmp).max(f64::MIN_POSITIVE),
            -(self.c * (1.0 / tmp)) / (2.0 * sum),
        ]
    }
}

/// Cauchy (Lorentzian) loss with logarithmic growth.
#[derive(Debug, Clone)]
pub struct CauchyLoss {
    b: f64,
    c: f64,
}

impl CauchyLoss {
    pub fn new(scale: f64) -> CoreResult<Self> {
        let scale = check_scale("Cauchy", scale)?;
        let b = scale * scale;
        Ok(CauchyLoss { b, c: 1.0 / b })
    }
}

impl LossFunction for CauchyLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        let sum = 1.0 + s * self.c;
        let inv = 1.0 / sum;
        [
            self.b * sum.ln(),
            inv.max(f64::MIN_POSITIVE),
            -self.c * (inv * inv),
        ]
    }
}

/// Arctangent loss, bounded by `δπ/2`.
#[derive(Debug, Clone)]
pub struct ArctanLoss {
    a: f64,
    b: f64,
}

impl ArctanLoss {
    pub fn new(scale: f64) -> CoreResult<Self> {
        let a = check_scale("Arctan", scale)?;
        Ok(ArctanLoss { a, b: 1.0 / (a * a) })
    }
}

impl LossFunction for ArctanLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        let sum = 1.0 + s * s * self.b;
        let inv = 1.0 / sum;
        [
            self.a * (s / self.a).atan(),
            inv.max(f64::MIN_POSITIVE),
            -2.0 * s * self.b * (inv * inv),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn numerical_derivatives(loss: &dyn LossFunction, s: f64, h: f64) -> (f64, f64) {
        let [rho_plus, _, _] = loss.evaluate(s + h);
        let [rho_minus, _, _] = loss.evaluate(s - h);
        let [rho, _, _] = loss.evaluate(s);
        (
            (rho_plus - rho_minus) / (2.0 * h),
            (rho_plus - 2.0 * rho + rho_minus) / (h * h),
        )
    }

    fn check_derivatives(loss: &dyn LossFunction, samples: &[f64]) {
        for &s in samples {
            let [_, rho1, rho2] = loss.evaluate(s);
            let (d1, d2) = numerical_derivatives(loss, s, 1e-4);
            assert!((rho1 - d1).abs() < 1e-6, "ρ' mismatch at s = {s}");
            assert!((rho2 - d2).abs() < 1e-4, "ρ'' mismatch at s = {s}");
        }
    }

    #[test]
    fn test_losses_behave_like_l2_at_origin() -> TestResult {
        let losses: Vec<Box<dyn LossFunction>> = vec![
            Box::new(HuberLoss::new(1.0)?),
            Box::new(SoftLOneLoss::new(1.0)?),
            Box::new(CauchyLoss::new(1.0)?),
            Box::new(ArctanLoss::new(1.0)?),
        ];
        for loss in &losses {
            let [rho, rho1, _] = loss.evaluate(0.0);
            assert_eq!(rho, 0.0);
            assert!((rho1 - 1.0).abs() < 1e-12);
        }
        Ok(())
    }

    #[test]
    fn test_loss_derivatives() -> TestResult {
        check_derivatives(&HuberLoss::new(1.0)?, &[0.25, 4.0, 9.0]);
        check_derivatives(&SoftLOneLoss::new(1.5)?, &[0.25, 4.0, 9.0]);
        check_derivatives(&CauchyLoss::new(2.0)?, &[0.25, 4.0, 9.0]);
        check_derivatives(&ArctanLoss::new(2.0)?, &[0.25, 4.0, 9.0]);
        Ok(())
    }

    #[test]
    fn test_robust_losses_downweight_outliers() -> TestResult {
        let [rho, rho1, _] = HuberLoss::new(1.0)?.evaluate(100.0);
        assert!(rho < 100.0);
        assert!(rho1 < 1.0);

        let [rho, rho1, _] = CauchyLoss::new(1.0)?.evaluate(100.0);
        assert!(rho < 10.0);
        assert!(rho1 < 0.05);
        Ok(())
    }

    #[test]
    fn test_invalid_scale_is_rejected() {
        assert!(HuberLoss::new(0.0).is_err());
        assert!(SoftLOneLoss::new(-1.0).is_err());
        assert!(CauchyLoss::new(f64::NAN).is_err());
        assert!(ArctanLoss::new(-0.5).is_err());
    }
}
