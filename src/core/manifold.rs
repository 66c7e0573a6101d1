//! Local parameterizations of parameter blocks.
//!
//! A manifold maps a tangent-space increment `delta` to an updated ambient point
//! `x ⊞ delta`. The solver works entirely in tangent coordinates: Jacobians are projected
//! through [`Manifold::plus_jacobian`] and steps are applied with [`Manifold::plus`].

use nalgebra::{DMatrix, DVector, Quaternion};

use crate::core::{CoreError, CoreResult};

/// Trait for manifolds attached to parameter blocks.
pub trait Manifold: Send + Sync {
    /// Size of the ambient representation.
    fn ambient_size(&self) -> usize;

    /// Dimension of the tangent space.
    fn tangent_size(&self) -> usize;

    /// Compute `x ⊞ delta`.
    fn plus(&self, x: &[f64], delta: &[f64]) -> DVector<f64>;

    /// Jacobian of `x ⊞ delta` with respect to `delta` at `delta = 0`,
    /// an `ambient_size × tangent_size` matrix.
    fn plus_jacobian(&self, x: &[f64]) -> DMatrix<f64>;
}

/// Holds a subset of the coordinates of a block constant.
#[derive(Debug, Clone)]
pub struct SubsetManifold {
    size: usize,
    free: Vec<usize>,
}

impl SubsetManifold {
    pub fn new(size: usize, constant_indices: &[usize]) -> CoreResult<Self> {
        let mut constant = vec![false; size];
        for &i in constant_indices {
            if i >= size {
                return Err(CoreError::InvalidInput(format!(
                    "constant index {i} out of range for block of size {size}"
                ))
                .log());
            }
            if constant[i] {
                return Err(
                    CoreError::InvalidInput(format!("constant index {i} listed twice")).log(),
                );
            }
            constant[i] = true;
        }
        let free: Vec<usize> = (0..size).filter(|&i| !constant[i]).collect();
        if free.is_empty() {
            return Err(CoreError::InvalidInput(
                "subset manifold must leave at least one coordinate free; mark the block constant instead"
                    .to_string(),
            )
            .log());
        }
        Ok(Self { size, free })
    }
}

impl Manifold for SubsetManifold {
    fn ambient_size(&self) -> usize {
        self.size
    }

    fn tangent_size(&self) -> usize {
        self.free.len()
    }

    fn plus(&self, x: &[f64], delta: &[f64]) -> DVector<f64> {
        let mut out = DVector::from_column_slice(x);
        for (k, &i) in self.free.iter().enumerate() {
            out[i] += delta[k];
        }
        out
    }

    fn plus_jacobian(&self, _x: &[f64]) -> DMatrix<f64> {
        let mut jacobian = DMatrix::zeros(self.size, self.free.len());
        for (k, &i) in self.free.iter().enumerate() {
            jacobian[(i, k)] = 1.0;
        }
        jacobian
    }
}

/// Unit quaternions stored as `[w, x, y, z]` with a 3-dimensional tangent space.
///
/// `x ⊞ delta = [cos|δ|, sin|δ|/|δ| · δ] ⊗ x`.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuaternionManifold;

impl Manifold for QuaternionManifold {
    fn ambient_size(&self) -> usize {
        4
    }

    fn tangent_size(&self) -> usize {
        3
    }

    fn plus(&self, x: &[f64], delta: &[f64]) -> DVector<f64> {
        let norm_delta = (delta[0] * delta[0] + delta[1] * delta[1] + delta[2] * delta[2]).sqrt();
        if norm_delta == 0.0 {
            return DVector::from_column_slice(x);
        }
        let scale = norm_delta.sin() / norm_delta;
        let q_delta = Quaternion::new(
            norm_delta.cos(),
            scale * delta[0],
            scale * delta[1],
            scale * delta[2],
        );
        let q = Quaternion::new(x[0], x[1], x[2], x[3]);
        let r = q_delta * q;
        DVector::from_vec(vec![r.w, r.i, r.j, r.k])
    }

    fn plus_jacobian(&self, x: &[f64]) -> DMatrix<f64> {
        #[rustfmt::skip]
        let jacobian = DMatrix::from_row_slice(4, 3, &[
            -x[1], -x[2], -x[3],
             x[0],  x[3], -x[2],
            -x[3],  x[0],  x[1],
             x[2], -x[1],  x[0],
        ]);
        jacobian
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_subset_manifold_keeps_constant_coordinates() -> TestResult {
        let manifold = SubsetManifold::new(3, &[1])?;
        assert_eq!(manifold.tangent_size(), 2);

        let x = [1.0, 2.0, 3.0];
        let updated = manifold.plus(&x, &[0.5, -1.0]);
        assert_eq!(updated.as_slice(), &[1.5, 2.0, 2.0]);

        let jacobian = manifold.plus_jacobian(&x);
        assert_eq!(jacobian.shape(), (3, 2));
        assert_eq!(jacobian[(0, 0)], 1.0);
        assert_eq!(jacobian[(2, 1)], 1.0);
        assert_eq!(jacobian.row(1).sum(), 0.0);
        Ok(())
    }

    #[test]
    fn test_subset_manifold_rejects_bad_indices() {
        assert!(SubsetManifold::new(3, &[3]).is_err());
        assert!(SubsetManifold::new(3, &[0, 0]).is_err());
        assert!(SubsetManifold::new(2, &[0, 1]).is_err());
    }

    #[test]
    fn test_quaternion_plus_preserves_unit_norm() {
        let manifold = QuaternionManifold;
        let x = [1.0, 0.0, 0.0, 0.0];
        let updated = manifold.plus(&x, &[0.1, -0.2, 0.3]);
        assert!((updated.norm() - 1.0).abs() < 1e-12);

        let unchanged = manifold.plus(&x, &[0.0, 0.0, 0.0]);
        assert_eq!(unchanged.as_slice(), &x);
    }

    #[test]
    fn test_quaternion_plus_jacobian_matches_finite_difference() {
        let manifold = QuaternionManifold;
        let x = [0.5_f64.sqrt(), 0.5_f64.sqrt(), 0.0, 0.0];
        let jacobian = manifold.plus_jacobian(&x);
        let h = 1e-7;
        for k in 0..3 {
            let mut delta = [0.0; 3];
            delta[k] = h;
            let forward = manifold.plus(&x, &delta);
            for i in 0..4 {
                let numeric = (forward[i] - x[i]) / h;
                assert!((numeric - jacobian[(i, k)]).abs() < 1e-5);
            }
        }
    }
}
