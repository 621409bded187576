// src/linalg_backends.rs

//! Truncated SVD backends.
//!
//! The decomposition adapter and parallel analysis only talk to the
//! [`SvdBackend`] trait. Two implementations are provided on top of
//! ndarray-linalg: an exact one using the covariance/Gram trick and a
//! randomized sketch for large inputs.

use crate::error::{PcaError, Result};
use log::trace;
use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use ndarray_linalg::{Eigh, SVDInto, QR, UPLO};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// Threshold below which a singular vector's norm is treated as zero.
const NORMALIZATION_THRESHOLD: f64 = 1e-9;

/// Output of a rank-k Singular Value Decomposition `X ≈ L diag(s) Rᵀ`.
#[derive(Debug, Clone)]
pub struct SvdOutput {
    /// Singular values, length k, descending and non-negative.
    pub singular_values: Array1<f64>,
    /// Left singular vectors. Shape: (rows, k)
    pub left: Array2<f64>,
    /// Right singular vectors. Shape: (cols, k)
    pub right: Array2<f64>,
}

/// Contract for the factorization step.
///
/// Implementations receive the already centered (and possibly scaled)
/// matrix and must return the top-`k` singular triplets. Asking for more
/// components than `min(rows, cols)` must fail with
/// [`PcaError::RankExceeded`].
pub trait SvdBackend: Send + Sync {
    fn truncated_svd(&self, matrix: ArrayView2<'_, f64>, k: usize) -> Result<SvdOutput>;
}

impl<T: SvdBackend + ?Sized> SvdBackend for &T {
    fn truncated_svd(&self, matrix: ArrayView2<'_, f64>, k: usize) -> Result<SvdOutput> {
        (**self).truncated_svd(matrix, k)
    }
}

fn check_request(matrix: &ArrayView2<'_, f64>, k: usize) -> Result<()> {
    let (rows, cols) = matrix.dim();
    if rows == 0 || cols == 0 {
        return Err(PcaError::DegenerateInput(format!(
            "cannot decompose a {}x{} matrix",
            rows, cols
        )));
    }
    if k == 0 {
        return Err(PcaError::invalid("components", "at least one component is required"));
    }
    let rank = rows.min(cols);
    if k > rank {
        return Err(PcaError::RankExceeded { requested: k, rank });
    }
    Ok(())
}

/// Scale every column to unit length; columns with a near-zero norm become zero.
fn normalize_columns(mut vectors: Array2<f64>) -> Array2<f64> {
    for mut column in vectors.columns_mut() {
        let norm = column.dot(&column).sqrt();
        if norm > NORMALIZATION_THRESHOLD {
            column.mapv_inplace(|x| x / norm);
        } else {
            column.fill(0.0);
        }
    }
    vectors
}

/// Exact truncated SVD through an eigendecomposition of the smaller Gram matrix.
///
/// For a `rows × cols` matrix X with `cols <= rows`, XᵀX = R Σ² Rᵀ gives the
/// right vectors and L = X R Σ⁻¹; otherwise XXᵀ is decomposed and the roles swap.
#[derive(Debug, Default, Copy, Clone, Serialize, Deserialize)]
pub struct ExactSvd;

impl ExactSvd {
    fn leading_eigenpairs(
        gram: Array2<f64>,
        k: usize,
    ) -> Result<(Array1<f64>, Array2<f64>)> {
        let (eigenvalues, eigenvectors) = gram.eigh(UPLO::Upper).map_err(|e| {
            PcaError::Decomposition(format!("eigendecomposition of Gram matrix failed: {}", e))
        })?;

        let mut order: Vec<usize> = (0..eigenvalues.len()).collect();
        order.sort_by(|&a, &b| {
            eigenvalues[b]
                .partial_cmp(&eigenvalues[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        order.truncate(k);

        let singular_values: Array1<f64> = order
            .iter()
            .map(|&i| eigenvalues[i].max(0.0).sqrt())
            .collect();
        let vectors = eigenvectors.select(Axis(1), &order);
        Ok((singular_values, normalize_columns(vectors)))
    }
}

impl SvdBackend for ExactSvd {
    fn truncated_svd(&self, matrix: ArrayView2<'_, f64>, k: usize) -> Result<SvdOutput> {
        check_request(&matrix, k)?;
        let (rows, cols) = matrix.dim();

        if cols <= rows {
            let gram = matrix.t().dot(&matrix);
            let (singular_values, right) = Self::leading_eigenpairs(gram, k)?;
            let left = normalize_columns(matrix.dot(&right));
            trace!("ExactSvd: {}x{} via {}x{} Gram, k={}", rows, cols, cols, cols, k);
            Ok(SvdOutput {
                singular_values,
                left,
                right,
            })
        } else {
            let gram = matrix.dot(&matrix.t());
            let (singular_values, left) = Self::leading_eigenpairs(gram, k)?;
            let right = normalize_columns(matrix.t().dot(&left));
            trace!("ExactSvd: {}x{} via {}x{} Gram, k={}", rows, cols, rows, rows, k);
            Ok(SvdOutput {
                singular_values,
                left,
                right,
            })
        }
    }
}

/// Randomized truncated SVD (Halko, Martinsson & Tropp, 2011).
///
/// The range of X is sketched with a Gaussian test matrix of width
/// `k + oversamples`, refined with QR-stabilised power iterations, and the
/// small projected matrix `QᵀX` is decomposed exactly. Results are
/// approximate but reproducible for a fixed `seed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RandomizedSvd {
    /// Extra sketch columns beyond `k`.
    pub oversamples: usize,
    /// Number of power iterations.
    pub power_iterations: usize,
    /// Seed for the Gaussian test matrix.
    pub seed: u64,
}

impl Default for RandomizedSvd {
    fn default() -> Self {
        Self {
            oversamples: 10,
            power_iterations: 2,
            seed: 2025,
        }
    }
}

impl RandomizedSvd {
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed,
            ..Default::default()
        }
    }
}

fn q_factor(matrix: &Array2<f64>, what: &str) -> Result<Array2<f64>> {
    let (q, _r) = matrix.qr().map_err(|e| {
        PcaError::Decomposition(format!("QR decomposition of {} failed: {}", what, e))
    })?;
    Ok(q)
}

impl SvdBackend for RandomizedSvd {
    fn truncated_svd(&self, matrix: ArrayView2<'_, f64>, k: usize) -> Result<SvdOutput> {
        check_request(&matrix, k)?;
        let (rows, cols) = matrix.dim();
        let sketch_width = (k + self.oversamples).min(rows.min(cols));

        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let omega: Array2<f64> =
            Array2::from_shape_fn((cols, sketch_width), |_| rng.sample(StandardNormal));

        // Y = X Ω, orthonormalised
        let mut basis = q_factor(&matrix.dot(&omega), "initial sketch")?;
        for i in 0..self.power_iterations {
            let w = q_factor(&matrix.t().dot(&basis), "power iteration (Xᵀ Q)")?;
            basis = q_factor(&matrix.dot(&w), "power iteration (X W)")?;
            trace!("RandomizedSvd: power iteration {} done", i);
        }

        // B = QᵀX is sketch_width × cols; only its left vectors are needed
        let projected = basis.t().dot(&matrix);
        let (u_projected, sigma, _vt) = projected.svd_into(true, false).map_err(|e| {
            PcaError::Decomposition(format!("SVD of projected sketch failed: {}", e))
        })?;
        let u_projected = u_projected.ok_or_else(|| {
            PcaError::Decomposition("SVD of projected sketch returned no left vectors".to_string())
        })?;

        let kept = k.min(sigma.len());
        if kept < k {
            return Err(PcaError::RankExceeded {
                requested: k,
                rank: kept,
            });
        }
        let left = normalize_columns(basis.dot(&u_projected.slice(s![.., ..kept])));
        let right = normalize_columns(matrix.t().dot(&left));

        Ok(SvdOutput {
            singular_values: sigma.slice(s![..kept]).to_owned(),
            left,
            right,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn random_matrix(rows: usize, cols: usize, seed: u64) -> Array2<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-1.0..1.0))
    }

    fn reconstruct(out: &SvdOutput) -> Array2<f64> {
        let scaled = &out.left * &out.singular_values;
        scaled.dot(&out.right.t())
    }

    #[test]
    fn exact_svd_reconstructs_full_rank_tall() {
        let x = random_matrix(12, 5, 1);
        let out = ExactSvd.truncated_svd(x.view(), 5).unwrap();
        let rebuilt = reconstruct(&out);
        for (a, b) in x.iter().zip(rebuilt.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-8);
        }
    }

    #[test]
    fn exact_svd_reconstructs_full_rank_wide() {
        let x = random_matrix(4, 9, 2);
        let out = ExactSvd.truncated_svd(x.view(), 4).unwrap();
        let rebuilt = reconstruct(&out);
        for (a, b) in x.iter().zip(rebuilt.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-8);
        }
    }

    #[test]
    fn singular_values_descend() {
        let x = random_matrix(30, 8, 3);
        let out = ExactSvd.truncated_svd(x.view(), 6).unwrap();
        assert_eq!(out.singular_values.len(), 6);
        assert_eq!(out.left.dim(), (30, 6));
        assert_eq!(out.right.dim(), (8, 6));
        for w in out.singular_values.windows(2) {
            assert!(w[0] >= w[1]);
        }
    }

    #[test]
    fn known_diagonal_matrix() {
        let x = array![[3.0, 0.0], [0.0, 1.0], [0.0, 0.0]];
        let out = ExactSvd.truncated_svd(x.view(), 2).unwrap();
        assert_abs_diff_eq!(out.singular_values[0], 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out.singular_values[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn rank_request_above_dimensions_is_distinguishable() {
        let x = random_matrix(6, 3, 4);
        match ExactSvd.truncated_svd(x.view(), 4) {
            Err(PcaError::RankExceeded { requested, rank }) => {
                assert_eq!(requested, 4);
                assert_eq!(rank, 3);
            }
            other => panic!("expected RankExceeded, got {:?}", other.map(|o| o.singular_values)),
        }
        assert!(matches!(
            RandomizedSvd::default().truncated_svd(x.view(), 4),
            Err(PcaError::RankExceeded { .. })
        ));
    }

    #[test]
    fn randomized_matches_exact_on_low_rank_data() {
        // rank-3 signal plus tiny noise
        let a = random_matrix(60, 3, 5);
        let b = random_matrix(3, 20, 6);
        let noise = random_matrix(60, 20, 7) * 1e-6;
        let x = a.dot(&b) + noise;

        let exact = ExactSvd.truncated_svd(x.view(), 3).unwrap();
        let approx = RandomizedSvd::with_seed(9).truncated_svd(x.view(), 3).unwrap();
        for (e, r) in exact.singular_values.iter().zip(approx.singular_values.iter()) {
            assert_abs_diff_eq!(e, r, epsilon = 1e-4);
        }
    }

    #[test]
    fn randomized_is_deterministic_for_seed() {
        let x = random_matrix(25, 10, 8);
        let backend = RandomizedSvd::with_seed(77);
        let first = backend.truncated_svd(x.view(), 4).unwrap();
        let second = backend.truncated_svd(x.view(), 4).unwrap();
        assert_eq!(first.singular_values, second.singular_values);
        assert_eq!(first.left, second.left);
    }
}
