// Principal component analysis (PCA)

//! Decomposition adapter: preprocessing, the SVD call, and assembly of
//! [`PcaResult`].
//!
//! Explained-variance percentages default to the captured subspace: when
//! fewer components than the full rank are requested, `variance` sums to 100
//! over the requested components even though the matrix holds more variance.
//! Choose [`VarianceBasis::TotalVariance`] for shares of the total.

use crate::error::{PcaError, Result};
use crate::linalg_backends::SvdBackend;
use crate::matrix::FeatureMatrix;
use crate::metadata::Metadata;
use crate::model::{PcaParts, PcaResult, VarianceBasis};
use log::{debug, info};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

/// Divisors at or below this are treated as zero variance.
const ZERO_VARIANCE_THRESHOLD: f64 = 1e-12;

/// Options controlling preprocessing and the number of components.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PcaOptions {
    /// Subtract each feature's mean across samples.
    pub center: bool,
    /// Divide each feature by its standard deviation (root mean square when
    /// not centering).
    pub scale: bool,
    /// Components to compute; `None` means `max_components`.
    pub components: Option<usize>,
    pub variance_basis: VarianceBasis,
}

impl Default for PcaOptions {
    fn default() -> Self {
        Self {
            center: true,
            scale: false,
            components: None,
            variance_basis: VarianceBasis::CapturedSubspace,
        }
    }
}

/// Largest meaningful number of components: `min(F, S) - 1` when centering
/// (centering removes one degree of freedom), `min(F, S)` otherwise.
pub fn max_components(n_features: usize, n_samples: usize, center: bool) -> usize {
    let rank = n_features.min(n_samples);
    if center {
        rank.saturating_sub(1)
    } else {
        rank
    }
}

/// Matrix after centering/scaling, plus the vectors that were applied.
#[derive(Debug, Clone)]
pub(crate) struct Preprocessed {
    pub data: Array2<f64>,
    pub center: Option<Array1<f64>>,
    pub scale: Option<Array1<f64>>,
}

/// Center and/or scale every feature across samples.
///
/// # Errors
/// `DegenerateInput` for an empty matrix, or when scaling a feature whose
/// spread is zero.
pub(crate) fn preprocess(
    matrix: &FeatureMatrix,
    center: bool,
    scale: bool,
) -> Result<Preprocessed> {
    let (n_features, n_samples) = (matrix.n_features(), matrix.n_samples());
    if n_features == 0 || n_samples == 0 {
        return Err(PcaError::DegenerateInput(format!(
            "cannot decompose a {} features x {} samples matrix",
            n_features, n_samples
        )));
    }

    let mut data = matrix.data().to_owned();

    let center_vector = if center {
        let means = data.mean_axis(Axis(1)).ok_or_else(|| {
            PcaError::DegenerateInput("failed to compute feature means".to_string())
        })?;
        data -= &means.view().insert_axis(Axis(1));
        Some(means)
    } else {
        None
    };

    let scale_vector = if scale {
        let dof = (n_samples.max(2) - 1) as f64;
        let divisors = data.map_axis(Axis(1), |row| (row.dot(&row) / dof).sqrt());
        if let Some((i, d)) = divisors
            .iter()
            .enumerate()
            .find(|(_, d)| !(**d > ZERO_VARIANCE_THRESHOLD))
        {
            return Err(PcaError::DegenerateInput(format!(
                "feature '{}' has zero variance after centering (spread {}); cannot scale",
                matrix.feature_ids()[i],
                d
            )));
        }
        data /= &divisors.view().insert_axis(Axis(1));
        Some(divisors)
    } else {
        None
    };

    Ok(Preprocessed {
        data,
        center: center_vector,
        scale: scale_vector,
    })
}

/// Preprocess a surrogate of `observed`'s input the same way.
///
/// Centering uses the surrogate's own means. Scaling reuses the observed
/// divisors, so a surrogate feature that came out constant stays a zero row
/// instead of failing the zero-variance check.
pub(crate) fn preprocess_surrogate(
    surrogate: &FeatureMatrix,
    observed: &Preprocessed,
) -> Result<Array2<f64>> {
    let mut data = surrogate.data().to_owned();
    if observed.center.is_some() {
        let means = data.mean_axis(Axis(1)).ok_or_else(|| {
            PcaError::DegenerateInput("failed to compute surrogate feature means".to_string())
        })?;
        data -= &means.view().insert_axis(Axis(1));
    }
    if let Some(divisors) = &observed.scale {
        if divisors.len() != data.nrows() {
            return Err(PcaError::DimensionMismatch {
                context: "surrogate features".to_string(),
                expected: divisors.len(),
                actual: data.nrows(),
            });
        }
        data /= &divisors.view().insert_axis(Axis(1));
    }
    Ok(data)
}

/// Run the decomposition and assemble a [`PcaResult`].
///
/// * `matrix` - features × samples input, usually after variance filtering.
/// * `metadata` - optional sample metadata; every metadata sample must be a
///   matrix sample.
/// * `options` - preprocessing and component count.
/// * `backend` - the SVD implementation.
///
/// # Errors
/// `DimensionMismatch` if metadata cannot be aligned, `DegenerateInput` for
/// empty input or a zero-variance feature under scaling,
/// `InsufficientSamples` when no component can be computed, `RankExceeded`
/// when more components are requested than the data supports.
pub fn run_pca<B: SvdBackend + ?Sized>(
    matrix: &FeatureMatrix,
    metadata: Option<Metadata>,
    options: &PcaOptions,
    backend: &B,
) -> Result<PcaResult> {
    let (n_features, n_samples) = (matrix.n_features(), matrix.n_samples());

    if let Some(meta) = &metadata {
        meta.check_alignment(matrix.sample_ids())?;
    }

    let max_k = max_components(n_features, n_samples, options.center);
    if max_k == 0 {
        return Err(PcaError::InsufficientSamples {
            context: "decomposition".to_string(),
            required: if options.center { 2 } else { 1 },
            actual: n_samples,
        });
    }
    let k = options.components.unwrap_or(max_k);
    if k == 0 {
        return Err(PcaError::invalid("components", "at least one component is required"));
    }
    if k > max_k {
        return Err(PcaError::RankExceeded {
            requested: k,
            rank: max_k,
        });
    }

    info!(
        "Running PCA on {} features x {} samples (k={}, center={}, scale={}).",
        n_features, n_samples, k, options.center, options.scale
    );

    let prepared = preprocess(matrix, options.center, options.scale)?;
    let svd = backend.truncated_svd(prepared.data.view(), k)?;

    if svd.singular_values.len() != k
        || svd.left.dim() != (n_features, k)
        || svd.right.dim() != (n_samples, k)
    {
        return Err(PcaError::Decomposition(format!(
            "backend returned s={}, left={:?}, right={:?} for k={} on {}x{}",
            svd.singular_values.len(),
            svd.left.dim(),
            svd.right.dim(),
            k,
            n_features,
            n_samples
        )));
    }

    // enforce descending order regardless of backend
    let mut order: Vec<usize> = (0..k).collect();
    order.sort_by(|&a, &b| {
        svd.singular_values[b]
            .partial_cmp(&svd.singular_values[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let singular_values: Array1<f64> = order.iter().map(|&i| svd.singular_values[i]).collect();
    let loadings = svd.left.select(Axis(1), &order);
    let right = svd.right.select(Axis(1), &order);
    let scores = &right * &singular_values;

    let total_sum_of_squares = prepared.data.iter().map(|x| x * x).sum::<f64>();
    if options.variance_basis == VarianceBasis::CapturedSubspace && k < max_k {
        info!(
            "Explained variance is relative to the {} captured components, \
             not the full rank of {}.",
            k, max_k
        );
    }
    debug!("Leading singular values: {:?}", singular_values.iter().take(5).collect::<Vec<_>>());

    PcaResult::new(PcaParts {
        sample_ids: matrix.sample_ids().to_vec(),
        feature_ids: matrix.feature_ids().to_vec(),
        scores,
        loadings,
        singular_values,
        total_sum_of_squares,
        variance_basis: options.variance_basis,
        center: prepared.center,
        scale: prepared.scale,
        metadata,
    })
}

/// Eigenvalues σ²/(n − 1) of the top `k` components of a preprocessed matrix.
pub(crate) fn eigenvalues_of<B: SvdBackend + ?Sized>(
    data: &Array2<f64>,
    k: usize,
    backend: &B,
) -> Result<Array1<f64>> {
    let dof = (data.ncols().max(2) - 1) as f64;
    let svd = backend.truncated_svd(data.view(), k)?;
    let mut values: Vec<f64> = svd.singular_values.iter().map(|s| s * s / dof).collect();
    values.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    Ok(Array1::from(values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg_backends::{ExactSvd, RandomizedSvd};
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn random_matrix(rows: usize, cols: usize, seed: u64) -> FeatureMatrix {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let data = Array2::from_shape_fn((rows, cols), |_| rng.gen_range(0.0..10.0));
        FeatureMatrix::from_array(data).unwrap()
    }

    #[test]
    fn variance_is_non_increasing_and_bounded() {
        for seed in 0..5 {
            let m = random_matrix(40, 12, seed);
            let result = run_pca(&m, None, &PcaOptions::default(), &ExactSvd).unwrap();
            let var = result.variance();
            assert_eq!(var.len(), 11);
            for w in var.windows(2) {
                assert!(w[0] >= w[1], "variance increased: {:?}", var);
            }
            for v in var.iter() {
                assert!((0.0..=100.0).contains(v));
            }
            assert_abs_diff_eq!(result.cumulative_variance()[10], 100.0, epsilon = 1e-8);
        }
    }

    #[test]
    fn shapes_follow_request() {
        let m = random_matrix(1000, 50, 42);
        let opts = PcaOptions {
            components: Some(10),
            ..Default::default()
        };
        let result = run_pca(&m, None, &opts, &ExactSvd).unwrap();
        assert_eq!(result.scores().dim(), (50, 10));
        assert_eq!(result.loadings().dim(), (1000, 10));
        assert_eq!(result.components().len(), 10);
        assert_eq!(result.components()[0], "PC1");
        assert_eq!(result.sample_scores("sample_50").unwrap().len(), 10);
    }

    #[test]
    fn total_variance_basis_is_below_captured_for_truncated_request() {
        let m = random_matrix(30, 15, 3);
        let captured = run_pca(
            &m,
            None,
            &PcaOptions {
                components: Some(3),
                ..Default::default()
            },
            &ExactSvd,
        )
        .unwrap();
        let total = run_pca(
            &m,
            None,
            &PcaOptions {
                components: Some(3),
                variance_basis: VarianceBasis::TotalVariance,
                ..Default::default()
            },
            &ExactSvd,
        )
        .unwrap();
        assert_abs_diff_eq!(captured.variance().sum(), 100.0, epsilon = 1e-9);
        assert!(total.variance().sum() < 100.0);
        assert!(total.variance()[0] < captured.variance()[0]);
    }

    #[test]
    fn eigenvalues_match_feature_variances_total() {
        // with full rank, eigenvalues sum to the summed feature variances
        let m = random_matrix(20, 8, 9);
        let result = run_pca(&m, None, &PcaOptions::default(), &ExactSvd).unwrap();
        let total_var: f64 = m.feature_variances().sum();
        assert_abs_diff_eq!(result.eigenvalues().sum(), total_var, epsilon = 1e-8);
    }

    #[test]
    fn constant_duplicated_feature_fails_under_scaling() {
        let m = FeatureMatrix::from_array(array![
            [1.0, 2.0, 3.0, 4.0],
            [7.0, 7.0, 7.0, 7.0],
            [7.0, 7.0, 7.0, 7.0],
            [4.0, 1.0, 3.0, 2.0]
        ])
        .unwrap();
        let opts = PcaOptions {
            scale: true,
            ..Default::default()
        };
        match run_pca(&m, None, &opts, &ExactSvd) {
            Err(PcaError::DegenerateInput(msg)) => assert!(msg.contains("feature_2")),
            other => panic!("expected DegenerateInput, got {:?}", other.map(|r| r.n_components())),
        }
        // without scaling the same matrix decomposes
        assert!(run_pca(&m, None, &PcaOptions::default(), &ExactSvd).is_ok());
    }

    #[test]
    fn metadata_with_foreign_sample_is_rejected() {
        let m = random_matrix(5, 4, 1);
        let mut meta = Metadata::new(vec!["sample_1".into(), "ghost".into()]).unwrap();
        meta.add_numeric("age", vec![Some(1.0), Some(2.0)]).unwrap();
        let err = run_pca(&m, Some(meta), &PcaOptions::default(), &ExactSvd).unwrap_err();
        assert!(matches!(err, PcaError::DimensionMismatch { .. }));
    }

    #[test]
    fn too_many_components_is_rank_error() {
        let m = random_matrix(10, 5, 2);
        let opts = PcaOptions {
            components: Some(5),
            ..Default::default()
        };
        assert!(matches!(
            run_pca(&m, None, &opts, &ExactSvd),
            Err(PcaError::RankExceeded { requested: 5, rank: 4 })
        ));
    }

    #[test]
    fn scores_equal_projection_of_training_data() {
        let m = random_matrix(12, 9, 5);
        let opts = PcaOptions {
            scale: true,
            components: Some(4),
            ..Default::default()
        };
        let result = run_pca(&m, None, &opts, &ExactSvd).unwrap();
        let projected = result.project(&m).unwrap();
        for (a, b) in projected.iter().zip(result.scores().iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-8);
        }
    }

    #[test]
    fn randomized_backend_agrees_on_variance() {
        let m = random_matrix(200, 30, 8);
        let opts = PcaOptions {
            components: Some(5),
            variance_basis: VarianceBasis::TotalVariance,
            ..Default::default()
        };
        let exact = run_pca(&m, None, &opts, &ExactSvd).unwrap();
        let randomized = run_pca(
            &m,
            None,
            &opts,
            // sketch as wide as the sample count, so the range is captured exactly
            &RandomizedSvd {
                oversamples: 30,
                power_iterations: 1,
                seed: 1,
            },
        )
        .unwrap();
        assert_abs_diff_eq!(exact.variance()[0], randomized.variance()[0], epsilon = 1e-3);
    }

    #[test]
    fn top_loadings_sorted_by_magnitude() {
        let m = random_matrix(15, 6, 4);
        let result = run_pca(&m, None, &PcaOptions::default(), &ExactSvd).unwrap();
        let top = result.top_loadings("PC1", 3).unwrap();
        assert_eq!(top.len(), 3);
        assert!(top[0].1.abs() >= top[1].1.abs());
        assert!(top[1].1.abs() >= top[2].1.abs());
        assert!(result.top_loadings("PC99", 1).is_err());
    }
}
