//! Horn's parallel analysis.
//!
//! Observed eigenvalues are compared against eigenvalues of surrogate
//! matrices in which each feature is permuted (or resampled, or simulated)
//! independently across samples. Surrogates keep each feature's marginal
//! distribution but destroy cross-feature structure, so a component whose
//! observed eigenvalue does not beat the surrogate summary is treated as
//! noise.
//!
//! # Algorithm
//!
//! 1. Preprocess the data as the decomposition would and compute observed
//!    eigenvalues
//! 2. Build `n_permutations` surrogates, preprocess them with the observed
//!    scaling, and compute their eigenvalues (in parallel)
//! 3. Summarise surrogate eigenvalues per rank (mean or percentile)
//! 4. Retain components in rank order while observed > null; the first tie or
//!    loss stops the scan
//!
//! Every iteration draws from its own ChaCha8 stream of the base seed, so
//! results do not depend on thread scheduling. Without a caller seed one is
//! drawn from the OS, logged, and reported in the result with `seeded = false`.

use crate::error::{PcaError, Result};
use crate::linalg_backends::SvdBackend;
use crate::matrix::FeatureMatrix;
use crate::pca::{eigenvalues_of, max_components, preprocess, preprocess_surrogate, PcaOptions};
use float_cmp::approx_eq;
use log::{debug, info, warn};
use ndarray::{Array1, Array2, Axis};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Fewest samples for which permuting a feature is meaningful.
pub const MIN_SAMPLES: usize = 4;

/// Relative tolerance under which observed and null eigenvalues count as tied.
const TIE_EPSILON: f64 = 1e-12;

/// How surrogate matrices are generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NullModel {
    /// Independent permutation of each feature's values across samples.
    #[default]
    Permute,
    /// Bootstrap resampling (with replacement) within each feature.
    Resample,
    /// Gaussian values with each feature's own mean and standard deviation.
    Gaussian,
}

/// Per-rank summary of the surrogate eigenvalues.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum NullSummary {
    Mean,
    /// Percentile in (0, 100], linear interpolation between order statistics.
    Percentile(f64),
}

impl Default for NullSummary {
    fn default() -> Self {
        NullSummary::Percentile(95.0)
    }
}

/// What to do when a single iteration fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Fail the whole call with the iteration's error.
    #[default]
    Strict,
    /// Log and exclude the failed iteration; the count is reported.
    BestEffort,
}

/// What to do when the run is cancelled before all iterations start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CancelPolicy {
    /// Return `PcaError::Cancelled`.
    #[default]
    Discard,
    /// Aggregate completed iterations and flag the result as partial.
    UsePartial,
}

/// Cooperative cancellation flag, checked before each iteration starts.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Configuration for parallel analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelAnalysisConfig {
    /// Number of surrogate matrices. Must be positive.
    pub n_permutations: usize,
    /// Base seed. `None` draws one from the OS (results then vary run to run).
    pub seed: Option<u64>,
    pub null_model: NullModel,
    pub summary: NullSummary,
    /// Cap on the number of ranks compared; `None` compares every available rank.
    pub max_components: Option<usize>,
    pub failure_policy: FailurePolicy,
    pub cancel_policy: CancelPolicy,
    /// Run iterations on the rayon pool.
    pub parallel: bool,
}

impl Default for ParallelAnalysisConfig {
    fn default() -> Self {
        Self {
            n_permutations: 50,
            seed: None,
            null_model: NullModel::Permute,
            summary: NullSummary::Percentile(95.0),
            max_components: None,
            failure_policy: FailurePolicy::Strict,
            cancel_policy: CancelPolicy::Discard,
            parallel: true,
        }
    }
}

impl ParallelAnalysisConfig {
    pub fn seeded(seed: u64) -> Self {
        Self {
            seed: Some(seed),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_permutations == 0 {
            return Err(PcaError::invalid("nPermutations", "must be at least 1, got 0"));
        }
        if let NullSummary::Percentile(p) = self.summary {
            if !(p > 0.0 && p <= 100.0) {
                return Err(PcaError::invalid(
                    "null summary percentile",
                    format!("must lie in (0, 100], got {}", p),
                ));
            }
        }
        if self.max_components == Some(0) {
            return Err(PcaError::invalid("max_components", "must be at least 1"));
        }
        Ok(())
    }
}

/// Outcome of parallel analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelAnalysisResult {
    /// Number of components to retain.
    pub n: usize,
    /// Observed eigenvalues, descending.
    pub observed: Array1<f64>,
    /// Null summary per rank.
    pub null: Array1<f64>,
    pub summary: NullSummary,
    pub null_model: NullModel,
    pub n_requested: usize,
    pub n_completed: usize,
    /// Iterations excluded under `FailurePolicy::BestEffort`.
    pub n_failed: usize,
    /// Iterations never started because of cancellation.
    pub n_skipped: usize,
    /// Base seed actually used.
    pub seed: u64,
    /// Whether the seed was supplied by the caller.
    pub seeded: bool,
    /// True when the summary aggregates fewer iterations than requested.
    pub partial: bool,
}

enum IterationOutcome {
    Done(Array1<f64>),
    Failed(PcaError),
    Skipped,
}

/// Build one surrogate matrix with the same shape and labels.
pub(crate) fn null_matrix(
    matrix: &FeatureMatrix,
    model: NullModel,
    rng: &mut ChaCha8Rng,
) -> FeatureMatrix {
    let data = matrix.data();
    let n_samples = matrix.n_samples();
    let surrogate = match model {
        NullModel::Permute => {
            let mut out = data.to_owned();
            for mut row in out.axis_iter_mut(Axis(0)) {
                let mut values = row.to_vec();
                values.shuffle(rng);
                row.assign(&Array1::from(values));
            }
            out
        }
        NullModel::Resample => Array2::from_shape_fn(data.dim(), |(i, _)| {
            data[[i, rng.gen_range(0..n_samples)]]
        }),
        NullModel::Gaussian => {
            let mut z: Array2<f64> = Array2::random_using(data.dim(), StandardNormal, rng);
            let ddof = if n_samples > 1 { 1.0 } else { 0.0 };
            for (mut z_row, row) in z.axis_iter_mut(Axis(0)).zip(data.axis_iter(Axis(0))) {
                let mean = row.mean().unwrap_or(0.0);
                let sd = row.std(ddof);
                z_row.mapv_inplace(|v| mean + sd * v);
            }
            z
        }
    };
    matrix.with_data(surrogate)
}

/// Linear-interpolated percentile of unsorted values.
fn percentile(values: &mut [f64], p: f64) -> f64 {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = values.len();
    if n == 1 {
        return values[0];
    }
    let h = (n - 1) as f64 * p / 100.0;
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    values[lo] + (h - lo as f64) * (values[hi] - values[lo])
}

fn summarise(runs: &[Array1<f64>], k: usize, summary: NullSummary) -> Array1<f64> {
    Array1::from_shape_fn(k, |j| {
        let mut column: Vec<f64> = runs.iter().map(|r| r[j]).collect();
        match summary {
            NullSummary::Mean => column.iter().sum::<f64>() / column.len() as f64,
            NullSummary::Percentile(p) => percentile(&mut column, p),
        }
    })
}

/// Components retained: leading ranks whose observed eigenvalue strictly
/// exceeds the null value. Ties reject.
pub fn retained_components(observed: &[f64], null: &[f64]) -> usize {
    observed
        .iter()
        .zip(null.iter())
        .take_while(|(&o, &n)| {
            let tied = approx_eq!(f64, o, n, epsilon = TIE_EPSILON * o.abs().max(1.0), ulps = 4);
            o > n && !tied
        })
        .count()
}

/// Run Horn's parallel analysis on a features × samples matrix.
///
/// `pca_options` supplies the preprocessing (`center`, `scale`); its
/// component count is ignored in favour of `config.max_components`.
///
/// # Errors
/// `InvalidParameter` for a bad config (e.g. zero permutations),
/// `InsufficientSamples` below [`MIN_SAMPLES`], `DegenerateInput` from
/// preprocessing, `IterationFailed` under the strict failure policy,
/// `Cancelled` when cancelled under the discard policy.
pub fn parallel_analysis<B: SvdBackend + ?Sized>(
    matrix: &FeatureMatrix,
    pca_options: &PcaOptions,
    config: &ParallelAnalysisConfig,
    backend: &B,
    cancel: Option<&CancellationToken>,
) -> Result<ParallelAnalysisResult> {
    config.validate()?;

    let (n_features, n_samples) = (matrix.n_features(), matrix.n_samples());
    if n_samples < MIN_SAMPLES {
        return Err(PcaError::InsufficientSamples {
            context: "parallel analysis".to_string(),
            required: MIN_SAMPLES,
            actual: n_samples,
        });
    }

    let available = max_components(n_features, n_samples, pca_options.center);
    let k = config.max_components.map_or(available, |m| m.min(available));
    if k == 0 {
        return Err(PcaError::InsufficientComponents {
            context: "parallel analysis".to_string(),
            required: 1,
            actual: 0,
        });
    }

    let prepared = preprocess(matrix, pca_options.center, pca_options.scale)?;
    let observed = eigenvalues_of(&prepared.data, k, backend)?;

    let (seed, seeded) = match config.seed {
        Some(s) => (s, true),
        None => {
            let s: u64 = ChaCha8Rng::from_entropy().gen();
            warn!(
                "Parallel analysis is unseeded; drew seed {} \
                 (pass a seed for reproducible results).",
                s
            );
            (s, false)
        }
    };

    info!(
        "Parallel analysis: {} {:?} surrogates of {} features x {} samples, comparing {} ranks.",
        config.n_permutations, config.null_model, n_features, n_samples, k
    );

    let run_one = |iteration: usize| -> IterationOutcome {
        if cancel.map_or(false, |c| c.is_cancelled()) {
            return IterationOutcome::Skipped;
        }
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        rng.set_stream(iteration as u64);
        let surrogate = null_matrix(matrix, config.null_model, &mut rng);
        let outcome = preprocess_surrogate(&surrogate, &prepared)
            .and_then(|data| eigenvalues_of(&data, k, backend));
        match outcome {
            Ok(values) => IterationOutcome::Done(values),
            Err(e) => IterationOutcome::Failed(e),
        }
    };

    // each iteration writes its own slot; aggregation happens after all finish
    let outcomes: Vec<IterationOutcome> = if config.parallel {
        (0..config.n_permutations).into_par_iter().map(run_one).collect()
    } else {
        (0..config.n_permutations).map(run_one).collect()
    };

    let mut runs = Vec::with_capacity(outcomes.len());
    let mut n_failed = 0;
    let mut n_skipped = 0;
    for (iteration, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            IterationOutcome::Done(values) => runs.push(values),
            IterationOutcome::Skipped => n_skipped += 1,
            IterationOutcome::Failed(e) => match config.failure_policy {
                FailurePolicy::Strict => {
                    return Err(PcaError::IterationFailed {
                        iteration,
                        source: Box::new(e),
                    })
                }
                FailurePolicy::BestEffort => {
                    warn!("Excluding parallel analysis iteration {}: {}", iteration, e);
                    n_failed += 1;
                }
            },
        }
    }

    if n_skipped > 0 && config.cancel_policy == CancelPolicy::Discard {
        return Err(PcaError::Cancelled {
            completed: runs.len(),
            requested: config.n_permutations,
        });
    }
    if runs.is_empty() {
        if n_skipped > 0 {
            return Err(PcaError::Cancelled {
                completed: 0,
                requested: config.n_permutations,
            });
        }
        return Err(PcaError::Decomposition(format!(
            "all {} parallel analysis iterations failed",
            n_failed
        )));
    }

    let null = summarise(&runs, k, config.summary);
    let observed_slice = observed.as_slice().unwrap_or(&[]);
    let null_slice = null.as_slice().unwrap_or(&[]);
    let n = retained_components(observed_slice, null_slice);
    let partial = runs.len() < config.n_permutations;
    if partial {
        warn!(
            "Parallel analysis aggregated {} of {} iterations ({} failed, {} skipped).",
            runs.len(),
            config.n_permutations,
            n_failed,
            n_skipped
        );
    }
    debug!("Observed {:?} vs null {:?}", observed, null);
    info!("Parallel analysis retains {} components.", n);

    Ok(ParallelAnalysisResult {
        n,
        observed,
        null,
        summary: config.summary,
        null_model: config.null_model,
        n_requested: config.n_permutations,
        n_completed: runs.len(),
        n_failed,
        n_skipped,
        seed,
        seeded,
        partial,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg_backends::ExactSvd;
    use approx::assert_abs_diff_eq;

    fn random_matrix(rows: usize, cols: usize, seed: u64) -> FeatureMatrix {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let data = Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-1.0..1.0));
        FeatureMatrix::from_array(data).unwrap()
    }

    #[test]
    fn percentile_interpolates() {
        let mut v = vec![4.0, 1.0, 3.0, 2.0];
        assert_abs_diff_eq!(percentile(&mut v, 50.0), 2.5, epsilon = 1e-12);
        assert_abs_diff_eq!(percentile(&mut v, 100.0), 4.0, epsilon = 1e-12);
        let mut single = vec![7.0];
        assert_eq!(percentile(&mut single, 95.0), 7.0);
    }

    #[test]
    fn retention_stops_at_first_loss_or_tie() {
        assert_eq!(retained_components(&[5.0, 3.0, 1.0, 0.9], &[2.0, 2.0, 2.0, 0.1]), 2);
        assert_eq!(retained_components(&[2.0, 1.0], &[2.0, 0.5]), 0);
        assert_eq!(retained_components(&[3.0, 2.0], &[1.0, 1.0]), 2);
    }

    #[test]
    fn permutation_preserves_each_feature_multiset() {
        let m = random_matrix(6, 9, 1);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let permuted = null_matrix(&m, NullModel::Permute, &mut rng);
        for i in 0..m.n_features() {
            let mut a = m.feature(i).to_vec();
            let mut b = permuted.feature(i).to_vec();
            a.sort_by(|x, y| x.partial_cmp(y).unwrap());
            b.sort_by(|x, y| x.partial_cmp(y).unwrap());
            assert_eq!(a, b);
        }
    }

    #[test]
    fn resampling_draws_only_observed_values() {
        let m = random_matrix(4, 7, 2);
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let resampled = null_matrix(&m, NullModel::Resample, &mut rng);
        for i in 0..m.n_features() {
            let original = m.feature(i).to_vec();
            for v in resampled.feature(i).iter() {
                assert!(original.contains(v));
            }
        }
    }

    #[test]
    fn zero_permutations_is_invalid() {
        let m = random_matrix(10, 8, 3);
        let config = ParallelAnalysisConfig {
            n_permutations: 0,
            ..ParallelAnalysisConfig::seeded(1)
        };
        let err =
            parallel_analysis(&m, &PcaOptions::default(), &config, &ExactSvd, None).unwrap_err();
        assert!(matches!(err, PcaError::InvalidParameter { .. }));
    }

    #[test]
    fn three_samples_are_insufficient() {
        let m = random_matrix(10, 3, 3);
        let err = parallel_analysis(
            &m,
            &PcaOptions::default(),
            &ParallelAnalysisConfig::seeded(1),
            &ExactSvd,
            None,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PcaError::InsufficientSamples { required: 4, actual: 3, .. }
        ));
    }

    #[test]
    fn seeded_runs_are_deterministic_across_threading() {
        let m = random_matrix(30, 12, 4);
        let parallel = ParallelAnalysisConfig {
            n_permutations: 20,
            ..ParallelAnalysisConfig::seeded(99)
        };
        let sequential = ParallelAnalysisConfig {
            parallel: false,
            ..parallel.clone()
        };
        let options = PcaOptions::default();
        let a = parallel_analysis(&m, &options, &parallel, &ExactSvd, None).unwrap();
        let b = parallel_analysis(&m, &options, &parallel, &ExactSvd, None).unwrap();
        let c = parallel_analysis(&m, &options, &sequential, &ExactSvd, None).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.null, c.null);
        assert!(a.seeded);
        assert!(!a.partial);
        assert_eq!(a.n_completed, 20);
    }

    #[test]
    fn unseeded_run_reports_its_seed() {
        let m = random_matrix(10, 6, 4);
        let config = ParallelAnalysisConfig {
            n_permutations: 3,
            ..Default::default()
        };
        let options = PcaOptions::default();
        let result = parallel_analysis(&m, &options, &config, &ExactSvd, None).unwrap();
        assert!(!result.seeded);
        // replaying with the reported seed reproduces the null summary
        let replay = ParallelAnalysisConfig {
            seed: Some(result.seed),
            ..config
        };
        let again = parallel_analysis(&m, &options, &replay, &ExactSvd, None).unwrap();
        assert_eq!(result.null, again.null);
    }

    #[test]
    fn cancelled_run_discards_or_flags_partial() {
        let m = random_matrix(10, 6, 4);
        let token = CancellationToken::new();
        token.cancel();

        let discard = ParallelAnalysisConfig {
            n_permutations: 5,
            ..ParallelAnalysisConfig::seeded(1)
        };
        let options = PcaOptions::default();
        let err =
            parallel_analysis(&m, &options, &discard, &ExactSvd, Some(&token)).unwrap_err();
        assert!(matches!(err, PcaError::Cancelled { completed: 0, requested: 5 }));

        let keep = ParallelAnalysisConfig {
            cancel_policy: CancelPolicy::UsePartial,
            ..discard
        };
        // nothing completed, so even the partial policy has nothing to aggregate
        let err = parallel_analysis(&m, &options, &keep, &ExactSvd, Some(&token)).unwrap_err();
        assert!(matches!(err, PcaError::Cancelled { .. }));
    }

    #[test]
    fn strong_structure_is_retained_and_noise_is_not() {
        // two latent factors across 60 features, plus small noise
        let mut rng = ChaCha8Rng::seed_from_u64(10);
        let n_samples = 40;
        let f1: Vec<f64> = (0..n_samples).map(|_| rng.gen_range(-3.0..3.0)).collect();
        let f2: Vec<f64> = (0..n_samples).map(|_| rng.gen_range(-3.0..3.0)).collect();
        let data = Array2::from_shape_fn((60, n_samples), |(i, j)| {
            let signal = if i < 30 { f1[j] } else { f2[j] };
            signal + rng.gen_range(-0.3..0.3)
        });
        let m = FeatureMatrix::from_array(data).unwrap();
        let config = ParallelAnalysisConfig {
            n_permutations: 30,
            ..ParallelAnalysisConfig::seeded(2024)
        };
        let result =
            parallel_analysis(&m, &PcaOptions::default(), &config, &ExactSvd, None).unwrap();
        assert_eq!(result.n, 2);
        assert_eq!(result.observed.len(), result.null.len());
    }

    /// Binary features with two ones in six samples; bootstrap draws often
    /// come out all zeros.
    fn binary_matrix() -> FeatureMatrix {
        let data = Array2::from_shape_fn((20, 6), |(i, j)| {
            if (i + j) % 3 == 0 {
                1.0
            } else {
                0.0
            }
        });
        FeatureMatrix::from_array(data).unwrap()
    }

    #[test]
    fn constant_resampled_feature_becomes_a_zero_row() {
        let m = binary_matrix();
        let prepared = preprocess(&m, true, true).unwrap();
        let mut data = m.data().to_owned();
        data.row_mut(0).fill(0.0);
        data.row_mut(1).fill(1.0);
        let surrogate = m.with_data(data);

        let scaled = preprocess_surrogate(&surrogate, &prepared).unwrap();
        assert!(scaled.row(0).iter().all(|&v| v == 0.0));
        assert!(scaled.row(1).iter().all(|&v| v == 0.0));
        assert!(preprocess(&surrogate, true, true).is_err());
    }

    #[test]
    fn scaled_resampling_of_binary_features_completes() {
        let m = binary_matrix();
        let options = PcaOptions {
            scale: true,
            ..PcaOptions::default()
        };
        let config = ParallelAnalysisConfig {
            n_permutations: 50,
            null_model: NullModel::Resample,
            ..ParallelAnalysisConfig::seeded(17)
        };
        let result = parallel_analysis(&m, &options, &config, &ExactSvd, None).unwrap();
        assert_eq!(result.n_completed, 50);
        assert_eq!(result.n_failed, 0);
        assert!(!result.partial);
        assert!(result.null.iter().all(|v| v.is_finite()));
    }
}
