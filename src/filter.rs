//! Low-variance feature filtering ahead of decomposition.

use crate::error::{PcaError, Result};
use crate::matrix::FeatureMatrix;
use log::{debug, info};
use serde::{Deserialize, Serialize};

/// `r * F` within this relative distance of an integer snaps to it
/// (e.g. 0.3 * 10 = 3.0000000000000004).
const FRACTION_RELATIVE_TOLERANCE: f64 = 1e-9;

/// How many of the lowest-variance features to drop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum VarianceFilterSpec {
    /// Drop `ceil(fraction * F)` features; fraction in `[0, 1)`.
    Fraction(f64),
    /// Drop exactly this many features.
    Count(usize),
}

impl Default for VarianceFilterSpec {
    fn default() -> Self {
        VarianceFilterSpec::Fraction(0.1)
    }
}

impl VarianceFilterSpec {
    /// Number of features removed from a matrix with `n_features` rows.
    pub fn n_removed(&self, n_features: usize) -> Result<usize> {
        let removed = match *self {
            VarianceFilterSpec::Fraction(r) => {
                if !(0.0..1.0).contains(&r) {
                    return Err(PcaError::invalid(
                        "removeVar",
                        format!("fraction must lie in [0, 1), got {}", r),
                    ));
                }
                let exact = r * n_features as f64;
                let nearest = exact.round();
                if (exact - nearest).abs() <= FRACTION_RELATIVE_TOLERANCE * nearest {
                    nearest as usize
                } else {
                    exact.ceil() as usize
                }
            }
            VarianceFilterSpec::Count(c) => c,
        };
        if removed >= n_features {
            return Err(PcaError::invalid(
                "removeVar",
                format!(
                    "removing {} of {} features would leave none",
                    removed, n_features
                ),
            ));
        }
        Ok(removed)
    }
}

/// Indices of the features that survive filtering, in original row order.
///
/// Features are ranked by ascending variance (ties keep row order) and the
/// first `n_removed` are dropped.
pub fn retained_feature_indices(
    matrix: &FeatureMatrix,
    spec: VarianceFilterSpec,
) -> Result<Vec<usize>> {
    let n_features = matrix.n_features();
    if n_features == 0 {
        return Err(PcaError::DegenerateInput("matrix has no features".to_string()));
    }
    let n_removed = spec.n_removed(n_features)?;

    let variances = matrix.feature_variances();
    let mut order: Vec<usize> = (0..n_features).collect();
    order.sort_by(|&a, &b| {
        variances[a]
            .partial_cmp(&variances[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = vec![true; n_features];
    for &idx in order.iter().take(n_removed) {
        keep[idx] = false;
    }
    Ok((0..n_features).filter(|&i| keep[i]).collect())
}

/// Remove the lowest-variance features.
///
/// Pure: the input matrix is not modified. Surviving rows keep their
/// relative order.
///
/// # Errors
/// `InvalidParameter` if the fraction is outside `[0, 1)` or no feature would
/// remain; `DegenerateInput` for a matrix without features.
pub fn filter_low_variance(
    matrix: &FeatureMatrix,
    spec: VarianceFilterSpec,
) -> Result<FeatureMatrix> {
    let kept = retained_feature_indices(matrix, spec)?;
    info!(
        "Variance filter kept {} of {} features.",
        kept.len(),
        matrix.n_features()
    );
    if kept.len() == matrix.n_features() {
        return Ok(matrix.clone());
    }
    debug!(
        "Dropped {} lowest-variance features.",
        matrix.n_features() - kept.len()
    );
    Ok(matrix.select_features(&kept))
}
