//! Elbow detection on a variance-explained curve.
//!
//! Deterministic alternatives to parallel analysis: no randomness, the same
//! sequence always yields the same answer.

use crate::error::{PcaError, Result};
use crate::model::PcaResult;
use log::debug;
use serde::{Deserialize, Serialize};

/// Location of the elbow.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ElbowPoint {
    /// 1-based component rank (`PC{rank}`).
    pub rank: usize,
    /// Score of the chosen point: perpendicular distance or second difference,
    /// depending on the detector.
    pub score: f64,
}

fn check_curve(variance: &[f64]) -> Result<()> {
    if variance.len() < 3 {
        return Err(PcaError::InsufficientComponents {
            context: "elbow detection".to_string(),
            required: 3,
            actual: variance.len(),
        });
    }
    if let Some(pos) = variance.iter().position(|v| !v.is_finite()) {
        return Err(PcaError::invalid(
            "variance",
            format!("value at rank {} is not finite ({})", pos + 1, variance[pos]),
        ));
    }
    Ok(())
}

/// Perpendicular distance from each point `(rank, variance)` to the chord
/// joining the first and last points.
pub fn chord_distances(variance: &[f64]) -> Vec<f64> {
    let n = variance.len();
    if n < 2 {
        return vec![0.0; n];
    }
    let (x1, y1) = (1.0, variance[0]);
    let (x2, y2) = (n as f64, variance[n - 1]);
    let (dx, dy) = (x2 - x1, y2 - y1);
    let norm = (dx * dx + dy * dy).sqrt();
    variance
        .iter()
        .enumerate()
        .map(|(i, &y)| {
            let x = (i + 1) as f64;
            (dy * x - dx * y + x2 * y1 - y2 * x1).abs() / norm
        })
        .collect()
}

/// Kneedle-style elbow: the interior point farthest from the chord between
/// the first and last points. Ties go to the lower rank.
///
/// # Errors
/// `InsufficientComponents` for fewer than three points, `InvalidParameter`
/// for non-finite values.
pub fn find_elbow(variance: &[f64]) -> Result<ElbowPoint> {
    check_curve(variance)?;
    let distances = chord_distances(variance);
    let mut best = 1;
    for i in 2..variance.len() - 1 {
        if distances[i] > distances[best] {
            best = i;
        }
    }
    debug!("Elbow distances: {:?}", distances);
    Ok(ElbowPoint {
        rank: best + 1,
        score: distances[best],
    })
}

/// Elbow as the interior point with the largest discrete second difference
/// `v[i-1] - 2 v[i] + v[i+1]`. Ties go to the lower rank.
pub fn find_elbow_by_curvature(variance: &[f64]) -> Result<ElbowPoint> {
    check_curve(variance)?;
    let mut best = (1, f64::NEG_INFINITY);
    for i in 1..variance.len() - 1 {
        let curvature = variance[i - 1] - 2.0 * variance[i] + variance[i + 1];
        if curvature > best.1 {
            best = (i, curvature);
        }
    }
    Ok(ElbowPoint {
        rank: best.0 + 1,
        score: best.1,
    })
}

/// Elbow of a result's per-component variance curve.
pub fn elbow_of(result: &PcaResult) -> Result<ElbowPoint> {
    find_elbow(&result.variance().to_vec())
}

/// Smallest number of components whose cumulative variance reaches
/// `threshold` percent.
///
/// # Errors
/// `InvalidParameter` if `threshold` is outside `(0, 100]`;
/// `InsufficientComponents` if the curve never reaches it.
pub fn components_for_variance(cumulative: &[f64], threshold: f64) -> Result<usize> {
    if !(threshold > 0.0 && threshold <= 100.0) {
        return Err(PcaError::invalid(
            "threshold",
            format!("must lie in (0, 100], got {}", threshold),
        ));
    }
    cumulative
        .iter()
        .position(|&c| c >= threshold - 1e-9)
        .map(|i| i + 1)
        .ok_or_else(|| PcaError::InsufficientComponents {
            context: format!(
                "{}% cumulative variance (curve tops out at {:.3}%)",
                threshold,
                cumulative.last().copied().unwrap_or(0.0)
            ),
            required: cumulative.len() + 1,
            actual: cumulative.len(),
        })
}
