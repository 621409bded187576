//! The PCA result shared by retention heuristics, the correlation engine and
//! external renderers.

use crate::error::{PcaError, Result};
use crate::matrix::FeatureMatrix;
use crate::metadata::Metadata;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use serde::{Deserialize, Serialize};

/// What the explained-variance percentages are relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VarianceBasis {
    /// Relative to the variance captured by the computed components. Equal to
    /// the true share only when every component up to full rank was computed.
    #[default]
    CapturedSubspace,
    /// Relative to the total variance of the processed (centered/scaled) matrix.
    TotalVariance,
}

/// Immutable outcome of one decomposition.
///
/// Scores are stored samples × components and loadings features × components,
/// both in the row order of `sample_ids` / `feature_ids`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PcaResult {
    components: Vec<String>,
    sample_ids: Vec<String>,
    feature_ids: Vec<String>,
    scores: Array2<f64>,
    loadings: Array2<f64>,
    singular_values: Array1<f64>,
    eigenvalues: Array1<f64>,
    sdev: Array1<f64>,
    variance: Array1<f64>,
    cumulative_variance: Array1<f64>,
    variance_basis: VarianceBasis,
    center: Option<Array1<f64>>,
    scale: Option<Array1<f64>>,
    metadata: Option<Metadata>,
}

/// Inputs for [`PcaResult::new`]; grouped so the constructor stays readable.
pub(crate) struct PcaParts {
    pub sample_ids: Vec<String>,
    pub feature_ids: Vec<String>,
    pub scores: Array2<f64>,
    pub loadings: Array2<f64>,
    pub singular_values: Array1<f64>,
    pub total_sum_of_squares: f64,
    pub variance_basis: VarianceBasis,
    pub center: Option<Array1<f64>>,
    pub scale: Option<Array1<f64>>,
    pub metadata: Option<Metadata>,
}

impl PcaResult {
    pub(crate) fn new(parts: PcaParts) -> Result<Self> {
        let n_samples = parts.sample_ids.len();
        let n_features = parts.feature_ids.len();
        let k = parts.singular_values.len();

        if parts.scores.dim() != (n_samples, k) {
            return Err(PcaError::DimensionMismatch {
                context: "score rows vs samples".to_string(),
                expected: n_samples * k,
                actual: parts.scores.len(),
            });
        }
        if parts.loadings.dim() != (n_features, k) {
            return Err(PcaError::DimensionMismatch {
                context: "loading rows vs features".to_string(),
                expected: n_features * k,
                actual: parts.loadings.len(),
            });
        }

        let squared = parts.singular_values.mapv(|s| s * s);
        let denominator = match parts.variance_basis {
            VarianceBasis::CapturedSubspace => squared.sum(),
            VarianceBasis::TotalVariance => parts.total_sum_of_squares,
        };
        if !(denominator > 0.0) {
            return Err(PcaError::DegenerateInput(
                "processed matrix has no variance to explain".to_string(),
            ));
        }

        let dof = (n_samples.max(2) - 1) as f64;
        let eigenvalues = squared.mapv(|s2| s2 / dof);
        let sdev = eigenvalues.mapv(f64::sqrt);
        let variance = squared.mapv(|s2| (s2 / denominator * 100.0).min(100.0));
        let mut running = 0.0;
        let cumulative_variance = variance.mapv(|v| {
            running += v;
            running
        });

        Ok(Self {
            components: (1..=k).map(|i| format!("PC{}", i)).collect(),
            sample_ids: parts.sample_ids,
            feature_ids: parts.feature_ids,
            scores: parts.scores,
            loadings: parts.loadings,
            singular_values: parts.singular_values,
            eigenvalues,
            sdev,
            variance,
            cumulative_variance,
            variance_basis: parts.variance_basis,
            center: parts.center,
            scale: parts.scale,
            metadata: parts.metadata,
        })
    }

    /// Component identifiers `PC1..PCk`.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    pub fn n_components(&self) -> usize {
        self.components.len()
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn feature_ids(&self) -> &[String] {
        &self.feature_ids
    }

    /// Scores, shape (samples, components).
    pub fn scores(&self) -> ArrayView2<'_, f64> {
        self.scores.view()
    }

    /// Loadings, shape (features, components).
    pub fn loadings(&self) -> ArrayView2<'_, f64> {
        self.loadings.view()
    }

    pub fn singular_values(&self) -> ArrayView1<'_, f64> {
        self.singular_values.view()
    }

    /// Sample eigenvalues σ²/(n − 1).
    pub fn eigenvalues(&self) -> ArrayView1<'_, f64> {
        self.eigenvalues.view()
    }

    /// Component standard deviations √eigenvalue.
    pub fn sdev(&self) -> ArrayView1<'_, f64> {
        self.sdev.view()
    }

    /// Explained variance per component in percent, non-increasing.
    pub fn variance(&self) -> ArrayView1<'_, f64> {
        self.variance.view()
    }

    pub fn cumulative_variance(&self) -> ArrayView1<'_, f64> {
        self.cumulative_variance.view()
    }

    pub fn variance_basis(&self) -> VarianceBasis {
        self.variance_basis
    }

    /// Per-feature means subtracted before decomposition, if centering was on.
    pub fn center(&self) -> Option<&Array1<f64>> {
        self.center.as_ref()
    }

    /// Per-feature divisors applied before decomposition, if scaling was on.
    pub fn scale(&self) -> Option<&Array1<f64>> {
        self.scale.as_ref()
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    pub fn component_index(&self, component: &str) -> Option<usize> {
        self.components.iter().position(|c| c == component)
    }

    fn require_component(&self, component: &str) -> Result<usize> {
        self.component_index(component).ok_or_else(|| {
            PcaError::invalid(
                "components",
                format!(
                    "unknown component '{}' (result has {})",
                    component,
                    self.components.len()
                ),
            )
        })
    }

    /// Scores of one sample across all components.
    pub fn sample_scores(&self, sample_id: &str) -> Option<ArrayView1<'_, f64>> {
        let i = self.sample_ids.iter().position(|s| s == sample_id)?;
        Some(self.scores.row(i))
    }

    /// Loadings of one feature across all components.
    pub fn feature_loadings(&self, feature_id: &str) -> Option<ArrayView1<'_, f64>> {
        let i = self.feature_ids.iter().position(|f| f == feature_id)?;
        Some(self.loadings.row(i))
    }

    /// Scores of all samples along one component.
    pub fn component_scores(&self, component: &str) -> Result<ArrayView1<'_, f64>> {
        let j = self.require_component(component)?;
        Ok(self.scores.column(j))
    }

    /// The `n` features with the largest absolute loading on `component`,
    /// strongest first.
    pub fn top_loadings(&self, component: &str, n: usize) -> Result<Vec<(String, f64)>> {
        let j = self.require_component(component)?;
        let column = self.loadings.column(j);
        let mut order: Vec<usize> = (0..column.len()).collect();
        order.sort_by(|&a, &b| {
            column[b]
                .abs()
                .partial_cmp(&column[a].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(order
            .into_iter()
            .take(n)
            .map(|i| (self.feature_ids[i].clone(), column[i]))
            .collect())
    }

    /// Project new samples onto the stored components.
    ///
    /// `data` must carry the same features, in the same order, as the matrix
    /// the result was computed from. The stored centre and scale are applied
    /// before projecting. Returns scores with shape (new samples, components).
    pub fn project(&self, data: &FeatureMatrix) -> Result<Array2<f64>> {
        if data.feature_ids() != self.feature_ids.as_slice() {
            return Err(PcaError::DimensionMismatch {
                context: "features of projected data vs fitted features".to_string(),
                expected: self.feature_ids.len(),
                actual: data.n_features(),
            });
        }

        let mut x = data.data().to_owned();
        for mut column in x.axis_iter_mut(Axis(1)) {
            if let Some(center) = &self.center {
                Zip::from(&mut column).and(center).for_each(|v, &m| *v -= m);
            }
            if let Some(scale) = &self.scale {
                Zip::from(&mut column).and(scale).for_each(|v, &s| *v /= s);
            }
        }
        Ok(x.t().dot(&self.loadings))
    }

    /// Same result with metadata attached (or replaced).
    ///
    /// # Errors
    /// `DimensionMismatch` if a metadata sample is not among the result's samples.
    pub fn with_metadata(mut self, metadata: Metadata) -> Result<Self> {
        metadata.check_alignment(&self.sample_ids)?;
        self.metadata = Some(metadata);
        Ok(self)
    }
}
