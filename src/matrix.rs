//! Labelled features × samples matrix.

use crate::error::{PcaError, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use std::collections::HashSet;

/// Numeric data with features as rows and samples as columns.
///
/// Row labels (feature IDs) and column labels (sample IDs) are unique.
/// Values must be finite; missing-value handling happens before the data
/// reaches this type.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    data: Array2<f64>,
    feature_ids: Vec<String>,
    sample_ids: Vec<String>,
}

fn check_unique(labels: &[String], what: &str) -> Result<()> {
    let mut seen = HashSet::with_capacity(labels.len());
    for label in labels {
        if !seen.insert(label.as_str()) {
            return Err(PcaError::invalid(
                what,
                format!("label '{}' appears more than once", label),
            ));
        }
    }
    Ok(())
}

impl FeatureMatrix {
    /// Build a matrix from a features × samples array.
    ///
    /// # Errors
    /// `DimensionMismatch` if the label counts do not match the array shape,
    /// `InvalidParameter` on duplicate labels, `DegenerateInput` on non-finite values.
    pub fn new(
        data: Array2<f64>,
        feature_ids: Vec<String>,
        sample_ids: Vec<String>,
    ) -> Result<Self> {
        if data.nrows() != feature_ids.len() {
            return Err(PcaError::DimensionMismatch {
                context: "feature IDs vs matrix rows".to_string(),
                expected: data.nrows(),
                actual: feature_ids.len(),
            });
        }
        if data.ncols() != sample_ids.len() {
            return Err(PcaError::DimensionMismatch {
                context: "sample IDs vs matrix columns".to_string(),
                expected: data.ncols(),
                actual: sample_ids.len(),
            });
        }
        check_unique(&feature_ids, "feature_ids")?;
        check_unique(&sample_ids, "sample_ids")?;

        if let Some(((row, col), value)) = data.indexed_iter().find(|(_, v)| !v.is_finite()) {
            return Err(PcaError::DegenerateInput(format!(
                "non-finite value {} for feature '{}' in sample '{}'",
                value, feature_ids[row], sample_ids[col]
            )));
        }

        Ok(Self {
            data,
            feature_ids,
            sample_ids,
        })
    }

    /// Build a matrix from a samples × features array (the orientation most
    /// tabular sources use), transposing it into features × samples.
    pub fn from_samples_by_features(
        data: Array2<f64>,
        sample_ids: Vec<String>,
        feature_ids: Vec<String>,
    ) -> Result<Self> {
        let transposed = data.t().as_standard_layout().into_owned();
        Self::new(transposed, feature_ids, sample_ids)
    }

    /// Build a matrix with generated labels (`feature_1..`, `sample_1..`).
    pub fn from_array(data: Array2<f64>) -> Result<Self> {
        let feature_ids = (1..=data.nrows()).map(|i| format!("feature_{}", i)).collect();
        let sample_ids = (1..=data.ncols()).map(|j| format!("sample_{}", j)).collect();
        Self::new(data, feature_ids, sample_ids)
    }

    pub fn data(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }

    pub fn feature_ids(&self) -> &[String] {
        &self.feature_ids
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn n_features(&self) -> usize {
        self.data.nrows()
    }

    pub fn n_samples(&self) -> usize {
        self.data.ncols()
    }

    /// Values of one feature across all samples.
    pub fn feature(&self, index: usize) -> ArrayView1<'_, f64> {
        self.data.row(index)
    }

    pub fn feature_index(&self, feature_id: &str) -> Option<usize> {
        self.feature_ids.iter().position(|f| f == feature_id)
    }

    pub fn sample_index(&self, sample_id: &str) -> Option<usize> {
        self.sample_ids.iter().position(|s| s == sample_id)
    }

    /// Sample variance (n − 1 denominator) of every feature.
    ///
    /// A matrix with a single sample has zero variance everywhere.
    pub fn feature_variances(&self) -> Array1<f64> {
        let ddof = if self.n_samples() > 1 { 1.0 } else { 0.0 };
        self.data.map_axis(Axis(1), |row| row.var(ddof))
    }

    /// Keep the given rows, in the order given.
    pub fn select_features(&self, indices: &[usize]) -> Self {
        Self {
            data: self.data.select(Axis(0), indices),
            feature_ids: indices.iter().map(|&i| self.feature_ids[i].clone()).collect(),
            sample_ids: self.sample_ids.clone(),
        }
    }

    /// Replace the values while keeping the labels. Used by procedures that
    /// build same-shaped surrogate data.
    pub(crate) fn with_data(&self, data: Array2<f64>) -> Self {
        debug_assert_eq!(data.dim(), self.data.dim());
        Self {
            data,
            feature_ids: self.feature_ids.clone(),
            sample_ids: self.sample_ids.clone(),
        }
    }

    pub fn into_parts(self) -> (Array2<f64>, Vec<String>, Vec<String>) {
        (self.data, self.feature_ids, self.sample_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn ids(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{}{}", prefix, i)).collect()
    }

    #[test]
    fn rejects_duplicate_sample_labels() {
        let data = array![[1.0, 2.0], [3.0, 4.0]];
        let err = FeatureMatrix::new(data, ids("f", 2), vec!["s".into(), "s".into()]).unwrap_err();
        assert!(matches!(err, PcaError::InvalidParameter { ref name, .. } if name == "sample_ids"));
    }

    #[test]
    fn rejects_label_count_mismatch() {
        let data = array![[1.0, 2.0], [3.0, 4.0]];
        let err = FeatureMatrix::new(data, ids("f", 3), ids("s", 2)).unwrap_err();
        assert!(matches!(
            err,
            PcaError::DimensionMismatch { expected: 2, actual: 3, .. }
        ));
    }

    #[test]
    fn rejects_nan() {
        let data = array![[1.0, f64::NAN], [3.0, 4.0]];
        let err = FeatureMatrix::new(data, ids("f", 2), ids("s", 2)).unwrap_err();
        assert!(matches!(err, PcaError::DegenerateInput(_)));
    }

    #[test]
    fn transposed_constructor_swaps_orientation() {
        // 3 samples × 2 features
        let data = array![[1.0, 10.0], [2.0, 20.0], [3.0, 30.0]];
        let m = FeatureMatrix::from_samples_by_features(data, ids("s", 3), ids("f", 2)).unwrap();
        assert_eq!(m.n_features(), 2);
        assert_eq!(m.n_samples(), 3);
        assert_eq!(m.feature(1).to_vec(), vec![10.0, 20.0, 30.0]);
    }

    #[test]
    fn feature_variances_use_sample_variance() {
        let m = FeatureMatrix::from_array(array![[1.0, 2.0, 3.0], [5.0, 5.0, 5.0]]).unwrap();
        let v = m.feature_variances();
        assert_abs_diff_eq!(v[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(v[1], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn select_features_keeps_given_order() {
        let m = FeatureMatrix::from_array(array![[1.0, 1.0], [2.0, 2.0], [3.0, 3.0]]).unwrap();
        let s = m.select_features(&[2, 0]);
        assert_eq!(s.feature_ids(), &["feature_3".to_string(), "feature_1".to_string()]);
        assert_eq!(s.feature(0).to_vec(), vec![3.0, 3.0]);
    }

    #[test]
    fn labels_resolve_to_positions() {
        let data = array![[1.0, 10.0], [2.0, 20.0], [3.0, 30.0]];
        let m = FeatureMatrix::from_samples_by_features(data, ids("s", 3), ids("f", 2)).unwrap();
        assert_eq!(m.feature_index("f1"), Some(1));
        assert_eq!(m.sample_index("s2"), Some(2));
        assert_eq!(m.feature_index("s0"), None);
        assert_eq!(m.sample_index("missing"), None);

        let kept = m.select_features(&[1]);
        assert_eq!(kept.feature_index("f1"), Some(0));
        assert_eq!(kept.feature_index("f0"), None);
    }

    #[test]
    fn into_parts_rebuilds_an_equal_matrix() {
        let data = array![[1.0, 2.0], [3.0, 4.0]];
        let m = FeatureMatrix::new(data, ids("f", 2), ids("s", 2)).unwrap();
        let (data, feature_ids, sample_ids) = m.clone().into_parts();
        assert_eq!(data, array![[1.0, 2.0], [3.0, 4.0]]);
        assert_eq!(feature_ids, ids("f", 2));
        assert_eq!(sample_ids, ids("s", 2));
        assert_eq!(FeatureMatrix::new(data, feature_ids, sample_ids).unwrap(), m);
    }
}
