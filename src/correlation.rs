//! Correlation of principal components with sample metadata.
//!
//! For each requested (component, attribute) pair the engine computes a
//! correlation statistic on that pair's complete cases, a raw p-value from the
//! statistic's reference distribution, an adjusted p-value and a
//! significance symbol.
//!
//! Categorical attributes are correlated through the ordinal encoding of
//! their levels (level order as stored in [`Metadata`]). This treats
//! unordered categories as ordered; callers who need a proper categorical test
//! should pre-encode, or select [`CategoricalPolicy::Reject`] to make such
//! requests fail.

use crate::correction::Correction;
use crate::error::{PcaError, Result};
use crate::metadata::Metadata;
use crate::model::PcaResult;
use log::{debug, info, warn};
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal, StudentsT};

/// Fewest complete observations a pair needs for a test.
pub const MIN_PAIR_OBSERVATIONS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CorrelationMethod {
    #[default]
    Pearson,
    /// Pearson on average ranks.
    Spearman,
    /// Kendall's tau-b.
    Kendall,
}

/// Family over which the multiple-testing correction runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CorrectionScope {
    /// One family of all (component, attribute) pairs.
    #[default]
    AllPairs,
    /// One family per component, across its attributes.
    PerComponent,
}

/// Treatment of categorical attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CategoricalPolicy {
    /// Correlate the level index.
    #[default]
    Ordinal,
    /// Refuse categorical attributes with `InvalidParameter`.
    Reject,
}

/// Ordered p-value bins with one symbol each.
///
/// Cutpoints are upper bounds: a p-value gets the symbol of the first cutpoint
/// it does not exceed. Values above the last cutpoint, and NaN, get `""`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignificanceBins {
    cutpoints: Vec<f64>,
    symbols: Vec<String>,
}

impl SignificanceBins {
    /// # Errors
    /// `InvalidParameter` if the lengths differ, the list is empty, or the
    /// cutpoints are not strictly increasing within `(0, 1]`.
    pub fn new(cutpoints: Vec<f64>, symbols: Vec<String>) -> Result<Self> {
        if cutpoints.len() != symbols.len() {
            return Err(PcaError::invalid(
                "significanceCutpoints",
                format!(
                    "{} cutpoints but {} symbols; lengths must match",
                    cutpoints.len(),
                    symbols.len()
                ),
            ));
        }
        if cutpoints.is_empty() {
            return Err(PcaError::invalid("significanceCutpoints", "must not be empty"));
        }
        if let Some(bad) = cutpoints.iter().find(|&&c| !(c > 0.0 && c <= 1.0)) {
            return Err(PcaError::invalid(
                "significanceCutpoints",
                format!("cutpoint {} is outside (0, 1]", bad),
            ));
        }
        if cutpoints.windows(2).any(|w| w[0] >= w[1]) {
            return Err(PcaError::invalid(
                "significanceCutpoints",
                format!("must be strictly increasing, got {:?}", cutpoints),
            ));
        }
        Ok(Self { cutpoints, symbols })
    }

    pub fn cutpoints(&self) -> &[f64] {
        &self.cutpoints
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn symbol_for(&self, p_value: f64) -> &str {
        if p_value.is_nan() {
            return "";
        }
        self.cutpoints
            .iter()
            .position(|&c| p_value <= c)
            .map_or("", |i| self.symbols[i].as_str())
    }

    fn revalidate(&self) -> Result<()> {
        Self::new(self.cutpoints.clone(), self.symbols.clone()).map(|_| ())
    }
}

impl Default for SignificanceBins {
    fn default() -> Self {
        Self {
            cutpoints: vec![0.001, 0.01, 0.05, 1.0],
            symbols: ["***", "**", "*", ""].iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationConfig {
    pub method: CorrelationMethod,
    pub correction: Correction,
    pub scope: CorrectionScope,
    pub significance: SignificanceBins,
    /// `true`: each pair drops only its own incomplete samples.
    /// `false`: samples missing any requested attribute are dropped everywhere.
    pub pairwise_complete: bool,
    pub categorical_policy: CategoricalPolicy,
    pub parallel: bool,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            method: CorrelationMethod::Pearson,
            correction: Correction::BenjaminiHochberg,
            scope: CorrectionScope::AllPairs,
            significance: SignificanceBins::default(),
            pairwise_complete: true,
            categorical_policy: CategoricalPolicy::Ordinal,
            parallel: true,
        }
    }
}

impl CorrelationConfig {
    pub fn validate(&self) -> Result<()> {
        // bins may arrive through deserialization without passing `new`
        self.significance.revalidate()
    }
}

/// Outcome for one (component, attribute) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationCell {
    pub component: String,
    pub attribute: String,
    /// Correlation coefficient; NaN when a column is constant.
    pub statistic: f64,
    pub r_squared: f64,
    /// Complete observations used.
    pub n: usize,
    pub p_value: f64,
    pub adjusted_p_value: f64,
    pub symbol: String,
}

/// Correlation of components against attributes, component-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationResult {
    pub components: Vec<String>,
    pub attributes: Vec<String>,
    pub method: CorrelationMethod,
    pub correction: Correction,
    pub scope: CorrectionScope,
    cells: Vec<CorrelationCell>,
}

impl CorrelationResult {
    pub fn cells(&self) -> &[CorrelationCell] {
        &self.cells
    }

    pub fn cell(&self, component: &str, attribute: &str) -> Option<&CorrelationCell> {
        let i = self.components.iter().position(|c| c == component)?;
        let j = self.attributes.iter().position(|a| a == attribute)?;
        self.cells.get(i * self.attributes.len() + j)
    }

    fn matrix(&self, field: impl Fn(&CorrelationCell) -> f64) -> Array2<f64> {
        let shape = (self.components.len(), self.attributes.len());
        Array2::from_shape_fn(shape, |(i, j)| field(&self.cells[i * shape.1 + j]))
    }

    /// Statistics, shape (components, attributes).
    pub fn statistic_matrix(&self) -> Array2<f64> {
        self.matrix(|c| c.statistic)
    }

    pub fn r_squared_matrix(&self) -> Array2<f64> {
        self.matrix(|c| c.r_squared)
    }

    pub fn p_value_matrix(&self) -> Array2<f64> {
        self.matrix(|c| c.p_value)
    }

    pub fn adjusted_p_value_matrix(&self) -> Array2<f64> {
        self.matrix(|c| c.adjusted_p_value)
    }

    /// Significance symbols, one row per component.
    pub fn symbol_matrix(&self) -> Vec<Vec<String>> {
        self.cells
            .chunks(self.attributes.len().max(1))
            .map(|row| row.iter().map(|c| c.symbol.clone()).collect())
            .collect()
    }

    /// Cells whose adjusted p-value is below `alpha`.
    pub fn significant(&self, alpha: f64) -> Vec<&CorrelationCell> {
        self.cells.iter().filter(|c| c.adjusted_p_value < alpha).collect()
    }
}

/// Average ranks (1-based); ties share the mean of their positions.
pub fn average_ranks(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        values[a]
            .partial_cmp(&values[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut ranks = vec![0.0; n];
    let mut start = 0;
    while start < n {
        let mut end = start + 1;
        while end < n && values[order[end]] == values[order[start]] {
            end += 1;
        }
        // positions start..end share rank ((start+1) + end) / 2
        let rank = (start + 1 + end) as f64 / 2.0;
        for &idx in &order[start..end] {
            ranks[idx] = rank;
        }
        start = end;
    }
    ranks
}

/// Pearson product-moment correlation; NaN if either side is constant.
pub fn pearson(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len() as f64;
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (&a, &b) in x.iter().zip(y) {
        let (dx, dy) = (a - mean_x, b - mean_y);
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    if sxx <= 0.0 || syy <= 0.0 {
        return f64::NAN;
    }
    (sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0)
}

pub fn spearman(x: &[f64], y: &[f64]) -> f64 {
    pearson(&average_ranks(x), &average_ranks(y))
}

/// Sizes of tie groups among `values`.
fn tie_groups(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mut groups = Vec::new();
    let mut run = 1.0;
    for w in sorted.windows(2) {
        if w[0] == w[1] {
            run += 1.0;
        } else {
            if run > 1.0 {
                groups.push(run);
            }
            run = 1.0;
        }
    }
    if run > 1.0 {
        groups.push(run);
    }
    groups
}

/// Kendall's tau-b and its two-sided p-value from the tie-corrected normal
/// approximation of the score `S`.
pub fn kendall_tau_b(x: &[f64], y: &[f64]) -> (f64, f64) {
    let n = x.len();
    let mut s = 0.0;
    for i in 0..n {
        for j in (i + 1)..n {
            let a = (x[i] - x[j]).signum() * if x[i] == x[j] { 0.0 } else { 1.0 };
            let b = (y[i] - y[j]).signum() * if y[i] == y[j] { 0.0 } else { 1.0 };
            s += a * b;
        }
    }

    let nf = n as f64;
    let n0 = nf * (nf - 1.0) / 2.0;
    let tx = tie_groups(x);
    let ty = tie_groups(y);
    let n1: f64 = tx.iter().map(|t| t * (t - 1.0) / 2.0).sum();
    let n2: f64 = ty.iter().map(|u| u * (u - 1.0) / 2.0).sum();
    let denominator = ((n0 - n1) * (n0 - n2)).sqrt();
    if !(denominator > 0.0) {
        return (f64::NAN, f64::NAN);
    }
    let tau = (s / denominator).clamp(-1.0, 1.0);

    let v0 = nf * (nf - 1.0) * (2.0 * nf + 5.0);
    let vt: f64 = tx.iter().map(|t| t * (t - 1.0) * (2.0 * t + 5.0)).sum();
    let vu: f64 = ty.iter().map(|u| u * (u - 1.0) * (2.0 * u + 5.0)).sum();
    let v1 = tx.iter().map(|t| t * (t - 1.0)).sum::<f64>()
        * ty.iter().map(|u| u * (u - 1.0)).sum::<f64>();
    let v2 = tx.iter().map(|t| t * (t - 1.0) * (t - 2.0)).sum::<f64>()
        * ty.iter().map(|u| u * (u - 1.0) * (u - 2.0)).sum::<f64>();
    let variance = (v0 - vt - vu) / 18.0
        + v1 / (2.0 * nf * (nf - 1.0))
        + v2 / (9.0 * nf * (nf - 1.0) * (nf - 2.0));
    if !(variance > 0.0) {
        return (tau, f64::NAN);
    }
    let z = s / variance.sqrt();
    let p = Normal::new(0.0, 1.0)
        .map(|d| (2.0 * d.sf(z.abs())).min(1.0))
        .unwrap_or(f64::NAN);
    (tau, p)
}

/// Two-sided p-value of a correlation coefficient through the Student-t
/// statistic `r √((n−2)/(1−r²))` with n − 2 degrees of freedom.
pub fn t_test_p_value(r: f64, n: usize) -> f64 {
    if r.is_nan() || n < MIN_PAIR_OBSERVATIONS {
        return f64::NAN;
    }
    if r.abs() >= 1.0 {
        return 0.0;
    }
    let df = (n - 2) as f64;
    let t = r * (df / (1.0 - r * r)).sqrt();
    StudentsT::new(0.0, 1.0, df)
        .map(|d| (2.0 * d.sf(t.abs())).min(1.0))
        .unwrap_or(f64::NAN)
}

/// Statistic and raw p-value for one complete-case pair.
fn correlation_test(method: CorrelationMethod, x: &[f64], y: &[f64]) -> (f64, f64) {
    match method {
        CorrelationMethod::Pearson => {
            let r = pearson(x, y);
            (r, t_test_p_value(r, x.len()))
        }
        CorrelationMethod::Spearman => {
            let r = spearman(x, y);
            (r, t_test_p_value(r, x.len()))
        }
        CorrelationMethod::Kendall => kendall_tau_b(x, y),
    }
}

struct PairOutcome {
    statistic: f64,
    n: usize,
    p_value: f64,
}

fn resolve_components(result: &PcaResult, components: &[&str]) -> Result<Vec<usize>> {
    if components.is_empty() {
        return Ok((0..result.n_components()).collect());
    }
    components
        .iter()
        .map(|&c| {
            result.component_index(c).ok_or_else(|| {
                PcaError::invalid(
                    "components",
                    format!("unknown component '{}' (result has {})", c, result.n_components()),
                )
            })
        })
        .collect()
}

fn resolve_attributes<'a>(
    metadata: &'a Metadata,
    attributes: &[&'a str],
    policy: CategoricalPolicy,
) -> Result<Vec<&'a str>> {
    let names: Vec<&str> = if attributes.is_empty() {
        metadata.attribute_names()
    } else {
        attributes.to_vec()
    };
    for &name in &names {
        let attr = metadata.attribute(name)?;
        if attr.is_categorical() {
            match policy {
                CategoricalPolicy::Reject => {
                    return Err(PcaError::invalid(
                        "categorical_policy",
                        format!(
                            "attribute '{}' is categorical and categorical attributes are rejected",
                            name
                        ),
                    ))
                }
                CategoricalPolicy::Ordinal => {
                    debug!(
                        "Attribute '{}' is categorical; correlating its ordinal level encoding.",
                        name
                    )
                }
            }
        }
    }
    Ok(names)
}

/// Correlate component scores with metadata attributes.
///
/// An empty `components` slice selects every component of `result`; an empty
/// `attributes` slice selects every metadata attribute.
///
/// # Errors
/// `InvalidParameter` for a bad config, an unknown component, a result
/// without metadata, or a rejected categorical attribute;
/// `UnknownAttribute` for a missing metadata name; `EmptyIntersection` when a
/// pair has no complete samples; `InsufficientSamples` when it has fewer
/// than three.
pub fn correlate(
    result: &PcaResult,
    components: &[&str],
    attributes: &[&str],
    config: &CorrelationConfig,
) -> Result<CorrelationResult> {
    config.validate()?;
    let metadata = result.metadata().ok_or_else(|| {
        PcaError::invalid("metadata", "the PCA result has no metadata attached")
    })?;

    let component_idx = resolve_components(result, components)?;
    let attribute_names = resolve_attributes(metadata, attributes, config.categorical_policy)?;
    let sample_ids = result.sample_ids();

    let columns: Vec<Vec<Option<f64>>> = attribute_names
        .iter()
        .map(|&name| {
            metadata
                .aligned_values(name, sample_ids)
                .map(|values| values.iter().map(|v| v.encoded()).collect())
        })
        .collect::<Result<_>>()?;

    // listwise deletion keeps only samples complete for every requested attribute
    let listwise: Option<Vec<bool>> = if config.pairwise_complete {
        None
    } else {
        let keep: Vec<bool> = (0..sample_ids.len())
            .map(|s| columns.iter().all(|col| col[s].is_some()))
            .collect();
        debug!(
            "Listwise deletion keeps {} of {} samples.",
            keep.iter().filter(|&&k| k).count(),
            sample_ids.len()
        );
        Some(keep)
    };

    let n_attr = attribute_names.len();
    let pairs: Vec<(usize, usize)> = component_idx
        .iter()
        .flat_map(|&c| (0..n_attr).map(move |a| (c, a)))
        .collect();

    info!(
        "Correlating {} components with {} attributes ({:?}, {:?} correction).",
        component_idx.len(),
        n_attr,
        config.method,
        config.correction
    );

    let scores = result.scores();
    let component_names = result.components();
    let compute = |&(c, a): &(usize, usize)| -> Result<PairOutcome> {
        let score_col = scores.column(c);
        let (x, y): (Vec<f64>, Vec<f64>) = columns[a]
            .iter()
            .enumerate()
            .filter(|(s, _)| listwise.as_ref().map_or(true, |keep| keep[*s]))
            .filter_map(|(s, v)| v.map(|value| (score_col[s], value)))
            .unzip();
        if x.is_empty() {
            return Err(PcaError::EmptyIntersection {
                component: component_names[c].clone(),
                attribute: attribute_names[a].to_string(),
            });
        }
        if x.len() < MIN_PAIR_OBSERVATIONS {
            return Err(PcaError::InsufficientSamples {
                context: format!(
                    "correlation of {} with '{}'",
                    component_names[c], attribute_names[a]
                ),
                required: MIN_PAIR_OBSERVATIONS,
                actual: x.len(),
            });
        }
        let (statistic, p_value) = correlation_test(config.method, &x, &y);
        Ok(PairOutcome {
            statistic,
            n: x.len(),
            p_value,
        })
    };

    let outcomes: Vec<PairOutcome> = if config.parallel {
        pairs.par_iter().map(compute).collect::<Result<_>>()?
    } else {
        pairs.iter().map(compute).collect::<Result<_>>()?
    };

    for (&(c, a), outcome) in pairs.iter().zip(&outcomes) {
        if outcome.statistic.is_nan() {
            warn!(
                "Correlation of {} with '{}' is undefined (constant values over {} samples).",
                component_names[c], attribute_names[a], outcome.n
            );
        }
    }

    let raw: Vec<f64> = outcomes.iter().map(|o| o.p_value).collect();
    let adjusted = match config.scope {
        CorrectionScope::AllPairs => config.correction.adjust(&raw),
        CorrectionScope::PerComponent => raw
            .chunks(n_attr.max(1))
            .flat_map(|family| config.correction.adjust(family))
            .collect(),
    };

    let cells: Vec<CorrelationCell> = pairs
        .iter()
        .zip(outcomes)
        .zip(adjusted)
        .map(|((&(c, a), outcome), adjusted_p_value)| CorrelationCell {
            component: component_names[c].clone(),
            attribute: attribute_names[a].to_string(),
            statistic: outcome.statistic,
            r_squared: outcome.statistic * outcome.statistic,
            n: outcome.n,
            p_value: outcome.p_value,
            adjusted_p_value,
            symbol: config.significance.symbol_for(adjusted_p_value).to_string(),
        })
        .collect();

    Ok(CorrelationResult {
        components: component_idx.iter().map(|&c| component_names[c].clone()).collect(),
        attributes: attribute_names.iter().map(|s| s.to_string()).collect(),
        method: config.method,
        correction: config.correction,
        scope: config.scope,
        cells,
    })
}
