//! Caller-facing configuration and the end-to-end exploration pipeline.
//!
//! [`ExploreConfig`] gathers every named option in one serde-friendly struct.
//! `validate` runs before any computation, so configuration mistakes such as
//! mismatched significance cutpoints and symbols surface before a matrix is
//! touched.

use crate::correction::Correction;
use crate::correlation::{
    correlate, CategoricalPolicy, CorrectionScope, CorrelationConfig, CorrelationMethod,
    CorrelationResult, SignificanceBins,
};
use crate::elbow::{find_elbow, ElbowPoint};
use crate::error::{PcaError, Result};
use crate::filter::{filter_low_variance, VarianceFilterSpec};
use crate::linalg_backends::SvdBackend;
use crate::matrix::FeatureMatrix;
use crate::metadata::Metadata;
use crate::model::{PcaResult, VarianceBasis};
use crate::parallel_analysis::{
    parallel_analysis, CancellationToken, NullSummary, ParallelAnalysisConfig,
    ParallelAnalysisResult,
};
use crate::pca::{run_pca, PcaOptions};
use log::{info, warn};
use serde::{Deserialize, Serialize};

/// Which components to compute and report.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ComponentRequest {
    /// Every component up to the maximum the matrix supports.
    #[default]
    All,
    /// The first `n` components.
    Count(usize),
    /// Named components (`PC1`, `PC3`, ...); enough are computed to cover the
    /// highest one named.
    Named(Vec<String>),
}

fn parse_component_name(name: &str) -> Result<usize> {
    name.strip_prefix("PC")
        .and_then(|digits| digits.parse::<usize>().ok())
        .filter(|&i| i > 0)
        .ok_or_else(|| {
            PcaError::invalid(
                "components",
                format!("'{}' is not a component name of the form PC<n>", name),
            )
        })
}

impl ComponentRequest {
    /// Components the decomposition must compute; `None` means all.
    pub fn decomposition_count(&self) -> Result<Option<usize>> {
        match self {
            ComponentRequest::All => Ok(None),
            ComponentRequest::Count(0) => {
                Err(PcaError::invalid("components", "count must be at least 1"))
            }
            ComponentRequest::Count(n) => Ok(Some(*n)),
            ComponentRequest::Named(names) if names.is_empty() => {
                Err(PcaError::invalid("components", "explicit component list is empty"))
            }
            ComponentRequest::Named(names) => {
                let mut highest = 0;
                for name in names {
                    highest = highest.max(parse_component_name(name)?);
                }
                Ok(Some(highest))
            }
        }
    }

    /// Components to report from a computed result.
    pub fn names(&self, result: &PcaResult) -> Vec<String> {
        match self {
            ComponentRequest::Named(names) => names.clone(),
            _ => result.components().to_vec(),
        }
    }
}

/// Every named option of an exploration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExploreConfig {
    /// Low-variance features removed before decomposition (`removeVar`).
    pub remove_var: VarianceFilterSpec,
    pub center: bool,
    pub scale: bool,
    pub components: ComponentRequest,
    pub variance_basis: VarianceBasis,
    /// Parallel-analysis surrogates (`nPermutations`).
    pub n_permutations: usize,
    pub seed: Option<u64>,
    pub null_summary: NullSummary,
    pub correlation_method: CorrelationMethod,
    pub multiple_test_correction: Correction,
    pub correction_scope: CorrectionScope,
    pub significance_cutpoints: Vec<f64>,
    pub significance_symbols: Vec<String>,
    /// Pairwise-complete (`true`) or listwise (`false`) deletion of missing values.
    pub pairwise_complete: bool,
    pub categorical_policy: CategoricalPolicy,
}

impl Default for ExploreConfig {
    fn default() -> Self {
        let bins = SignificanceBins::default();
        let parallel = ParallelAnalysisConfig::default();
        let correlation = CorrelationConfig::default();
        Self {
            remove_var: VarianceFilterSpec::default(),
            center: true,
            scale: false,
            components: ComponentRequest::All,
            variance_basis: VarianceBasis::default(),
            n_permutations: parallel.n_permutations,
            seed: None,
            null_summary: parallel.summary,
            correlation_method: correlation.method,
            multiple_test_correction: correlation.correction,
            correction_scope: correlation.scope,
            significance_cutpoints: bins.cutpoints().to_vec(),
            significance_symbols: bins.symbols().to_vec(),
            pairwise_complete: true,
            categorical_policy: CategoricalPolicy::Ordinal,
        }
    }
}

impl ExploreConfig {
    /// Check every option that can be checked without data.
    pub fn validate(&self) -> Result<()> {
        if let VarianceFilterSpec::Fraction(r) = self.remove_var {
            if !(0.0..1.0).contains(&r) {
                return Err(PcaError::invalid(
                    "removeVar",
                    format!("fraction must lie in [0, 1), got {}", r),
                ));
            }
        }
        self.components.decomposition_count()?;
        self.significance()?;
        self.parallel_analysis_config().validate()
    }

    pub fn significance(&self) -> Result<SignificanceBins> {
        SignificanceBins::new(
            self.significance_cutpoints.clone(),
            self.significance_symbols.clone(),
        )
    }

    pub fn pca_options(&self) -> Result<PcaOptions> {
        Ok(PcaOptions {
            center: self.center,
            scale: self.scale,
            components: self.components.decomposition_count()?,
            variance_basis: self.variance_basis,
        })
    }

    pub fn parallel_analysis_config(&self) -> ParallelAnalysisConfig {
        ParallelAnalysisConfig {
            n_permutations: self.n_permutations,
            seed: self.seed,
            summary: self.null_summary,
            ..Default::default()
        }
    }

    pub fn correlation_config(&self) -> Result<CorrelationConfig> {
        Ok(CorrelationConfig {
            method: self.correlation_method,
            correction: self.multiple_test_correction,
            scope: self.correction_scope,
            significance: self.significance()?,
            pairwise_complete: self.pairwise_complete,
            categorical_policy: self.categorical_policy,
            ..Default::default()
        })
    }
}

/// Filter then decompose.
///
/// # Errors
/// Any configuration error from [`ExploreConfig::validate`], then the errors
/// of [`filter_low_variance`] and [`run_pca`].
pub fn explore<B: SvdBackend + ?Sized>(
    matrix: &FeatureMatrix,
    metadata: Option<Metadata>,
    config: &ExploreConfig,
    backend: &B,
) -> Result<PcaResult> {
    config.validate()?;
    let filtered = filter_low_variance(matrix, config.remove_var)?;
    run_pca(&filtered, metadata, &config.pca_options()?, backend)
}

/// Decomposition plus all component-count guidance and metadata correlation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exploration {
    pub pca: PcaResult,
    pub parallel_analysis: ParallelAnalysisResult,
    /// `None` when fewer than three components were computed.
    pub elbow: Option<ElbowPoint>,
    /// `None` without metadata.
    pub correlation: Option<CorrelationResult>,
}

/// Run the whole pipeline: filter, decompose, parallel analysis on the
/// filtered matrix, elbow on the variance curve, and correlation against
/// metadata when any is attached.
pub fn explore_all<B: SvdBackend + ?Sized>(
    matrix: &FeatureMatrix,
    metadata: Option<Metadata>,
    config: &ExploreConfig,
    backend: &B,
    cancel: Option<&CancellationToken>,
) -> Result<Exploration> {
    config.validate()?;
    let correlation_config = config.correlation_config()?;
    let filtered = filter_low_variance(matrix, config.remove_var)?;
    let options = config.pca_options()?;
    let pca = run_pca(&filtered, metadata, &options, backend)?;

    let pa = parallel_analysis(
        &filtered,
        &options,
        &config.parallel_analysis_config(),
        backend,
        cancel,
    )?;

    let elbow = if pca.n_components() >= 3 {
        Some(find_elbow(&pca.variance().to_vec())?)
    } else {
        warn!(
            "Skipping elbow detection: only {} components computed.",
            pca.n_components()
        );
        None
    };

    let correlation = match pca.metadata() {
        Some(meta) if !meta.attributes().is_empty() => {
            let names = config.components.names(&pca);
            let selected: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
            Some(correlate(&pca, &selected, &[], &correlation_config)?)
        }
        _ => None,
    };

    info!(
        "Exploration done: {} components, parallel analysis retains {}, elbow at {:?}.",
        pca.n_components(),
        pa.n,
        elbow.map(|e| e.rank)
    );

    Ok(Exploration {
        pca,
        parallel_analysis: pa,
        elbow,
        correlation,
    })
}
