// Exploratory principal component analysis

#![doc = include_str!("../README.md")]

pub mod config;
pub mod correction;
pub mod correlation;
pub mod elbow;
pub mod error;
pub mod filter;
pub mod linalg_backends;
pub mod matrix;
pub mod metadata;
pub mod model;
pub mod parallel_analysis;
pub mod pca;

pub use config::{explore, explore_all, ComponentRequest, Exploration, ExploreConfig};
pub use correction::Correction;
pub use correlation::{
    correlate, CategoricalPolicy, CorrectionScope, CorrelationCell, CorrelationConfig,
    CorrelationMethod, CorrelationResult, SignificanceBins,
};
pub use elbow::{components_for_variance, elbow_of, find_elbow, find_elbow_by_curvature, ElbowPoint};
pub use error::{PcaError, Result};
pub use filter::{filter_low_variance, VarianceFilterSpec};
pub use linalg_backends::{ExactSvd, RandomizedSvd, SvdBackend, SvdOutput};
pub use matrix::FeatureMatrix;
pub use metadata::{Attribute, AttributeKind, AttributeValue, Metadata};
pub use model::{PcaResult, VarianceBasis};
pub use parallel_analysis::{
    parallel_analysis, CancelPolicy, CancellationToken, FailurePolicy, NullModel, NullSummary,
    ParallelAnalysisConfig, ParallelAnalysisResult,
};
pub use pca::{max_components, run_pca, PcaOptions};
