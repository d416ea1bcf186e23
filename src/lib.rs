pub mod correlation;
pub mod data;
pub mod dense;
pub mod factor;
pub mod normalize;
pub mod report;
pub mod statistics;
pub mod utils;

pub use data::{DataError, SampleTable};
pub use factor::{FactorAnalysis, FactorAnalysisBuilder, FactorError, FactorFit, Rotation, ScoreMethod};
pub use normalize::{Normalization, Normalizer, NormalizerBuilder, TransformKind};
pub use report::{ColumnSelection, Report, ReportConfig};
pub use utils::Standardize;
