//! # Transform selection
//!
//! Scores every candidate transform of a column by how far its output departs
//! from normality and keeps the best one. Scoring uses leave-one-out by
//! default: each value is mapped by a transform fitted without it, and the
//! statistic is computed over those held-out mappings.
//!
//! Candidates that cannot be fitted are recorded with the reason and left out
//! of the selection; they never abort the column.

pub mod transforms;

use log::{debug, info};

use crate::data::SampleTable;
use crate::statistics::{skewness, NormalityStatistic};

pub use transforms::{FittedTransform, Mapping, TransformError, TransformKind};

pub const DEFAULT_LOG_OFFSET: f64 = 0.001;

pub struct NormalizerBuilder {
    loo: bool,
    allow_order_norm: bool,
    log_offset: f64,
    statistic: NormalityStatistic,
    candidates: Option<Vec<TransformKind>>,
}

impl NormalizerBuilder {
    pub fn new() -> Self {
        NormalizerBuilder {
            loo: true,
            allow_order_norm: true,
            log_offset: DEFAULT_LOG_OFFSET,
            statistic: NormalityStatistic::default(),
            candidates: None,
        }
    }

    pub fn loo(mut self, loo: bool) -> Self {
        self.loo = loo;
        self
    }

    pub fn allow_order_norm(mut self, allow: bool) -> Self {
        self.allow_order_norm = allow;
        self
    }

    pub fn log_offset(mut self, offset: f64) -> Self {
        self.log_offset = offset;
        self
    }

    pub fn statistic(mut self, statistic: NormalityStatistic) -> Self {
        self.statistic = statistic;
        self
    }

    /// Restricts the menu. Order matters for ties.
    pub fn candidates(mut self, candidates: Vec<TransformKind>) -> Self {
        self.candidates = Some(candidates);
        self
    }

    pub fn build(self) -> Normalizer {
        let menu = self
            .candidates
            .unwrap_or_else(|| TransformKind::ALL.to_vec())
            .into_iter()
            .filter(|k| self.allow_order_norm || *k != TransformKind::OrderNorm)
            .collect();
        Normalizer {
            loo: self.loo,
            log_offset: self.log_offset,
            statistic: self.statistic,
            menu,
        }
    }
}

impl Default for NormalizerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    loo: bool,
    log_offset: f64,
    statistic: NormalityStatistic,
    menu: Vec<TransformKind>,
}

#[derive(Debug, Clone)]
pub struct CandidateScore {
    pub kind: TransformKind,
    pub outcome: Result<f64, TransformError>,
}

/// Outcome of selecting a transform for one column.
#[derive(Debug, Clone)]
pub struct Normalization {
    pub chosen: FittedTransform,
    pub statistic: f64,
    pub transformed: Vec<f64>,
    pub candidates: Vec<CandidateScore>,
}

impl Normalization {
    pub fn kind(&self) -> TransformKind {
        self.chosen.kind()
    }

    /// Maps transformed values back to the original scale.
    pub fn invert(&self, values: &[f64]) -> Vec<f64> {
        self.chosen.apply(values, true)
    }
}

impl Normalizer {
    pub fn menu(&self) -> &[TransformKind] {
        &self.menu
    }

    /// Scores a single candidate; the statistic is lower for more normal output.
    pub fn score(&self, kind: TransformKind, values: &[f64]) -> Result<f64, TransformError> {
        let fitted = kind.fit(values, self.log_offset)?;

        let mapped = if self.loo {
            let mut held_out = Vec::with_capacity(values.len());
            let mut train = Vec::with_capacity(values.len().saturating_sub(1));
            for i in 0..values.len() {
                train.clear();
                train.extend_from_slice(&values[..i]);
                train.extend_from_slice(&values[i + 1..]);
                let fold = fitted.refit(&train, self.log_offset)?;
                held_out.push(fold.forward(values[i]));
            }
            held_out
        } else {
            fitted.apply(values, false)
        };

        if mapped.iter().any(|v| !v.is_finite()) {
            return Err(TransformError::NonFinite { kind });
        }

        self.statistic
            .calculate(&mapped)
            .map_err(|e| TransformError::Statistic {
                kind,
                reason: e.to_string(),
            })
    }

    /// Picks the candidate with the smallest statistic, first in menu order on ties.
    pub fn select(&self, values: &[f64]) -> Result<Normalization, TransformError> {
        let candidates: Vec<CandidateScore> = self
            .menu
            .iter()
            .map(|&kind| {
                let outcome = self.score(kind, values);
                match &outcome {
                    Ok(stat) => debug!("{:>12}: {:.4}", kind, stat),
                    Err(e) => debug!("{:>12}: excluded ({})", kind, e),
                }
                CandidateScore { kind, outcome }
            })
            .collect();

        let (best_kind, statistic) = candidates
            .iter()
            .filter_map(|c| c.outcome.as_ref().ok().map(|&s| (c.kind, s)))
            .fold(None, |best: Option<(TransformKind, f64)>, (kind, s)| match best {
                Some((_, b)) if b <= s => best,
                _ => Some((kind, s)),
            })
            .ok_or(TransformError::NoCandidate)?;

        let chosen = best_kind.fit(values, self.log_offset)?;
        let transformed = chosen.apply(values, false);

        Ok(Normalization {
            chosen,
            statistic,
            transformed,
            candidates,
        })
    }
}

/// Indices of concentration columns whose absolute skewness exceeds `threshold`.
pub fn flag_skewed(table: &SampleTable, threshold: f64) -> Vec<usize> {
    (0..table.variables().len())
        .filter(|&j| {
            let values = table.column(j).to_vec();
            skewness(&values).is_some_and(|s| s.abs() > threshold)
        })
        .collect()
}

/// Normalizes the given columns in place, returning the fitted selection per column.
pub fn normalize_columns(
    table: &mut SampleTable,
    columns: &[usize],
    normalizer: &Normalizer,
) -> anyhow::Result<Vec<(String, Normalization)>> {
    let mut fitted = Vec::with_capacity(columns.len());
    for &j in columns {
        let name = table
            .variables()
            .get(j)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No concentration column at index {}", j))?;
        let values = table.column(j).to_vec();
        let normalization = normalizer
            .select(&values)
            .map_err(|e| anyhow::anyhow!("Column `{}`: {}", name, e))?;

        info!(
            "{}: {} (statistic {:.4})",
            name, normalization.chosen, normalization.statistic
        );
        table.replace_column(j, &normalization.transformed)?;
        fitted.push((name, normalization));
    }
    Ok(fitted)
}
