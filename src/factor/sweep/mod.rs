//! Fits one model per candidate factor count. A failed count is logged and
//! recorded, the remaining counts are still fitted.

use log::{info, warn};
use ndarray::ArrayView2;
use serde::Serialize;

use super::{FactorAnalysis, FactorError, FactorFit};

#[derive(Debug, Clone)]
pub struct SweepEntry {
    pub n_factors: usize,
    pub outcome: Result<FactorFit, FactorError>,
}

/// One row of the model selection series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SeriesPoint {
    pub factors: usize,
    pub p_value: Option<f64>,
    pub cumulative_variance: f64,
}

#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub entries: Vec<SweepEntry>,
}

impl SweepReport {
    /// `(k, p-value)` for every successful fit, in sweep order.
    pub fn p_values(&self) -> Vec<(usize, Option<f64>)> {
        self.fits().map(|fit| (fit.n_factors, fit.p_value)).collect()
    }

    /// `(k, cumulative explained variance)` for every successful fit, in sweep order.
    pub fn cumulative_variance(&self) -> Vec<(usize, f64)> {
        self.fits()
            .map(|fit| (fit.n_factors, fit.explained_variance()))
            .collect()
    }

    pub fn series(&self) -> Vec<SeriesPoint> {
        self.fits()
            .map(|fit| SeriesPoint {
                factors: fit.n_factors,
                p_value: fit.p_value,
                cumulative_variance: fit.explained_variance(),
            })
            .collect()
    }

    pub fn fits(&self) -> impl Iterator<Item = &FactorFit> {
        self.entries.iter().filter_map(|e| e.outcome.as_ref().ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = (usize, &FactorError)> {
        self.entries
            .iter()
            .filter_map(|e| e.outcome.as_ref().err().map(|err| (e.n_factors, err)))
    }

    pub fn fit(&self, n_factors: usize) -> Option<&FactorFit> {
        self.fits().find(|fit| fit.n_factors == n_factors)
    }
}

/// Fits `analysis` once per factor count in `factor_counts` over the columns of `x`.
pub fn sweep(
    analysis: &FactorAnalysis,
    x: ArrayView2<f64>,
    variables: &[String],
    factor_counts: impl IntoIterator<Item = usize>,
) -> SweepReport {
    let entries = factor_counts
        .into_iter()
        .map(|k| {
            let outcome = analysis.with_factors(k).fit_named(x, variables.to_vec());
            match &outcome {
                Ok(fit) => info!(
                    "{} factors: p-value {}, cumulative variance {:.3}",
                    k,
                    fit.p_value
                        .map(|p| format!("{:.4}", p))
                        .unwrap_or_else(|| "n/a".to_string()),
                    fit.explained_variance()
                ),
                Err(e) => warn!("{} factors: fit failed: {}", k, e),
            }
            SweepEntry {
                n_factors: k,
                outcome,
            }
        })
        .collect();
    SweepReport { entries }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factor::fixtures::{exact_structure, four_factor_loadings};
    use crate::factor::FactorAnalysisBuilder;

    fn names() -> Vec<String> {
        (1..=8).map(|i| format!("E{}", i)).collect()
    }

    #[test]
    fn test_failed_count_does_not_stop_sweep() {
        let x = exact_structure(99, &four_factor_loadings(), 3);
        let fa = FactorAnalysisBuilder::new(2).build();
        let report = sweep(&fa, x.view(), &names(), 2..=5);

        assert_eq!(report.entries.len(), 4);
        let ks: Vec<usize> = report.fits().map(|f| f.n_factors).collect();
        assert_eq!(ks, vec![2, 3, 4]);

        let failures: Vec<_> = report.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, 5);
        assert!(matches!(failures[0].1, FactorError::TooManyFactors { .. }));
    }

    #[test]
    fn test_cumulative_variance_is_non_decreasing() {
        let x = exact_structure(99, &four_factor_loadings(), 3);
        let fa = FactorAnalysisBuilder::new(2).build();
        let report = sweep(&fa, x.view(), &names(), 2..=5);

        let series = report.cumulative_variance();
        for pair in series.windows(2) {
            assert!(
                pair[1].1 >= pair[0].1 - 1e-9,
                "{} factors explain less than {}",
                pair[1].0,
                pair[0].0
            );
        }
        assert!(report.fit(4).unwrap().explained_variance() > report.fit(2).unwrap().explained_variance());
    }

    #[test]
    fn test_p_value_selects_four_factors() {
        let x = exact_structure(99, &four_factor_loadings(), 3);
        let fa = FactorAnalysisBuilder::new(2).build();
        let report = sweep(&fa, x.view(), &names(), 2..=5);

        let p = report.p_values();
        assert_eq!(p.len(), 3);
        let p2 = p[0].1.unwrap();
        let p4 = p[2].1.unwrap();
        assert!(p2 < 0.05, "two factors should be rejected, p = {}", p2);
        assert!(p4 > 0.05, "four factors should fit, p = {}", p4);

        let series = report.series();
        assert_eq!(series[2].factors, 4);
        assert_eq!(series[2].p_value, Some(p4));
    }

    #[test]
    fn test_series_serializes_to_csv() {
        let x = exact_structure(99, &four_factor_loadings(), 3);
        let fa = FactorAnalysisBuilder::new(2).build();
        let report = sweep(&fa, x.view(), &names(), [2, 5]);

        let mut wtr = csv::Writer::from_writer(vec![]);
        for point in report.series() {
            wtr.serialize(point).unwrap();
        }
        let text = String::from_utf8(wtr.into_inner().unwrap()).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("factors,p_value,cumulative_variance"));
        assert!(lines.next().unwrap().starts_with("2,"));
        assert_eq!(lines.next(), None);
    }
}
