//! # Report pipeline
//!
//! Runs the analysis top to bottom over a loaded [`SampleTable`]:
//! transform selection on the flagged columns, the factor count sweep, the
//! final fit at the chosen count, and the correlation of the first factor's
//! scores with the response column.

use std::fmt;
use std::ops::RangeInclusive;

use anyhow::{anyhow, bail, Context};
use log::info;

use crate::correlation::{CorrelationMeasure, PearsonCorrelation, SpearmanCorrelation};
use crate::data::SampleTable;
use crate::factor::{sweep, FactorAnalysis, FactorFit, SweepReport};
use crate::normalize::{flag_skewed, normalize_columns, Normalization, Normalizer};

pub const FIRST_FACTOR_SCORE: &str = "factor1_score";

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnSelection {
    /// Leave every column untouched.
    None,
    /// Columns whose absolute skewness exceeds the threshold.
    Skewed(f64),
    Named(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct ReportConfig {
    pub columns: ColumnSelection,
    pub normalizer: Normalizer,
    pub analysis: FactorAnalysis,
    pub factor_range: RangeInclusive<usize>,
    pub chosen_factors: usize,
    pub alpha: f64,
}

#[derive(Debug, Clone)]
pub struct Report {
    pub normalizations: Vec<(String, Normalization)>,
    pub sweep: SweepReport,
    pub final_fit: FactorFit,
    pub response_name: String,
    pub pearson: f64,
    pub spearman: f64,
    pub alpha: f64,
}

pub fn resolve_columns(table: &SampleTable, selection: &ColumnSelection) -> anyhow::Result<Vec<usize>> {
    match selection {
        ColumnSelection::None => Ok(Vec::new()),
        ColumnSelection::Skewed(threshold) => Ok(flag_skewed(table, *threshold)),
        ColumnSelection::Named(names) => names
            .iter()
            .map(|name| {
                table
                    .variable_index(name)
                    .ok_or_else(|| anyhow!("Unknown concentration column `{}`", name))
            })
            .collect(),
    }
}

/// Refits at `n_factors`, appends the first factor's scores to the table and returns the fit.
pub fn final_fit(
    table: &mut SampleTable,
    analysis: &FactorAnalysis,
    n_factors: usize,
) -> anyhow::Result<FactorFit> {
    let fit = analysis
        .with_factors(n_factors)
        .fit_table(table)
        .with_context(|| format!("Final fit with {} factors failed", n_factors))?;
    let scores = fit
        .factor_scores(0)
        .ok_or_else(|| anyhow!("Final fit was configured without factor scores"))?
        .to_owned();
    table.add_derived(FIRST_FACTOR_SCORE, scores)?;
    Ok(fit)
}

/// Pearson and Spearman correlation of a derived column with the response.
pub fn correlate_with_response(table: &SampleTable, column: &str) -> anyhow::Result<(f64, f64)> {
    let values = table
        .derived(column)
        .ok_or_else(|| anyhow!("No derived column `{}`", column))?;
    let response = table.response();
    Ok((
        PearsonCorrelation.calculate(values, response)?,
        SpearmanCorrelation.calculate(values, response)?,
    ))
}

pub fn run(table: &mut SampleTable, config: &ReportConfig) -> anyhow::Result<Report> {
    if config.factor_range.is_empty() {
        bail!("Empty factor range {:?}", config.factor_range);
    }

    let columns = resolve_columns(table, &config.columns)?;
    info!("Normalizing {} of {} columns", columns.len(), table.variables().len());
    let normalizations = normalize_columns(table, &columns, &config.normalizer)?;

    info!("Sweeping factor counts {:?}", config.factor_range);
    let sweep = sweep(
        &config.analysis,
        table.concentrations(),
        table.variables(),
        config.factor_range.clone(),
    );

    let final_fit = final_fit(table, &config.analysis, config.chosen_factors)?;
    let (pearson, spearman) = correlate_with_response(table, FIRST_FACTOR_SCORE)?;
    info!(
        "{} vs {}: pearson {:.3}, spearman {:.3}",
        FIRST_FACTOR_SCORE,
        table.response_name(),
        pearson,
        spearman
    );

    Ok(Report {
        normalizations,
        sweep,
        final_fit,
        response_name: table.response_name().to_string(),
        pearson,
        spearman,
        alpha: config.alpha,
    })
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "== Normalizing transforms")?;
        if self.normalizations.is_empty() {
            writeln!(f, "(no columns transformed)")?;
        }
        for (name, normalization) in &self.normalizations {
            writeln!(f, "{}: {}", name, normalization.chosen)?;
            for candidate in &normalization.candidates {
                match &candidate.outcome {
                    Ok(stat) => writeln!(f, "  {:<12}{:>10.4}", candidate.kind, stat)?,
                    Err(e) => writeln!(f, "  {:<12}{:>10}  {}", candidate.kind, "-", e)?,
                }
            }
        }
        writeln!(f)?;

        writeln!(f, "== Factor count sweep (alpha = {})", self.alpha)?;
        writeln!(f, "{:>8}{:>12}{:>14}", "factors", "p-value", "cum. var")?;
        for entry in &self.sweep.entries {
            match &entry.outcome {
                Ok(fit) => {
                    let p = fit
                        .p_value
                        .map(|p| format!("{:.4}", p))
                        .unwrap_or_else(|| "n/a".to_string());
                    let flag = match fit.rejected_at(self.alpha) {
                        Some(true) => " *",
                        _ => "",
                    };
                    writeln!(
                        f,
                        "{:>8}{:>12}{:>14.3}{}",
                        entry.n_factors,
                        p,
                        fit.explained_variance(),
                        flag
                    )?
                }
                Err(e) => writeln!(f, "{:>8}  failed: {}", entry.n_factors, e)?,
            }
        }
        writeln!(f, "(* rejected at alpha)")?;
        writeln!(f)?;

        writeln!(f, "== Final model")?;
        writeln!(f, "{}", self.final_fit)?;
        writeln!(f)?;
        write!(
            f,
            "{} vs {}: pearson r = {:.3}, spearman rho = {:.3}",
            FIRST_FACTOR_SCORE, self.response_name, self.pearson, self.spearman
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factor::fixtures::{exact_structure, four_factor_loadings};
    use crate::factor::{FactorAnalysisBuilder, ScoreMethod};
    use crate::normalize::NormalizerBuilder;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array2};

    const NAMES: [&str; 8] = ["SiO2", "Al2O3", "Fe2O3", "CaO", "MgO", "Na2O", "K2O", "TiO2"];

    fn table_with_response(response: impl Fn(&Array2<f64>) -> Array1<f64>) -> SampleTable {
        let x = exact_structure(99, &four_factor_loadings(), 3);
        let y = response(&x);
        SampleTable::new(
            (1..=99).map(|i| format!("ash{:02}", i)).collect(),
            NAMES.iter().map(|s| s.to_string()).collect(),
            x,
            "ST",
            y,
        )
        .unwrap()
    }

    fn table() -> SampleTable {
        table_with_response(|x| x.column(0).mapv(|v| 1300.0 - 20.0 * v))
    }

    fn config(columns: ColumnSelection) -> ReportConfig {
        ReportConfig {
            columns,
            normalizer: NormalizerBuilder::new().build(),
            analysis: FactorAnalysisBuilder::new(4).build(),
            factor_range: 2..=5,
            chosen_factors: 4,
            alpha: 0.05,
        }
    }

    #[test]
    fn test_run_end_to_end() {
        // response that is an increasing function of the first factor's scores
        let mut table = table_with_response(|x| {
            let fit = FactorAnalysisBuilder::new(4).build().fit(x.view()).unwrap();
            fit.factor_scores(0).unwrap().mapv(|s| 1250.0 + 40.0 * s.tanh())
        });
        let report = run(&mut table, &config(ColumnSelection::None)).unwrap();

        assert!(report.normalizations.is_empty());
        assert_eq!(report.sweep.entries.len(), 4);
        assert_eq!(report.sweep.failures().count(), 1);
        assert_eq!(report.final_fit.n_factors, 4);
        assert!(table.derived(FIRST_FACTOR_SCORE).is_some());
        assert!(report.pearson > 0.9, "pearson {}", report.pearson);
        assert_abs_diff_eq!(report.spearman, 1.0, epsilon = 1e-12);

        let text = report.to_string();
        assert!(text.contains("Factor count sweep"));
        assert!(text.contains("failed"));
        assert!(text.contains("SiO2"));
        assert!(text.contains("spearman rho = 1.000"));
    }

    #[test]
    fn test_augmented_table_has_score_column() {
        let mut table = table();
        run(&mut table, &config(ColumnSelection::None)).unwrap();

        let mut out = Vec::new();
        table.write_csv(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let header = text.lines().next().unwrap();
        assert!(header.ends_with("factor1_score,ST"), "{}", header);
        assert_eq!(text.lines().count(), 100);
    }

    #[test]
    fn test_p_value_at_alpha_is_not_flagged() {
        let mut table = table();
        let mut report = run(&mut table, &config(ColumnSelection::None)).unwrap();
        let p4 = report.sweep.fit(4).unwrap().p_value.unwrap();
        report.alpha = p4;

        assert_eq!(report.sweep.fit(4).unwrap().rejected_at(p4), Some(false));
        let text = report.to_string();
        let row = text
            .lines()
            .find(|l| l.trim_start().starts_with("4 ") && l.contains(&format!("{:.4}", p4)))
            .unwrap();
        assert!(!row.ends_with('*'), "{}", row);
    }

    #[test]
    fn test_named_columns_are_normalized() {
        let mut table = table();
        let report = run(
            &mut table,
            &config(ColumnSelection::Named(vec!["Fe2O3".to_string()])),
        )
        .unwrap();

        assert_eq!(report.normalizations.len(), 1);
        assert_eq!(report.normalizations[0].0, "Fe2O3");
        assert_eq!(
            table.column(2).to_vec(),
            report.normalizations[0].1.transformed
        );
    }

    #[test]
    fn test_unknown_column() {
        let table = table();
        let err = resolve_columns(&table, &ColumnSelection::Named(vec!["Li2O".to_string()]));
        assert!(err.is_err());
    }

    #[test]
    fn test_final_fit_requires_scores() {
        let mut table = table();
        let fa = FactorAnalysisBuilder::new(4).scores(ScoreMethod::None).build();
        assert!(final_fit(&mut table, &fa, 4).is_err());
        assert!(table.derived(FIRST_FACTOR_SCORE).is_none());
    }

    #[test]
    fn test_infeasible_final_count_is_an_error() {
        let mut table = table();
        let mut cfg = config(ColumnSelection::None);
        cfg.chosen_factors = 5;
        assert!(run(&mut table, &cfg).is_err());
    }
}
