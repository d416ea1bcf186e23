//! # Statistics
//!
//! Scalar summaries used by transform selection and model fitting:
//! the Pearson chi-square normality statistic, sample skewness and
//! chi-square tail probabilities.

use anyhow::{anyhow, bail};
use statrs::distribution::{ChiSquared, ContinuousCDF, Normal};

use crate::utils::mean_and_sd;

/// Statistic used to rank candidate transforms. Smaller means closer to normal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NormalityStatistic {
    /// Pearson chi-square statistic divided by its degrees of freedom.
    #[default]
    PearsonPerDf,
}

impl NormalityStatistic {
    pub fn calculate(&self, values: &[f64]) -> anyhow::Result<f64> {
        match self {
            Self::PearsonPerDf => {
                let test = pearson_test(values)?;
                Ok(test.statistic / test.df as f64)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PearsonTest {
    pub statistic: f64,
    pub df: usize,
    pub n_classes: usize,
}

/// Pearson chi-square test of composite normality.
///
/// Values are binned into `ceil(2 n^(2/5))` classes that are equiprobable under
/// a normal with the sample mean and standard deviation. Two degrees of freedom
/// are removed for the estimated parameters.
pub fn pearson_test(values: &[f64]) -> anyhow::Result<PearsonTest> {
    let n = values.len();
    if n < 8 {
        bail!("Pearson normality test needs at least 8 values, got {}", n);
    }
    if values.iter().any(|v| !v.is_finite()) {
        bail!("Pearson normality test received non-finite values");
    }

    let (m, s) = mean_and_sd(values);
    if !(s > 0.0) {
        bail!("Pearson normality test received values with zero variance");
    }

    let n_classes = (2.0 * (n as f64).powf(0.4)).ceil() as usize;
    let normal = Normal::new(m, s).map_err(|e| anyhow!("Invalid normal parameters: {}", e))?;

    let mut counts = vec![0usize; n_classes];
    for &v in values {
        let class = (n_classes as f64 * normal.cdf(v)).floor() as usize;
        counts[class.min(n_classes - 1)] += 1;
    }

    let expected = n as f64 / n_classes as f64;
    let statistic = counts
        .iter()
        .map(|&c| (c as f64 - expected).powi(2) / expected)
        .sum();

    Ok(PearsonTest {
        statistic,
        df: n_classes - 3,
        n_classes,
    })
}

/// Adjusted Fisher-Pearson sample skewness.
pub fn skewness(values: &[f64]) -> Option<f64> {
    let n = values.len();
    if n < 3 {
        return None;
    }
    let (m, s) = mean_and_sd(values);
    if !(s > 0.0) {
        return None;
    }
    let nf = n as f64;
    let m3 = values.iter().map(|v| ((v - m) / s).powi(3)).sum::<f64>();
    Some(nf / ((nf - 1.0) * (nf - 2.0)) * m3)
}

/// Upper tail probability `P(X > statistic)` of a chi-square variable.
pub fn chi_squared_sf(statistic: f64, df: f64) -> anyhow::Result<f64> {
    let dist = ChiSquared::new(df).map_err(|e| anyhow!("Invalid chi-square parameters: {}", e))?;
    Ok(dist.sf(statistic.max(0.0)))
}
