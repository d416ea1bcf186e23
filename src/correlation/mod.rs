use anyhow::bail;
use ndarray::ArrayView1;
use num_traits::{Float, FromPrimitive, ToPrimitive};

use crate::utils::average_ranks;

pub trait CorrelationMeasure {
    fn name(&self) -> &'static str;

    fn calculate<T>(&self, a: ArrayView1<T>, b: ArrayView1<T>) -> anyhow::Result<f64>
    where
        T: Float + FromPrimitive + ToPrimitive;
}

fn check_lengths(a: usize, b: usize) -> anyhow::Result<()> {
    if a != b {
        bail!("Cannot correlate vectors of different lengths ({} vs {})", a, b);
    }
    if a < 2 {
        bail!("At least two paired observations are required, got {}", a);
    }
    Ok(())
}

pub struct PearsonCorrelation;

impl CorrelationMeasure for PearsonCorrelation {
    fn name(&self) -> &'static str {
        "pearson"
    }

    fn calculate<T>(&self, a: ArrayView1<T>, b: ArrayView1<T>) -> anyhow::Result<f64>
    where
        T: Float + FromPrimitive + ToPrimitive,
    {
        check_lengths(a.len(), b.len())?;
        let a: Vec<f64> = a.iter().map(|v| v.to_f64().unwrap_or(f64::NAN)).collect();
        let b: Vec<f64> = b.iter().map(|v| v.to_f64().unwrap_or(f64::NAN)).collect();
        Ok(pearson(&a, &b))
    }
}

/// Rank correlation, Pearson on average ranks.
pub struct SpearmanCorrelation;

impl CorrelationMeasure for SpearmanCorrelation {
    fn name(&self) -> &'static str {
        "spearman"
    }

    fn calculate<T>(&self, a: ArrayView1<T>, b: ArrayView1<T>) -> anyhow::Result<f64>
    where
        T: Float + FromPrimitive + ToPrimitive,
    {
        check_lengths(a.len(), b.len())?;
        let a: Vec<f64> = a.iter().map(|v| v.to_f64().unwrap_or(f64::NAN)).collect();
        let b: Vec<f64> = b.iter().map(|v| v.to_f64().unwrap_or(f64::NAN)).collect();
        Ok(pearson(&average_ranks(&a), &average_ranks(&b)))
    }
}

fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len() as f64;
    let mut sum_a = 0.0;
    let mut sum_b = 0.0;
    let mut sum_ab = 0.0;
    let mut sum_a_sq = 0.0;
    let mut sum_b_sq = 0.0;

    for (&x, &y) in a.iter().zip(b) {
        sum_a += x;
        sum_b += y;
        sum_ab += x * y;
        sum_a_sq += x * x;
        sum_b_sq += y * y;
    }

    let numerator = sum_ab - (sum_a * sum_b) / n;
    let denominator =
        ((sum_a_sq - (sum_a * sum_a) / n) * (sum_b_sq - (sum_b * sum_b) / n)).sqrt();

    if denominator > f64::EPSILON {
        numerator / denominator
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_pearson_correlation() {
        let a = array![1.0, 2.0, 3.0, 4.0, 5.0];
        let b = array![2.0, 4.0, 6.0, 8.0, 10.0];
        let c = array![5.0, 4.0, 3.0, 2.0, 1.0];

        let r = PearsonCorrelation.calculate(a.view(), b.view()).unwrap();
        assert_relative_eq!(r, 1.0, epsilon = 1e-12);

        let r = PearsonCorrelation.calculate(a.view(), c.view()).unwrap();
        assert_relative_eq!(r, -1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_spearman_is_rank_based() {
        let a = array![1.0, 2.0, 3.0, 4.0, 5.0];
        let b = array![1.0, 8.0, 27.0, 64.0, 1000.0];

        let rho = SpearmanCorrelation.calculate(a.view(), b.view()).unwrap();
        let r = PearsonCorrelation.calculate(a.view(), b.view()).unwrap();
        assert_relative_eq!(rho, 1.0, epsilon = 1e-12);
        assert!(r < 1.0);
    }

    #[test]
    fn test_constant_vector() {
        let a = array![1.0, 2.0, 3.0];
        let b = array![4.0, 4.0, 4.0];
        assert_eq!(PearsonCorrelation.calculate(a.view(), b.view()).unwrap(), 0.0);
    }

    #[test]
    fn test_length_mismatch() {
        let a = array![1.0, 2.0, 3.0];
        let b = array![1.0, 2.0];
        assert!(PearsonCorrelation.calculate(a.view(), b.view()).is_err());
    }
}
