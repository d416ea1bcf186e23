//! # Normalizing transforms
//!
//! Each candidate is a monotone map followed by standardization with the mean
//! and standard deviation of the mapped training values. Fitting returns an
//! immutable [`FittedTransform`] holding every parameter needed to map new
//! values forward or to map transformed values back.

use std::fmt;

use statrs::distribution::{ContinuousCDF, Normal};
use thiserror::Error;

use crate::utils::{all_finite, average_ranks, golden_section_max, mean_and_sd, min_max};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransformError {
    #[error("{kind} needs at least {required} values, got {found}")]
    TooFewValues {
        kind: TransformKind,
        required: usize,
        found: usize,
    },

    #[error("{kind} is undefined for {value}")]
    Domain { kind: TransformKind, value: f64 },

    #[error("{kind} produced a non-finite value")]
    NonFinite { kind: TransformKind },

    #[error("{kind} output has zero variance")]
    ZeroVariance { kind: TransformKind },

    #[error("Normality statistic failed for {kind}: {reason}")]
    Statistic { kind: TransformKind, reason: String },

    #[error("No candidate transform could be fit")]
    NoCandidate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransformKind {
    Identity,
    Sqrt,
    Log,
    Arcsinh,
    Exp,
    BoxCox,
    YeoJohnson,
    OrderNorm,
}

impl TransformKind {
    /// Full menu in tie-break order.
    pub const ALL: [TransformKind; 8] = [
        TransformKind::Identity,
        TransformKind::Sqrt,
        TransformKind::Log,
        TransformKind::Arcsinh,
        TransformKind::Exp,
        TransformKind::BoxCox,
        TransformKind::YeoJohnson,
        TransformKind::OrderNorm,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Sqrt => "sqrt",
            Self::Log => "log",
            Self::Arcsinh => "arcsinh",
            Self::Exp => "exp",
            Self::BoxCox => "boxcox",
            Self::YeoJohnson => "yeojohnson",
            Self::OrderNorm => "ordernorm",
        }
    }

    /// Fits the transform to `values`.
    ///
    /// `log_offset` is the epsilon used to shift a log candidate away from
    /// zero: the offset is `max(0, log_offset - min(values))`.
    pub fn fit(&self, values: &[f64], log_offset: f64) -> Result<FittedTransform, TransformError> {
        let kind = *self;
        if values.len() < 3 {
            return Err(TransformError::TooFewValues {
                kind,
                required: 3,
                found: values.len(),
            });
        }
        if let Some(&value) = values.iter().find(|v| !v.is_finite()) {
            return Err(TransformError::Domain { kind, value });
        }
        let (lo, _) = min_max(values).ok_or(TransformError::TooFewValues {
            kind,
            required: 3,
            found: 0,
        })?;

        let mapping = match kind {
            Self::Identity => Mapping::Identity,
            Self::Sqrt => Mapping::Sqrt {
                offset: (-lo).max(0.0),
            },
            Self::Log => Mapping::Log {
                offset: (log_offset - lo).max(0.0),
            },
            Self::Arcsinh => Mapping::Arcsinh,
            Self::Exp => Mapping::Exp,
            Self::BoxCox => {
                if lo <= 0.0 {
                    return Err(TransformError::Domain { kind, value: lo });
                }
                Mapping::BoxCox {
                    lambda: box_cox_lambda(values),
                }
            }
            Self::YeoJohnson => Mapping::YeoJohnson {
                lambda: yeo_johnson_lambda(values),
            },
            Self::OrderNorm => Mapping::OrderNorm(OrderNormTable::fit(values)?),
        };

        FittedTransform::standardized(mapping, values)
    }
}

impl fmt::Display for TransformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mapping {
    Identity,
    Sqrt { offset: f64 },
    Log { offset: f64 },
    Arcsinh,
    Exp,
    BoxCox { lambda: f64 },
    YeoJohnson { lambda: f64 },
    OrderNorm(OrderNormTable),
}

impl Mapping {
    pub fn kind(&self) -> TransformKind {
        match self {
            Self::Identity => TransformKind::Identity,
            Self::Sqrt { .. } => TransformKind::Sqrt,
            Self::Log { .. } => TransformKind::Log,
            Self::Arcsinh => TransformKind::Arcsinh,
            Self::Exp => TransformKind::Exp,
            Self::BoxCox { .. } => TransformKind::BoxCox,
            Self::YeoJohnson { .. } => TransformKind::YeoJohnson,
            Self::OrderNorm(_) => TransformKind::OrderNorm,
        }
    }

    fn forward(&self, x: f64) -> f64 {
        match self {
            Self::Identity => x,
            Self::Sqrt { offset } => (x + offset).sqrt(),
            Self::Log { offset } => (x + offset).ln(),
            Self::Arcsinh => x.asinh(),
            Self::Exp => x.exp(),
            Self::BoxCox { lambda } => box_cox(x, *lambda),
            Self::YeoJohnson { lambda } => yeo_johnson(x, *lambda),
            Self::OrderNorm(table) => table.forward(x),
        }
    }

    fn inverse(&self, y: f64) -> f64 {
        match self {
            Self::Identity => y,
            Self::Sqrt { offset } => y.max(0.0).powi(2) - offset,
            Self::Log { offset } => y.exp() - offset,
            Self::Arcsinh => y.sinh(),
            Self::Exp => y.ln(),
            Self::BoxCox { lambda } => inv_box_cox(y, *lambda),
            Self::YeoJohnson { lambda } => inv_yeo_johnson(y, *lambda),
            Self::OrderNorm(table) => table.inverse(y),
        }
    }
}

/// A fitted candidate: the monotone mapping plus the standardization removed after it.
#[derive(Debug, Clone, PartialEq)]
pub struct FittedTransform {
    mapping: Mapping,
    mean: f64,
    sd: f64,
}

impl FittedTransform {
    fn standardized(mapping: Mapping, values: &[f64]) -> Result<Self, TransformError> {
        let kind = mapping.kind();
        let mapped: Vec<f64> = values.iter().map(|&v| mapping.forward(v)).collect();
        if !all_finite(&mapped) {
            return Err(TransformError::NonFinite { kind });
        }

        let (mean, sd) = match mapping {
            Mapping::OrderNorm(_) => (0.0, 1.0),
            _ => mean_and_sd(&mapped),
        };
        if !(sd > f64::EPSILON) || !sd.is_finite() {
            return Err(TransformError::ZeroVariance { kind });
        }

        Ok(FittedTransform { mapping, mean, sd })
    }

    /// Refits the same kind on a subset of the values it was fitted on.
    ///
    /// The sqrt and log shifts are kept from this fit, so a value held out of
    /// `values` still maps to a finite number.
    pub fn refit(&self, values: &[f64], log_offset: f64) -> Result<Self, TransformError> {
        let mapping = match &self.mapping {
            Mapping::Sqrt { .. } | Mapping::Log { .. } => {
                let kind = self.kind();
                if values.len() < 3 {
                    return Err(TransformError::TooFewValues {
                        kind,
                        required: 3,
                        found: values.len(),
                    });
                }
                if let Some(&value) = values.iter().find(|v| !v.is_finite()) {
                    return Err(TransformError::Domain { kind, value });
                }
                self.mapping.clone()
            }
            _ => self.kind().fit(values, log_offset)?.mapping,
        };
        Self::standardized(mapping, values)
    }

    pub fn kind(&self) -> TransformKind {
        self.mapping.kind()
    }

    pub fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn sd(&self) -> f64 {
        self.sd
    }

    pub fn forward(&self, x: f64) -> f64 {
        (self.mapping.forward(x) - self.mean) / self.sd
    }

    pub fn inverse(&self, y: f64) -> f64 {
        self.mapping.inverse(y * self.sd + self.mean)
    }

    pub fn apply(&self, values: &[f64], inverse: bool) -> Vec<f64> {
        if inverse {
            values.iter().map(|&y| self.inverse(y)).collect()
        } else {
            values.iter().map(|&x| self.forward(x)).collect()
        }
    }
}

impl fmt::Display for FittedTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.mapping {
            Mapping::Sqrt { offset } | Mapping::Log { offset } => {
                write!(f, "{}(x + {:.4})", self.kind(), offset)?
            }
            Mapping::BoxCox { lambda } | Mapping::YeoJohnson { lambda } => {
                write!(f, "{}(lambda = {:.4})", self.kind(), lambda)?
            }
            Mapping::OrderNorm(table) => {
                write!(f, "{}({} knots)", self.kind(), table.x.len())?
            }
            _ => write!(f, "{}", self.kind())?,
        }
        write!(f, ", standardized (mean = {:.4}, sd = {:.4})", self.mean, self.sd)
    }
}

const LAMBDA_EPS: f64 = 1e-8;

fn box_cox(x: f64, lambda: f64) -> f64 {
    if x <= 0.0 {
        return f64::NAN;
    }
    if lambda.abs() < LAMBDA_EPS {
        x.ln()
    } else {
        (x.powf(lambda) - 1.0) / lambda
    }
}

fn inv_box_cox(y: f64, lambda: f64) -> f64 {
    if lambda.abs() < LAMBDA_EPS {
        y.exp()
    } else {
        (lambda * y + 1.0).powf(1.0 / lambda)
    }
}

fn yeo_johnson(x: f64, lambda: f64) -> f64 {
    if x >= 0.0 {
        if lambda.abs() < LAMBDA_EPS {
            x.ln_1p()
        } else {
            ((x + 1.0).powf(lambda) - 1.0) / lambda
        }
    } else if (lambda - 2.0).abs() < LAMBDA_EPS {
        -(-x).ln_1p()
    } else {
        -((1.0 - x).powf(2.0 - lambda) - 1.0) / (2.0 - lambda)
    }
}

fn inv_yeo_johnson(y: f64, lambda: f64) -> f64 {
    if y >= 0.0 {
        if lambda.abs() < LAMBDA_EPS {
            y.exp_m1()
        } else {
            (lambda * y + 1.0).powf(1.0 / lambda) - 1.0
        }
    } else if (lambda - 2.0).abs() < LAMBDA_EPS {
        1.0 - (-y).exp()
    } else {
        1.0 - (1.0 - (2.0 - lambda) * y).powf(1.0 / (2.0 - lambda))
    }
}

fn profile_log_likelihood(mapped: &[f64], jacobian: f64) -> f64 {
    let n = mapped.len() as f64;
    let (m, _) = mean_and_sd(mapped);
    let var = mapped.iter().map(|v| (v - m).powi(2)).sum::<f64>() / n;
    if !(var > 0.0) || !var.is_finite() {
        return f64::NEG_INFINITY;
    }
    -0.5 * n * var.ln() + jacobian
}

/// Maximum likelihood Box-Cox lambda on `[-1, 2]`. Values must be positive.
pub fn box_cox_lambda(values: &[f64]) -> f64 {
    let log_sum: f64 = values.iter().map(|v| v.ln()).sum();
    golden_section_max(
        |lambda| {
            let mapped: Vec<f64> = values.iter().map(|&v| box_cox(v, lambda)).collect();
            profile_log_likelihood(&mapped, (lambda - 1.0) * log_sum)
        },
        -1.0,
        2.0,
        1e-6,
    )
}

/// Maximum likelihood Yeo-Johnson lambda on `[-5, 5]`.
pub fn yeo_johnson_lambda(values: &[f64]) -> f64 {
    let log_sum: f64 = values.iter().map(|v| v.signum() * v.abs().ln_1p()).sum();
    golden_section_max(
        |lambda| {
            let mapped: Vec<f64> = values.iter().map(|&v| yeo_johnson(v, lambda)).collect();
            profile_log_likelihood(&mapped, (lambda - 1.0) * log_sum)
        },
        -5.0,
        5.0,
        1e-6,
    )
}

/// Lookup table of an ordered quantile normalization.
///
/// Unique training values map to `Φ⁻¹((rank - 0.5) / n)`; new values are
/// interpolated linearly and extrapolated past the ends with the least-squares
/// slope of the normal scores on the values.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderNormTable {
    x: Vec<f64>,
    z: Vec<f64>,
    slope: f64,
}

impl OrderNormTable {
    fn fit(values: &[f64]) -> Result<Self, TransformError> {
        let kind = TransformKind::OrderNorm;
        let n = values.len() as f64;
        let normal = Normal::new(0.0, 1.0).map_err(|e| TransformError::Statistic {
            kind,
            reason: e.to_string(),
        })?;
        let ranks = average_ranks(values);
        let scores: Vec<f64> = ranks
            .iter()
            .map(|r| normal.inverse_cdf((r - 0.5) / n))
            .collect();

        let mut pairs: Vec<(f64, f64)> = values.iter().copied().zip(scores.iter().copied()).collect();
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
        pairs.dedup_by(|a, b| a.0 == b.0);
        if pairs.len() < 2 {
            return Err(TransformError::ZeroVariance { kind });
        }

        let (mx, _) = mean_and_sd(values);
        let (mz, _) = mean_and_sd(&scores);
        let sxz: f64 = values
            .iter()
            .zip(&scores)
            .map(|(x, z)| (x - mx) * (z - mz))
            .sum();
        let sxx: f64 = values.iter().map(|x| (x - mx).powi(2)).sum();
        let slope = sxz / sxx;
        if !(slope > 0.0) || !slope.is_finite() {
            return Err(TransformError::ZeroVariance { kind });
        }

        let (x, z) = pairs.into_iter().unzip();
        Ok(Self { x, z, slope })
    }

    fn forward(&self, x: f64) -> f64 {
        interpolate(&self.x, &self.z, x, self.slope)
    }

    fn inverse(&self, z: f64) -> f64 {
        interpolate(&self.z, &self.x, z, 1.0 / self.slope)
    }
}

fn interpolate(from: &[f64], to: &[f64], v: f64, edge_slope: f64) -> f64 {
    let last = from.len() - 1;
    if v <= from[0] {
        return to[0] + (v - from[0]) * edge_slope;
    }
    if v >= from[last] {
        return to[last] + (v - from[last]) * edge_slope;
    }
    let hi = from.partition_point(|&f| f < v);
    let lo = hi - 1;
    let t = (v - from[lo]) / (from[hi] - from[lo]);
    to[lo] + t * (to[hi] - to[lo])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn skewed_column() -> Vec<f64> {
        (1..=40).map(|i| (i as f64 / 8.0).exp() - 1.0).collect()
    }

    #[test]
    fn test_round_trip_every_kind() {
        let values: Vec<f64> = skewed_column().iter().map(|v| v / 20.0 + 0.5).collect();
        for kind in TransformKind::ALL {
            let fitted = match kind.fit(&values, 0.001) {
                Ok(fitted) => fitted,
                Err(e) => panic!("{} failed to fit: {}", kind, e),
            };
            let forward = fitted.apply(&values, false);
            let back = fitted.apply(&forward, true);
            for (orig, round) in values.iter().zip(&back) {
                assert_relative_eq!(*orig, *round, epsilon = 1e-8, max_relative = 1e-8);
            }
        }
    }

    #[test]
    fn test_standardized_output() {
        let values = skewed_column();
        let fitted = TransformKind::Log.fit(&values, 0.001).unwrap();
        let (m, s) = mean_and_sd(&fitted.apply(&values, false));
        assert_relative_eq!(m, 0.0, epsilon = 1e-10);
        assert_relative_eq!(s, 1.0, epsilon = 1e-10);
    }

    #[test]
    fn test_log_offsets_zero_values() {
        let mut with_zero = skewed_column();
        with_zero[0] = 0.0;

        let fitted = TransformKind::Log.fit(&with_zero, 0.001).unwrap();
        match fitted.mapping() {
            Mapping::Log { offset } => assert_relative_eq!(*offset, 0.001),
            other => panic!("unexpected mapping {:?}", other),
        }
        assert!(fitted.apply(&with_zero, false).iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_refit_keeps_shift_of_full_column() {
        let mut values = skewed_column();
        values[5] = 0.0;
        let full = TransformKind::Log.fit(&values, 0.001).unwrap();

        let train: Vec<f64> = values
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != 5)
            .map(|(_, &v)| v)
            .collect();
        let fold = full.refit(&train, 0.001).unwrap();
        assert_eq!(fold.mapping(), &Mapping::Log { offset: 0.001 });
        assert!(fold.forward(0.0).is_finite());

        let box_cox = TransformKind::BoxCox.fit(&train, 0.001).unwrap();
        let refit = box_cox.refit(&train[1..], 0.001).unwrap();
        assert_eq!(refit.kind(), TransformKind::BoxCox);
    }

    #[test]
    fn test_log_offset_zero_for_positive_data() {
        let values = [2.0, 3.0, 5.0, 9.0];
        let fitted = TransformKind::Log.fit(&values, 0.001).unwrap();
        assert_eq!(fitted.mapping(), &Mapping::Log { offset: 0.0 });
    }

    #[test]
    fn test_box_cox_rejects_zero() {
        let values = [0.0, 1.0, 2.0, 3.0];
        let err = TransformKind::BoxCox.fit(&values, 0.001).unwrap_err();
        assert_eq!(
            err,
            TransformError::Domain {
                kind: TransformKind::BoxCox,
                value: 0.0
            }
        );
    }

    #[test]
    fn test_box_cox_lambda_recovers_log() {
        let normal = Normal::new(0.0, 1.0).unwrap();
        let values: Vec<f64> = (1..=200)
            .map(|i| normal.inverse_cdf((i as f64 - 0.5) / 200.0).exp())
            .collect();
        let lambda = box_cox_lambda(&values);
        assert!(lambda.abs() < 0.1, "lambda {}", lambda);
    }

    #[test]
    fn test_exp_overflow_is_a_fit_failure() {
        let values = [1.0, 2.0, 800.0, 3.0];
        assert_eq!(
            TransformKind::Exp.fit(&values, 0.001).unwrap_err(),
            TransformError::NonFinite {
                kind: TransformKind::Exp
            }
        );
    }

    #[test]
    fn test_constant_column_fails() {
        let values = [4.0; 10];
        for kind in [TransformKind::Identity, TransformKind::Sqrt, TransformKind::OrderNorm] {
            assert_eq!(
                kind.fit(&values, 0.001).unwrap_err(),
                TransformError::ZeroVariance { kind }
            );
        }
    }

    #[test]
    fn test_order_norm_extrapolates_monotonically() {
        let values = skewed_column();
        let fitted = TransformKind::OrderNorm.fit(&values, 0.001).unwrap();
        let below = fitted.forward(-1.0);
        let first = fitted.forward(values[0]);
        let last = fitted.forward(values[values.len() - 1]);
        let above = fitted.forward(1000.0);
        assert!(below < first);
        assert!(above > last);
        assert_relative_eq!(fitted.inverse(above), 1000.0, epsilon = 1e-8);
    }

    #[test]
    fn test_yeo_johnson_handles_negative_values() {
        for lambda in [-1.0, 0.0, 0.5, 2.0, 3.0] {
            for x in [-3.0, -0.5, 0.0, 0.5, 3.0] {
                assert_relative_eq!(
                    inv_yeo_johnson(yeo_johnson(x, lambda), lambda),
                    x,
                    epsilon = 1e-10
                );
            }
        }
    }
}
