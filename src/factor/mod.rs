//! # Maximum-likelihood factor analysis
//!
//! Fits `R ≈ ΛΛᵀ + Ψ` to the sample correlation matrix of the input columns by
//! minimizing the ML discrepancy over the uniquenesses `Ψ`, then rotates the
//! loadings, tests the fit with a chi-square statistic and optionally
//! computes per-observation factor scores.
//!
//! ## Usage
//! ```no_run
//! use ash_efa::factor::{FactorAnalysisBuilder, Rotation, ScoreMethod};
//! # let x = ndarray::Array2::<f64>::zeros((99, 8));
//! let fa = FactorAnalysisBuilder::new(4)
//!     .rotation(Rotation::Varimax)
//!     .scores(ScoreMethod::Regression)
//!     .build();
//! let fit = fa.fit(x.view())?;
//! println!("{}", fit);
//! # Ok::<(), ash_efa::factor::FactorError>(())
//! ```

pub mod rotation;
pub mod sweep;

use std::fmt;

use log::debug;
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use thiserror::Error;

use crate::data::SampleTable;
use crate::dense::{correlation_matrix, from_dmatrix, to_dmatrix};
use crate::statistics::chi_squared_sf;
use crate::utils::Standardize;

pub use rotation::Rotation;
pub use sweep::{sweep, SeriesPoint, SweepEntry, SweepReport};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FactorError {
    #[error("{factors} factors are too many for {variables} variables")]
    TooManyFactors { factors: usize, variables: usize },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Singular matrix: {0}")]
    Singular(String),

    #[error("No convergence after {iterations} iterations (projected gradient {gradient:.3e})")]
    NoConvergence { iterations: usize, gradient: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScoreMethod {
    None,
    /// Thomson's regression scores `Z R⁻¹ Λ`.
    #[default]
    Regression,
    /// Weighted least squares scores `Z Ψ⁻¹ Λ (Λᵀ Ψ⁻¹ Λ)⁻¹`.
    Bartlett,
}

/// Degrees of freedom of the k-factor model on p variables, negative when over-parameterized.
pub fn degrees_of_freedom(variables: usize, factors: usize) -> i64 {
    let (p, k) = (variables as i64, factors as i64);
    ((p - k).pow(2) - p - k) / 2
}

pub struct FactorAnalysisBuilder {
    n_factors: usize,
    rotation: Rotation,
    scores: ScoreMethod,
    lower_bound: f64,
    max_iter: usize,
    pg_tolerance: f64,
    f_tolerance: f64,
}

impl FactorAnalysisBuilder {
    pub fn new(n_factors: usize) -> Self {
        FactorAnalysisBuilder {
            n_factors,
            rotation: Rotation::Varimax,
            scores: ScoreMethod::Regression,
            lower_bound: 0.005,
            max_iter: 5000,
            pg_tolerance: 1e-8,
            f_tolerance: 1e-12,
        }
    }

    pub fn rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn scores(mut self, scores: ScoreMethod) -> Self {
        self.scores = scores;
        self
    }

    /// Smallest uniqueness the optimizer may reach.
    pub fn lower_bound(mut self, lower_bound: f64) -> Self {
        self.lower_bound = lower_bound;
        self
    }

    pub fn max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn tolerance(mut self, pg_tolerance: f64, f_tolerance: f64) -> Self {
        self.pg_tolerance = pg_tolerance;
        self.f_tolerance = f_tolerance;
        self
    }

    pub fn build(self) -> FactorAnalysis {
        FactorAnalysis {
            n_factors: self.n_factors,
            rotation: self.rotation,
            scores: self.scores,
            lower_bound: self.lower_bound,
            max_iter: self.max_iter,
            pg_tolerance: self.pg_tolerance,
            f_tolerance: self.f_tolerance,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FactorAnalysis {
    n_factors: usize,
    rotation: Rotation,
    scores: ScoreMethod,
    lower_bound: f64,
    max_iter: usize,
    pg_tolerance: f64,
    f_tolerance: f64,
}

/// A fitted k-factor model.
#[derive(Debug, Clone)]
pub struct FactorFit {
    pub n_factors: usize,
    pub n_obs: usize,
    pub variables: Vec<String>,
    /// `p × k`, rotated, factors ordered by decreasing sum of squares.
    pub loadings: Array2<f64>,
    pub uniquenesses: Array1<f64>,
    pub rotation: Rotation,
    pub rotation_matrix: Option<Array2<f64>>,
    pub objective: f64,
    pub statistic: f64,
    pub dof: usize,
    /// `None` when the model has zero degrees of freedom.
    pub p_value: Option<f64>,
    pub iterations: usize,
    pub scores: Option<Array2<f64>>,
}

impl FactorFit {
    pub fn n_variables(&self) -> usize {
        self.loadings.nrows()
    }

    /// Sum of squared loadings per factor.
    pub fn ss_loadings(&self) -> Array1<f64> {
        self.loadings.mapv(|l| l * l).sum_axis(Axis(0))
    }

    pub fn proportion_var(&self) -> Array1<f64> {
        self.ss_loadings() / self.n_variables() as f64
    }

    pub fn cumulative_var(&self) -> Array1<f64> {
        let mut acc = 0.0;
        self.proportion_var().mapv(|v| {
            acc += v;
            acc
        })
    }

    /// Fraction of the total standardized variance explained by all factors.
    pub fn explained_variance(&self) -> f64 {
        self.loadings.mapv(|l| l * l).sum() / self.n_variables() as f64
    }

    pub fn communalities(&self) -> Array1<f64> {
        self.loadings.mapv(|l| l * l).sum_axis(Axis(1))
    }

    pub fn factor_scores(&self, factor: usize) -> Option<ArrayView1<'_, f64>> {
        self.scores
            .as_ref()
            .filter(|s| factor < s.ncols())
            .map(|s| s.column(factor))
    }

    /// Whether the k-factor hypothesis is rejected at `alpha`; `None` without a p-value.
    pub fn rejected_at(&self, alpha: f64) -> Option<bool> {
        self.p_value.map(|p| p < alpha)
    }
}

impl fmt::Display for FactorFit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .variables
            .iter()
            .map(String::len)
            .max()
            .unwrap_or(0)
            .max(14);

        writeln!(
            f,
            "Factor analysis with {} factors ({} rotation), {} observations",
            self.n_factors,
            self.rotation.name(),
            self.n_obs
        )?;
        writeln!(f)?;
        write!(f, "{:<width$}", "Uniquenesses:")?;
        writeln!(f)?;
        for (name, u) in self.variables.iter().zip(self.uniquenesses.iter()) {
            writeln!(f, "{:<width$}{:>8.3}", name, u)?;
        }
        writeln!(f)?;

        write!(f, "{:<width$}", "Loadings:")?;
        for j in 0..self.n_factors {
            write!(f, "{:>8}", format!("Factor{}", j + 1))?;
        }
        writeln!(f)?;
        for (i, name) in self.variables.iter().enumerate() {
            write!(f, "{:<width$}", name)?;
            for j in 0..self.n_factors {
                let l = self.loadings[[i, j]];
                // small loadings are blanked like the usual printed summary
                if l.abs() < 0.1 {
                    write!(f, "{:>8}", "")?;
                } else {
                    write!(f, "{:>8.3}", l)?;
                }
            }
            writeln!(f)?;
        }
        writeln!(f)?;

        for (label, row) in [
            ("SS loadings", self.ss_loadings()),
            ("Proportion Var", self.proportion_var()),
            ("Cumulative Var", self.cumulative_var()),
        ] {
            write!(f, "{:<width$}", label)?;
            for v in row.iter() {
                write!(f, "{:>8.3}", v)?;
            }
            writeln!(f)?;
        }
        writeln!(f)?;

        match self.p_value {
            Some(p) => write!(
                f,
                "Chi square statistic {:.2} on {} degrees of freedom, p-value {:.4}",
                self.statistic, self.dof, p
            ),
            None => write!(
                f,
                "{} degrees of freedom, no goodness of fit test (objective {:.4})",
                self.dof, self.objective
            ),
        }
    }
}

struct Evaluation {
    objective: f64,
    gradient: DVector<f64>,
    loadings: DMatrix<f64>,
}

impl FactorAnalysis {
    pub fn n_factors(&self) -> usize {
        self.n_factors
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    /// Same configuration with a different factor count.
    pub fn with_factors(&self, n_factors: usize) -> Self {
        Self {
            n_factors,
            ..self.clone()
        }
    }

    pub fn fit(&self, x: ArrayView2<f64>) -> Result<FactorFit, FactorError> {
        let names = (1..=x.ncols()).map(|j| format!("V{}", j)).collect();
        self.fit_named(x, names)
    }

    /// Fits the concentration columns of a table.
    pub fn fit_table(&self, table: &SampleTable) -> Result<FactorFit, FactorError> {
        self.fit_named(table.concentrations(), table.variables().to_vec())
    }

    pub fn fit_named(
        &self,
        x: ArrayView2<f64>,
        variables: Vec<String>,
    ) -> Result<FactorFit, FactorError> {
        let (n, p) = x.dim();
        let k = self.n_factors;

        if variables.len() != p {
            return Err(FactorError::InvalidInput(format!(
                "{} variable names for {} columns",
                variables.len(),
                p
            )));
        }
        if k == 0 {
            return Err(FactorError::InvalidInput(
                "at least one factor is required".to_string(),
            ));
        }
        if k > p || degrees_of_freedom(p, k) < 0 {
            return Err(FactorError::TooManyFactors {
                factors: k,
                variables: p,
            });
        }
        if n <= p {
            return Err(FactorError::InvalidInput(format!(
                "{} observations are not enough for {} variables",
                n, p
            )));
        }
        if x.iter().any(|v| !v.is_finite()) {
            return Err(FactorError::InvalidInput(
                "input contains non-finite values".to_string(),
            ));
        }

        let r = correlation_matrix(x).map_err(|e| FactorError::InvalidInput(e.to_string()))?;
        let r = to_dmatrix(r.view());
        let min_eigenvalue = r.clone().symmetric_eigenvalues().min();
        if !(min_eigenvalue > 1e-10) {
            return Err(FactorError::Singular(format!(
                "correlation matrix has eigenvalue {:.3e}",
                min_eigenvalue
            )));
        }
        let r_inv = r
            .clone()
            .cholesky()
            .ok_or_else(|| {
                FactorError::Singular("correlation matrix is not positive definite".to_string())
            })?
            .inverse();

        let (psi, eval, iterations) = self.optimize(&r, &r_inv, k)?;
        debug!(
            "{} factors: objective {:.6} after {} iterations",
            k, eval.objective, iterations
        );

        let dof = degrees_of_freedom(p, k) as usize;
        let (nf, pf, kf) = (n as f64, p as f64, k as f64);
        let statistic = (nf - 1.0 - (2.0 * pf + 5.0) / 6.0 - 2.0 * kf / 3.0) * eval.objective;
        let p_value = if dof > 0 {
            Some(
                chi_squared_sf(statistic, dof as f64)
                    .map_err(|e| FactorError::InvalidInput(e.to_string()))?,
            )
        } else {
            None
        };

        let rotated = match self.rotation {
            Rotation::None => rotation::RotationResult {
                loadings: eval.loadings,
                rotation_matrix: DMatrix::identity(k, k),
            },
            Rotation::Varimax => rotation::varimax(&eval.loadings, true, 1e-5, 1000),
        };
        let rotated = rotation::sort_and_orient(rotated);

        let scores = match self.scores {
            ScoreMethod::None => None,
            method => Some(self.compute_scores(x, &r_inv, &psi, &rotated.loadings, method)?),
        };

        Ok(FactorFit {
            n_factors: k,
            n_obs: n,
            variables,
            loadings: from_dmatrix(&rotated.loadings),
            uniquenesses: Array1::from(psi.as_slice().to_vec()),
            rotation: self.rotation,
            rotation_matrix: match self.rotation {
                Rotation::None => None,
                Rotation::Varimax => Some(from_dmatrix(&rotated.rotation_matrix)),
            },
            objective: eval.objective,
            statistic,
            dof,
            p_value,
            iterations,
            scores,
        })
    }

    /// Spectral projected gradient on the box `[lower_bound, 1]`.
    fn optimize(
        &self,
        r: &DMatrix<f64>,
        r_inv: &DMatrix<f64>,
        k: usize,
    ) -> Result<(DVector<f64>, Evaluation, usize), FactorError> {
        let p = r.nrows();
        let lower = self.lower_bound;
        let project = |v: &DVector<f64>| v.map(|x| x.clamp(lower, 1.0));

        let start = DVector::from_fn(p, |i, _| (1.0 - 0.5 * k as f64 / p as f64) / r_inv[(i, i)]);
        let mut psi = project(&start);
        let mut current = evaluate(r, &psi, k)?;
        let mut step = 1.0;

        for iteration in 1..=self.max_iter {
            let pg = project(&(&psi - &current.gradient)) - &psi;
            if pg.amax() < self.pg_tolerance {
                return Ok((psi, current, iteration));
            }

            let direction = project(&(&psi - step * &current.gradient)) - &psi;
            let slope = current.gradient.dot(&direction);

            let mut lambda = 1.0;
            let (next_psi, next) = loop {
                let candidate = &psi + lambda * &direction;
                let eval = evaluate(r, &candidate, k)?;
                if eval.objective <= current.objective + 1e-4 * lambda * slope {
                    break (candidate, eval);
                }
                lambda *= 0.5;
                if lambda < 1e-16 {
                    // no further descent is representable
                    return Ok((psi, current, iteration));
                }
            };

            let s = &next_psi - &psi;
            let y = &next.gradient - &current.gradient;
            let sy = s.dot(&y);
            step = if sy > 0.0 {
                (s.norm_squared() / sy).clamp(1e-10, 1e10)
            } else {
                1e10
            };

            let reduction = current.objective - next.objective;
            let scale = current.objective.abs().max(next.objective.abs()).max(1.0);
            psi = next_psi;
            current = next;
            if reduction <= self.f_tolerance * scale {
                return Ok((psi, current, iteration));
            }
        }

        let pg = project(&(&psi - &current.gradient)) - &psi;
        Err(FactorError::NoConvergence {
            iterations: self.max_iter,
            gradient: pg.amax(),
        })
    }

    fn compute_scores(
        &self,
        x: ArrayView2<f64>,
        r_inv: &DMatrix<f64>,
        psi: &DVector<f64>,
        loadings: &DMatrix<f64>,
        method: ScoreMethod,
    ) -> Result<Array2<f64>, FactorError> {
        let mut z = x.to_owned();
        z.standardize()
            .map_err(|e| FactorError::InvalidInput(e.to_string()))?;
        let z = to_dmatrix(z.view());

        let weights = match method {
            ScoreMethod::Regression => r_inv * loadings,
            ScoreMethod::Bartlett => {
                let scaled = DMatrix::from_fn(loadings.nrows(), loadings.ncols(), |i, j| {
                    loadings[(i, j)] / psi[i]
                });
                let gram = loadings.transpose() * &scaled;
                let gram_inv = gram.try_inverse().ok_or_else(|| {
                    FactorError::Singular("Bartlett score system is singular".to_string())
                })?;
                scaled * gram_inv
            }
            ScoreMethod::None => return Ok(Array2::zeros((x.nrows(), 0))),
        };
        Ok(from_dmatrix(&(z * weights)))
    }
}

/// Objective, gradient and unrotated loadings at `psi`.
fn evaluate(r: &DMatrix<f64>, psi: &DVector<f64>, k: usize) -> Result<Evaluation, FactorError> {
    let p = r.nrows();
    let sc = psi.map(|v| 1.0 / v.sqrt());
    let scaled = DMatrix::from_fn(p, p, |i, j| r[(i, j)] * sc[i] * sc[j]);
    let eigen = SymmetricEigen::new(scaled);

    let mut order: Vec<usize> = (0..p).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));

    let mut objective = 0.0;
    for &j in &order[k..] {
        let e = eigen.eigenvalues[j];
        if !(e > 0.0) {
            return Err(FactorError::Singular(format!(
                "scaled correlation matrix has eigenvalue {:.3e}",
                e
            )));
        }
        objective += e - e.ln();
    }
    objective -= (p - k) as f64;

    let loadings = DMatrix::from_fn(p, k, |i, c| {
        let j = order[c];
        psi[i].sqrt() * eigen.eigenvectors[(i, j)] * (eigen.eigenvalues[j] - 1.0).max(0.0).sqrt()
    });

    let implied = &loadings * loadings.transpose();
    let gradient = DVector::from_fn(p, |i, _| (implied[(i, i)] + psi[i] - r[(i, i)]) / psi[i].powi(2));

    Ok(Evaluation {
        objective,
        gradient,
        loadings,
    })
}
