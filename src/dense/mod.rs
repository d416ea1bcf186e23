use anyhow::bail;
use nalgebra::DMatrix;
use ndarray::{Array2, ArrayView2, Axis};
use num_traits::Float;

use crate::utils::{mean_and_sd, Standardize};

impl<T: Float> Standardize<T> for Array2<T> {
    fn standardize(&mut self) -> anyhow::Result<(Vec<T>, Vec<T>)> {
        if self.nrows() < 2 {
            bail!(
                "At least two rows are required to standardize, got {}",
                self.nrows()
            );
        }

        let mut means = Vec::with_capacity(self.ncols());
        let mut sds = Vec::with_capacity(self.ncols());
        for (j, mut col) in self.axis_iter_mut(Axis(1)).enumerate() {
            let values: Vec<T> = col.iter().copied().collect();
            let (m, s) = mean_and_sd(&values);
            if !(s > T::epsilon()) {
                bail!("Column {} has zero variance and cannot be standardized", j);
            }
            col.mapv_inplace(|v| (v - m) / s);
            means.push(m);
            sds.push(s);
        }
        Ok((means, sds))
    }
}

/// Sample correlation matrix of the columns of `x` (observations in rows).
pub fn correlation_matrix(x: ArrayView2<f64>) -> anyhow::Result<Array2<f64>> {
    let n = x.nrows();
    let mut z = x.to_owned();
    z.standardize()?;
    let mut r = z.t().dot(&z) / (n as f64 - 1.0);
    // Pin the diagonal, the product only reaches it up to rounding.
    for i in 0..r.nrows() {
        r[[i, i]] = 1.0;
    }
    Ok(r)
}

pub fn to_dmatrix(x: ArrayView2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(x.nrows(), x.ncols(), |i, j| x[[i, j]])
}

pub fn from_dmatrix(m: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}
